//! Layered configuration for the relay process.
//!
//! Settings are resolved in three layers (in priority order):
//! 1. **Compiled defaults**: [`LecternSettings::default()`]
//! 2. **User file**: `~/.lectern/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `LECTERN_*` overrides
//!
//! Command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LecternSettings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per connection before sends are dropped.
    pub max_send_queue: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Persist WARN+ events to a SQLite log database.
    pub persist_warnings: bool,
    pub log_db_path: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            max_send_queue: 256,
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: lectern_home().join("lectern.db"),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            persist_warnings: true,
            log_db_path: lectern_home().join("logs.db"),
        }
    }
}

/// `~/.lectern`, falling back to `/tmp/.lectern` when `HOME` is unset.
pub fn lectern_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".lectern")
}

pub fn settings_path() -> PathBuf {
    lectern_home().join("settings.json")
}

/// An environment override whose value could not be parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnoredOverride {
    pub name: &'static str,
    pub value: String,
}

/// Resolved settings plus any env overrides that were skipped. Settings load
/// before logging is up, so the caller reports the skipped ones afterwards.
#[derive(Clone, Debug)]
pub struct LoadedSettings {
    pub settings: LecternSettings,
    pub ignored_env: Vec<IgnoredOverride>,
}

/// Load settings from `path`, deep-merged over defaults, then apply env
/// overrides. A missing file is not an error.
pub fn load_settings_from_path(path: &Path) -> Result<LoadedSettings> {
    let mut merged = serde_json::to_value(LecternSettings::default())?;

    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let user: serde_json::Value = serde_json::from_str(&raw)?;
            merged = deep_merge(merged, user);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_owned(),
                source,
            })
        }
    }

    let mut settings: LecternSettings = serde_json::from_value(merged)?;
    let ignored_env = apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(LoadedSettings {
        settings,
        ignored_env,
    })
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: serde_json::Value, overlay: serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            serde_json::Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Apply `LECTERN_*` overrides. Values that do not parse are skipped and
/// returned.
pub fn apply_env_overrides(
    settings: &mut LecternSettings,
    env: impl Fn(&str) -> Option<String>,
) -> Vec<IgnoredOverride> {
    fn parsed<T: std::str::FromStr>(
        name: &'static str,
        value: String,
        ignored: &mut Vec<IgnoredOverride>,
    ) -> Option<T> {
        match value.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                ignored.push(IgnoredOverride { name, value });
                None
            }
        }
    }

    let mut ignored = Vec::new();
    if let Some(host) = env("LECTERN_HOST") {
        settings.server.host = host;
    }
    if let Some(port) = env("LECTERN_PORT").and_then(|v| parsed("LECTERN_PORT", v, &mut ignored)) {
        settings.server.port = port;
    }
    if let Some(queue) =
        env("LECTERN_MAX_SEND_QUEUE").and_then(|v| parsed("LECTERN_MAX_SEND_QUEUE", v, &mut ignored))
    {
        settings.server.max_send_queue = queue;
    }
    if let Some(path) = env("LECTERN_DB") {
        settings.database.path = PathBuf::from(path);
    }
    if let Some(level) = env("LECTERN_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Some(json) = env("LECTERN_LOG_JSON").and_then(|v| parsed("LECTERN_LOG_JSON", v, &mut ignored)) {
        settings.logging.json = json;
    }
    ignored
}
