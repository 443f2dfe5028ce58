use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use lectern_core::settings::{self, IgnoredOverride, LecternSettings, LoadedSettings};
use lectern_core::SessionKey;
use lectern_store::{BibleRepo, Database, HymnRepo};
use lectern_telemetry::{TelemetryConfig, WarningFilter, WarningLog};

/// Presentation relay for scripture and hymn overlays.
#[derive(Debug, Parser)]
#[command(name = "lectern", version)]
struct Cli {
    /// Settings file (defaults to ~/.lectern/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay server (default).
    Serve(ServeArgs),
    /// Replace the hymn table with a JSON export.
    SeedHymns {
        path: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Import Bible translations from a JSON export or a directory of them.
    SeedBibles {
        path: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print a fresh session key.
    GenerateKey,
    /// Show persisted warnings, newest last.
    Logs(LogsArgs),
}

#[derive(Debug, Args)]
struct LogsArgs {
    #[arg(long)]
    session_key: Option<String>,
    /// `warn` or `error`.
    #[arg(long)]
    level: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: u32,
}

impl LogsArgs {
    fn filter(self) -> WarningFilter {
        WarningFilter {
            session_key: self.session_key,
            level: self.level,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Default, Args)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    db: Option<PathBuf>,
}

impl ServeArgs {
    fn apply(self, settings: &mut LecternSettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db) = self.db {
            settings.database.path = db;
        }
    }
}

fn telemetry_config(settings: &LecternSettings) -> TelemetryConfig {
    let log_level = tracing::Level::from_str(&settings.logging.level).unwrap_or_else(|_| {
        eprintln!(
            "lectern: unknown log level {:?}, using info",
            settings.logging.level
        );
        tracing::Level::INFO
    });
    TelemetryConfig {
        log_level,
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path: settings.logging.log_db_path.clone(),
        ..Default::default()
    }
}

/// Start logging, then report env overrides that could not be applied.
fn start_telemetry(settings: &LecternSettings, ignored_env: &[IgnoredOverride]) {
    lectern_telemetry::init_telemetry(telemetry_config(settings));
    for ignored in ignored_env {
        tracing::warn!(
            name = ignored.name,
            value = %ignored.value,
            "ignoring invalid environment override"
        );
    }
}

fn open_db(settings: &LecternSettings) -> anyhow::Result<Database> {
    Database::open(&settings.database.path)
        .with_context(|| format!("opening {}", settings.database.path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings_file = cli.config.unwrap_or_else(settings::settings_path);
    let LoadedSettings {
        mut settings,
        ignored_env,
    } = settings::load_settings_from_path(&settings_file)
        .with_context(|| format!("loading settings from {}", settings_file.display()))?;

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::GenerateKey => {
            println!("{}", SessionKey::generate());
            Ok(())
        }
        Command::SeedHymns { path, db } => {
            if let Some(db) = db {
                settings.database.path = db;
            }
            start_telemetry(&settings, &ignored_env);
            let count = HymnRepo::new(open_db(&settings)?)
                .import_json(&path)
                .with_context(|| format!("importing {}", path.display()))?;
            println!("imported {count} hymns");
            Ok(())
        }
        Command::SeedBibles { path, db } => {
            if let Some(db) = db {
                settings.database.path = db;
            }
            start_telemetry(&settings, &ignored_env);
            let bibles = BibleRepo::new(open_db(&settings)?)
                .import_path(&path)
                .with_context(|| format!("importing {}", path.display()))?;
            for bible in &bibles {
                println!("{}\t{}", bible.shortname, bible.name);
            }
            println!("imported {} bibles", bibles.len());
            Ok(())
        }
        Command::Logs(args) => {
            start_telemetry(&settings, &ignored_env);
            print_warnings(&settings.logging.log_db_path, &args.filter())
        }
        Command::Serve(args) => {
            args.apply(&mut settings);
            start_telemetry(&settings, &ignored_env);
            tracing::info!(settings_file = %settings_file.display(), "starting lectern relay");
            serve(settings).await
        }
    }
}

fn print_warnings(path: &std::path::Path, filter: &WarningFilter) -> anyhow::Result<()> {
    if !path.exists() {
        println!("no warning log at {}", path.display());
        return Ok(());
    }
    let log = WarningLog::open(path).with_context(|| format!("opening {}", path.display()))?;
    let entries = log.recent(filter).context("reading warnings")?;
    for entry in entries.iter().rev() {
        println!("{entry}");
    }
    Ok(())
}

async fn serve(settings: LecternSettings) -> anyhow::Result<()> {
    let db = open_db(&settings)?;

    let config = lectern_server::ServerConfig {
        host: settings.server.host,
        port: settings.server.port,
        max_send_queue: settings.server.max_send_queue,
    };
    let handle = lectern_server::start(config, db)
        .await
        .context("starting server")?;

    tracing::info!(port = handle.port, "lectern relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    handle.shutdown().await;
    Ok(())
}
