//! Persistent log of WARN and ERROR events, tagged with the session key and
//! connection id of the socket that raised them.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS warnings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recorded_at TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        session_key TEXT,
        connection_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_warnings_session ON warnings(session_key, id);
";

/// One persisted event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningEntry {
    pub id: i64,
    pub recorded_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    pub session_key: Option<String>,
    pub connection_id: Option<String>,
}

impl fmt::Display for WarningEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:<5} {}", self.recorded_at, self.level, self.target)?;
        if let Some(key) = &self.session_key {
            write!(f, " session={key}")?;
        }
        if let Some(conn) = &self.connection_id {
            write!(f, " conn={conn}")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(fields) = &self.fields {
            write!(f, " {fields}")?;
        }
        Ok(())
    }
}

/// Narrows [`WarningLog::recent`]. Unset fields match everything.
#[derive(Clone, Debug)]
pub struct WarningFilter {
    pub session_key: Option<String>,
    /// `WARN` or `ERROR`, case-insensitive.
    pub level: Option<String>,
    pub limit: u32,
}

impl Default for WarningFilter {
    fn default() -> Self {
        Self {
            session_key: None,
            level: None,
            limit: 50,
        }
    }
}

/// SQLite table of WARN+ events.
pub struct WarningLog {
    conn: Mutex<Connection>,
}

impl WarningLog {
    /// Open (or create) the log at `path`.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn record(&self, entry: &NewEntry) -> Result<(), rusqlite::Error> {
        let _ = self.conn.lock().execute(
            "INSERT INTO warnings
                 (recorded_at, level, target, message, fields, session_key, connection_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.recorded_at,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.session_key,
                entry.connection_id,
            ],
        )?;
        Ok(())
    }

    /// Most recent entries first.
    pub fn recent(&self, filter: &WarningFilter) -> Result<Vec<WarningEntry>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, recorded_at, level, target, message, fields, session_key, connection_id
             FROM warnings
             WHERE (?1 IS NULL OR session_key = ?1)
               AND (?2 IS NULL OR level = upper(?2))
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![filter.session_key, filter.level, filter.limit],
            |row| {
                Ok(WarningEntry {
                    id: row.get(0)?,
                    recorded_at: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: row.get(5)?,
                    session_key: row.get(6)?,
                    connection_id: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }

    /// Id of the newest entry, if any.
    pub fn last_id(&self) -> Result<Option<i64>, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT max(id) FROM warnings", [], |row| row.get(0))
    }
}

struct NewEntry {
    recorded_at: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    session_key: Option<String>,
    connection_id: Option<String>,
}

/// Collects an event's message, its relay ids and everything else.
#[derive(Default)]
struct EventFields {
    message: Option<String>,
    session_key: Option<String>,
    connection_id: Option<String>,
    rest: serde_json::Map<String, serde_json::Value>,
}

impl EventFields {
    fn put(&mut self, name: &str, value: serde_json::Value) {
        let slot = match name {
            "message" => &mut self.message,
            "session_key" => &mut self.session_key,
            "connection_id" => &mut self.connection_id,
            _ => {
                let _ = self.rest.insert(name.to_string(), value);
                return;
            }
        };
        *slot = Some(match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field.name(), format!("{value:?}").into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), value.into());
    }
}

/// Relay ids carried by a span, stored in its extensions.
struct SpanIds {
    session_key: Option<String>,
    connection_id: Option<String>,
}

/// `tracing` layer that writes WARN+ events into a [`WarningLog`].
pub struct WarningLayer {
    log: Arc<WarningLog>,
}

impl WarningLayer {
    pub fn new(log: Arc<WarningLog>) -> Self {
        Self { log }
    }
}

impl<S> Layer<S> for WarningLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if fields.session_key.is_none() && fields.connection_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanIds {
                session_key: fields.session_key,
                connection_id: fields.connection_id,
            });
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        // Innermost span wins; fields on the event itself win over spans.
        for span in ctx.event_scope(event).into_iter().flatten() {
            if fields.session_key.is_some() && fields.connection_id.is_some() {
                break;
            }
            let extensions = span.extensions();
            if let Some(ids) = extensions.get::<SpanIds>() {
                if fields.session_key.is_none() {
                    fields.session_key.clone_from(&ids.session_key);
                }
                if fields.connection_id.is_none() {
                    fields.connection_id.clone_from(&ids.connection_id);
                }
            }
        }

        let rest = if fields.rest.is_empty() {
            None
        } else {
            serde_json::to_string(&fields.rest).ok()
        };

        if let Err(e) = self.log.record(&NewEntry {
            recorded_at: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: fields.message.unwrap_or_default(),
            fields: rest,
            session_key: fields.session_key,
            connection_id: fields.connection_id,
        }) {
            eprintln!("lectern-telemetry: failed to persist warning: {e}");
        }
    }
}
