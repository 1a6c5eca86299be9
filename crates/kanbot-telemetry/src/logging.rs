use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A persisted warn+ log line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub task_id: Option<i64>,
    pub agent: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub task_id: Option<i64>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 task_id INTEGER,
                 agent TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_task ON logs(task_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        // A failed log write must never take the caller down with it.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, task_id, agent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.task_id,
                record.agent,
            ],
        );
    }

    /// Newest first, at most `limit` rows (default 100).
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, task_id, agent FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.clone()));
        }
        if let Some(target) = &q.target {
            sql.push_str(&format!(" AND target LIKE ?{}", params.len() + 1));
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(task_id) = q.task_id {
            sql.push_str(&format!(" AND task_id = ?{}", params.len() + 1));
            params.push(Box::new(task_id));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");
        sql.push_str(&format!(" LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                task_id: row.get(6)?,
                agent: row.get(7)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    task_id: Option<i64>,
    agent: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Pulls `message`, `task_id` and `agent` out of an event or span; the rest
/// goes into a JSON object.
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    task_id: Option<i64>,
    agent: Option<String>,
}

impl FieldVisitor {
    fn capture_text(&mut self, name: &str, val: String) {
        match name {
            "message" => self.message = Some(val),
            "agent" => self.agent = Some(val),
            "task_id" => match val.trim_start_matches('#').parse() {
                Ok(id) => self.task_id = Some(id),
                Err(_) => {
                    self.fields
                        .insert(name.to_string(), serde_json::Value::String(val));
                }
            },
            _ => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        let val = if field.name() == "message" {
            val
        } else {
            val.trim_matches('"').to_string()
        };
        self.capture_text(field.name(), val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.capture_text(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "task_id" {
            self.task_id = Some(value);
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match (field.name(), i64::try_from(value)) {
            ("task_id", Ok(id)) => self.task_id = Some(id),
            (name, _) => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::Number(value.into()));
            }
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.task_id.is_none() || visitor.agent.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.task_id.is_none() {
                            visitor.task_id = fields.task_id;
                        }
                        if visitor.agent.is_none() {
                            visitor.agent.clone_from(&fields.agent);
                        }
                    }
                }
            }
        }

        let fields_json = if visitor.fields.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&visitor.fields).unwrap_or_default())
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: fields_json,
            task_id: visitor.task_id,
            agent: visitor.agent,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.task_id.is_some() || visitor.agent.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    task_id: visitor.task_id,
                    agent: visitor.agent,
                });
            }
        }
    }
}

/// Stored on spans so child events inherit task_id / agent.
struct SpanFields {
    task_id: Option<i64>,
    agent: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn sink() -> (tempfile::TempDir, Arc<SqliteLogSink>) {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteLogSink::new(&dir.path().join("logs.db")).unwrap();
        (dir, Arc::new(sink))
    }

    fn insert(sink: &SqliteLogSink, ts: &str, level: &str, msg: &str, task_id: Option<i64>) {
        sink.insert(&LogInsert {
            timestamp: ts.into(),
            level: level.into(),
            target: "kanbot_engine::reconciler".into(),
            message: msg.into(),
            fields: None,
            task_id,
            agent: None,
        });
    }

    #[test]
    fn query_by_task_and_level() {
        let (_dir, sink) = sink();
        insert(&sink, "2026-03-01T10:00:00Z", "WARN", "phantom reset", Some(14));
        insert(&sink, "2026-03-01T10:00:01Z", "ERROR", "malformed", Some(14));
        insert(&sink, "2026-03-01T10:00:02Z", "WARN", "other", Some(7));

        let for_task = sink
            .query(&LogQuery {
                task_id: Some(14),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(for_task.len(), 2);
        assert_eq!(for_task[0].message, "malformed");

        let errors = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn query_since_and_limit() {
        let (_dir, sink) = sink();
        for i in 0..5 {
            insert(&sink, &format!("2026-03-01T10:00:0{i}Z"), "WARN", &format!("m{i}"), None);
        }
        let recent = sink
            .query(&LogQuery {
                since: Some("2026-03-01T10:00:02Z".into()),
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "m4");
    }

    #[test]
    fn layer_persists_warn_and_skips_info() {
        let (_dir, sink) = sink();
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(task_id = 3_i64, "spawned");
            tracing::warn!(task_id = 14_i64, agent = "ux-manager", before = "in_flight", "reset to backlog");
        });

        assert_eq!(sink.count().unwrap(), 1);
        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows[0].task_id, Some(14));
        assert_eq!(rows[0].agent.as_deref(), Some("ux-manager"));
        assert_eq!(rows[0].message, "reset to backlog");
        assert!(rows[0].fields.as_deref().unwrap().contains("in_flight"));
    }

    #[test]
    fn layer_inherits_task_from_span() {
        let (_dir, sink) = sink();
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("spawn", task_id = 9_i64);
            let _enter = span.enter();
            tracing::error!("gateway returned no session key");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_id, Some(9));
        assert_eq!(rows[0].level, "ERROR");
    }

    #[test]
    fn display_task_ids_are_parsed() {
        let mut visitor = FieldVisitor::default();
        visitor.capture_text("task_id", "#14".into());
        assert_eq!(visitor.task_id, Some(14));
        visitor.capture_text("task_id", "n/a".into());
        assert!(visitor.fields.contains_key("task_id"));
    }
}
