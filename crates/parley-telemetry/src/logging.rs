//! Persisted warn+ logs, tagged with the ids that tie a line to a user,
//! a push connection, or a message.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const DEFAULT_LIMIT: u32 = 100;

/// Correlation ids carried by an event or inherited from its spans.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Correlation {
    pub user_id: Option<String>,
    pub connection_id: Option<String>,
    pub message_id: Option<String>,
}

impl Correlation {
    /// Store `value` if `name` is a correlation field. Returns whether it was.
    fn set(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "user_id" => &mut self.user_id,
            "connection_id" => &mut self.connection_id,
            "message_id" => &mut self.message_id,
            _ => return false,
        };
        *slot = Some(value);
        true
    }

    /// Fill ids still missing here from an enclosing scope.
    fn inherit(&mut self, outer: &Correlation) {
        if self.user_id.is_none() {
            self.user_id.clone_from(&outer.user_id);
        }
        if self.connection_id.is_none() {
            self.connection_id.clone_from(&outer.connection_id);
        }
        if self.message_id.is_none() {
            self.message_id.clone_from(&outer.message_id);
        }
    }

    fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.connection_id.is_none() && self.message_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.user_id.is_some() && self.connection_id.is_some() && self.message_id.is_some()
    }
}

/// One persisted log line.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub recorded_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    #[serde(flatten)]
    pub ids: Correlation,
}

/// Filters for [`SqliteLogSink::query`]. Results are newest first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Only records at this severity or worse.
    pub min_level: Option<Level>,
    /// Module path prefix, e.g. `parley_server::hub`.
    pub target: Option<String>,
    pub user_id: Option<String>,
    pub connection_id: Option<String>,
    pub message_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

fn severity(level: &Level) -> i64 {
    match *level {
        Level::TRACE => 1,
        Level::DEBUG => 2,
        Level::INFO => 3,
        Level::WARN => 4,
        Level::ERROR => 5,
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite table of warn+ log lines.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 recorded_at TEXT NOT NULL,
                 severity INTEGER NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 user_id TEXT,
                 connection_id TEXT,
                 message_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_recorded_at ON logs(recorded_at);
             CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user_id);
             CREATE INDEX IF NOT EXISTS idx_logs_connection ON logs(connection_id);
             CREATE INDEX IF NOT EXISTS idx_logs_message ON logs(message_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, line: &LogLine) -> Result<(), rusqlite::Error> {
        self.conn.lock().execute(
            "INSERT INTO logs
                 (recorded_at, severity, level, target, message, fields, user_id, connection_id, message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                timestamp(&line.recorded_at),
                severity(&line.level),
                line.level.as_str(),
                line.target,
                line.message,
                line.fields,
                line.ids.user_id,
                line.ids.connection_id,
                line.ids.message_id,
            ],
        )?;
        Ok(())
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut clauses = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        let mut filter = |clause: &str, value: SqlValue| {
            args.push(value);
            clauses.push(clause.replace('?', &format!("?{}", args.len())));
        };

        if let Some(level) = &q.min_level {
            filter("severity >= ?", SqlValue::Integer(severity(level)));
        }
        if let Some(target) = &q.target {
            filter("target LIKE ?", SqlValue::Text(format!("{target}%")));
        }
        if let Some(user_id) = &q.user_id {
            filter("user_id = ?", SqlValue::Text(user_id.clone()));
        }
        if let Some(connection_id) = &q.connection_id {
            filter("connection_id = ?", SqlValue::Text(connection_id.clone()));
        }
        if let Some(message_id) = &q.message_id {
            filter("message_id = ?", SqlValue::Text(message_id.clone()));
        }
        if let Some(since) = &q.since {
            filter("recorded_at >= ?", SqlValue::Text(timestamp(since)));
        }

        let mut sql = String::from(
            "SELECT id, recorded_at, level, target, message, fields, user_id, connection_id, message_id
             FROM logs",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(DEFAULT_LIMIT)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                recorded_at: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                ids: Correlation {
                    user_id: row.get(6)?,
                    connection_id: row.get(7)?,
                    message_id: row.get(8)?,
                },
            })
        })?;
        rows.collect()
    }
}

/// A line on its way into the sink.
struct LogLine {
    recorded_at: DateTime<Utc>,
    level: Level,
    target: String,
    message: String,
    fields: Option<String>,
    ids: Correlation,
}

/// Splits recorded fields into the message, correlation ids, and the rest.
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    ids: Correlation,
    extra: Map<String, Value>,
}

impl FieldCollector {
    fn record_text(&mut self, field: &Field, text: String) {
        match field.name() {
            "message" => self.message = Some(text),
            name => {
                if !self.ids.set(name, text.clone()) {
                    self.extra.insert(name.to_string(), Value::String(text));
                }
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // `%id` fields arrive here already formatted; `?id` ones are quoted.
        let text = format!("{value:?}");
        let text = text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(text);
        self.record_text(field, text);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.extra.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.extra.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.extra.insert(field.name().to_string(), value.into());
    }
}

/// Layer that writes warn+ events to a [`SqliteLogSink`].
///
/// Ids missing on an event are taken from the nearest enclosing span that
/// has them, including ids recorded on a span after it was created (a push
/// session learns its `user_id` only at bootstrap).
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = FieldCollector::default();
        attrs.record(&mut fields);
        if fields.ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.ids);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut fields = FieldCollector::default();
        values.record(&mut fields);
        if fields.ids.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<Correlation>() {
            Some(ids) => {
                let mut updated = fields.ids;
                updated.inherit(ids);
                *ids = updated;
            }
            None => {
                extensions.insert(fields.ids);
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if fields.ids.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    fields.ids.inherit(outer);
                }
            }
        }

        let line = LogLine {
            recorded_at: Utc::now(),
            level,
            target: event.metadata().target().to_string(),
            message: fields.message.unwrap_or_default(),
            fields: (!fields.extra.is_empty())
                .then(|| Value::Object(fields.extra).to_string()),
            ids: fields.ids,
        };
        // Logging from inside a layer would recurse; a failed write is dropped.
        let _ = self.sink.append(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn temp_sink() -> (tempfile::TempDir, Arc<SqliteLogSink>) {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteLogSink::new(&dir.path().join("logs.db")).unwrap();
        (dir, Arc::new(sink))
    }

    fn line(at: &str, level: Level, target: &str, message: &str, ids: Correlation) -> LogLine {
        LogLine {
            recorded_at: at.parse().unwrap(),
            level,
            target: target.into(),
            message: message.into(),
            fields: None,
            ids,
        }
    }

    fn user(id: &str) -> Correlation {
        Correlation {
            user_id: Some(id.into()),
            ..Default::default()
        }
    }

    fn messages(records: &[LogRecord]) -> Vec<&str> {
        records.iter().map(|r| r.message.as_str()).collect()
    }

    /// Run `f` with only the sqlite layer installed and return what it wrote.
    fn capture(f: impl FnOnce()) -> Vec<LogRecord> {
        let (_dir, sink) = temp_sink();
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        sink.query(&LogQuery::default()).unwrap()
    }

    #[test]
    fn min_level_includes_more_severe() {
        let (_dir, sink) = temp_sink();
        sink.append(&line("2026-04-01T12:00:00Z", Level::WARN, "t", "queue full", Correlation::default()))
            .unwrap();
        sink.append(&line("2026-04-01T12:00:01Z", Level::ERROR, "t", "store down", Correlation::default()))
            .unwrap();

        let errors = sink
            .query(&LogQuery {
                min_level: Some(Level::ERROR),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages(&errors), vec!["store down"]);

        let warn_up = sink
            .query(&LogQuery {
                min_level: Some(Level::WARN),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages(&warn_up), vec!["store down", "queue full"]);
    }

    #[test]
    fn filters_by_each_correlation_id() {
        let (_dir, sink) = temp_sink();
        let evicted = Correlation {
            user_id: Some("user_a".into()),
            connection_id: Some("conn_1".into()),
            message_id: None,
        };
        let relayed = Correlation {
            user_id: Some("user_b".into()),
            connection_id: Some("conn_2".into()),
            message_id: Some("msg_7".into()),
        };
        sink.append(&line("2026-04-01T12:00:00Z", Level::WARN, "parley_server::hub", "evicted", evicted))
            .unwrap();
        sink.append(&line("2026-04-01T12:00:01Z", Level::WARN, "parley_server::relay", "dropped", relayed))
            .unwrap();

        let by = |q: LogQuery| messages(&sink.query(&q).unwrap()).join(",");
        assert_eq!(
            by(LogQuery { user_id: Some("user_a".into()), ..Default::default() }),
            "evicted"
        );
        assert_eq!(
            by(LogQuery { connection_id: Some("conn_2".into()), ..Default::default() }),
            "dropped"
        );
        assert_eq!(
            by(LogQuery { message_id: Some("msg_7".into()), ..Default::default() }),
            "dropped"
        );
        assert_eq!(
            by(LogQuery { target: Some("parley_server::hub".into()), ..Default::default() }),
            "evicted"
        );
        // Target matches by module prefix, not substring.
        assert_eq!(by(LogQuery { target: Some("hub".into()), ..Default::default() }), "");
    }

    #[test]
    fn since_and_limit() {
        let (_dir, sink) = temp_sink();
        for i in 0..10 {
            let at = format!("2026-04-01T12:00:{i:02}Z");
            sink.append(&line(&at, Level::WARN, "t", &format!("msg {i}"), user("user_a")))
                .unwrap();
        }

        let newest = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages(&newest), vec!["msg 9", "msg 8", "msg 7"]);

        let recent = sink
            .query(&LogQuery {
                since: Some("2026-04-01T12:00:08Z".parse().unwrap()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(messages(&recent), vec!["msg 9", "msg 8"]);
    }

    #[test]
    fn layer_skips_below_warn_and_keeps_extra_fields() {
        let records = capture(|| {
            tracing::info!("not persisted");
            tracing::warn!(dropped = 3u64, "send queue full");
        });
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, "WARN");
        assert_eq!(record.message, "send queue full");
        assert_eq!(record.fields.as_deref(), Some(r#"{"dropped":3}"#));
        assert_eq!(record.ids, Correlation::default());
    }

    #[test]
    fn event_ids_win_over_span_ids() {
        let records = capture(|| {
            let session = tracing::info_span!("ws_session", connection_id = "conn_1", user_id = "user_a");
            let _entered = session.enter();
            let relay = tracing::info_span!("relay", message_id = "msg_1");
            let _relay = relay.enter();
            tracing::warn!(user_id = "user_b", "receiver offline");
        });
        assert_eq!(
            records[0].ids,
            Correlation {
                user_id: Some("user_b".into()),
                connection_id: Some("conn_1".into()),
                message_id: Some("msg_1".into()),
            }
        );
    }

    #[test]
    fn ids_recorded_on_a_span_later_are_inherited() {
        let records = capture(|| {
            let session = tracing::info_span!(
                "ws_session",
                connection_id = "conn_1",
                user_id = tracing::field::Empty
            );
            let _entered = session.enter();
            tracing::warn!("before bootstrap");
            session.record("user_id", "user_a");
            tracing::warn!("after bootstrap");
        });
        assert_eq!(messages(&records), vec!["after bootstrap", "before bootstrap"]);
        assert_eq!(records[0].ids.user_id.as_deref(), Some("user_a"));
        assert_eq!(records[0].ids.connection_id.as_deref(), Some("conn_1"));
        assert_eq!(records[1].ids.user_id, None);
    }

    #[test]
    fn display_formatted_ids_are_captured() {
        let conn = "conn_9".to_string();
        let records = capture(|| {
            tracing::warn!(connection_id = %conn, message_id = ?"msg_3", "slow consumer");
        });
        assert_eq!(records[0].ids.connection_id.as_deref(), Some("conn_9"));
        assert_eq!(records[0].ids.message_id.as_deref(), Some("msg_3"));
    }
}
