//! Record Store
//!
//! Document-style persistence over SQLite. Flows talk to the `RecordStore`
//! trait: single statements, atomic multi-statement transactions, and live
//! change feeds per table. Rows cross the boundary as JSON objects so the
//! callers never touch SQL row types.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::FlowError;

/// Conversation turns, one row per message
pub const MESSAGES_TABLE: &str = "messages";

/// Anomaly records written by the detector and resolved by feedback
pub const ANOMALIES_TABLE: &str = "anomalies";

/// Matches the leading verb and target table of a write statement
static WRITE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*(insert(?:\s+or\s+\w+)?\s+into|update(?:\s+or\s+\w+)?|delete\s+from)\s+[`"]?([a-zA-Z_][a-zA-Z0-9_]*)"#)
        .unwrap()
});

/// Kind of change carried by a live notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveAction {
    Create,
    Update,
    Delete,
}

/// One post-commit change event on a subscribed table
#[derive(Debug, Clone)]
pub struct LiveNotification {
    pub action: LiveAction,
    pub table: String,
    /// Full record for `Create`; change summary for `Update`/`Delete`
    pub record: JsonValue,
}

/// A parameterized SQL statement with JSON-typed bindings
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<JsonValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<JsonValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Persistence boundary used by sessions, feedback and alerts
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Run a single statement. Returns result rows as JSON objects
    /// (SELECT and `RETURNING` clauses produce rows, plain writes none).
    async fn query(&self, statement: Statement) -> Result<Vec<JsonValue>, FlowError>;

    /// Run several statements atomically. All succeed or none apply.
    /// Returns the result rows of each statement in order.
    async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<Vec<JsonValue>>, FlowError>;

    /// Live change feed for one table. Events are delivered only after the
    /// originating statement (or its whole transaction) has committed.
    fn subscribe(&self, table: &str) -> mpsc::UnboundedReceiver<LiveNotification>;
}

/// SQLite-backed record store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    subscribers: parking_lot::RwLock<Vec<(String, mpsc::UnboundedSender<LiveNotification>)>>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            subscribers: parking_lot::RwLock::new(Vec::new()),
        };
        store.init_schema()?;

        info!("Record store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            subscribers: parking_lot::RwLock::new(Vec::new()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation, created_at);

            CREATE TABLE IF NOT EXISTS anomalies (
                id TEXT PRIMARY KEY,
                camera TEXT,
                object_path TEXT NOT NULL,
                summary TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                feedback_status INTEGER,
                resolved_at INTEGER
            );
            "#,
        )?;

        Ok(())
    }

    /// Fan a batch of notifications out to live subscribers, dropping
    /// subscribers whose receiving side has gone away.
    fn notify(&self, notifications: Vec<LiveNotification>) {
        if notifications.is_empty() {
            return;
        }

        let mut subs = self.subscribers.write();
        for n in notifications {
            subs.retain(|(table, tx)| {
                if table != &n.table {
                    return true;
                }
                tx.send(n.clone()).is_ok()
            });
        }
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn query(&self, statement: Statement) -> Result<Vec<JsonValue>, FlowError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Persistence(format!("Lock error: {}", e)))?;

        let (rows, notification) = run_statement(&conn, &statement)?;
        drop(conn);

        if let Some(n) = notification {
            self.notify(vec![n]);
        }

        Ok(rows)
    }

    async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<Vec<JsonValue>>, FlowError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Persistence(format!("Lock error: {}", e)))?;

        conn.execute("BEGIN", [])?;

        let result = (|| -> Result<(Vec<Vec<JsonValue>>, Vec<LiveNotification>), FlowError> {
            let mut batches = Vec::with_capacity(statements.len());
            let mut pending = Vec::new();

            for statement in &statements {
                let (rows, notification) = run_statement(&conn, statement)?;
                batches.push(rows);
                if let Some(n) = notification {
                    pending.push(n);
                }
            }

            Ok((batches, pending))
        })();

        match result {
            Ok((batches, pending)) => {
                conn.execute("COMMIT", [])?;
                drop(conn);
                debug!("Committed transaction of {} statements", statements.len());
                self.notify(pending);
                Ok(batches)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    fn subscribe(&self, table: &str) -> mpsc::UnboundedReceiver<LiveNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push((table.to_string(), tx));
        debug!("New live subscriber on table {}", table);
        rx
    }
}

/// Execute one statement on an open connection. Returns its result rows and
/// the live notification it produced, if it was a write.
fn run_statement(
    conn: &Connection,
    statement: &Statement,
) -> Result<(Vec<JsonValue>, Option<LiveNotification>), FlowError> {
    let mut stmt = conn.prepare(&statement.sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let values: Vec<SqlValue> = statement.params.iter().map(bind_value).collect();

    let (rows, changes) = if stmt.column_count() > 0 {
        let mut out = Vec::new();
        let mut rows = stmt.query(rusqlite::params_from_iter(values))?;
        while let Some(row) = rows.next()? {
            out.push(row_to_json(row, &columns));
        }
        let n = out.len();
        (out, n)
    } else {
        let changed = stmt.execute(rusqlite::params_from_iter(values))?;
        (Vec::new(), changed)
    };

    let notification = match parse_write(&statement.sql) {
        Some((LiveAction::Create, table)) => {
            let record = match rows.first() {
                Some(first) => first.clone(),
                None => read_row_by_rowid(conn, &table, conn.last_insert_rowid())?,
            };
            Some(LiveNotification {
                action: LiveAction::Create,
                table,
                record,
            })
        }
        Some((action, table)) => Some(LiveNotification {
            action,
            record: serde_json::json!({ "table": table, "changes": changes }),
            table,
        }),
        None => None,
    };

    Ok((rows, notification))
}

/// Classify a statement as Create/Update/Delete on a table, if it is a write
fn parse_write(sql: &str) -> Option<(LiveAction, String)> {
    let caps = WRITE_PATTERN.captures(sql)?;
    let verb = caps.get(1)?.as_str().to_ascii_lowercase();
    let table = caps.get(2)?.as_str().to_string();

    let action = if verb.starts_with("insert") {
        LiveAction::Create
    } else if verb.starts_with("update") {
        LiveAction::Update
    } else {
        LiveAction::Delete
    };

    Some((action, table))
}

fn read_row_by_rowid(conn: &Connection, table: &str, rowid: i64) -> Result<JsonValue, FlowError> {
    // Table name comes from our own parsed SQL, never from user input
    let sql = format!("SELECT * FROM {} WHERE rowid = ?1", table);
    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt.query(rusqlite::params![rowid])?;
    match rows.next()? {
        Some(row) => Ok(row_to_json(row, &columns)),
        None => Ok(JsonValue::Null),
    }
}

fn bind_value(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(*b as i64),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn row_to_json(row: &rusqlite::Row<'_>, columns: &[String]) -> JsonValue {
    let mut map = serde_json::Map::new();
    for (i, name) in columns.iter().enumerate() {
        let value = match row.get_ref(i) {
            Ok(ValueRef::Integer(n)) => JsonValue::from(n),
            Ok(ValueRef::Real(f)) => JsonValue::from(f),
            Ok(ValueRef::Text(t)) => JsonValue::from(String::from_utf8_lossy(t).into_owned()),
            Ok(ValueRef::Blob(b)) => JsonValue::from(hex::encode(b)),
            Ok(ValueRef::Null) | Err(_) => JsonValue::Null,
        };
        map.insert(name.clone(), value);
    }
    JsonValue::Object(map)
}
