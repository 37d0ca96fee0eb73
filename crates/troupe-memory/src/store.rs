use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::MessageStore;
use troupe_core::types::{Message, MessageFilter};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        cause_by TEXT NOT NULL,
        sent_from TEXT NOT NULL,
        body TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_cause ON messages(cause_by, seq);
    CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sent_from, seq);";

/// SQLite-backed message store. Rows are ordered by an autoincrement
/// sequence, so reads always reflect insertion order.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TroupeError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| TroupeError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| TroupeError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TroupeError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite message store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| TroupeError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TroupeError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, message: &Message) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| TroupeError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO messages (id, cause_by, sent_from, body, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id().0,
                message.cause_by().as_str(),
                message.sent_from(),
                body,
                message.timestamp().to_rfc3339(),
            ],
        )
        .map_err(|e| TroupeError::Database(e.to_string()))?;
        Ok(())
    }

    fn query(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<Message>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TroupeError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| TroupeError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, String>(0))
            .map_err(|e| TroupeError::Database(e.to_string()))?;

        let mut messages = Vec::new();
        for row in rows {
            let body = row.map_err(|e| TroupeError::Database(e.to_string()))?;
            messages.push(serde_json::from_str(&body)?);
        }
        Ok(messages)
    }

    fn count(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TroupeError::Database(e.to_string()))?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(|e| TroupeError::Database(e.to_string()))?;
        Ok(n as usize)
    }

    /// Narrow by the indexed columns in SQL; the rest of the filter
    /// (recipients, substring, limit) is applied on the decoded rows.
    fn filtered(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut sql = String::from("SELECT body FROM messages WHERE 1=1");
        let mut args = Vec::new();
        if let Some(ref tag) = filter.cause_by {
            sql.push_str(" AND cause_by = ?");
            args.push(SqlValue::Text(tag.0.clone()));
        }
        if let Some(ref sender) = filter.sent_from {
            sql.push_str(" AND sent_from = ?");
            args.push(SqlValue::Text(sender.clone()));
        }
        sql.push_str(" ORDER BY seq ASC");

        let candidates = self.query(&sql, args)?;
        Ok(filter.apply(&candidates))
    }
}

impl MessageStore for SqliteStore {
    fn add(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.insert(&message) })
    }

    fn get(&self) -> BoxFuture<'_, Result<Vec<Message>>> {
        Box::pin(async move {
            self.query("SELECT body FROM messages ORDER BY seq ASC", Vec::new())
        })
    }

    fn search(&self, filter: &MessageFilter) -> BoxFuture<'_, Result<Vec<Message>>> {
        let filter = filter.clone();
        Box::pin(async move { self.filtered(&filter) })
    }

    fn len(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { self.count() })
    }

    fn since(&self, offset: usize) -> BoxFuture<'_, Result<Vec<Message>>> {
        Box::pin(async move {
            self.query(
                "SELECT body FROM messages ORDER BY seq ASC LIMIT -1 OFFSET ?1",
                vec![SqlValue::Integer(offset as i64)],
            )
        })
    }
}
