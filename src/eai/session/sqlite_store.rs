//! SQLite-backed session store.
//!
//! A single embedded database with tables `sessions`, `current_sessions`,
//! and `messages` (indexed by `(root_id, created_at_ns)`), plus a
//! `prompt_history` table. The connection sits behind `Arc<Mutex<_>>` and
//! every operation dispatches onto the blocking pool via
//! `tokio::task::spawn_blocking`, so callers never stall the async
//! runtime on file I/O. Chain deletion runs in one transaction.

use crate::eai::session::{
    project_id_for, MessageRole, Session, SessionStore, StoreError, StoredMessage,
    PROMPT_HISTORY_CAP,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL,
    workdir         TEXT NOT NULL,
    title           TEXT,
    context_summary TEXT,
    root_id         TEXT NOT NULL,
    parent_id       TEXT,
    child_index     INTEGER NOT NULL,
    created_at_ns   INTEGER NOT NULL,
    updated_at_ns   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id, updated_at_ns);
CREATE INDEX IF NOT EXISTS idx_sessions_root ON sessions(root_id);

CREATE TABLE IF NOT EXISTS current_sessions (
    project_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id            TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL,
    root_id       TEXT NOT NULL,
    role          TEXT NOT NULL,
    content       TEXT NOT NULL,
    mode          TEXT,
    created_at_ns INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_root ON messages(root_id, created_at_ns);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at_ns);

CREATE TABLE IF NOT EXISTS prompt_history (
    project_id TEXT NOT NULL,
    position   INTEGER NOT NULL,
    entry      TEXT NOT NULL,
    PRIMARY KEY (project_id, position)
);
";

fn ns_to_datetime(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}

fn datetime_to_ns(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_nanos_opt()
        .unwrap_or_else(|| dt.timestamp_millis() * 1_000_000)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        project_id: row.get(1)?,
        workdir: row.get(2)?,
        title: row.get(3)?,
        context_summary: row.get(4)?,
        root_id: row.get(5)?,
        parent_id: row.get(6)?,
        child_index: row.get::<_, i64>(7)? as u32,
        created_at: ns_to_datetime(row.get(8)?),
        updated_at: ns_to_datetime(row.get(9)?),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(2)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::parse(&role).unwrap_or(MessageRole::System),
        content: row.get(3)?,
        mode: row.get(4)?,
        created_at_ns: row.get(5)?,
    })
}

const SESSION_COLUMNS: &str =
    "id, project_id, workdir, title, context_summary, root_id, parent_id, child_index, created_at_ns, updated_at_ns";
const MESSAGE_COLUMNS: &str = "id, session_id, role, content, mode, created_at_ns";

/// Embedded-database backend.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(|e| StoreError::Sql(e.to_string()))?;
        Self::init(conn)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Sql(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // WAL mode: concurrent readers, non-blocking writes.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Sql(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| StoreError::Sql(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Sql(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Sql("connection poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Sql(format!("join error: {}", e)))?
    }

    fn insert_session(conn: &Connection, session: &Session) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO sessions \
             (id, project_id, workdir, title, context_summary, root_id, parent_id, child_index, created_at_ns, updated_at_ns) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id,
                session.project_id,
                session.workdir,
                session.title,
                session.context_summary,
                session.root_id,
                session.parent_id,
                session.child_index as i64,
                datetime_to_ns(&session.created_at),
                datetime_to_ns(&session.updated_at),
            ],
        )
        .map_err(|e| StoreError::Sql(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(
        &self,
        workdir: &str,
        title: Option<String>,
    ) -> Result<Session, StoreError> {
        let session = Session::new_root(workdir, title);
        let stored = session.clone();
        self.with_conn(move |conn| Self::insert_session(conn, &stored))
            .await?;
        Ok(session)
    }

    async fn load_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            let mut rows = stmt
                .query_map(params![id], row_to_session)
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            match rows.next() {
                Some(row) => row.map(Some).map_err(|e| StoreError::Sql(e.to_string())),
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let session = session.clone();
        self.with_conn(move |conn| Self::insert_session(conn, &session))
            .await
    }

    async fn append_message(
        &self,
        session: &Session,
        role: MessageRole,
        content: &str,
        mode: Option<&str>,
    ) -> Result<StoredMessage, StoreError> {
        let message = StoredMessage::new(&session.id, role, content, mode);
        let stored = message.clone();
        let root_id = session.root_id.clone();
        let session_id = session.id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, session_id, root_id, role, content, mode, created_at_ns) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    stored.id,
                    stored.session_id,
                    root_id,
                    stored.role.as_str(),
                    stored.content,
                    stored.mode,
                    stored.created_at_ns,
                ],
            )
            .map_err(|e| StoreError::Sql(e.to_string()))?;
            conn.execute(
                "UPDATE sessions SET updated_at_ns = ?1 WHERE id = ?2",
                params![stored.created_at_ns, session_id],
            )
            .map_err(|e| StoreError::Sql(e.to_string()))?;
            Ok(())
        })
        .await?;
        Ok(message)
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY created_at_ns, id",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            let rows = stmt
                .query_map(params![session_id], row_to_message)
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Sql(e.to_string()))
        })
        .await
    }

    async fn load_chain_messages(&self, root_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let root_id = root_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM messages WHERE root_id = ?1 ORDER BY created_at_ns, id",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            let rows = stmt
                .query_map(params![root_id], row_to_message)
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Sql(e.to_string()))
        })
        .await
    }

    async fn list_sessions(&self, workdir: &str) -> Result<Vec<Session>, StoreError> {
        let project_id = project_id_for(workdir);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM sessions WHERE project_id = ?1 \
                 AND id NOT IN (SELECT parent_id FROM sessions WHERE parent_id IS NOT NULL) \
                 ORDER BY updated_at_ns DESC",
                SESSION_COLUMNS
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            let rows = stmt
                .query_map(params![project_id], row_to_session)
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Sql(e.to_string()))
        })
        .await
    }

    async fn create_child(&self, parent: &Session, summary: &str) -> Result<Session, StoreError> {
        let child = parent.child_with_summary(summary);
        let stored = child.clone();
        self.with_conn(move |conn| Self::insert_session(conn, &stored))
            .await?;
        Ok(child)
    }

    async fn delete_chain(&self, root_id: &str) -> Result<(), StoreError> {
        let root_id = root_id.to_string();
        self.with_conn(move |conn| {
            conn.execute_batch("BEGIN")
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            let outcome = conn
                .execute("DELETE FROM messages WHERE root_id = ?1", params![root_id])
                .and_then(|_| {
                    conn.execute("DELETE FROM sessions WHERE root_id = ?1", params![root_id])
                });
            match outcome {
                Ok(_) => conn
                    .execute_batch("COMMIT")
                    .map_err(|e| StoreError::Sql(e.to_string())),
                Err(err) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(StoreError::Sql(err.to_string()))
                }
            }
        })
        .await
    }

    async fn current_session_id(&self, workdir: &str) -> Result<Option<String>, StoreError> {
        let project_id = project_id_for(workdir);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT session_id FROM current_sessions WHERE project_id = ?1")
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            let mut rows = stmt
                .query_map(params![project_id], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            match rows.next() {
                Some(row) => row.map(Some).map_err(|e| StoreError::Sql(e.to_string())),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set_current_session(&self, workdir: &str, id: &str) -> Result<(), StoreError> {
        let project_id = project_id_for(workdir);
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO current_sessions (project_id, session_id) VALUES (?1, ?2)",
                params![project_id, id],
            )
            .map_err(|e| StoreError::Sql(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn prompt_history(&self, workdir: &str) -> Result<Vec<String>, StoreError> {
        let project_id = project_id_for(workdir);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT entry FROM prompt_history WHERE project_id = ?1 ORDER BY position",
                )
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            let rows = stmt
                .query_map(params![project_id], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Sql(e.to_string()))
        })
        .await
    }

    async fn push_prompt_history(&self, workdir: &str, entry: &str) -> Result<(), StoreError> {
        let project_id = project_id_for(workdir);
        let entry = entry.to_string();
        self.with_conn(move |conn| {
            let next: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(position), -1) + 1 FROM prompt_history WHERE project_id = ?1",
                    params![project_id],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::Sql(e.to_string()))?;
            conn.execute(
                "INSERT INTO prompt_history (project_id, position, entry) VALUES (?1, ?2, ?3)",
                params![project_id, next, entry],
            )
            .map_err(|e| StoreError::Sql(e.to_string()))?;
            // Trim to the cap, oldest first.
            conn.execute(
                "DELETE FROM prompt_history WHERE project_id = ?1 AND position <= ?2 - ?3",
                params![project_id, next, PROMPT_HISTORY_CAP as i64],
            )
            .map_err(|e| StoreError::Sql(e.to_string()))?;
            Ok(())
        })
        .await
    }
}
