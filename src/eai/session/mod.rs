//! Persistent conversational sessions.
//!
//! A session records one conversation within a project (a working
//! directory). Compaction never rewrites history: it creates a *child*
//! session carrying a summary, linked to its parent through a stable
//! `root_id` and a strictly increasing `child_index`. Loading "for
//! display" gathers messages across the whole chain by root id; appending
//! always writes to the current session row only. Deleting a chain
//! removes every session sharing the root id plus all their messages,
//! atomically.
//!
//! Two interchangeable backends implement the [`SessionStore`] contract:
//! [`file_store::FileStore`] (one JSON document per session, a directory
//! per project, a `current` pointer file, `history/<project>.json`) and
//! [`sqlite_store::SqliteStore`] (tables `sessions`, `current_sessions`,
//! `messages` indexed by `(root_id, created_at_ns)`).

pub mod file_store;
pub mod sqlite_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt;

/// Stable project identifier: a short hash of the absolute working
/// directory.
pub fn project_id_for(workdir: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workdir.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// One conversational session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Stable hash of the absolute working directory.
    pub project_id: String,
    pub workdir: String,
    pub title: Option<String>,
    /// Summary carried into this session by compaction.
    pub context_summary: Option<String>,
    /// Identifies the compaction chain; equals `id` for a root session.
    pub root_id: String,
    pub parent_id: Option<String>,
    /// 0 for a root session, parent's index + 1 for each compaction child.
    pub child_index: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Build a fresh root session for a working directory.
    pub fn new_root(workdir: &str, title: Option<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            id: id.clone(),
            project_id: project_id_for(workdir),
            workdir: workdir.to_string(),
            title,
            context_summary: None,
            root_id: id,
            parent_id: None,
            child_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the compaction child of this session.
    pub fn child_with_summary(&self, summary: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: self.project_id.clone(),
            workdir: self.workdir.clone(),
            title: self.title.clone(),
            context_summary: Some(summary.to_string()),
            root_id: self.root_id.clone(),
            parent_id: Some(self.id.clone()),
            child_index: self.child_index + 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Roles a stored message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Error,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            "error" => Some(MessageRole::Error),
            _ => None,
        }
    }
}

/// One persisted message, ordered by `(created_at_ns, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Optional mode tag (tool, plan, orchestrate, chat).
    pub mode: Option<String>,
    /// Creation time in nanoseconds since the Unix epoch.
    pub created_at_ns: i64,
}

impl StoredMessage {
    pub fn new(session_id: &str, role: MessageRole, content: &str, mode: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            mode: mode.map(|m| m.to_string()),
            created_at_ns: Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_else(|| Utc::now().timestamp_millis() * 1_000_000),
        }
    }
}

/// Store-level failures.
#[derive(Debug)]
pub enum StoreError {
    Io(String),
    Corrupt(String),
    NotFound(String),
    Sql(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(msg) => write!(f, "io error: {}", msg),
            StoreError::Corrupt(msg) => write!(f, "corrupt store: {}", msg),
            StoreError::NotFound(msg) => write!(f, "not found: {}", msg),
            StoreError::Sql(msg) => write!(f, "sql error: {}", msg),
        }
    }
}

impl Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Maximum prompt-history entries retained per project.
pub const PROMPT_HISTORY_CAP: usize = 200;

/// Contract between the engine and a session backend.
///
/// Implementations serialise writes internally (a mutex or a SQL
/// transaction); callers interleave reads and writes freely.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create and persist a fresh root session.
    async fn create_session(
        &self,
        workdir: &str,
        title: Option<String>,
    ) -> Result<Session, StoreError>;

    /// Load one session by id, if present.
    async fn load_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Persist an updated session row.
    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Append a message to the given session (the current row only, never
    /// the chain).
    async fn append_message(
        &self,
        session: &Session,
        role: MessageRole,
        content: &str,
        mode: Option<&str>,
    ) -> Result<StoredMessage, StoreError>;

    /// Messages of one session row, ordered.
    async fn load_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, StoreError>;

    /// Messages of the whole chain (for display), ordered.
    async fn load_chain_messages(&self, root_id: &str) -> Result<Vec<StoredMessage>, StoreError>;

    /// Sessions of a project, most recently updated first, excluding any
    /// session that is a parent within a chain.
    async fn list_sessions(&self, workdir: &str) -> Result<Vec<Session>, StoreError>;

    /// Create and persist the compaction child of `parent`.
    async fn create_child(&self, parent: &Session, summary: &str) -> Result<Session, StoreError>;

    /// Delete every session sharing `root_id` plus all their messages.
    async fn delete_chain(&self, root_id: &str) -> Result<(), StoreError>;

    /// The project's current session id, if any.
    async fn current_session_id(&self, workdir: &str) -> Result<Option<String>, StoreError>;

    /// Point the project's `current` marker at a session.
    async fn set_current_session(&self, workdir: &str, id: &str) -> Result<(), StoreError>;

    /// The project's prompt history, oldest first.
    async fn prompt_history(&self, workdir: &str) -> Result<Vec<String>, StoreError>;

    /// Append one prompt-history entry, trimming to [`PROMPT_HISTORY_CAP`].
    async fn push_prompt_history(&self, workdir: &str, entry: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_stable_and_short() {
        let a = project_id_for("/home/user/project");
        let b = project_id_for("/home/user/project");
        let c = project_id_for("/home/user/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn child_links_the_chain() {
        let root = Session::new_root("/tmp/w", Some("t".to_string()));
        assert_eq!(root.root_id, root.id);
        assert_eq!(root.child_index, 0);

        let child = root.child_with_summary("summary");
        assert_eq!(child.root_id, root.root_id);
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(child.child_index, 1);
        assert_eq!(child.context_summary.as_deref(), Some("summary"));

        let grandchild = child.child_with_summary("later");
        assert_eq!(grandchild.root_id, root.id);
        assert_eq!(grandchild.child_index, 2);
    }

    #[test]
    fn message_roles_round_trip() {
        for role in &[
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::System,
            MessageRole::Error,
        ] {
            assert_eq!(MessageRole::parse(role.as_str()), Some(*role));
        }
        assert_eq!(MessageRole::parse("bogus"), None);
    }
}
