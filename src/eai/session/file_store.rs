//! File-backed session store.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/<project_id>/<session_id>.json   one document per session
//! <base>/<project_id>/current             current session id
//! <base>/history/<project_id>.json        prompt history array
//! ```
//!
//! Each session document holds the session row plus its messages, so one
//! file is one unit of atomicity. Writes go through a temp file and a
//! rename, serialised by an internal mutex.

use crate::eai::session::{
    project_id_for, MessageRole, Session, SessionStore, StoreError, StoredMessage,
    PROMPT_HISTORY_CAP,
};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
struct SessionDocument {
    session: Session,
    messages: Vec<StoredMessage>,
}

/// One-JSON-per-session backend.
pub struct FileStore {
    base: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.base.join(project_id)
    }

    fn session_path(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.project_dir(project_id).join(format!("{}.json", session_id))
    }

    fn history_path(&self, project_id: &str) -> PathBuf {
        self.base.join("history").join(format!("{}.json", project_id))
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_document(&self, path: &Path) -> Result<Option<SessionDocument>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Scan every session document in the store.
    async fn all_documents(&self) -> Result<Vec<SessionDocument>, StoreError> {
        let mut documents = Vec::new();
        let mut projects = match tokio::fs::read_dir(&self.base).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(documents),
            Err(err) => return Err(err.into()),
        };
        while let Some(project) = projects.next_entry().await? {
            if !project.file_type().await?.is_dir() {
                continue;
            }
            if project.file_name() == "history" {
                continue;
            }
            let mut sessions = tokio::fs::read_dir(project.path()).await?;
            while let Some(entry) = sessions.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match self.read_document(&path).await {
                    Ok(Some(doc)) => documents.push(doc),
                    Ok(None) => {}
                    Err(err) => debug!("skipping unreadable session file: {}", err),
                }
            }
        }
        Ok(documents)
    }

    async fn find_document(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError> {
        // Session files are named by id, so a direct probe per project
        // beats a full scan.
        let mut projects = match tokio::fs::read_dir(&self.base).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        while let Some(project) = projects.next_entry().await? {
            if !project.file_type().await?.is_dir() || project.file_name() == "history" {
                continue;
            }
            let candidate = project.path().join(format!("{}.json", session_id));
            if let Some(doc) = self.read_document(&candidate).await? {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn create_session(
        &self,
        workdir: &str,
        title: Option<String>,
    ) -> Result<Session, StoreError> {
        let _guard = self.write_lock.lock().await;
        let session = Session::new_root(workdir, title);
        let document = SessionDocument {
            session: session.clone(),
            messages: Vec::new(),
        };
        let path = self.session_path(&session.project_id, &session.id);
        self.write_json(&path, &document).await?;
        Ok(session)
    }

    async fn load_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.find_document(id).await?.map(|d| d.session))
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(&session.project_id, &session.id);
        let mut document = self
            .read_document(&path)
            .await?
            .unwrap_or(SessionDocument {
                session: session.clone(),
                messages: Vec::new(),
            });
        document.session = session.clone();
        self.write_json(&path, &document).await
    }

    async fn append_message(
        &self,
        session: &Session,
        role: MessageRole,
        content: &str,
        mode: Option<&str>,
    ) -> Result<StoredMessage, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(&session.project_id, &session.id);
        let mut document = self
            .read_document(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session.id)))?;
        let message = StoredMessage::new(&session.id, role, content, mode);
        document.messages.push(message.clone());
        document.session.updated_at = chrono::Utc::now();
        self.write_json(&path, &document).await?;
        Ok(message)
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let mut messages = self
            .find_document(session_id)
            .await?
            .map(|d| d.messages)
            .unwrap_or_default();
        messages.sort_by(|a, b| {
            a.created_at_ns
                .cmp(&b.created_at_ns)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(messages)
    }

    async fn load_chain_messages(&self, root_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let mut messages: Vec<StoredMessage> = self
            .all_documents()
            .await?
            .into_iter()
            .filter(|d| d.session.root_id == root_id)
            .flat_map(|d| d.messages)
            .collect();
        messages.sort_by(|a, b| {
            a.created_at_ns
                .cmp(&b.created_at_ns)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(messages)
    }

    async fn list_sessions(&self, workdir: &str) -> Result<Vec<Session>, StoreError> {
        let project_id = project_id_for(workdir);
        let documents = self.all_documents().await?;
        let parent_ids: Vec<String> = documents
            .iter()
            .filter_map(|d| d.session.parent_id.clone())
            .collect();
        let mut sessions: Vec<Session> = documents
            .into_iter()
            .map(|d| d.session)
            .filter(|s| s.project_id == project_id && !parent_ids.contains(&s.id))
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn create_child(&self, parent: &Session, summary: &str) -> Result<Session, StoreError> {
        let _guard = self.write_lock.lock().await;
        let child = parent.child_with_summary(summary);
        let document = SessionDocument {
            session: child.clone(),
            messages: Vec::new(),
        };
        let path = self.session_path(&child.project_id, &child.id);
        self.write_json(&path, &document).await?;
        Ok(child)
    }

    async fn delete_chain(&self, root_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        for document in self.all_documents().await? {
            if document.session.root_id == root_id {
                let path = self.session_path(&document.session.project_id, &document.session.id);
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn current_session_id(&self, workdir: &str) -> Result<Option<String>, StoreError> {
        let path = self.project_dir(&project_id_for(workdir)).join("current");
        match tokio::fs::read_to_string(&path).await {
            Ok(id) => {
                let id = id.trim().to_string();
                Ok(if id.is_empty() { None } else { Some(id) })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_current_session(&self, workdir: &str, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let dir = self.project_dir(&project_id_for(workdir));
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("current"), id.as_bytes()).await?;
        Ok(())
    }

    async fn prompt_history(&self, workdir: &str) -> Result<Vec<String>, StoreError> {
        let path = self.history_path(&project_id_for(workdir));
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn push_prompt_history(&self, workdir: &str, entry: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.history_path(&project_id_for(workdir));
        let mut history = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice::<Vec<String>>(&bytes)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        history.push(entry.to_string());
        if history.len() > PROMPT_HISTORY_CAP {
            let excess = history.len() - PROMPT_HISTORY_CAP;
            history.drain(..excess);
        }
        self.write_json(&path, &history).await
    }
}
