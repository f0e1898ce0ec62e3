//! Contract tests run against both session-store backends.

use eai::eai::session::file_store::FileStore;
use eai::eai::session::sqlite_store::SqliteStore;
use eai::eai::session::{MessageRole, SessionStore};
use std::sync::Arc;

async fn store_contract(store: Arc<dyn SessionStore>) {
    let workdir = "/workspaces/demo";

    // Create, load, and point the current marker.
    let root = store
        .create_session(workdir, Some("first task".to_string()))
        .await
        .unwrap();
    assert_eq!(root.child_index, 0);
    assert_eq!(root.root_id, root.id);
    store.set_current_session(workdir, &root.id).await.unwrap();
    assert_eq!(
        store.current_session_id(workdir).await.unwrap(),
        Some(root.id.clone())
    );
    let loaded = store.load_session(&root.id).await.unwrap().unwrap();
    assert_eq!(loaded.title.as_deref(), Some("first task"));

    // Messages append to the current row only, ordered by time.
    store
        .append_message(&root, MessageRole::User, "hello", Some("chat"))
        .await
        .unwrap();
    store
        .append_message(&root, MessageRole::Assistant, "hi there", Some("chat"))
        .await
        .unwrap();
    let messages = store.load_messages(&root.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert!(messages[0].created_at_ns <= messages[1].created_at_ns);

    // Compaction creates a child and never touches the parent.
    let child = store.create_child(&root, "summary text").await.unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(child.root_id, root.id);
    assert_eq!(child.child_index, root.child_index + 1);
    assert_eq!(child.context_summary.as_deref(), Some("summary text"));
    assert_eq!(store.load_messages(&root.id).await.unwrap().len(), 2);

    store
        .append_message(&child, MessageRole::User, "after compaction", None)
        .await
        .unwrap();

    // Display loading gathers the whole chain in order.
    let chain = store.load_chain_messages(&root.root_id).await.unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[2].content, "after compaction");

    // Listing excludes chain parents and orders most-recent-first.
    let other = store
        .create_session(workdir, Some("second task".to_string()))
        .await
        .unwrap();
    let listed = store.list_sessions(workdir).await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&child.id.as_str()));
    assert!(ids.contains(&other.id.as_str()));
    assert!(
        !ids.contains(&root.id.as_str()),
        "chain parents must not be listed"
    );

    // Prompt history is a per-project array.
    store.push_prompt_history(workdir, "hello").await.unwrap();
    store
        .push_prompt_history(workdir, "build the parser")
        .await
        .unwrap();
    let history = store.prompt_history(workdir).await.unwrap();
    assert_eq!(history, vec!["hello", "build the parser"]);

    // Deleting the chain removes every session sharing the root id plus
    // their messages, and nothing else.
    store.delete_chain(&root.root_id).await.unwrap();
    assert!(store.load_session(&root.id).await.unwrap().is_none());
    assert!(store.load_session(&child.id).await.unwrap().is_none());
    assert!(store
        .load_chain_messages(&root.root_id)
        .await
        .unwrap()
        .is_empty());
    assert!(store.load_session(&other.id).await.unwrap().is_some());
}

#[tokio::test]
async fn file_store_honours_the_contract() {
    let dir = tempfile::tempdir().unwrap();
    store_contract(Arc::new(FileStore::new(dir.path()))).await;
}

#[tokio::test]
async fn sqlite_store_honours_the_contract() {
    store_contract(Arc::new(SqliteStore::open_in_memory().unwrap())).await;
}

#[tokio::test]
async fn sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");
    let workdir = "/workspaces/persist";

    let session_id = {
        let store = SqliteStore::open(&path).unwrap();
        let session = store.create_session(workdir, None).await.unwrap();
        store
            .append_message(&session, MessageRole::User, "persisted", None)
            .await
            .unwrap();
        session.id
    };

    let store = SqliteStore::open(&path).unwrap();
    let reloaded = store.load_session(&session_id).await.unwrap().unwrap();
    assert_eq!(reloaded.id, session_id);
    let messages = store.load_messages(&session_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "persisted");
}

#[tokio::test]
async fn file_store_layout_matches_the_documented_shape() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    let workdir = "/workspaces/layout";
    let session = store.create_session(workdir, None).await.unwrap();
    store
        .set_current_session(workdir, &session.id)
        .await
        .unwrap();
    store.push_prompt_history(workdir, "one").await.unwrap();

    let project_dir = dir.path().join(&session.project_id);
    assert!(project_dir.join(format!("{}.json", session.id)).exists());
    assert!(project_dir.join("current").exists());
    assert!(dir
        .path()
        .join("history")
        .join(format!("{}.json", session.project_id))
        .exists());
}
