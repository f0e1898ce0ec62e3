use async_trait::async_trait;
use eai::eai::cancel::CancelToken;
use eai::eai::llm_client::{LLMClient, LLMError};
use eai::eai::router::{decide_route, Mode, Route, Router};
use eai::eai::session::file_store::FileStore;
use eai::eai::session::SessionStore;
use eai::EngineConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct FixedClient {
    calls: AtomicUsize,
    responses: Mutex<Vec<String>>,
}

impl FixedClient {
    fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(responses.into_iter().map(String::from).rev().collect()),
        })
    }
}

#[async_trait]
impl LLMClient for FixedClient {
    async fn complete(&self, _cancel: &CancelToken, _prompt: &str) -> Result<String, LLMError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| LLMError::from_text("script exhausted"))
    }

    fn model_name(&self) -> &str {
        "fixed"
    }
}

fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.auto_translate = false;
    config
}

#[tokio::test]
async fn greeting_in_tool_mode_skips_the_llm() {
    let dir = tempfile::tempdir().unwrap();
    let client = FixedClient::new(vec![]);
    let router = Router::new(
        Some(client.clone() as Arc<dyn LLMClient>),
        quiet_config(),
        dir.path().to_path_buf(),
    );
    let outcome = router
        .run_turn(&CancelToken::never(), Mode::Tool, None, "hello!")
        .await
        .unwrap();
    assert!(outcome.text.contains("workspace"));
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn listing_fastpath_reads_the_directory_without_a_client() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();

    let router = Router::new(None, quiet_config(), dir.path().to_path_buf());
    let outcome = router
        .run_turn(
            &CancelToken::never(),
            Mode::Tool,
            None,
            "list files in this folder",
        )
        .await
        .unwrap();
    assert!(outcome.text.contains("a.txt"));
    assert!(outcome.text.contains("sub/"));
}

#[tokio::test]
async fn chat_replaces_tool_blobs_with_guidance() {
    let dir = tempfile::tempdir().unwrap();
    let client = FixedClient::new(vec![
        "{\"tool_calls\":[{\"id\":\"x\",\"name\":\"shell_execute\",\"arguments\":{\"command\":\"ls\"}}]}",
    ]);
    let router = Router::new(
        Some(client as Arc<dyn LLMClient>),
        quiet_config(),
        dir.path().to_path_buf(),
    );
    let outcome = router
        .run_turn(&CancelToken::never(), Mode::Chat, None, "what files exist?")
        .await
        .unwrap();
    assert!(outcome.text.contains("tool mode"));
    assert!(!outcome.text.contains("tool_calls"));
}

#[tokio::test]
async fn chat_turn_persists_both_sides_of_the_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(FileStore::new(store_dir.path()));
    let session = store
        .create_session(&dir.path().to_string_lossy(), None)
        .await
        .unwrap();

    let client = FixedClient::new(vec!["the answer"]);
    let router = Router::new(
        Some(client as Arc<dyn LLMClient>),
        quiet_config(),
        dir.path().to_path_buf(),
    )
    .with_store(Arc::clone(&store));

    let outcome = router
        .run_turn(
            &CancelToken::never(),
            Mode::Chat,
            Some(session.clone()),
            "what is the answer?",
        )
        .await
        .unwrap();
    assert_eq!(outcome.text, "the answer");

    let messages = store.load_messages(&session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "what is the answer?");
    assert_eq!(messages[1].content, "the answer");

    let history = store
        .prompt_history(&session.workdir)
        .await
        .unwrap();
    assert_eq!(history, vec!["what is the answer?"]);
}

#[tokio::test]
async fn plan_mode_runs_until_the_checklist_appears() {
    let dir = tempfile::tempdir().unwrap();
    let plan = "Plan overview.\n<proposed_plan>\n- [ ] read the module\n- [ ] sketch the fix\n- [ ] implement it\n- [ ] add tests\n</proposed_plan>";
    let client = FixedClient::new(vec!["I would start by reading the code.", plan]);
    let router = Router::new(
        Some(client.clone() as Arc<dyn LLMClient>),
        quiet_config(),
        dir.path().to_path_buf(),
    );
    let outcome = router
        .run_turn(
            &CancelToken::never(),
            Mode::Plan,
            None,
            "improve the error handling",
        )
        .await
        .unwrap();
    assert!(outcome.text.contains("<proposed_plan>"));
    // The first answer lacked the checklist, so a nudge forced a second call.
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn actionable_orchestrate_goes_to_the_tool_agent() {
    assert_eq!(
        decide_route(Mode::Orchestrate, "fix the flaky test", true),
        Route::ToolAgent
    );
    assert_eq!(
        decide_route(Mode::Orchestrate, "overview of the architecture please", true),
        Route::Orchestrate
    );
}
