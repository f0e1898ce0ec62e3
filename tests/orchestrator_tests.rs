use async_trait::async_trait;
use eai::eai::cache::ShardCache;
use eai::eai::cancel::CancelToken;
use eai::eai::event::{EventHandler, ProgressEvent};
use eai::eai::llm_client::{LLMClient, LLMError};
use eai::eai::orchestrator::{Orchestrator, OrchestratorError};
use eai::EngineConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct CountingClient {
    calls: AtomicUsize,
    /// Prompts seen, in call order.
    prompts: Mutex<Vec<String>>,
    /// Fail the nth call (1-based) once with a transient error.
    fail_call: Option<usize>,
}

impl CountingClient {
    fn new(fail_call: Option<usize>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            fail_call,
        }
    }
}

#[async_trait]
impl LLMClient for CountingClient {
    async fn complete(&self, _cancel: &CancelToken, prompt: &str) -> Result<String, LLMError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail_call == Some(call) {
            return Err(LLMError::from_text("503 service unavailable"));
        }
        Ok(format!("output for call {}", call))
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

struct Recorder {
    events: Mutex<Vec<ProgressEvent>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn config_with_cache(ttl_secs: u64) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.cache_ttl = if ttl_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(ttl_secs))
    };
    config
}

#[tokio::test]
async fn synthesized_output_has_one_marker_per_shard() {
    let client = Arc::new(CountingClient::new(None));
    let orchestrator = Orchestrator::new(client, config_with_cache(60), None);
    let text = orchestrator
        .execute_orchestrate(
            &CancelToken::never(),
            "orchestrate",
            "- check the logs\n- check the metrics\n- check the alerts",
            1,
        )
        .await
        .unwrap();
    assert_eq!(text.matches("[Shard ").count(), 3);
    let one = text.find("[Shard 1]").unwrap();
    let two = text.find("[Shard 2]").unwrap();
    let three = text.find("[Shard 3]").unwrap();
    assert!(one < two && two < three);
}

#[tokio::test]
async fn second_run_within_ttl_hits_the_cache() {
    let client = Arc::new(CountingClient::new(None));
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
    });
    let cache = Arc::new(ShardCache::new(Some(Duration::from_secs(60))));
    let orchestrator = Orchestrator::new(
        Arc::clone(&client) as Arc<dyn LLMClient>,
        config_with_cache(60),
        Some(recorder.clone()),
    )
    .with_cache(cache);

    let input = "build package and run tests";
    orchestrator
        .execute_orchestrate(&CancelToken::never(), "orchestrate", input, 1)
        .await
        .unwrap();
    let after_first = client.calls.load(Ordering::SeqCst);
    assert_eq!(after_first, 2, "two shards, two LLM calls");

    orchestrator
        .execute_orchestrate(&CancelToken::never(), "orchestrate", input, 1)
        .await
        .unwrap();
    // The second run is served entirely from the cache.
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);

    let events = recorder.events.lock().unwrap();
    let cache_hits = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::OrchestrateCacheHit { .. }))
        .count();
    assert!(cache_hits >= 1);
}

#[tokio::test]
async fn transient_shard_failure_retries_exactly_once() {
    let client = Arc::new(CountingClient::new(Some(1)));
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
    });
    let orchestrator = Orchestrator::new(
        Arc::clone(&client) as Arc<dyn LLMClient>,
        config_with_cache(0),
        Some(recorder.clone()),
    );

    let input = "build package and run tests";
    let text = orchestrator
        .execute_orchestrate(&CancelToken::never(), "orchestrate", input, 1)
        .await
        .unwrap();

    // Two shards plus one retry: three LLM calls in total.
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    assert_eq!(text.matches("[Shard ").count(), 2);
    assert!(!text.contains("Error"), "retry recovered the shard: {}", text);

    let events = recorder.events.lock().unwrap();
    let retries: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::OrchestrateRetry { .. }))
        .collect();
    assert_eq!(retries.len(), 1);

    // The retry prompt is constrained: it omits the full request text.
    let prompts = client.prompts.lock().unwrap();
    let retry_prompt = prompts
        .iter()
        .find(|p| p.contains("The previous attempt failed"))
        .expect("retry prompt was issued");
    assert!(retry_prompt.contains("Subtask"));
    assert!(!retry_prompt.contains(input));

    // The sync event fires after every shard's terminal event.
    let sync_at = events
        .iter()
        .position(|e| matches!(e, ProgressEvent::OrchestrateSync))
        .unwrap();
    let last_done = events
        .iter()
        .rposition(|e| matches!(e, ProgressEvent::OrchestrateShardDone { .. }))
        .unwrap();
    assert!(last_done < sync_at);
}

#[tokio::test]
async fn all_shards_failing_fails_the_run() {
    struct AlwaysBroken;
    #[async_trait]
    impl LLMClient for AlwaysBroken {
        async fn complete(
            &self,
            _cancel: &CancelToken,
            _prompt: &str,
        ) -> Result<String, LLMError> {
            Err(LLMError::from_text("insufficient balance"))
        }
        fn model_name(&self) -> &str {
            "broken"
        }
    }
    let orchestrator = Orchestrator::new(Arc::new(AlwaysBroken), config_with_cache(0), None);
    let err = orchestrator
        .execute_orchestrate(
            &CancelToken::never(),
            "orchestrate",
            "build package and run tests",
            1,
        )
        .await
        .unwrap_err();
    match err {
        OrchestratorError::AllShardsFailed(text) => {
            assert_eq!(text.matches("Error]").count(), 2);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn single_shard_failure_still_succeeds_with_marker() {
    // One subtask fails on both attempts; the other succeeds.
    struct FailOneSubtask;
    #[async_trait]
    impl LLMClient for FailOneSubtask {
        async fn complete(
            &self,
            _cancel: &CancelToken,
            prompt: &str,
        ) -> Result<String, LLMError> {
            if prompt.contains("build package") {
                Err(LLMError::from_text("insufficient balance"))
            } else {
                Ok("fine".to_string())
            }
        }
        fn model_name(&self) -> &str {
            "failone"
        }
    }
    let orchestrator = Orchestrator::new(Arc::new(FailOneSubtask), config_with_cache(0), None);
    let text = orchestrator
        .execute_orchestrate(
            &CancelToken::never(),
            "orchestrate",
            "build package and run tests",
            1,
        )
        .await
        .unwrap();
    assert_eq!(text.matches("[Shard ").count(), 2);
    assert!(text.contains("Error]"));
}
