//! Orchestrator façade.
//!
//! Ties the task splitter, the shard scheduler, and the synthesizer into
//! one `execute_orchestrate` entry point: compute the shard budget, split
//! the request (expanding via LLM decomposition and deterministic padding
//! when the heuristics fall short), render per-shard prompts, schedule,
//! and synthesize. Individual shard failures surface as error markers in
//! the synthesized text; the run itself fails only when every shard
//! failed.

use crate::eai::cancel::CancelToken;
use crate::eai::cache::ShardCache;
use crate::eai::config::EngineConfig;
use crate::eai::event::{emit, EventHandler, ProgressEvent};
use crate::eai::llm_client::LLMClient;
use crate::eai::scheduler::{InProcessExecutor, ShardExecutor, ShardScheduler, TaskShard};
use crate::eai::splitter::{
    desired_shard_count, fallback_subtasks, llm_decompose, normalize_shards, render_shard_prompt,
    split_task,
};
use crate::eai::synthesizer::synthesize;
use log::{debug, info};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Orchestrate-level failures.
#[derive(Debug)]
pub enum OrchestratorError {
    /// The request produced no usable subtasks.
    NothingToDo,
    /// Every shard failed; the synthesized output carries the details.
    AllShardsFailed(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::NothingToDo => write!(f, "nothing to orchestrate"),
            OrchestratorError::AllShardsFailed(_) => write!(f, "every shard failed"),
        }
    }
}

impl Error for OrchestratorError {}

/// Fan-out orchestrator for one engine instance.
pub struct Orchestrator {
    client: Arc<dyn LLMClient>,
    config: EngineConfig,
    cache: Arc<ShardCache>,
    handler: Option<Arc<dyn EventHandler>>,
    executor: Arc<dyn ShardExecutor>,
}

impl Orchestrator {
    /// Build an orchestrator with the in-process executor.
    pub fn new(
        client: Arc<dyn LLMClient>,
        config: EngineConfig,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Self {
        let cache = Arc::new(ShardCache::new(config.cache_ttl));
        let executor = Arc::new(InProcessExecutor::new(Arc::clone(&client), handler.clone()));
        Self {
            client,
            config,
            cache,
            handler,
            executor,
        }
    }

    /// Swap the shard execution strategy (pane workers, test doubles).
    pub fn with_executor(mut self, executor: Arc<dyn ShardExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Share a cache across orchestrator instances.
    pub fn with_cache(mut self, cache: Arc<ShardCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Split, schedule, and synthesize one orchestrate request.
    pub async fn execute_orchestrate(
        &self,
        cancel: &CancelToken,
        mode: &str,
        input: &str,
        requested_agents: usize,
    ) -> Result<String, OrchestratorError> {
        let budget = self.config.shard_budget(requested_agents);
        let mut subtasks = split_task(input, budget);
        if subtasks.is_empty() {
            return Err(OrchestratorError::NothingToDo);
        }

        let desired = desired_shard_count(budget, input, 2);
        if subtasks.len() < desired && self.config.llm_decompose && budget >= 4 {
            if let Some(expanded) = llm_decompose(&self.client, cancel, input, desired).await {
                if expanded.len() > subtasks.len() {
                    debug!(
                        "LLM decomposition expanded {} -> {} subtasks",
                        subtasks.len(),
                        expanded.len()
                    );
                    subtasks = expanded;
                }
            }
        }
        if subtasks.len() < desired {
            let mut padded = subtasks.clone();
            padded.extend(fallback_subtasks(input, desired - subtasks.len()));
            subtasks = normalize_shards(padded, budget);
        }
        subtasks.truncate(budget);

        let total = subtasks.len();
        let shards: Vec<TaskShard> = subtasks
            .into_iter()
            .enumerate()
            .map(|(index, subtask)| TaskShard {
                id: (index + 1).to_string(),
                index,
                total,
                prompt: render_shard_prompt(index, total, &subtask, input),
                subtask,
            })
            .collect();

        emit(
            &self.handler,
            ProgressEvent::OrchestrateSplit { shards: total },
        )
        .await;
        let workers = self.config.active_panes.min(total).max(1);
        emit(
            &self.handler,
            ProgressEvent::OrchestrateSchedule {
                shards: total,
                workers,
            },
        )
        .await;
        info!("orchestrating {} shards ({} workers)", total, workers);

        let scheduler = ShardScheduler::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.cache),
            self.handler.clone(),
        )
        .with_worker_cap(workers)
        .with_shard_timeout(self.config.shard_timeout)
        .with_metrics(self.config.metrics)
        .with_mode(mode)
        .with_model(self.client.model_name());

        let results = scheduler.run(cancel, shards, input).await;

        let text = synthesize(&results);
        emit(
            &self.handler,
            ProgressEvent::OrchestrateSynthesis { shards: total },
        )
        .await;

        if !results.is_empty() && results.iter().all(|r| r.error.is_some()) {
            return Err(OrchestratorError::AllShardsFailed(text));
        }
        if text.trim().is_empty() {
            return Err(OrchestratorError::NothingToDo);
        }
        Ok(text)
    }
}
