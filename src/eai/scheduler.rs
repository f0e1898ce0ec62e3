//! Concurrent shard scheduler.
//!
//! Runs a fixed pool of workers over a batch of [`TaskShard`]s. Each shard
//! goes through: cache probe, execution via a pluggable [`ShardExecutor`]
//! (in-process streaming call by default, pane worker optionally), an
//! optional per-shard timeout, and a single constrained retry on failure.
//! Successful outputs are cached; every shard ends in exactly one terminal
//! [`TaskResult`].
//!
//! Dispatch order sorts shards by estimated cost (`words x 50 + chars`)
//! ascending so short shards clear quickly and keep the pool busy.
//! Progress events stream in real time from whichever worker produced
//! them; [`ProgressEvent::OrchestrateSync`] fires only after the last
//! terminal event, followed by an aggregate metrics event when metrics
//! are enabled.

use crate::eai::cache::{cache_key, ShardCache};
use crate::eai::cancel::CancelToken;
use crate::eai::event::{emit, EventHandler, ProgressEvent};
use crate::eai::llm_client::{LLMClient, LLMError, LLMErrorKind, ReasoningObserver};
use crate::eai::splitter::render_retry_prompt;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One independently executable subtask.
#[derive(Debug, Clone)]
pub struct TaskShard {
    /// Stable shard id; shards in a batch use `"1"..="N"`.
    pub id: String,
    /// 0-based position within the batch.
    pub index: usize,
    /// Batch size.
    pub total: usize,
    /// The subtask text itself.
    pub subtask: String,
    /// Fully rendered prompt for this shard.
    pub prompt: String,
}

/// Terminal outcome for one shard.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: String,
    pub index: usize,
    pub output: String,
    pub error: Option<String>,
}

/// Estimated execution cost used for dispatch ordering.
pub fn estimated_cost(shard: &TaskShard) -> usize {
    shard.subtask.split_whitespace().count() * 50 + shard.subtask.chars().count()
}

/// Strategy executing one shard attempt.
///
/// The in-process streaming call is the reference implementation; the
/// pane-worker strategy is an optimisation layered behind the same seam.
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    async fn execute(
        &self,
        cancel: &CancelToken,
        shard: &TaskShard,
        prompt: &str,
        attempt: usize,
    ) -> Result<String, LLMError>;
}

/// Streaming chunk threshold in characters.
const STREAM_FLUSH_CHARS: usize = 512;
/// Streaming flush interval.
const STREAM_FLUSH_INTERVAL: Duration = Duration::from_millis(120);

/// Reference executor: one streaming LLM call per shard, partial deltas
/// forwarded to the progress handler in chunks of at least
/// [`STREAM_FLUSH_CHARS`] or every ~120 ms, labelled with the shard's
/// companion identity.
pub struct InProcessExecutor {
    client: Arc<dyn LLMClient>,
    handler: Option<Arc<dyn EventHandler>>,
}

impl InProcessExecutor {
    pub fn new(client: Arc<dyn LLMClient>, handler: Option<Arc<dyn EventHandler>>) -> Self {
        Self { client, handler }
    }
}

#[async_trait]
impl ShardExecutor for InProcessExecutor {
    async fn execute(
        &self,
        cancel: &CancelToken,
        shard: &TaskShard,
        prompt: &str,
        _attempt: usize,
    ) -> Result<String, LLMError> {
        let label = format!("Companion {}", shard.index + 1);
        let buffer: Mutex<(String, Instant)> = Mutex::new((String::new(), Instant::now()));
        let (delta_tx, mut delta_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        // The observer runs on the client's stack; buffer small fragments
        // and hand chunks to a forwarder task for async delivery.
        let observer = move |fragment: &str| {
            let mut guard = match buffer.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            guard.0.push_str(fragment);
            if guard.0.len() >= STREAM_FLUSH_CHARS || guard.1.elapsed() >= STREAM_FLUSH_INTERVAL {
                let chunk = std::mem::take(&mut guard.0);
                guard.1 = Instant::now();
                let _ = delta_tx.send(chunk);
            }
        };

        let forwarder = {
            let handler = self.handler.clone();
            let label = label.clone();
            tokio::spawn(async move {
                while let Some(chunk) = delta_rx.recv().await {
                    emit(
                        &handler,
                        ProgressEvent::CompanionDelta {
                            label: label.clone(),
                            text: chunk,
                        },
                    )
                    .await;
                }
            })
        };

        let observer_ref: ReasoningObserver<'_> = &observer;
        let result = self
            .client
            .complete_with_observer(cancel, prompt, observer_ref)
            .await;
        drop(observer);
        let _ = forwarder.await;
        result
    }
}

struct WorkItem {
    shard: TaskShard,
    prompt: String,
    attempt: usize,
}

/// Shared state for one scheduler run.
struct RunState {
    queue: Mutex<VecDeque<WorkItem>>,
    results: Mutex<Vec<Option<TaskResult>>>,
    retried: Mutex<Vec<bool>>,
    /// Shards not yet finalised; workers exit when this reaches zero.
    outstanding: AtomicUsize,
    active: AtomicUsize,
    durations: Mutex<Vec<u64>>,
    cached: AtomicUsize,
    retries: AtomicUsize,
}

/// Everything one worker needs, shared across the pool.
struct WorkerContext {
    executor: Arc<dyn ShardExecutor>,
    cache: Arc<ShardCache>,
    handler: Option<Arc<dyn EventHandler>>,
    shard_timeout: Option<Duration>,
    mode: String,
    model: String,
    full_task: String,
}

/// Pool scheduler over one batch of shards.
pub struct ShardScheduler {
    executor: Arc<dyn ShardExecutor>,
    cache: Arc<ShardCache>,
    handler: Option<Arc<dyn EventHandler>>,
    worker_cap: usize,
    shard_timeout: Option<Duration>,
    metrics: bool,
    mode: String,
    model: String,
}

impl ShardScheduler {
    pub fn new(
        executor: Arc<dyn ShardExecutor>,
        cache: Arc<ShardCache>,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Self {
        Self {
            executor,
            cache,
            handler,
            worker_cap: 5,
            shard_timeout: None,
            metrics: false,
            mode: "orchestrate".to_string(),
            model: "default".to_string(),
        }
    }

    /// Worker-pool cap before the batch size is applied (builder pattern).
    pub fn with_worker_cap(mut self, cap: usize) -> Self {
        self.worker_cap = cap.max(1);
        self
    }

    pub fn with_shard_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shard_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: bool) -> Self {
        self.metrics = metrics;
        self
    }

    /// Mode tag mixed into cache keys (builder pattern).
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Model name mixed into cache keys (builder pattern).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Run the batch to completion and return one result per shard, in
    /// input order.
    pub async fn run(
        &self,
        cancel: &CancelToken,
        shards: Vec<TaskShard>,
        full_task: &str,
    ) -> Vec<TaskResult> {
        let total = shards.len();
        if total == 0 {
            emit(&self.handler, ProgressEvent::OrchestrateSync).await;
            return Vec::new();
        }

        // Cheap shards first.
        let mut ordered = shards;
        ordered.sort_by_key(estimated_cost);

        let state = Arc::new(RunState {
            queue: Mutex::new(
                ordered
                    .into_iter()
                    .map(|shard| WorkItem {
                        prompt: shard.prompt.clone(),
                        shard,
                        attempt: 1,
                    })
                    .collect(),
            ),
            results: Mutex::new((0..total).map(|_| None).collect()),
            retried: Mutex::new(vec![false; total]),
            outstanding: AtomicUsize::new(total),
            active: AtomicUsize::new(0),
            durations: Mutex::new(Vec::new()),
            cached: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
        });

        let context = Arc::new(WorkerContext {
            executor: Arc::clone(&self.executor),
            cache: Arc::clone(&self.cache),
            handler: self.handler.clone(),
            shard_timeout: self.shard_timeout,
            mode: self.mode.clone(),
            model: self.model.clone(),
            full_task: full_task.to_string(),
        });

        let workers = self.worker_cap.min(total).max(1);
        debug!("scheduling {} shards over {} workers", total, workers);

        let mut joins = Vec::with_capacity(workers);
        for _ in 0..workers {
            let context = Arc::clone(&context);
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            joins.push(tokio::spawn(async move {
                context.worker_loop(&cancel, &state).await;
            }));
        }
        for join in joins {
            let _ = join.await;
        }

        emit(&self.handler, ProgressEvent::OrchestrateSync).await;
        if self.metrics {
            self.emit_metrics(&state, total).await;
        }

        let mut collected = state.results.lock().unwrap();
        collected
            .iter_mut()
            .enumerate()
            .map(|(index, slot)| {
                slot.take().unwrap_or_else(|| TaskResult {
                    id: (index + 1).to_string(),
                    index,
                    output: String::new(),
                    error: Some("shard never finalised".to_string()),
                })
            })
            .collect()
    }

    async fn emit_metrics(&self, state: &RunState, total: usize) {
        let mut durations = state.durations.lock().unwrap().clone();
        durations.sort_unstable();
        let pct = |q: f64| -> u64 {
            if durations.is_empty() {
                return 0;
            }
            let rank = ((q * durations.len() as f64).ceil() as usize).max(1) - 1;
            durations[rank.min(durations.len() - 1)]
        };
        let failed = state
            .results
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.as_ref().map(|r| r.error.is_some()).unwrap_or(false))
            .count();
        emit(
            &self.handler,
            ProgressEvent::OrchestrateMetrics {
                total,
                cached: state.cached.load(Ordering::SeqCst),
                retried: state.retries.load(Ordering::SeqCst),
                failed,
                p50_ms: pct(0.50),
                p90_ms: pct(0.90),
                p99_ms: pct(0.99),
            },
        )
        .await;
    }
}

impl WorkerContext {
    async fn worker_loop(&self, cancel: &CancelToken, state: &RunState) {
        loop {
            let item = {
                let mut queue = state.queue.lock().unwrap();
                queue.pop_front()
            };
            let item = match item {
                Some(item) => item,
                None => {
                    if state.outstanding.load(Ordering::SeqCst) == 0 {
                        return;
                    }
                    // Another worker may still requeue a retry.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
            emit(
                &self.handler,
                ProgressEvent::OrchestrateCompanions { active },
            )
            .await;

            self.run_item(cancel, state, item).await;

            let active = state.active.fetch_sub(1, Ordering::SeqCst) - 1;
            emit(
                &self.handler,
                ProgressEvent::OrchestrateCompanions { active },
            )
            .await;
        }
    }

    async fn run_item(&self, cancel: &CancelToken, state: &RunState, item: WorkItem) {
        let shard = &item.shard;
        let key = cache_key(
            &shard.subtask,
            &self.full_task,
            &shard.prompt,
            &self.mode,
            &self.model,
        );

        // The cache probe only applies to first attempts; a retry already
        // failed past the cache.
        if item.attempt == 1 {
            if let Some(output) = self.cache.get(&key) {
                state.cached.fetch_add(1, Ordering::SeqCst);
                emit(
                    &self.handler,
                    ProgressEvent::OrchestrateCacheHit {
                        shard_id: shard.id.clone(),
                    },
                )
                .await;
                self.finalize(
                    state,
                    shard,
                    TaskResult {
                        id: shard.id.clone(),
                        index: shard.index,
                        output,
                        error: None,
                    },
                )
                .await;
                return;
            }
        }

        let started = Instant::now();
        let executed = match self.shard_timeout {
            Some(timeout) => {
                match tokio::time::timeout(
                    timeout,
                    self.executor
                        .execute(cancel, shard, &item.prompt, item.attempt),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(LLMError::new(
                        LLMErrorKind::Transient,
                        format!("shard timed out after {:?}", timeout),
                    )),
                }
            }
            None => {
                self.executor
                    .execute(cancel, shard, &item.prompt, item.attempt)
                    .await
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        state.durations.lock().unwrap().push(duration_ms);
        emit(
            &self.handler,
            ProgressEvent::OrchestrateLlm {
                shard_id: shard.id.clone(),
                duration_ms,
            },
        )
        .await;

        match executed {
            Ok(output) => {
                self.cache.put(key, output.clone());
                self.finalize(
                    state,
                    shard,
                    TaskResult {
                        id: shard.id.clone(),
                        index: shard.index,
                        output,
                        error: None,
                    },
                )
                .await;
            }
            Err(err) => {
                let may_retry = err.kind != LLMErrorKind::Cancelled && !cancel.is_cancelled();
                let first_failure = {
                    let mut retried = state.retried.lock().unwrap();
                    if may_retry && !retried[shard.index] {
                        retried[shard.index] = true;
                        true
                    } else {
                        false
                    }
                };
                if first_failure {
                    warn!("shard {} failed, retrying once: {}", shard.id, err);
                    state.retries.fetch_add(1, Ordering::SeqCst);
                    emit(
                        &self.handler,
                        ProgressEvent::OrchestrateRetry {
                            shard_id: shard.id.clone(),
                        },
                    )
                    .await;
                    let retry_prompt =
                        render_retry_prompt(shard.index, shard.total, &shard.subtask);
                    state.queue.lock().unwrap().push_back(WorkItem {
                        shard: shard.clone(),
                        prompt: retry_prompt,
                        attempt: item.attempt + 1,
                    });
                } else {
                    self.finalize(
                        state,
                        shard,
                        TaskResult {
                            id: shard.id.clone(),
                            index: shard.index,
                            output: String::new(),
                            error: Some(err.user_message()),
                        },
                    )
                    .await;
                }
            }
        }
    }

    async fn finalize(&self, state: &RunState, shard: &TaskShard, result: TaskResult) {
        let failed = result.error.is_some();
        state.results.lock().unwrap()[shard.index] = Some(result);
        emit(
            &self.handler,
            ProgressEvent::OrchestrateShardDone {
                shard_id: shard.id.clone(),
                failed,
            },
        )
        .await;
        // Decrement last: the terminal event is ordered before the sync
        // event the pool emits after draining.
        state.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}
