//! Progress event system.
//!
//! The engine reports what it is doing through a single [`EventHandler`]
//! trait receiving [`ProgressEvent`]s. The terminal UI renders them; tests
//! record them; everything else ignores them. Handlers are shared as
//! `Arc<dyn EventHandler>` and every emitting component treats the handler
//! as optional.
//!
//! Events are delivered in real time from whichever worker produced them
//! and are not globally ordered across shards. Two ordering guarantees do
//! hold: within one shard, deltas arrive in order, and
//! [`ProgressEvent::OrchestrateSync`] fires only after every shard's
//! terminal event.
//!
//! # Example
//!
//! ```rust
//! use eai::{EventHandler, ProgressEvent};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_event(&self, event: &ProgressEvent) {
//!         if let ProgressEvent::OrchestrateShardDone { shard_id, failed } = event {
//!             eprintln!("shard {} done (failed: {})", shard_id, failed);
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;
use std::sync::Arc;

/// Everything the engine reports while working.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    // -- Routing -----------------------------------------------------------
    /// A route was chosen for the incoming turn.
    RouteSelected {
        mode: String,
        route: String,
    },
    /// Non-English input was translated before routing.
    InputTranslated {
        original_chars: usize,
    },

    // -- Agent loop --------------------------------------------------------
    /// The loop entered iteration `iteration` (0-based).
    LoopIteration {
        task_id: String,
        iteration: usize,
    },
    /// One LLM round-trip inside the loop finished.
    LoopLlmCall {
        task_id: String,
        iteration: usize,
        duration_ms: u64,
    },
    /// A tool call extracted from the response is about to run.
    ToolCallStarted {
        task_id: String,
        call_id: String,
        tool: String,
    },
    /// A tool call finished (successfully or not).
    ToolCallFinished {
        task_id: String,
        call_id: String,
        tool: String,
        success: bool,
        duration_ms: u64,
    },
    /// The loop is blocked awaiting a permission decision.
    PermissionRequested {
        task_id: String,
        tool: String,
        summary: String,
    },
    /// A pending permission request was resolved.
    PermissionDecided {
        task_id: String,
        allowed: bool,
    },
    /// The final-response validator rejected a candidate answer.
    ValidatorRejected {
        task_id: String,
        guidance: String,
    },

    // -- Orchestrate phases ------------------------------------------------
    /// The task was split into `shards` subtasks.
    OrchestrateSplit {
        shards: usize,
    },
    /// Shards were handed to the scheduler.
    OrchestrateSchedule {
        shards: usize,
        workers: usize,
    },
    /// An in-process or worker LLM call for one shard completed.
    OrchestrateLlm {
        shard_id: String,
        duration_ms: u64,
    },
    /// A pane worker was spawned for a shard.
    OrchestrateTmuxSpawn {
        shard_id: String,
    },
    /// The parent began waiting on a pane worker's result file.
    OrchestrateTmuxWait {
        shard_id: String,
    },
    /// A pane worker reported its own LLM duration.
    OrchestrateTmuxWorkerLlm {
        shard_id: String,
        duration_ms: u64,
    },
    /// A shard was served from the result cache.
    OrchestrateCacheHit {
        shard_id: String,
    },
    /// A failed shard was requeued for its single retry.
    OrchestrateRetry {
        shard_id: String,
    },
    /// A shard reached a terminal state.
    OrchestrateShardDone {
        shard_id: String,
        failed: bool,
    },
    /// Active worker count changed.
    OrchestrateCompanions {
        active: usize,
    },
    /// Every shard has finalised; the pool is drained.
    OrchestrateSync,
    /// Aggregate run metrics (only when metrics are enabled).
    OrchestrateMetrics {
        total: usize,
        cached: usize,
        retried: usize,
        failed: usize,
        p50_ms: u64,
        p90_ms: u64,
        p99_ms: u64,
    },
    /// Shard outputs were synthesized into the final answer.
    OrchestrateSynthesis {
        shards: usize,
    },

    // -- Streaming ---------------------------------------------------------
    /// A chunk of streamed output from one shard or companion.
    CompanionDelta {
        label: String,
        text: String,
    },
    /// A companion finished and contributed a findings report.
    CompanionReport {
        label: String,
        chars: usize,
    },

    // -- Context management ------------------------------------------------
    /// Pre-turn token estimate against the compaction threshold.
    ContextEstimated {
        estimated: usize,
        threshold: usize,
        percent: f64,
    },
    /// Compaction of a session began.
    CompactionStarted {
        session_id: String,
    },
    /// Compaction finished; the turn continues in `child_id`.
    CompactionFinished {
        parent_id: String,
        child_id: String,
        fallback: bool,
    },
}

/// Receiver for [`ProgressEvent`]s.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &ProgressEvent);
}

/// Handler that drops every event.
pub struct NullHandler;

#[async_trait]
impl EventHandler for NullHandler {
    async fn on_event(&self, _event: &ProgressEvent) {}
}

/// Emit an event through an optional shared handler.
pub(crate) async fn emit(handler: &Option<Arc<dyn EventHandler>>, event: ProgressEvent) {
    if let Some(handler) = handler {
        handler.on_event(&event).await;
    }
}
