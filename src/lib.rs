// src/lib.rs

// Import the top-level `eai` module.
pub mod eai;

// Re-export the engine's main entry points at the crate root so host
// products can use eai::Router without navigating the module tree.
pub use eai::agent_loop::{AgentLoop, AgentState};
pub use eai::cancel::{CancelSource, CancelToken};
pub use eai::config::EngineConfig;
pub use eai::event::{EventHandler, ProgressEvent};
pub use eai::llm_client::{LLMClient, LLMError, LLMErrorKind, RetryingClient, Role};
pub use eai::orchestrator::Orchestrator;
pub use eai::router::{Mode, Route, Router};
