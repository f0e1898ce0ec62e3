//! Engine configuration from environment variables.
//!
//! Every knob the engine recognises is an `EAI_*` variable read once at
//! startup into an [`EngineConfig`]. The struct is plain data with no
//! config-file parsing; the host product decides how (or whether) to
//! expose these to users.
//!
//! | Variable | Effect |
//! |---|---|
//! | `EAI_ORCHESTRATE_MAX_PANES_PER_TASK` | Per-task shard multiplier (default 5) |
//! | `EAI_ORCHESTRATE_MAX_SHARDS` | Global shard hard cap (default 10, max 100) |
//! | `EAI_ORCHESTRATE_ACTIVE_PANES` | Worker-pool size cap (default 5) |
//! | `EAI_ORCHESTRATE_CACHE_TTL_SEC` | Shard cache TTL, 0 disables (default 900) |
//! | `EAI_ORCHESTRATE_SHARD_TIMEOUT_SEC` | Per-shard timeout |
//! | `EAI_ORCHESTRATE_METRICS` | Enable p50/p90/p99 metric events |
//! | `EAI_ORCHESTRATE_LLM_DECOMPOSE` | Allow LLM decomposition of short splits |
//! | `EAI_TMUX_DISABLE` / `EAI_TMUX_WORKER` / `EAI_TMUX_HEADLESS` | Pane-worker controls |
//! | `EAI_CONTEXT_WINDOW_TOKENS` | Override the model's context window |
//! | `EAI_AUTO_TRANSLATE_TO_ENGLISH` | Default on; "0/false/no/off" disables |
//! | `EAI_TOOL_SESSION_CONTEXT` | Inject session memory into tool prompts |
//! | `EAI_TOOL_COMPANIONS` | Enable read-only companion fan-out |
//! | `EAI_LLM_MAX_RETRIES` | Transport retry budget (default 3) |
//! | `EAI_LLM_REQUEST_TIMEOUT_SEC` / `EAI_HTTP_TIMEOUT_SEC` | Transport timeouts |

use log::warn;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on the shard budget regardless of configuration.
pub const SHARD_HARD_CAP: usize = 100;

/// Upper bound on the worker pool regardless of configuration.
pub const WORKER_HARD_CAP: usize = 50;

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shards granted per requested agent (default 5).
    pub max_panes_per_task: usize,
    /// Global shard budget cap (default 10, never above 100).
    pub max_shards: usize,
    /// Worker-pool size cap (default 5, never above `max_parallel_agents`).
    pub active_panes: usize,
    /// Absolute parallelism ceiling (default 50).
    pub max_parallel_agents: usize,
    /// Shard-result cache TTL; `None` disables caching.
    pub cache_ttl: Option<Duration>,
    /// Optional per-shard execution timeout.
    pub shard_timeout: Option<Duration>,
    /// Emit aggregate duration metrics after each orchestrate run.
    pub metrics: bool,
    /// Allow a single LLM call to expand a short heuristic split.
    pub llm_decompose: bool,
    /// Never spawn pane workers.
    pub tmux_disable: bool,
    /// This process *is* a pane worker; never recurse into pane spawning.
    pub tmux_worker: bool,
    /// Spawn workers into a detached session instead of splitting panes.
    pub tmux_headless: bool,
    /// Override for the model's context window, in tokens.
    pub context_window_tokens: Option<usize>,
    /// Translate non-English input before routing (default on).
    pub auto_translate: bool,
    /// Inject session summary/history into tool-mode prompts.
    pub tool_session_context: bool,
    /// Fan out read-only companion agents before tool-mode execution.
    pub tool_companions: bool,
    /// Transport retry budget for transient LLM failures.
    pub llm_max_retries: usize,
    /// Per-request LLM timeout.
    pub llm_request_timeout: Option<Duration>,
    /// Underlying HTTP timeout, forwarded to pane workers.
    pub http_timeout: Option<Duration>,
    /// Directory receiving per-iteration agent state spills.
    pub state_dir: Option<PathBuf>,
    /// Default number of requested agents for orchestrate turns.
    pub requested_agents: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_panes_per_task: 5,
            max_shards: 10,
            active_panes: 5,
            max_parallel_agents: WORKER_HARD_CAP,
            cache_ttl: Some(Duration::from_secs(900)),
            shard_timeout: None,
            metrics: false,
            llm_decompose: false,
            tmux_disable: false,
            tmux_worker: false,
            tmux_headless: false,
            context_window_tokens: None,
            auto_translate: true,
            tool_session_context: false,
            tool_companions: false,
            llm_max_retries: 3,
            llm_request_timeout: None,
            http_timeout: None,
            state_dir: None,
            requested_agents: 2,
        }
    }
}

impl EngineConfig {
    /// Read every `EAI_*` knob from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut cfg = Self {
            max_panes_per_task: env_usize(
                "EAI_ORCHESTRATE_MAX_PANES_PER_TASK",
                defaults.max_panes_per_task,
            ),
            max_shards: env_usize("EAI_ORCHESTRATE_MAX_SHARDS", defaults.max_shards),
            active_panes: env_usize("EAI_ORCHESTRATE_ACTIVE_PANES", defaults.active_panes),
            max_parallel_agents: env_usize(
                "EAI_MAX_PARALLEL_AGENTS",
                defaults.max_parallel_agents,
            ),
            cache_ttl: match env_u64("EAI_ORCHESTRATE_CACHE_TTL_SEC", 900) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            shard_timeout: env_duration_opt("EAI_ORCHESTRATE_SHARD_TIMEOUT_SEC"),
            metrics: env_flag("EAI_ORCHESTRATE_METRICS"),
            llm_decompose: env_flag("EAI_ORCHESTRATE_LLM_DECOMPOSE"),
            tmux_disable: env_flag("EAI_TMUX_DISABLE"),
            tmux_worker: env_flag("EAI_TMUX_WORKER"),
            tmux_headless: env_flag("EAI_TMUX_HEADLESS"),
            context_window_tokens: env_usize_opt("EAI_CONTEXT_WINDOW_TOKENS"),
            auto_translate: env_bool("EAI_AUTO_TRANSLATE_TO_ENGLISH", true),
            tool_session_context: env_flag("EAI_TOOL_SESSION_CONTEXT"),
            tool_companions: env_flag("EAI_TOOL_COMPANIONS"),
            llm_max_retries: env_usize("EAI_LLM_MAX_RETRIES", defaults.llm_max_retries),
            llm_request_timeout: env_duration_opt("EAI_LLM_REQUEST_TIMEOUT_SEC"),
            http_timeout: env_duration_opt("EAI_HTTP_TIMEOUT_SEC"),
            state_dir: std::env::var_os("EAI_STATE_DIR").map(PathBuf::from),
            requested_agents: defaults.requested_agents,
        };
        cfg.clamp();
        cfg
    }

    /// Apply the documented upper bounds so misconfiguration cannot spawn
    /// unbounded work.
    pub fn clamp(&mut self) {
        self.max_shards = self.max_shards.max(1).min(SHARD_HARD_CAP);
        self.max_parallel_agents = self.max_parallel_agents.max(1).min(WORKER_HARD_CAP);
        self.active_panes = self
            .active_panes
            .max(1)
            .min(self.max_parallel_agents)
            .min(WORKER_HARD_CAP);
        self.max_panes_per_task = self.max_panes_per_task.max(1).min(SHARD_HARD_CAP);
    }

    /// The shard budget for one orchestrate turn.
    pub fn shard_budget(&self, requested_agents: usize) -> usize {
        let requested = requested_agents.max(1);
        (requested * self.max_panes_per_task)
            .min(self.max_shards)
            .min(SHARD_HARD_CAP)
            .max(1)
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_usize(name: &str, default: usize) -> usize {
    match env_str(name) {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring unparsable {}={:?}", name, v);
            default
        }),
        None => default,
    }
}

fn env_usize_opt(name: &str) -> Option<usize> {
    env_str(name).and_then(|v| v.trim().parse().ok())
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env_str(name) {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring unparsable {}={:?}", name, v);
            default
        }),
        None => default,
    }
}

fn env_duration_opt(name: &str) -> Option<Duration> {
    env_str(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Truthy when set to anything other than an explicit off-value.
fn env_flag(name: &str) -> bool {
    match env_str(name) {
        Some(v) => !is_off(&v),
        None => false,
    }
}

/// Like [`env_flag`] but with a configurable default for unset.
fn env_bool(name: &str, default: bool) -> bool {
    match env_str(name) {
        Some(v) => !is_off(&v),
        None => default,
    }
}

fn is_off(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_panes_per_task, 5);
        assert_eq!(cfg.max_shards, 10);
        assert_eq!(cfg.active_panes, 5);
        assert_eq!(cfg.cache_ttl, Some(Duration::from_secs(900)));
        assert!(cfg.auto_translate);
        assert_eq!(cfg.llm_max_retries, 3);
    }

    #[test]
    fn shard_budget_is_product_capped() {
        let mut cfg = EngineConfig::default();
        // 2 agents x 5 panes = 10, within the default cap.
        assert_eq!(cfg.shard_budget(2), 10);
        // Raising the cap lets the product through, but never past 100.
        cfg.max_shards = 100;
        assert_eq!(cfg.shard_budget(30), 100);
        cfg.max_panes_per_task = 100;
        cfg.clamp();
        assert_eq!(cfg.shard_budget(100), 100);
    }

    #[test]
    fn clamp_bounds_workers() {
        let mut cfg = EngineConfig::default();
        cfg.active_panes = 500;
        cfg.max_parallel_agents = 8;
        cfg.clamp();
        assert_eq!(cfg.active_panes, 8);

        cfg.active_panes = 0;
        cfg.clamp();
        assert_eq!(cfg.active_panes, 1);
    }

    #[test]
    fn off_values() {
        assert!(is_off("0"));
        assert!(is_off("False"));
        assert!(is_off(" no "));
        assert!(is_off("OFF"));
        assert!(!is_off("1"));
        assert!(!is_off("yes"));
    }
}
