//! Iterative LLM-and-tool controller.
//!
//! One [`AgentLoop`] drives a single task to completion: render the
//! message log to a prompt, call the LLM, parse the response for tool
//! calls, execute them, feed the observations back, repeat. The loop ends
//! when the model answers without a tool call (and the optional validator
//! accepts the answer) or when the iteration budget runs out.
//!
//! The controller is single-threaded within one [`execute`](AgentLoop::execute)
//! call; all parallelism in the engine lives above it, in the shard
//! scheduler and the companion fan-out.
//!
//! # Hooks
//!
//! Everything optional is pluggable through builder methods:
//!
//! - `with_system_prompt_fn`: replaces the default execution-mode system
//!   prompt (plan mode uses this to describe discovery instead).
//! - `with_prelude`: messages injected after the task (session memory,
//!   companion findings).
//! - `with_validator`: rejects a candidate final answer and nudges the
//!   model with guidance instead of completing.
//! - `with_tool_filter`: drops tool calls before execution (the read-only
//!   variant is a registry choice, but callers can filter further).
//! - `with_permission_gate`: blocks risky calls on an interactive
//!   decision; outer cancellation resolves pending decisions as denied.
//! - `with_event_handler`: receives per-iteration progress events.
//!
//! # Failure semantics
//!
//! LLM errors append an error marker as the assistant message and end the
//! loop; there is no retry at this level (transport retries live in the
//! client, orchestration retries in the scheduler). Tool failures are
//! recorded in the result and shown to the model, which is expected to
//! read the error text and adapt.

use crate::eai::cancel::CancelToken;
use crate::eai::event::{emit, EventHandler, ProgressEvent};
use crate::eai::llm_client::{LLMClient, Role};
use crate::eai::tool_parser::{parse_response, ParsedResponse};
use crate::eai::tool_protocol::{ToolCall, ToolRegistry, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Default iteration budget for tool-mode tasks.
pub const DEFAULT_MAX_LOOPS: usize = 20;

/// Marker recorded as final output when the budget runs out.
pub const ITERATION_LIMIT_MARKER: &str = "[iteration limit reached before completion]";

/// One entry in the loop's message log.
#[derive(Debug, Clone, Serialize)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls parsed out of this assistant message, if any.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool results carried by this observation message, if any.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Complete record of one task execution.
///
/// Owned exclusively by the loop that produced it; serialized (indented)
/// to `<state_dir>/<task_id>.json` after each iteration for crash
/// visibility.
#[derive(Debug, Serialize)]
pub struct AgentState {
    pub task_id: String,
    pub task: String,
    pub iteration: usize,
    pub max_loops: usize,
    pub messages: Vec<AgentMessage>,
    pub results: Vec<ToolResult>,
    pub completed: bool,
    pub final_output: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentState {
    fn new(task: &str, max_loops: usize) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task: task.to_string(),
            iteration: 0,
            max_loops,
            messages: Vec::new(),
            results: Vec::new(),
            completed: false,
            final_output: String::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Render a message log into prompt text: each message labelled by role
/// in brackets, separated by blank lines.
pub fn render_prompt(messages: &[AgentMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}\n{}", m.role.label(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Default execution-mode system prompt: terse instruction block plus the
/// tool catalog and the canonical tool-call shape.
pub fn default_system_prompt(tools: &ToolRegistry) -> String {
    let mut prompt = String::from(
        "You are an execution agent working in a terminal workspace.\n\
         Complete the task by taking small, verifiable steps.\n\n",
    );
    if !tools.is_empty() {
        prompt.push_str(&tools.describe_for_prompt());
        prompt.push_str(
            "\nTo use a tool, respond with exactly one JSON object:\n\
             {\"tool_calls\":[{\"id\":\"c1\",\"name\":\"<tool>\",\"arguments\":{...}}]}\n\
             After each tool runs you will receive its output.\n",
        );
    }
    prompt.push_str(
        "\nWhen the task is done, respond with the final answer as plain text and no tool call.\n\
         Be concise. Do not repeat tool output verbatim.",
    );
    prompt
}

/// Validates a candidate final answer; `Err` carries guidance appended to
/// the conversation as a nudge.
pub type ResponseValidator = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Builds the system prompt from the registry.
pub type SystemPromptFn = Arc<dyn Fn(&ToolRegistry) -> String + Send + Sync>;

/// Drops tool calls before execution when it returns false.
pub type ToolFilter = Arc<dyn Fn(&ToolCall) -> bool + Send + Sync>;

/// Interactive approval seam for risky tool calls.
///
/// Implementations may block awaiting a user decision; the loop passes
/// its cancellation token so a cancelled turn resolves as denied.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn authorize(&self, cancel: &CancelToken, call: &ToolCall) -> bool;
}

/// Gate that approves everything.
pub struct AllowAll;

#[async_trait]
impl PermissionGate for AllowAll {
    async fn authorize(&self, _cancel: &CancelToken, _call: &ToolCall) -> bool {
        true
    }
}

/// A pending approval forwarded to the host UI.
pub struct PermissionRequest {
    pub call: ToolCall,
    /// Send `true` to approve. Dropping the sender denies.
    pub respond: tokio::sync::oneshot::Sender<bool>,
}

/// Gate that forwards matching calls over a channel and blocks on the
/// answer. Calls not matching the predicate are approved immediately.
pub struct ChannelGate {
    needs_approval: Arc<dyn Fn(&ToolCall) -> bool + Send + Sync>,
    requests: tokio::sync::mpsc::Sender<PermissionRequest>,
}

impl ChannelGate {
    pub fn new(
        needs_approval: Arc<dyn Fn(&ToolCall) -> bool + Send + Sync>,
        requests: tokio::sync::mpsc::Sender<PermissionRequest>,
    ) -> Self {
        Self {
            needs_approval,
            requests,
        }
    }
}

#[async_trait]
impl PermissionGate for ChannelGate {
    async fn authorize(&self, cancel: &CancelToken, call: &ToolCall) -> bool {
        if !(self.needs_approval)(call) {
            return true;
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let request = PermissionRequest {
            call: call.clone(),
            respond: tx,
        };
        if self.requests.send(request).await.is_err() {
            return false;
        }
        tokio::select! {
            decision = rx => decision.unwrap_or(false),
            _ = cancel.cancelled() => false,
        }
    }
}

/// The single-task controller.
pub struct AgentLoop {
    client: Arc<dyn LLMClient>,
    tools: Arc<ToolRegistry>,
    max_loops: usize,
    state_dir: Option<PathBuf>,
    handler: Option<Arc<dyn EventHandler>>,
    system_prompt_fn: Option<SystemPromptFn>,
    validator: Option<ResponseValidator>,
    tool_filter: Option<ToolFilter>,
    permission_gate: Arc<dyn PermissionGate>,
    prelude: Vec<AgentMessage>,
}

impl AgentLoop {
    pub fn new(client: Arc<dyn LLMClient>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            client,
            tools,
            max_loops: DEFAULT_MAX_LOOPS,
            state_dir: None,
            handler: None,
            system_prompt_fn: None,
            validator: None,
            tool_filter: None,
            permission_gate: Arc::new(AllowAll),
            prelude: Vec::new(),
        }
    }

    /// Override the iteration budget (builder pattern).
    pub fn with_max_loops(mut self, max_loops: usize) -> Self {
        self.max_loops = max_loops.max(1);
        self
    }

    /// Spill state to `<dir>/<task_id>.json` after each iteration.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_system_prompt_fn(mut self, f: SystemPromptFn) -> Self {
        self.system_prompt_fn = Some(f);
        self
    }

    /// Enforce a shape on the final answer; rejected answers nudge the
    /// model with the validator's guidance and the loop continues.
    pub fn with_validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_tool_filter(mut self, filter: ToolFilter) -> Self {
        self.tool_filter = Some(filter);
        self
    }

    pub fn with_permission_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.permission_gate = gate;
        self
    }

    /// Messages injected after the task: session memory, companion
    /// findings, and similar caller-provided context.
    pub fn with_prelude(mut self, prelude: Vec<AgentMessage>) -> Self {
        self.prelude = prelude;
        self
    }

    /// Best-effort state spill; failures are logged and ignored.
    fn persist(&self, state: &AgentState) {
        let dir = match &self.state_dir {
            Some(dir) => dir,
            None => return,
        };
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}.json", state.task_id));
            let body = serde_json::to_vec_pretty(state)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            std::fs::write(path, body)
        };
        if let Err(err) = write() {
            debug!("state spill failed for {}: {}", state.task_id, err);
        }
    }

    /// Drive the task to completion or to the iteration budget.
    pub async fn execute(&self, cancel: &CancelToken, task: &str) -> AgentState {
        let mut state = AgentState::new(task, self.max_loops);

        let system = match &self.system_prompt_fn {
            Some(f) => f(&self.tools),
            None => default_system_prompt(&self.tools),
        };
        state.messages.push(AgentMessage::system(system));
        state.messages.push(AgentMessage::user(task));
        for message in &self.prelude {
            state.messages.push(message.clone());
        }

        while state.iteration < state.max_loops && !state.completed {
            if cancel.is_cancelled() {
                state.final_output = "cancelled".to_string();
                break;
            }
            self.persist(&state);
            emit(
                &self.handler,
                ProgressEvent::LoopIteration {
                    task_id: state.task_id.clone(),
                    iteration: state.iteration,
                },
            )
            .await;

            let prompt = render_prompt(&state.messages);
            let llm_started = Instant::now();
            let response = match self.client.complete(cancel, &prompt).await {
                Ok(text) => text,
                Err(err) => {
                    warn!("LLM call failed in loop: {}", err);
                    state
                        .messages
                        .push(AgentMessage::assistant(format!("[error] {}", err.user_message())));
                    state.final_output = err.user_message();
                    break;
                }
            };
            emit(
                &self.handler,
                ProgressEvent::LoopLlmCall {
                    task_id: state.task_id.clone(),
                    iteration: state.iteration,
                    duration_ms: llm_started.elapsed().as_millis() as u64,
                },
            )
            .await;

            match parse_response(&response) {
                ParsedResponse::FinalText(text) => {
                    state.messages.push(AgentMessage::assistant(&response));
                    if let Some(validator) = &self.validator {
                        if let Err(guidance) = validator(&text) {
                            emit(
                                &self.handler,
                                ProgressEvent::ValidatorRejected {
                                    task_id: state.task_id.clone(),
                                    guidance: guidance.clone(),
                                },
                            )
                            .await;
                            state.messages.push(AgentMessage::user(guidance));
                            state.iteration += 1;
                            continue;
                        }
                    }
                    state.completed = true;
                    state.final_output = text;
                }
                ParsedResponse::ToolCalls(calls) => {
                    let mut assistant = AgentMessage::assistant(&response);
                    assistant.tool_calls = calls.clone();
                    state.messages.push(assistant);

                    for call in calls {
                        let result = self.run_one_call(cancel, &state.task_id, &call).await;
                        let observation = if result.success {
                            format!("Tool {} output:\n{}", call.name, result.output)
                        } else {
                            format!(
                                "Tool {} failed: {}",
                                call.name,
                                result.error.as_deref().unwrap_or("unknown error")
                            )
                        };
                        let mut message = AgentMessage::user(observation);
                        message.tool_results = vec![result.clone()];
                        state.messages.push(message);
                        state.results.push(result);
                    }
                    state.iteration += 1;
                }
            }
        }

        if !state.completed && state.final_output.is_empty() {
            state.final_output = ITERATION_LIMIT_MARKER.to_string();
        }
        state.ended_at = Some(Utc::now());
        self.persist(&state);
        state
    }

    /// Filter, gate, and dispatch a single tool call.
    async fn run_one_call(
        &self,
        cancel: &CancelToken,
        task_id: &str,
        call: &ToolCall,
    ) -> ToolResult {
        if let Some(filter) = &self.tool_filter {
            if !filter(call) {
                return ToolResult::failure(
                    &call.id,
                    format!("tool {} is not permitted in this mode", call.name),
                    0,
                );
            }
        }

        emit(
            &self.handler,
            ProgressEvent::PermissionRequested {
                task_id: task_id.to_string(),
                tool: call.name.clone(),
                summary: summarize_call(call),
            },
        )
        .await;
        let allowed = self.permission_gate.authorize(cancel, call).await;
        emit(
            &self.handler,
            ProgressEvent::PermissionDecided {
                task_id: task_id.to_string(),
                allowed,
            },
        )
        .await;
        if !allowed {
            return ToolResult::failure(&call.id, "permission denied", 0);
        }

        emit(
            &self.handler,
            ProgressEvent::ToolCallStarted {
                task_id: task_id.to_string(),
                call_id: call.id.clone(),
                tool: call.name.clone(),
            },
        )
        .await;
        let result = self.tools.dispatch(cancel, call).await;
        emit(
            &self.handler,
            ProgressEvent::ToolCallFinished {
                task_id: task_id.to_string(),
                call_id: call.id.clone(),
                tool: call.name.clone(),
                success: result.success,
                duration_ms: result.duration_ms,
            },
        )
        .await;
        result
    }
}

fn summarize_call(call: &ToolCall) -> String {
    let args = call.arguments.to_string();
    let preview: String = args.chars().take(120).collect();
    format!("{} {}", call.name, preview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eai::llm_client::LLMError;
    use crate::eai::tool_protocol::{Tool, ToolError, ToolMetadata};
    use serde_json::json;
    use std::sync::Mutex;

    /// Client that replays a fixed script of responses.
    struct ScriptedClient {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(|s| s.to_string()).rev().collect()),
            }
        }
    }

    #[async_trait]
    impl LLMClient for ScriptedClient {
        async fn complete(
            &self,
            _cancel: &CancelToken,
            _prompt: &str,
        ) -> Result<String, LLMError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| LLMError::from_text("script exhausted"))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct CountingTool {
        meta: ToolMetadata,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn metadata(&self) -> &ToolMetadata {
            &self.meta
        }

        async fn execute(
            &self,
            _cancel: &CancelToken,
            _arguments: serde_json::Value,
        ) -> Result<String, ToolError> {
            Ok("counted".to_string())
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new(vec![Arc::new(CountingTool {
            meta: ToolMetadata::new("count", "Counts", json!({})),
        })]))
    }

    #[tokio::test]
    async fn completes_on_plain_response() {
        let client = Arc::new(ScriptedClient::new(vec!["All done."]));
        let agent = AgentLoop::new(client, registry());
        let state = agent.execute(&CancelToken::never(), "do nothing").await;
        assert!(state.completed);
        assert_eq!(state.final_output, "All done.");
        assert!(state.results.is_empty());
    }

    #[tokio::test]
    async fn runs_tools_then_completes() {
        let client = Arc::new(ScriptedClient::new(vec![
            "{\"tool_calls\":[{\"id\":\"c1\",\"name\":\"count\",\"arguments\":{}}]}",
            "Finished after counting.",
        ]));
        let agent = AgentLoop::new(client, registry());
        let state = agent.execute(&CancelToken::never(), "count something").await;
        assert!(state.completed);
        assert_eq!(state.final_output, "Finished after counting.");
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].call_id, "c1");
        // Every result correlates with a prior parsed tool call.
        let parsed_ids: Vec<&str> = state
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
            .collect();
        assert!(parsed_ids.contains(&state.results[0].call_id.as_str()));
        // One observation message per tool result.
        let observation_count = state
            .messages
            .iter()
            .filter(|m| !m.tool_results.is_empty())
            .count();
        assert_eq!(observation_count, state.results.len());
    }

    #[tokio::test]
    async fn iteration_budget_ends_the_loop() {
        let tool_call = "{\"tool_calls\":[{\"id\":\"c1\",\"name\":\"count\",\"arguments\":{}}]}";
        let client = Arc::new(ScriptedClient::new(vec![tool_call; 5]));
        let agent = AgentLoop::new(client, registry()).with_max_loops(3);
        let state = agent.execute(&CancelToken::never(), "loop forever").await;
        assert!(!state.completed);
        assert_eq!(state.iteration, 3);
        assert_eq!(state.final_output, ITERATION_LIMIT_MARKER);
    }

    #[tokio::test]
    async fn validator_nudges_until_satisfied() {
        let client = Arc::new(ScriptedClient::new(vec![
            "Here is a partial answer",
            "APPROVED final answer",
        ]));
        let validator: ResponseValidator = Arc::new(|text: &str| {
            if text.contains("APPROVED") {
                Ok(())
            } else {
                Err("Your answer must contain the word APPROVED.".to_string())
            }
        });
        let agent = AgentLoop::new(client, registry()).with_validator(validator);
        let state = agent.execute(&CancelToken::never(), "answer").await;
        assert!(state.completed);
        assert!(state.final_output.contains("APPROVED"));
        // The nudge appears in the log as a user message.
        assert!(state
            .messages
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("APPROVED")));
    }

    #[tokio::test]
    async fn llm_error_breaks_the_loop() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let agent = AgentLoop::new(client, registry());
        let state = agent.execute(&CancelToken::never(), "anything").await;
        assert!(!state.completed);
        assert!(state
            .messages
            .iter()
            .any(|m| m.role == Role::Assistant && m.content.starts_with("[error]")));
    }

    #[tokio::test]
    async fn tool_filter_blocks_execution() {
        let client = Arc::new(ScriptedClient::new(vec![
            "{\"tool_calls\":[{\"id\":\"c1\",\"name\":\"count\",\"arguments\":{}}]}",
            "Done without the tool.",
        ]));
        let filter: ToolFilter = Arc::new(|_call: &ToolCall| false);
        let agent = AgentLoop::new(client, registry()).with_tool_filter(filter);
        let state = agent.execute(&CancelToken::never(), "try the tool").await;
        assert!(state.completed);
        assert_eq!(state.results.len(), 1);
        assert!(!state.results[0].success);
        assert!(state.results[0]
            .error
            .as_ref()
            .unwrap()
            .contains("not permitted"));
    }

    #[tokio::test]
    async fn state_spills_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec!["ok"]));
        let agent = AgentLoop::new(client, registry()).with_state_dir(dir.path());
        let state = agent.execute(&CancelToken::never(), "spill").await;
        let path = dir.path().join(format!("{}.json", state.task_id));
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("\"completed\": true"));
    }

    #[test]
    fn prompt_renders_bracketed_roles() {
        let messages = vec![
            AgentMessage::system("be brief"),
            AgentMessage::user("hello"),
            AgentMessage::assistant("hi"),
        ];
        let prompt = render_prompt(&messages);
        assert_eq!(prompt, "[system]\nbe brief\n\n[user]\nhello\n\n[assistant]\nhi");
    }
}
