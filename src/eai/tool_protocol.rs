//! Tool registry and invocation records.
//!
//! Tools are the only way the agent loop touches the host environment.
//! Each tool declares [`ToolMetadata`] (name, description, JSON-schema
//! shaped parameter document) and implements the [`Tool`] trait. A
//! [`ToolRegistry`] holds a fixed set of tools and is immutable after
//! construction; the read-only agent variant is simply a registry built
//! without the mutating tools.
//!
//! Execution flows through [`ToolRegistry::dispatch`], which correlates a
//! [`ToolCall`] with its [`ToolResult`], measures duration, and folds every
//! failure into the result record. Tools never raise out-of-band: a
//! missing tool, malformed arguments, and execution failures all come back
//! as a `ToolResult` with `success == false`.

use crate::eai::cancel::CancelToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A structured tool invocation extracted from an LLM response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id; matched by the corresponding [`ToolResult`].
    pub id: String,
    /// Registered tool name.
    pub name: String,
    /// Opaque structured arguments forwarded to the tool.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of executing one [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Correlation id of the originating call.
    pub call_id: String,
    /// Whether the tool ran to completion without error.
    pub success: bool,
    /// Textual output shown to the model.
    pub output: String,
    /// Error text when `success` is false.
    pub error: Option<String>,
    /// Wall-clock execution time in milliseconds.
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output: output.into(),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(call_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Static description of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Unique tool name (e.g. `"shell_execute"`).
    pub name: String,
    /// Human description embedded into system prompts.
    pub description: String,
    /// JSON-schema shaped parameter document.
    pub parameters: serde_json::Value,
}

impl ToolMetadata {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Failure modes of tool execution.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Arguments were missing, of the wrong type, or otherwise malformed.
    InvalidArguments(String),
    /// The tool ran but failed: non-zero exit, missing file, denied command.
    ExecFailure(String),
    /// A unified-diff hunk failed to match, with the 1-based file line.
    PatchMismatch { line: usize, detail: String },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::InvalidArguments(msg) => write!(f, "invalid arguments: {}", msg),
            ToolError::ExecFailure(msg) => write!(f, "{}", msg),
            ToolError::PatchMismatch { line, detail } => {
                write!(f, "patch mismatch at line {}: {}", line, detail)
            }
        }
    }
}

impl Error for ToolError {}

/// An executable tool bound into a registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static metadata; immutable after registration.
    fn metadata(&self) -> &ToolMetadata;

    /// Run the tool. Output is the text shown back to the model.
    async fn execute(
        &self,
        cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError>;
}

/// Fixed catalog of tools available to one agent.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Build a registry from a fixed tool set. Later duplicates replace
    /// earlier entries.
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut map = BTreeMap::new();
        for tool in tools {
            map.insert(tool.metadata().name.clone(), tool);
        }
        Self { tools: map }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Registered tool names in stable (sorted) order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Metadata for every registered tool in stable order.
    pub fn list(&self) -> Vec<&ToolMetadata> {
        self.tools.values().map(|t| t.metadata()).collect()
    }

    /// Render the tool catalog as a prompt block: one line per tool plus
    /// its parameter schema.
    pub fn describe_for_prompt(&self) -> String {
        let mut out = String::from("Available tools:\n");
        for meta in self.list() {
            out.push_str(&format!("- {}: {}\n", meta.name, meta.description));
            if !meta.parameters.is_null() {
                out.push_str(&format!("  parameters: {}\n", meta.parameters));
            }
        }
        out
    }

    /// Execute a call, correlating the result and measuring duration.
    ///
    /// Never returns an error: unknown tools and failed executions are
    /// reported inside the [`ToolResult`].
    pub async fn dispatch(&self, cancel: &CancelToken, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        let tool = match self.tools.get(&call.name) {
            Some(tool) => tool,
            None => {
                return ToolResult::failure(
                    &call.id,
                    format!("unknown tool: {}", call.name),
                    started.elapsed().as_millis() as u64,
                );
            }
        };
        match tool.execute(cancel, call.arguments.clone()).await {
            Ok(output) => {
                ToolResult::success(&call.id, output, started.elapsed().as_millis() as u64)
            }
            Err(err) => ToolResult::failure(
                &call.id,
                err.to_string(),
                started.elapsed().as_millis() as u64,
            ),
        }
    }
}

// Argument extraction helpers shared by the built-in tools.

pub(crate) fn arg_str(args: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing string argument {:?}", key)))
}

pub(crate) fn arg_str_opt(args: &serde_json::Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub(crate) fn arg_u64_opt(args: &serde_json::Value, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool {
        meta: ToolMetadata,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn metadata(&self) -> &ToolMetadata {
            &self.meta
        }

        async fn execute(
            &self,
            _cancel: &CancelToken,
            arguments: serde_json::Value,
        ) -> Result<String, ToolError> {
            arg_str(&arguments, "text")
        }
    }

    fn echo_registry() -> ToolRegistry {
        ToolRegistry::new(vec![Arc::new(EchoTool {
            meta: ToolMetadata::new(
                "echo",
                "Echo the text argument",
                json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            ),
        })])
    }

    #[tokio::test]
    async fn dispatch_correlates_ids() {
        let registry = echo_registry();
        let call = ToolCall::new("c1", "echo", json!({"text": "hello"}));
        let result = registry
            .dispatch(&CancelToken::never(), &call)
            .await;
        assert_eq!(result.call_id, "c1");
        assert!(result.success);
        assert_eq!(result.output, "hello");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_result_error() {
        let registry = echo_registry();
        let call = ToolCall::new("c2", "nope", json!({}));
        let result = registry.dispatch(&CancelToken::never(), &call).await;
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_a_result_error() {
        let registry = echo_registry();
        let call = ToolCall::new("c3", "echo", json!({"wrong": 1}));
        let result = registry.dispatch(&CancelToken::never(), &call).await;
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("invalid arguments"));
    }

    #[test]
    fn prompt_description_lists_every_tool() {
        let registry = echo_registry();
        let prompt = registry.describe_for_prompt();
        assert!(prompt.contains("- echo: Echo the text argument"));
        assert!(prompt.contains("parameters:"));
    }
}
