//! LLM client contract and transport-error policy.
//!
//! The engine never speaks a wire format. Any backend that can turn a
//! rendered prompt into text is plugged in through the [`LLMClient`] trait;
//! the concrete HTTP client lives in the host product. What *does* live
//! here is everything the engine needs to reason about failures:
//!
//! - [`LLMErrorKind`]: the error taxonomy the rest of the engine branches on
//!   (transient vs. permanent vs. context overflow vs. cancellation).
//! - [`classify_error_text`]: substring heuristics mapping raw provider
//!   error text onto that taxonomy.
//! - [`RetryingClient`]: an exponential-backoff decorator retrying only
//!   transient failures.
//! - [`summarize_error_body`]: keeps raw provider bodies out of the UI by
//!   whitespace-normalising and ellipsising them to 240 chars.
//!
//! # Example
//!
//! ```rust,no_run
//! use eai::{CancelToken, LLMClient, RetryingClient};
//! use std::sync::Arc;
//!
//! # async fn demo(backend: Arc<dyn LLMClient>) {
//! let client = RetryingClient::new(backend, 3);
//! let cancel = CancelToken::never();
//! let text = client.complete(&cancel, "Say hello.").await;
//! # let _ = text;
//! # }
//! ```

use crate::eai::cancel::CancelToken;
use async_trait::async_trait;
use log::warn;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Conversational roles used in rendered prompts and stored messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Bracketed label used when rendering a message log into prompt text.
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "[system]",
            Role::User => "[user]",
            Role::Assistant => "[assistant]",
        }
    }
}

/// Error taxonomy for LLM transport failures.
///
/// Kinds, not types: every provider error is folded into one of these
/// buckets and the engine branches on the bucket alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LLMErrorKind {
    /// No API key (or equivalent) configured. Surfaced as a short
    /// actionable message, never raised.
    ConfigMissing,
    /// The caller's cancellation token fired.
    Cancelled,
    /// Retryable: rate limits, 5xx, resets, timeouts, generic I/O.
    Transient,
    /// Non-retryable: exhausted balance, auth failures, unknown model.
    Permanent,
    /// The prompt exceeded the model's context window.
    ContextOverflow,
}

/// A transport-level LLM failure with its classified kind.
#[derive(Debug, Clone)]
pub struct LLMError {
    pub kind: LLMErrorKind,
    pub message: String,
}

impl LLMError {
    pub fn new(kind: LLMErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error by classifying raw provider error text.
    pub fn from_text(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_error_text(&message),
            message,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(LLMErrorKind::Cancelled, "request cancelled")
    }

    pub fn config_missing(message: impl Into<String>) -> Self {
        Self::new(LLMErrorKind::ConfigMissing, message)
    }

    /// Whether the transport layer may retry this failure.
    pub fn is_retryable(&self) -> bool {
        self.kind == LLMErrorKind::Transient
    }

    /// Short, UI-safe rendition of the error.
    pub fn user_message(&self) -> String {
        summarize_error_body(&self.message)
    }
}

impl fmt::Display for LLMError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, summarize_error_body(&self.message))
    }
}

impl Error for LLMError {}

/// Substring heuristics mapping raw error text onto [`LLMErrorKind`].
///
/// Order matters: overflow markers are checked before permanent ones so a
/// provider message like "400: prompt is too long" triggers compaction
/// instead of aborting the turn.
pub fn classify_error_text(text: &str) -> LLMErrorKind {
    let lower = text.to_lowercase();

    const OVERFLOW: &[&str] = &[
        "context length",
        "context_length",
        "maximum context",
        "prompt is too long",
        "token limit",
        "too many tokens",
        "input is too long",
    ];
    const PERMANENT: &[&str] = &[
        "insufficient balance",
        "no resource package",
        "invalid api key",
        "incorrect api key",
        "unauthorized",
        "authentication",
        "model not found",
        "unknown model",
        "unsupported model",
    ];
    const TRANSIENT: &[&str] = &[
        "429",
        "too many requests",
        "rate limit",
        "500",
        "502",
        "503",
        "504",
        "bad gateway",
        "service unavailable",
        "gateway timeout",
        "timeout",
        "timed out",
        "connection reset",
        "reset by peer",
        "broken pipe",
        "unexpected eof",
        "temporarily",
        "overloaded",
        "connection refused",
        "i/o error",
        "io error",
        "error sending request",
    ];

    if lower.contains("cancel") {
        return LLMErrorKind::Cancelled;
    }
    if OVERFLOW.iter().any(|m| lower.contains(m)) {
        return LLMErrorKind::ContextOverflow;
    }
    if PERMANENT.iter().any(|m| lower.contains(m)) {
        return LLMErrorKind::Permanent;
    }
    if TRANSIENT.iter().any(|m| lower.contains(m)) {
        return LLMErrorKind::Transient;
    }
    LLMErrorKind::Permanent
}

/// Whitespace-normalise and ellipsise an error body to at most 240 chars
/// so raw JSON payloads never reach the terminal UI.
pub fn summarize_error_body(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= 240 {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(239).collect();
    out.push('…');
    out
}

/// Callback receiving streamed reasoning fragments during a completion.
pub type ReasoningObserver<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Contract between the engine and an LLM backend.
///
/// Implementations are expected to honour the cancellation token by
/// aborting the underlying request; the engine treats a completion that
/// returns after cancellation as if it had failed with
/// [`LLMErrorKind::Cancelled`].
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Turn a fully rendered prompt into text.
    async fn complete(&self, cancel: &CancelToken, prompt: &str) -> Result<String, LLMError>;

    /// Like [`complete`](LLMClient::complete), but forwards streamed
    /// reasoning fragments to `on_reasoning` as they arrive. The default
    /// implementation falls back to a non-streaming call.
    async fn complete_with_observer(
        &self,
        cancel: &CancelToken,
        prompt: &str,
        on_reasoning: ReasoningObserver<'_>,
    ) -> Result<String, LLMError> {
        let text = self.complete(cancel, prompt).await?;
        on_reasoning(&text);
        Ok(text)
    }

    /// Model identifier, used in cache keys and progress labels.
    fn model_name(&self) -> &str;

    /// The model's context window in tokens. Overridable via
    /// `EAI_CONTEXT_WINDOW_TOKENS` at the configuration layer.
    fn context_window_tokens(&self) -> usize {
        128_000
    }
}

/// Backoff-retry decorator for [`LLMClient`] implementations.
///
/// Retries only [`LLMErrorKind::Transient`] failures, sleeping 1, 2, 4, …
/// seconds (capped at 30) between attempts. Permanent errors, context
/// overflow, and cancellation abort immediately.
pub struct RetryingClient {
    inner: Arc<dyn LLMClient>,
    max_retries: usize,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn LLMClient>, max_retries: usize) -> Self {
        Self { inner, max_retries }
    }

    async fn backoff(&self, cancel: &CancelToken, attempt: usize) -> Result<(), LLMError> {
        let secs = 1u64.checked_shl(attempt as u32).unwrap_or(30).min(30);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => Ok(()),
            _ = cancel.cancelled() => Err(LLMError::cancelled()),
        }
    }
}

#[async_trait]
impl LLMClient for RetryingClient {
    async fn complete(&self, cancel: &CancelToken, prompt: &str) -> Result<String, LLMError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(cancel, prompt).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        "transient LLM failure (attempt {}/{}): {}",
                        attempt + 1,
                        self.max_retries,
                        err.user_message()
                    );
                    self.backoff(cancel, attempt).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn complete_with_observer(
        &self,
        cancel: &CancelToken,
        prompt: &str,
        on_reasoning: ReasoningObserver<'_>,
    ) -> Result<String, LLMError> {
        let mut attempt = 0;
        loop {
            match self
                .inner
                .complete_with_observer(cancel, prompt, on_reasoning)
                .await
            {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        "transient LLM failure (attempt {}/{}): {}",
                        attempt + 1,
                        self.max_retries,
                        err.user_message()
                    );
                    self.backoff(cancel, attempt).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn context_window_tokens(&self) -> usize {
        self.inner.context_window_tokens()
    }
}

/// Placeholder client used when no backend has been wired.
///
/// Every call fails with [`LLMErrorKind::ConfigMissing`] and a short
/// actionable message. The pane-worker binary uses this so a misconfigured
/// worker still reports through the result-file protocol instead of
/// crashing.
pub struct UnconfiguredClient {
    model: String,
}

impl UnconfiguredClient {
    pub fn new() -> Self {
        Self {
            model: "unconfigured".to_string(),
        }
    }
}

impl Default for UnconfiguredClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMClient for UnconfiguredClient {
    async fn complete(&self, _cancel: &CancelToken, _prompt: &str) -> Result<String, LLMError> {
        Err(LLMError::config_missing(
            "No API key configured. Set EAI_API_KEY and restart.",
        ))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyClient {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl LLMClient for FlakyClient {
        async fn complete(
            &self,
            _cancel: &CancelToken,
            _prompt: &str,
        ) -> Result<String, LLMError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(LLMError::from_text("503 service unavailable"))
            } else {
                Ok("ok".to_string())
            }
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn classification_buckets() {
        assert_eq!(
            classify_error_text("429 Too Many Requests"),
            LLMErrorKind::Transient
        );
        assert_eq!(
            classify_error_text("error: insufficient balance"),
            LLMErrorKind::Permanent
        );
        assert_eq!(
            classify_error_text("the prompt is too long for this model"),
            LLMErrorKind::ContextOverflow
        );
        assert_eq!(
            classify_error_text("request cancelled by caller"),
            LLMErrorKind::Cancelled
        );
        assert_eq!(classify_error_text("weird unknown"), LLMErrorKind::Permanent);
    }

    #[test]
    fn overflow_beats_permanent_markers() {
        // A message carrying both markers must trigger compaction, not abort.
        assert_eq!(
            classify_error_text("authentication ok but context length exceeded"),
            LLMErrorKind::ContextOverflow
        );
    }

    #[test]
    fn error_bodies_are_summarised() {
        let raw = format!("{{\"error\":\n  \"{}\"}}", "x".repeat(500));
        let summary = summarize_error_body(&raw);
        assert!(summary.chars().count() <= 240);
        assert!(summary.ends_with('…'));
        assert!(!summary.contains('\n'));
    }

    #[tokio::test]
    async fn retrying_client_retries_transient() {
        let inner = Arc::new(FlakyClient {
            calls: AtomicUsize::new(0),
            fail_first: 1,
        });
        let client = RetryingClient::new(inner.clone(), 3);
        let out = client
            .complete(&CancelToken::never(), "hi")
            .await
            .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retrying_client_aborts_on_permanent() {
        struct Broke;
        #[async_trait]
        impl LLMClient for Broke {
            async fn complete(
                &self,
                _cancel: &CancelToken,
                _prompt: &str,
            ) -> Result<String, LLMError> {
                Err(LLMError::from_text("insufficient balance"))
            }
            fn model_name(&self) -> &str {
                "broke"
            }
        }
        let client = RetryingClient::new(Arc::new(Broke), 5);
        let err = client
            .complete(&CancelToken::never(), "hi")
            .await
            .unwrap_err();
        assert_eq!(err.kind, LLMErrorKind::Permanent);
    }
}
