//! Context estimation and session compaction.
//!
//! Before each turn the engine builds a representative prompt (system
//! prompt, a trimmed history window, the latest input) and estimates its
//! token count as `max(bytes / 3, chars / 2)`. The formula deliberately
//! over-estimates; the numbers are surfaced as first-class
//! [`ContextEstimate`] data so UIs can render them without re-deriving.
//!
//! When the estimate reaches 90% of the model's context window, the
//! session is compacted: the LLM is asked for a bounded Markdown summary
//! of the conversation, a *child* session is created carrying that
//! summary, and the turn continues in the child. The parent and its
//! messages are never touched. When the summarisation call fails, a
//! deterministic heuristic summary built from the most recent exchanges
//! stands in.
//!
//! A context-overflow error mid-turn triggers the same compaction,
//! followed by a retry with the summary plus a short tail, and finally
//! with the summary plus the latest input alone.

use crate::eai::cancel::CancelToken;
use crate::eai::event::{emit, EventHandler, ProgressEvent};
use crate::eai::llm_client::{LLMClient, LLMError, LLMErrorKind};
use crate::eai::session::{MessageRole, Session, SessionStore, StoreError, StoredMessage};
use log::{info, warn};
use std::sync::Arc;

/// Compaction triggers at this fraction of the context window.
pub const COMPACTION_THRESHOLD_RATIO: f64 = 0.90;
/// At most this many recent messages enter the compaction transcript.
const COMPACT_MAX_MESSAGES: usize = 80;
/// Per-message truncation within the compaction transcript.
const COMPACT_PER_MESSAGE_CHARS: usize = 700;
/// Global cap on the compaction transcript.
const COMPACT_TOTAL_CHARS: usize = 22_000;
/// Upper bound on the summary length, in words.
const SUMMARY_MAX_WORDS: usize = 400;
/// History window used for the representative prompt.
const ESTIMATE_HISTORY_WINDOW: usize = 40;

/// Token estimate against the compaction threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextEstimate {
    pub estimated: usize,
    pub threshold: usize,
    pub percent: f64,
}

impl ContextEstimate {
    pub fn over_threshold(&self) -> bool {
        self.estimated >= self.threshold
    }
}

/// Deliberately pessimistic token estimate.
pub fn estimate_tokens(text: &str) -> usize {
    let bytes = text.len() / 3;
    let chars = text.chars().count() / 2;
    bytes.max(chars)
}

/// Build the representative prompt used for estimation: system prompt,
/// trimmed history window, and the latest input.
pub fn representative_prompt(
    system_prompt: &str,
    summary: Option<&str>,
    history: &[StoredMessage],
    input: &str,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.push(system_prompt.to_string());
    if let Some(summary) = summary {
        parts.push(format!("Session summary:\n{}", summary));
    }
    let window_start = history.len().saturating_sub(ESTIMATE_HISTORY_WINDOW);
    for message in &history[window_start..] {
        parts.push(format!("[{}]\n{}", message.role.as_str(), message.content));
    }
    parts.push(format!("[user]\n{}", input));
    parts.join("\n\n")
}

/// Rewrite bare continuation turns into an explicit instruction so the
/// model leans on session memory instead of asking for context again.
pub fn normalize_continuation(input: &str) -> String {
    let bare = input
        .trim()
        .trim_end_matches(|c: char| c == '.' || c == '!')
        .to_lowercase();
    match bare.as_str() {
        "continue" | "go on" | "keep going" => "Continue the active session task. Use the \
            session summary and recent conversation context for continuity. Do not ask the \
            user to re-paste context."
            .to_string(),
        _ => input.to_string(),
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Hard-trim a summary to the word cap.
fn trim_to_words(text: &str, cap: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= cap {
        return text.to_string();
    }
    words[..cap].join(" ")
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// The fixed compaction instruction.
fn compaction_prompt(existing_summary: Option<&str>, transcript: &str) -> String {
    let mut prompt = String::from(
        "Summarise the conversation below so a new session can continue the work.\n\
         Respond with at most 400 words of Markdown using exactly these sections:\n\
         ## Goal\n## Constraints\n## Decisions\n## Progress\n## Open Tasks\n## Relevant Files\n\n",
    );
    if let Some(summary) = existing_summary {
        prompt.push_str("Existing summary from an earlier compaction:\n");
        prompt.push_str(summary);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Conversation transcript (most recent last):\n");
    prompt.push_str(transcript);
    prompt
}

/// Render the recent history into the bounded compaction transcript.
fn compaction_transcript(history: &[StoredMessage]) -> String {
    let window_start = history.len().saturating_sub(COMPACT_MAX_MESSAGES);
    let mut transcript = String::new();
    for message in &history[window_start..] {
        let line = format!(
            "[{}] {}\n",
            message.role.as_str(),
            truncate_chars(&message.content, COMPACT_PER_MESSAGE_CHARS)
        );
        if transcript.chars().count() + line.chars().count() > COMPACT_TOTAL_CHARS {
            break;
        }
        transcript.push_str(&line);
    }
    transcript
}

/// Deterministic fallback summary built from the last few exchanges.
pub fn heuristic_summary(history: &[StoredMessage]) -> String {
    let first_user = history
        .iter()
        .find(|m| m.role == MessageRole::User)
        .map(|m| truncate_chars(&m.content, 200))
        .unwrap_or_else(|| "(no goal recorded)".to_string());

    let mut recent: Vec<String> = Vec::new();
    for message in history.iter().rev() {
        if matches!(message.role, MessageRole::User | MessageRole::Assistant) {
            recent.push(format!(
                "- [{}] {}",
                message.role.as_str(),
                truncate_chars(&message.content, 160)
            ));
        }
        if recent.len() == 6 {
            break;
        }
    }
    recent.reverse();

    format!(
        "## Goal\n{}\n\n## Constraints\n(unrecorded)\n\n## Decisions\n(unrecorded)\n\n\
         ## Progress\n{}\n\n## Open Tasks\n- Continue from the progress above\n\n\
         ## Relevant Files\n(unrecorded)",
        first_user,
        if recent.is_empty() {
            "(no exchanges)".to_string()
        } else {
            recent.join("\n")
        }
    )
}

/// Estimation and compaction for one engine instance.
pub struct ContextManager {
    client: Arc<dyn LLMClient>,
    store: Arc<dyn SessionStore>,
    context_window_tokens: usize,
    handler: Option<Arc<dyn EventHandler>>,
}

impl ContextManager {
    pub fn new(
        client: Arc<dyn LLMClient>,
        store: Arc<dyn SessionStore>,
        context_window_tokens: usize,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Self {
        Self {
            client,
            store,
            context_window_tokens: context_window_tokens.max(1),
            handler,
        }
    }

    /// Estimate the upcoming turn against the compaction threshold.
    pub fn estimate(
        &self,
        system_prompt: &str,
        session: &Session,
        history: &[StoredMessage],
        input: &str,
    ) -> ContextEstimate {
        let prompt = representative_prompt(
            system_prompt,
            session.context_summary.as_deref(),
            history,
            input,
        );
        let estimated = estimate_tokens(&prompt);
        let threshold =
            (self.context_window_tokens as f64 * COMPACTION_THRESHOLD_RATIO) as usize;
        ContextEstimate {
            estimated,
            threshold: threshold.max(1),
            percent: estimated as f64 / self.context_window_tokens as f64 * 100.0,
        }
    }

    /// Compact `session` into a new child carrying the summary. The
    /// parent row and its messages stay untouched.
    pub async fn compact(
        &self,
        cancel: &CancelToken,
        session: &Session,
        history: &[StoredMessage],
    ) -> Result<Session, StoreError> {
        emit(
            &self.handler,
            ProgressEvent::CompactionStarted {
                session_id: session.id.clone(),
            },
        )
        .await;

        let transcript = compaction_transcript(history);
        let prompt = compaction_prompt(session.context_summary.as_deref(), &transcript);

        let (summary, fallback) = match self.client.complete(cancel, &prompt).await {
            Ok(mut summary) => {
                if word_count(&summary) > SUMMARY_MAX_WORDS {
                    // One shortening pass, then a hard trim.
                    let shorten = format!(
                        "Shorten the following summary to at most 400 words. Keep the same \
                         section headings.\n\n{}",
                        summary
                    );
                    match self.client.complete(cancel, &shorten).await {
                        Ok(shorter) => summary = shorter,
                        Err(err) => warn!("summary shortening failed: {}", err),
                    }
                    summary = trim_to_words(&summary, SUMMARY_MAX_WORDS);
                }
                (summary, false)
            }
            Err(err) => {
                warn!("compaction summarisation failed, using heuristic: {}", err);
                (heuristic_summary(history), true)
            }
        };

        let child = self.store.create_child(session, &summary).await?;
        self.store
            .set_current_session(&session.workdir, &child.id)
            .await?;
        info!(
            "compacted session {} into child {} (chain {})",
            session.id, child.id, session.root_id
        );
        emit(
            &self.handler,
            ProgressEvent::CompactionFinished {
                parent_id: session.id.clone(),
                child_id: child.id.clone(),
                fallback,
            },
        )
        .await;
        Ok(child)
    }

    /// Run the pre-turn check: estimate, emit, and compact when over the
    /// threshold. Returns the session the turn should continue in.
    pub async fn maybe_compact(
        &self,
        cancel: &CancelToken,
        system_prompt: &str,
        session: Session,
        history: &[StoredMessage],
        input: &str,
    ) -> Result<Session, StoreError> {
        let estimate = self.estimate(system_prompt, &session, history, input);
        emit(
            &self.handler,
            ProgressEvent::ContextEstimated {
                estimated: estimate.estimated,
                threshold: estimate.threshold,
                percent: estimate.percent,
            },
        )
        .await;
        if !estimate.over_threshold() {
            return Ok(session);
        }
        self.compact(cancel, &session, history).await
    }

    /// Mid-turn recovery after a context-overflow error: compact, retry
    /// with summary plus a short tail, then with summary plus the latest
    /// input only.
    pub async fn recover_from_overflow(
        &self,
        cancel: &CancelToken,
        session: &Session,
        history: &[StoredMessage],
        input: &str,
    ) -> Result<(Session, String), LLMError> {
        let child = self
            .compact(cancel, session, history)
            .await
            .map_err(|e| LLMError::new(LLMErrorKind::Permanent, e.to_string()))?;
        let summary = child.context_summary.clone().unwrap_or_default();

        let tail_start = history.len().saturating_sub(6);
        let tail: String = history[tail_start..]
            .iter()
            .map(|m| format!("[{}] {}\n", m.role.as_str(), truncate_chars(&m.content, 400)))
            .collect();

        let first_retry = format!(
            "Session summary:\n{}\n\nRecent conversation:\n{}\n[user]\n{}",
            summary, tail, input
        );
        match self.client.complete(cancel, &first_retry).await {
            Ok(text) => return Ok((child, text)),
            Err(err) if err.kind == LLMErrorKind::ContextOverflow => {
                warn!("overflow persisted after compaction, dropping the tail");
            }
            Err(err) => return Err(err),
        }

        let last_retry = format!("Session summary:\n{}\n\n[user]\n{}", summary, input);
        let text = self.client.complete(cancel, &last_retry).await?;
        Ok((child, text))
    }
}
