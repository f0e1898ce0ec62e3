//! Turn routing.
//!
//! Given an interaction mode and the user's input, the router decides
//! which execution path handles the turn: a canned reply for trivial
//! greetings, the plan agent (read-only tools plus a checklist
//! validator), the tool agent (full tool set, optionally preceded by a
//! read-only companion fan-out), the full orchestrator, or a direct chat
//! completion with session history.
//!
//! A translation pre-pass runs first when auto-translate is enabled:
//! input that looks non-English (any non-ASCII letter, or too few common
//! English stopwords) is translated once, preserving code blocks, paths,
//! flags, and proper nouns. The translated text drives routing and
//! tool-mode execution; chat completion uses the original.

use crate::eai::agent_loop::{AgentLoop, AgentMessage, ResponseValidator};
use crate::eai::cancel::CancelToken;
use crate::eai::config::EngineConfig;
use crate::eai::context::{normalize_continuation, ContextManager};
use crate::eai::event::{emit, EventHandler, ProgressEvent};
use crate::eai::llm_client::{LLMClient, LLMErrorKind};
use crate::eai::orchestrator::Orchestrator;
use crate::eai::session::{MessageRole, Session, SessionStore, StoredMessage};
use crate::eai::splitter::desired_shard_count;
use crate::eai::tool_parser::extract_tool_calls;
use crate::eai::tool_protocol::ToolRegistry;
use crate::eai::tools::{full_toolset, read_only_toolset};
use futures_util::future::join_all;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

/// Interaction modes offered by the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Chat,
    Plan,
    Tool,
    Orchestrate,
}

impl Mode {
    pub fn parse(s: &str) -> Mode {
        match s.trim().to_lowercase().as_str() {
            "plan" => Mode::Plan,
            "tool" | "agent" | "execute" => Mode::Tool,
            "orchestrate" | "orchestrator" => Mode::Orchestrate,
            _ => Mode::Chat,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::Plan => "plan",
            Mode::Tool => "tool",
            Mode::Orchestrate => "orchestrate",
        }
    }
}

/// The execution path chosen for one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Short canned reply, no LLM call.
    Canned(String),
    /// Read-only discovery agent with the plan checklist validator.
    PlanAgent,
    /// Full tool agent.
    ToolAgent,
    /// Split/schedule/synthesize orchestration.
    Orchestrate,
    /// Direct completion with session history.
    Chat,
    /// Directory listing without an LLM.
    ListingFastpath,
}

const TRIVIAL_GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "yo", "hola", "sup", "hi there", "hello there", "good morning",
    "good afternoon", "good evening", "thanks", "thank you",
];

/// Verbs that mark a request as actionable work on the workspace.
const ACTION_VERBS: &[&str] = &[
    "create", "build", "fix", "implement", "add", "update", "refactor", "write", "run",
    "install", "configure", "deploy", "migrate", "rename", "move", "delete", "remove", "test",
    "generate", "convert", "optimize", "debug", "wire", "integrate", "setup", "set",
];

const ENGLISH_STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "to", "of", "in", "is", "it", "for", "on", "with", "that",
    "this", "as", "at", "be", "are", "was", "if", "do", "not", "my", "me", "you", "we",
];

lazy_static! {
    static ref PROPOSED_PLAN_RE: Regex =
        Regex::new(r"(?s)<proposed_plan>(.*?)</proposed_plan>").unwrap();
    static ref CHECKLIST_ITEM_RE: Regex = Regex::new(r"(?m)^\s*-\s*\[[ xX]\]\s+\S").unwrap();
    static ref LISTING_RE: Regex =
        Regex::new(r"(?i)^list (the )?files( in (this|the) (folder|directory))?\.?$").unwrap();
}

/// Trivial greeting with no actionable content.
pub fn is_trivial_greeting(input: &str) -> bool {
    let bare = input
        .trim()
        .trim_end_matches(|c: char| c == '!' || c == '.' || c == ',')
        .to_lowercase();
    TRIVIAL_GREETINGS.contains(&bare.as_str())
}

/// Whether the input asks for concrete work on the workspace.
pub fn is_actionable(input: &str) -> bool {
    let lower = input.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| ACTION_VERBS.contains(&word))
}

/// Non-English detection: any non-ASCII letter, or a long input with too
/// few common English stopwords.
pub fn looks_non_english(input: &str) -> bool {
    if input.chars().any(|c| c.is_alphabetic() && !c.is_ascii()) {
        return true;
    }
    let words: Vec<String> = input
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    if words.len() < 6 {
        return false;
    }
    let stopwords = words
        .iter()
        .filter(|w| ENGLISH_STOPWORDS.contains(&w.as_str()))
        .count();
    (stopwords as f64 / words.len() as f64) < 0.08
}

/// Final-response validator for plan mode: the answer must end with a
/// `<proposed_plan>` block containing a checklist of 4 to 10 items.
pub fn plan_response_validator() -> ResponseValidator {
    Arc::new(|text: &str| {
        let body = match PROPOSED_PLAN_RE.captures(text) {
            Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(""),
            None => {
                return Err(
                    "Your final answer must end with a <proposed_plan>…</proposed_plan> block \
                     containing a checklist of 4 to 10 items, each formatted as '- [ ] step'."
                        .to_string(),
                )
            }
        };
        let items = CHECKLIST_ITEM_RE.find_iter(body).count();
        if (4..=10).contains(&items) {
            Ok(())
        } else {
            Err(format!(
                "The <proposed_plan> checklist has {} items; it must contain between 4 and 10 \
                 '- [ ] step' items.",
                items
            ))
        }
    })
}

/// Pure routing decision.
pub fn decide_route(mode: Mode, input: &str, has_client: bool) -> Route {
    if mode != Mode::Chat && is_trivial_greeting(input) {
        return Route::Canned(
            "Hi! Tell me what you would like me to build, fix, or investigate in this workspace."
                .to_string(),
        );
    }
    match mode {
        Mode::Plan => Route::PlanAgent,
        Mode::Orchestrate => {
            if is_actionable(input) {
                Route::ToolAgent
            } else {
                Route::Orchestrate
            }
        }
        Mode::Tool => {
            if !has_client && LISTING_RE.is_match(input.trim()) {
                Route::ListingFastpath
            } else {
                Route::ToolAgent
            }
        }
        Mode::Chat => Route::Chat,
    }
}

/// Outcome of one routed turn.
pub struct TurnOutcome {
    pub text: String,
    /// The session the turn ended in; differs from the input session when
    /// compaction rolled over mid-turn.
    pub session: Option<Session>,
}

/// Entry point tying routing, agents, orchestration, and sessions
/// together for one engine instance.
pub struct Router {
    client: Option<Arc<dyn LLMClient>>,
    config: EngineConfig,
    workdir: PathBuf,
    store: Option<Arc<dyn SessionStore>>,
    handler: Option<Arc<dyn EventHandler>>,
    /// Shared across turns so repeated orchestrate requests hit the cache.
    orchestrate_cache: Arc<crate::eai::cache::ShardCache>,
}

impl Router {
    pub fn new(client: Option<Arc<dyn LLMClient>>, config: EngineConfig, workdir: PathBuf) -> Self {
        let orchestrate_cache = Arc::new(crate::eai::cache::ShardCache::new(config.cache_ttl));
        Self {
            client,
            config,
            workdir,
            store: None,
            handler: None,
            orchestrate_cache,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn context_window(&self, client: &Arc<dyn LLMClient>) -> usize {
        self.config
            .context_window_tokens
            .unwrap_or_else(|| client.context_window_tokens())
    }

    /// Route and execute one turn.
    pub async fn run_turn(
        &self,
        cancel: &CancelToken,
        mode: Mode,
        session: Option<Session>,
        input: &str,
    ) -> Result<TurnOutcome, Box<dyn Error + Send + Sync>> {
        let input = normalize_continuation(input);
        let original = input.clone();

        // Translation pre-pass: route and run tools on the translation,
        // chat on the original.
        let routed_text = if self.config.auto_translate {
            match (&self.client, looks_non_english(&input)) {
                (Some(client), true) => {
                    let translated = self.translate(cancel, client, &input).await;
                    emit(
                        &self.handler,
                        ProgressEvent::InputTranslated {
                            original_chars: input.chars().count(),
                        },
                    )
                    .await;
                    translated
                }
                _ => input.clone(),
            }
        } else {
            input.clone()
        };

        // Pre-turn context check.
        let mut session = session;
        let mut history: Vec<StoredMessage> = Vec::new();
        if let (Some(store), Some(current)) = (&self.store, session.clone()) {
            history = store.load_messages(&current.id).await?;
            if let Some(client) = &self.client {
                let manager = ContextManager::new(
                    Arc::clone(client),
                    Arc::clone(store),
                    self.context_window(client),
                    self.handler.clone(),
                );
                let continued = manager
                    .maybe_compact(cancel, "", current, &history, &routed_text)
                    .await?;
                // A fresh child starts with an empty message log.
                if session.as_ref().map(|s| s.id.clone()) != Some(continued.id.clone()) {
                    history = Vec::new();
                }
                session = Some(continued);
            }
        }

        let route = decide_route(mode, &routed_text, self.client.is_some());
        emit(
            &self.handler,
            ProgressEvent::RouteSelected {
                mode: mode.as_str().to_string(),
                route: format!("{:?}", route),
            },
        )
        .await;
        info!("routing {} turn via {:?}", mode.as_str(), route);

        let text = match &route {
            Route::Canned(reply) => reply.clone(),
            Route::ListingFastpath => self.listing_fastpath()?,
            Route::PlanAgent => self.run_plan_agent(cancel, &routed_text).await?,
            Route::ToolAgent => {
                self.run_tool_agent(cancel, &routed_text, session.as_ref(), &history)
                    .await?
            }
            Route::Orchestrate => {
                let client = self.require_client()?;
                let orchestrator =
                    Orchestrator::new(client, self.config.clone(), self.handler.clone())
                        .with_cache(Arc::clone(&self.orchestrate_cache));
                orchestrator
                    .execute_orchestrate(
                        cancel,
                        mode.as_str(),
                        &routed_text,
                        self.config.requested_agents,
                    )
                    .await?
            }
            Route::Chat => {
                self.run_chat(cancel, &original, session.as_mut(), &history)
                    .await?
            }
        };

        // Persist the exchange on the current session row.
        if let (Some(store), Some(current)) = (&self.store, &mut session) {
            if current.title.is_none() {
                current.title = Some(derive_title(&original));
                store.save_session(current).await?;
            }
            store
                .append_message(current, MessageRole::User, &original, Some(mode.as_str()))
                .await?;
            store
                .append_message(current, MessageRole::Assistant, &text, Some(mode.as_str()))
                .await?;
            store.push_prompt_history(&current.workdir, &original).await?;
        }

        Ok(TurnOutcome { text, session })
    }

    fn require_client(&self) -> Result<Arc<dyn LLMClient>, Box<dyn Error + Send + Sync>> {
        self.client.clone().ok_or_else(|| {
            Box::new(crate::eai::llm_client::LLMError::config_missing(
                "No API key configured. Set EAI_API_KEY and restart.",
            )) as Box<dyn Error + Send + Sync>
        })
    }

    async fn translate(
        &self,
        cancel: &CancelToken,
        client: &Arc<dyn LLMClient>,
        input: &str,
    ) -> String {
        let prompt = format!(
            "Translate the following text to English. Preserve code blocks, file paths, \
             command-line flags, and proper nouns exactly as written. Respond with only the \
             translation.\n\n{}",
            input
        );
        match client.complete(cancel, &prompt).await {
            Ok(translated) if !translated.trim().is_empty() => translated.trim().to_string(),
            _ => input.to_string(),
        }
    }

    fn listing_fastpath(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut entries: Vec<String> = std::fs::read_dir(&self.workdir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    format!("{}/", name)
                } else {
                    name
                }
            })
            .collect();
        entries.sort();
        Ok(entries.join("\n"))
    }

    async fn run_plan_agent(
        &self,
        cancel: &CancelToken,
        input: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let client = self.require_client()?;
        let tools = Arc::new(read_only_toolset(&self.workdir));
        let agent = AgentLoop::new(client, tools)
            .with_max_loops(12)
            .with_system_prompt_fn(Arc::new(plan_system_prompt))
            .with_validator(plan_response_validator());
        let agent = match &self.handler {
            Some(handler) => agent.with_event_handler(Arc::clone(handler)),
            None => agent,
        };
        let state = agent.execute(cancel, input).await;
        Ok(state.final_output)
    }

    async fn run_tool_agent(
        &self,
        cancel: &CancelToken,
        input: &str,
        session: Option<&Session>,
        history: &[StoredMessage],
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let client = self.require_client()?;
        let mut prelude: Vec<AgentMessage> = Vec::new();

        if self.config.tool_session_context {
            if let Some(session) = session {
                let mut memory = String::new();
                if let Some(summary) = &session.context_summary {
                    memory.push_str("Session summary:\n");
                    memory.push_str(summary);
                    memory.push('\n');
                }
                let tail_start = history.len().saturating_sub(10);
                for message in &history[tail_start..] {
                    memory.push_str(&format!(
                        "[{}] {}\n",
                        message.role.as_str(),
                        message.content
                    ));
                }
                if !memory.is_empty() {
                    prelude.push(AgentMessage::user(format!(
                        "Context from the ongoing session:\n{}",
                        memory
                    )));
                }
            }
        }

        if self.config.tool_companions && is_actionable(input) {
            if let Some(findings) = self.run_companions(cancel, &client, input).await {
                prelude.push(AgentMessage::user(findings));
            }
        }

        let tools = Arc::new(full_toolset(&self.workdir));
        let mut agent = AgentLoop::new(client, tools).with_prelude(prelude);
        if let Some(dir) = &self.config.state_dir {
            agent = agent.with_state_dir(dir.clone());
        }
        if let Some(handler) = &self.handler {
            agent = agent.with_event_handler(Arc::clone(handler));
        }
        let state = agent.execute(cancel, input).await;
        Ok(state.final_output)
    }

    /// Fan out read-only discovery companions and gather their reports as
    /// a prelude for the main tool agent.
    async fn run_companions(
        &self,
        cancel: &CancelToken,
        client: &Arc<dyn LLMClient>,
        input: &str,
    ) -> Option<String> {
        let budget = self.config.active_panes.min(20).max(2);
        let count = desired_shard_count(budget, input, 2);
        debug!("fanning out {} companions", count);
        emit(
            &self.handler,
            ProgressEvent::OrchestrateCompanions { active: count },
        )
        .await;

        let mut futures = Vec::new();
        for index in 0..count {
            let client = Arc::clone(client);
            let workdir = self.workdir.clone();
            let handler = self.handler.clone();
            let cancel = cancel.clone();
            let task = format!(
                "Investigate this workspace to prepare for the task below. Identify the \
                 relevant files, commands, and constraints. Do not modify anything.\n\nTask:\n{}",
                input
            );
            futures.push(async move {
                let tools = Arc::new(read_only_toolset(&workdir));
                let mut agent = AgentLoop::new(client, tools).with_max_loops(8);
                if let Some(handler) = handler.clone() {
                    agent = agent.with_event_handler(handler);
                }
                let state = agent.execute(&cancel, &task).await;
                let label = format!("Companion {}", index + 1);
                let report: String = state.final_output.chars().take(4000).collect();
                emit(
                    &handler,
                    ProgressEvent::CompanionReport {
                        label: label.clone(),
                        chars: report.chars().count(),
                    },
                )
                .await;
                (label, report)
            });
        }

        let reports = join_all(futures).await;
        emit(
            &self.handler,
            ProgressEvent::OrchestrateCompanions { active: 0 },
        )
        .await;
        let useful: Vec<(String, String)> = reports
            .into_iter()
            .filter(|(_, report)| !report.trim().is_empty())
            .collect();
        if useful.is_empty() {
            return None;
        }
        let mut findings = String::from("Companion findings:\n");
        for (label, report) in useful {
            findings.push_str(&format!("### {}\n{}\n", label, report));
        }
        Some(findings)
    }

    async fn run_chat(
        &self,
        cancel: &CancelToken,
        input: &str,
        session: Option<&mut Session>,
        history: &[StoredMessage],
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let client = self.require_client()?;

        let mut prompt = String::new();
        if let Some(session) = session.as_ref() {
            if let Some(summary) = &session.context_summary {
                prompt.push_str(&format!("Session summary:\n{}\n\n", summary));
            }
        }
        for message in history {
            prompt.push_str(&format!(
                "[{}]\n{}\n\n",
                message.role.as_str(),
                message.content
            ));
        }
        prompt.push_str(&format!("[user]\n{}", input));

        let response = match client.complete(cancel, &prompt).await {
            Ok(text) => text,
            Err(err) if err.kind == LLMErrorKind::ContextOverflow => {
                // Mid-turn recovery path.
                let (store, current) = match (&self.store, session) {
                    (Some(store), Some(current)) => (store, current),
                    _ => return Err(Box::new(err)),
                };
                let manager = ContextManager::new(
                    Arc::clone(&client),
                    Arc::clone(store),
                    self.context_window(&client),
                    self.handler.clone(),
                );
                let (child, text) = manager
                    .recover_from_overflow(cancel, current, history, input)
                    .await?;
                *current = child;
                return Ok(text);
            }
            Err(err) => return Err(Box::new(err)),
        };

        // Chat mode has no tools; a tool-call blob is replaced with
        // guidance instead of leaking JSON to the user.
        if !extract_tool_calls(&response).is_empty() {
            return Ok(
                "I tried to run a tool, but tools are not available in chat mode. Switch to \
                 tool mode to let me make changes or run commands."
                    .to_string(),
            );
        }
        Ok(response)
    }
}

/// Session titles come from the first user message: its first line,
/// clipped to 48 characters.
fn derive_title(input: &str) -> String {
    let first_line = input.lines().next().unwrap_or("").trim();
    let mut title: String = first_line.chars().take(48).collect();
    if first_line.chars().count() > 48 {
        title.push('…');
    }
    if title.is_empty() {
        "untitled session".to_string()
    } else {
        title
    }
}

/// System prompt for the plan agent: discovery only, checklist output.
fn plan_system_prompt(tools: &ToolRegistry) -> String {
    let mut prompt = String::from(
        "You are a planning agent. Investigate the workspace with the read-only tools below, \
         then propose a plan. Do not modify anything.\n\n",
    );
    prompt.push_str(&tools.describe_for_prompt());
    prompt.push_str(
        "\nTo use a tool, respond with exactly one JSON object:\n\
         {\"tool_calls\":[{\"id\":\"c1\",\"name\":\"<tool>\",\"arguments\":{...}}]}\n\
         \nYour final answer must end with a <proposed_plan>…</proposed_plan> block containing \
         a checklist of 4 to 10 items, each formatted as '- [ ] step'.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_detection() {
        assert!(is_trivial_greeting("hi"));
        assert!(is_trivial_greeting("  Hello!  "));
        assert!(is_trivial_greeting("thank you."));
        assert!(!is_trivial_greeting("hello, please fix the build"));
    }

    #[test]
    fn actionable_detection() {
        assert!(is_actionable("fix the failing test"));
        assert!(is_actionable("please BUILD the site"));
        assert!(!is_actionable("what does this project do?"));
    }

    #[test]
    fn non_english_detection() {
        assert!(looks_non_english("пожалуйста, исправь сборку проекта"));
        assert!(looks_non_english(
            "por favor arregla compilacion proyecto ahora mismo gracias"
        ));
        assert!(!looks_non_english("fix the build for me please"));
        // Short inputs never trigger the stopword heuristic.
        assert!(!looks_non_english("ok"));
    }

    #[test]
    fn routing_decision_table() {
        assert!(matches!(
            decide_route(Mode::Tool, "hi", true),
            Route::Canned(_)
        ));
        assert_eq!(
            decide_route(Mode::Orchestrate, "fix the build and run tests", true),
            Route::ToolAgent
        );
        assert_eq!(
            decide_route(Mode::Orchestrate, "summary of recent progress please", true),
            Route::Orchestrate
        );
        assert_eq!(decide_route(Mode::Plan, "improve the parser", true), Route::PlanAgent);
        assert_eq!(
            decide_route(Mode::Tool, "list files in this folder", false),
            Route::ListingFastpath
        );
        assert_eq!(
            decide_route(Mode::Tool, "list files in this folder", true),
            Route::ToolAgent
        );
        assert_eq!(decide_route(Mode::Chat, "how are you", true), Route::Chat);
    }

    #[test]
    fn plan_validator_enforces_checklist() {
        let validator = plan_response_validator();
        assert!(validator("no plan here").is_err());

        let short = "<proposed_plan>\n- [ ] one step\n- [ ] two step\n</proposed_plan>";
        assert!(validator(short).is_err());

        let good = "Summary first.\n<proposed_plan>\n- [ ] inspect the code\n- [ ] write the fix\n- [ ] add a test\n- [ ] run the suite\n- [x] confirm green\n</proposed_plan>";
        assert!(validator(good).is_ok());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(Mode::parse("plan"), Mode::Plan);
        assert_eq!(Mode::parse("TOOL"), Mode::Tool);
        assert_eq!(Mode::parse("orchestrate"), Mode::Orchestrate);
        assert_eq!(Mode::parse("anything else"), Mode::Chat);
    }
}
