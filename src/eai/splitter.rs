//! Task decomposition heuristics.
//!
//! Splits one user request into an ordered list of independent subtasks
//! bounded by a shard budget. Three strategies are tried in order, and the
//! first that yields at least two shards wins:
//!
//! 1. **Line split**: list-marker lines (`-`, `*`, `1.`, `(a)`, `step 2:`,
//!    `[ ]`, …) start shards; indented or continuation-prefixed lines fold
//!    into the current shard.
//! 2. **Connector split**: the most balanced cut on `" and then "`,
//!    `" and "`, `", then "`, `";"`, `" then "`, `" plus "`, or a newline.
//!    A cut is rejected when either side is under two words, when the cut
//!    is badly lopsided, when delimiters are unbalanced across it, when
//!    the right side opens with a subordinator or an anaphoric pronoun, or
//!    when either side ends with a dangling conjunction or comma.
//! 3. **Sentence split**: sentence boundaries with the same guards.
//!
//! Results are normalised (trimmed, whitespace-collapsed, case-insensitive
//! deduplicated, at least two words each) and truncated to the budget. A
//! complexity heuristic scales the *desired* shard count; when the
//! heuristics fall short the caller may expand via one LLM decomposition
//! call and finally pad with deterministic fallback subtasks.

use crate::eai::cancel::CancelToken;
use crate::eai::llm_client::LLMClient;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::sync::Arc;

lazy_static! {
    static ref LIST_MARKER_RE: Regex = Regex::new(
        r"(?i)^\s*(?:[-*+•]\s+|\d+[.)]\s+|\([a-z0-9]{1,3}\)\s+|[a-z][.)]\s+|step\s+\d+\s*:\s*|\[(?: |x)\]\s+)"
    )
    .unwrap();
    static ref SENTENCE_END_RE: Regex = Regex::new(r"[.!?]\s+").unwrap();
}

/// Connectors tried by the connector strategy, in priority order.
const CONNECTORS: &[&str] = &[" and then ", " and ", ", then ", ";", " then ", " plus ", "\n"];

/// Words that must not open the right side of a cut.
const SUBORDINATORS: &[&str] = &[
    "if", "when", "while", "because", "so", "then", "after", "before", "unless", "until",
    "although", "once", "where", "whereas",
];

/// Anaphoric pronouns that must not open the right side of a cut.
const ANAPHORS: &[&str] = &[
    "it", "its", "this", "that", "these", "those", "they", "them", "their", "he", "she",
];

/// Words that must not dangle at the end of either side.
const DANGLING: &[&str] = &["and", "or", "but", "then", "plus", "with", "to"];

/// Prefixes that mark a line as a continuation of the previous shard.
const CONTINUATION_PREFIXES: &[&str] = &[
    "and then", "and ", "then ", "if ", "when ", "while ", "so ", "also ", "otherwise",
    "because", "after that", "additionally",
];

/// Split `task` into at most `budget` subtasks.
pub fn split_task(task: &str, budget: usize) -> Vec<String> {
    let budget = budget.max(1);
    let task = task.trim();
    if task.is_empty() {
        return Vec::new();
    }

    for strategy in &[split_lines, split_connectors, split_sentences] {
        let shards = normalize_shards(strategy(task), budget);
        if shards.len() >= 2 {
            return shards;
        }
    }

    normalize_shards(vec![task.to_string()], budget)
}

// -- Strategy 1: line split -------------------------------------------------

fn split_lines(task: &str) -> Vec<String> {
    if !task.lines().any(|l| LIST_MARKER_RE.is_match(l)) {
        return Vec::new();
    }
    let mut shards: Vec<String> = Vec::new();
    for line in task.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if LIST_MARKER_RE.is_match(line) {
            shards.push(LIST_MARKER_RE.replace(line, "").trim().to_string());
            continue;
        }
        let lowered = line.trim().to_lowercase();
        let continuation = line.starts_with(char::is_whitespace)
            || CONTINUATION_PREFIXES.iter().any(|p| lowered.starts_with(p));
        match shards.last_mut() {
            Some(last) if continuation => {
                last.push(' ');
                last.push_str(line.trim());
            }
            _ => shards.push(line.trim().to_string()),
        }
    }
    shards
}

// -- Strategy 2: connector split --------------------------------------------

fn first_word(text: &str) -> String {
    text.split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

fn last_word(text: &str) -> String {
    text.split_whitespace()
        .last()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

fn balanced_delimiters(text: &str) -> bool {
    let mut round = 0i32;
    let mut square = 0i32;
    let mut curly = 0i32;
    let mut double_quotes = 0usize;
    let mut backticks = 0usize;
    for c in text.chars() {
        match c {
            '(' => round += 1,
            ')' => round -= 1,
            '[' => square += 1,
            ']' => square -= 1,
            '{' => curly += 1,
            '}' => curly -= 1,
            '"' => double_quotes += 1,
            '`' => backticks += 1,
            _ => {}
        }
    }
    round == 0 && square == 0 && curly == 0 && double_quotes % 2 == 0 && backticks % 2 == 0
}

fn valid_cut(left: &str, right: &str) -> bool {
    let left_words = left.split_whitespace().count();
    let right_words = right.split_whitespace().count();
    if left_words < 2 || right_words < 2 {
        return false;
    }
    // Reject badly lopsided cuts: each side carries at least a third of
    // the words.
    let total = left_words + right_words;
    if left_words.min(right_words) * 3 < total {
        return false;
    }
    if !balanced_delimiters(left) || !balanced_delimiters(right) {
        return false;
    }
    let opener = first_word(right);
    if SUBORDINATORS.contains(&opener.as_str()) || ANAPHORS.contains(&opener.as_str()) {
        return false;
    }
    for side in &[left, right] {
        if side.trim_end().ends_with(',') {
            return false;
        }
        if DANGLING.contains(&last_word(side).as_str()) {
            return false;
        }
    }
    true
}

fn split_connectors(task: &str) -> Vec<String> {
    // Collect every candidate cut, then try them from most balanced to
    // least, preferring earlier connectors on ties.
    let mut candidates: Vec<(usize, usize, usize, usize)> = Vec::new(); // (balance, priority, at, len)
    for (priority, connector) in CONNECTORS.iter().enumerate() {
        let mut from = 0;
        while let Some(pos) = task[from..].find(connector) {
            let at = from + pos;
            let left_len = task[..at].trim().chars().count();
            let right_len = task[at + connector.len()..].trim().chars().count();
            let balance = if left_len > right_len {
                left_len - right_len
            } else {
                right_len - left_len
            };
            candidates.push((balance, priority, at, connector.len()));
            from = at + connector.len();
        }
    }
    candidates.sort();

    for (_, _, at, len) in candidates {
        let left = task[..at].trim();
        let right = task[at + len..].trim();
        if valid_cut(left, right) {
            return vec![left.to_string(), right.to_string()];
        }
    }
    Vec::new()
}

// -- Strategy 3: sentence split ---------------------------------------------

fn split_sentences(task: &str) -> Vec<String> {
    let mut sentences: Vec<String> = Vec::new();
    let mut last = 0;
    for m in SENTENCE_END_RE.find_iter(task) {
        sentences.push(task[last..m.start() + 1].trim().to_string());
        last = m.end();
    }
    if last < task.len() {
        sentences.push(task[last..].trim().to_string());
    }
    if sentences.len() < 2 {
        return Vec::new();
    }

    // Merge sentences that fail the cut guards into their predecessor.
    let mut shards: Vec<String> = Vec::new();
    for sentence in sentences {
        let trimmed = sentence.trim_end_matches(|c| c == '.' || c == '!' || c == '?');
        let opener = first_word(trimmed);
        let mergeable = shards.last().is_some()
            && (SUBORDINATORS.contains(&opener.as_str())
                || ANAPHORS.contains(&opener.as_str())
                || trimmed.split_whitespace().count() < 2
                || !balanced_delimiters(trimmed));
        if mergeable {
            let last = shards.last_mut().unwrap();
            last.push(' ');
            last.push_str(sentence.trim());
        } else {
            shards.push(trimmed.trim().to_string());
        }
    }
    shards
}

// -- Normalisation ----------------------------------------------------------

/// Trim, collapse whitespace, drop case-insensitive duplicates, require
/// two words, truncate to the budget.
pub fn normalize_shards(shards: Vec<String>, budget: usize) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();
    for shard in shards {
        let cleaned = shard.split_whitespace().collect::<Vec<_>>().join(" ");
        if cleaned.split_whitespace().count() < 2 {
            continue;
        }
        let key = cleaned.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(cleaned);
        if out.len() == budget {
            break;
        }
    }
    out
}

// -- Scaling ----------------------------------------------------------------

const COMPLEXITY_KEYWORDS: &[&str] = &[
    "implement", "build", "create", "refactor", "test", "deploy", "fix", "design", "migrate",
    "document", "optimize", "integrate", "configure", "install", "setup", "add", "update",
];

/// Weighted keyword and structure score for a task.
pub fn complexity_score(task: &str) -> usize {
    let lower = task.to_lowercase();
    let keywords = COMPLEXITY_KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .count()
        * 2;
    let markers = task.lines().filter(|l| LIST_MARKER_RE.is_match(l)).count() * 2;
    let connectors = CONNECTORS
        .iter()
        .take(CONNECTORS.len() - 1) // the newline connector is counted via markers
        .map(|c| lower.matches(c).count())
        .sum::<usize>();
    let sentences = SENTENCE_END_RE.find_iter(task).count();
    keywords + markers + connectors + sentences
}

/// How many shards this task *deserves*, in `[floor.min(budget), budget]`.
pub fn desired_shard_count(max_budget: usize, task: &str, floor: usize) -> usize {
    let max_budget = max_budget.max(1);
    let words = task.split_whitespace().count();
    let desired = 2 + complexity_score(task) / 6 + words / 50;
    desired.max(floor.max(2)).min(max_budget).max(1)
}

// -- LLM decomposition ------------------------------------------------------

/// One-shot LLM decomposition into exactly `desired` subtasks. Returns
/// `None` when the call fails or the reply is not a usable JSON array.
pub async fn llm_decompose(
    client: &Arc<dyn LLMClient>,
    cancel: &CancelToken,
    task: &str,
    desired: usize,
) -> Option<Vec<String>> {
    let prompt = format!(
        "Decompose the task below into exactly {} independent subtasks.\n\
         Respond with only a JSON array of strings. Each subtask starts with an \
         action verb and contains between 2 and 12 words.\n\nTask:\n{}",
        desired, task
    );
    let response = match client.complete(cancel, &prompt).await {
        Ok(text) => text,
        Err(err) => {
            debug!("LLM decomposition failed: {}", err);
            return None;
        }
    };
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    if end <= start {
        return None;
    }
    let items: Vec<String> = serde_json::from_str(&response[start..=end]).ok()?;
    let shards = normalize_shards(items, desired);
    if shards.is_empty() {
        None
    } else {
        Some(shards)
    }
}

// -- Fallback padding -------------------------------------------------------

const DOMAIN_STEPS: &[(&str, &str)] = &[
    ("frontend", "Implement the frontend changes"),
    ("ui", "Implement the frontend changes"),
    ("backend", "Implement the backend changes"),
    ("api", "Wire the backend endpoints"),
    ("database", "Update the database schema and queries"),
    ("auth", "Review authentication and authorization paths"),
    ("deploy", "Prepare deployment and rollout steps"),
    ("test", "Add tests covering the changes"),
];

const GENERIC_STEPS: &[&str] = &[
    "Clarify requirements and constraints",
    "Implement the core changes",
    "Verify the result end to end",
    "Summarize the outcome and remaining work",
];

/// Deterministic padding used when heuristics and decomposition both fall
/// short of the desired count.
pub fn fallback_subtasks(task: &str, need: usize) -> Vec<String> {
    let lower = task.to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for (token, step) in DOMAIN_STEPS {
        if out.len() == need {
            break;
        }
        if lower.contains(token) && !out.iter().any(|s| s == step) {
            out.push(step.to_string());
        }
    }
    for step in GENERIC_STEPS {
        if out.len() == need {
            break;
        }
        if !out.iter().any(|s| s == step) {
            out.push(step.to_string());
        }
    }
    out
}

// -- Prompt rendering -------------------------------------------------------

/// Full shard prompt: global context plus the `Subtask k/N` framing.
pub fn render_shard_prompt(index: usize, total: usize, subtask: &str, full_task: &str) -> String {
    format!(
        "You are completing one part of a larger task.\nFull task:\n{}\n\nSubtask {}/{}:\n{}\n\nProduce only the output for this subtask.",
        full_task,
        index + 1,
        total,
        subtask
    )
}

/// Retry prompt: no global context, just the subtask.
pub fn render_retry_prompt(index: usize, total: usize, subtask: &str) -> String {
    format!(
        "Subtask {}/{}:\n{}\n\nThe previous attempt failed. Produce only the output for this subtask.",
        index + 1,
        total,
        subtask
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bullet_lines_split() {
        let shards = split_task("- build package\n- run tests\n- summarize results", 5);
        assert_eq!(
            shards,
            vec!["build package", "run tests", "summarize results"]
        );
    }

    #[test]
    fn numbered_and_checkbox_markers_split() {
        let shards = split_task("1. compile the code\n2) run the suite\n[ ] publish the crate", 5);
        assert_eq!(
            shards,
            vec!["compile the code", "run the suite", "publish the crate"]
        );
    }

    #[test]
    fn indented_lines_fold_into_previous_shard() {
        let shards = split_task("- build the site\n  using the staging config\n- deploy it now", 5);
        assert_eq!(
            shards,
            vec!["build the site using the staging config", "deploy it now"]
        );
    }

    #[test]
    fn connector_splits_balanced_pair() {
        let shards = split_task("Compile the report and then publish it", 2);
        assert_eq!(shards, vec!["Compile the report", "publish it"]);
    }

    #[test]
    fn anaphoric_clause_is_not_split() {
        let shards = split_task("Run compile and test; if it fails, fix the first failure", 2);
        assert_eq!(
            shards,
            vec!["Run compile and test; if it fails, fix the first failure"]
        );
    }

    #[test]
    fn simple_and_pair_splits() {
        let shards = split_task("build package and run tests", 5);
        assert_eq!(shards, vec!["build package", "run tests"]);
    }

    #[test]
    fn sentences_split_with_guards() {
        let shards = split_task("Write the parser module. Document the public functions.", 5);
        assert_eq!(
            shards,
            vec!["Write the parser module", "Document the public functions"]
        );
    }

    #[test]
    fn sentence_starting_with_pronoun_merges() {
        let shards = split_task("Create the config loader. It should read TOML files.", 5);
        assert_eq!(shards.len(), 1);
    }

    #[test]
    fn normalisation_dedupes_and_truncates() {
        let shards = normalize_shards(
            vec![
                "  build   it now ".to_string(),
                "BUILD IT NOW".to_string(),
                "x".to_string(),
                "run the tests".to_string(),
                "ship the build".to_string(),
            ],
            2,
        );
        assert_eq!(shards, vec!["build it now", "run the tests"]);
    }

    #[test]
    fn budget_bounds_the_output() {
        let shards = split_task("- one thing\n- two thing\n- three thing\n- four thing", 2);
        assert_eq!(shards.len(), 2);
    }

    #[test]
    fn desired_count_stays_in_range() {
        for task in &[
            "hi there",
            "implement the frontend and backend, migrate the database, add tests, then deploy",
        ] {
            let desired = desired_shard_count(6, task, 2);
            assert!((2..=6).contains(&desired), "desired {} for {:?}", desired, task);
        }
    }

    #[test]
    fn fallback_pads_with_domain_steps() {
        let steps = fallback_subtasks("fix the frontend and the database layer", 3);
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().any(|s| s.contains("frontend")));
        assert!(steps.iter().any(|s| s.contains("database")));
    }

    #[test]
    fn retry_prompt_omits_global_context() {
        let full = render_shard_prompt(0, 2, "build package", "build package and run tests");
        let retry = render_retry_prompt(0, 2, "build package");
        assert!(full.contains("build package and run tests"));
        assert!(!retry.contains("build package and run tests"));
        assert!(retry.contains("Subtask 1/2:"));
    }
}
