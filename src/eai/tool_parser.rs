//! Tool-call extraction from free-form LLM output.
//!
//! Models emit tool invocations in several surface syntaxes. The parser
//! tries each recognised shape in order of specificity and returns the
//! first that yields a well-formed call; it never mixes calls from two
//! shapes. Parsing is pure and idempotent: parsing the engine's own
//! rendered tool-call JSON ([`render_tool_calls`]) reproduces the calls.
//!
//! Recognised shapes, in order:
//!
//! 1. A bracketed envelope, `[TOOL_CALL]…[/TOOL_CALL]` or
//!    `[tool_calls]…[/tool_calls]`, containing JSON in one of four
//!    layouts (`{tool, args}`, `{tool, …flat args}`, `{name, args}`,
//!    `{"<tool>": {…}}`). Fat-arrow `=>` separators are normalised to `:`
//!    before JSON parsing.
//! 2. A JSON object with a `"tool_calls"` array of `{id, name, arguments}`.
//! 3. Any JSON object embedded in the text containing a `"tool"` key,
//!    found by balanced-brace scanning around the key.
//! 4. A loose hash-style form `{tool => "name", args => { --key "value" }}`.
//! 5. A plaintext fallback: a response that is nothing but a single safe
//!    inspection/build command becomes a `shell_execute` call.
//!
//! Ambiguous free text is deliberately *not* guessed at: a response that
//! matches no shape is final output.

use crate::eai::tool_protocol::ToolCall;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

/// Outcome of parsing one assistant response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// No tool call recognised; the text is the final answer.
    FinalText(String),
    /// One or more tool calls, in emission order.
    ToolCalls(Vec<ToolCall>),
}

/// Parse an assistant response into final text or tool calls.
pub fn parse_response(text: &str) -> ParsedResponse {
    let calls = extract_tool_calls(text);
    if calls.is_empty() {
        ParsedResponse::FinalText(text.to_string())
    } else {
        ParsedResponse::ToolCalls(calls)
    }
}

/// Extract tool calls, first matching shape wins.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    if let Some(calls) = parse_envelope(text) {
        return calls;
    }
    if let Some(calls) = parse_tool_calls_object(text) {
        return calls;
    }
    if let Some(calls) = parse_embedded_tool_object(text) {
        return calls;
    }
    if let Some(calls) = parse_hash_style(text) {
        return calls;
    }
    if let Some(calls) = parse_plain_command(text) {
        return calls;
    }
    Vec::new()
}

/// Render tool calls in the engine's canonical shape (shape 2). Parsing
/// the rendition reproduces the calls.
pub fn render_tool_calls(calls: &[ToolCall]) -> String {
    serde_json::to_string(&serde_json::json!({ "tool_calls": calls }))
        .unwrap_or_else(|_| String::from("{\"tool_calls\":[]}"))
}

// -- Shape 1: bracketed envelope ------------------------------------------

const ENVELOPES: &[(&str, &str)] = &[
    ("[TOOL_CALL]", "[/TOOL_CALL]"),
    ("[tool_call]", "[/tool_call]"),
    ("[TOOL_CALLS]", "[/TOOL_CALLS]"),
    ("[tool_calls]", "[/tool_calls]"),
];

fn parse_envelope(text: &str) -> Option<Vec<ToolCall>> {
    for (open, close) in ENVELOPES {
        let start = match text.find(open) {
            Some(s) => s + open.len(),
            None => continue,
        };
        let end = match text[start..].find(close) {
            Some(e) => start + e,
            None => continue,
        };
        let body = normalize_fat_arrows(text[start..end].trim());
        let value: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let calls = calls_from_value(&value);
        if !calls.is_empty() {
            return Some(calls);
        }
    }
    None
}

/// Normalise `=>` separators to `:` so loose hash-ish JSON parses.
fn normalize_fat_arrows(body: &str) -> String {
    body.replace("=>", ":")
}

fn calls_from_value(value: &Value) -> Vec<ToolCall> {
    let mut counter = 0usize;
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| call_from_object(item.as_object()?, &mut counter))
            .collect(),
        Value::Object(obj) => call_from_object(obj, &mut counter)
            .map(|c| vec![c])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Interpret one JSON object as a tool call in any of the accepted
/// layouts.
fn call_from_object(obj: &Map<String, Value>, counter: &mut usize) -> Option<ToolCall> {
    let id = obj
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| next_id(counter));

    // {tool: "...", args: {...}} or {tool: "...", ...flat args}
    if let Some(name) = obj.get("tool").and_then(|v| v.as_str()) {
        let args = explicit_args(obj)
            .cloned()
            .unwrap_or_else(|| flat_args(obj, &["tool", "id"]));
        return Some(ToolCall::new(id, name, args));
    }

    // {name: "...", args|arguments|parameters: {...}}
    if let Some(name) = obj.get("name").and_then(|v| v.as_str()) {
        let args = explicit_args(obj)
            .cloned()
            .unwrap_or_else(|| flat_args(obj, &["name", "id"]));
        return Some(ToolCall::new(id, name, args));
    }

    // {"<tool_name>": {...args}} with exactly one key.
    if obj.len() == 1 {
        let (name, args) = obj.iter().next()?;
        if let Value::Object(_) = args {
            return Some(ToolCall::new(id, name.clone(), args.clone()));
        }
    }

    None
}

fn explicit_args<'a>(obj: &'a Map<String, Value>) -> Option<&'a Value> {
    for key in &["args", "arguments", "parameters"] {
        if let Some(v) = obj.get(*key) {
            if v.is_object() {
                return Some(v);
            }
        }
    }
    None
}

fn flat_args(obj: &Map<String, Value>, skip: &[&str]) -> Value {
    let mut out = Map::new();
    for (k, v) in obj {
        if !skip.contains(&k.as_str()) {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}

fn next_id(counter: &mut usize) -> String {
    *counter += 1;
    format!("call-{}", counter)
}

// -- Shape 2: {"tool_calls": [...]} ----------------------------------------

fn parse_tool_calls_object(text: &str) -> Option<Vec<ToolCall>> {
    let value: Value = match serde_json::from_str(text.trim()) {
        Ok(v) => v,
        Err(_) => {
            // Not a pure JSON response; look for an embedded object
            // around the "tool_calls" key.
            let key_at = text.find("\"tool_calls\"")?;
            let (start, end) = enclosing_object(text, key_at)?;
            serde_json::from_str(&text[start..end]).ok()?
        }
    };
    let entries = value.get("tool_calls")?.as_array()?;
    let mut counter = 0usize;
    let calls: Vec<ToolCall> = entries
        .iter()
        .filter_map(|e| call_from_object(e.as_object()?, &mut counter))
        .collect();
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

// -- Shape 3: embedded {"tool": ...} object --------------------------------

fn parse_embedded_tool_object(text: &str) -> Option<Vec<ToolCall>> {
    let key_at = text.find("\"tool\"")?;
    let (start, end) = enclosing_object(text, key_at)?;
    let value: Value = serde_json::from_str(&text[start..end]).ok()?;
    let obj = value.as_object()?;
    obj.get("tool")?.as_str()?;
    let mut counter = 0usize;
    call_from_object(obj, &mut counter).map(|c| vec![c])
}

/// Find the innermost balanced `{…}` span containing byte offset `at`,
/// walking backwards from `at` over candidate opening braces. String
/// literals are honoured so braces inside quoted values do not confuse
/// the scan.
fn enclosing_object(text: &str, at: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut start = at;
    loop {
        start = text[..start].rfind('{')?;
        if let Some(end) = balanced_end(bytes, start) {
            if end > at {
                return Some((start, end));
            }
        }
        if start == 0 {
            return None;
        }
    }
}

/// Given an opening brace at `start`, return the byte offset one past its
/// matching close brace.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// -- Shape 4: hash-style ----------------------------------------------------

lazy_static! {
    static ref HASH_STYLE_RE: Regex = Regex::new(
        r#"(?s)\{\s*tool\s*=>\s*"(?P<name>[^"]+)"\s*,\s*args\s*=>\s*\{(?P<args>[^}]*)\}\s*\}"#
    )
    .unwrap();
    static ref HASH_ARG_RE: Regex =
        Regex::new(r#"--(?P<key>[A-Za-z0-9_-]+)\s+"(?P<value>[^"]*)""#).unwrap();
}

fn parse_hash_style(text: &str) -> Option<Vec<ToolCall>> {
    let caps = HASH_STYLE_RE.captures(text)?;
    let name = caps.name("name")?.as_str().to_string();
    let mut args = Map::new();
    for arg in HASH_ARG_RE.captures_iter(caps.name("args")?.as_str()) {
        args.insert(
            arg.name("key")?.as_str().replace('-', "_"),
            Value::String(arg.name("value")?.as_str().to_string()),
        );
    }
    Some(vec![ToolCall::new("call-1", name, Value::Object(args))])
}

// -- Shape 5: plaintext command fallback -----------------------------------

/// Command prefixes safe enough to run without explicit JSON intent:
/// listing, reading, and common build/test invocations.
const SAFE_COMMAND_PREFIXES: &[&str] = &[
    "ls",
    "pwd",
    "tree",
    "cat ",
    "head ",
    "tail ",
    "wc ",
    "stat ",
    "file ",
    "grep ",
    "find ",
    "git status",
    "git log",
    "git diff",
    "make",
    "cargo build",
    "cargo check",
    "cargo test",
    "go build",
    "go test",
    "npm test",
    "npm run build",
    "mvn package",
    "gradle build",
    "pytest",
];

fn parse_plain_command(text: &str) -> Option<Vec<ToolCall>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.len() > 200 || trimmed.lines().count() != 1 {
        return None;
    }
    // Strip shell-prompt or code-span dressing.
    let cmd = trimmed
        .trim_start_matches("$ ")
        .trim_matches('`')
        .trim()
        .to_string();
    let lower = cmd.to_lowercase();
    let safe = SAFE_COMMAND_PREFIXES.iter().any(|p| {
        if p.ends_with(' ') {
            lower.starts_with(p)
        } else {
            lower == *p || lower.starts_with(&format!("{} ", p))
        }
    });
    if !safe {
        return None;
    }
    Some(vec![ToolCall::new(
        "call-1",
        "shell_execute",
        serde_json::json!({ "command": cmd }),
    )])
}
