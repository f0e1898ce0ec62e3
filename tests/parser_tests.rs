use eai::eai::tool_parser::{
    extract_tool_calls, parse_response, render_tool_calls, ParsedResponse,
};
use eai::eai::tool_protocol::ToolCall;
use serde_json::json;

#[test]
fn canonical_tool_calls_object_parses() {
    let text =
        "{\"tool_calls\":[{\"id\":\"x\",\"name\":\"exec\",\"arguments\":{\"command\":\"echo hello\"}}]}";
    let calls = extract_tool_calls(text);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "x");
    assert_eq!(calls[0].name, "exec");
    assert_eq!(calls[0].arguments["command"], "echo hello");
}

#[test]
fn envelope_layouts_all_parse() {
    let layouts = vec![
        "[TOOL_CALL]{\"tool\": \"read_file\", \"args\": {\"path\": \"a\"}}[/TOOL_CALL]",
        "[TOOL_CALL]{\"tool\": \"read_file\", \"path\": \"a\"}[/TOOL_CALL]",
        "[TOOL_CALL]{\"name\": \"read_file\", \"args\": {\"path\": \"a\"}}[/TOOL_CALL]",
        "[TOOL_CALL]{\"read_file\": {\"path\": \"a\"}}[/TOOL_CALL]",
        "[tool_calls]{\"tool\": \"read_file\", \"args\": {\"path\": \"a\"}}[/tool_calls]",
    ];
    for layout in layouts {
        let calls = extract_tool_calls(layout);
        assert_eq!(calls.len(), 1, "layout failed: {}", layout);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "a");
    }
}

#[test]
fn fat_arrows_normalise_inside_envelopes() {
    let text = "[TOOL_CALL]{\"tool\" => \"shell_execute\", \"args\" => {\"command\" => \"pwd\"}}[/TOOL_CALL]";
    let calls = extract_tool_calls(text);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments["command"], "pwd");
}

#[test]
fn embedded_tool_object_is_found_in_prose() {
    let text = "Let me look. {\"tool\": \"list_directory\", \"args\": {\"path\": \"src\"}} Then I'll report.";
    let calls = extract_tool_calls(text);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "list_directory");
}

#[test]
fn hash_style_arguments_are_collected() {
    let text = "{tool => \"search_text\", args => { --pattern \"fn main\" --path \"src\" }}";
    let calls = extract_tool_calls(text);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "search_text");
    assert_eq!(calls[0].arguments["pattern"], "fn main");
    assert_eq!(calls[0].arguments["path"], "src");
}

#[test]
fn safe_plaintext_command_synthesises_shell_execute() {
    for cmd in &["ls -la", "cat Cargo.toml", "git status", "cargo build"] {
        let calls = extract_tool_calls(cmd);
        assert_eq!(calls.len(), 1, "command {:?}", cmd);
        assert_eq!(calls[0].name, "shell_execute");
        assert_eq!(calls[0].arguments["command"], *cmd);
    }
}

#[test]
fn prose_and_unsafe_commands_are_final_text() {
    for text in &[
        "The build passed and everything is fine.",
        "rm -rf target",
        "Here are the results:\n- one\n- two",
    ] {
        match parse_response(text) {
            ParsedResponse::FinalText(out) => assert_eq!(out, *text),
            ParsedResponse::ToolCalls(calls) => panic!("unexpected calls {:?}", calls),
        }
    }
}

#[test]
fn first_listed_shape_wins() {
    // An envelope and a bare tool_calls object in one response: the
    // envelope is checked first and must win alone.
    let text = "{\"tool_calls\":[{\"id\":\"a\",\"name\":\"find_files\",\"arguments\":{}}]}\n\
                [TOOL_CALL]{\"tool\": \"read_file\", \"args\": {\"path\": \"x\"}}[/TOOL_CALL]";
    let calls = extract_tool_calls(text);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "read_file");
}

#[test]
fn parse_of_rendered_calls_is_identity() {
    let calls = vec![
        ToolCall::new("c1", "shell_execute", json!({"command": "make"})),
        ToolCall::new(
            "c2",
            "edit_file",
            json!({"path": "src/lib.rs", "old_text": "a", "new_text": "b"}),
        ),
    ];
    let reparsed = extract_tool_calls(&render_tool_calls(&calls));
    assert_eq!(reparsed, calls);
    // And a second round trip is stable too.
    let again = extract_tool_calls(&render_tool_calls(&reparsed));
    assert_eq!(again, calls);
}

#[test]
fn multiple_calls_preserve_emission_order() {
    let text = "{\"tool_calls\":[\
        {\"id\":\"1\",\"name\":\"read_file\",\"arguments\":{\"path\":\"a\"}},\
        {\"id\":\"2\",\"name\":\"read_file\",\"arguments\":{\"path\":\"b\"}}]}";
    let calls = extract_tool_calls(text);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].arguments["path"], "a");
    assert_eq!(calls[1].arguments["path"], "b");
}
