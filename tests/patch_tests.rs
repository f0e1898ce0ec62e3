use eai::eai::cancel::CancelToken;
use eai::eai::tool_protocol::Tool;
use eai::eai::tools::patch::{apply, parse, PatchError, PatchFileTool};
use serde_json::json;

const DIFF: &str = "\
--- a/notes.txt
+++ b/notes.txt
@@ -1,4 +1,4 @@
 keep one
-drop this
+add that
 keep two
 keep three
";

#[test]
fn parse_then_apply() {
    let patch = parse(DIFF).unwrap();
    let out = apply("keep one\ndrop this\nkeep two\nkeep three\n", &patch).unwrap();
    assert_eq!(out, "keep one\nadd that\nkeep two\nkeep three\n");
}

#[test]
fn mismatched_context_reports_the_line() {
    let patch = parse(DIFF).unwrap();
    let err = apply("keep one\nsomething else\nkeep two\nother\n", &patch).unwrap_err();
    match err {
        PatchError::ContextMismatch { line, detail } => {
            assert_eq!(line, 2);
            assert!(detail.contains("drop this"));
        }
        other => panic!("unexpected: {}", other),
    }
}

#[test]
fn apply_then_inverse_is_identity() {
    let original = "keep one\ndrop this\nkeep two\nkeep three\n";
    let patch = parse(DIFF).unwrap();
    let patched = apply(original, &patch).unwrap();
    let restored = apply(&patched, &patch.invert()).unwrap();
    assert_eq!(restored, original);
}

#[test]
fn no_newline_marker_is_tracked_both_ways() {
    let diff = "\
@@ -1,1 +1,1 @@
-old ending
\\ No newline at end of file
+new ending
\\ No newline at end of file
";
    let patch = parse(diff).unwrap();
    let patched = apply("old ending", &patch).unwrap();
    assert_eq!(patched, "new ending");
    let restored = apply(&patched, &patch.invert()).unwrap();
    assert_eq!(restored, "old ending");
}

#[cfg(unix)]
#[tokio::test]
async fn executable_file_keeps_its_mode() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.sh");
    std::fs::write(&path, "keep one\ndrop this\nkeep two\nkeep three\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let tool = PatchFileTool::new(dir.path());
    let summary = tool
        .execute(&CancelToken::never(), json!({"path": "run.sh", "diff": DIFF}))
        .await
        .unwrap();
    assert!(summary.contains("1 hunk"));

    let metadata = std::fs::metadata(&path).unwrap();
    assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "keep one\nadd that\nkeep two\nkeep three\n"
    );
}

#[tokio::test]
async fn tool_reports_mismatch_with_line_number() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.txt"), "totally different content\n").unwrap();
    let tool = PatchFileTool::new(dir.path());
    let err = tool
        .execute(&CancelToken::never(), json!({"path": "f.txt", "diff": DIFF}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("patch mismatch at line"));
}
