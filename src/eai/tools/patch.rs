//! Unified-diff patch application.
//!
//! Parses standard unified diffs (`---`/`+++` headers optional, `@@`
//! hunks, `\ No newline at end of file` markers) and applies them with
//! line-level context matching. When a hunk does not match at its declared
//! position the applier searches nearby offsets the way `patch(1)` does;
//! if no position matches, the error reports the 1-based line of the first
//! divergence. File permission bits are preserved across application, and
//! the no-newline markers are tracked so applying a patch and then its
//! [`inverse`](Patch::invert) reproduces the original content exactly.

use crate::eai::cancel::CancelToken;
use crate::eai::tool_protocol::{arg_str, Tool, ToolError, ToolMetadata};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchLine {
    /// Present in both versions (` ` prefix).
    Context(String),
    /// Removed from the old version (`-` prefix).
    Remove(String),
    /// Added in the new version (`+` prefix).
    Add(String),
}

/// One `@@` hunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    /// 1-based first line of the hunk in the old file.
    pub old_start: usize,
    pub old_count: usize,
    /// 1-based first line of the hunk in the new file.
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<PatchLine>,
}

impl Hunk {
    /// The old-side lines this hunk expects to find (context + removals).
    fn expected_old(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                PatchLine::Context(s) | PatchLine::Remove(s) => Some(s.as_str()),
                PatchLine::Add(_) => None,
            })
            .collect()
    }

    /// The new-side lines this hunk produces (context + additions).
    fn produced_new(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                PatchLine::Context(s) | PatchLine::Add(s) => Some(s.as_str()),
                PatchLine::Remove(_) => None,
            })
            .collect()
    }
}

/// A parsed unified diff for a single file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Patch {
    pub hunks: Vec<Hunk>,
    /// The old file ends without a trailing newline.
    pub old_missing_newline: bool,
    /// The new file ends without a trailing newline.
    pub new_missing_newline: bool,
}

impl Patch {
    /// Produce the inverse patch: applying `self` and then the inverse
    /// reproduces the original content.
    pub fn invert(&self) -> Patch {
        Patch {
            hunks: self
                .hunks
                .iter()
                .map(|h| Hunk {
                    old_start: h.new_start,
                    old_count: h.new_count,
                    new_start: h.old_start,
                    new_count: h.old_count,
                    lines: h
                        .lines
                        .iter()
                        .map(|l| match l {
                            PatchLine::Context(s) => PatchLine::Context(s.clone()),
                            PatchLine::Remove(s) => PatchLine::Add(s.clone()),
                            PatchLine::Add(s) => PatchLine::Remove(s.clone()),
                        })
                        .collect(),
                })
                .collect(),
            old_missing_newline: self.new_missing_newline,
            new_missing_newline: self.old_missing_newline,
        }
    }
}

/// Patch parse/apply failures.
#[derive(Debug, Clone)]
pub enum PatchError {
    /// The diff text itself is malformed; `line` is a 1-based diff line.
    Malformed { line: usize, detail: String },
    /// A hunk's context or deletion lines do not match the file; `line`
    /// is the 1-based file line of the first divergence.
    ContextMismatch { line: usize, detail: String },
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchError::Malformed { line, detail } => {
                write!(f, "malformed diff at line {}: {}", line, detail)
            }
            PatchError::ContextMismatch { line, detail } => {
                write!(f, "context mismatch at line {}: {}", line, detail)
            }
        }
    }
}

impl std::error::Error for PatchError {}

impl From<PatchError> for ToolError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::ContextMismatch { line, detail } => {
                ToolError::PatchMismatch { line, detail }
            }
            PatchError::Malformed { line, detail } => ToolError::InvalidArguments(format!(
                "malformed diff at line {}: {}",
                line, detail
            )),
        }
    }
}

fn parse_range(range: &str, diff_line: usize) -> Result<(usize, usize), PatchError> {
    let mut parts = range.splitn(2, ',');
    let start = parts
        .next()
        .unwrap_or("")
        .parse::<usize>()
        .map_err(|_| PatchError::Malformed {
            line: diff_line,
            detail: format!("bad range {:?}", range),
        })?;
    let count = match parts.next() {
        Some(c) => c.parse::<usize>().map_err(|_| PatchError::Malformed {
            line: diff_line,
            detail: format!("bad range {:?}", range),
        })?,
        None => 1,
    };
    Ok((start, count))
}

/// Parse a unified diff into a [`Patch`].
pub fn parse(diff: &str) -> Result<Patch, PatchError> {
    let mut patch = Patch::default();
    let mut current: Option<Hunk> = None;
    // What the previous body line contributed to, for attributing a
    // following `\ No newline at end of file` marker.
    let mut last_sides: (bool, bool) = (false, false); // (old, new)

    for (idx, raw) in diff.lines().enumerate() {
        let diff_line = idx + 1;
        if raw.starts_with("--- ") || raw.starts_with("+++ ") || raw.starts_with("diff ")
            || raw.starts_with("index ")
        {
            continue;
        }
        if raw.starts_with("@@") {
            if let Some(h) = current.take() {
                patch.hunks.push(h);
            }
            // @@ -old_start,old_count +new_start,new_count @@
            let inner = raw
                .trim_start_matches('@')
                .trim_end_matches(|c| c != '@')
                .trim_matches('@')
                .trim();
            let mut parts = inner.split_whitespace();
            let old_range = parts.next().unwrap_or("");
            let new_range = parts.next().unwrap_or("");
            if !old_range.starts_with('-') || !new_range.starts_with('+') {
                return Err(PatchError::Malformed {
                    line: diff_line,
                    detail: format!("bad hunk header {:?}", raw),
                });
            }
            let (old_start, old_count) = parse_range(&old_range[1..], diff_line)?;
            let (new_start, new_count) = parse_range(&new_range[1..], diff_line)?;
            current = Some(Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: Vec::new(),
            });
            continue;
        }
        let hunk = match current.as_mut() {
            Some(h) => h,
            None => {
                if raw.trim().is_empty() {
                    continue;
                }
                return Err(PatchError::Malformed {
                    line: diff_line,
                    detail: "content before first hunk header".to_string(),
                });
            }
        };
        if raw.starts_with('\\') {
            // `\ No newline at end of file` applies to whichever side the
            // previous line belonged to.
            let (old, new) = last_sides;
            if old {
                patch.old_missing_newline = true;
            }
            if new {
                patch.new_missing_newline = true;
            }
            continue;
        }
        match raw.chars().next() {
            Some(' ') => {
                hunk.lines.push(PatchLine::Context(raw[1..].to_string()));
                last_sides = (true, true);
            }
            Some('-') => {
                hunk.lines.push(PatchLine::Remove(raw[1..].to_string()));
                last_sides = (true, false);
            }
            Some('+') => {
                hunk.lines.push(PatchLine::Add(raw[1..].to_string()));
                last_sides = (false, true);
            }
            None => {
                // Some producers emit a bare empty line for empty context.
                hunk.lines.push(PatchLine::Context(String::new()));
                last_sides = (true, true);
            }
            Some(_) => {
                return Err(PatchError::Malformed {
                    line: diff_line,
                    detail: format!("unexpected line prefix in {:?}", raw),
                });
            }
        }
    }
    if let Some(h) = current.take() {
        patch.hunks.push(h);
    }
    if patch.hunks.is_empty() {
        return Err(PatchError::Malformed {
            line: 1,
            detail: "no hunks found".to_string(),
        });
    }
    Ok(patch)
}

fn matches_at(lines: &[String], pos: usize, expected: &[&str]) -> bool {
    if pos + expected.len() > lines.len() {
        return false;
    }
    expected
        .iter()
        .enumerate()
        .all(|(i, e)| lines[pos + i] == *e)
}

/// Apply a parsed patch to file content.
pub fn apply(content: &str, patch: &Patch) -> Result<String, PatchError> {
    let had_trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.split('\n').map(|s| s.to_string()).collect();
    if had_trailing_newline {
        lines.pop();
    }

    // Applied from top to bottom, tracking how previous hunks shifted
    // later line numbers.
    let mut offset: i64 = 0;
    for hunk in &patch.hunks {
        let expected = hunk.expected_old();
        let declared = hunk.old_start.saturating_sub(1);
        let shifted = (declared as i64 + offset).max(0) as usize;

        let pos = if matches_at(&lines, shifted, &expected) {
            shifted
        } else {
            // Search nearby offsets, closest first.
            let mut found = None;
            for delta in 1..=lines.len().max(1) {
                let before = shifted.checked_sub(delta);
                let after = shifted + delta;
                if let Some(p) = before {
                    if matches_at(&lines, p, &expected) {
                        found = Some(p);
                        break;
                    }
                }
                if after <= lines.len() && matches_at(&lines, after, &expected) {
                    found = Some(after);
                    break;
                }
                if before.is_none() && after > lines.len() {
                    break;
                }
            }
            match found {
                Some(p) => p,
                None => {
                    // Report the first diverging line at the declared position.
                    let mut mismatch_line = hunk.old_start;
                    let mut detail = "hunk does not match".to_string();
                    for (i, e) in expected.iter().enumerate() {
                        match lines.get(shifted + i) {
                            Some(actual) if actual == e => continue,
                            Some(actual) => {
                                mismatch_line = shifted + i + 1;
                                detail = format!("expected {:?}, found {:?}", e, actual);
                                break;
                            }
                            None => {
                                mismatch_line = shifted + i + 1;
                                detail = format!("expected {:?}, found end of file", e);
                                break;
                            }
                        }
                    }
                    return Err(PatchError::ContextMismatch {
                        line: mismatch_line,
                        detail,
                    });
                }
            }
        };

        let produced: Vec<String> = hunk.produced_new().iter().map(|s| s.to_string()).collect();
        let removed = expected.len();
        let added = produced.len();
        lines.splice(pos..pos + removed, produced);
        offset += added as i64 - removed as i64;
    }

    let mut out = lines.join("\n");
    // The new side ends with a newline when the patch says so explicitly,
    // otherwise the original file's ending is preserved.
    let trailing = if patch.new_missing_newline {
        false
    } else if patch.old_missing_newline {
        true
    } else {
        had_trailing_newline
    };
    if trailing && !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// The `patch_file` tool.
pub struct PatchFileTool {
    meta: ToolMetadata,
    workdir: PathBuf,
}

impl PatchFileTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            meta: ToolMetadata::new(
                "patch_file",
                "Apply a unified diff to a file, preserving its permission bits",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "diff": {"type": "string", "description": "Unified diff with @@ hunks"}
                    },
                    "required": ["path", "diff"]
                }),
            ),
            workdir: workdir.into(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workdir.join(p)
        }
    }
}

#[async_trait]
impl Tool for PatchFileTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.meta
    }

    async fn execute(
        &self,
        _cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        let path = self.resolve(&arg_str(&arguments, "path")?);
        let diff = arg_str(&arguments, "diff")?;

        let content = std::fs::read_to_string(&path)
            .map_err(|e| ToolError::ExecFailure(format!("read {}: {}", path.display(), e)))?;
        let permissions = std::fs::metadata(&path)
            .map_err(|e| ToolError::ExecFailure(format!("stat {}: {}", path.display(), e)))?
            .permissions();

        let patch = parse(&diff)?;
        let updated = apply(&content, &patch)?;

        std::fs::write(&path, &updated)
            .map_err(|e| ToolError::ExecFailure(format!("write {}: {}", path.display(), e)))?;
        std::fs::set_permissions(&path, permissions)
            .map_err(|e| ToolError::ExecFailure(format!("chmod {}: {}", path.display(), e)))?;

        Ok(format!(
            "patched {} ({} hunk{})",
            path.display(),
            patch.hunks.len(),
            if patch.hunks.len() == 1 { "" } else { "s" }
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_DIFF: &str = "\
--- a/f.txt
+++ b/f.txt
@@ -1,3 +1,3 @@
 alpha
-beta
+BETA
 gamma
";

    #[test]
    fn applies_a_simple_hunk() {
        let patch = parse(SIMPLE_DIFF).unwrap();
        let out = apply("alpha\nbeta\ngamma\n", &patch).unwrap();
        assert_eq!(out, "alpha\nBETA\ngamma\n");
    }

    #[test]
    fn headers_are_optional() {
        let diff = "@@ -1,1 +1,1 @@\n-x\n+y\n";
        let patch = parse(diff).unwrap();
        assert_eq!(apply("x\n", &patch).unwrap(), "y\n");
    }

    #[test]
    fn searches_nearby_when_file_shifted() {
        // Two lines were inserted above the hunk's declared position.
        let patch = parse(SIMPLE_DIFF).unwrap();
        let out = apply("zero\none\nalpha\nbeta\ngamma\n", &patch).unwrap();
        assert_eq!(out, "zero\none\nalpha\nBETA\ngamma\n");
    }

    #[test]
    fn mismatch_reports_file_line() {
        let patch = parse(SIMPLE_DIFF).unwrap();
        let err = apply("alpha\nDIFFERENT\ngamma\n", &patch).unwrap_err();
        match err {
            PatchError::ContextMismatch { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn no_newline_marker_round_trips() {
        let diff = "\
@@ -1,2 +1,2 @@
 first
-last
+LAST
\\ No newline at end of file
";
        let patch = parse(diff).unwrap();
        assert!(patch.old_missing_newline);
        assert!(patch.new_missing_newline);
        let out = apply("first\nlast", &patch).unwrap();
        assert_eq!(out, "first\nLAST");
    }

    #[test]
    fn apply_then_inverse_reproduces_content() {
        let original = "alpha\nbeta\ngamma\n";
        let patch = parse(SIMPLE_DIFF).unwrap();
        let patched = apply(original, &patch).unwrap();
        let restored = apply(&patched, &patch.invert()).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn multi_hunk_offsets_track() {
        let diff = "\
@@ -1,2 +1,3 @@
 one
+one-and-a-half
 two
@@ -4,2 +5,2 @@
 four
-five
+FIVE
";
        let patch = parse(diff).unwrap();
        let out = apply("one\ntwo\nthree\nfour\nfive\n", &patch).unwrap();
        assert_eq!(out, "one\none-and-a-half\ntwo\nthree\nfour\nFIVE\n");
    }

    #[test]
    fn malformed_diff_is_rejected() {
        let err = parse("not a diff at all\n").unwrap_err();
        match err {
            PatchError::Malformed { line, .. } => assert_eq!(line, 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_preserves_permission_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        std::fs::write(&path, "alpha\nbeta\ngamma\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tool = PatchFileTool::new(dir.path());
        tool.execute(
            &CancelToken::never(),
            json!({"path": "script.sh", "diff": SIMPLE_DIFF}),
        )
        .await
        .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "alpha\nBETA\ngamma\n"
        );
    }
}
