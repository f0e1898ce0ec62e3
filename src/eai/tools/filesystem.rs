//! File inspection and mutation tools.
//!
//! The file tools operate on UTF-8 text relative to the agent's working
//! directory (absolute paths are honoured as given). Mutating tools create
//! parent directories with mode `0755` and files with mode `0644`.
//! `search_text` and `find_files` delegate to the standard inspection
//! commands (`grep`, `find`); a non-zero exit with empty output means "no
//! match" and is treated as success with empty output.

use crate::eai::cancel::CancelToken;
use crate::eai::tool_protocol::{arg_str, arg_str_opt, Tool, ToolError, ToolMetadata};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

fn resolve(workdir: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        workdir.join(p)
    }
}

#[cfg(unix)]
fn create_parents(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_parents(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn write_new(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    file.write_all(content.as_bytes())
}

#[cfg(not(unix))]
fn write_new(path: &Path, content: &str) -> std::io::Result<()> {
    std::fs::write(path, content)
}

fn io_failure(op: &str, path: &Path, err: std::io::Error) -> ToolError {
    ToolError::ExecFailure(format!("{} {}: {}", op, path.display(), err))
}

/// The `read_file` tool.
pub struct ReadFileTool {
    meta: ToolMetadata,
    workdir: PathBuf,
}

impl ReadFileTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            meta: ToolMetadata::new(
                "read_file",
                "Read a UTF-8 text file",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"]
                }),
            ),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.meta
    }

    async fn execute(
        &self,
        _cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        let path = resolve(&self.workdir, &arg_str(&arguments, "path")?);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure("read", &path, e))
    }
}

/// The `write_file` tool. Creates parent directories as needed.
pub struct WriteFileTool {
    meta: ToolMetadata,
    workdir: PathBuf,
}

impl WriteFileTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            meta: ToolMetadata::new(
                "write_file",
                "Create or overwrite a UTF-8 text file, creating parent directories",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
            ),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.meta
    }

    async fn execute(
        &self,
        _cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        let path = resolve(&self.workdir, &arg_str(&arguments, "path")?);
        let content = arg_str(&arguments, "content")?;
        create_parents(&path).map_err(|e| io_failure("create parents for", &path, e))?;
        write_new(&path, &content).map_err(|e| io_failure("write", &path, e))?;
        Ok(format!("wrote {} bytes to {}", content.len(), path.display()))
    }
}

/// The `append_file` tool. Creates the file when it does not exist.
pub struct AppendFileTool {
    meta: ToolMetadata,
    workdir: PathBuf,
}

impl AppendFileTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            meta: ToolMetadata::new(
                "append_file",
                "Append to a UTF-8 text file, creating it if missing",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
            ),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for AppendFileTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.meta
    }

    async fn execute(
        &self,
        _cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        use std::io::Write;
        let path = resolve(&self.workdir, &arg_str(&arguments, "path")?);
        let content = arg_str(&arguments, "content")?;
        create_parents(&path).map_err(|e| io_failure("create parents for", &path, e))?;
        let mut open = std::fs::OpenOptions::new();
        open.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(0o644);
        }
        let mut file = open.open(&path).map_err(|e| io_failure("open", &path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| io_failure("append", &path, e))?;
        Ok(format!(
            "appended {} bytes to {}",
            content.len(),
            path.display()
        ))
    }
}

/// The `edit_file` tool: exact substring replacement, first match only.
pub struct EditFileTool {
    meta: ToolMetadata,
    workdir: PathBuf,
}

impl EditFileTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            meta: ToolMetadata::new(
                "edit_file",
                "Replace the first exact occurrence of old_text with new_text",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "old_text": {"type": "string"},
                        "new_text": {"type": "string"}
                    },
                    "required": ["path", "old_text", "new_text"]
                }),
            ),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.meta
    }

    async fn execute(
        &self,
        _cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        let path = resolve(&self.workdir, &arg_str(&arguments, "path")?);
        let old_text = arg_str(&arguments, "old_text")?;
        let new_text = arg_str(&arguments, "new_text")?;
        if old_text.is_empty() {
            return Err(ToolError::InvalidArguments(
                "old_text must not be empty".to_string(),
            ));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure("read", &path, e))?;
        if !content.contains(&old_text) {
            return Err(ToolError::ExecFailure(format!(
                "old_text not found in {}",
                path.display()
            )));
        }
        let updated = content.replacen(&old_text, &new_text, 1);
        tokio::fs::write(&path, updated)
            .await
            .map_err(|e| io_failure("write", &path, e))?;
        Ok(format!("edited {}", path.display()))
    }
}

/// The `list_directory` tool: one entry per line, directories suffixed
/// with `/`.
pub struct ListDirectoryTool {
    meta: ToolMetadata,
    workdir: PathBuf,
}

impl ListDirectoryTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            meta: ToolMetadata::new(
                "list_directory",
                "List directory entries, one per line, directories marked with a trailing /",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string", "description": "Defaults to the workspace root"}}
                }),
            ),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.meta
    }

    async fn execute(
        &self,
        _cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        let rel = arg_str_opt(&arguments, "path").unwrap_or_else(|| ".".to_string());
        let path = resolve(&self.workdir, &rel);
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| io_failure("list", &path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| io_failure("list", &path, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        Ok(entries.join("\n"))
    }
}

/// Run an inspection command where exit code 1 with empty output means
/// "no match" rather than failure.
async fn run_inspection(
    cancel: &CancelToken,
    workdir: &Path,
    program: &str,
    args: &[String],
) -> Result<String, ToolError> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::ExecFailure(format!("failed to spawn {}: {}", program, e)))?;

    let output = tokio::select! {
        out = child.wait_with_output() => {
            out.map_err(|e| ToolError::ExecFailure(format!("wait failed: {}", e)))?
        }
        _ = cancel.cancelled() => {
            return Err(ToolError::ExecFailure("command cancelled".to_string()));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() || stdout.trim().is_empty() && output.status.code() == Some(1) {
        Ok(stdout)
    } else {
        Err(ToolError::ExecFailure(format!(
            "{} exited with {}: {}",
            program,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

/// The `search_text` tool, delegating to recursive grep.
pub struct SearchTextTool {
    meta: ToolMetadata,
    workdir: PathBuf,
}

impl SearchTextTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            meta: ToolMetadata::new(
                "search_text",
                "Recursively search file contents for a pattern (grep -rn)",
                json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string"},
                        "path": {"type": "string", "description": "Defaults to the workspace root"}
                    },
                    "required": ["pattern"]
                }),
            ),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for SearchTextTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.meta
    }

    async fn execute(
        &self,
        cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        let pattern = arg_str(&arguments, "pattern")?;
        let rel = arg_str_opt(&arguments, "path").unwrap_or_else(|| ".".to_string());
        let args = vec![
            "-rn".to_string(),
            "--binary-files=without-match".to_string(),
            "--exclude-dir=.git".to_string(),
            "--".to_string(),
            pattern,
            rel,
        ];
        run_inspection(cancel, &self.workdir, "grep", &args).await
    }
}

/// The `find_files` tool, delegating to `find -name`.
pub struct FindFilesTool {
    meta: ToolMetadata,
    workdir: PathBuf,
}

impl FindFilesTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            meta: ToolMetadata::new(
                "find_files",
                "Find files whose name matches a glob pattern",
                json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Glob such as *.rs"},
                        "path": {"type": "string", "description": "Defaults to the workspace root"}
                    },
                    "required": ["pattern"]
                }),
            ),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for FindFilesTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.meta
    }

    async fn execute(
        &self,
        cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        let pattern = arg_str(&arguments, "pattern")?;
        let rel = arg_str_opt(&arguments, "path").unwrap_or_else(|| ".".to_string());
        let args = vec![
            rel,
            "-not".to_string(),
            "-path".to_string(),
            "*/.git/*".to_string(),
            "-name".to_string(),
            pattern,
        ];
        run_inspection(cancel, &self.workdir, "find", &args).await
    }
}
