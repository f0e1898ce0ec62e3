//! Shell command execution tool.
//!
//! Runs a command through `/bin/sh -c` with a configurable timeout
//! (default 30 seconds), returning combined stdout+stderr. Success means
//! exit code 0. Cancellation of the surrounding context kills the child.
//!
//! Two policy layers sit in front of execution:
//!
//! - An optional [`ShellPolicy`] with allow/deny prefix lists. Matching is
//!   case-insensitive and also inspects the basename of the first word so
//!   `/bin/rm` is caught by a deny entry of `rm`. The read-only agent
//!   variant uses [`ShellPolicy::read_only`].
//! - A long-running-server heuristic: commands that obviously start a dev
//!   server are detached (`nohup … &`) instead of blocking the loop until
//!   the timeout, and the detachment is verified afterwards (process
//!   alive, or something already serving the expected port).
//!
//! The policy check inspects only command prefixes; shell metacharacters
//! can chain further commands. Stronger isolation belongs to OS-level
//! sandboxing in the host product.

use crate::eai::cancel::CancelToken;
use crate::eai::tool_protocol::{arg_str, arg_u64_opt, Tool, ToolError, ToolMetadata};
use async_trait::async_trait;
use log::{debug, info};
use serde_json::json;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Default command timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Allow/deny prefix policy for shell commands.
///
/// Deny entries win over allow entries. Deny entries containing no
/// whitespace are matched against both the raw command and the basename of
/// its first word; multi-word entries and metacharacter entries (`>`,
/// `>>`) are matched as substrings of the whole command.
#[derive(Debug, Clone, Default)]
pub struct ShellPolicy {
    /// When present, only commands starting with one of these prefixes run.
    pub allowed: Option<Vec<String>>,
    /// Commands matching any of these are rejected.
    pub denied: Option<Vec<String>>,
}

impl ShellPolicy {
    /// The policy used by read-only discovery agents: inspection commands
    /// only, with redirection, in-place edits, filesystem mutations, and
    /// privilege escalation denied outright.
    pub fn read_only() -> Self {
        let allowed = [
            "ls", "cat", "head", "tail", "grep", "rg", "find", "wc", "file", "stat", "pwd",
            "echo", "which", "env", "du", "df", "ps", "tree", "git status", "git log",
            "git diff", "git show", "git branch", "sed -n", "awk",
        ];
        let denied = [
            ">", ">>", "rm", "mv", "cp", "chmod", "chown", "chgrp", "ln", "mkdir", "rmdir",
            "touch", "truncate", "dd", "tee", "sed -i", "sudo", "su ", "kill", "pkill",
            "killall", "shutdown", "reboot", "mkfs", "mount", "umount", "curl -o", "wget",
            "git push", "git commit", "git checkout", "git reset",
        ];
        Self {
            allowed: Some(allowed.iter().map(|s| s.to_string()).collect()),
            denied: Some(denied.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Check a command against the policy.
    pub fn check(&self, cmd: &str) -> Result<(), ToolError> {
        let cmd_lower = cmd.trim().to_lowercase();
        let first_word = cmd_lower.split_whitespace().next().unwrap_or("");
        let basename = first_word.rsplit('/').next().unwrap_or(first_word);

        if let Some(denied) = &self.denied {
            for entry in denied {
                let e = entry.to_lowercase();
                let hit = if e.contains(char::is_whitespace) || e.starts_with('>') {
                    cmd_lower.contains(&e)
                } else {
                    basename == e
                        || basename.starts_with(&format!("{} ", e))
                        || cmd_lower.starts_with(&format!("{} ", e))
                        || cmd_lower == e
                };
                if hit {
                    return Err(ToolError::ExecFailure(format!(
                        "command denied by policy: matches {:?}",
                        entry
                    )));
                }
            }
        }

        if let Some(allowed) = &self.allowed {
            let ok = allowed.iter().any(|entry| {
                let e = entry.to_lowercase();
                cmd_lower == e
                    || cmd_lower.starts_with(&format!("{} ", e))
                    || cmd_lower.starts_with(&e)
                        && e.contains(char::is_whitespace)
            });
            if !ok {
                return Err(ToolError::ExecFailure(
                    "command not in the read-only allow list".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Commands that obviously start a long-running dev server, paired with
/// the port they serve by default.
const SERVER_COMMANDS: &[(&str, u16)] = &[
    ("npm run dev", 5173),
    ("npm start", 3000),
    ("yarn dev", 5173),
    ("pnpm dev", 5173),
    ("npx vite", 5173),
    ("vite", 5173),
    ("next dev", 3000),
    ("python -m http.server", 8000),
    ("python3 -m http.server", 8000),
    ("flask run", 5000),
    ("uvicorn", 8000),
    ("gunicorn", 8000),
    ("rails s", 3000),
    ("php -S", 8000),
    ("http-server", 8080),
    ("node server", 3000),
];

lazy_static::lazy_static! {
    static ref PORT_RE: regex::Regex =
        regex::Regex::new(r"(?:--port[= ]|-p )(\d{2,5})|:(\d{4,5})\b|\s(\d{4,5})\s*$").unwrap();
}

/// Detect a server-style command and its expected port.
fn server_command(cmd: &str) -> Option<u16> {
    let trimmed = cmd.trim();
    if trimmed.ends_with('&') {
        // Already backgrounded by the model.
        return None;
    }
    let lower = trimmed.to_lowercase();
    let default_port = SERVER_COMMANDS
        .iter()
        .find(|(prefix, _)| lower.starts_with(prefix) || lower.contains(&format!(" {}", prefix)))
        .map(|(_, port)| *port)?;
    let port = PORT_RE
        .captures(trimmed)
        .and_then(|c| c.get(1).or_else(|| c.get(2)).or_else(|| c.get(3)))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(default_port);
    Some(port)
}

fn port_is_serving(port: u16) -> bool {
    TcpStream::connect_timeout(
        &([127, 0, 0, 1], port).into(),
        Duration::from_millis(300),
    )
    .is_ok()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(&["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// The `shell_execute` tool.
pub struct ShellTool {
    meta: ToolMetadata,
    workdir: PathBuf,
    policy: ShellPolicy,
    default_timeout_secs: u64,
    auto_detach: bool,
}

impl ShellTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let meta = ToolMetadata::new(
            "shell_execute",
            "Run a shell command in the workspace and return its combined output",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Command passed to sh -c"},
                    "timeout_seconds": {"type": "integer", "description": "Timeout in seconds (default 30)"}
                },
                "required": ["command"]
            }),
        );
        Self {
            meta,
            workdir: workdir.into(),
            policy: ShellPolicy::default(),
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            auto_detach: true,
        }
    }

    /// Restrict commands with an allow/deny policy (builder pattern).
    pub fn with_policy(mut self, policy: ShellPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the default timeout (builder pattern).
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    /// Disable the long-running-server detach heuristic.
    pub fn without_auto_detach(mut self) -> Self {
        self.auto_detach = false;
        self
    }

    /// Detach an obvious server command and verify the detachment.
    async fn detach_server(&self, cmd: &str, port: u16) -> Result<String, ToolError> {
        if port_is_serving(port) {
            // Something is already listening; treat the request as served
            // rather than racing a second instance onto the same port.
            return Ok(format!(
                "Port {} is already serving; not starting a second instance of: {}",
                port, cmd
            ));
        }

        let log_path = std::env::temp_dir().join(format!(
            "eai-detached-{}.log",
            uuid::Uuid::new_v4().simple()
        ));
        let wrapped = format!(
            "nohup {} >{} 2>&1 & echo $!",
            cmd,
            log_path.display()
        );
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&wrapped)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ToolError::ExecFailure(format!("failed to spawn: {}", e)))?;
        let pid: u32 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| ToolError::ExecFailure("detach did not report a pid".to_string()))?;

        // Give the server a moment to bind, then verify.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let alive = process_alive(pid);
        let serving = port_is_serving(port);
        if !alive && !serving {
            let tail = std::fs::read_to_string(&log_path).unwrap_or_default();
            return Err(ToolError::ExecFailure(format!(
                "detached command exited immediately: {}",
                crate::eai::llm_client::summarize_error_body(&tail)
            )));
        }
        info!("detached server command pid={} port={} serving={}", pid, port, serving);
        Ok(format!(
            "Started long-running command in the background (pid {}). Expected port: {} ({}). Logs: {}",
            pid,
            port,
            if serving { "serving" } else { "not yet serving" },
            log_path.display()
        ))
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.meta
    }

    async fn execute(
        &self,
        cancel: &CancelToken,
        arguments: serde_json::Value,
    ) -> Result<String, ToolError> {
        let cmd = arg_str(&arguments, "command")?;
        let timeout_secs =
            arg_u64_opt(&arguments, "timeout_seconds").unwrap_or(self.default_timeout_secs);
        self.policy.check(&cmd)?;

        if self.auto_detach {
            if let Some(port) = server_command(&cmd) {
                return self.detach_server(&cmd, port).await;
            }
        }

        let started = Instant::now();
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&cmd)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecFailure(format!("failed to spawn: {}", e)))?;

        let timeout = Duration::from_secs(timeout_secs);
        let waited = tokio::select! {
            out = child.wait_with_output() => out,
            _ = cancel.cancelled() => {
                return Err(ToolError::ExecFailure("command cancelled".to_string()));
            }
            _ = tokio::time::sleep(timeout) => {
                return Err(ToolError::ExecFailure(format!(
                    "command exceeded {} second timeout", timeout_secs
                )));
            }
        };
        let output = waited.map_err(|e| ToolError::ExecFailure(format!("wait failed: {}", e)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        debug!(
            "shell_execute finished in {} ms: {:?}",
            started.elapsed().as_millis(),
            cmd
        );

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ToolError::ExecFailure(format!(
                "exit status {}:\n{}",
                output.status.code().unwrap_or(-1),
                combined
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_policy_allows_inspection() {
        let policy = ShellPolicy::read_only();
        assert!(policy.check("ls -la").is_ok());
        assert!(policy.check("git status").is_ok());
        assert!(policy.check("grep -rn main src").is_ok());
    }

    #[test]
    fn read_only_policy_denies_mutation() {
        let policy = ShellPolicy::read_only();
        assert!(policy.check("rm -rf /tmp/x").is_err());
        assert!(policy.check("/bin/rm file").is_err());
        assert!(policy.check("echo hi > out.txt").is_err());
        assert!(policy.check("sed -i s/a/b/ file").is_err());
        assert!(policy.check("sudo apt install").is_err());
        assert!(policy.check("cargo build").is_err());
    }

    #[test]
    fn server_detection_and_ports() {
        assert_eq!(server_command("python3 -m http.server"), Some(8000));
        assert_eq!(server_command("python3 -m http.server 9001"), Some(9001));
        assert_eq!(server_command("npm run dev -- --port 4000"), Some(4000));
        assert_eq!(server_command("npm run dev &"), None);
        assert_eq!(server_command("ls -la"), None);
    }

    #[tokio::test]
    async fn executes_and_combines_output() {
        let tool = ShellTool::new(std::env::temp_dir());
        let out = tool
            .execute(
                &CancelToken::never(),
                json!({"command": "echo out; echo err 1>&2"}),
            )
            .await
            .unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let tool = ShellTool::new(std::env::temp_dir());
        let err = tool
            .execute(&CancelToken::never(), json!({"command": "exit 3"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit status 3"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let tool = ShellTool::new(std::env::temp_dir());
        let err = tool
            .execute(
                &CancelToken::never(),
                json!({"command": "sleep 5", "timeout_seconds": 1}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }
}
