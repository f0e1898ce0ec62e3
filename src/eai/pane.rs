//! Pane-worker shard execution.
//!
//! An optional [`ShardExecutor`] that runs each shard in a worker process
//! spawned into a pane of an external tmux multiplexer. The parent and
//! worker rendezvous over two temp files:
//!
//! - a **result file**: the worker writes one JSON document
//!   (`{shard_id, attempt, output, error, cache_hit, duration_ms}`) via a
//!   temp-file-plus-rename so the parent's ~70 ms poll only ever observes
//!   a complete document. The appearance of valid JSON *is* the done
//!   signal.
//! - a **progress file**: the worker appends JSONL lines
//!   (`{kind?, text}`) which the parent tails and forwards to the
//!   progress handler.
//!
//! Pane execution is skipped when tmux is absent or disabled, or when
//! this process is itself a worker (`EAI_TMUX_WORKER`): workers never
//! recurse into pane spawning. Only a fixed set of `EAI_*` variables is
//! forwarded into the pane; the worker inherits nothing else from the
//! parent's environment. Panes are killed on return and on cancellation.

use crate::eai::cancel::CancelToken;
use crate::eai::config::EngineConfig;
use crate::eai::event::{emit, EventHandler, ProgressEvent};
use crate::eai::llm_client::{LLMClient, LLMError, LLMErrorKind};
use crate::eai::scheduler::{ShardExecutor, TaskShard};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Result document written by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub shard_id: String,
    pub attempt: usize,
    pub output: String,
    pub error: Option<String>,
    pub cache_hit: bool,
    pub duration_ms: u64,
}

/// One progress line appended by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub text: String,
}

/// Parsed `orchestrate-worker` invocation.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub shard_id: String,
    pub attempt: usize,
    pub prompt: String,
    pub result_file: PathBuf,
    pub progress_file: PathBuf,
}

/// Environment variables forwarded into worker panes. Everything else is
/// withheld.
pub const FORWARDED_ENV: &[&str] = &[
    "EAI_API_KEY",
    "EAI_API_BASE_URL",
    "EAI_MODEL",
    "EAI_LLM_MAX_RETRIES",
    "EAI_LLM_REQUEST_TIMEOUT_SEC",
    "EAI_HTTP_TIMEOUT_SEC",
    "EAI_ORCHESTRATE_SHARD_TIMEOUT_SEC",
    "EAI_PERMISSIONS_MODE",
];

/// Poll interval for the result file.
const RESULT_POLL: Duration = Duration::from_millis(70);

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Whether tmux is runnable on this host.
pub fn tmux_present() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Pane-spawning [`ShardExecutor`].
pub struct PaneExecutor {
    /// The worker binary, invoked as `<exe> orchestrate-worker …`.
    worker_exe: PathBuf,
    headless: bool,
    handler: Option<Arc<dyn EventHandler>>,
    /// Overall wait budget per shard before the pane is abandoned.
    wait_budget: Duration,
}

impl PaneExecutor {
    pub fn new(worker_exe: impl Into<PathBuf>, handler: Option<Arc<dyn EventHandler>>) -> Self {
        Self {
            worker_exe: worker_exe.into(),
            headless: false,
            handler,
            wait_budget: Duration::from_secs(600),
        }
    }

    /// Spawn into a detached session instead of splitting the current
    /// window (for hosts without an attached client).
    pub fn headless(mut self) -> Self {
        self.headless = true;
        self
    }

    pub fn with_wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = budget;
        self
    }

    /// Whether pane execution applies under this configuration: tmux must
    /// be present, not disabled, and this process must not itself be a
    /// worker.
    pub fn available(config: &EngineConfig) -> bool {
        !config.tmux_disable && !config.tmux_worker && tmux_present()
    }

    fn worker_command(&self, shard: &TaskShard, prompt: &str, attempt: usize, result: &Path, progress: &Path) -> String {
        let mut cmd = String::new();
        for name in FORWARDED_ENV {
            if let Ok(value) = std::env::var(name) {
                cmd.push_str(&format!("{}={} ", name, shell_quote(&value)));
            }
        }
        cmd.push_str("EAI_TMUX_WORKER=1 ");
        cmd.push_str(&format!(
            "{} orchestrate-worker --shard-id {} --attempt {} --prompt {} --result-file {} --progress-file {}",
            shell_quote(&self.worker_exe.to_string_lossy()),
            shell_quote(&shard.id),
            attempt,
            shell_quote(prompt),
            shell_quote(&result.to_string_lossy()),
            shell_quote(&progress.to_string_lossy()),
        ));
        cmd
    }

    async fn spawn_pane(&self, shard_id: &str, command: &str) -> Result<String, LLMError> {
        let output = if self.headless {
            let session = format!("eai-worker-{}", uuid::Uuid::new_v4().simple());
            tokio::process::Command::new("tmux")
                .args(&[
                    "new-session",
                    "-d",
                    "-P",
                    "-F",
                    "#{pane_id}",
                    "-s",
                    session.as_str(),
                    command,
                ])
                .output()
                .await
        } else {
            tokio::process::Command::new("tmux")
                .args(&["split-window", "-d", "-P", "-F", "#{pane_id}", command])
                .output()
                .await
        };
        let output = output.map_err(|e| {
            LLMError::new(
                LLMErrorKind::Transient,
                format!("failed to invoke tmux for shard {}: {}", shard_id, e),
            )
        })?;
        if !output.status.success() {
            return Err(LLMError::new(
                LLMErrorKind::Transient,
                format!(
                    "tmux refused to spawn a pane: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn kill_pane(&self, pane_id: &str) {
        let result = tokio::process::Command::new("tmux")
            .args(&["kill-pane", "-t", pane_id])
            .output()
            .await;
        if let Err(err) = result {
            debug!("failed to kill pane {}: {}", pane_id, err);
        }
    }

    /// Forward any new progress lines, returning the updated file offset.
    async fn tail_progress(&self, shard: &TaskShard, path: &Path, offset: u64) -> u64 {
        let content = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(_) => return offset,
        };
        if (content.len() as u64) <= offset {
            return offset;
        }
        let fresh = String::from_utf8_lossy(&content[offset as usize..]).to_string();
        // Only complete lines; a partial trailing line waits for the next
        // poll.
        let consumed = match fresh.rfind('\n') {
            Some(last) => last + 1,
            None => return offset,
        };
        for line in fresh[..consumed].lines() {
            if line.trim().is_empty() {
                continue;
            }
            let text = match serde_json::from_str::<WorkerProgress>(line) {
                Ok(progress) => progress.text,
                Err(_) => line.to_string(),
            };
            emit(
                &self.handler,
                ProgressEvent::CompanionDelta {
                    label: format!("Companion {}", shard.index + 1),
                    text,
                },
            )
            .await;
        }
        offset + consumed as u64
    }
}

#[async_trait]
impl ShardExecutor for PaneExecutor {
    async fn execute(
        &self,
        cancel: &CancelToken,
        shard: &TaskShard,
        prompt: &str,
        attempt: usize,
    ) -> Result<String, LLMError> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let result_file = std::env::temp_dir().join(format!("eai-shard-{}.json", run_id));
        let progress_file = std::env::temp_dir().join(format!("eai-shard-{}.progress", run_id));

        let command = self.worker_command(shard, prompt, attempt, &result_file, &progress_file);
        emit(
            &self.handler,
            ProgressEvent::OrchestrateTmuxSpawn {
                shard_id: shard.id.clone(),
            },
        )
        .await;
        let pane_id = self.spawn_pane(&shard.id, &command).await?;
        emit(
            &self.handler,
            ProgressEvent::OrchestrateTmuxWait {
                shard_id: shard.id.clone(),
            },
        )
        .await;

        let deadline = Instant::now() + self.wait_budget;
        let mut progress_offset = 0u64;
        let worker_result = loop {
            if cancel.is_cancelled() {
                self.kill_pane(&pane_id).await;
                cleanup(&result_file, &progress_file).await;
                return Err(LLMError::cancelled());
            }
            if Instant::now() >= deadline {
                self.kill_pane(&pane_id).await;
                cleanup(&result_file, &progress_file).await;
                return Err(LLMError::new(
                    LLMErrorKind::Transient,
                    format!("pane worker for shard {} never produced a result", shard.id),
                ));
            }

            progress_offset = self
                .tail_progress(shard, &progress_file, progress_offset)
                .await;

            // Done purely when a complete JSON document appears.
            if let Ok(body) = tokio::fs::read_to_string(&result_file).await {
                if let Ok(result) = serde_json::from_str::<WorkerResult>(&body) {
                    break result;
                }
            }
            tokio::time::sleep(RESULT_POLL).await;
        };

        self.kill_pane(&pane_id).await;
        cleanup(&result_file, &progress_file).await;

        emit(
            &self.handler,
            ProgressEvent::OrchestrateTmuxWorkerLlm {
                shard_id: shard.id.clone(),
                duration_ms: worker_result.duration_ms,
            },
        )
        .await;

        match worker_result.error {
            Some(error) => Err(LLMError::from_text(error)),
            None => Ok(worker_result.output),
        }
    }
}

async fn cleanup(result_file: &Path, progress_file: &Path) {
    let _ = tokio::fs::remove_file(result_file).await;
    let _ = tokio::fs::remove_file(progress_file).await;
}

/// Append one progress line to the worker's progress file.
async fn append_progress(path: &Path, progress: &WorkerProgress) -> std::io::Result<()> {
    let mut line = serde_json::to_string(progress)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await
}

/// Worker-side entry point: execute the prompt, stream progress, write
/// the result document atomically.
///
/// Invoked by the host binary's `orchestrate-worker` subcommand. The
/// function itself never fails the process; every failure is reported
/// through the result file so the parent's poll always terminates.
pub async fn run_worker(client: Arc<dyn LLMClient>, invocation: WorkerInvocation) {
    let started = Instant::now();
    let _ = append_progress(
        &invocation.progress_file,
        &WorkerProgress {
            kind: Some("start".to_string()),
            text: format!("shard {} attempt {}", invocation.shard_id, invocation.attempt),
        },
    )
    .await;

    let progress_file = invocation.progress_file.clone();
    let observer = move |fragment: &str| {
        // The observer is synchronous; progress appends go through a
        // blocking write to keep line ordering.
        let line = WorkerProgress {
            kind: None,
            text: fragment.to_string(),
        };
        if let Ok(mut json) = serde_json::to_string(&line) {
            json.push('\n');
            let open = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&progress_file);
            if let Ok(mut file) = open {
                use std::io::Write;
                let _ = file.write_all(json.as_bytes());
            }
        }
    };

    let cancel = CancelToken::never();
    let outcome = client
        .complete_with_observer(&cancel, &invocation.prompt, &observer)
        .await;

    let result = match outcome {
        Ok(output) => WorkerResult {
            shard_id: invocation.shard_id.clone(),
            attempt: invocation.attempt,
            output,
            error: None,
            cache_hit: false,
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Err(err) => WorkerResult {
            shard_id: invocation.shard_id.clone(),
            attempt: invocation.attempt,
            output: String::new(),
            error: Some(err.user_message()),
            cache_hit: false,
            duration_ms: started.elapsed().as_millis() as u64,
        },
    };

    if let Err(err) = write_result_atomically(&invocation.result_file, &result).await {
        warn!("worker could not write result file: {}", err);
    }
}

/// Write the result via temp file + rename so the parent never reads a
/// torn document.
async fn write_result_atomically(path: &Path, result: &WorkerResult) -> std::io::Result<()> {
    let body = serde_json::to_vec(result)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn atomic_result_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        let result = WorkerResult {
            shard_id: "7".to_string(),
            attempt: 1,
            output: "done".to_string(),
            error: None,
            cache_hit: false,
            duration_ms: 42,
        };
        write_result_atomically(&path, &result).await.unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        let parsed: WorkerResult = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.shard_id, "7");
        assert_eq!(parsed.output, "done");
        assert!(!dir.path().join("result.json.tmp").exists());
    }

    #[tokio::test]
    async fn progress_lines_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        append_progress(
            &path,
            &WorkerProgress {
                kind: Some("start".to_string()),
                text: "one".to_string(),
            },
        )
        .await
        .unwrap();
        append_progress(
            &path,
            &WorkerProgress {
                kind: None,
                text: "two".to_string(),
            },
        )
        .await
        .unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: WorkerProgress = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind.as_deref(), Some("start"));
        let second: WorkerProgress = serde_json::from_str(lines[1]).unwrap();
        assert!(second.kind.is_none());
    }
}
