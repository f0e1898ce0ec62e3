//! Engine utility binary.
//!
//! The only subcommand is `orchestrate-worker`, the worker half of the
//! pane-execution protocol: it runs one shard prompt and reports through
//! the result/progress files. Host products that embed the engine expose
//! the same subcommand from their own binary (wiring in their concrete
//! LLM client) and point `PaneExecutor` at it; this binary keeps the
//! protocol exercisable standalone, reporting a configuration error
//! through the result file when no backend is wired.

use clap::{Parser, Subcommand};
use eai::eai::llm_client::{LLMClient, RetryingClient, UnconfiguredClient};
use eai::eai::pane::{run_worker, WorkerInvocation};
use eai::EngineConfig;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "eai", version, about = "EAI agent engine utilities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one orchestrate shard and report through the result file.
    OrchestrateWorker {
        #[arg(long)]
        shard_id: String,
        #[arg(long, default_value_t = 1)]
        attempt: usize,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        result_file: PathBuf,
        #[arg(long)]
        progress_file: PathBuf,
    },
}

fn client_from_env(config: &EngineConfig) -> Arc<dyn LLMClient> {
    // The concrete LLM transport lives in the host product; standalone
    // the worker reports ConfigMissing through the protocol.
    let inner: Arc<dyn LLMClient> = Arc::new(UnconfiguredClient::new());
    Arc::new(RetryingClient::new(inner, config.llm_max_retries))
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command {
        Command::OrchestrateWorker {
            shard_id,
            attempt,
            prompt,
            result_file,
            progress_file,
        } => {
            let invocation = WorkerInvocation {
                shard_id,
                attempt,
                prompt,
                result_file,
                progress_file,
            };
            run_worker(client_from_env(&config), invocation).await;
        }
    }
}
