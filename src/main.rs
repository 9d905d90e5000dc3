use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use codeloop::agent::{Agent, AgentEngine, FunctionCallingBackend, GrammarBackend, MockBackend};
use codeloop::config::{Config, TaskOptions, DEFAULT_INPUT_TOKEN_LIMIT, DEFAULT_OUTPUT_TOKEN_LIMIT};
use codeloop::kernel::{CodeKernel, KernelManager};
use codeloop::llm::{CompletionClient, OpenAiClient};
use codeloop::tracing::{init_tracing, shutdown_tracing};
use codeloop::workspace::file_chunks;
use codeloop::{ResponseBridge, SessionRegistry};

#[derive(Parser)]
#[command(name = "codeloop")]
#[command(about = "LLM agent that writes and runs code in a local kernel")]
struct Args {
    /// OTLP collector for span export
    #[arg(long, env = "CODELOOP_OTLP_ENDPOINT", global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one prompt and print events as JSON lines
    Run(RunArgs),
    /// Copy a file out of a kernel workspace
    Download(DownloadArgs),
    /// Print the Prometheus metrics exposition
    Metrics,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    Mock,
    Openai,
    Grammar,
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long, value_enum, default_value = "mock")]
    backend: BackendKind,

    #[arg(short, long)]
    prompt: String,

    #[arg(long, env = "CODELOOP_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// Model server URL (OpenAI-compatible `/v1` root, or a completion server)
    #[arg(long, env = "CODELOOP_BASE_URL", default_value = "http://localhost:8080/v1")]
    base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, default_value = "python3")]
    kernel: String,

    /// Mock fixtures: JSON object of prompt -> responses
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Workspace root (one directory per kernel)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Local file to copy into the kernel workspace before the run
    #[arg(long = "upload")]
    uploads: Vec<PathBuf>,

    /// Report output only when each action ends
    #[arg(long)]
    no_streaming: bool,

    /// 0 on either limit restores all default options
    #[arg(long, default_value_t = DEFAULT_INPUT_TOKEN_LIMIT)]
    input_token_limit: u64,

    #[arg(long, default_value_t = DEFAULT_OUTPUT_TOKEN_LIMIT)]
    output_token_limit: u64,

    /// Kernel idle wait in seconds; 0 keeps the default
    #[arg(long, default_value_t = 0)]
    timeout: u64,
}

#[derive(clap::Args)]
struct DownloadArgs {
    /// File name inside the workspace, as reported in `output_files`
    filename: String,

    #[arg(long, default_value = "python3")]
    kernel: String,

    /// Workspace root (one directory per kernel)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Write here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn config_with_workspace(root: Option<&PathBuf>) -> Config {
    let mut config = Config::default();
    if let Some(root) = root {
        config.workspace.root = root.clone();
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_tracing("codeloop", args.otlp_endpoint.as_deref())?;

    let result = match args.command {
        Command::Run(run) => run_prompt(run).await,
        Command::Download(download) => download_file(download).await,
        Command::Metrics => {
            print!("{}", codeloop::metrics::render());
            Ok(())
        }
    };

    shutdown_tracing();
    result
}

async fn run_prompt(args: RunArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut config = config_with_workspace(args.workspace.as_ref());
    config.agent.model = args.model.clone();

    let mock = match args.fixtures.as_ref() {
        Some(path) => Some(MockBackend::from_file(path)?),
        None => None,
    };
    let kernels = KernelManager::new(config.kernel.clone(), &config.workspace);
    let sessions = SessionRegistry::new();

    let agent_config = config.agent.clone();
    let backend = args.backend;
    let base_url = args.base_url.clone();
    let api_key = args.api_key.clone();
    let model = agent_config.model.clone();
    let make_agent = move |kernel: Arc<dyn CodeKernel>| -> Arc<dyn Agent> {
        match backend {
            BackendKind::Mock => Arc::new(AgentEngine::new(mock.unwrap_or_default(), kernel, agent_config)),
            BackendKind::Openai => Arc::new(AgentEngine::new(
                FunctionCallingBackend::new(OpenAiClient::new(base_url, api_key), model),
                kernel,
                agent_config,
            )),
            BackendKind::Grammar => {
                let max_tokens = agent_config.max_completion_tokens;
                Arc::new(AgentEngine::new(
                    GrammarBackend::new(CompletionClient::new(base_url), model, max_tokens),
                    kernel,
                    agent_config,
                ))
            }
        }
    };

    let session = sessions.bind("cli", &kernels, &args.kernel, make_agent).await?;
    info!(session = %session.id(), kernel = %args.kernel, "Session ready");

    if !args.uploads.is_empty() {
        let mut chunks = Vec::new();
        for path in &args.uploads {
            chunks.extend(file_chunks(path, config.workspace.chunk_size).await?);
        }
        let summary = kernels
            .workspace(&args.kernel)?
            .upload(futures_util::stream::iter(chunks), config.workspace.max_upload_bytes)
            .await?;
        info!(files = ?summary.files, bytes = summary.bytes, "Uploaded files");
    }

    let options = TaskOptions {
        streaming: !args.no_streaming,
        input_token_limit: args.input_token_limit,
        output_token_limit: args.output_token_limit,
        timeout_secs: args.timeout,
    };
    let bridge = ResponseBridge::new(config.bridge.clone());
    let mut events = bridge.run_session(session, args.prompt, Some(options));

    let cancel = events.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling run");
            cancel.cancel();
        }
    });

    while let Some(frame) = events.next().await {
        println!("{}", frame.to_json()?);
        if frame.is_end() {
            break;
        }
    }

    kernels.shutdown_all().await;
    Ok(())
}

async fn download_file(args: DownloadArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = config_with_workspace(args.workspace.as_ref());
    let kernels = KernelManager::new(config.kernel.clone(), &config.workspace);
    let mut chunks = kernels
        .workspace(&args.kernel)?
        .download(&args.filename, config.workspace.chunk_size)
        .await?;

    let mut out: Box<dyn AsyncWrite + Unpin + Send> = match &args.output {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };
    let mut bytes = 0usize;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        bytes += chunk.data.len();
        out.write_all(&chunk.data).await?;
    }
    out.flush().await?;
    info!(file = %args.filename, bytes, "Downloaded file");
    Ok(())
}
