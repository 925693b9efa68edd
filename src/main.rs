use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labkernel::agent::{load_system_prompt, ConversationController, SessionManager, TurnOutcome, TurnResult};
use labkernel::kernel::{ExecutionDriver, KernelRegistry, ProcessLauncher};
use labkernel::llm::OllamaChatClient;
use labkernel::transcript::{Cell, TranscriptStore};
use labkernel::{metrics, Settings};

#[derive(Parser)]
#[command(name = "labkernel")]
#[command(about = "Run LLM analysis sessions against persistent Python kernels")]
struct Cli {
    /// OTLP collector for span export (overrides OTEL_EXPORTER_OTLP_ENDPOINT)
    #[arg(long, global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (/new, /file <path>, /sessions, /switch <id>, /quit)
    Chat,
    /// Send one message to a project and print the final answer
    Run {
        /// Project id; created if unknown
        #[arg(short, long)]
        project: String,
        /// The user message
        message: String,
    },
    /// Print a project's transcript
    Transcript {
        #[arg(short, long)]
        project: String,
    },
    /// Print Prometheus metrics
    Metrics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    if cli.otlp_endpoint.is_some() {
        settings.otlp_endpoint = cli.otlp_endpoint.clone();
    }

    labkernel::tracing::init_tracing("labkernel", settings.otlp_endpoint.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?;

    let result = match cli.command {
        Commands::Chat => run_chat(&settings).await,
        Commands::Run { project, message } => run_once(&settings, &project, &message).await,
        Commands::Transcript { project } => print_transcript(&settings, &project).await,
        Commands::Metrics => {
            print!("{}", metrics::gather_text()?);
            Ok(())
        }
    };

    labkernel::tracing::shutdown_tracing();
    result
}

fn build_sessions(settings: &Settings) -> anyhow::Result<SessionManager> {
    let launcher = Arc::new(ProcessLauncher::new(settings.kernel.clone()));
    let registry = Arc::new(KernelRegistry::new(launcher));
    let driver = Arc::new(ExecutionDriver::new(registry, settings.kernel.message_timeout));
    let transcripts = Arc::new(TranscriptStore::new(
        settings.transcript.dir.clone(),
        settings.transcript.corrupt_policy,
    )?);
    let provider = Arc::new(OllamaChatClient::new(
        settings.ollama_url.clone(),
        settings.agent.model.clone(),
        settings.provider_timeout,
    )?);

    let system_prompt = settings
        .agent
        .system_prompt
        .clone()
        .unwrap_or_else(|| load_system_prompt(&settings.system_prompt_path));

    let controller = Arc::new(
        ConversationController::new(provider, driver, transcripts, settings.agent.clone())
            .context("invalid code fence languages")?,
    );
    Ok(SessionManager::new(controller, system_prompt, settings.init_code.clone()))
}

/// Cancel `token` on Ctrl-C until the returned task is aborted
fn cancel_on_ctrl_c(token: &CancellationToken) -> JoinHandle<()> {
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            trigger.cancel();
        }
    })
}

fn print_turn(turn: &TurnResult) {
    println!("{}", turn.final_response);
    if turn.outcome == TurnOutcome::Inconclusive {
        println!(
            "\n[labkernel] stopped after {} rounds without a final answer (trace {})",
            turn.rounds, turn.trace_id
        );
    }
}

async fn run_once(settings: &Settings, project: &str, message: &str) -> anyhow::Result<()> {
    let sessions = build_sessions(settings)?;
    let cancel = CancellationToken::new();
    let listener = cancel_on_ctrl_c(&cancel);

    let result = async {
        sessions.initiate_with_id(project).await?;
        sessions.chat(project, message, &cancel).await
    }
    .await;

    listener.abort();
    sessions.shutdown().await;
    print_turn(&result?);
    Ok(())
}

async fn run_chat(settings: &Settings) -> anyhow::Result<()> {
    let sessions = build_sessions(settings)?;
    let result = chat_loop(&sessions).await;
    sessions.shutdown().await;
    result
}

async fn chat_loop(sessions: &SessionManager) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let mut current = sessions.initiate().await?;
    println!("Session {}", current);

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/new", _) => {
                current = sessions.initiate().await?;
                println!("Session {}", current);
            }
            ("/sessions", _) => {
                for s in sessions.list_sessions().await {
                    let marker = if s.id == current { "*" } else { " " };
                    println!(
                        "{} {}  {}  messages={} files={} executions={}",
                        marker,
                        s.id,
                        s.created_at.format("%Y-%m-%d %H:%M:%S"),
                        s.messages,
                        s.files,
                        s.executions
                    );
                }
            }
            ("/switch", id) => {
                let id = id.trim();
                if sessions.contains(id) {
                    current = id.to_string();
                    println!("Session {}", current);
                } else {
                    println!("Unknown session: {}", id);
                }
            }
            ("/file", path) => {
                let path = PathBuf::from(path.trim());
                match std::fs::canonicalize(&path) {
                    Ok(full) => {
                        let name = full
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| full.display().to_string());
                        sessions.register_file(&current, name, full).await?;
                        println!("Registered {}", path.display());
                    }
                    Err(e) => println!("Cannot use {}: {}", path.display(), e),
                }
            }
            _ => {
                let cancel = CancellationToken::new();
                let listener = cancel_on_ctrl_c(&cancel);
                let result = sessions.chat(&current, line, &cancel).await;
                listener.abort();
                match result {
                    Ok(turn) => print_turn(&turn),
                    Err(e) => println!("Error: {}", e),
                }
            }
        }
    }
    Ok(())
}

async fn print_transcript(settings: &Settings, project: &str) -> anyhow::Result<()> {
    let store = TranscriptStore::new(settings.transcript.dir.clone(), settings.transcript.corrupt_policy)?;
    let doc = store
        .load(project)
        .await
        .with_context(|| format!("failed to load transcript for {}", project))?;

    for cell in &doc.cells {
        match cell {
            Cell::Code { source } => println!("```python\n{}\n```\n", source),
            Cell::Note { content } => println!("{}\n", content),
        }
    }
    Ok(())
}
