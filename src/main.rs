//! Thin CLI surface over [`autonoma::orchestrator::Orchestrator`]. Deeper
//! interactive CLI ergonomics (TUI, live dashboards) are out of scope —
//! this binary exists to start, resume, and inspect a single orchestration
//! run in a working directory.

use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use autonoma::orchestrator::{CycleOutcome, ExitCode, Orchestrator};

#[derive(Parser)]
#[command(name = "autonoma", about = "Orchestration engine for a hierarchy of LLM coding agents")]
struct Cli {
    /// Working directory the orchestration operates in. Defaults to the
    /// current directory.
    #[arg(long, global = true)]
    working_dir: Option<PathBuf>,

    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new orchestration against a requirements document.
    Start {
        /// Path to the requirements document, relative to the working directory.
        #[arg(long, default_value = "REQUIREMENTS.md")]
        requirements: String,
    },
    /// Resume an existing orchestration from its saved state.
    Resume,
    /// Adopt an existing codebase: discover a requirements-like document
    /// already in the working directory and start from there, unless one
    /// is named explicitly.
    Adopt {
        /// Path to the requirements document, relative to the working
        /// directory. Auto-discovered (REQUIREMENTS.md, SPEC.md, spec.md)
        /// when omitted.
        #[arg(long)]
        requirements: Option<String>,
        /// Extra project documents for Planning to read alongside the
        /// requirements document. May be repeated.
        #[arg(long = "context-path")]
        context_paths: Vec<String>,
    },
    /// Advance the orchestration by exactly one phase-loop step and exit,
    /// instead of looping until a terminal or blocking state.
    RunOnce {
        /// Path to the requirements document, used only if no state.json
        /// exists yet.
        #[arg(long, default_value = "REQUIREMENTS.md")]
        requirements: String,
    },
    /// Print the current status snapshot and exit without advancing state.
    Status,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> ProcessExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let working_dir = cli
        .working_dir
        .unwrap_or_else(|| std::env::current_dir().expect("current directory is accessible"));

    let result = match cli.command {
        Command::Start { requirements } => Orchestrator::start(working_dir, requirements).await,
        Command::Resume => Orchestrator::resume(working_dir).await,
        Command::Adopt {
            requirements,
            context_paths,
        } => Orchestrator::adopt(working_dir, requirements, context_paths).await,
        Command::RunOnce { requirements } => {
            return match Orchestrator::run_one_cycle(working_dir, requirements).await {
                Ok(CycleOutcome::InProgress) => {
                    println!("in-progress");
                    ProcessExitCode::SUCCESS
                }
                Ok(CycleOutcome::Terminal(exit)) => ProcessExitCode::from(exit_code_byte(exit)),
                Err(e) => {
                    eprintln!("error: {e}");
                    ProcessExitCode::FAILURE
                }
            };
        }
        Command::Status => {
            return match Orchestrator::status(&working_dir) {
                Ok(status) => {
                    println!("{}", serde_json::to_string_pretty(&status).expect("status serializes"));
                    ProcessExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ProcessExitCode::FAILURE
                }
            };
        }
    };

    match result {
        Ok(exit) => ProcessExitCode::from(exit_code_byte(exit)),
        Err(e) => {
            eprintln!("error: {e}");
            ProcessExitCode::FAILURE
        }
    }
}

fn exit_code_byte(exit: ExitCode) -> u8 {
    match exit {
        ExitCode::Complete => 0,
        ExitCode::Failed => 1,
        ExitCode::Timeout => 2,
        ExitCode::Blocked => 3,
        ExitCode::Interrupted => 130,
    }
}
