//! Cadence CLI - command-line front end for the cadence orchestrator
//!
//! Provides a `cadence` command that runs the UnifiedWorkflow against the
//! configured providers and inspects the phase catalogue and providers.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{phases, providers, run};

/// Cadence - multi-agent workflow orchestration over LLM providers
#[derive(Parser, Debug)]
#[command(
    name = "cadence",
    author,
    version,
    about = "Cadence - multi-agent workflow orchestration",
    long_about = "Cadence drives a twelve-phase workflow of specialized agents across a pool of LLM providers.\nWithout --config it runs against three built-in mock providers."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the UnifiedWorkflow for a prompt
    ///
    /// Executes all twelve phases, retrying failed gates through their
    /// retry edges until the iteration budget runs out.
    Run {
        /// The task to carry out
        prompt: String,

        /// Provider configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Restrict dispatch to this provider (repeatable)
        #[arg(short, long = "provider")]
        providers: Vec<String>,

        /// Maximum concurrently running agents
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Maximum passes through the workflow
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the workflow phases
    Phases {
        /// Print the workflow definition as JSON
        #[arg(long)]
        json: bool,
    },

    /// List configured providers
    Providers {
        /// Provider configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Probe each provider's health
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over --log-level when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    // Logs go to stderr so `--json` output stays parseable.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let outcome = match args.command {
        Command::Run { prompt, config, providers, max_parallel, max_iterations, json } => {
            run::execute(run::RunOptions {
                prompt,
                config,
                providers,
                max_parallel,
                max_iterations,
                json,
            })
            .await
        }
        Command::Phases { json } => phases::execute(json).map(|()| true),
        Command::Providers { config, check } => providers::execute(config.as_deref(), check).await,
    };

    match outcome {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(err) => {
            eprintln!("{} {err:#}", "Error:".red().bold());
            Ok(ExitCode::FAILURE)
        }
    }
}
