//! Run command implementation.
//!
//! Starts the UnifiedWorkflow for a prompt and prints a per-phase summary.

use crate::config;
use cadence_orchestrator::{
    Orchestrator, PhaseResult, PhaseStatus, RunStatus, WorkflowOptions, WorkflowRun,
};
use colored::Colorize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const OUTPUT_PREVIEW_LINES: usize = 12;

/// Options collected from the command line.
#[derive(Debug)]
pub struct RunOptions {
    pub prompt: String,
    pub config: Option<PathBuf>,
    pub providers: Vec<String>,
    pub max_parallel: Option<usize>,
    pub max_iterations: Option<u32>,
    pub json: bool,
}

/// Execute the run command. Returns whether the workflow succeeded.
pub async fn execute(options: RunOptions) -> anyhow::Result<bool> {
    let config = config::load(options.config.as_deref())?;
    let orchestrator = Orchestrator::new(config)?;

    let mut workflow_options = WorkflowOptions {
        max_parallel_agents: options.max_parallel,
        max_iterations: options.max_iterations,
        ..WorkflowOptions::default()
    };
    if !options.providers.is_empty() {
        workflow_options = workflow_options.with_providers(options.providers);
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling workflow");
            interrupt.cancel();
        }
    });
    let sweeper = orchestrator.spawn_cache_sweeper(cancel.child_token());

    if !options.json {
        println!("{}", "cadence run".bold().cyan());
        println!();
        let names: Vec<&str> =
            orchestrator.config().providers.iter().map(|p| p.name.as_str()).collect();
        println!("  {} Providers: {}", "•".dimmed(), names.join(", "));
        println!("  {} Prompt: {}", "•".dimmed(), options.prompt);
        println!();
    }

    let run = orchestrator
        .start_workflow_with_cancel(&options.prompt, workflow_options, cancel.clone())
        .await?;
    cancel.cancel();
    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Cache sweeper task ended abnormally");
        }
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_summary(&run);
    }
    Ok(run.status == RunStatus::Succeeded)
}

fn print_summary(run: &WorkflowRun) {
    for phase in &run.phases {
        println!("{}", phase_line(phase));
    }
    println!();

    let status = match run.status {
        RunStatus::Succeeded => "succeeded".green().bold(),
        RunStatus::Failed => "failed".red().bold(),
        RunStatus::Cancelled => "cancelled".yellow().bold(),
        RunStatus::Running => "running".normal(),
    };
    println!("Status: {status}");
    if let Some(error) = &run.error {
        println!("  {}", error.to_string().red());
    }
    println!(
        "  iterations: {}  peak parallel agents: {}  duration: {}ms",
        run.iterations,
        run.peak_parallel_agents,
        run.duration_ms().unwrap_or_default()
    );
    let stats = &run.recovery;
    let failures = stats.transient + stats.rate_limited + stats.authentication + stats.provider_down;
    if failures > 0 || stats.validation > 0 {
        println!(
            "  provider failures: {failures}  gate failures: {}",
            stats.validation
        );
    }

    if let Some(output) = run.final_output() {
        println!();
        println!("{}", "Final output:".bold());
        for line in output.lines().take(OUTPUT_PREVIEW_LINES) {
            println!("  {}", line.dimmed());
        }
    }
}

fn phase_line(phase: &PhaseResult) -> String {
    let (marker, status) = match phase.status {
        PhaseStatus::Succeeded => ("✓".green(), "succeeded".green()),
        PhaseStatus::Skipped => ("-".dimmed(), "skipped".dimmed()),
        PhaseStatus::Failed => ("✗".red(), "failed".red()),
        PhaseStatus::Pending | PhaseStatus::Running => ("…".normal(), "incomplete".normal()),
    };
    let mut line = format!(
        "  {marker} {:>2} {:<20} {status:<10} {}/{} subtasks  {}ms",
        phase.phase,
        phase.name,
        phase.succeeded_count(),
        phase.streams.len(),
        phase.duration_ms
    );
    if phase.attempt > 1 {
        line.push_str(&format!("  (attempt {})", phase.attempt).dimmed().to_string());
    }
    line
}
