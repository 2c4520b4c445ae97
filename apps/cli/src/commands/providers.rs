//! Providers command implementation.

use crate::config;
use cadence_orchestrator::Orchestrator;
use colored::Colorize;
use std::path::Path;

/// Lists configured providers; with `check`, probes each one.
///
/// Returns false when a checked provider reported unhealthy.
pub async fn execute(config_path: Option<&Path>, check: bool) -> anyhow::Result<bool> {
    let config = config::load(config_path)?;

    println!("{}", "Providers".bold().cyan());
    println!();
    for provider in &config.providers {
        let model = if provider.model.is_empty() { "-" } else { provider.model.as_str() };
        println!(
            "  {:<12} {:<18} model: {:<16} cost: {:<5} concurrency: {}",
            provider.name.bold(),
            format!("{:?}", provider.kind).dimmed(),
            model,
            provider.cost_weight,
            provider.max_concurrency
        );
    }

    if !check {
        return Ok(true);
    }

    println!();
    println!("{}", "Health:".bold());
    let orchestrator = Orchestrator::new(config)?;
    let mut all_healthy = true;
    for (name, status) in orchestrator.check_providers().await {
        if status.healthy {
            println!("  {} {name} ({}ms)", "✓".green(), status.latency_ms);
        } else {
            all_healthy = false;
            let message = status.message.unwrap_or_default();
            println!("  {} {name} {}", "✗".red(), message.red());
        }
    }
    Ok(all_healthy)
}
