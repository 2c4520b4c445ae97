//! Phases command implementation.

use cadence_orchestrator::WorkflowDefinition;
use cadence_orchestrator::workflow::PhaseWork;
use colored::Colorize;

/// Prints the UnifiedWorkflow phase catalogue.
pub fn execute(json: bool) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::unified();
    if json {
        println!("{}", serde_json::to_string_pretty(&definition)?);
        return Ok(());
    }

    println!("{}", "UnifiedWorkflow".bold().cyan());
    println!();
    for phase in &definition.phases {
        let retry = phase
            .retry_to
            .map(|target| format!("  on failure -> {target}").yellow().to_string())
            .unwrap_or_default();
        println!("  {:>2} {}{retry}", phase.id, phase.name.bold());
        match &phase.work {
            PhaseWork::Static { subtasks } => {
                for subtask in subtasks {
                    let after = if subtask.depends_on.is_empty() {
                        String::new()
                    } else {
                        format!(" (after {})", subtask.depends_on.join(", "))
                    };
                    println!("       {} {} [{}]{}", "•".dimmed(), subtask.key, subtask.role, after.dimmed());
                }
            }
            PhaseWork::FanOut { role, source } => {
                println!(
                    "       {} one {role} per work item from phase {source}",
                    "•".dimmed()
                );
            }
        }
    }
    Ok(())
}
