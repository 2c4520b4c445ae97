//! Configuration loading for the CLI.
//!
//! The orchestrator core never reads files; this module turns a TOML file
//! (or the bundled demo) into a validated `OrchestratorConfig`.

use anyhow::Context;
use cadence_orchestrator::OrchestratorConfig;
use std::path::Path;

/// Three mock providers, used when no `--config` is given.
pub const DEMO_CONFIG: &str = include_str!("demo.toml");

/// Loads and validates a configuration file, or the demo configuration.
pub fn load(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let (text, source) = match path {
        Some(path) => (
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?,
            path.display().to_string(),
        ),
        None => (DEMO_CONFIG.to_string(), "built-in demo".to_string()),
    };
    parse(&text).with_context(|| format!("Invalid configuration ({source})"))
}

fn parse(text: &str) -> anyhow::Result<OrchestratorConfig> {
    let config: OrchestratorConfig = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_models::ProviderKind;

    #[test]
    fn test_demo_config_is_valid() {
        let config = load(None).unwrap();
        let names: Vec<&str> = config.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["swift", "steady", "budget"]);
        assert!(config.providers.iter().all(|p| p.kind == ProviderKind::Mock));
        assert_eq!(config.coordinator.max_parallel_agents, 4);
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse("[[providers]]\nname = \"local\"\nkind = \"mock\"\n").unwrap();
        assert_eq!(config.workflow.max_iterations, 3);
        assert!((config.scoring.latency - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_without_providers_rejected() {
        assert!(parse("[workflow]\nmax_iterations = 2\n").is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load(Some(Path::new("/nonexistent/cadence.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cadence.toml"));
    }
}
