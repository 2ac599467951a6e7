use std::collections::HashSet;

use super::{types::Config, ConfigError};
use crate::job::TaskType;

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Task plan is non-empty and lists each task type at most once
/// - Every planned task has its service configured
/// - Orchestrator concurrency and error-rate threshold are in range
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    let orchestrator = &config.orchestrator;

    if orchestrator.task_plan.is_empty() {
        return Err(ConfigError::ValidationError(
            "orchestrator.task_plan cannot be empty".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for task_type in &orchestrator.task_plan {
        if !seen.insert(task_type) {
            return Err(ConfigError::ValidationError(format!(
                "orchestrator.task_plan lists '{}' more than once",
                task_type
            )));
        }

        let missing = match task_type {
            TaskType::Collect => config.crawler.is_none().then_some("crawler"),
            TaskType::Process => config.process.is_none().then_some("process"),
            TaskType::Pelican => config.pelican.is_none().then_some("pelican"),
            TaskType::Exporter | TaskType::Flattener => None,
        };
        if let Some(section) = missing {
            return Err(ConfigError::ValidationError(format!(
                "task '{}' is planned but [{}] is not configured",
                task_type, section
            )));
        }
    }

    if orchestrator.concurrency == 0 {
        return Err(ConfigError::ValidationError(
            "orchestrator.concurrency must be at least 1".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&orchestrator.error_rate_threshold) {
        return Err(ConfigError::ValidationError(
            "orchestrator.error_rate_threshold must be between 0 and 1".to_string(),
        ));
    }

    if let Some(crawler) = &config.crawler {
        if crawler.project.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "crawler.project cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrawlerConfig, ServiceConfig};
    use crate::orchestrator::OrchestratorConfig;
    use std::path::PathBuf;

    fn full_config() -> Config {
        Config {
            crawler: Some(CrawlerConfig {
                url: "http://localhost:6800".to_string(),
                project: "kingfisher".to_string(),
                files_store: PathBuf::from("/tmp/files"),
                timeout_secs: 10,
            }),
            process: Some(ServiceConfig {
                url: "http://localhost:8000".to_string(),
                timeout_secs: 10,
            }),
            pelican: Some(ServiceConfig {
                url: "http://localhost:8001".to_string(),
                timeout_secs: 10,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&full_config()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let mut config = full_config();
        config.server.port = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_empty_plan_fails() {
        let mut config = full_config();
        config.orchestrator.task_plan.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_duplicate_plan_entry_fails() {
        let mut config = full_config();
        config.orchestrator.task_plan = vec![TaskType::Collect, TaskType::Collect];
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_missing_service_fails() {
        let mut config = full_config();
        config.pelican = None;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("[pelican]"));
    }

    #[test]
    fn test_validate_plan_without_http_services() {
        let config = Config {
            orchestrator: OrchestratorConfig {
                task_plan: vec![TaskType::Exporter, TaskType::Flattener],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_threshold_out_of_range() {
        let mut config = full_config();
        config.orchestrator.error_rate_threshold = 1.5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = full_config();
        config.orchestrator.concurrency = 0;
        assert!(validate_config(&config).is_err());
    }
}
