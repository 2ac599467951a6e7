//! Process manager configuration.

use serde::{Deserialize, Serialize};

use crate::job::TaskType;

/// Configuration for the process manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Task types every new job runs, in order.
    #[serde(default = "TaskType::default_plan")]
    pub task_plan: Vec<TaskType>,

    /// How often the serve loop processes all collections (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// How often the serve loop runs the cleanup sweep (seconds).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Collections processed concurrently in one pass.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Crawls with a higher file error rate fail (0.0-1.0).
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Completed jobs older than this are deleted once a newer job succeeds,
    /// except the most recent backup.
    #[serde(default = "default_old_job_age_days")]
    pub old_job_age_days: i64,
}

fn default_interval() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_concurrency() -> usize {
    1
}

fn default_error_rate_threshold() -> f64 {
    0.15
}

fn default_old_job_age_days() -> i64 {
    365
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_plan: TaskType::default_plan(),
            interval_secs: default_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            concurrency: default_concurrency(),
            error_rate_threshold: default_error_rate_threshold(),
            old_job_age_days: default_old_job_age_days(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.task_plan, TaskType::default_plan());
        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.cleanup_interval_secs, 3600);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.error_rate_threshold, 0.15);
        assert_eq!(config.old_job_age_days, 365);
    }

    #[test]
    fn test_deserialize_minimal() {
        let config: OrchestratorConfig = toml::from_str("concurrency = 4").unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(
            config.task_plan,
            vec![TaskType::Collect, TaskType::Process, TaskType::Pelican]
        );
        assert_eq!(config.error_rate_threshold, 0.15);
    }

    #[test]
    fn test_deserialize_plan() {
        let toml = r#"
            task_plan = ["collect", "process", "exporter"]
            interval_secs = 30
            error_rate_threshold = 0.05
        "#;
        let config: OrchestratorConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.task_plan,
            vec![TaskType::Collect, TaskType::Process, TaskType::Exporter]
        );
        assert_eq!(config.interval_secs, 30);
        assert_eq!(config.error_rate_threshold, 0.05);
    }
}
