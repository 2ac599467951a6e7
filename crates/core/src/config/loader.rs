use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Environment variable prefix for overrides, e.g. `REGISTRY_DATABASE__PATH`.
pub const ENV_PREFIX: &str = "REGISTRY_";

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TaskType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_empty_uses_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.crawler.is_none());
        assert_eq!(config.orchestrator.task_plan.len(), 3);
        assert_eq!(config.orchestrator.task_plan[0], TaskType::Collect);
    }

    #[test]
    fn test_load_config_from_str_services() {
        let toml = r#"
[crawler]
url = "http://localhost:6800"
project = "kingfisher"
files_store = "/data/files"

[process]
url = "http://localhost:8000"
timeout_secs = 30

[orchestrator]
task_plan = ["collect", "process"]
concurrency = 4
"#;
        let config = load_config_from_str(toml).unwrap();
        let crawler = config.crawler.unwrap();
        assert_eq!(crawler.project, "kingfisher");
        assert_eq!(crawler.timeout_secs, 300);
        assert_eq!(config.process.unwrap().timeout_secs, 30);
        assert_eq!(
            config.orchestrator.task_plan,
            vec![TaskType::Collect, TaskType::Process]
        );
        assert_eq!(config.orchestrator.concurrency, 4);
    }

    #[test]
    fn test_load_config_from_str_unknown_task_type() {
        let toml = r#"
[orchestrator]
task_plan = ["collect", "teleport"]
"#;
        let result = load_config_from_str(toml);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[server]
host = "127.0.0.1"
port = 3000

[database]
path = "/var/lib/registry/registry.db"
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host.to_string(), "127.0.0.1");
        assert_eq!(
            config.database.path.to_str(),
            Some("/var/lib/registry/registry.db")
        );
    }
}
