use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::orchestrator::OrchestratorConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Scrapyd-compatible crawler control service.
    #[serde(default)]
    pub crawler: Option<CrawlerConfig>,
    /// Collection processing service.
    #[serde(default)]
    pub process: Option<ServiceConfig>,
    /// Dataset quality service.
    #[serde(default)]
    pub pelican: Option<ServiceConfig>,
    #[serde(default)]
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Server configuration (status surface of the daemon)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("registry.db")
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

/// Crawler control service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlerConfig {
    /// Base URL (e.g., "http://localhost:6800")
    pub url: String,
    /// Scrapyd project the spiders are deployed under
    pub project: String,
    /// Directory where the crawler's file store writes crawl output
    pub files_store: PathBuf,
    /// Request timeout in seconds (default: 300)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Configuration shared by plain HTTP services
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    300
}

/// Export directory configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterConfig {
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            export_dir: default_export_dir(),
        }
    }
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}

/// Message queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Seconds before an unacknowledged delivery is handed out again.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    /// How often consumers poll for new messages (milliseconds).
    #[serde(default = "default_queue_poll_interval")]
    pub poll_interval_ms: u64,
    /// Seconds acknowledged messages are kept before consumers purge them.
    #[serde(default = "default_acked_retention")]
    pub acked_retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout(),
            poll_interval_ms: default_queue_poll_interval(),
            acked_retention_secs: default_acked_retention(),
        }
    }
}

fn default_visibility_timeout() -> u64 {
    3600
}

fn default_queue_poll_interval() -> u64 {
    1000
}

fn default_acked_retention() -> u64 {
    7 * 24 * 3600
}

/// Sanitized config for API responses (credentials in URLs redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crawler: Option<SanitizedCrawlerConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pelican_url: Option<String>,
    pub exporter: ExporterConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedCrawlerConfig {
    pub url: String,
    pub project: String,
    pub files_store: PathBuf,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            crawler: config.crawler.as_ref().map(|c| SanitizedCrawlerConfig {
                url: redact_url(&c.url),
                project: c.project.clone(),
                files_store: c.files_store.clone(),
            }),
            process_url: config.process.as_ref().map(|p| redact_url(&p.url)),
            pelican_url: config.pelican.as_ref().map(|p| redact_url(&p.url)),
            exporter: config.exporter.clone(),
            orchestrator: config.orchestrator.clone(),
        }
    }
}

/// Replace the userinfo part of a URL, if any, with `***`.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}
