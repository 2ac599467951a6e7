//! Collection, job, task and note types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How often a collection should be retrieved again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetrievalFrequency {
    Monthly,
    HalfYearly,
    Annually,
    Never,
}

impl RetrievalFrequency {
    /// Days between retrievals, or `None` for `Never`.
    pub fn interval_days(&self) -> Option<i64> {
        match self {
            RetrievalFrequency::Monthly => Some(30),
            RetrievalFrequency::HalfYearly => Some(180),
            RetrievalFrequency::Annually => Some(365),
            RetrievalFrequency::Never => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalFrequency::Monthly => "MONTHLY",
            RetrievalFrequency::HalfYearly => "HALF_YEARLY",
            RetrievalFrequency::Annually => "ANNUALLY",
            RetrievalFrequency::Never => "NEVER",
        }
    }
}

impl FromStr for RetrievalFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MONTHLY" => Ok(RetrievalFrequency::Monthly),
            "HALF_YEARLY" => Ok(RetrievalFrequency::HalfYearly),
            "ANNUALLY" => Ok(RetrievalFrequency::Annually),
            "NEVER" => Ok(RetrievalFrequency::Never),
            other => Err(format!("unknown retrieval frequency: {}", other)),
        }
    }
}

/// Lifecycle of a job. `Completed` is terminal whether the job succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Planned,
    Running,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Planned => "PLANNED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLANNED" => Ok(JobStatus::Planned),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Planned,
    Running,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Planned => "PLANNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(TaskStatus::Waiting),
            "PLANNED" => Ok(TaskStatus::Planned),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a task. Absent until the task either fails or completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResult {
    Ok,
    Failed,
}

impl TaskResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResult::Ok => "OK",
            TaskResult::Failed => "FAILED",
        }
    }

    /// Parse the stored column, where the empty string means "no result".
    pub fn from_column(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(TaskResult::Ok),
            "FAILED" => Some(TaskResult::Failed),
            _ => None,
        }
    }
}

/// The external step a task drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Collect,
    Process,
    Pelican,
    Exporter,
    Flattener,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Collect => "collect",
            TaskType::Process => "process",
            TaskType::Pelican => "pelican",
            TaskType::Exporter => "exporter",
            TaskType::Flattener => "flattener",
        }
    }

    /// Every task type, in pipeline order.
    pub const ALL: [TaskType; 5] = [
        TaskType::Collect,
        TaskType::Process,
        TaskType::Pelican,
        TaskType::Exporter,
        TaskType::Flattener,
    ];

    /// The default plan, in execution order.
    ///
    /// Exporter and flattener tasks only complete when export workers consume
    /// `export-start` and `flatten-start`, so plans opt into them.
    pub fn default_plan() -> Vec<TaskType> {
        vec![TaskType::Collect, TaskType::Process, TaskType::Pelican]
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collect" => Ok(TaskType::Collect),
            "process" => Ok(TaskType::Process),
            "pelican" => Ok(TaskType::Pelican),
            "exporter" => Ok(TaskType::Exporter),
            "flattener" => Ok(TaskType::Flattener),
            other => Err(format!("unknown task type: {}", other)),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoteLevel {
    Warning,
    Error,
}

impl NoteLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteLevel::Warning => "WARNING",
            NoteLevel::Error => "ERROR",
        }
    }
}

impl FromStr for NoteLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WARNING" => Ok(NoteLevel::Warning),
            "ERROR" => Ok(NoteLevel::Error),
            other => Err(format!("unknown note level: {}", other)),
        }
    }
}

/// Counts of OCDS building blocks found in a compiled dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Coverage {
    pub tenders: i64,
    pub tenderers: i64,
    pub tenders_items: i64,
    pub parties: i64,
    pub awards: i64,
    pub awards_items: i64,
    pub awards_suppliers: i64,
    pub contracts: i64,
    pub contracts_items: i64,
    pub contracts_transactions: i64,
    pub documents: i64,
    pub plannings: i64,
    pub milestones: i64,
    pub amendments: i64,
}

/// A tracked publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: i64,
    /// Spider name used by the crawler.
    pub source_id: String,
    pub title: String,
    pub country: String,
    /// `None` means no schedule was set.
    pub retrieval_frequency: Option<RetrievalFrequency>,
    /// Frozen collections are never scheduled.
    pub frozen: bool,
    pub last_retrieved: Option<NaiveDate>,
    pub publication_policy: String,
    pub coverage: Coverage,
    /// The most recent job that completed successfully.
    pub active_job_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.source_id, self.id)
    }
}

/// Request to register a new collection.
#[derive(Debug, Clone, Default)]
pub struct NewCollection {
    pub source_id: String,
    pub title: String,
    pub country: String,
    pub retrieval_frequency: Option<RetrievalFrequency>,
    pub frozen: bool,
}

impl NewCollection {
    pub fn new(source_id: impl Into<String>) -> Self {
        let source_id = source_id.into();
        Self {
            title: source_id.clone(),
            source_id,
            ..Default::default()
        }
    }

    pub fn with_frequency(mut self, frequency: RetrievalFrequency) -> Self {
        self.retrieval_frequency = Some(frequency);
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    pub fn frozen(mut self, frozen: bool) -> Self {
        self.frozen = frozen;
        self
    }
}

/// Handles and enrichment data written by task managers.
///
/// Known keys are typed; anything else survives round-trips through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spider: Option<String>,
    /// Crawler job handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrapy_log: Option<String>,
    /// Collection ID in the processing service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_dropped_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_json_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_compiled_collection_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pelican_dataset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pelican_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One retrieval attempt of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub collection_id: i64,
    pub status: JobStatus,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub context: JobContext,
    /// Skip the cleanup sweep for this job.
    pub keep_all_data: bool,
    /// Set once the cleanup sweep wiped the job's temporary data.
    pub archived: bool,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub license: String,
    pub publication_policy: String,
    pub ocid_prefix: String,
    pub coverage: Coverage,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_complete(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub job_id: i64,
    /// 1-based position in the job's plan.
    pub order: u32,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub note: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Task {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed && self.result == Some(TaskResult::Ok)
    }

    pub fn failed(&self) -> bool {
        self.status == TaskStatus::Completed && self.result == Some(TaskResult::Failed)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.task_type, self.id)
    }
}

/// A warning or error recorded against a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNote {
    pub level: NoteLevel,
    pub note: String,
    #[serde(default)]
    pub data: Value,
}

impl TaskNote {
    pub fn warning(note: impl Into<String>, data: Value) -> Self {
        Self {
            level: NoteLevel::Warning,
            note: note.into(),
            data,
        }
    }

    pub fn error(note: impl Into<String>, data: Value) -> Self {
        Self {
            level: NoteLevel::Error,
            note: note.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retrieval_frequency_intervals() {
        assert_eq!(RetrievalFrequency::Monthly.interval_days(), Some(30));
        assert_eq!(RetrievalFrequency::HalfYearly.interval_days(), Some(180));
        assert_eq!(RetrievalFrequency::Annually.interval_days(), Some(365));
        assert_eq!(RetrievalFrequency::Never.interval_days(), None);
    }

    #[test]
    fn test_status_strings_parse_back() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::Planned,
            TaskStatus::Running,
            TaskStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
        assert_eq!(TaskResult::from_column(""), None);
        assert_eq!(TaskResult::from_column("FAILED"), Some(TaskResult::Failed));
    }

    #[test]
    fn test_task_type_serde_names() {
        let plan: Vec<TaskType> = serde_json::from_value(json!(["collect", "pelican"])).unwrap();
        assert_eq!(plan, vec![TaskType::Collect, TaskType::Pelican]);
        assert_eq!(TaskType::Flattener.to_string(), "flattener");
    }

    #[test]
    fn test_job_context_keeps_unknown_keys() {
        let raw = json!({
            "spider": "spain_zaragoza",
            "job_id": "abc",
            "process_compiled_collection_id": 12,
            "legacy_key": "kept"
        });

        let context: JobContext = serde_json::from_value(raw).unwrap();
        assert_eq!(context.spider.as_deref(), Some("spain_zaragoza"));
        assert_eq!(context.process_compiled_collection_id, Some(12));
        assert_eq!(context.extra.get("legacy_key"), Some(&json!("kept")));

        let back = serde_json::to_value(&context).unwrap();
        assert_eq!(back["legacy_key"], "kept");
        assert!(back.get("pelican_id").is_none());
    }

    #[test]
    fn test_coverage_defaults_missing_fields() {
        let coverage: Coverage = serde_json::from_value(json!({"tenders": 4})).unwrap();
        assert_eq!(coverage.tenders, 4);
        assert_eq!(coverage.awards, 0);
    }
}
