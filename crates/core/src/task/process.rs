//! Processing task, tracked in the collection processing service.
//!
//! The crawler starts processing on its own, so `run` does nothing: this task
//! only waits for the original and compiled collections to complete.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::http::HttpService;
use super::{TaskError, TaskManager, TaskPoll, TaskScope};
use crate::config::ServiceConfig;
use crate::job::{NoteLevel, TaskNote};

const COMPILED_TRANSFORM: &str = "compile-releases";
const DUPLICATE_ID_WARNING: &str = "DuplicateIdValueWarning";
const MERGE_NOTE: &str = "OCDS Merge";

#[derive(Debug, Deserialize)]
struct TreeEntry {
    id: i64,
    #[serde(default)]
    transform_type: String,
    completed_at: Option<String>,
    #[serde(default)]
    expected_files_count: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    published_from: Option<String>,
    published_to: Option<String>,
    license: Option<String>,
    publication_policy: Option<String>,
    ocid_prefix: Option<String>,
}

pub struct ProcessTaskManager {
    http: HttpService,
}

impl ProcessTaskManager {
    pub fn new(config: &ServiceConfig) -> Result<Self, TaskError> {
        Ok(Self {
            http: HttpService::new(
                "process",
                &config.url,
                Duration::from_secs(config.timeout_secs),
            )?,
        })
    }

    fn collection_url(&self, id: impl std::fmt::Display, resource: Option<&str>) -> String {
        match resource {
            Some(resource) => self
                .http
                .url(&format!("api/collections/{}/{}/", id, resource)),
            None => self.http.url(&format!("api/collections/{}/", id)),
        }
    }
}

/// Parse a published date, tolerating the malformed timestamps some
/// publishers emit. Unparseable values are logged and dropped.
pub fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    let raw = value.filter(|v| !v.is_empty())?;
    let mut dt = raw.to_string();

    // 2023-10-27T17:14:07:00Z: the fraction is separated by a colon.
    if dt.ends_with('Z') && dt.matches(':').count() == 3 {
        if let Some(pos) = dt.rfind(':') {
            dt.replace_range(pos..pos + 1, ".");
        }
    }

    // 2024-05-01 16:30:04.160T12:00:00Z: a time appended to a datetime.
    if dt.contains(' ') && dt.contains("T12:00:00") {
        dt = dt.replace("T12:00:00", "").replace(' ', "T");
    }

    let parsed = if dt.len() == 10 {
        NaiveDate::parse_from_str(&dt, "%Y-%m-%d").ok()
    } else {
        DateTime::parse_from_rfc3339(&dt)
            .or_else(|_| DateTime::parse_from_str(&dt, "%Y-%m-%dT%H:%M:%S%.f%z"))
            .map(|dt| dt.date_naive())
            .ok()
    };

    if parsed.is_none() {
        warn!("Unable to parse date {:?}", raw);
    }
    parsed
}

/// Convert the processing service's notes to task notes.
///
/// Duplicate ID warnings are aggregated into one note per JSON path.
fn convert_notes(notes: &Map<String, Value>) -> Vec<TaskNote> {
    let mut converted = Vec::new();

    for level in [NoteLevel::Warning, NoteLevel::Error] {
        let mut merge_paths: BTreeMap<String, i64> = BTreeMap::new();

        let entries = notes
            .get(level.as_str())
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();

        for entry in entries {
            let (note, data) = match entry.as_array().map(Vec::as_slice) {
                Some([note, data, ..]) => (note, data.clone()),
                Some([note]) => (note, json!({})),
                _ => (entry, json!({})),
            };
            let note = note
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| note.to_string());

            if data.get("type").and_then(|t| t.as_str()) == Some(DUPLICATE_ID_WARNING) {
                if let Some(paths) = data.get("paths").and_then(|p| p.as_object()) {
                    for (path, count) in paths {
                        *merge_paths.entry(path.clone()).or_default() += count.as_i64().unwrap_or(1);
                    }
                } else if let Some(path) = data.get("path").and_then(|p| p.as_str()) {
                    *merge_paths.entry(path.to_string()).or_default() += 1;
                }
                continue;
            }

            converted.push(TaskNote {
                level,
                note,
                data,
            });
        }

        converted.extend(merge_paths.into_iter().map(|(path, count)| TaskNote {
            level,
            note: MERGE_NOTE.to_string(),
            data: json!({"path": path, "count": count}),
        }));
    }

    converted
}

#[async_trait]
impl TaskManager for ProcessTaskManager {
    fn name(&self) -> &str {
        "process"
    }

    fn final_output(&self) -> bool {
        false
    }

    async fn run(&self, _scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    async fn get_status(&self, scope: &mut TaskScope<'_>) -> Result<TaskPoll, TaskError> {
        let process_id = scope.job.context.process_id.clone().ok_or_else(|| {
            TaskError::Unexpected("Collection ID is not set".to_string())
        })?;

        let tree: Vec<TreeEntry> = self
            .http
            .send_json(
                self.http
                    .client()
                    .get(self.collection_url(&process_id, Some("tree"))),
                &format!("Unable to get status of collection {}", process_id),
            )
            .await?;

        let original = tree
            .iter()
            .find(|c| c.transform_type.is_empty())
            .ok_or_else(|| {
                TaskError::Unexpected(format!("Collection {} has no original collection", process_id))
            })?;
        let Some(compiled) = tree.iter().find(|c| c.transform_type == COMPILED_TRANSFORM) else {
            return Err(TaskError::Irrecoverable("No compiled collection".to_string()));
        };

        if original.completed_at.is_none() || compiled.completed_at.is_none() {
            return Ok(TaskPoll::Running);
        }

        let metadata: Option<Metadata> = self
            .http
            .send_json(
                self.http
                    .client()
                    .get(self.collection_url(compiled.id, Some("metadata"))),
                &format!("Unable to get metadata of collection {}", compiled.id),
            )
            .await?;

        // Metadata is empty (or partial) if the collection contained no data.
        if let Some(metadata) = metadata {
            let job = &mut *scope.job;
            job.date_from = parse_date(metadata.published_from.as_deref());
            job.date_to = parse_date(metadata.published_to.as_deref());
            job.license = metadata.license.unwrap_or_default();
            job.publication_policy = metadata.publication_policy.unwrap_or_default();
            job.ocid_prefix = metadata.ocid_prefix.unwrap_or_default();
        }
        scope.job.context.process_compiled_collection_id = Some(compiled.id);

        let notes: Map<String, Value> = self
            .http
            .send_json(
                self.http
                    .client()
                    .get(self.collection_url(original.id, Some("notes")))
                    .query(&[("level", "WARNING"), ("level", "ERROR")]),
                &format!("Unable to get notes of collection {}", original.id),
            )
            .await?;
        scope.replace_notes(convert_notes(&notes));

        if original.expected_files_count == Some(0) {
            return Err(TaskError::Irrecoverable("Collection is empty".to_string()));
        }

        Ok(TaskPoll::Completed)
    }

    async fn wipe(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        // Processing can start before this task does, so a started task isn't required.
        let Some(process_id) = scope.job.context.process_id.clone() else {
            warn!("{}: Unable to wipe collection (collection ID is not set)", scope);
            return Ok(());
        };

        info!("{}: Wiping data for collection {}", scope, process_id);
        match self
            .http
            .send(
                self.http
                    .client()
                    .delete(self.collection_url(&process_id, None)),
                &format!("Unable to wipe collection {}", process_id),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!("{}: Collection {} is already deleted", scope, process_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
