//! Crawl task, driven through a Scrapyd-compatible crawler service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::http::HttpService;
use super::scrapy_log::ScrapyLog;
use super::{TaskError, TaskManager, TaskPoll, TaskScope};
use crate::config::CrawlerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrawlState {
    Pending,
    Running,
    Finished,
}

pub struct CollectTaskManager {
    http: HttpService,
    project: String,
    files_store: PathBuf,
    error_rate_threshold: f64,
}

impl CollectTaskManager {
    pub fn new(config: &CrawlerConfig, error_rate_threshold: f64) -> Result<Self, TaskError> {
        Ok(Self {
            http: HttpService::new(
                "crawler",
                &config.url,
                Duration::from_secs(config.timeout_secs),
            )?,
            project: config.project.clone(),
            files_store: config.files_store.clone(),
            error_rate_threshold,
        })
    }

    fn log_url(&self, spider: &str, job_id: &str) -> String {
        self.http
            .url(&format!("logs/{}/{}/{}.log", self.project, spider, job_id))
    }

    async fn read_log(&self, url: &str) -> Result<String, TaskError> {
        let response = self
            .http
            .send(self.http.client().get(url), "Unable to read Scrapy log")
            .await?;
        response
            .text()
            .await
            .map_err(|e| TaskError::recoverable(format!("Unable to read Scrapy log: {}", e)))
    }

    async fn crawl_state(&self, job_id: &str) -> Result<Option<CrawlState>, TaskError> {
        let request = self
            .http
            .client()
            .get(self.http.url("listjobs.json"))
            .query(&[("project", self.project.as_str())]);
        let data = scrapyd_data(
            self.http
                .send_json(
                    request,
                    &format!("Unable to get status of Scrapyd job {}", job_id),
                )
                .await?,
        )?;

        let listed = |key: &str| {
            data.get(key)
                .and_then(|v| v.as_array())
                .is_some_and(|jobs| {
                    jobs.iter()
                        .any(|job| job.get("id").and_then(|id| id.as_str()) == Some(job_id))
                })
        };

        Ok(if listed("pending") {
            Some(CrawlState::Pending)
        } else if listed("running") {
            Some(CrawlState::Running)
        } else if listed("finished") {
            Some(CrawlState::Finished)
        } else {
            None
        })
    }
}

/// Reject crawler responses that report an error in their body.
fn scrapyd_data(data: Value) -> Result<Value, TaskError> {
    if data.get("status").and_then(|s| s.as_str()) == Some("error") {
        return Err(TaskError::Unexpected(data.to_string()));
    }
    Ok(data)
}

/// Store the collection ID and data version announced in the log, if any.
fn record_collection(scope: &mut TaskScope<'_>, log: &ScrapyLog) {
    if scope.job.context.process_id.is_some() {
        return;
    }
    if let Some((process_id, data_version)) = log.collection() {
        scope.job.context.process_id = Some(process_id.to_string());
        scope.job.context.data_version = Some(data_version.to_string());
    }
}

/// Normalise a data version to the crawl directory name:
/// `2001-02-03 04:05:06` and `2001-02-03T04:05:06` both become `20010203_040506`.
fn crawl_directory(data_version: &str) -> String {
    data_version
        .chars()
        .filter(|c| *c != '-' && *c != ':')
        .map(|c| if c == ' ' || c == 'T' { '_' } else { c })
        .collect()
}

async fn is_empty_dir(path: &Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}

#[async_trait]
impl TaskManager for CollectTaskManager {
    fn name(&self) -> &str {
        "collect"
    }

    fn final_output(&self) -> bool {
        false
    }

    async fn run(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        let spider = scope.collection.source_id.clone();
        let request = self
            .http
            .client()
            .post(self.http.url("schedule.json"))
            .form(&[
                ("project", self.project.as_str()),
                ("spider", spider.as_str()),
                ("steps", "compile"),
            ]);

        let data = scrapyd_data(
            self.http
                .send_json(
                    request,
                    &format!(
                        "Unable to schedule a Scrapyd job for project {} and spider {}",
                        self.project, spider
                    ),
                )
                .await?,
        )?;

        let job_id = data
            .get("jobid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TaskError::Unexpected(format!("No jobid in response: {}", data)))?
            .to_string();

        info!("{}: Scheduled crawl {}", scope, job_id);
        scope.job.context.scrapy_log = Some(self.log_url(&spider, &job_id));
        scope.job.context.spider = Some(spider);
        scope.job.context.job_id = Some(job_id);
        Ok(())
    }

    async fn get_status(&self, scope: &mut TaskScope<'_>) -> Result<TaskPoll, TaskError> {
        let context = &scope.job.context;
        let (Some(job_id), Some(log_url)) = (context.job_id.clone(), context.scrapy_log.clone())
        else {
            return Err(TaskError::Unexpected(
                "Crawl was not scheduled (job_id is not set)".to_string(),
            ));
        };

        match self.crawl_state(&job_id).await? {
            // The log doesn't exist before the crawl starts.
            Some(CrawlState::Pending) => Ok(TaskPoll::Waiting),

            Some(CrawlState::Running) => {
                if scope.job.context.process_id.is_none() {
                    match self.read_log(&log_url).await {
                        Ok(text) => record_collection(scope, &ScrapyLog::parse(&text)),
                        Err(e) if e.is_not_found() => {
                            debug!("{}: Scrapy log not written yet", scope)
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(TaskPoll::Running)
            }

            Some(CrawlState::Finished) => {
                let text = match self.read_log(&log_url).await {
                    Ok(text) => text,
                    Err(e) if e.is_not_found() => {
                        return Err(TaskError::Unexpected(
                            "Scrapy log doesn't exist".to_string(),
                        ))
                    }
                    Err(e) => return Err(e),
                };

                let log = ScrapyLog::parse(&text);
                record_collection(scope, &log);
                if scope.job.context.process_id.is_none()
                    || scope.job.context.data_version.is_none()
                {
                    return Err(TaskError::Unexpected(
                        "Unable to retrieve collection ID and data version from Scrapy log"
                            .to_string(),
                    ));
                }

                if !log.is_finished() {
                    return Err(TaskError::Irrecoverable(format!(
                        "The crawl wasn't finished: {}",
                        log.finish_reason().unwrap_or("unknown")
                    )));
                }
                if log.missing_next_link() {
                    return Err(TaskError::Irrecoverable(
                        "The crawl stopped prematurely (missing next link)".to_string(),
                    ));
                }
                let error_rate = log.error_rate();
                if error_rate > self.error_rate_threshold {
                    return Err(TaskError::Irrecoverable(format!(
                        "The crawl had a {} error rate",
                        error_rate
                    )));
                }

                for (key, slot) in [
                    ("item_dropped_count", &mut scope.job.context.item_dropped_count),
                    ("invalid_json_count", &mut scope.job.context.invalid_json_count),
                ] {
                    let value = log.stat_count(key);
                    if value > 0 {
                        *slot = Some(value);
                    }
                }

                let notes = log.notes();
                if !notes.is_empty() {
                    warn!("{}: Crawl has {} warnings", scope, notes.len());
                }
                scope.replace_notes(notes);
                Ok(TaskPoll::Completed)
            }

            None => Err(TaskError::recoverable(format!(
                "Unable to find status of Scrapyd job {}",
                job_id
            ))),
        }
    }

    async fn wipe(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        let Some(job_id) = scope.job.context.job_id.clone() else {
            debug!("{}: Crawl was never scheduled, nothing to wipe", scope);
            return Ok(());
        };

        let request = self
            .http
            .client()
            .post(self.http.url("cancel.json"))
            .form(&[("project", self.project.as_str()), ("job", job_id.as_str())]);
        self.http
            .send_consume(
                request,
                &format!("Unable to cancel the Scrapyd job {}", job_id),
            )
            .await;

        // A pending crawl never wrote anything.
        let Some(data_version) = scope.job.context.data_version.clone() else {
            warn!("{}: Unable to wipe crawl (data version is not set)", scope);
            return Ok(());
        };

        let spider = scope
            .job
            .context
            .spider
            .clone()
            .unwrap_or_else(|| scope.collection.source_id.clone());
        let spider_path = self.files_store.join(&spider);
        let crawl_path = spider_path.join(crawl_directory(&data_version));

        if !crawl_path.exists() {
            return Ok(());
        }

        info!("{}: Wiping data for crawl {}", scope, data_version);
        let wipe_error = |e: std::io::Error| {
            TaskError::recoverable(format!(
                "Unable to wipe the Scrapyd job {} at {}: {}",
                job_id,
                crawl_path.display(),
                e
            ))
        };
        tokio::fs::remove_dir_all(&crawl_path)
            .await
            .map_err(wipe_error)?;
        if is_empty_dir(&spider_path).await.map_err(wipe_error)? {
            tokio::fs::remove_dir(&spider_path)
                .await
                .map_err(wipe_error)?;
        }
        Ok(())
    }
}
