//! Quality checking task, run by the Pelican dataset service.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::http::HttpService;
use super::{TaskError, TaskManager, TaskPoll, TaskScope};
use crate::config::ServiceConfig;
use crate::job::Coverage;

#[derive(Debug, Deserialize)]
struct DatasetStatus {
    phase: Option<String>,
    state: Option<String>,
}

pub struct PelicanTaskManager {
    http: HttpService,
}

impl PelicanTaskManager {
    pub fn new(config: &ServiceConfig) -> Result<Self, TaskError> {
        Ok(Self {
            http: HttpService::new(
                "pelican",
                &config.url,
                Duration::from_secs(config.timeout_secs),
            )?,
        })
    }

    /// The dataset name, derived once and cached in the job context.
    fn dataset_name(scope: &mut TaskScope<'_>) -> String {
        if let Some(name) = &scope.job.context.pelican_dataset_name {
            return name.clone();
        }

        let context = &scope.job.context;
        let name = format!(
            "{}_{}_{}",
            context
                .spider
                .as_deref()
                .unwrap_or(&scope.collection.source_id),
            context.data_version.as_deref().unwrap_or_default(),
            scope.job.id
        );
        scope.job.context.pelican_dataset_name = Some(name.clone());
        name
    }

    /// The dataset ID, looked up by name once the dataset exists.
    async fn dataset_id(&self, scope: &mut TaskScope<'_>) -> Result<Option<i64>, TaskError> {
        if let Some(id) = scope.job.context.pelican_id {
            return Ok(Some(id));
        }

        let name = Self::dataset_name(scope);
        let data: Value = self
            .http
            .send_json(
                self.http
                    .client()
                    .get(self.http.url("api/datasets/find_by_name/"))
                    .query(&[("name", name.as_str())]),
                &format!("Unable to get ID for name {:?}", name),
            )
            .await?;

        let id = data.get("id").and_then(|id| id.as_i64());
        if id.is_some() {
            scope.job.context.pelican_id = id;
        }
        Ok(id)
    }
}

#[async_trait]
impl TaskManager for PelicanTaskManager {
    fn name(&self) -> &str {
        "pelican"
    }

    fn final_output(&self) -> bool {
        false
    }

    async fn run(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        let name = Self::dataset_name(scope);
        let collection_id = scope.job.context.process_compiled_collection_id;

        self.http
            .send(
                self.http
                    .client()
                    .post(self.http.url("api/datasets/"))
                    .json(&json!({"name": name, "collection_id": collection_id})),
                &format!(
                    "Unable to create dataset with name {:?} and collection ID {:?}",
                    name, collection_id
                ),
            )
            .await?;

        info!("{}: Created dataset {}", scope, name);
        Ok(())
    }

    async fn get_status(&self, scope: &mut TaskScope<'_>) -> Result<TaskPoll, TaskError> {
        let Some(id) = self.dataset_id(scope).await? else {
            return Ok(TaskPoll::Waiting);
        };

        let status: Option<DatasetStatus> = self
            .http
            .send_json(
                self.http
                    .client()
                    .get(self.http.url(&format!("api/datasets/{}/status/", id))),
                &format!("Unable to get status of dataset {}", id),
            )
            .await?;

        let Some(status) = status else {
            return Ok(TaskPoll::Waiting);
        };
        if status.phase.is_none() && status.state.is_none() {
            return Ok(TaskPoll::Waiting);
        }
        if status.phase.as_deref() != Some("CHECKED") || status.state.as_deref() != Some("OK") {
            return Ok(TaskPoll::Running);
        }

        let coverage: Coverage = self
            .http
            .send_json(
                self.http
                    .client()
                    .get(self.http.url(&format!("api/datasets/{}/coverage/", id))),
                &format!("Unable to get coverage of dataset {}", id),
            )
            .await?;
        scope.job.coverage = coverage;

        Ok(TaskPoll::Completed)
    }

    async fn wipe(&self, scope: &mut TaskScope<'_>) -> Result<(), TaskError> {
        let id = match self.dataset_id(scope).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!("{}: Unable to wipe dataset (dataset ID is not set)", scope);
                return Ok(());
            }
            Err(TaskError::Recoverable { message, .. }) => {
                error!("{}: Unable to wipe dataset (dataset ID is not retrievable): {}", scope, message);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!("{}: Wiping dataset {}", scope, id);
        self.http
            .send_consume(
                self.http
                    .client()
                    .delete(self.http.url(&format!("api/datasets/{}/", id))),
                &format!("Unable to wipe dataset with ID {}", id),
            )
            .await;
        Ok(())
    }
}
