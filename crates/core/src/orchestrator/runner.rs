//! Process manager implementation.
//!
//! One pass plans due jobs and advances every incomplete job by as many
//! tasks as can finish without waiting. Each job's changes are committed in
//! one transaction. The cleanup sweep wipes the temporary data of completed
//! jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::job::{
    Collection, CollectionSuccess, Job, JobAdvancement, JobFilter, JobStatus, RegistryError, RegistryStore, Task,
    TaskStatus,
};
use crate::metrics;
use crate::task::{TaskError, TaskManagerFactory, TaskPoll, TaskScope};

use super::config::OrchestratorConfig;
use super::machine::{transition, Flow, Outcome};
use super::planner::should_be_planned;
use super::types::{
    CleanupSummary, CollectionReport, JobOutcome, OrchestratorError, OrchestratorStatus,
    PassSummary,
};

/// Drives collections through their task plans.
pub struct ProcessManager {
    config: OrchestratorConfig,
    store: Arc<dyn RegistryStore>,
    managers: Arc<dyn TaskManagerFactory>,

    // Runtime state
    running: AtomicBool,
    last_pass: RwLock<Option<PassSummary>>,
    last_cleanup: RwLock<Option<CleanupSummary>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProcessManager {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn RegistryStore>,
        managers: Arc<dyn TaskManagerFactory>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            store,
            managers,
            running: AtomicBool::new(false),
            last_pass: RwLock::new(None),
            last_cleanup: RwLock::new(None),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Process every collection once.
    ///
    /// One collection's failure is logged and doesn't stop the pass.
    pub async fn process_all(&self) -> Result<PassSummary, OrchestratorError> {
        let started = Instant::now();
        let mut summary = PassSummary::new(Utc::now());
        let collections = self.store.list_collections()?;

        let reports: Vec<_> = stream::iter(collections)
            .map(|collection| async move {
                let report = self.process(&collection).await;
                (collection, report)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (collection, report) in reports {
            match report {
                Ok(report) => summary.add(&report),
                Err(e) => {
                    error!("Publication {}: Processing failed: {}", collection, e);
                    summary.collections += 1;
                    summary.errors += 1;
                }
            }
        }

        summary.finished_at = Utc::now();
        metrics::PROCESS_PASS_DURATION
            .with_label_values(&[])
            .observe(started.elapsed().as_secs_f64());
        info!(
            collections = summary.collections,
            planned = summary.jobs_planned,
            succeeded = summary.jobs_succeeded,
            failed = summary.jobs_failed,
            errors = summary.errors,
            "Processed all collections"
        );

        *self.last_pass.write().await = Some(summary.clone());
        Ok(summary)
    }

    /// Process one collection by ID.
    pub async fn process_collection(
        &self,
        collection_id: i64,
    ) -> Result<CollectionReport, OrchestratorError> {
        let collection = self
            .store
            .get_collection(collection_id)?
            .ok_or(OrchestratorError::CollectionNotFound(collection_id))?;
        self.process(&collection).await
    }

    /// Plan a job if the collection is due, then advance its incomplete jobs.
    pub async fn process(
        &self,
        collection: &Collection,
    ) -> Result<CollectionReport, OrchestratorError> {
        let mut report = CollectionReport::default();

        let jobs = self
            .store
            .list_jobs(&JobFilter::new().with_collection(collection.id))?;
        if should_be_planned(collection, &jobs, Utc::now().date_naive()) {
            let job = self.store.create_job(collection.id, &self.config.task_plan)?;
            metrics::JOBS_PLANNED.inc();
            info!("Publication {}: Planned job {}", collection, job);
            report.planned_job = Some(job.id);
        }

        let incomplete = self
            .store
            .list_jobs(&JobFilter::new().with_collection(collection.id).incomplete())?;
        for job in incomplete {
            let job_id = job.id;
            match self.advance(collection, job).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!("Publication {}: Job #{}: Advancement failed: {}", collection, job_id, e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Advance one job and commit the result.
    pub async fn advance(
        &self,
        collection: &Collection,
        mut job: Job,
    ) -> Result<JobOutcome, OrchestratorError> {
        if job.is_complete() {
            return Ok(JobOutcome::Unchanged);
        }

        let mut tasks = self.store.tasks_for_job(job.id)?;
        let mut changed = Vec::new();
        let mut notes = Vec::new();
        let mut outcome = JobOutcome::Progressed;
        let mut all_completed = true;

        for task in tasks.iter_mut() {
            if task.status == TaskStatus::Completed {
                continue;
            }

            let now = Utc::now();
            if task.status == TaskStatus::Planned && job.status == JobStatus::Planned {
                job.status = JobStatus::Running;
                job.start = Some(now);
                debug!("Publication {}: Job {} is starting", collection, job);
            }

            let (result, replaced_notes) = match self.managers.manager(task.task_type) {
                Ok(manager) => {
                    let mut scope = TaskScope::new(collection, &mut job, &*task);
                    let result = match task.status {
                        TaskStatus::Planned => manager.run(&mut scope).await.map(|()| Outcome::Started),
                        _ => manager.get_status(&mut scope).await.map(|poll| {
                            debug!("{}: Task is {:?}", scope, poll);
                            match poll {
                                TaskPoll::Waiting | TaskPoll::Running => Outcome::Pending,
                                TaskPoll::Completed => Outcome::Completed,
                                TaskPoll::Failed(reason) => Outcome::Failed(reason),
                            }
                        }),
                    };
                    (result, scope.take_notes())
                }
                Err(e) => (Err(e), None),
            };

            let outcome_of_task = match result {
                Ok(outcome) => outcome,
                Err(e) => classify(collection, &job, task, e),
            };

            let step = transition(task.status, &outcome_of_task)?;
            step.apply(task, now);
            metrics::TASK_TRANSITIONS
                .with_label_values(&[task.task_type.as_str(), outcome_of_task.label()])
                .inc();

            if let Some(replaced) = replaced_notes {
                notes.push((task.id, replaced));
            }
            changed.push(task.clone());

            match step.flow {
                Flow::Continue => continue,
                Flow::Stop => {
                    all_completed = false;
                    break;
                }
                Flow::EndJob => {
                    job.status = JobStatus::Completed;
                    job.end = Some(now);
                    warn!("Publication {}: Job {} has failed", collection, job);
                    outcome = JobOutcome::Failed;
                    all_completed = false;
                    break;
                }
            }
        }

        let mut success = None;
        if all_completed {
            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.end = Some(now);

            success = Some(CollectionSuccess {
                collection_id: collection.id,
                active_job_id: job.id,
                last_retrieved: tasks
                    .first()
                    .and_then(|task| task.end)
                    .map(|end| end.date_naive()),
                coverage: job.coverage.clone(),
                publication_policy: job.publication_policy.clone(),
            });

            info!("Publication {}: Job {} has succeeded", collection, job);
            outcome = JobOutcome::Succeeded;
        }

        let advancement = JobAdvancement {
            job,
            tasks: changed,
            notes,
            collection: success,
        };
        self.store.save_advancement(&advancement)?;

        match outcome {
            JobOutcome::Succeeded => {
                metrics::JOBS_FINISHED.with_label_values(&["succeeded"]).inc();
                // The stored row now carries the new active job.
                let deleted = match self.store.get_collection(collection.id) {
                    Ok(Some(updated)) => self.delete_older_jobs(&updated, false).await,
                    Ok(None) => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = deleted {
                    error!("Publication {}: Unable to delete old jobs: {}", collection, e);
                }
            }
            JobOutcome::Failed => {
                metrics::JOBS_FINISHED.with_label_values(&["failed"]).inc();
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Wipe the temporary data of completed jobs and archive them.
    ///
    /// Final outputs are kept. A job whose wipe fails stays unarchived and is
    /// retried on the next sweep.
    pub async fn cleanup(&self) -> Result<CleanupSummary, OrchestratorError> {
        let mut summary = CleanupSummary::default();
        let jobs = self.store.list_jobs(
            &JobFilter::new()
                .with_status(JobStatus::Completed)
                .with_archived(false)
                .with_keep_all_data(false),
        )?;

        for mut job in jobs {
            let collection = match self.store.get_collection(job.collection_id) {
                Ok(Some(collection)) => collection,
                Ok(None) => {
                    warn!("Job {}: Collection {} not found", job, job.collection_id);
                    summary.failed += 1;
                    continue;
                }
                Err(e) => {
                    error!("Job {}: {}", job, e);
                    summary.failed += 1;
                    continue;
                }
            };

            if let Err(e) = self.wipe_tasks(&collection, &mut job, false).await {
                error!("Publication {}: Job {}: Unable to wipe: {}", collection, job, e);
                summary.failed += 1;
                continue;
            }

            job.archived = true;
            match self.store.update_job(&job) {
                Ok(()) => {
                    metrics::JOBS_ARCHIVED.inc();
                    info!("Publication {}: Job {} is archived", collection, job);
                    summary.archived += 1;
                }
                Err(e) => {
                    error!("Publication {}: Job {}: Unable to archive: {}", collection, job, e);
                    summary.failed += 1;
                }
            }
        }

        *self.last_cleanup.write().await = Some(summary.clone());
        Ok(summary)
    }

    /// Wipe every task of a job, then delete the job with its tasks and notes.
    ///
    /// The active job of a collection can't be deleted. Nothing is deleted if
    /// a wipe fails.
    pub async fn delete_job(&self, job_id: i64) -> Result<(), OrchestratorError> {
        let mut job = self
            .store
            .get_job(job_id)?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        let collection = self
            .store
            .get_collection(job.collection_id)?
            .ok_or(OrchestratorError::CollectionNotFound(job.collection_id))?;

        if collection.active_job_id == Some(job.id) {
            return Err(RegistryError::ActiveJob {
                job_id: job.id,
                collection_id: collection.id,
            }
            .into());
        }

        self.wipe_tasks(&collection, &mut job, true).await?;
        self.store.delete_job(job.id)?;
        metrics::JOBS_DELETED.inc();
        info!("Publication {}: Job {} is deleted", collection, job);
        Ok(())
    }

    /// Delete completed jobs older than `old_job_age_days`, keeping the
    /// active job and the most recent other successful job as backup.
    ///
    /// Returns the IDs of the deleted jobs (or of the jobs that would be
    /// deleted, with `dry_run`).
    pub async fn delete_older_jobs(
        &self,
        collection: &Collection,
        dry_run: bool,
    ) -> Result<Vec<i64>, OrchestratorError> {
        let Some(active_job_id) = collection.active_job_id else {
            return Ok(Vec::new());
        };

        let others: Vec<Job> = self
            .store
            .list_jobs(
                &JobFilter::new()
                    .with_collection(collection.id)
                    .with_status(JobStatus::Completed),
            )?
            .into_iter()
            .filter(|job| job.id != active_job_id)
            .collect();

        let mut backup: Option<&Job> = None;
        for job in &others {
            let succeeded = self
                .store
                .tasks_for_job(job.id)?
                .iter()
                .all(|task| !task.failed());
            if succeeded && job.start > backup.and_then(|b| b.start) {
                backup = Some(job);
            }
        }
        let backup_id = backup.map(|job| job.id);

        let cutoff = Utc::now() - chrono::Duration::days(self.config.old_job_age_days);
        let old: Vec<i64> = others
            .iter()
            .filter(|job| Some(job.id) != backup_id)
            .filter(|job| job.start.is_some_and(|start| start < cutoff))
            .map(|job| job.id)
            .collect();

        if dry_run {
            for id in &old {
                info!("Publication {}: Job #{} would be deleted", collection, id);
            }
            return Ok(old);
        }

        let mut deleted = Vec::new();
        for id in old {
            match self.delete_job(id).await {
                Ok(()) => deleted.push(id),
                Err(e) => error!("Publication {}: Job #{}: Unable to delete: {}", collection, id, e),
            }
        }
        Ok(deleted)
    }

    async fn wipe_tasks(
        &self,
        collection: &Collection,
        job: &mut Job,
        include_final_output: bool,
    ) -> Result<(), TaskError> {
        let tasks = self
            .store
            .tasks_for_job(job.id)
            .map_err(|e| TaskError::recoverable(e.to_string()))?;

        for task in &tasks {
            let manager = self.managers.manager(task.task_type)?;
            if manager.final_output() && !include_final_output {
                continue;
            }

            let mut scope = TaskScope::new(collection, job, task);
            let result = manager.wipe(&mut scope).await;
            let label = if result.is_ok() { "success" } else { "error" };
            metrics::WIPES_TOTAL
                .with_label_values(&[task.task_type.as_str(), label])
                .inc();
            result?;
        }
        Ok(())
    }

    /// Start the serve loops: periodic processing and cleanup.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Process manager already running");
            return;
        }

        info!("Starting process manager");
        self.spawn_loop(
            "process",
            Duration::from_secs(self.config.interval_secs),
            |this| async move {
                if let Err(e) = this.process_all().await {
                    error!("Processing pass failed: {}", e);
                }
            },
        );
        self.spawn_loop(
            "cleanup",
            Duration::from_secs(self.config.cleanup_interval_secs),
            |this| async move {
                match this.cleanup().await {
                    Ok(summary) => debug!(
                        archived = summary.archived,
                        failed = summary.failed,
                        "Cleanup sweep finished"
                    ),
                    Err(e) => error!("Cleanup sweep failed: {}", e),
                }
            },
        );
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, pass: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("{} loop started", name);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("{} loop received shutdown signal", name);
                        break;
                    }
                    _ = ticker.tick() => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        pass(Arc::clone(&this)).await;
                    }
                }
            }
            info!("{} loop stopped", name);
        });
    }

    /// Stop the serve loops. A pass in progress finishes first.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Process manager not running");
            return;
        }

        info!("Stopping process manager");
        let _ = self.shutdown_tx.send(());
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let collections = match self.store.list_collections() {
            Ok(collections) => collections.len(),
            Err(e) => {
                error!("Unable to count collections: {}", e);
                0
            }
        };
        let incomplete_jobs = match self.store.list_jobs(&JobFilter::new().incomplete()) {
            Ok(jobs) => jobs.len(),
            Err(e) => {
                error!("Unable to count incomplete jobs: {}", e);
                0
            }
        };

        OrchestratorStatus {
            running: self.running.load(Ordering::Relaxed),
            last_pass: self.last_pass.read().await.clone(),
            last_cleanup: self.last_cleanup.read().await.clone(),
            collections,
            incomplete_jobs,
        }
    }
}

/// Turn a task manager error into an outcome, logging it at its severity.
fn classify(
    collection: &Collection,
    job: &Job,
    task: &Task,
    error: TaskError,
) -> Outcome {
    match error {
        TaskError::Recoverable { message, .. } => {
            error!(
                "Publication {}: Job {}: Recoverable error during task {}: {}",
                collection, job, task, message
            );
            Outcome::Transient(message)
        }
        TaskError::Irrecoverable(message) => {
            warn!(
                "Publication {}: Job {}: Irrecoverable error during task {}: {}",
                collection, job, task, message
            );
            Outcome::Failed(message)
        }
        TaskError::Unexpected(message) => {
            error!(
                "Publication {}: Job {}: Unexpected error during task {}: {}",
                collection, job, task, message
            );
            Outcome::Failed(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{NewCollection, SqliteRegistryStore, TaskType};
    use crate::testing::MockTaskManagers;

    fn setup() -> (Arc<SqliteRegistryStore>, Arc<MockTaskManagers>, ProcessManager) {
        let store = Arc::new(SqliteRegistryStore::in_memory().unwrap());
        let managers = Arc::new(MockTaskManagers::new());
        let manager = ProcessManager::new(
            OrchestratorConfig {
                task_plan: vec![TaskType::Collect, TaskType::Process],
                ..Default::default()
            },
            Arc::clone(&store) as Arc<dyn RegistryStore>,
            Arc::clone(&managers) as Arc<dyn TaskManagerFactory>,
        );
        (store, managers, manager)
    }

    #[tokio::test]
    async fn test_plans_and_starts_first_task() {
        let (store, managers, manager) = setup();
        let collection = store.create_collection(NewCollection::new("spider_a")).unwrap();

        let report = manager.process(&collection).await.unwrap();
        assert!(report.planned_job.is_some());
        assert_eq!(report.jobs_advanced, 1);

        let job = store.get_job(report.planned_job.unwrap()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.start.is_some());

        let tasks = store.tasks_for_job(job.id).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Running);
        assert_eq!(tasks[1].status, TaskStatus::Planned);
        assert_eq!(managers.manager_for(TaskType::Collect).run_count().await, 1);
        assert_eq!(managers.manager_for(TaskType::Process).run_count().await, 0);
    }

    #[tokio::test]
    async fn test_completed_job_is_unchanged() {
        let (store, _managers, manager) = setup();
        let collection = store.create_collection(NewCollection::new("spider_a")).unwrap();
        let mut job = store.create_job(collection.id, &[TaskType::Collect]).unwrap();
        job.status = JobStatus::Completed;

        assert_eq!(manager.advance(&collection, job).await.unwrap(), JobOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let (store, _managers, manager) = setup();
        store.create_collection(NewCollection::new("spider_a")).unwrap();
        store.create_collection(NewCollection::new("spider_b")).unwrap();

        let summary = manager.process_all().await.unwrap();
        assert_eq!(summary.collections, 2);
        assert_eq!(summary.jobs_planned, 2);

        let status = manager.status().await;
        assert!(!status.running);
        assert_eq!(status.collections, 2);
        assert_eq!(status.incomplete_jobs, 2);
        assert_eq!(status.last_pass.unwrap().jobs_planned, 2);
    }

    #[tokio::test]
    async fn test_process_unknown_collection() {
        let (_store, _managers, manager) = setup();
        let err = manager.process_collection(42).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CollectionNotFound(42)));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (store, _managers, manager) = setup();
        store.create_collection(NewCollection::new("spider_a")).unwrap();
        let manager = Arc::new(manager);

        manager.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.status().await.running);

        manager.stop().await;
        assert!(!manager.status().await.running);
        // The first tick fires immediately.
        assert!(manager.status().await.last_pass.is_some());
    }
}
