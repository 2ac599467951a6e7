//! SQLite-backed registry store implementation.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    Collection, CollectionSuccess, Coverage, Job, JobAdvancement, JobContext, JobFilter, JobStatus, NewCollection,
    NoteLevel, RegistryError, RegistryStore, RetrievalFrequency, Task, TaskNote, TaskResult,
    TaskStatus, TaskType,
};

const COLLECTION_COLUMNS: &str = "id, source_id, title, country, retrieval_frequency, frozen, last_retrieved, publication_policy, coverage, active_job_id, created_at";

const JOB_COLUMNS: &str = "id, collection_id, status, start_at, end_at, context, keep_all_data, archived, date_from, date_to, license, publication_policy, ocid_prefix, coverage, created_at";

const TASK_COLUMNS: &str = "id, job_id, ord, type, status, result, note, start_at, end_at";

/// How long a write waits for another connection's lock before failing.
pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed registry store.
///
/// The database file is shared with the message queue and with wiper
/// processes, so file-backed connections use WAL and wait on busy locks.
pub struct SqliteRegistryStore {
    conn: Mutex<Connection>,
}

impl SqliteRegistryStore {
    /// Create a new SQLite registry store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(db_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_error)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_error)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite registry store (useful for testing).
    pub fn in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), RegistryError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS collections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                country TEXT NOT NULL DEFAULT '',
                retrieval_frequency TEXT,
                frozen INTEGER NOT NULL DEFAULT 0,
                last_retrieved TEXT,
                publication_policy TEXT NOT NULL DEFAULT '',
                coverage TEXT NOT NULL DEFAULT '{}',
                active_job_id INTEGER REFERENCES jobs(id) ON DELETE RESTRICT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                start_at TEXT,
                end_at TEXT,
                context TEXT NOT NULL DEFAULT '{}',
                keep_all_data INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0,
                date_from TEXT,
                date_to TEXT,
                license TEXT NOT NULL DEFAULT '',
                publication_policy TEXT NOT NULL DEFAULT '',
                ocid_prefix TEXT NOT NULL DEFAULT '',
                coverage TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                ord INTEGER NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT NOT NULL DEFAULT '',
                note TEXT NOT NULL DEFAULT '',
                start_at TEXT,
                end_at TEXT,
                UNIQUE (job_id, ord)
            );

            CREATE TABLE IF NOT EXISTS task_notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                level TEXT NOT NULL,
                note TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_collection ON jobs(collection_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id);
            CREATE INDEX IF NOT EXISTS idx_task_notes_task ON task_notes(task_id);
            "#,
        )
        .map_err(db_error)?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn
            .lock()
            .map_err(|_| RegistryError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(collection_id) = filter.collection_id {
            conditions.push("collection_id = ?");
            params.push(Box::new(collection_id));
        }

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        match filter.complete {
            Some(true) => conditions.push("status = 'COMPLETED'"),
            Some(false) => conditions.push("status != 'COMPLETED'"),
            None => {}
        }

        if let Some(archived) = filter.archived {
            conditions.push("archived = ?");
            params.push(Box::new(archived));
        }

        if let Some(keep_all_data) = filter.keep_all_data {
            conditions.push("keep_all_data = ?");
            params.push(Box::new(keep_all_data));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_collection(row: &Row) -> rusqlite::Result<Collection> {
        let retrieval_frequency: Option<String> = row.get(4)?;
        let last_retrieved: Option<String> = row.get(6)?;
        let coverage: String = row.get(8)?;
        let created_at: String = row.get(10)?;

        Ok(Collection {
            id: row.get(0)?,
            source_id: row.get(1)?,
            title: row.get(2)?,
            country: row.get(3)?,
            retrieval_frequency: retrieval_frequency
                .map(|value| parse_column::<RetrievalFrequency>(4, &value))
                .transpose()?,
            frozen: row.get(5)?,
            last_retrieved: last_retrieved.map(|v| parse_date(6, &v)).transpose()?,
            publication_policy: row.get(7)?,
            coverage: parse_json(8, &coverage)?,
            active_job_id: row.get(9)?,
            created_at: parse_timestamp(10, &created_at)?,
        })
    }

    fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
        let status: String = row.get(2)?;
        let start: Option<String> = row.get(3)?;
        let end: Option<String> = row.get(4)?;
        let context: String = row.get(5)?;
        let date_from: Option<String> = row.get(8)?;
        let date_to: Option<String> = row.get(9)?;
        let coverage: String = row.get(13)?;
        let created_at: String = row.get(14)?;

        Ok(Job {
            id: row.get(0)?,
            collection_id: row.get(1)?,
            status: parse_column::<JobStatus>(2, &status)?,
            start: start.map(|v| parse_timestamp(3, &v)).transpose()?,
            end: end.map(|v| parse_timestamp(4, &v)).transpose()?,
            context: parse_json::<JobContext>(5, &context)?,
            keep_all_data: row.get(6)?,
            archived: row.get(7)?,
            date_from: date_from.map(|v| parse_date(8, &v)).transpose()?,
            date_to: date_to.map(|v| parse_date(9, &v)).transpose()?,
            license: row.get(10)?,
            publication_policy: row.get(11)?,
            ocid_prefix: row.get(12)?,
            coverage: parse_json::<Coverage>(13, &coverage)?,
            created_at: parse_timestamp(14, &created_at)?,
        })
    }

    fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
        let task_type: String = row.get(3)?;
        let status: String = row.get(4)?;
        let result: String = row.get(5)?;
        let start: Option<String> = row.get(7)?;
        let end: Option<String> = row.get(8)?;

        Ok(Task {
            id: row.get(0)?,
            job_id: row.get(1)?,
            order: row.get(2)?,
            task_type: parse_column::<TaskType>(3, &task_type)?,
            status: parse_column::<TaskStatus>(4, &status)?,
            result: TaskResult::from_column(&result),
            note: row.get(6)?,
            start: start.map(|v| parse_timestamp(7, &v)).transpose()?,
            end: end.map(|v| parse_timestamp(8, &v)).transpose()?,
        })
    }

    fn row_to_note(row: &Row) -> rusqlite::Result<TaskNote> {
        let level: String = row.get(0)?;
        let data: String = row.get(2)?;

        Ok(TaskNote {
            level: parse_column::<NoteLevel>(0, &level)?,
            note: row.get(1)?,
            data: parse_json(2, &data)?,
        })
    }

    fn write_job(conn: &Connection, job: &Job) -> Result<(), RegistryError> {
        let context = to_json(&job.context)?;
        let coverage = to_json(&job.coverage)?;

        let updated = conn
            .execute(
                "UPDATE jobs SET status = ?, start_at = ?, end_at = ?, context = ?, keep_all_data = ?, archived = ?, date_from = ?, date_to = ?, license = ?, publication_policy = ?, ocid_prefix = ?, coverage = ? WHERE id = ?",
                params![
                    job.status.as_str(),
                    job.start.map(|t| t.to_rfc3339()),
                    job.end.map(|t| t.to_rfc3339()),
                    context,
                    job.keep_all_data,
                    job.archived,
                    job.date_from.map(|d| d.to_string()),
                    job.date_to.map(|d| d.to_string()),
                    job.license,
                    job.publication_policy,
                    job.ocid_prefix,
                    coverage,
                    job.id,
                ],
            )
            .map_err(db_error)?;

        if updated == 0 {
            return Err(RegistryError::JobNotFound(job.id));
        }
        Ok(())
    }

    fn write_task(conn: &Connection, task: &Task) -> Result<(), RegistryError> {
        conn.execute(
            "UPDATE tasks SET status = ?, result = ?, note = ?, start_at = ?, end_at = ? WHERE id = ?",
            params![
                task.status.as_str(),
                task.result.map(|r| r.as_str()).unwrap_or(""),
                task.note,
                task.start.map(|t| t.to_rfc3339()),
                task.end.map(|t| t.to_rfc3339()),
                task.id,
            ],
        )
        .map_err(db_error)?;
        Ok(())
    }

    fn write_collection(conn: &Connection, collection: &Collection) -> Result<(), RegistryError> {
        let coverage = to_json(&collection.coverage)?;

        let updated = conn
            .execute(
                "UPDATE collections SET source_id = ?, title = ?, country = ?, retrieval_frequency = ?, frozen = ?, last_retrieved = ?, publication_policy = ?, coverage = ?, active_job_id = ? WHERE id = ?",
                params![
                    collection.source_id,
                    collection.title,
                    collection.country,
                    collection.retrieval_frequency.map(|f| f.as_str()),
                    collection.frozen,
                    collection.last_retrieved.map(|d| d.to_string()),
                    collection.publication_policy,
                    coverage,
                    collection.active_job_id,
                    collection.id,
                ],
            )
            .map_err(db_error)?;

        if updated == 0 {
            return Err(RegistryError::CollectionNotFound(collection.id));
        }
        Ok(())
    }

    fn record_success(conn: &Connection, success: &CollectionSuccess) -> Result<(), RegistryError> {
        let coverage = to_json(&success.coverage)?;

        let updated = conn
            .execute(
                "UPDATE collections SET last_retrieved = ?, coverage = ?, active_job_id = ?, publication_policy = CASE WHEN publication_policy = '' THEN ? ELSE publication_policy END WHERE id = ?",
                params![
                    success.last_retrieved.map(|d| d.to_string()),
                    coverage,
                    success.active_job_id,
                    success.publication_policy,
                    success.collection_id,
                ],
            )
            .map_err(db_error)?;

        if updated == 0 {
            return Err(RegistryError::CollectionNotFound(success.collection_id));
        }
        Ok(())
    }

    fn replace_notes(
        conn: &Connection,
        task_id: i64,
        notes: &[TaskNote],
    ) -> Result<(), RegistryError> {
        conn.execute("DELETE FROM task_notes WHERE task_id = ?", params![task_id])
            .map_err(db_error)?;

        for note in notes {
            conn.execute(
                "INSERT INTO task_notes (task_id, level, note, data) VALUES (?, ?, ?, ?)",
                params![task_id, note.level.as_str(), note.note, to_json(&note.data)?],
            )
            .map_err(db_error)?;
        }
        Ok(())
    }
}

impl RegistryStore for SqliteRegistryStore {
    fn create_collection(&self, request: NewCollection) -> Result<Collection, RegistryError> {
        let conn = self.conn()?;
        let now = Utc::now();
        let coverage = Coverage::default();

        conn.execute(
            "INSERT INTO collections (source_id, title, country, retrieval_frequency, frozen, coverage, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                request.source_id,
                request.title,
                request.country,
                request.retrieval_frequency.map(|f| f.as_str()),
                request.frozen,
                to_json(&coverage)?,
                now.to_rfc3339(),
            ],
        )
        .map_err(db_error)?;

        Ok(Collection {
            id: conn.last_insert_rowid(),
            source_id: request.source_id,
            title: request.title,
            country: request.country,
            retrieval_frequency: request.retrieval_frequency,
            frozen: request.frozen,
            last_retrieved: None,
            publication_policy: String::new(),
            coverage,
            active_job_id: None,
            created_at: now,
        })
    }

    fn get_collection(&self, id: i64) -> Result<Option<Collection>, RegistryError> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {} FROM collections WHERE id = ?", COLLECTION_COLUMNS),
            params![id],
            Self::row_to_collection,
        )
        .optional()
        .map_err(db_error)
    }

    fn list_collections(&self) -> Result<Vec<Collection>, RegistryError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM collections ORDER BY id",
                COLLECTION_COLUMNS
            ))
            .map_err(db_error)?;

        let rows = stmt
            .query_map([], Self::row_to_collection)
            .map_err(db_error)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
    }

    fn update_collection(&self, collection: &Collection) -> Result<(), RegistryError> {
        let conn = self.conn()?;
        Self::write_collection(&conn, collection)
    }

    fn create_job(&self, collection_id: i64, plan: &[TaskType]) -> Result<Job, RegistryError> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        let context = JobContext::default();
        let coverage = Coverage::default();

        let tx = conn.transaction().map_err(db_error)?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM collections WHERE id = ?",
                params![collection_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error)?;
        if exists.is_none() {
            return Err(RegistryError::CollectionNotFound(collection_id));
        }

        tx.execute(
            "INSERT INTO jobs (collection_id, status, context, coverage, created_at) VALUES (?, ?, ?, ?, ?)",
            params![
                collection_id,
                JobStatus::Planned.as_str(),
                to_json(&context)?,
                to_json(&coverage)?,
                now.to_rfc3339(),
            ],
        )
        .map_err(db_error)?;
        let job_id = tx.last_insert_rowid();

        for (index, task_type) in plan.iter().enumerate() {
            tx.execute(
                "INSERT INTO tasks (job_id, ord, type, status) VALUES (?, ?, ?, ?)",
                params![
                    job_id,
                    (index + 1) as u32,
                    task_type.as_str(),
                    TaskStatus::Planned.as_str(),
                ],
            )
            .map_err(db_error)?;
        }

        tx.commit().map_err(db_error)?;

        Ok(Job {
            id: job_id,
            collection_id,
            status: JobStatus::Planned,
            start: None,
            end: None,
            context,
            keep_all_data: false,
            archived: false,
            date_from: None,
            date_to: None,
            license: String::new(),
            publication_policy: String::new(),
            ocid_prefix: String::new(),
            coverage,
            created_at: now,
        })
    }

    fn get_job(&self, id: i64) -> Result<Option<Job>, RegistryError> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_error)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, RegistryError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        // A negative LIMIT means no limit in SQLite.
        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY id LIMIT ?",
            JOB_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_error)?;

        let mut all_params = params;
        all_params.push(Box::new(filter.limit.unwrap_or(-1)));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(db_error)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
    }

    fn update_job(&self, job: &Job) -> Result<(), RegistryError> {
        let conn = self.conn()?;
        Self::write_job(&conn, job)
    }

    fn tasks_for_job(&self, job_id: i64) -> Result<Vec<Task>, RegistryError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE job_id = ? ORDER BY ord",
                TASK_COLUMNS
            ))
            .map_err(db_error)?;

        let rows = stmt
            .query_map(params![job_id], Self::row_to_task)
            .map_err(db_error)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
    }

    fn task_notes(&self, task_id: i64) -> Result<Vec<TaskNote>, RegistryError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT level, note, data FROM task_notes WHERE task_id = ? ORDER BY id")
            .map_err(db_error)?;

        let rows = stmt
            .query_map(params![task_id], Self::row_to_note)
            .map_err(db_error)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_error)
    }

    fn save_advancement(&self, advancement: &JobAdvancement) -> Result<(), RegistryError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_error)?;

        Self::write_job(&tx, &advancement.job)?;
        for task in &advancement.tasks {
            Self::write_task(&tx, task)?;
        }
        for (task_id, notes) in &advancement.notes {
            Self::replace_notes(&tx, *task_id, notes)?;
        }
        if let Some(success) = &advancement.collection {
            Self::record_success(&tx, success)?;
        }

        // Dropping the transaction without commit rolls everything back.
        tx.commit().map_err(db_error)
    }

    fn delete_job(&self, id: i64) -> Result<(), RegistryError> {
        let conn = self.conn()?;

        let active_of: Option<i64> = conn
            .query_row(
                "SELECT id FROM collections WHERE active_job_id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error)?;
        if let Some(collection_id) = active_of {
            return Err(RegistryError::ActiveJob {
                job_id: id,
                collection_id,
            });
        }

        let deleted = conn
            .execute("DELETE FROM jobs WHERE id = ?", params![id])
            .map_err(db_error)?;
        if deleted == 0 {
            return Err(RegistryError::JobNotFound(id));
        }
        Ok(())
    }
}

fn db_error(e: rusqlite::Error) -> RegistryError {
    RegistryError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RegistryError> {
    serde_json::to_string(value).map_err(|e| RegistryError::Database(e.to_string()))
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn parse_column<T: FromStr<Err = String>>(idx: usize, value: &str) -> rusqlite::Result<T> {
    value.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, value: &str) -> rusqlite::Result<T> {
    serde_json::from_str(value).map_err(|e| conversion_error(idx, e))
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_date(idx: usize, value: &str) -> rusqlite::Result<NaiveDate> {
    value
        .parse::<NaiveDate>()
        .map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_store() -> SqliteRegistryStore {
        SqliteRegistryStore::in_memory().unwrap()
    }

    fn create_test_collection(store: &SqliteRegistryStore) -> Collection {
        store
            .create_collection(
                NewCollection::new("spain_zaragoza")
                    .with_country("Spain")
                    .with_frequency(RetrievalFrequency::Monthly),
            )
            .unwrap()
    }

    fn success_for(collection: &Collection, job: &Job) -> CollectionSuccess {
        CollectionSuccess {
            collection_id: collection.id,
            active_job_id: job.id,
            last_retrieved: NaiveDate::from_ymd_opt(2024, 3, 1),
            coverage: Coverage::default(),
            publication_policy: String::new(),
        }
    }

    #[test]
    fn test_create_and_get_collection() {
        let store = create_test_store();
        let collection = create_test_collection(&store);

        let loaded = store.get_collection(collection.id).unwrap().unwrap();
        assert_eq!(loaded.source_id, "spain_zaragoza");
        assert_eq!(loaded.country, "Spain");
        assert_eq!(
            loaded.retrieval_frequency,
            Some(RetrievalFrequency::Monthly)
        );
        assert!(!loaded.frozen);
        assert!(loaded.active_job_id.is_none());
    }

    #[test]
    fn test_get_missing_collection() {
        let store = create_test_store();
        assert!(store.get_collection(42).unwrap().is_none());
    }

    #[test]
    fn test_create_job_creates_planned_tasks_in_order() {
        let store = create_test_store();
        let collection = create_test_collection(&store);

        let job = store
            .create_job(collection.id, &TaskType::ALL)
            .unwrap();
        assert_eq!(job.status, JobStatus::Planned);

        let tasks = store.tasks_for_job(job.id).unwrap();
        assert_eq!(tasks.len(), 5);
        assert_eq!(tasks[0].task_type, TaskType::Collect);
        assert_eq!(tasks[0].order, 1);
        assert_eq!(tasks[4].task_type, TaskType::Flattener);
        assert_eq!(tasks[4].order, 5);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Planned));
        assert!(tasks.iter().all(|t| t.result.is_none()));
    }

    #[test]
    fn test_create_job_for_missing_collection_fails() {
        let store = create_test_store();
        let result = store.create_job(99, &[TaskType::Collect]);
        assert!(matches!(result, Err(RegistryError::CollectionNotFound(99))));
        assert!(store.list_jobs(&JobFilter::new()).unwrap().is_empty());
    }

    #[test]
    fn test_list_jobs_filters() {
        let store = create_test_store();
        let collection = create_test_collection(&store);
        let other = store
            .create_collection(NewCollection::new("moldova"))
            .unwrap();

        let mut done = store.create_job(collection.id, &[TaskType::Collect]).unwrap();
        store.create_job(collection.id, &[TaskType::Collect]).unwrap();
        store.create_job(other.id, &[TaskType::Collect]).unwrap();

        done.status = JobStatus::Completed;
        store.update_job(&done).unwrap();

        let incomplete = store
            .list_jobs(&JobFilter::new().with_collection(collection.id).incomplete())
            .unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_ne!(incomplete[0].id, done.id);

        let completed = store
            .list_jobs(
                &JobFilter::new()
                    .with_status(JobStatus::Completed)
                    .with_archived(false)
                    .with_keep_all_data(false),
            )
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);

        let limited = store.list_jobs(&JobFilter::new().with_limit(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_list_jobs_is_unlimited_by_default() {
        let store = create_test_store();
        let collection = create_test_collection(&store);
        for _ in 0..1005 {
            store.create_job(collection.id, &[TaskType::Collect]).unwrap();
        }

        let jobs = store
            .list_jobs(&JobFilter::new().with_collection(collection.id))
            .unwrap();
        assert_eq!(jobs.len(), 1005);
        assert!(jobs.windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    #[test]
    fn test_update_job_round_trips_fields() {
        let store = create_test_store();
        let collection = create_test_collection(&store);
        let mut job = store.create_job(collection.id, &[TaskType::Collect]).unwrap();

        job.status = JobStatus::Running;
        job.start = Some(Utc::now());
        job.context.spider = Some("spain_zaragoza".to_string());
        job.context.extra.insert("custom".to_string(), json!(1));
        job.date_from = NaiveDate::from_ymd_opt(2020, 1, 31);
        job.license = "https://creativecommons.org/licenses/by/4.0/".to_string();
        job.coverage.tenders = 12;
        job.keep_all_data = true;
        store.update_job(&job).unwrap();

        let loaded = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.context, job.context);
        assert_eq!(loaded.date_from, job.date_from);
        assert_eq!(loaded.license, job.license);
        assert_eq!(loaded.coverage.tenders, 12);
        assert!(loaded.keep_all_data);
    }

    #[test]
    fn test_update_missing_job_fails() {
        let store = create_test_store();
        let collection = create_test_collection(&store);
        let mut job = store.create_job(collection.id, &[TaskType::Collect]).unwrap();
        job.id = 1234;
        assert!(matches!(
            store.update_job(&job),
            Err(RegistryError::JobNotFound(1234))
        ));
    }

    #[test]
    fn test_save_advancement_replaces_notes() {
        let store = create_test_store();
        let collection = create_test_collection(&store);
        let mut job = store.create_job(collection.id, &[TaskType::Collect]).unwrap();
        let mut task = store.tasks_for_job(job.id).unwrap().remove(0);

        let mut first = JobAdvancement::new(job.clone());
        first.notes.push((
            task.id,
            vec![
                TaskNote::warning("old warning", json!({})),
                TaskNote::error("old error", json!({})),
            ],
        ));
        store.save_advancement(&first).unwrap();
        assert_eq!(store.task_notes(task.id).unwrap().len(), 2);

        job.status = JobStatus::Completed;
        task.status = TaskStatus::Completed;
        task.result = Some(TaskResult::Ok);

        let mut second = JobAdvancement::new(job.clone());
        second.tasks.push(task.clone());
        second.notes.push((
            task.id,
            vec![TaskNote::warning("new", json!({"type": "Data loss"}))],
        ));
        second.collection = Some(success_for(&collection, &job));
        store.save_advancement(&second).unwrap();

        let notes = store.task_notes(task.id).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].note, "new");
        assert_eq!(notes[0].data["type"], "Data loss");

        let loaded_task = store.tasks_for_job(job.id).unwrap().remove(0);
        assert!(loaded_task.succeeded());
        assert_eq!(
            store.get_collection(collection.id).unwrap().unwrap().active_job_id,
            Some(job.id)
        );
    }

    #[test]
    fn test_success_only_touches_success_fields() {
        let store = create_test_store();
        let stale = create_test_collection(&store);
        let job = store.create_job(stale.id, &[TaskType::Collect]).unwrap();

        let mut edited = stale.clone();
        edited.frozen = true;
        edited.title = "Zaragoza".to_string();
        edited.retrieval_frequency = Some(RetrievalFrequency::Never);
        edited.publication_policy = "https://example.com/policy".to_string();
        store.update_collection(&edited).unwrap();

        let mut success = success_for(&stale, &job);
        success.coverage.tenders = 4;
        success.publication_policy = "https://example.com/other".to_string();
        let mut advancement = JobAdvancement::new(job.clone());
        advancement.collection = Some(success);
        store.save_advancement(&advancement).unwrap();

        let loaded = store.get_collection(stale.id).unwrap().unwrap();
        assert!(loaded.frozen);
        assert_eq!(loaded.title, "Zaragoza");
        assert_eq!(loaded.retrieval_frequency, Some(RetrievalFrequency::Never));
        assert_eq!(loaded.publication_policy, "https://example.com/policy");
        assert_eq!(loaded.active_job_id, Some(job.id));
        assert_eq!(loaded.last_retrieved, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(loaded.coverage.tenders, 4);
    }

    #[test]
    fn test_success_fills_blank_policy() {
        let store = create_test_store();
        let collection = create_test_collection(&store);
        let job = store.create_job(collection.id, &[TaskType::Collect]).unwrap();

        let mut success = success_for(&collection, &job);
        success.publication_policy = "https://example.com/policy".to_string();
        let mut advancement = JobAdvancement::new(job);
        advancement.collection = Some(success);
        store.save_advancement(&advancement).unwrap();

        let loaded = store.get_collection(collection.id).unwrap().unwrap();
        assert_eq!(loaded.publication_policy, "https://example.com/policy");
    }

    #[test]
    fn test_save_advancement_is_atomic() {
        let store = create_test_store();
        let collection = create_test_collection(&store);
        let mut job = store.create_job(collection.id, &[TaskType::Collect]).unwrap();
        let mut task = store.tasks_for_job(job.id).unwrap().remove(0);

        job.status = JobStatus::Running;
        task.status = TaskStatus::Running;
        let mut missing_collection = success_for(&collection, &job);
        missing_collection.collection_id = 999;

        let mut advancement = JobAdvancement::new(job.clone());
        advancement.tasks.push(task.clone());
        advancement.collection = Some(missing_collection);

        assert!(store.save_advancement(&advancement).is_err());

        let loaded = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Planned);
        let loaded_task = store.tasks_for_job(job.id).unwrap().remove(0);
        assert_eq!(loaded_task.status, TaskStatus::Planned);
    }

    #[test]
    fn test_delete_job_cascades() {
        let store = create_test_store();
        let collection = create_test_collection(&store);
        let job = store
            .create_job(collection.id, &TaskType::ALL)
            .unwrap();
        let task = store.tasks_for_job(job.id).unwrap().remove(0);

        let mut advancement = JobAdvancement::new(job.clone());
        advancement
            .notes
            .push((task.id, vec![TaskNote::warning("note", json!({}))]));
        store.save_advancement(&advancement).unwrap();

        store.delete_job(job.id).unwrap();

        assert!(store.get_job(job.id).unwrap().is_none());
        assert!(store.tasks_for_job(job.id).unwrap().is_empty());
        assert!(store.task_notes(task.id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_active_job_refused() {
        let store = create_test_store();
        let mut collection = create_test_collection(&store);
        let job = store.create_job(collection.id, &[TaskType::Collect]).unwrap();

        collection.active_job_id = Some(job.id);
        store.update_collection(&collection).unwrap();

        let result = store.delete_job(job.id);
        assert!(matches!(result, Err(RegistryError::ActiveJob { .. })));
        assert!(store.get_job(job.id).unwrap().is_some());
    }

    #[test]
    fn test_delete_missing_job() {
        let store = create_test_store();
        assert!(matches!(
            store.delete_job(7),
            Err(RegistryError::JobNotFound(7))
        ));
    }

    #[test]
    fn test_file_store_waits_on_locks() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteRegistryStore::new(&dir.path().join("registry.db")).unwrap();
        let conn = store.conn().unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5000);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("registry.db");

        let collection_id = {
            let store = SqliteRegistryStore::new(&path).unwrap();
            create_test_collection(&store).id
        };

        let store = SqliteRegistryStore::new(&path).unwrap();
        assert!(store.get_collection(collection_id).unwrap().is_some());
    }
}
