//! Export directory layout shared with the export workers.
//!
//! Each job exports to `{export_dir}/{job_id}/`. A worker holds
//! `exporter.lock` while writing; `full.jsonl.gz` marks a finished export.

mod wiper;

pub use wiper::{Wiper, WiperError};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// File name of the lock held while an export is being written.
pub const LOCK_FILE: &str = "exporter.lock";

/// File name of the complete JSON lines export.
pub const FULL_EXPORT: &str = "full.jsonl.gz";

const JSONL_SUFFIX: &str = ".jsonl.gz";
const CSV_SUFFIX: &str = ".csv.tar.gz";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export is already locked: {path}")]
    Locked { path: PathBuf },

    #[error("export I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportStatus {
    Waiting,
    Running,
    Completed,
}

/// The export directory of one job.
#[derive(Debug, Clone)]
pub struct Export {
    directory: PathBuf,
}

impl Export {
    pub fn new(export_dir: &Path, job_id: i64) -> Self {
        Self {
            directory: export_dir.join(job_id.to_string()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn lock_file(&self) -> PathBuf {
        self.directory.join(LOCK_FILE)
    }

    /// Create the lock file. Fails if another worker holds it.
    pub fn lock(&self) -> Result<(), ExportError> {
        std::fs::create_dir_all(&self.directory).map_err(|source| ExportError::Io {
            path: self.directory.clone(),
            source,
        })?;

        let path = self.lock_file();
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(ExportError::Locked { path }),
            Err(source) => Err(ExportError::Io { path, source }),
        }
    }

    /// Delete the lock file. Unlocking an unlocked export is a no-op.
    pub fn unlock(&self) -> Result<(), ExportError> {
        let path = self.lock_file();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ExportError::Io { path, source }),
        }
    }

    pub fn locked(&self) -> bool {
        self.lock_file().exists()
    }

    /// Status of one output file of the export.
    pub fn file_status(&self, basename: &str) -> ExportStatus {
        if self.locked() {
            ExportStatus::Running
        } else if self.directory.join(basename).exists() {
            ExportStatus::Completed
        } else {
            ExportStatus::Waiting
        }
    }

    /// Status of the full JSON lines export.
    pub fn status(&self) -> ExportStatus {
        self.file_status(FULL_EXPORT)
    }

    /// JSON lines files that the flattener converts: the full export and yearly splits.
    pub fn convertible_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.directory) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name == FULL_EXPORT || yearly_export_year(name).is_some())
            .collect();
        names.sort();
        names
    }

    /// Calendar years with a yearly export, most recent first.
    pub fn years_available(&self) -> Vec<i32> {
        let mut years: Vec<i32> = self
            .convertible_files()
            .iter()
            .filter_map(|name| yearly_export_year(name))
            .collect();
        years.sort_unstable_by(|a, b| b.cmp(a));
        years
    }

    /// Delete the export directory recursively. Missing directories are fine.
    pub async fn remove(&self) -> Result<(), ExportError> {
        match tokio::fs::remove_dir_all(&self.directory).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ExportError::Io {
                path: self.directory.clone(),
                source,
            }),
        }
    }
}

/// Name of the flattened archive produced from a JSON lines file.
pub fn flattened_name(jsonl_name: &str) -> String {
    let stem = jsonl_name.strip_suffix(JSONL_SUFFIX).unwrap_or(jsonl_name);
    format!("{}{}", stem, CSV_SUFFIX)
}

fn yearly_export_year(name: &str) -> Option<i32> {
    let stem = name.strip_suffix(JSONL_SUFFIX)?;
    if stem.len() == 4 && stem.bytes().all(|b| b.is_ascii_digit()) {
        stem.parse().ok()
    } else {
        None
    }
}
