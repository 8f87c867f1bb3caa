//! Durable snapshot of the queued job set.
//!
//! The whole file is replaced after every queue mutation. A single writer is
//! assumed.

use super::action::ActionRegistry;
use super::job::{Job, JobOptions, JobStatus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SNAPSHOT_VERSION: u32 = 1;

pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<Vec<JobOptions>>;

    fn save(&self, jobs: &[JobOptions]) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    jobs: Vec<JobOptions>,
}

/// Snapshot kept in a JSON file, replaced atomically on save.
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotStore for JsonFileSnapshotStore {
    fn load(&self) -> Result<Vec<JobOptions>> {
        if !self.path.exists() {
            debug!("No snapshot at {:?}, starting empty", self.path);
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read snapshot: {:?}", self.path))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: SnapshotFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {:?}", self.path))?;
        if file.version != SNAPSHOT_VERSION {
            warn!(
                "Snapshot {:?} has version {}, expected {}",
                self.path, file.version, SNAPSHOT_VERSION
            );
        }
        Ok(file.jobs)
    }

    fn save(&self, jobs: &[JobOptions]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            jobs: jobs.to_vec(),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
        serde_json::to_writer_pretty(&mut tmp, &file).context("Failed to serialize snapshot")?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace snapshot: {:?}", self.path))?;
        Ok(())
    }
}

/// Used when persistence is disabled (tests).
pub struct NoopSnapshotStore;

impl SnapshotStore for NoopSnapshotStore {
    fn load(&self) -> Result<Vec<JobOptions>> {
        Ok(Vec::new())
    }

    fn save(&self, _jobs: &[JobOptions]) -> Result<()> {
        Ok(())
    }
}

/// Rebuild jobs from snapshot records.
///
/// An ONGOING record means the previous process died mid-attempt: the job
/// comes back WAITING and is retried from scratch. DONE and FAILED records
/// were written while a job was leaving the queue and are not resumed.
/// Records that cannot be rebuilt are logged and skipped.
pub fn restore_jobs(records: Vec<JobOptions>, registry: &ActionRegistry) -> Vec<Arc<Job>> {
    let total = records.len();
    let jobs: Vec<Arc<Job>> = records
        .into_iter()
        .filter_map(|record| {
            let id = record.id.clone().unwrap_or_default();
            let status = record
                .status
                .as_deref()
                .and_then(|s| s.parse::<JobStatus>().ok());
            if let Some(status) = status.filter(JobStatus::is_terminal) {
                debug!("Skipping snapshot record {} in final state {}", id, status);
                return None;
            }
            let was_ongoing = status == Some(JobStatus::Ongoing);
            match Job::create(None, record, registry) {
                Ok(job) => {
                    if was_ongoing {
                        info!("Job {} was interrupted, it will be retried", job.id());
                    }
                    Some(job)
                }
                Err(e) => {
                    warn!("Dropping snapshot record {}: {}", id, e);
                    None
                }
            }
        })
        .collect();
    info!("Restored {} of {} queued jobs", jobs.len(), total);
    jobs
}
