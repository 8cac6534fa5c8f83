//! Import job record, state machine and on-disk persistence.

use crate::error::ImportError;
use crate::fetch::{FetchCheckpoint, SourceDescriptor};
use crate::index::types::Generation;
use crate::normalize::{RejectReason, RejectedRow};
use crate::utils::{remove_dir_if_exists, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub type JobId = String;

const JOB_FILE: &str = "job.json";
const STAGING_FILE: &str = "staged.bin";
const CURRENT_JOB_FILE: &str = "current.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Fetching,
    Normalizing,
    Indexing,
    Swapping,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Fetching => "fetching",
            JobState::Normalizing => "normalizing",
            JobState::Indexing => "indexing",
            JobState::Swapping => "swapping",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Fetching through Swapping
    pub fn is_running(&self) -> bool {
        !self.is_terminal() && *self != JobState::Idle
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (*self, next),
            (Idle, Fetching)
                | (Fetching, Normalizing)
                | (Normalizing, Indexing)
                | (Indexing, Swapping)
                | (Swapping, Completed)
                | (Completed, Idle)
                | (Failed, Idle)
        ) || (self.is_running() && next == Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resume point of a job: how far the fetch got and how much of it is staged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    pub fetch: FetchCheckpoint,
    /// Valid length of the staging file; anything past it is a torn write
    pub staged_bytes: u64,
    pub staged_records: u64,
}

/// One ingestion run. Owned by the orchestrator and persisted after every
/// state change and every staged chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: JobId,
    pub source: SourceDescriptor,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rows_read: u64,
    #[serde(default)]
    pub rows_rejected: u64,
    /// Rows whose secondary fields were coerced
    #[serde(default)]
    pub rows_coerced: u64,
    /// Rejections per reason code
    #[serde(default)]
    pub rejections: BTreeMap<String, u64>,
    /// First few rejected rows, for operators
    #[serde(default)]
    pub reject_samples: Vec<RejectedRow>,
    #[serde(default)]
    pub checkpoint: JobCheckpoint,
    #[serde(default)]
    pub target_generation: Option<Generation>,
    #[serde(default)]
    pub organizations: Option<u64>,
    #[serde(default)]
    pub duplicates: u64,
    /// Reject ratio exceeded the configured threshold
    #[serde(default)]
    pub degraded: bool,
    /// Terminal cause of a failed job
    #[serde(default)]
    pub error: Option<String>,
    /// Times the job was picked up again after a restart
    #[serde(default)]
    pub resumes: u32,
}

impl ImportJob {
    pub fn new(source: SourceDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            state: JobState::Idle,
            created_at: now,
            updated_at: now,
            finished_at: None,
            rows_read: 0,
            rows_rejected: 0,
            rows_coerced: 0,
            rejections: BTreeMap::new(),
            reject_samples: Vec::new(),
            checkpoint: JobCheckpoint::default(),
            target_generation: None,
            organizations: None,
            duplicates: 0,
            degraded: false,
            error: None,
            resumes: 0,
        }
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), ImportError> {
        if !self.state.can_transition_to(next) {
            return Err(ImportError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        info!(job = %self.id, from = %self.state, to = %next, "Job state change");
        self.state = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Move to `Failed` with a recorded cause
    pub fn fail(&mut self, cause: &ImportError) {
        let cause = match cause {
            ImportError::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        };
        if self.transition(JobState::Failed).is_ok() {
            self.error = Some(cause);
        }
    }

    pub fn record_rejection(&mut self, rejected: RejectedRow, sample_limit: usize) {
        self.rows_rejected += 1;
        *self
            .rejections
            .entry(rejected.reason.as_str().to_string())
            .or_insert(0) += 1;
        if self.reject_samples.len() < sample_limit {
            self.reject_samples.push(rejected);
        }
    }

    pub fn rejections_for(&self, reason: RejectReason) -> u64 {
        self.rejections.get(reason.as_str()).copied().unwrap_or(0)
    }

    pub fn reject_ratio(&self) -> f64 {
        if self.rows_read == 0 {
            0.0
        } else {
            self.rows_rejected as f64 / self.rows_read as f64
        }
    }

    pub fn status(&self) -> ImportStatus {
        ImportStatus::from(self)
    }
}

/// Caller-facing view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub rows_read: u64,
    pub rows_rejected: u64,
    pub rows_coerced: u64,
    pub reject_ratio: f64,
    pub degraded: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub generation: Option<Generation>,
    pub organizations: Option<u64>,
    pub error: Option<String>,
    pub rejections: BTreeMap<String, u64>,
}

impl From<&ImportJob> for ImportStatus {
    fn from(job: &ImportJob) -> Self {
        Self {
            job_id: job.id.clone(),
            state: job.state,
            rows_read: job.rows_read,
            rows_rejected: job.rows_rejected,
            rows_coerced: job.rows_coerced,
            reject_ratio: job.reject_ratio(),
            degraded: job.degraded,
            started_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
            generation: job.target_generation,
            organizations: job.organizations,
            error: job.error.clone(),
            rejections: job.rejections.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CurrentJob {
    job_id: JobId,
}

/// Job files under `jobs/`
#[derive(Debug, Clone)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn job_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn staging_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join(STAGING_FILE)
    }

    pub fn save(&self, job: &ImportJob) -> Result<(), ImportError> {
        let path = self.job_dir(&job.id).join(JOB_FILE);
        let json = serde_json::to_vec_pretty(job).map_err(|e| ImportError::persist(&path, e.into()))?;
        write_atomic(&path, &json).map_err(|e| ImportError::persist(&path, e))?;
        debug!(job = %job.id, state = %job.state, "Job saved");
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Option<ImportJob>, ImportError> {
        let path = self.job_dir(id).join(JOB_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ImportError::persist(&path, e.into())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ImportError::persist(&path, e)),
        }
    }

    pub fn set_current(&self, id: &str) -> Result<(), ImportError> {
        let path = self.dir.join(CURRENT_JOB_FILE);
        let json = serde_json::to_vec(&CurrentJob {
            job_id: id.to_string(),
        })
        .map_err(|e| ImportError::persist(&path, e.into()))?;
        write_atomic(&path, &json).map_err(|e| ImportError::persist(&path, e))
    }

    /// The latest job, if one was ever started
    pub fn load_current(&self) -> Result<Option<ImportJob>, ImportError> {
        let path = self.dir.join(CURRENT_JOB_FILE);
        let current: CurrentJob = match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| ImportError::persist(&path, e.into()))?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ImportError::persist(&path, e)),
        };
        self.load(&current.job_id)
    }

    pub fn remove_staging(&self, id: &str) -> Result<(), ImportError> {
        let path = self.staging_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ImportError::persist(&path, e)),
        }
    }

    /// Delete directories of jobs other than `keep`
    pub fn prune(&self, keep: &str) -> Result<usize, ImportError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ImportError::persist(&self.dir, e)),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| ImportError::persist(&self.dir, e))?;
            let path = entry.path();
            if path.is_dir() && entry.file_name().to_string_lossy() != keep {
                remove_dir_if_exists(&path).map_err(|e| ImportError::persist(&path, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ImportJob {
        ImportJob::new(SourceDescriptor::new(vec!["file:///tmp/eo1.csv".to_string()]))
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = job();
        for next in [
            JobState::Fetching,
            JobState::Normalizing,
            JobState::Indexing,
            JobState::Swapping,
            JobState::Completed,
            JobState::Idle,
        ] {
            job.transition(next).unwrap();
        }
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_rejects_skipping_states() {
        let mut job = job();
        assert!(job.transition(JobState::Indexing).is_err());
        assert_eq!(job.state, JobState::Idle);
        assert!(!JobState::Completed.can_transition_to(JobState::Failed));
        assert!(JobState::Swapping.can_transition_to(JobState::Failed));
        assert!(!JobState::Idle.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_fail_records_cause() {
        let mut job = job();
        job.transition(JobState::Fetching).unwrap();
        job.fail(&ImportError::Cancelled);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_rejection_counts_and_samples() {
        let mut job = job();
        job.rows_read = 10;
        for row in 0..3 {
            job.record_rejection(
                RejectedRow {
                    row,
                    reason: RejectReason::InvalidEin,
                    detail: "x".to_string(),
                },
                2,
            );
        }
        assert_eq!(job.rows_rejected, 3);
        assert_eq!(job.rejections_for(RejectReason::InvalidEin), 3);
        assert_eq!(job.reject_samples.len(), 2);
        assert!((job.reject_ratio() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_store_round_trip_and_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        assert!(store.load_current().unwrap().is_none());

        let job = job();
        store.save(&job).unwrap();
        store.set_current(&job.id).unwrap();
        assert_eq!(store.load_current().unwrap(), Some(job.clone()));

        let other = self::job();
        store.save(&other).unwrap();
        assert_eq!(store.prune(&job.id).unwrap(), 1);
        assert!(store.load(&other.id).unwrap().is_none());
    }
}
