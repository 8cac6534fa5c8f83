//! Error taxonomy for the ingestion, indexing and query pipeline.
//!
//! Component errors are typed so callers can tell transient from permanent
//! failures. The CLI and daemon wrap them in `anyhow` at the edges.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure while retrieving raw source bytes
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection reset, timeout, truncated body or a retryable HTTP status
    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },

    /// Non-retryable HTTP status (4xx other than 408/429)
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The source is readable but its content is unusable (no header, no EIN column)
    #[error("malformed source {url}: {reason}")]
    Malformed { url: String, reason: String },

    /// URL scheme the fetcher has no transport for
    #[error("unsupported source url: {0}")]
    UnsupportedScheme(String),

    /// Transient failures exhausted the retry budget
    #[error("giving up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    /// The HTTP client could not be constructed
    #[error("http client setup failed: {0}")]
    Client(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn transient(url: &str, reason: impl ToString) -> Self {
        FetchError::Transient {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(url: &str, reason: impl ToString) -> Self {
        FetchError::Malformed {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Classify an HTTP status code
    pub fn from_status(url: &str, status: u16) -> Self {
        if status >= 500 || status == 408 || status == 429 {
            FetchError::transient(url, format!("HTTP {}", status))
        } else {
            FetchError::Status {
                url: url.to_string(),
                status,
            }
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Failure building, persisting or loading a generation.
/// Fatal to the current job only; the active generation is never touched.
#[derive(Debug, Error)]
pub enum IndexBuildError {
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt data in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("shard {shard} failed: {reason}")]
    ShardFailed { shard: usize, reason: String },

    #[error("shadow generation {0} is already being built")]
    ShadowInProgress(u64),

    #[error("generation {got} is not the reserved shadow generation {expected:?}")]
    GenerationMismatch { expected: Option<u64>, got: u64 },

    #[error("index build cancelled")]
    Cancelled,
}

impl IndexBuildError {
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        IndexBuildError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the import orchestrator
#[derive(Debug, Error)]
pub enum ImportError {
    /// A job is already in a non-terminal state. No state was changed.
    #[error("import job {job_id} is already in progress")]
    JobInProgress { job_id: String },

    #[error("no import job is active")]
    NoActiveJob,

    #[error("source descriptor has no urls")]
    EmptySource,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Build(#[from] IndexBuildError),

    #[error("job state error at {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("job cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Every row was rejected or the source had no data rows
    #[error("import produced no organizations")]
    NoOrganizations,

    #[error("pipeline worker failed: {0}")]
    Worker(String),

    #[error("import cancelled")]
    Cancelled,
}

impl ImportError {
    pub fn persist(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ImportError::Persist {
            path: path.into(),
            source,
        }
    }

    /// Fold cancellation reported by a component into one variant
    pub fn normalize_cancel(self) -> Self {
        match self {
            ImportError::Fetch(FetchError::Cancelled)
            | ImportError::Build(IndexBuildError::Cancelled) => ImportError::Cancelled,
            other => other,
        }
    }
}

/// A malformed query, rejected before execution with no side effects
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("limit must be between 1 and {max}, got {limit}")]
    InvalidLimit { limit: usize, max: usize },

    #[error("{field} range is empty: min {min} > max {max}")]
    InvalidRange {
        field: &'static str,
        min: u64,
        max: u64,
    },

    #[error("invalid state code {0:?} (expected two letters)")]
    InvalidState(String),

    #[error("unknown NTEE category {0:?}")]
    UnknownCategory(String),

    #[error("unknown sort order {0:?}")]
    UnknownSort(String),

    #[error("malformed {field} filter {value:?}")]
    MalformedFilter { field: String, value: String },

    #[error("unknown export format {0:?}")]
    UnknownFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(FetchError::from_status("u", 503).is_transient());
        assert!(FetchError::from_status("u", 429).is_transient());
        assert!(!FetchError::from_status("u", 404).is_transient());
    }

    #[test]
    fn test_cancellation_folds() {
        let e = ImportError::from(FetchError::Cancelled).normalize_cancel();
        assert!(matches!(e, ImportError::Cancelled));
        let e = ImportError::from(IndexBuildError::Cancelled).normalize_cancel();
        assert!(matches!(e, ImportError::Cancelled));
        let e = ImportError::NoOrganizations.normalize_cancel();
        assert!(matches!(e, ImportError::NoOrganizations));
    }
}
