//! Protocol messages for client-server communication
//!
//! Every message is one frame from [`crate::utils::framing`]:
//! - 4 bytes (little-endian u32): message length
//! - N bytes: JSON-encoded message
//!
//! An export is answered with any number of `ExportChunk` frames followed by
//! one `ExportEnd`.

use crate::fetch::SourceDescriptor;
use crate::import::ImportStatus;
use crate::index::Organization;
use crate::query::{ExportFormat, Filters, SearchRequest, SearchResults};
use crate::service::Health;
use crate::utils::{read_frame, write_frame};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Request from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Search { request: SearchRequest },

    /// Stream all matches; `after` resumes past an EIN already received
    Export {
        term: Option<String>,
        #[serde(default)]
        filters: Filters,
        #[serde(default)]
        format: ExportFormat,
        #[serde(default)]
        after: Option<String>,
    },

    Organization { ein: String },

    StartImport { source: SourceDescriptor },

    /// Status of a job, or of the latest job when `job_id` is absent
    ImportStatus { job_id: Option<String> },

    CancelImport,

    Health,

    /// Daemon statistics
    Status,

    Shutdown,

    Ping,
}

/// Response from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Search(SearchResponse),

    ExportChunk { data: String },

    ExportEnd {
        records: u64,
        /// Last EIN sent
        cursor: Option<String>,
    },

    Organization { organization: Option<Organization> },

    ImportStarted { job_id: String },

    ImportStatus { status: Option<ImportStatus> },

    ImportCancelled { job_id: String },

    Health(Health),

    Status(StatusResponse),

    ShuttingDown,

    Pong,

    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: SearchResults,
    pub duration_ms: f64,
    /// Whether results came from cache
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub active_generation: u64,
    pub organizations: u64,
    pub queries_served: u64,
    pub exports_served: u64,
    /// Cache hit rate (0.0 - 1.0)
    pub cache_hit_rate: f32,
    pub cached_queries: usize,
}

/// Write one message and flush
pub fn write_message<W: Write>(writer: &mut W, msg: &impl Serialize) -> io::Result<()> {
    write_frame(writer, msg)?;
    writer.flush()
}

pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    read_frame(reader)
}
