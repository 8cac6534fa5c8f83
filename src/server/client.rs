//! Client for the daemon socket

use crate::fetch::SourceDescriptor;
use crate::import::ImportStatus;
use crate::index::Organization;
use crate::query::{ExportFormat, Filters, SearchRequest};
use crate::server::get_socket_path;
use crate::server::protocol::{
    Request, Response, SearchResponse, StatusResponse, read_message, write_message,
};
use crate::service::Health;
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon is not running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("daemon error: {0}")]
    Server(String),

    #[error("unexpected response from daemon")]
    InvalidResponse,
}

/// Outcome of a streamed export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub records: u64,
    /// Last EIN written; pass back as `after` to continue
    pub cursor: Option<String>,
}

pub struct IndexClient {
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
}

impl IndexClient {
    /// Connect to the running daemon. `None` when it is not reachable.
    pub fn connect() -> Option<Self> {
        Self::connect_to(&get_socket_path())
    }

    pub fn connect_to(socket_path: &Path) -> Option<Self> {
        if !socket_path.exists() {
            return None;
        }
        let stream = UnixStream::connect(socket_path).ok()?;
        let _ = stream.set_read_timeout(Some(IO_TIMEOUT));
        let _ = stream.set_write_timeout(Some(IO_TIMEOUT));

        let reader = BufReader::new(stream.try_clone().ok()?);
        let writer = BufWriter::new(stream);
        Some(Self { reader, writer })
    }

    pub fn connect_required() -> ClientResult<Self> {
        Self::connect().ok_or(ClientError::NotRunning)
    }

    fn call(&mut self, request: &Request) -> ClientResult<Response> {
        write_message(&mut self.writer, request)?;
        match read_message(&mut self.reader)? {
            Response::Error { message } => Err(ClientError::Server(message)),
            response => Ok(response),
        }
    }

    pub fn search(&mut self, request: SearchRequest) -> ClientResult<SearchResponse> {
        match self.call(&Request::Search { request })? {
            Response::Search(response) => Ok(response),
            _ => Err(ClientError::InvalidResponse),
        }
    }

    /// Stream an export into `out`
    pub fn export(
        &mut self,
        term: Option<String>,
        filters: Filters,
        format: ExportFormat,
        after: Option<String>,
        out: &mut dyn Write,
    ) -> ClientResult<ExportSummary> {
        write_message(
            &mut self.writer,
            &Request::Export {
                term,
                filters,
                format,
                after,
            },
        )?;

        loop {
            match read_message(&mut self.reader)? {
                Response::ExportChunk { data } => out.write_all(data.as_bytes())?,
                Response::ExportEnd { records, cursor } => {
                    out.flush()?;
                    return Ok(ExportSummary { records, cursor });
                }
                Response::Error { message } => return Err(ClientError::Server(message)),
                _ => return Err(ClientError::InvalidResponse),
            }
        }
    }

    pub fn organization(&mut self, ein: &str) -> ClientResult<Option<Organization>> {
        match self.call(&Request::Organization {
            ein: ein.to_string(),
        })? {
            Response::Organization { organization } => Ok(organization),
            _ => Err(ClientError::InvalidResponse),
        }
    }

    pub fn start_import(&mut self, source: SourceDescriptor) -> ClientResult<String> {
        match self.call(&Request::StartImport { source })? {
            Response::ImportStarted { job_id } => Ok(job_id),
            _ => Err(ClientError::InvalidResponse),
        }
    }

    pub fn import_status(&mut self, job_id: Option<String>) -> ClientResult<Option<ImportStatus>> {
        match self.call(&Request::ImportStatus { job_id })? {
            Response::ImportStatus { status } => Ok(status),
            _ => Err(ClientError::InvalidResponse),
        }
    }

    pub fn cancel_import(&mut self) -> ClientResult<String> {
        match self.call(&Request::CancelImport)? {
            Response::ImportCancelled { job_id } => Ok(job_id),
            _ => Err(ClientError::InvalidResponse),
        }
    }

    pub fn health(&mut self) -> ClientResult<Health> {
        match self.call(&Request::Health)? {
            Response::Health(health) => Ok(health),
            _ => Err(ClientError::InvalidResponse),
        }
    }

    pub fn status(&mut self) -> ClientResult<StatusResponse> {
        match self.call(&Request::Status)? {
            Response::Status(status) => Ok(status),
            _ => Err(ClientError::InvalidResponse),
        }
    }

    pub fn shutdown(&mut self) -> ClientResult<()> {
        match self.call(&Request::Shutdown)? {
            Response::ShuttingDown => Ok(()),
            _ => Err(ClientError::InvalidResponse),
        }
    }

    pub fn ping(&mut self) -> ClientResult<()> {
        match self.call(&Request::Ping)? {
            Response::Pong => Ok(()),
            _ => Err(ClientError::InvalidResponse),
        }
    }
}
