//! Byte transports for source urls.
//!
//! A transport opens a url at a byte offset and says whether the offset was
//! honoured. The fetcher handles the case where it was not.

use crate::config::FetchConfig;
use crate::error::FetchError;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

/// An open byte stream positioned at (or before) the requested offset
pub struct Opened {
    pub reader: Box<dyn Read + Send>,
    /// True when the stream starts at the requested offset.
    /// False means it starts at byte 0.
    pub resumed: bool,
    /// Total size of the source in bytes, when known
    pub total: Option<u64>,
}

pub trait Transport: Send + Sync {
    fn open(&self, url: &str, offset: u64) -> Result<Opened, FetchError>;
}

/// Plain HTTP(S) via reqwest's blocking client, resuming with `Range` requests
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &str, offset: u64) -> Result<Opened, FetchError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().map_err(|e| classify_reqwest(url, e))?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            // Checkpoint sits exactly at the end of the file
            return Ok(Opened {
                reader: Box::new(io::empty()),
                resumed: true,
                total: Some(offset),
            });
        }
        if !status.is_success() {
            return Err(FetchError::from_status(url, status.as_u16()));
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let total = response.content_length().map(|len| {
            if resumed { len + offset } else { len }
        });

        Ok(Opened {
            reader: Box::new(response),
            resumed: resumed || offset == 0,
            total,
        })
    }
}

fn classify_reqwest(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        return FetchError::malformed(url, err);
    }
    if let Some(status) = err.status() {
        return FetchError::from_status(url, status.as_u16());
    }
    // connect, timeout, reset, body
    FetchError::transient(url, err)
}

/// Local files, given as `file://` urls or bare paths
pub struct FileTransport;

impl FileTransport {
    fn path_of(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

impl Transport for FileTransport {
    fn open(&self, url: &str, offset: u64) -> Result<Opened, FetchError> {
        let path = Self::path_of(url);
        let mut file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                FetchError::malformed(url, e)
            }
            _ => FetchError::transient(url, e),
        })?;
        let total = file.metadata().ok().map(|m| m.len());
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| FetchError::transient(url, e))?;
        }
        Ok(Opened {
            reader: Box::new(file),
            resumed: true,
            total,
        })
    }
}

/// Dispatches on url scheme
pub struct DefaultTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl DefaultTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        Ok(Self {
            http: HttpTransport::new(config)?,
            file: FileTransport,
        })
    }
}

impl Transport for DefaultTransport {
    fn open(&self, url: &str, offset: u64) -> Result<Opened, FetchError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.open(url, offset)
        } else if url.starts_with("file://") || !url.contains("://") {
            self.file.open(url, offset)
        } else {
            Err(FetchError::UnsupportedScheme(url.to_string()))
        }
    }
}
