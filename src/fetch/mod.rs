//! Resumable, retrying retrieval of raw source files.
//!
//! The [`Fetcher`] walks the urls of a [`SourceDescriptor`] in order and hands
//! out [`RawChunk`]s of at most `chunk_rows` rows. Every chunk carries the
//! checkpoint that is valid once the chunk has been consumed, so a caller that
//! persists `chunk.end` after handling a chunk can resume exactly there.
//!
//! Rows are decoded with the `csv` reader over the fetched byte stream, so a
//! quoted field may contain the delimiter or a line break. Checkpoint offsets
//! are the reader's byte position after the last record of a chunk.

pub mod retry;
pub mod transport;

pub use retry::RetryPolicy;
pub use transport::{DefaultTransport, FileTransport, HttpTransport, Opened, Transport};

use crate::error::FetchError;
use crate::normalize::{Schema, SchemaVersion, header_line};
use csv::ByteRecord;
use crate::utils::CancelToken;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, info, warn};

const READ_BLOCK: usize = 256 * 1024;

fn default_delimiter() -> u8 {
    b','
}

/// What to import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Read in order; together they form one import pass
    pub urls: Vec<String>,
    /// Total bytes across all urls, if known
    #[serde(default)]
    pub expected_size: Option<u64>,
    #[serde(default)]
    pub schema: SchemaVersion,
    #[serde(default = "default_delimiter")]
    pub delimiter: u8,
}

impl SourceDescriptor {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            expected_size: None,
            schema: SchemaVersion::default(),
            delimiter: default_delimiter(),
        }
    }
}

/// Resume position within a pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCheckpoint {
    /// Url currently being read
    pub source_index: usize,
    /// Bytes of that url already consumed (header included)
    pub byte_offset: u64,
    /// Data rows handed out so far across the pass
    pub rows_emitted: u64,
    /// Header of the current url as one delimited line, once read
    #[serde(default)]
    pub header: Option<String>,
    /// Every url has been read to the end
    #[serde(default)]
    pub complete: bool,
}

/// A batch of raw rows from one source
#[derive(Debug, Clone)]
pub struct RawChunk {
    /// Chunk number within this fetch run
    pub seq: u64,
    pub source_index: usize,
    /// Pass position of the first row
    pub first_row: u64,
    /// Decoded records, one per data row
    pub rows: Vec<ByteRecord>,
    pub schema: Arc<Schema>,
    /// Checkpoint after this chunk
    pub end: FetchCheckpoint,
}

pub struct Fetcher {
    source: SourceDescriptor,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    chunk_rows: usize,
    cancel: CancelToken,
}

impl Fetcher {
    pub fn new(
        source: SourceDescriptor,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        chunk_rows: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            source,
            transport,
            retry,
            chunk_rows: chunk_rows.max(1),
            cancel,
        }
    }

    /// Read from `start` to the end of the pass, calling `emit` for each chunk.
    ///
    /// Chunks arrive in pass order. If `emit` fails the run stops with its error.
    pub fn run<F>(&self, start: FetchCheckpoint, mut emit: F) -> Result<FetchCheckpoint, FetchError>
    where
        F: FnMut(RawChunk) -> Result<(), FetchError>,
    {
        let fresh = start == FetchCheckpoint::default();
        let mut checkpoint = start;
        let mut seq = 0u64;
        let mut bytes_read = 0u64;

        if self.source.urls.is_empty() {
            checkpoint.complete = true;
            return Ok(checkpoint);
        }

        while !checkpoint.complete && checkpoint.source_index < self.source.urls.len() {
            let idx = checkpoint.source_index;
            info!(
                url = %self.source.urls[idx],
                offset = checkpoint.byte_offset,
                "Fetching source {}/{}",
                idx + 1,
                self.source.urls.len()
            );
            bytes_read += self.fetch_source(idx, &mut checkpoint, &mut seq, &mut emit)?;
        }

        if let Some(expected) = self.source.expected_size
            && fresh
            && expected != bytes_read
        {
            warn!(expected, actual = bytes_read, "Source size differs from expected size");
        }

        Ok(checkpoint)
    }

    /// Read one url to its end, retrying transient failures from the last checkpoint
    fn fetch_source<F>(
        &self,
        idx: usize,
        checkpoint: &mut FetchCheckpoint,
        seq: &mut u64,
        emit: &mut F,
    ) -> Result<u64, FetchError>
    where
        F: FnMut(RawChunk) -> Result<(), FetchError>,
    {
        let url = self.source.urls[idx].as_str();
        let start_offset = checkpoint.byte_offset;
        let mut failures = 0u32;

        loop {
            self.check_cancelled()?;
            match self.stream_source(url, idx, checkpoint, seq, emit, &mut failures) {
                Ok(source_len) => return Ok(source_len.saturating_sub(start_offset)),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if !self.retry.allows_retry(failures) {
                        return Err(FetchError::RetriesExhausted {
                            url: url.to_string(),
                            attempts: failures,
                            last: e.to_string(),
                        });
                    }
                    warn!(
                        url,
                        attempt = failures,
                        offset = checkpoint.byte_offset,
                        error = %e,
                        "Transient fetch failure, retrying in {:?}",
                        self.retry.delay(failures)
                    );
                    self.retry.backoff(failures, &self.cancel)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream one url from the checkpoint; returns the url's total length in bytes
    fn stream_source<F>(
        &self,
        url: &str,
        idx: usize,
        checkpoint: &mut FetchCheckpoint,
        seq: &mut u64,
        emit: &mut F,
        failures: &mut u32,
    ) -> Result<u64, FetchError>
    where
        F: FnMut(RawChunk) -> Result<(), FetchError>,
    {
        let mut opened = self.transport.open(url, checkpoint.byte_offset)?;
        let base = checkpoint.byte_offset;

        if base > 0 && !opened.resumed {
            warn!(url, offset = base, "Source ignored the range request; re-reading from the start");
            let skipped = io::copy(&mut opened.reader.by_ref().take(base), &mut io::sink())
                .map_err(|e| FetchError::transient(url, e))?;
            if skipped < base {
                return Err(FetchError::transient(url, "source shorter than checkpoint"));
            }
        }

        let mut records = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(self.source.delimiter)
            .flexible(true)
            .buffer_capacity(READ_BLOCK)
            .from_reader(opened.reader);
        let total = opened.total;
        // Position of the next unread byte of this url
        let consumed = |records: &csv::Reader<Box<dyn Read + Send>>| base + records.position().byte();

        let schema = match checkpoint.header.clone().filter(|_| base > 0) {
            Some(header) => Arc::new(self.parse_header(url, &header)?),
            None if base > 0 => {
                return Err(FetchError::malformed(url, "checkpoint has an offset but no header"));
            }
            None => {
                let mut header = ByteRecord::new();
                if !read_record(url, &mut records, &mut header)? {
                    return Err(FetchError::malformed(url, "source is empty"));
                }
                let schema = Schema::from_record(&header, self.source.schema, self.source.delimiter)
                    .map_err(|reason| FetchError::malformed(url, reason))?;
                let line = header_line(&header, self.source.delimiter)
                    .map_err(|reason| FetchError::malformed(url, reason))?;
                checkpoint.header = Some(line);
                Arc::new(schema)
            }
        };

        let mut rows: Vec<ByteRecord> = Vec::with_capacity(self.chunk_rows.min(READ_BLOCK));
        let mut current = ByteRecord::new();
        let mut has_current = read_record(url, &mut records, &mut current)?;
        let mut offset = consumed(&records);

        while has_current {
            let mut next = ByteRecord::new();
            let has_next = read_record(url, &mut records, &mut next)?;
            // The last record of a short body may be cut mid-field
            if !has_next
                && let Some(total) = total
                && offset < total
            {
                return Err(FetchError::transient(
                    url,
                    format!("body truncated at {} of {} bytes", offset, total),
                ));
            }
            rows.push(std::mem::replace(&mut current, next));

            if rows.len() >= self.chunk_rows {
                let end = FetchCheckpoint {
                    source_index: idx,
                    byte_offset: offset,
                    rows_emitted: checkpoint.rows_emitted + rows.len() as u64,
                    header: checkpoint.header.clone(),
                    complete: false,
                };
                self.emit_chunk(idx, std::mem::take(&mut rows), &schema, end, checkpoint, seq, emit)?;
                *failures = 0;
            }
            has_current = has_next;
            offset = consumed(&records);
        }

        if let Some(total) = total
            && offset < total
        {
            return Err(FetchError::transient(
                url,
                format!("body truncated at {} of {} bytes", offset, total),
            ));
        }

        let next = idx + 1;
        let end = FetchCheckpoint {
            source_index: next,
            byte_offset: 0,
            rows_emitted: checkpoint.rows_emitted + rows.len() as u64,
            header: None,
            complete: next >= self.source.urls.len(),
        };
        let source_bytes = offset;
        self.emit_chunk(idx, rows, &schema, end, checkpoint, seq, emit)?;
        info!(url, bytes = source_bytes, rows = checkpoint.rows_emitted, "Source finished");
        Ok(source_bytes)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_chunk<F>(
        &self,
        idx: usize,
        rows: Vec<ByteRecord>,
        schema: &Arc<Schema>,
        end: FetchCheckpoint,
        checkpoint: &mut FetchCheckpoint,
        seq: &mut u64,
        emit: &mut F,
    ) -> Result<(), FetchError>
    where
        F: FnMut(RawChunk) -> Result<(), FetchError>,
    {
        self.check_cancelled()?;
        debug!(seq = *seq, rows = rows.len(), offset = end.byte_offset, "Chunk ready");
        let chunk = RawChunk {
            seq: *seq,
            source_index: idx,
            first_row: checkpoint.rows_emitted,
            rows,
            schema: Arc::clone(schema),
            end: end.clone(),
        };
        emit(chunk)?;
        *seq += 1;
        *checkpoint = end;
        Ok(())
    }

    fn parse_header(&self, url: &str, header: &str) -> Result<Schema, FetchError> {
        Schema::from_header(header, self.source.schema, self.source.delimiter)
            .map_err(|reason| FetchError::malformed(url, reason))
    }

    fn check_cancelled(&self) -> Result<(), FetchError> {
        if self.cancel.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Decode the next record. Blank lines are skipped; a quoted field may span lines.
fn read_record<R: Read>(
    url: &str,
    records: &mut csv::Reader<R>,
    record: &mut ByteRecord,
) -> Result<bool, FetchError> {
    records.read_byte_record(record).map_err(|e| {
        if e.is_io_error() {
            FetchError::transient(url, e)
        } else {
            FetchError::malformed(url, e)
        }
    })
}
