//! Lazy CSV / JSON export of a matching set.
//!
//! An [`ExportStream`] owns the generation it was opened on, so an import that
//! commits mid-export does not change what the stream produces. Records are
//! rendered one at a time in EIN order as the caller reads. CSV rows go
//! through a `csv` writer, so fields are quoted only when they need it.

use crate::error::QueryError;
use crate::index::search_index::SearchIndex;
use crate::index::types::{Ein, Generation, Organization};
use roaring::RoaringBitmap;
use roaring::bitmap::IntoIter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(QueryError::UnknownFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Records,
    Finished,
}

pub struct ExportStream {
    index: Arc<SearchIndex>,
    docs: IntoIter,
    format: ExportFormat,
    /// Resumed streams skip the CSV header
    resumed: bool,
    phase: Phase,
    emitted: u64,
    csv: csv::WriterBuilder,
    buf: Vec<u8>,
    pos: usize,
    /// EIN of the record currently in `buf`
    pending: Option<Ein>,
    /// EIN of the last record fully read out
    completed: Option<Ein>,
}

impl ExportStream {
    /// Stream `matched` from `index`, starting after `after` when given
    pub fn new(
        index: Arc<SearchIndex>,
        mut matched: RoaringBitmap,
        format: ExportFormat,
        after: Option<&Ein>,
    ) -> Self {
        if let Some(cursor) = after {
            let start = index.documents().partition_point(|org| org.ein <= *cursor) as u32;
            matched.remove_range(0..start);
        }

        Self {
            index,
            docs: matched.into_iter(),
            format,
            resumed: after.is_some(),
            phase: Phase::Start,
            emitted: 0,
            csv: csv_writer(),
            buf: Vec::with_capacity(1024),
            pos: 0,
            pending: None,
            completed: None,
        }
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    pub fn generation(&self) -> Generation {
        self.index.generation()
    }

    /// Records rendered so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Records not yet rendered
    pub fn remaining(&self) -> u64 {
        self.docs.size_hint().0 as u64
    }

    /// EIN of the last record the reader has fully consumed. Passing it back
    /// as `after` restarts the export with the next record.
    pub fn cursor(&self) -> Option<&Ein> {
        self.completed.as_ref()
    }

    /// Render the next piece of output into `buf`. Returns false when done.
    fn refill(&mut self) -> io::Result<bool> {
        self.buf.clear();
        self.pos = 0;
        if let Some(ein) = self.pending.take() {
            self.completed = Some(ein);
        }

        match self.phase {
            Phase::Finished => return Ok(false),
            Phase::Start => {
                self.phase = Phase::Records;
                match self.format {
                    ExportFormat::Csv if !self.resumed => {
                        write_csv_row(&self.csv, &mut self.buf, Organization::COLUMNS)?;
                        return Ok(true);
                    }
                    ExportFormat::Csv => {}
                    ExportFormat::Json => {
                        self.buf.push(b'[');
                        return Ok(true);
                    }
                }
            }
            Phase::Records => {}
        }

        let org = loop {
            match self.docs.next() {
                Some(doc) => {
                    if let Some(org) = self.index.doc(doc) {
                        break Some(org);
                    }
                }
                None => break None,
            }
        };

        match org {
            Some(org) => {
                match self.format {
                    ExportFormat::Csv => {
                        let values = org.column_values();
                        write_csv_row(&self.csv, &mut self.buf, &values)?;
                    }
                    ExportFormat::Json => {
                        if self.emitted > 0 {
                            self.buf.push(b',');
                        }
                        self.buf.push(b'\n');
                        serde_json::to_writer(&mut self.buf, org).map_err(io::Error::other)?;
                    }
                }
                self.pending = Some(org.ein.clone());
                self.emitted += 1;
                Ok(true)
            }
            None => {
                self.phase = Phase::Finished;
                if self.format == ExportFormat::Json {
                    self.buf.extend_from_slice(b"\n]\n");
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }
}

impl Read for ExportStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.buf.len() {
            if !self.refill()? {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        if self.pos == self.buf.len()
            && let Some(ein) = self.pending.take()
        {
            self.completed = Some(ein);
        }
        Ok(n)
    }
}

fn csv_writer() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder
        .terminator(csv::Terminator::Any(b'\n'))
        .quote_style(csv::QuoteStyle::Necessary)
        .buffer_capacity(1024);
    builder
}

/// Append one record to `buf`
fn write_csv_row<I, T>(builder: &csv::WriterBuilder, buf: &mut Vec<u8>, fields: I) -> io::Result<()>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = builder.from_writer(buf);
    writer.write_record(fields)?;
    writer.flush()
}
