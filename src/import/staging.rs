//! Per-job staging file of normalized records in pass order.
//!
//! The file is a sequence of length-prefixed JSON [`StagedRecord`] frames. The
//! job checkpoint records the valid length after each chunk, so reopening for
//! a resume cuts off anything written after the last checkpoint.

use crate::error::{ImportError, IndexBuildError};
use crate::index::types::StagedRecord;
use crate::utils::{FrameReader, write_frame};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct StageWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
    records: u64,
}

impl StageWriter {
    /// Open `path` for appending after `valid_bytes` bytes holding `records` records
    pub fn open(path: &Path, valid_bytes: u64, records: u64) -> Result<Self, ImportError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ImportError::persist(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ImportError::persist(path, e))?;

        let len = file.metadata().map_err(|e| ImportError::persist(path, e))?.len();
        if len < valid_bytes {
            return Err(ImportError::persist(
                path,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("staging file has {} bytes, checkpoint expects {}", len, valid_bytes),
                ),
            ));
        }
        if len > valid_bytes {
            warn!(path = %path.display(), len, valid_bytes, "Discarding staged bytes past the checkpoint");
            file.set_len(valid_bytes).map_err(|e| ImportError::persist(path, e))?;
        }
        file.seek(SeekFrom::Start(valid_bytes))
            .map_err(|e| ImportError::persist(path, e))?;

        debug!(path = %path.display(), valid_bytes, records, "Staging file opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(256 * 1024, file),
            bytes: valid_bytes,
            records,
        })
    }

    pub fn append(&mut self, record: &StagedRecord) -> Result<(), ImportError> {
        let written = write_frame(&mut self.writer, record).map_err(|e| ImportError::persist(&self.path, e))?;
        self.bytes += written;
        self.records += 1;
        Ok(())
    }

    /// Flush and sync so the current length can be checkpointed
    pub fn sync(&mut self) -> Result<(), ImportError> {
        self.writer
            .flush()
            .and_then(|_| self.writer.get_ref().sync_data())
            .map_err(|e| ImportError::persist(&self.path, e))
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn records(&self) -> u64 {
        self.records
    }
}

/// Stream the staged records of a finished ingest. The iterator owns its
/// file and path, so it does not borrow `path`.
pub fn read_staged(
    path: &Path,
) -> Result<impl Iterator<Item = Result<StagedRecord, IndexBuildError>> + use<>, IndexBuildError> {
    let file = File::open(path).map_err(|e| IndexBuildError::storage(path, e))?;
    let path = path.to_path_buf();
    Ok(FrameReader::<_, StagedRecord>::new(BufReader::new(file)).map(move |frame| {
        frame.map_err(|e| IndexBuildError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })
    }))
}
