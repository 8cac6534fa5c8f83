//! Fetch → normalize → stage pipeline.
//!
//! ```text
//! fetcher ──raw chunks──▶ normalizer pool ──normalized chunks──▶ stage writer
//!          (bounded)                         (bounded)
//! ```
//!
//! Normalizers finish chunks out of order. The stage writer holds early
//! arrivals until their predecessors are written, so the staging file is in
//! source order and later duplicates of an EIN always carry a larger sequence.
//!
//! The fetcher takes one credit per chunk from a bounded credit channel and
//! the writer returns it once the chunk is staged. At most
//! [`PipelineOptions::reorder_window`] chunks are in flight, which also caps
//! how many the writer can be holding back.

use crate::config::ImportConfig;
use crate::error::{FetchError, ImportError};
use crate::fetch::{FetchCheckpoint, Fetcher, RawChunk};
use crate::import::staging::StageWriter;
use crate::index::types::StagedRecord;
use crate::normalize::{RejectedRow, normalize_row};
use crate::utils::CancelToken;
use crossbeam_channel::bounded;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub raw_capacity: usize,
    pub normalized_capacity: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &ImportConfig) -> Self {
        Self {
            workers: config.effective_normalizer_workers().max(1),
            raw_capacity: config.raw_queue_capacity.max(1),
            normalized_capacity: config.normalized_queue_capacity.max(1),
        }
    }

    /// Chunks allowed between the fetcher and the staging file
    pub fn reorder_window(&self) -> usize {
        self.raw_capacity + self.workers + self.normalized_capacity
    }
}

/// Chunks that finished ahead of their predecessors
struct ReorderBuffer {
    pending: BTreeMap<u64, NormalizedChunk>,
    next: u64,
    window: usize,
}

impl ReorderBuffer {
    fn new(window: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            next: 0,
            window,
        }
    }

    fn push(&mut self, chunk: NormalizedChunk) -> Result<(), ImportError> {
        if self.pending.len() >= self.window {
            return Err(ImportError::Worker(format!(
                "more than {} chunks waiting to be staged",
                self.window
            )));
        }
        self.pending.insert(chunk.seq, chunk);
        Ok(())
    }

    /// The next chunk in sequence, if it has arrived
    fn pop_ready(&mut self) -> Option<NormalizedChunk> {
        let chunk = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(chunk)
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// One raw chunk after normalization
#[derive(Debug)]
pub struct NormalizedChunk {
    pub seq: u64,
    /// Raw rows the chunk held
    pub rows: u64,
    pub records: Vec<StagedRecord>,
    pub rejected: Vec<RejectedRow>,
    /// Rows kept with coerced fields
    pub coerced: u64,
    pub end: FetchCheckpoint,
}

/// Normalize every row of a chunk. Row positions become record sequences.
pub fn normalize_chunk(chunk: RawChunk) -> NormalizedChunk {
    let mut records = Vec::with_capacity(chunk.rows.len());
    let mut rejected = Vec::new();
    let mut coerced = 0u64;

    for (i, raw) in chunk.rows.iter().enumerate() {
        let row = chunk.first_row + i as u64;
        match normalize_row(raw, &chunk.schema, row) {
            Ok(normalized) => {
                if !normalized.issues.is_empty() {
                    coerced += 1;
                }
                records.push(StagedRecord {
                    seq: row,
                    org: normalized.org,
                });
            }
            Err(reject) => rejected.push(reject),
        }
    }

    NormalizedChunk {
        seq: chunk.seq,
        rows: chunk.rows.len() as u64,
        records,
        rejected,
        coerced,
        end: chunk.end,
    }
}

/// A chunk that is durably staged; its checkpoint may now be persisted
#[derive(Debug)]
pub struct StagedChunk {
    pub rows: u64,
    pub staged: u64,
    pub rejected: Vec<RejectedRow>,
    pub coerced: u64,
    pub end: FetchCheckpoint,
    pub staged_bytes: u64,
    pub staged_records: u64,
    /// The fetcher has read its last byte
    pub fetch_finished: bool,
}

/// Run the pipeline from `start` until the fetch completes.
///
/// `on_staged` is called in source order after each chunk is synced to the
/// staging file. An error from it stops the pipeline.
pub fn ingest<F>(
    fetcher: &Fetcher,
    start: FetchCheckpoint,
    stage: &mut StageWriter,
    options: &PipelineOptions,
    cancel: &CancelToken,
    mut on_staged: F,
) -> Result<FetchCheckpoint, ImportError>
where
    F: FnMut(StagedChunk) -> Result<(), ImportError>,
{
    let fetch_done = AtomicBool::new(false);
    let fetch_done = &fetch_done;

    let window = options.reorder_window();

    thread::scope(|scope| {
        let (raw_tx, raw_rx) = bounded::<RawChunk>(options.raw_capacity);
        let (norm_tx, norm_rx) = bounded::<NormalizedChunk>(options.normalized_capacity);
        let (credit_tx, credit_rx) = bounded::<()>(window);

        let fetch_handle = scope.spawn(move || {
            let result = fetcher.run(start, |chunk| {
                credit_tx.send(()).map_err(|_| FetchError::Cancelled)?;
                raw_tx.send(chunk).map_err(|_| FetchError::Cancelled)
            });
            fetch_done.store(true, Ordering::Release);
            result
        });

        let workers: Vec<_> = (0..options.workers)
            .map(|worker| {
                let rx = raw_rx.clone();
                let tx = norm_tx.clone();
                scope.spawn(move || {
                    let mut chunks = 0u64;
                    for chunk in rx {
                        chunks += 1;
                        if tx.send(normalize_chunk(chunk)).is_err() {
                            break;
                        }
                    }
                    debug!(worker, chunks, "Normalizer finished");
                })
            })
            .collect();
        drop(raw_rx);
        drop(norm_tx);

        let written = (|| -> Result<(), ImportError> {
            let mut pending = ReorderBuffer::new(window);

            for chunk in &norm_rx {
                if cancel.is_cancelled() {
                    return Err(ImportError::Cancelled);
                }
                pending.push(chunk)?;

                while let Some(chunk) = pending.pop_ready() {
                    for record in &chunk.records {
                        stage.append(record)?;
                    }
                    stage.sync()?;
                    let _ = credit_rx.try_recv();
                    debug!(seq = chunk.seq, staged = chunk.records.len(), "Chunk staged");

                    on_staged(StagedChunk {
                        rows: chunk.rows,
                        staged: chunk.records.len() as u64,
                        rejected: chunk.rejected,
                        coerced: chunk.coerced,
                        end: chunk.end,
                        staged_bytes: stage.bytes(),
                        staged_records: stage.records(),
                        fetch_finished: fetch_done.load(Ordering::Acquire),
                    })?;
                }
            }

            if pending.len() > 0 {
                return Err(ImportError::Worker(format!(
                    "{} chunks arrived without their predecessors",
                    pending.len()
                )));
            }
            Ok(())
        })();

        // Unblock normalizers and the fetcher if the writer stopped early
        drop(norm_rx);
        drop(credit_rx);

        let fetched = fetch_handle.join();
        let joined: Vec<bool> = workers.into_iter().map(|handle| handle.join().is_ok()).collect();
        let workers_ok = joined.iter().all(|ok| *ok);

        written?;
        let checkpoint = match fetched {
            Ok(result) => result.map_err(|e| ImportError::from(e).normalize_cancel())?,
            Err(_) => return Err(ImportError::Worker("fetcher panicked".to_string())),
        };
        if !workers_ok {
            return Err(ImportError::Worker("normalizer panicked".to_string()));
        }
        Ok(checkpoint)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FileTransport, RetryPolicy, SourceDescriptor};
    use crate::import::staging::read_staged;
    use std::sync::Arc;

    fn source(dir: &std::path::Path, rows: usize) -> SourceDescriptor {
        let mut csv = String::from("EIN,NAME,STATE,REVENUE_AMT\n");
        for i in 0..rows {
            if i == 3 {
                csv.push_str("bad,Broken Row,CA,1\n");
            } else {
                csv.push_str(&format!("{:09},Org {},CA,{}\n", i + 1, i, i * 10));
            }
        }
        let path = dir.join("eo.csv");
        std::fs::write(&path, csv).unwrap();
        SourceDescriptor::new(vec![path.display().to_string()])
    }

    fn fetcher(source: SourceDescriptor, cancel: &CancelToken) -> Fetcher {
        Fetcher::new(
            source,
            Arc::new(FileTransport),
            RetryPolicy::default(),
            3,
            cancel.clone(),
        )
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            workers: 4,
            raw_capacity: 2,
            normalized_capacity: 2,
        }
    }

    #[test]
    fn test_stages_in_source_order() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let fetcher = fetcher(source(dir.path(), 40), &cancel);
        let path = dir.path().join("staged.bin");
        let mut stage = StageWriter::open(&path, 0, 0).unwrap();

        let mut rows = 0;
        let mut rejected = 0;
        let mut last_rows_emitted = 0;
        let end = ingest(&fetcher, FetchCheckpoint::default(), &mut stage, &options(), &cancel, |chunk| {
            rows += chunk.rows;
            rejected += chunk.rejected.len();
            assert!(chunk.end.rows_emitted >= last_rows_emitted);
            last_rows_emitted = chunk.end.rows_emitted;
            Ok(())
        })
        .unwrap();

        assert!(end.complete);
        assert_eq!(rows, 40);
        assert_eq!(rejected, 1);
        let seqs: Vec<u64> = read_staged(&path).unwrap().map(|r| r.unwrap().seq).collect();
        assert_eq!(seqs.len(), 39);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_many_chunks_through_a_narrow_window() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let fetcher = fetcher(source(dir.path(), 300), &cancel);
        let path = dir.path().join("staged.bin");
        let mut stage = StageWriter::open(&path, 0, 0).unwrap();
        let options = PipelineOptions {
            workers: 8,
            raw_capacity: 1,
            normalized_capacity: 1,
        };
        assert_eq!(options.reorder_window(), 10);

        let mut chunks = 0;
        ingest(&fetcher, FetchCheckpoint::default(), &mut stage, &options, &cancel, |_| {
            chunks += 1;
            Ok(())
        })
        .unwrap();

        assert!(chunks >= 100);
        let seqs: Vec<u64> = read_staged(&path).unwrap().map(|r| r.unwrap().seq).collect();
        assert_eq!(seqs.len(), 299);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    fn empty_chunk(seq: u64) -> NormalizedChunk {
        NormalizedChunk {
            seq,
            rows: 0,
            records: Vec::new(),
            rejected: Vec::new(),
            coerced: 0,
            end: FetchCheckpoint::default(),
        }
    }

    #[test]
    fn test_reorder_buffer_releases_in_sequence() {
        let mut buffer = ReorderBuffer::new(3);
        buffer.push(empty_chunk(2)).unwrap();
        buffer.push(empty_chunk(1)).unwrap();
        assert!(buffer.pop_ready().is_none());

        buffer.push(empty_chunk(0)).unwrap();
        let order: Vec<u64> = std::iter::from_fn(|| buffer.pop_ready()).map(|c| c.seq).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_reorder_buffer_rejects_overflow() {
        let mut buffer = ReorderBuffer::new(2);
        buffer.push(empty_chunk(1)).unwrap();
        buffer.push(empty_chunk(2)).unwrap();
        assert!(matches!(buffer.push(empty_chunk(3)), Err(ImportError::Worker(_))));
    }

    #[test]
    fn test_callback_error_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let fetcher = fetcher(source(dir.path(), 60), &cancel);
        let mut stage = StageWriter::open(&dir.path().join("staged.bin"), 0, 0).unwrap();

        let mut calls = 0;
        let result = ingest(&fetcher, FetchCheckpoint::default(), &mut stage, &options(), &cancel, |_| {
            calls += 1;
            if calls == 2 {
                return Err(ImportError::NoActiveJob);
            }
            Ok(())
        });
        assert!(matches!(result, Err(ImportError::NoActiveJob)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_cancel_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let fetcher = fetcher(source(dir.path(), 60), &cancel);
        let mut stage = StageWriter::open(&dir.path().join("staged.bin"), 0, 0).unwrap();

        let result = ingest(&fetcher, FetchCheckpoint::default(), &mut stage, &options(), &cancel, |_| {
            cancel.cancel();
            Ok(())
        });
        assert!(matches!(result, Err(ImportError::Cancelled)));
    }
}
