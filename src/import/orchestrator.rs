//! Import orchestration: one job at a time, run on a background thread.
//!
//! The job record is persisted after every state change and every staged
//! chunk. On restart a non-terminal job continues from the step its state
//! names instead of starting over:
//!
//! | persisted state                  | resumes with                          |
//! |----------------------------------|---------------------------------------|
//! | Fetching / Normalizing, fetch incomplete | fetch from the checkpoint     |
//! | Normalizing, fetch complete      | indexing of the staged records        |
//! | Indexing                         | indexing of the staged records        |
//! | Swapping                         | done if `CURRENT` names the target, else indexing |

use crate::config::{AppConfig, FetchConfig, ImportConfig, IndexConfig};
use crate::error::ImportError;
use crate::fetch::{Fetcher, SourceDescriptor, Transport};
use crate::import::job::{ImportJob, JobCheckpoint, JobId, JobState, JobStore};
use crate::import::pipeline::{PipelineOptions, ingest};
use crate::import::staging::{StageWriter, read_staged};
use crate::index::{BuildOptions, IndexBuilder, IndexStore};
use crate::utils::CancelToken;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ImportOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    import: ImportConfig,
    fetch: FetchConfig,
    index: IndexConfig,
    jobs: JobStore,
    store: Arc<IndexStore>,
    transport: Arc<dyn Transport>,
    /// Latest job, as last persisted
    job: Mutex<Option<ImportJob>>,
    cancel: Mutex<CancelToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ImportOrchestrator {
    pub fn new(
        config: &AppConfig,
        jobs_dir: &Path,
        store: Arc<IndexStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ImportError> {
        let jobs = JobStore::new(jobs_dir);
        let job = jobs.load_current()?;
        if let Some(job) = &job {
            info!(job = %job.id, state = %job.state, "Loaded last import job");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                import: config.import.clone(),
                fetch: config.fetch.clone(),
                index: config.index.clone(),
                jobs,
                store,
                transport,
                job: Mutex::new(job),
                cancel: Mutex::new(CancelToken::new()),
                worker: Mutex::new(None),
            }),
        })
    }

    /// Start a new job. Fails with `JobInProgress` while another job runs.
    pub fn start(&self, source: SourceDescriptor) -> Result<JobId, ImportError> {
        if source.urls.is_empty() {
            return Err(ImportError::EmptySource);
        }

        let (job, cancel) = {
            let mut slot = lock(&self.inner.job);
            if let Some(existing) = slot.as_ref() {
                if existing.state.is_running() {
                    return Err(ImportError::JobInProgress {
                        job_id: existing.id.clone(),
                    });
                }
                if existing.state.is_terminal() {
                    info!(job = %existing.id, state = %existing.state, "Acknowledging previous job");
                }
            }

            let mut job = ImportJob::new(source);
            job.transition(JobState::Fetching)?;
            self.inner.jobs.save(&job)?;
            self.inner.jobs.set_current(&job.id)?;
            let pruned = self.inner.jobs.prune(&job.id)?;
            if pruned > 0 {
                info!(pruned, "Removed old job directories");
            }
            // The token must be in place before the job is visible to `cancel`
            let cancel = self.inner.arm_cancel();
            *slot = Some(job.clone());
            (job, cancel)
        };

        let id = job.id.clone();
        info!(job = %id, urls = job.source.urls.len(), "Import started");
        self.spawn(job, cancel)?;
        Ok(id)
    }

    /// Continue a job left non-terminal by a previous process
    pub fn resume(&self) -> Result<Option<JobId>, ImportError> {
        let (job, cancel) = {
            let mut slot = lock(&self.inner.job);
            match slot.as_mut() {
                Some(job) if job.state.is_running() => {
                    job.resumes += 1;
                    self.inner.jobs.save(job)?;
                    (job.clone(), self.inner.arm_cancel())
                }
                _ => return Ok(None),
            }
        };

        warn!(
            job = %job.id,
            state = %job.state,
            rows_read = job.rows_read,
            offset = job.checkpoint.fetch.byte_offset,
            "Resuming interrupted import"
        );
        let id = job.id.clone();
        self.spawn(job, cancel)?;
        Ok(Some(id))
    }

    fn spawn(&self, job: ImportJob, cancel: CancelToken) -> Result<(), ImportError> {
        let mut worker = lock(&self.inner.worker);
        if let Some(previous) = worker.take() {
            // Terminal by now; join so the thread is not leaked
            let _ = previous.join();
        }

        let inner = Arc::clone(&self.inner);
        let name = format!("import-{}", &job.id[..8.min(job.id.len())]);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || inner.run_job(job, cancel))
            .map_err(|e| ImportError::Worker(e.to_string()))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Snapshot of the latest job
    pub fn current(&self) -> Option<ImportJob> {
        lock(&self.inner.job).clone()
    }

    /// Look up any job still on disk
    pub fn job(&self, id: &str) -> Option<ImportJob> {
        if let Some(job) = lock(&self.inner.job).as_ref()
            && job.id == id
        {
            return Some(job.clone());
        }
        self.inner.jobs.load(id).ok().flatten()
    }

    /// Request cancellation of the running job
    pub fn cancel(&self) -> Result<JobId, ImportError> {
        match lock(&self.inner.job).as_ref() {
            Some(job) if job.state.is_running() => {
                info!(job = %job.id, "Cancellation requested");
                lock(&self.inner.cancel).cancel();
                Ok(job.id.clone())
            }
            _ => Err(ImportError::NoActiveJob),
        }
    }

    /// Return a finished job to `Idle`
    pub fn acknowledge(&self) -> Result<(), ImportError> {
        let mut slot = lock(&self.inner.job);
        match slot.as_mut() {
            Some(job) if job.state.is_running() => Err(ImportError::JobInProgress {
                job_id: job.id.clone(),
            }),
            Some(job) if job.state.is_terminal() => {
                job.transition(JobState::Idle)?;
                self.inner.jobs.save(job)
            }
            _ => Ok(()),
        }
    }

    /// Block until the background job (if any) has finished
    pub fn wait(&self) -> Option<ImportJob> {
        let handle = lock(&self.inner.worker).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("Import thread panicked");
        }
        self.current()
    }
}

impl Inner {
    /// Install a fresh cancellation token for the next run. Called with the
    /// job slot locked so `cancel` never sees a running job with a stale token.
    fn arm_cancel(&self) -> CancelToken {
        let cancel = CancelToken::new();
        *lock(&self.cancel) = cancel.clone();
        cancel
    }

    /// Persist the job and make it the visible snapshot
    fn publish(&self, job: &ImportJob) -> Result<(), ImportError> {
        self.jobs.save(job)?;
        *lock(&self.job) = Some(job.clone());
        Ok(())
    }

    fn run_job(&self, mut job: ImportJob, cancel: CancelToken) {
        let start = Instant::now();
        let id = job.id.clone();

        match self.drive(&mut job, &cancel) {
            Ok(()) => info!(
                job = %id,
                generation = job.target_generation,
                organizations = job.organizations,
                rows_read = job.rows_read,
                rejected = job.rows_rejected,
                degraded = job.degraded,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Import completed"
            ),
            Err(e) => {
                let e = e.normalize_cancel();
                match e {
                    ImportError::Cancelled => warn!(job = %id, "Import cancelled"),
                    _ => error!(job = %id, state = %job.state, error = %e, "Import failed"),
                }
                self.store.discard_shadow();
                job.fail(&e);
            }
        }

        if let Err(e) = self.jobs.remove_staging(&id) {
            warn!(job = %id, error = %e, "Failed to remove staging file");
        }
        if let Err(e) = self.publish(&job) {
            error!(job = %id, error = %e, "Failed to persist final job state");
            *lock(&self.job) = Some(job);
        }
    }

    fn drive(&self, job: &mut ImportJob, cancel: &CancelToken) -> Result<(), ImportError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            match job.state {
                JobState::Fetching | JobState::Normalizing if !job.checkpoint.fetch.complete => {
                    self.ingest(job, cancel)?;
                }
                JobState::Fetching => {
                    job.transition(JobState::Normalizing)?;
                    self.publish(job)?;
                }
                JobState::Normalizing => self.finish_ingest(job)?,
                JobState::Indexing => self.build_and_swap(job, cancel)?,
                JobState::Swapping => {
                    let active = self.store.active_generation();
                    if job.target_generation == Some(active) {
                        info!(job = %job.id, generation = active, "Generation already active");
                        job.transition(JobState::Completed)?;
                        self.publish(job)?;
                    } else {
                        warn!(job = %job.id, "Swap did not finish; rebuilding the generation");
                        self.build_and_swap(job, cancel)?;
                    }
                }
                JobState::Completed => return Ok(()),
                JobState::Idle | JobState::Failed => {
                    return Err(ImportError::InvalidTransition {
                        from: job.state.to_string(),
                        to: JobState::Completed.to_string(),
                    });
                }
            }
        }
    }

    fn ingest(&self, job: &mut ImportJob, cancel: &CancelToken) -> Result<(), ImportError> {
        let fetcher = Fetcher::new(
            job.source.clone(),
            Arc::clone(&self.transport),
            self.fetch.retry.clone(),
            self.import.chunk_rows,
            cancel.clone(),
        );
        let staging = self.jobs.staging_path(&job.id);
        let mut stage = StageWriter::open(
            &staging,
            job.checkpoint.staged_bytes,
            job.checkpoint.staged_records,
        )?;
        let options = PipelineOptions::from_config(&self.import);
        let sample_limit = self.import.reject_sample_limit;
        let start = job.checkpoint.fetch.clone();

        info!(
            job = %job.id,
            workers = options.workers,
            source = start.source_index,
            offset = start.byte_offset,
            "Ingest running"
        );

        let end = ingest(&fetcher, start, &mut stage, &options, cancel, |chunk| {
            job.rows_read += chunk.rows;
            job.rows_coerced += chunk.coerced;
            for rejected in chunk.rejected {
                job.record_rejection(rejected, sample_limit);
            }
            job.checkpoint = JobCheckpoint {
                fetch: chunk.end,
                staged_bytes: chunk.staged_bytes,
                staged_records: chunk.staged_records,
            };
            job.updated_at = chrono::Utc::now();
            if chunk.fetch_finished && job.state == JobState::Fetching {
                job.transition(JobState::Normalizing)?;
            }
            self.publish(job)
        })?;
        job.checkpoint.fetch = end;

        if job.state == JobState::Fetching {
            job.transition(JobState::Normalizing)?;
        }
        self.publish(job)
    }

    fn finish_ingest(&self, job: &mut ImportJob) -> Result<(), ImportError> {
        let ratio = job.reject_ratio();
        if job.rows_read > 0 && ratio > self.import.degraded_reject_ratio {
            job.degraded = true;
            warn!(
                job = %job.id,
                rejected = job.rows_rejected,
                read = job.rows_read,
                ratio,
                threshold = self.import.degraded_reject_ratio,
                "Reject ratio above threshold; job is degraded"
            );
        }
        if job.checkpoint.staged_records == 0 {
            return Err(ImportError::NoOrganizations);
        }

        info!(
            job = %job.id,
            rows_read = job.rows_read,
            staged = job.checkpoint.staged_records,
            rejected = job.rows_rejected,
            coerced = job.rows_coerced,
            "Ingest finished"
        );
        job.transition(JobState::Indexing)?;
        self.publish(job)
    }

    fn build_and_swap(&self, job: &mut ImportJob, cancel: &CancelToken) -> Result<(), ImportError> {
        let generation = self.store.begin_shadow()?;
        job.target_generation = Some(generation);
        self.publish(job)?;

        let builder = IndexBuilder::new(BuildOptions::from_config(&self.index), cancel.clone());
        let staged = self.jobs.staging_path(&job.id);
        let records = read_staged(&staged)?;
        let built = builder.build(records, generation, Some(job.id.clone()))?;
        if built.records != job.checkpoint.staged_records {
            warn!(
                job = %job.id,
                expected = job.checkpoint.staged_records,
                found = built.records,
                "Staged record count differs from checkpoint"
            );
        }
        self.store.write_shadow(&built.index)?;

        job.organizations = Some(built.index.len() as u64);
        job.duplicates = built.duplicates;
        if job.state == JobState::Indexing {
            job.transition(JobState::Swapping)?;
        }
        self.publish(job)?;

        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        self.store.commit_shadow(built.index)?;
        job.transition(JobState::Completed)?;
        self.publish(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::{FileTransport, Opened};
    use crossbeam_channel::{Receiver, Sender, bounded};

    /// Holds every open until the test releases it
    struct GatedTransport {
        gate: Receiver<()>,
    }

    impl Transport for GatedTransport {
        fn open(&self, url: &str, offset: u64) -> Result<Opened, FetchError> {
            let _ = self.gate.recv();
            FileTransport.open(url, offset)
        }
    }

    fn setup(dir: &Path, transport: Arc<dyn Transport>) -> ImportOrchestrator {
        let mut config = AppConfig::default();
        config.import.chunk_rows = 2;
        config.import.normalizer_workers = 2;
        config.index.shard_workers = 2;
        let builder = IndexBuilder::new(BuildOptions::from_config(&config.index), CancelToken::new());
        let store = Arc::new(IndexStore::open(&dir.join("generations"), &builder).unwrap());
        ImportOrchestrator::new(&config, &dir.join("jobs"), store, transport).unwrap()
    }

    fn write_source(dir: &Path) -> SourceDescriptor {
        let path = dir.join("eo.csv");
        std::fs::write(
            &path,
            "EIN,NAME,STATE\n111111111,Alpha,CA\n222222222,Beta,NY\n333333333,Gamma,TX\n",
        )
        .unwrap();
        SourceDescriptor::new(vec![path.display().to_string()])
    }

    fn gated(dir: &Path) -> (ImportOrchestrator, Sender<()>) {
        let (tx, rx) = bounded(16);
        (setup(dir, Arc::new(GatedTransport { gate: rx })), tx)
    }

    #[test]
    fn test_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = setup(dir.path(), Arc::new(FileTransport));
        let id = orchestrator.start(write_source(dir.path())).unwrap();
        let job = orchestrator.wait().unwrap();

        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.rows_read, 3);
        assert_eq!(job.organizations, Some(3));
        assert_eq!(orchestrator.inner.store.active_generation(), 1);
        assert!(!orchestrator.inner.jobs.staging_path(&id).exists());
    }

    #[test]
    fn test_second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, gate) = gated(dir.path());
        let source = write_source(dir.path());
        let id = orchestrator.start(source.clone()).unwrap();

        match orchestrator.start(source) {
            Err(ImportError::JobInProgress { job_id }) => assert_eq!(job_id, id),
            other => panic!("expected JobInProgress, got {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            orchestrator.acknowledge(),
            Err(ImportError::JobInProgress { .. })
        ));

        gate.send(()).unwrap();
        assert_eq!(orchestrator.wait().unwrap().state, JobState::Completed);
    }

    #[test]
    fn test_cancel_fails_job_and_keeps_active_index() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, gate) = gated(dir.path());
        orchestrator.start(write_source(dir.path())).unwrap();
        orchestrator.cancel().unwrap();
        gate.send(()).unwrap();

        let job = orchestrator.wait().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("cancelled"));
        assert_eq!(orchestrator.inner.store.active_generation(), 0);
        assert!(matches!(orchestrator.cancel(), Err(ImportError::NoActiveJob)));

        orchestrator.acknowledge().unwrap();
        assert_eq!(orchestrator.current().unwrap().state, JobState::Idle);
    }

    #[test]
    fn test_cancel_right_after_start_is_not_lost() {
        let dir = tempfile::tempdir().unwrap();

        for round in 0..20 {
            let root = dir.path().join(round.to_string());
            std::fs::create_dir_all(&root).unwrap();
            // The gated fetch keeps the job running until the canceller has
            // hit it, however early that is.
            let (orchestrator, gate) = gated(&root);
            let source = write_source(&root);

            thread::scope(|s| {
                let canceller = s.spawn(|| {
                    while orchestrator.cancel().is_err() {
                        thread::yield_now();
                    }
                });
                let id = orchestrator.start(source).unwrap();
                canceller.join().unwrap();
                gate.send(()).unwrap();

                let job = orchestrator.wait().unwrap();
                assert_eq!(job.id, id);
                assert_eq!(job.state, JobState::Failed);
                assert_eq!(job.error.as_deref(), Some("cancelled"));
            });
        }
    }

    #[test]
    fn test_missing_source_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = setup(dir.path(), Arc::new(FileTransport));
        let source = SourceDescriptor::new(vec![dir.path().join("absent.csv").display().to_string()]);
        orchestrator.start(source).unwrap();
        let job = orchestrator.wait().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("absent.csv"));
    }

    #[test]
    fn test_empty_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = setup(dir.path(), Arc::new(FileTransport));
        assert!(matches!(
            orchestrator.start(SourceDescriptor::new(Vec::new())),
            Err(ImportError::EmptySource)
        ));
        assert!(orchestrator.current().is_none());
    }
}
