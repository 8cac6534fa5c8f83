//! The `NonprofitIndex` facade: one handle over the index store, the import
//! orchestrator and the query engine.
//!
//! Every read pins the active generation once and answers entirely from it,
//! so a swap during a search or export is never observed half way.

use crate::config::AppConfig;
use crate::error::{ImportError, QueryError};
use crate::fetch::{DefaultTransport, SourceDescriptor, Transport};
use crate::import::{ImportJob, ImportOrchestrator, ImportStatus, JobId, JobState};
use crate::index::stats::IndexStats;
use crate::index::{BuildOptions, Ein, Generation, IndexBuilder, IndexStore, Organization, SearchIndex};
use crate::query::{ExportFormat, ExportStream, Filters, QueryEngine, SearchRequest, SearchResults};
use crate::utils::{CancelToken, generations_dir, jobs_dir};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Liveness summary for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub active_generation: Generation,
    pub last_import_completed_at: Option<DateTime<Utc>>,
    pub organizations: u64,
    /// State of the latest import job, if any
    pub import_state: Option<JobState>,
}

pub struct NonprofitIndex {
    data_dir: PathBuf,
    store: Arc<IndexStore>,
    imports: ImportOrchestrator,
    engine: QueryEngine,
}

impl NonprofitIndex {
    /// Open the data directory with the default transport
    pub fn open(config: &AppConfig, data_dir: &Path) -> Result<Self> {
        let transport = DefaultTransport::new(&config.fetch).context("Failed to set up source transport")?;
        Self::open_with_transport(config, data_dir, Arc::new(transport))
    }

    /// Open the data directory and load the active generation. An import a
    /// previous process left unfinished stays paused until [`Self::resume_import`].
    pub fn open_with_transport(
        config: &AppConfig,
        data_dir: &Path,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let builder = IndexBuilder::new(BuildOptions::from_config(&config.index), CancelToken::new());
        let store = Arc::new(
            IndexStore::open(&generations_dir(data_dir), &builder)
                .context("Failed to open index store")?,
        );
        let imports = ImportOrchestrator::new(config, &jobs_dir(data_dir), Arc::clone(&store), transport)
            .context("Failed to load import jobs")?;
        info!(
            data_dir = %data_dir.display(),
            generation = store.active_generation(),
            "Nonprofit index opened"
        );
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            store,
            imports,
            engine: QueryEngine::new(&config.query),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The generation readers currently see
    pub fn active(&self) -> Arc<SearchIndex> {
        self.store.get_active()
    }

    /// Continue an interrupted import in the background
    pub fn resume_import(&self) -> Result<Option<JobId>, ImportError> {
        let resumed = self.imports.resume()?;
        if let Some(job) = &resumed {
            info!(job = %job, "Interrupted import resumed in the background");
        }
        Ok(resumed)
    }

    pub fn start_import(&self, source: SourceDescriptor) -> Result<JobId, ImportError> {
        self.imports.start(source)
    }

    pub fn import_status(&self, job_id: &str) -> Option<ImportStatus> {
        self.imports.job(job_id).map(|job| job.status())
    }

    pub fn current_job(&self) -> Option<ImportJob> {
        self.imports.current()
    }

    pub fn cancel_import(&self) -> Result<JobId, ImportError> {
        self.imports.cancel()
    }

    pub fn acknowledge(&self) -> Result<(), ImportError> {
        self.imports.acknowledge()
    }

    /// Block until the running import finishes
    pub fn wait_for_import(&self) -> Option<ImportJob> {
        let job = self.imports.wait();
        self.store.reap();
        job
    }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchResults, QueryError> {
        let results = {
            let index = self.store.get_active();
            self.engine.search(&index, request)?
        };
        let released = self.store.reap();
        if released > 0 {
            debug!(released, "Released retired generations after search");
        }
        Ok(results)
    }

    /// Stream every match in EIN order
    pub fn export(
        &self,
        term: Option<&str>,
        filters: &Filters,
        format: ExportFormat,
    ) -> Result<ExportStream, QueryError> {
        self.export_from(term, filters, format, None)
    }

    /// Continue an interrupted export after the last EIN the caller received.
    /// Answers from whichever generation is active now.
    pub fn resume_export(
        &self,
        term: Option<&str>,
        filters: &Filters,
        format: ExportFormat,
        after: &Ein,
    ) -> Result<ExportStream, QueryError> {
        self.export_from(term, filters, format, Some(after))
    }

    fn export_from(
        &self,
        term: Option<&str>,
        filters: &Filters,
        format: ExportFormat,
        after: Option<&Ein>,
    ) -> Result<ExportStream, QueryError> {
        let index = self.store.get_active();
        let matched = self.engine.matching(&index, term, filters)?;
        info!(
            generation = index.generation(),
            matched = matched.len(),
            format = format.as_str(),
            resumed = after.is_some(),
            "Export started"
        );
        Ok(ExportStream::new(index, matched, format, after))
    }

    pub fn organization(&self, ein: &str) -> Option<Organization> {
        let index = self.store.get_active();
        self.engine.organization(&index, ein).cloned()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats::collect(&self.store.get_active(), self.store.generations_dir())
    }

    pub fn health(&self) -> Health {
        let index = self.store.get_active();
        let meta = index.meta();
        let last_import_completed_at = if meta.generation == 0 {
            None
        } else {
            Utc.timestamp_opt(meta.built_at, 0).single()
        };

        Health {
            active_generation: index.generation(),
            last_import_completed_at,
            organizations: index.len() as u64,
            import_state: self.imports.current().map(|job| job.state),
        }
    }
}
