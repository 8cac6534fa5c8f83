//! Application configuration.
//!
//! Stored as `config.json` in the application data directory. Every field has
//! a default, so a partial (or missing) file is valid.

use crate::fetch::RetryPolicy;
use crate::query::scorer::ScoringWeights;
use crate::utils::{get_app_data_dir, get_config_path, num_cpus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// IRS EO BMF regional extracts
pub const IRS_BASE_URL: &str = "https://www.irs.gov/pub/irs-soi";
pub const IRS_REGIONS: [&str; 4] = ["eo1", "eo2", "eo3", "eo4"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where generations and jobs live. Defaults to the app data directory.
    pub data_dir: Option<PathBuf>,
    pub import: ImportConfig,
    pub fetch: FetchConfig,
    pub index: IndexConfig,
    pub query: QueryConfig,
}

impl AppConfig {
    /// Load config from the app data directory, or return default if not found
    pub fn load() -> Result<Self> {
        let config_path = get_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load config from an explicit path, or return default if not found
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).context("Failed to read config file")?;
            let config: AppConfig =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the app data directory
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path()?;
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Resolve the data directory, creating it if needed
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => get_app_data_dir()?,
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data dir {}", dir.display()))?;
        Ok(dir)
    }
}

/// Import pipeline sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Normalizer worker threads (0 = number of CPUs)
    pub normalizer_workers: usize,
    /// Bounded capacity (in chunks) of the fetcher -> normalizer queue
    pub raw_queue_capacity: usize,
    /// Bounded capacity (in chunks) of the normalizer -> staging queue
    pub normalized_queue_capacity: usize,
    /// Rows per raw chunk; the checkpoint advances once per chunk
    pub chunk_rows: usize,
    /// Rejected/read ratio above which a finished job is flagged degraded
    pub degraded_reject_ratio: f64,
    /// How many rejected rows to keep as examples in the job record
    pub reject_sample_limit: usize,
}

impl ImportConfig {
    /// Get the effective normalizer worker count (resolves 0 to CPU count)
    pub fn effective_normalizer_workers(&self) -> usize {
        if self.normalizer_workers == 0 {
            num_cpus()
        } else {
            self.normalizer_workers
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            normalizer_workers: 0,
            raw_queue_capacity: 16,
            normalized_queue_capacity: 16,
            chunk_rows: 10_000,
            degraded_reject_ratio: 0.05,
            reject_sample_limit: 20,
        }
    }
}

/// Network behaviour of the fetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub connect_timeout_secs: u64,
    /// Whole-request timeout; bulk files need a generous value
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub retry: RetryPolicy,
    /// Sources used when an import is started without explicit urls
    pub default_sources: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            request_timeout_secs: 60 * 60,
            user_agent: format!("npsearch/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
            default_sources: IRS_REGIONS
                .iter()
                .map(|region| format!("{}/{}.csv", IRS_BASE_URL, region))
                .collect(),
        }
    }
}

/// Index construction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Shard worker threads (0 = number of CPUs)
    pub shard_workers: usize,
    /// Bounded capacity (in batches) of each shard queue
    pub shard_queue_capacity: usize,
    /// Records per batch sent to a shard
    pub shard_batch_size: usize,
    pub min_token_len: usize,
    pub max_token_len: usize,
    /// Term frequency cap per field
    pub tf_cap: u8,
}

impl IndexConfig {
    pub fn effective_shard_workers(&self) -> usize {
        if self.shard_workers == 0 {
            num_cpus()
        } else {
            self.shard_workers
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            shard_workers: 0,
            shard_queue_capacity: 8,
            shard_batch_size: 1024,
            min_token_len: 2,
            max_token_len: 64,
            tf_cap: 3,
        }
    }
}

/// Query limits and ranking weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_limit: usize,
    /// Hard upper bound on page size
    pub max_limit: usize,
    pub scoring: ScoringWeights,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 500,
            scoring: ScoringWeights::default(),
        }
    }
}
