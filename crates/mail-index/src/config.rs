//! Engine configuration
//!
//! Loaded (in order of priority):
//! 1. `MAIL_INDEX_*` environment variables for the worker count, queue
//!    capacity and chunk size
//! 2. `mail-index.json` in the config directory
//! 3. Built-in defaults

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::index::IndexSettings;
use crate::jobs::JobSettings;

/// Config filename in the mail-index config directory
pub const CONFIG_FILE: &str = "mail-index.json";

const WORKERS_ENV: &str = "MAIL_INDEX_WORKERS";
const QUEUE_CAPACITY_ENV: &str = "MAIL_INDEX_QUEUE_CAPACITY";
const CHUNK_SIZE_ENV: &str = "MAIL_INDEX_CHUNK_SIZE";

/// Which search index the engine writes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexBackendConfig {
    /// Local Tantivy index; `None` keeps it in RAM
    Tantivy { path: Option<PathBuf> },
    /// Remote JSON index service
    Http {
        url: String,
        /// Read timeout of regular requests; writes that hit it are retried without one
        #[serde(default)]
        read_timeout_ms: Option<u64>,
    },
}

impl Default for IndexBackendConfig {
    fn default() -> Self {
        IndexBackendConfig::Tantivy { path: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: IndexBackendConfig,
    pub page_size: usize,
    pub delete_batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let settings = IndexSettings::default();
        Self {
            backend: IndexBackendConfig::default(),
            page_size: settings.page_size,
            delete_batch_size: settings.delete_batch_size,
        }
    }
}

impl IndexConfig {
    pub fn settings(&self) -> IndexSettings {
        IndexSettings {
            page_size: self.page_size.max(1),
            delete_batch_size: self.delete_batch_size.max(1),
        }
    }
}

/// Settings of a [`crate::SyncEngine`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Worker threads running jobs
    pub workers: usize,
    /// Maximum number of queued jobs
    pub queue_capacity: usize,
    /// Sub-jobs a folder job keeps in flight when fanning out
    pub completion_capacity: usize,
    /// Ids per addition chunk; 0 processes all new messages as one chunk
    pub chunk_size: usize,
    /// Run addition chunks as sub-jobs
    pub fan_out: bool,
    /// Minimum time between two reconciliations of a folder
    pub staleness_secs: u64,
    /// A sync flag older than this is considered abandoned
    pub lock_lease_secs: u64,
    /// Interval of the stale-folder sweep; 0 disables it
    pub sweep_interval_secs: u64,
    /// Ids per store or index lookup
    pub id_query_chunk: usize,
    /// SQLite file for sync bookkeeping; `None` keeps it in memory
    pub bookkeeping_db: Option<PathBuf>,
    pub index: IndexConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1000,
            completion_capacity: 16,
            chunk_size: 0,
            fan_out: false,
            staleness_secs: 3600,
            lock_lease_secs: 3600,
            sweep_interval_secs: 300,
            id_query_chunk: 500,
            bookkeeping_db: None,
            index: IndexConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load from the config directory, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load from a specific JSON file (no environment overrides)
    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse sync config JSON")
    }

    /// Default path of the config file
    pub fn default_path() -> Option<PathBuf> {
        config::config_path(CONFIG_FILE)
    }

    /// Apply `MAIL_INDEX_*` overrides; unparsable values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |name: &str| -> Option<usize> {
            let raw = lookup(name)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring {}={:?}: not a number", name, raw);
                    None
                }
            }
        };

        if let Some(workers) = read(WORKERS_ENV) {
            self.workers = workers;
        }
        if let Some(capacity) = read(QUEUE_CAPACITY_ENV) {
            self.queue_capacity = capacity;
        }
        if let Some(chunk_size) = read(CHUNK_SIZE_ENV) {
            self.chunk_size = chunk_size;
        }
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            staleness: chrono::Duration::seconds(self.staleness_secs as i64),
            lock_lease: chrono::Duration::seconds(self.lock_lease_secs as i64),
            chunk_size: self.chunk_size,
            fan_out: self.fan_out,
            completion_capacity: self.completion_capacity.max(1),
            id_query_chunk: self.id_query_chunk.max(1),
        }
    }
}
