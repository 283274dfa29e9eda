use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::primitives::retry::{RetryPolicy, DELETE_RETRY_ATTEMPTS, DELETE_RETRY_BACKOFF};
use crate::storage::metrics::UndoMetrics;
use crate::storage::undo::DEFAULT_UNDO_PAGE_SIZE;
use crate::types::{Result, SombraError};

/// Configuration options supplied when opening an [`super::Engine`].
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// extern_threshold = 2048
///
/// [purge]
/// batch_size = 64
/// workers = 2
/// ```
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Byte capacity of one undo page.
    pub undo_page_size: usize,
    /// Encoded values longer than this are moved to external storage.
    pub extern_threshold: usize,
    /// Bytes of an external value kept in the row and in index entries.
    pub extern_prefix_len: usize,
    /// Upper bound on undo records followed by one version walk.
    pub max_version_steps: usize,
    /// Purge configuration.
    pub purge: PurgeCfg,
    /// Pessimistic delete retry configuration.
    pub retry: RetryCfg,
    /// Optional metrics collection implementation.
    #[serde(skip)]
    pub metrics: Option<Arc<dyn UndoMetrics>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            undo_page_size: DEFAULT_UNDO_PAGE_SIZE,
            extern_threshold: 4096,
            extern_prefix_len: 768,
            max_version_steps: 1 << 20,
            purge: PurgeCfg::default(),
            retry: RetryCfg::default(),
            metrics: None,
        }
    }
}

impl EngineOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let opts: Self =
            toml::from_str(text).map_err(|err| SombraError::Config(err.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reads and parses a TOML options file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.undo_page_size < 256 || self.undo_page_size > usize::from(u16::MAX) + 1 {
            return Err(SombraError::Config(format!(
                "undo_page_size {} outside 256..=65536",
                self.undo_page_size
            )));
        }
        if self.extern_prefix_len > self.extern_threshold {
            return Err(SombraError::Config(
                "extern_prefix_len exceeds extern_threshold".to_owned(),
            ));
        }
        if self.max_version_steps == 0 {
            return Err(SombraError::Config("max_version_steps must be > 0".to_owned()));
        }
        if self.purge.batch_size == 0 || self.purge.workers == 0 {
            return Err(SombraError::Config(
                "purge batch_size and workers must be > 0".to_owned(),
            ));
        }
        Ok(())
    }

    /// Sets the undo page capacity.
    pub fn undo_page_size(mut self, bytes: usize) -> Self {
        self.undo_page_size = bytes;
        self
    }

    /// Sets the external storage threshold.
    pub fn extern_threshold(mut self, bytes: usize) -> Self {
        self.extern_threshold = bytes;
        self
    }

    /// Sets the locally kept prefix of external values.
    pub fn extern_prefix_len(mut self, bytes: usize) -> Self {
        self.extern_prefix_len = bytes;
        self
    }

    /// Sets the version walk bound.
    pub fn max_version_steps(mut self, steps: usize) -> Self {
        self.max_version_steps = steps;
        self
    }

    /// Sets the purge configuration.
    pub fn purge(mut self, cfg: PurgeCfg) -> Self {
        self.purge = cfg;
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, cfg: RetryCfg) -> Self {
        self.retry = cfg;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn UndoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Configuration for purge.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PurgeCfg {
    /// Whether [`super::Engine::open`] starts the background purge worker.
    pub background: bool,
    /// History entries taken per batch.
    pub batch_size: usize,
    /// Threads a batch is spread over.
    pub workers: usize,
    /// Idle wait of the background worker when nothing is purgeable (milliseconds).
    pub idle_wait_ms: u64,
    /// Whether purging an insert record clears the row's transaction id.
    pub reset_trx_id: bool,
}

impl Default for PurgeCfg {
    fn default() -> Self {
        Self {
            background: false,
            batch_size: 300,
            workers: 4,
            idle_wait_ms: 100,
            reset_trx_id: true,
        }
    }
}

impl PurgeCfg {
    /// Idle wait as a [`Duration`].
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

/// Configuration for pessimistic delete retries.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryCfg {
    /// Attempts before the delete is reported as fatal.
    pub max_attempts: u32,
    /// Pause between attempts (milliseconds).
    pub backoff_ms: u64,
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_attempts: DELETE_RETRY_ATTEMPTS,
            backoff_ms: DELETE_RETRY_BACKOFF.as_millis() as u64,
        }
    }
}

impl RetryCfg {
    /// Runtime policy for these settings.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}
