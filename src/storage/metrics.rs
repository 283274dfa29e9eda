use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking version reconstruction, purge and rollback activity.
///
/// Implementations are shared between the read path, purge workers and
/// rolling back transactions, so every method takes `&self`.
pub trait UndoMetrics: Send + Sync {
    /// Records one version walk that followed `steps` undo records.
    fn version_walk(&self, steps: usize);

    /// Records a walk that hit a purged or malformed undo record.
    fn missing_history(&self);

    /// Records a purge batch of `records` history entries.
    fn purge_batch(&self, records: usize);

    /// Records the fate of one secondary entry visited by purge.
    ///
    /// # Parameters
    /// * `outcome` - `"removed"`, `"kept"` or `"skipped"`.
    fn secondary_purge(&self, outcome: &'static str);

    /// Records a clustered record purge attempt.
    fn clustered_purge(&self, removed: bool);

    /// Records external values freed by purge or rollback.
    fn extern_freed(&self, count: usize);

    /// Records one undo record applied by rollback.
    fn rollback_step(&self);

    /// Records a pessimistic delete retried after running out of space.
    fn delete_retry(&self);
}

/// A no-op implementation of [`UndoMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl UndoMetrics for NoopMetrics {
    fn version_walk(&self, _steps: usize) {}
    fn missing_history(&self) {}
    fn purge_batch(&self, _records: usize) {}
    fn secondary_purge(&self, _outcome: &'static str) {}
    fn clustered_purge(&self, _removed: bool) {}
    fn extern_freed(&self, _count: usize) {}
    fn rollback_step(&self) {}
    fn delete_retry(&self) {}
}

/// A thread-safe counter-based implementation of [`UndoMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Version walks performed.
    pub version_walks: AtomicU64,
    /// Undo records followed across all walks.
    pub version_steps: AtomicU64,
    /// Walks that ended in missing history.
    pub missing_history: AtomicU64,
    /// Purge batches run.
    pub purge_batches: AtomicU64,
    /// History entries handed to purge.
    pub purge_records: AtomicU64,
    /// Secondary entries removed by purge.
    pub secondary_removed: AtomicU64,
    /// Secondary entries kept because an older version still needs them.
    pub secondary_kept: AtomicU64,
    /// Secondary entries skipped (not found, not delete-marked, vetoed).
    pub secondary_skipped: AtomicU64,
    /// Clustered records removed.
    pub clustered_removed: AtomicU64,
    /// Clustered purge attempts that left the record in place.
    pub clustered_kept: AtomicU64,
    /// External values freed.
    pub extern_freed: AtomicU64,
    /// Undo records applied by rollback.
    pub rollback_steps: AtomicU64,
    /// Pessimistic delete retries.
    pub delete_retries: AtomicU64,
}

impl UndoMetrics for CounterMetrics {
    fn version_walk(&self, steps: usize) {
        self.version_walks.fetch_add(1, Ordering::Relaxed);
        self.version_steps
            .fetch_add(steps as u64, Ordering::Relaxed);
    }

    fn missing_history(&self) {
        self.missing_history.fetch_add(1, Ordering::Relaxed);
    }

    fn purge_batch(&self, records: usize) {
        self.purge_batches.fetch_add(1, Ordering::Relaxed);
        self.purge_records
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    fn secondary_purge(&self, outcome: &'static str) {
        match outcome {
            "removed" => {
                self.secondary_removed.fetch_add(1, Ordering::Relaxed);
            }
            "kept" => {
                self.secondary_kept.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.secondary_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn clustered_purge(&self, removed: bool) {
        if removed {
            self.clustered_removed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.clustered_kept.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn extern_freed(&self, count: usize) {
        self.extern_freed.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn rollback_step(&self) {
        self.rollback_steps.fetch_add(1, Ordering::Relaxed);
    }

    fn delete_retry(&self) {
        self.delete_retries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn UndoMetrics> {
    Arc::new(NoopMetrics)
}
