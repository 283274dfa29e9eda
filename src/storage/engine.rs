//! Engine facade: wires the undo store, transaction system, history queue and
//! the external collaborators together, and exposes the read paths.
//!
//! Write, purge and rollback operations live in `dml`, `purge` and `rollback`
//! as further `impl Engine` blocks.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::primitives::retry::RetryPolicy;
use crate::storage::extern_store::{ExternalStorage, MemExternStore};
use crate::storage::index::{
    ClusteredRec, DeleteOutcome, IndexCursor, IndexRecord, IndexStore, LatchMode, MemIndexStore,
};
use crate::storage::metrics::{default_metrics, UndoMetrics};
use crate::storage::options::EngineOptions;
use crate::storage::purge::PurgeWorker;
use crate::storage::row::{Datum, Row};
use crate::storage::schema::{FieldRef, IndexDef, MemCatalog, TableCatalog, TableSchema};
use crate::storage::trx::{
    ActiveTransactionRef, ReadView, Transaction, TransactionRegistry, TrxSys, TrxSysSnapshot,
};
use crate::storage::undo::{HistoryQueue, UndoStore, UndoStoreMetricsSnapshot};
use crate::storage::vcol::{NoVirtualColumns, SchemaContext, VirtualColumnEvaluator};
use crate::storage::version::{Version, VersionBuilder};
use crate::types::{IndexId, Result, SombraError, TableId, TrxNo};

/// External collaborators an [`Engine`] runs against.
#[derive(Clone)]
pub struct Collaborators {
    /// Index trees.
    pub indexes: Arc<dyn IndexStore>,
    /// Table definitions.
    pub catalog: Arc<dyn TableCatalog>,
    /// Large column storage.
    pub externs: Arc<dyn ExternalStorage>,
    /// Virtual column expressions.
    pub evaluator: Arc<dyn VirtualColumnEvaluator>,
}

impl Collaborators {
    /// Bundles collaborators; tables have no virtual column expressions until
    /// [`Collaborators::evaluator`] supplies them.
    pub fn new(
        indexes: Arc<dyn IndexStore>,
        catalog: Arc<dyn TableCatalog>,
        externs: Arc<dyn ExternalStorage>,
    ) -> Self {
        Self {
            indexes,
            catalog,
            externs,
            evaluator: Arc::new(NoVirtualColumns),
        }
    }

    /// Sets the virtual column evaluator.
    pub fn evaluator(mut self, evaluator: Arc<dyn VirtualColumnEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }
}

/// In-memory collaborators with their concrete types, for callers that need
/// to inspect or steer them.
#[derive(Clone, Default)]
pub struct MemParts {
    /// Index trees.
    pub indexes: Arc<MemIndexStore>,
    /// Table definitions.
    pub catalog: Arc<MemCatalog>,
    /// Large column storage.
    pub externs: Arc<MemExternStore>,
}

impl MemParts {
    /// Creates empty in-memory collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Type-erased handles for [`Engine::open`].
    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            Arc::clone(&self.indexes) as Arc<dyn IndexStore>,
            Arc::clone(&self.catalog) as Arc<dyn TableCatalog>,
            Arc::clone(&self.externs) as Arc<dyn ExternalStorage>,
        )
    }
}

/// Diagnostics snapshot of an engine.
#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    /// Transaction system state.
    pub trx: TrxSysSnapshot,
    /// Undo store counters.
    pub undo: UndoStoreMetricsSnapshot,
    /// Entries waiting in the history queue.
    pub history_len: usize,
}

/// Row-version engine.
pub struct Engine {
    pub(crate) opts: EngineOptions,
    pub(crate) undo: Arc<UndoStore>,
    pub(crate) history: Arc<HistoryQueue>,
    pub(crate) trx_sys: TrxSys,
    pub(crate) indexes: Arc<dyn IndexStore>,
    pub(crate) catalog: Arc<dyn TableCatalog>,
    pub(crate) externs: Arc<dyn ExternalStorage>,
    pub(crate) evaluator: Arc<dyn VirtualColumnEvaluator>,
    pub(crate) metrics: Arc<dyn UndoMetrics>,
    pub(crate) retry: RetryPolicy,
    /// Held for a whole purge batch; one batch runs at a time.
    pub(crate) purge_latch: Mutex<()>,
    purge_worker: Mutex<Option<PurgeWorker>>,
}

/// Outcome of [`Engine::delete_checked`].
pub(crate) enum Checked<T> {
    Deleted(IndexRecord),
    Kept(T),
}

impl Engine {
    /// Opens an engine over `parts`. Starts the background purge worker when
    /// `opts.purge.background` is set.
    pub fn open(opts: EngineOptions, parts: Collaborators) -> Result<Arc<Self>> {
        opts.validate()?;
        let undo = Arc::new(UndoStore::new(opts.undo_page_size)?);
        let history = Arc::new(HistoryQueue::new());
        let trx_sys = TrxSys::new(Arc::clone(&undo), Arc::clone(&history));
        let metrics = opts.metrics.clone().unwrap_or_else(default_metrics);
        let engine = Arc::new(Self {
            retry: opts.retry.policy(),
            opts,
            undo,
            history,
            trx_sys,
            indexes: parts.indexes,
            catalog: parts.catalog,
            externs: parts.externs,
            evaluator: parts.evaluator,
            metrics,
            purge_latch: Mutex::new(()),
            purge_worker: Mutex::new(None),
        });
        if engine.opts.purge.background {
            engine.start_purge_worker();
        }
        info!(
            undo_page_size = engine.opts.undo_page_size,
            purge_workers = engine.opts.purge.workers,
            background_purge = engine.opts.purge.background,
            "undo.engine.open"
        );
        Ok(engine)
    }

    /// Opens an engine over fresh in-memory collaborators.
    pub fn open_in_memory(opts: EngineOptions) -> Result<(Arc<Self>, MemParts)> {
        let parts = MemParts::new();
        let engine = Self::open(opts, parts.collaborators())?;
        Ok((engine, parts))
    }

    /// Starts the background purge worker if it is not running.
    pub fn start_purge_worker(self: &Arc<Self>) {
        let mut slot = self.purge_worker.lock();
        if slot.is_none() {
            *slot = Some(PurgeWorker::spawn(self, self.opts.purge.idle_wait()));
        }
    }

    /// Stops the background purge worker and waits for it to exit.
    pub fn shutdown(&self) {
        let worker = self.purge_worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        debug!("undo.engine.shutdown");
    }

    /// Options the engine runs with.
    pub fn options(&self) -> &EngineOptions {
        &self.opts
    }

    /// The undo record arena.
    pub fn undo_store(&self) -> &UndoStore {
        &self.undo
    }

    /// The purge history queue.
    pub fn history(&self) -> &HistoryQueue {
        &self.history
    }

    /// The transaction system.
    pub fn trx_sys(&self) -> &TrxSys {
        &self.trx_sys
    }

    /// The registry of active transactions.
    pub fn registry(&self) -> &dyn TransactionRegistry {
        &self.trx_sys
    }

    /// Diagnostics snapshot.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            trx: self.trx_sys.snapshot(),
            undo: self.undo.metrics(),
            history_len: self.history.len(),
        }
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        self.trx_sys.begin()
    }

    /// Commits a transaction and hands its undo records to purge.
    pub fn commit(&self, trx: &Transaction) -> Result<TrxNo> {
        self.trx_sys.commit(trx)
    }

    /// Takes a standalone snapshot; release it with [`Engine::close_view`].
    pub fn open_view(&self) -> Arc<ReadView> {
        self.trx_sys.open_view()
    }

    /// Releases a standalone snapshot.
    pub fn close_view(&self, view: &ReadView) {
        self.trx_sys.close_view(view)
    }

    /// The transaction's snapshot, taken on first use.
    pub fn read_view(&self, trx: &Transaction) -> Arc<ReadView> {
        self.trx_sys.assign_read_view(trx)
    }

    /// Table definition and evaluator for `table`.
    pub fn schema(&self, table: TableId) -> Result<SchemaContext> {
        let schema = self.catalog.table(table).ok_or(SombraError::NotFound)?;
        Ok(SchemaContext::new(schema, Arc::clone(&self.evaluator)))
    }

    /// A version builder for `ctx` reading this engine's undo store.
    pub fn version_builder<'a>(&'a self, ctx: &'a SchemaContext) -> VersionBuilder<'a> {
        VersionBuilder::new(ctx, &self.undo, &self.trx_sys)
            .with_metrics(self.metrics.as_ref())
            .max_steps(self.opts.max_version_steps)
    }

    /// The live clustered record with row reference `key`, delete-marked or not.
    pub fn clustered_record(&self, table: TableId, key: &[Datum]) -> Result<Option<ClusteredRec>> {
        let ctx = self.schema(table)?;
        self.fetch_clustered(&ctx.table, key)
    }

    pub(crate) fn fetch_clustered(
        &self,
        table: &TableSchema,
        key: &[Datum],
    ) -> Result<Option<ClusteredRec>> {
        let cursor =
            self.indexes
                .search(table.id, table.clustered().id, key, LatchMode::SearchLeaf)?;
        Ok(cursor.record().and_then(IndexRecord::into_clustered))
    }

    /// Consistent read of the row with row reference `key` under `view`.
    pub fn consistent_read(
        &self,
        table: TableId,
        key: &[Datum],
        view: &ReadView,
    ) -> Result<Option<Row>> {
        Ok(self
            .consistent_read_version(table, key, view)?
            .filter(|v| !v.rec.delete_marked)
            .map(Version::into_row))
    }

    /// Like [`Engine::consistent_read`] but returns the version with its
    /// system columns and delete mark.
    pub fn consistent_read_version(
        &self,
        table: TableId,
        key: &[Datum],
        view: &ReadView,
    ) -> Result<Option<Version>> {
        let ctx = self.schema(table)?;
        let index = ctx.table.clustered();
        let cursor = self
            .indexes
            .search(table, index.id, key, LatchMode::SearchLeaf)?;
        let Some(rec) = cursor.record().and_then(IndexRecord::into_clustered) else {
            return Ok(None);
        };
        self.version_builder(&ctx)
            .build_visible_record(&rec, index, view)
    }

    /// Semi-consistent read: the last committed state of the row.
    pub fn semi_consistent_read(&self, table: TableId, key: &[Datum]) -> Result<Option<Row>> {
        let ctx = self.schema(table)?;
        let index = ctx.table.clustered();
        let cursor = self
            .indexes
            .search(table, index.id, key, LatchMode::SearchLeaf)?;
        let Some(rec) = cursor.record().and_then(IndexRecord::into_clustered) else {
            return Ok(None);
        };
        self.version_builder(&ctx)
            .build_latest_committed_version(&rec, index)
    }

    /// The active transaction implicitly holding an exclusive lock on the
    /// secondary entry `entry` of `index`, if any.
    pub fn implicit_lock_holder(
        &self,
        table: TableId,
        index: IndexId,
        entry: &[Datum],
    ) -> Result<Option<ActiveTransactionRef>> {
        let ctx = self.schema(table)?;
        let def = ctx.table.index(index).ok_or(SombraError::NotFound)?;
        if def.is_clustered() {
            return Err(SombraError::Invalid("implicit lock check needs a secondary index"));
        }
        let sec = {
            let cursor = self
                .indexes
                .search(table, index, entry, LatchMode::SearchLeaf)?;
            match cursor.record().and_then(IndexRecord::into_secondary) {
                Some(sec) => sec,
                None => return Ok(None),
            }
        };
        let key = row_ref_of_entry(&ctx.table, def, &sec.fields);
        let Some(rec) = self.fetch_clustered(&ctx.table, &key)? else {
            return Ok(None);
        };
        self.version_builder(&ctx)
            .find_implicit_lock_holder(&rec, def, &sec)
    }

    /// Deletes the record at `key` when `check` accepts the positioned cursor:
    /// page-local first, then with a tree latch under the retry policy. `check`
    /// runs with the index latched and must not touch the same index.
    pub(crate) fn delete_checked<T>(
        &self,
        table: TableId,
        index: IndexId,
        key: &[Datum],
        what: &'static str,
        mut check: impl FnMut(&dyn IndexCursor) -> Result<std::result::Result<(), T>>,
    ) -> Result<Checked<T>> {
        {
            let mut cursor = self
                .indexes
                .search(table, index, key, LatchMode::ModifyLeaf)?;
            if let Err(kept) = check(&*cursor)? {
                return Ok(Checked::Kept(kept));
            }
            let rec = cursor
                .record()
                .ok_or(SombraError::Invalid("delete check accepted a missing record"))?;
            if cursor.delete_at(true)? == DeleteOutcome::Deleted {
                return Ok(Checked::Deleted(rec));
            }
        }
        self.retry.run(what, |attempt| {
            if attempt > 1 {
                self.metrics.delete_retry();
            }
            let mut cursor = self
                .indexes
                .search(table, index, key, LatchMode::ModifyTree)?;
            if let Err(kept) = check(&*cursor)? {
                return Ok(Checked::Kept(kept));
            }
            let rec = cursor
                .record()
                .ok_or(SombraError::Invalid("delete check accepted a missing record"))?;
            match cursor.delete_at(false)? {
                DeleteOutcome::Deleted => Ok(Checked::Deleted(rec)),
                DeleteOutcome::NeedsRestructure => {
                    Err(SombraError::Corruption("tree delete asked for restructure"))
                }
            }
        })
    }

    /// Sets the delete mark of a secondary entry, inserting the entry when it
    /// is absent and `marked` is false.
    pub(crate) fn mark_secondary(
        &self,
        table: TableId,
        index: &IndexDef,
        entry: &[Datum],
        marked: bool,
    ) -> Result<()> {
        let mut cursor = self
            .indexes
            .search(table, index.id, entry, LatchMode::ModifyLeaf)?;
        if cursor.is_positioned() {
            cursor.set_delete_mark(marked)
        } else if !marked {
            cursor.insert(IndexRecord::Secondary(crate::storage::index::SecondaryRec {
                fields: entry.to_vec(),
                delete_marked: false,
            }))
        } else {
            Ok(())
        }
    }

    /// Frees external values of `refs` that are still allocated.
    pub(crate) fn free_externs(
        &self,
        refs: impl IntoIterator<Item = crate::storage::row::ExternRef>,
    ) -> Result<usize> {
        let mut freed = 0;
        for eref in refs {
            if self.externs.is_live(eref) && self.externs.free(eref)? {
                freed += 1;
            }
        }
        if freed > 0 {
            self.metrics.extern_freed(freed);
        }
        Ok(freed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(worker) = self.purge_worker.get_mut().take() {
            worker.signal_stop();
        }
    }
}

/// Extracts the row reference from a secondary entry's clustered key suffix.
pub(crate) fn row_ref_of_entry(table: &TableSchema, index: &IndexDef, entry: &[Datum]) -> Vec<Datum> {
    table
        .clustered()
        .fields()
        .iter()
        .map(|pk| {
            index
                .fields()
                .iter()
                .position(|f| f.field == pk.field)
                .and_then(|pos| entry.get(pos))
                .cloned()
                .unwrap_or(Datum::Missing)
        })
        .collect()
}

/// Key of the hidden metadata record: sorts after every user row.
pub(crate) fn metadata_key(table: &TableSchema) -> Vec<Datum> {
    vec![Datum::Missing; table.clustered().fields().len()]
}

/// Returns `true` when the update touches a field `index` reads, directly or
/// through a virtual column.
pub(crate) fn index_affected<'a>(
    table: &TableSchema,
    index: &IndexDef,
    fields: impl IntoIterator<Item = &'a FieldRef>,
) -> bool {
    fields.into_iter().any(|field| {
        index.reads(*field)
            || match field {
                FieldRef::Stored(col) => table
                    .dependent_vcols(*col)
                    .any(|v| index.reads(FieldRef::Virtual(v))),
                FieldRef::Virtual(_) => false,
            }
    })
}
