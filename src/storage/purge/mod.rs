//! Purge: reclaims undo history that no read view can reach any more.
//!
//! Committed undo records wait in the [`HistoryQueue`] in commit order. A
//! batch pops the eligible prefix, splits it by table across scoped worker
//! threads and, per record, removes obsolete secondary entries, removes
//! delete-marked clustered records, frees superseded external values and
//! resets the row's system columns. Each record is released from the undo
//! store once handled; until then its purge may be repeated.

mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

pub use worker::PurgeWorker;

use crate::storage::engine::{index_affected, metadata_key, row_ref_of_entry, Checked, Engine};
use crate::storage::index::{ClusteredRec, IndexRecord, LatchMode};
use crate::storage::roll_ptr::RollPtr;
use crate::storage::row::{Datum, ExternRef};
use crate::storage::schema::{FieldRef, IndexDef};
use crate::storage::undo::{decode_partial, decode_row, HistoryEntry, ModifyUndo, UndoRecord};
use crate::storage::vcol::SchemaContext;
use crate::types::{Result, SombraError, TrxId};

/// Outcome of [`Engine::purge_secondary_if_safe`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SecondaryPurge {
    /// The entry was deleted.
    Removed,
    /// No such entry.
    NotFound,
    /// The entry is live; nothing to purge.
    NotDeleteMarked,
    /// A version newer than the purged one still projects to the entry.
    StillNeeded,
    /// The index implementation refused the delete.
    Vetoed,
}

/// Outcome of purging a delete-marked clustered record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClusteredPurge {
    /// The record was deleted.
    Removed,
    /// The record was modified again after the purged delete-mark.
    Superseded,
    /// No such record.
    NotFound,
}

/// Counters for one or more purge batches.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PurgeStats {
    /// History entries handled and released.
    pub records: usize,
    /// Entries skipped without effect (rename, empty, dropped table, already released).
    pub skipped: usize,
    /// Secondary entries deleted.
    pub secondary_removed: usize,
    /// Secondary entries kept because a newer version needs them.
    pub secondary_kept: usize,
    /// Clustered records deleted.
    pub clustered_removed: usize,
    /// External values freed.
    pub externs_freed: usize,
    /// Rows whose transaction id was reset.
    pub trx_ids_reset: usize,
    /// Records whose purge failed and was abandoned.
    pub failed: usize,
}

impl PurgeStats {
    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &PurgeStats) {
        self.records += other.records;
        self.skipped += other.skipped;
        self.secondary_removed += other.secondary_removed;
        self.secondary_kept += other.secondary_kept;
        self.clustered_removed += other.clustered_removed;
        self.externs_freed += other.externs_freed;
        self.trx_ids_reset += other.trx_ids_reset;
        self.failed += other.failed;
    }
}

struct PartOutcome {
    stats: PurgeStats,
    fatal: Option<SombraError>,
    leftover: Vec<HistoryEntry>,
}

impl Engine {
    /// Purges one batch of eligible history. Returns zeroed stats when
    /// nothing is eligible.
    ///
    /// [`SombraError::RetryExhausted`] is fatal: unprocessed entries go back
    /// to the queue front and the error is returned. Any other per-record
    /// failure is logged and the batch goes on. Safe to call while the
    /// background worker runs; batches take turns.
    pub fn purge_batch(&self) -> Result<PurgeStats> {
        self.purge_batch_until(&AtomicBool::new(false))
    }

    /// Purges until no eligible history is left.
    pub fn purge_all(&self) -> Result<PurgeStats> {
        let mut total = PurgeStats::default();
        loop {
            let stats = self.purge_batch()?;
            if stats.records == 0 {
                return Ok(total);
            }
            total.merge(&stats);
        }
    }

    pub(crate) fn purge_batch_until(&self, stop: &AtomicBool) -> Result<PurgeStats> {
        // Batches from the worker and from callers must not overlap, or two
        // of them could purge the same table out of commit order.
        let _batch = self.purge_latch.lock();
        let low_limit_no = self.trx_sys.purge_view().low_limit_no();
        let batch = self
            .history
            .pop_eligible(low_limit_no, self.opts.purge.batch_size);
        if batch.is_empty() {
            return Ok(PurgeStats::default());
        }
        let n_entries = batch.len();
        let parts = partition(batch, self.opts.purge.workers);
        let n_parts = parts.len();
        let outcomes: Vec<PartOutcome> = if n_parts == 1 {
            parts
                .into_iter()
                .map(|part| self.purge_part(part, stop))
                .collect()
        } else {
            thread::scope(|s| {
                let handles: Vec<_> = parts
                    .into_iter()
                    .map(|part| s.spawn(move || self.purge_part(part, stop)))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                    .collect()
            })
        };
        let mut stats = PurgeStats::default();
        let mut leftover = Vec::new();
        let mut fatal = None;
        for outcome in outcomes {
            stats.merge(&outcome.stats);
            leftover.extend(outcome.leftover);
            if fatal.is_none() {
                fatal = outcome.fatal;
            }
        }
        if !leftover.is_empty() {
            leftover.sort_by_key(|e| (e.trx_no, e.undo_no));
            self.history.requeue_front(leftover);
        }
        self.metrics.purge_batch(stats.records);
        info!(
            entries = n_entries,
            purged = stats.records,
            workers = n_parts,
            secondary_removed = stats.secondary_removed,
            clustered_removed = stats.clustered_removed,
            externs_freed = stats.externs_freed,
            failed = stats.failed,
            "undo.purge.batch"
        );
        match fatal {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    fn purge_part(&self, entries: Vec<HistoryEntry>, stop: &AtomicBool) -> PartOutcome {
        let mut stats = PurgeStats::default();
        let mut iter = entries.into_iter();
        while let Some(entry) = iter.next() {
            if stop.load(Ordering::Acquire) {
                let mut leftover = vec![entry];
                leftover.extend(iter);
                debug!(count = leftover.len(), "undo.purge.abandoned");
                return PartOutcome {
                    stats,
                    fatal: None,
                    leftover,
                };
            }
            match self.purge_entry(&entry, &mut stats) {
                Ok(()) => {}
                Err(err @ SombraError::RetryExhausted { .. }) => {
                    error!(
                        trx_no = %entry.trx_no,
                        roll_ptr = %entry.roll_ptr,
                        error = %err,
                        "undo.purge.fatal"
                    );
                    let mut leftover = vec![entry];
                    leftover.extend(iter);
                    return PartOutcome {
                        stats,
                        fatal: Some(err),
                        leftover,
                    };
                }
                Err(err) => {
                    warn!(
                        trx_no = %entry.trx_no,
                        roll_ptr = %entry.roll_ptr,
                        table = %entry.table_id,
                        error = %err,
                        "undo.purge.record_failed"
                    );
                    stats.failed += 1;
                }
            }
            self.undo.release(entry.roll_ptr);
            stats.records += 1;
        }
        PartOutcome {
            stats,
            fatal: None,
            leftover: Vec::new(),
        }
    }

    fn purge_entry(&self, entry: &HistoryEntry, stats: &mut PurgeStats) -> Result<()> {
        let record = match self.undo.read(entry.roll_ptr) {
            Ok(record) => record,
            Err(SombraError::MissingHistory { .. }) => {
                stats.skipped += 1;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let Some(table) = self.catalog.table(entry.table_id) else {
            debug!(table = %entry.table_id, "undo.purge.dropped_table");
            stats.skipped += 1;
            return Ok(());
        };
        let ctx = SchemaContext::new(table, Arc::clone(&self.evaluator));
        debug!(
            kind = ?record.kind(),
            trx_no = %entry.trx_no,
            roll_ptr = %entry.roll_ptr,
            "undo.purge.record"
        );
        match &record {
            UndoRecord::DeleteMark(m) => self.purge_delete_mark(&ctx, m, entry.roll_ptr, stats),
            UndoRecord::UpdateExisting(m) => {
                if !m.no_ord_change {
                    self.purge_old_entries(&ctx, m, entry.roll_ptr, stats)?;
                }
                if m.updated_extern {
                    self.purge_old_externs(&ctx, m, stats)?;
                }
                self.reset_trx_id(&ctx, &m.row_ref, entry.roll_ptr, stats)
            }
            UndoRecord::UpdateDeleteMarked(m) => {
                if m.updated_extern {
                    self.purge_old_externs(&ctx, m, stats)?;
                }
                self.reset_trx_id(&ctx, &m.row_ref, entry.roll_ptr, stats)
            }
            UndoRecord::Insert(ins) => {
                let row = decode_row(ins, &ctx.table);
                let key = ctx.table.row_ref(&row.cols);
                self.reset_trx_id(&ctx, &key, entry.roll_ptr, stats)
            }
            UndoRecord::InsertMetadata(_) => {
                let key = metadata_key(&ctx.table);
                self.reset_trx_id(&ctx, &key, entry.roll_ptr, stats)
            }
            UndoRecord::RenameTable(_) | UndoRecord::Empty(_) => {
                stats.skipped += 1;
                Ok(())
            }
        }
    }

    fn purge_delete_mark(
        &self,
        ctx: &SchemaContext,
        m: &ModifyUndo,
        ptr: RollPtr,
        stats: &mut PurgeStats,
    ) -> Result<()> {
        let table = &ctx.table;
        let old_row = decode_partial(m, table)?;
        for index in table.secondaries().filter(|i| i.is_maintained()) {
            let Some(entry) = index.build_entry(table, &old_row)? else {
                self.metrics.secondary_purge("skipped");
                continue;
            };
            self.count_secondary(self.purge_secondary_if_safe(ctx, index, &entry, ptr)?, stats);
        }
        let outcome = self.delete_checked(
            table.id,
            table.clustered().id,
            &m.row_ref,
            "purge.clustered",
            |cursor| {
                Ok(match cursor.record().and_then(IndexRecord::into_clustered) {
                    None => Err(ClusteredPurge::NotFound),
                    Some(rec) if rec.roll_ptr != ptr || !rec.delete_marked => {
                        Err(ClusteredPurge::Superseded)
                    }
                    Some(_) => Ok(()),
                })
            },
        )?;
        let outcome = match outcome {
            Checked::Deleted(rec) => {
                if let Some(rec) = rec.into_clustered() {
                    let refs: Vec<_> = rec.cols.iter().filter_map(Datum::extern_ref).collect();
                    stats.externs_freed += self.free_externs(refs)?;
                }
                ClusteredPurge::Removed
            }
            Checked::Kept(outcome) => outcome,
        };
        self.metrics.clustered_purge(outcome == ClusteredPurge::Removed);
        if outcome == ClusteredPurge::Removed {
            stats.clustered_removed += 1;
        }
        debug!(table = %table.id, outcome = ?outcome, "undo.purge.clustered");
        Ok(())
    }

    /// Old secondary entries of an update that changed ordering fields.
    fn purge_old_entries(
        &self,
        ctx: &SchemaContext,
        m: &ModifyUndo,
        ptr: RollPtr,
        stats: &mut PurgeStats,
    ) -> Result<()> {
        let table = &ctx.table;
        let old_row = decode_partial(m, table)?;
        let fields: Vec<FieldRef> = m.update.iter().map(|u| u.field).collect();
        for index in table
            .secondaries()
            .filter(|i| i.is_maintained() && index_affected(table, i, &fields))
        {
            let Some(entry) = index.build_entry(table, &old_row)? else {
                self.metrics.secondary_purge("skipped");
                continue;
            };
            self.count_secondary(self.purge_secondary_if_safe(ctx, index, &entry, ptr)?, stats);
        }
        Ok(())
    }

    /// Frees the external values an update replaced, unless the live record
    /// still references them.
    fn purge_old_externs(
        &self,
        ctx: &SchemaContext,
        m: &ModifyUndo,
        stats: &mut PurgeStats,
    ) -> Result<()> {
        let live = self.fetch_clustered(&ctx.table, &m.row_ref)?;
        let still_used = |eref: ExternRef| {
            live.as_ref()
                .map(|rec| rec.cols.iter().any(|d| d.extern_ref() == Some(eref)))
                .unwrap_or(false)
        };
        let refs: Vec<_> = m
            .update
            .iter()
            .filter(|u| matches!(u.field, FieldRef::Stored(_)))
            .filter_map(|u| u.old.extern_ref())
            .filter(|eref| !still_used(*eref))
            .collect();
        stats.externs_freed += self.free_externs(refs)?;
        Ok(())
    }

    /// Marks the row as older than every view once its newest undo record is
    /// purged, so later walks stop at the live record.
    fn reset_trx_id(
        &self,
        ctx: &SchemaContext,
        key: &[Datum],
        ptr: RollPtr,
        stats: &mut PurgeStats,
    ) -> Result<()> {
        if !self.opts.purge.reset_trx_id {
            return Ok(());
        }
        let table = &ctx.table;
        let mut cursor =
            self.indexes
                .search(table.id, table.clustered().id, key, LatchMode::ModifyLeaf)?;
        let Some(rec) = cursor.record().and_then(IndexRecord::into_clustered) else {
            return Ok(());
        };
        if rec.roll_ptr != ptr || rec.delete_marked {
            return Ok(());
        }
        cursor.update_clustered(ClusteredRec {
            trx_id: TrxId::RESET,
            roll_ptr: RollPtr::insert_sentinel(),
            ..rec
        })?;
        stats.trx_ids_reset += 1;
        Ok(())
    }

    /// Deletes the delete-marked secondary `entry` of `index` unless a row
    /// version newer than the one undo record `limit` rebuilds still
    /// projects to it.
    ///
    /// Checks run in order: the entry exists, the index does not veto the
    /// delete, no needed version matches, the entry is delete-marked.
    pub fn purge_secondary_if_safe(
        &self,
        ctx: &SchemaContext,
        index: &IndexDef,
        entry: &[Datum],
        limit: RollPtr,
    ) -> Result<SecondaryPurge> {
        let table = &ctx.table;
        let key = row_ref_of_entry(table, index, entry);
        let builder = self.version_builder(ctx);
        let checked = self.delete_checked(table.id, index.id, entry, "purge.secondary", |cursor| {
            let Some(rec) = cursor.record() else {
                return Ok(Err(SecondaryPurge::NotFound));
            };
            if cursor.purge_veto() {
                return Ok(Err(SecondaryPurge::Vetoed));
            }
            if let Some(clust) = self.fetch_clustered(table, &key)? {
                if builder.old_has_index_entry(true, &clust, index, entry, Some(limit))? {
                    return Ok(Err(SecondaryPurge::StillNeeded));
                }
            }
            if !rec.is_delete_marked() {
                error!(
                    table = %table.id,
                    index = %index.id,
                    "undo.purge.secondary_not_delete_marked"
                );
                return Ok(Err(SecondaryPurge::NotDeleteMarked));
            }
            Ok(Ok(()))
        })?;
        let outcome = match checked {
            Checked::Deleted(_) => SecondaryPurge::Removed,
            Checked::Kept(outcome) => outcome,
        };
        debug!(table = %table.id, index = %index.id, outcome = ?outcome, "undo.purge.secondary");
        Ok(outcome)
    }

    fn count_secondary(&self, outcome: SecondaryPurge, stats: &mut PurgeStats) {
        let label = match outcome {
            SecondaryPurge::Removed => {
                stats.secondary_removed += 1;
                "removed"
            }
            SecondaryPurge::StillNeeded => {
                stats.secondary_kept += 1;
                "kept"
            }
            SecondaryPurge::NotFound
            | SecondaryPurge::NotDeleteMarked
            | SecondaryPurge::Vetoed => "skipped",
        };
        self.metrics.secondary_purge(label);
    }
}

/// Groups entries by table, keeping queue order inside a table, and spreads
/// the groups over at most `workers` parts.
fn partition(batch: Vec<HistoryEntry>, workers: usize) -> Vec<Vec<HistoryEntry>> {
    let mut by_table: FxHashMap<_, usize> = FxHashMap::default();
    let mut groups: Vec<Vec<HistoryEntry>> = Vec::new();
    for entry in batch {
        let slot = *by_table.entry(entry.table_id).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(entry);
    }
    let n_parts = workers.max(1).min(groups.len());
    let mut parts: Vec<Vec<HistoryEntry>> = vec![Vec::new(); n_parts];
    for (i, group) in groups.into_iter().enumerate() {
        parts[i % n_parts].extend(group);
    }
    parts
}
