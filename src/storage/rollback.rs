//! Rollback: reverses a transaction's undo log, newest record first.
//!
//! Secondary entries are always handled before the clustered record. A
//! record whose clustered row no longer carries the undo record's roll
//! pointer was already reversed (or never applied) and is skipped. Failures
//! propagate; the transaction then stays in `RollingBack`.

use std::sync::Arc;

use tracing::{debug, info};

use crate::storage::engine::{index_affected, metadata_key, Checked, Engine};
use crate::storage::index::{ClusteredRec, IndexRecord, LatchMode};
use crate::storage::roll_ptr::RollPtr;
use crate::storage::row::{Datum, ExternRef, Row};
use crate::storage::schema::{IndexDef, IndexKind, TableSchema};
use crate::storage::trx::{Savepoint, Transaction};
use crate::storage::undo::{decode_row, InsertUndo, ModifyUndo, UndoRecord};
use crate::storage::vcol::SchemaContext;
use crate::types::{Result, TableId, TrxId, UndoNo};

impl Engine {
    /// Rolls back the whole transaction and ends it.
    pub fn rollback(&self, trx: &Transaction) -> Result<()> {
        let undone = self.rollback_until(trx, UndoNo(0))?;
        self.trx_sys.finish_rollback(trx);
        info!(trx_id = %trx.id(), undone, "undo.rollback.done");
        Ok(())
    }

    /// Undoes everything written after `savepoint`; the transaction stays active.
    pub fn rollback_to_savepoint(&self, trx: &Transaction, savepoint: Savepoint) -> Result<()> {
        let undone = self.rollback_until(trx, savepoint.undo_no())?;
        self.trx_sys.resume_after_rollback(trx);
        info!(
            trx_id = %trx.id(),
            savepoint = %savepoint.undo_no(),
            undone,
            "undo.rollback.savepoint"
        );
        Ok(())
    }

    fn rollback_until(&self, trx: &Transaction, stop: UndoNo) -> Result<usize> {
        self.trx_sys.begin_rollback(trx)?;
        let mut undone = 0;
        while let Some(last) = trx.with_undo(|log| log.last()) {
            if last.undo_no < stop {
                break;
            }
            let record = self.undo.read(last.roll_ptr)?;
            self.undo_record(trx, &record, last.roll_ptr)?;
            trx.with_undo(|log| self.undo.pop_newest(log));
            self.metrics.rollback_step();
            undone += 1;
        }
        Ok(undone)
    }

    fn undo_record(&self, trx: &Transaction, record: &UndoRecord, ptr: RollPtr) -> Result<()> {
        let table_id = record.header().table_id;
        let Some(table) = self.catalog.table(table_id) else {
            debug!(table = %table_id, "undo.rollback.dropped_table");
            return Ok(());
        };
        let ctx = SchemaContext::new(table, Arc::clone(&self.evaluator));
        debug!(
            trx_id = %trx.id(),
            kind = ?record.kind(),
            undo_no = %record.header().undo_no,
            "undo.rollback.record"
        );
        match record {
            UndoRecord::Insert(ins) => self.undo_insert(trx, &ctx, ins),
            UndoRecord::InsertMetadata(_) => {
                let key = metadata_key(&ctx.table);
                self.remove_own_clustered(trx, &ctx.table, &key, None)
                    .map(|_| ())
            }
            UndoRecord::Empty(_) => self.indexes.truncate(table_id),
            UndoRecord::RenameTable(r) => self.catalog.rename_table(table_id, &r.old_name),
            UndoRecord::UpdateExisting(m) => self.undo_update(trx, &ctx, m, ptr),
            UndoRecord::DeleteMark(m) => self.undo_delete_mark(trx, &ctx, m, ptr),
            UndoRecord::UpdateDeleteMarked(m) => self.undo_update_delete_marked(trx, &ctx, m, ptr),
        }
    }

    fn undo_insert(&self, trx: &Transaction, ctx: &SchemaContext, ins: &InsertUndo) -> Result<()> {
        let table = &ctx.table;
        let row = decode_row(ins, table);
        let key = table.row_ref(&row.cols);
        match self.fetch_clustered(table, &key)? {
            Some(rec) if rec.trx_id == trx.id() => {}
            _ => return Ok(()),
        }
        for index in rolled_back_indexes(table) {
            if let Some(entry) = index.build_entry(table, &row)? {
                self.remove_secondary(table.id, index, &entry)?;
            }
        }
        self.remove_own_clustered(trx, table, &key, None)?;
        Ok(())
    }

    /// Removes the clustered record at `key` if this transaction wrote it
    /// (and, with `ptr`, through that undo record), freeing its external
    /// values.
    fn remove_own_clustered(
        &self,
        trx: &Transaction,
        table: &TableSchema,
        key: &[Datum],
        ptr: Option<RollPtr>,
    ) -> Result<bool> {
        let checked = self.delete_checked(
            table.id,
            table.clustered().id,
            key,
            "rollback.clustered",
            |cursor| {
                Ok(match cursor.record().and_then(IndexRecord::into_clustered) {
                    Some(rec)
                        if rec.trx_id == trx.id() && ptr.map_or(true, |p| p == rec.roll_ptr) =>
                    {
                        Ok(())
                    }
                    _ => Err(()),
                })
            },
        )?;
        match checked {
            Checked::Deleted(rec) => {
                if let Some(rec) = rec.into_clustered() {
                    let refs: Vec<_> = rec.cols.iter().filter_map(Datum::extern_ref).collect();
                    self.free_externs(refs)?;
                }
                Ok(true)
            }
            Checked::Kept(()) => Ok(false),
        }
    }

    /// Deletes a secondary entry; a missing entry is not an error.
    fn remove_secondary(&self, table: TableId, index: &IndexDef, entry: &[Datum]) -> Result<bool> {
        let checked = self.delete_checked(table, index.id, entry, "rollback.secondary", |cursor| {
            Ok(if cursor.is_positioned() { Ok(()) } else { Err(()) })
        })?;
        Ok(matches!(checked, Checked::Deleted(_)))
    }

    /// The live record, provided it still carries `ptr`.
    fn own_record(
        &self,
        table: &TableSchema,
        key: &[Datum],
        ptr: RollPtr,
    ) -> Result<Option<ClusteredRec>> {
        Ok(self
            .fetch_clustered(table, key)?
            .filter(|rec| rec.roll_ptr == ptr))
    }

    /// Live row and the row `m` restores.
    fn rows_of(&self, ctx: &SchemaContext, rec: &ClusteredRec, m: &ModifyUndo) -> Result<(Row, Row)> {
        let current = self.version_builder(ctx).current_version(rec)?;
        let (cols, vcols) = m.apply_to(&ctx.table, &rec.cols, &current.vcols);
        Ok((current.row(), Row { cols, vcols }))
    }

    /// Removes the new entry of an undone change, or delete-marks it when an
    /// older version of `rec` still projects to it.
    fn retire_new_entry(
        &self,
        ctx: &SchemaContext,
        rec: &ClusteredRec,
        index: &IndexDef,
        entry: &[Datum],
    ) -> Result<()> {
        let needed = self
            .version_builder(ctx)
            .old_has_index_entry(false, rec, index, entry, None)?;
        if needed {
            self.mark_secondary(ctx.table.id, index, entry, true)
        } else {
            self.remove_secondary(ctx.table.id, index, entry).map(|_| ())
        }
    }

    fn restore_clustered(
        &self,
        table: &TableSchema,
        key: &[Datum],
        rec: ClusteredRec,
    ) -> Result<()> {
        let mut cursor =
            self.indexes
                .search(table.id, table.clustered().id, key, LatchMode::ModifyLeaf)?;
        cursor.update_clustered(rec)
    }

    fn undo_update(
        &self,
        trx: &Transaction,
        ctx: &SchemaContext,
        m: &ModifyUndo,
        ptr: RollPtr,
    ) -> Result<()> {
        let table = &ctx.table;
        let Some(rec) = self.own_record(table, &m.row_ref, ptr)? else {
            debug!(trx_id = %trx.id(), "undo.rollback.superseded");
            return Ok(());
        };
        let (new_row, old_row) = self.rows_of(ctx, &rec, m)?;
        let touched: Vec<_> = m.update.iter().map(|u| u.field).collect();
        for index in rolled_back_indexes(table)
            .filter(|i| index_affected(table, i, &touched))
        {
            let new_entry = index.build_entry(table, &new_row)?;
            let old_entry = index.build_entry(table, &old_row)?;
            if new_entry == old_entry {
                continue;
            }
            if let Some(new) = &new_entry {
                self.retire_new_entry(ctx, &rec, index, new)?;
            }
            if let Some(old) = &old_entry {
                self.mark_secondary(table.id, index, old, false)?;
            }
        }
        let freed = new_only_externs(&new_row.cols, &old_row.cols);
        let (trx_id, roll_ptr) = self.restored_sys_cols(m);
        self.restore_clustered(
            table,
            &m.row_ref,
            ClusteredRec {
                cols: old_row.cols,
                trx_id,
                roll_ptr,
                delete_marked: m.prior.delete_marked,
            },
        )?;
        self.free_externs(freed)?;
        Ok(())
    }

    fn undo_delete_mark(
        &self,
        trx: &Transaction,
        ctx: &SchemaContext,
        m: &ModifyUndo,
        ptr: RollPtr,
    ) -> Result<()> {
        let table = &ctx.table;
        let Some(rec) = self.own_record(table, &m.row_ref, ptr)? else {
            debug!(trx_id = %trx.id(), "undo.rollback.superseded");
            return Ok(());
        };
        let (_, row) = self.rows_of(ctx, &rec, m)?;
        for index in rolled_back_indexes(table) {
            if let Some(entry) = index.build_entry(table, &row)? {
                self.mark_secondary(table.id, index, &entry, false)?;
            }
        }
        let (trx_id, roll_ptr) = self.restored_sys_cols(m);
        self.restore_clustered(
            table,
            &m.row_ref,
            ClusteredRec {
                cols: row.cols,
                trx_id,
                roll_ptr,
                delete_marked: false,
            },
        )
    }

    /// System columns for a row restored from `m`. A live row whose prior
    /// writer every view already sees gets the reset id, as purge would give it.
    fn restored_sys_cols(&self, m: &ModifyUndo) -> (TrxId, RollPtr) {
        let prior = &m.prior;
        let settled = self.opts.purge.reset_trx_id
            && !prior.delete_marked
            && !prior.trx_id.is_reset()
            && self.trx_sys.purge_view().is_visible(prior.trx_id);
        if settled {
            (TrxId::RESET, RollPtr::insert_sentinel())
        } else {
            (prior.trx_id, prior.roll_ptr)
        }
    }

    fn undo_update_delete_marked(
        &self,
        trx: &Transaction,
        ctx: &SchemaContext,
        m: &ModifyUndo,
        ptr: RollPtr,
    ) -> Result<()> {
        let table = &ctx.table;
        let Some(rec) = self.own_record(table, &m.row_ref, ptr)? else {
            debug!(trx_id = %trx.id(), "undo.rollback.superseded");
            return Ok(());
        };
        let (new_row, old_row) = self.rows_of(ctx, &rec, m)?;
        if self.trx_sys.purge_view().is_visible(m.prior.trx_id) {
            // No view can see past the delete-marked version: drop the row.
            for index in rolled_back_indexes(table) {
                let new_entry = index.build_entry(table, &new_row)?;
                let old_entry = index.build_entry(table, &old_row)?;
                if let Some(new) = &new_entry {
                    self.remove_secondary(table.id, index, new)?;
                }
                if let Some(old) = old_entry.filter(|old| Some(old) != new_entry.as_ref()) {
                    self.remove_secondary(table.id, index, &old)?;
                }
            }
            let old_refs: Vec<ExternRef> =
                old_row.cols.iter().filter_map(Datum::extern_ref).collect();
            self.remove_own_clustered(trx, table, &m.row_ref, Some(ptr))?;
            self.free_externs(old_refs)?;
            debug!(trx_id = %trx.id(), table = %table.id, "undo.rollback.removed_delete_marked");
            return Ok(());
        }
        for index in rolled_back_indexes(table) {
            let new_entry = index.build_entry(table, &new_row)?;
            let old_entry = index.build_entry(table, &old_row)?;
            if new_entry != old_entry {
                if let Some(new) = &new_entry {
                    self.retire_new_entry(ctx, &rec, index, new)?;
                }
            }
            if let Some(old) = &old_entry {
                self.mark_secondary(table.id, index, old, true)?;
            }
        }
        let freed = new_only_externs(&new_row.cols, &old_row.cols);
        self.restore_clustered(
            table,
            &m.row_ref,
            ClusteredRec {
                cols: old_row.cols,
                trx_id: m.prior.trx_id,
                roll_ptr: m.prior.roll_ptr,
                delete_marked: true,
            },
        )?;
        self.free_externs(freed)?;
        Ok(())
    }
}

/// Secondary indexes rollback maintains: every non full-text one, including
/// indexes still being built, since the writer maintained them too.
fn rolled_back_indexes(table: &TableSchema) -> impl Iterator<Item = &IndexDef> {
    table
        .secondaries()
        .filter(|i| i.kind != IndexKind::FullText)
}

fn new_only_externs(new: &[Datum], old: &[Datum]) -> Vec<ExternRef> {
    new.iter()
        .filter_map(Datum::extern_ref)
        .filter(|eref| !old.iter().any(|d| d.extern_ref() == Some(*eref)))
        .collect()
}
