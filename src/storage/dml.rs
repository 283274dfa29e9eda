//! Row writer: the write path that produces undo records.
//!
//! Every modification appends its undo record before touching the clustered
//! record, then maintains secondary entries the way purge and rollback expect:
//! an ordering change delete-marks the old entry and inserts (or unmarks) the
//! new one. Row locks are out of scope; writing a row whose last writer is
//! still active fails instead of waiting.

use bytes::Bytes;
use smallvec::SmallVec;
use tracing::debug;

use crate::storage::engine::{index_affected, metadata_key, Engine};
use crate::storage::index::{ClusteredRec, IndexRecord, LatchMode};
use crate::storage::roll_ptr::RollPtr;
use crate::storage::row::{Datum, ExternField, ExternRef, Row};
use crate::storage::schema::{FieldRef, IndexKind, TableSchema};
use crate::storage::trx::{Transaction, TransactionRegistry, TrxState};
use crate::storage::undo::{
    InsertUndo, ModifyUndo, PriorSys, RenameUndo, TableUndo, UndoHeader, UndoRecord, UpdateField,
    UpdateVector,
};
use crate::types::{Result, SombraError, TableId};

impl Engine {
    fn write_undo(
        &self,
        trx: &Transaction,
        table: TableId,
        build: impl FnOnce(UndoHeader) -> UndoRecord,
    ) -> Result<RollPtr> {
        trx.with_undo(|log| {
            let header = UndoHeader {
                undo_no: log.next_undo_no(),
                table_id: table,
                trx_id: trx.id(),
            };
            self.undo.append(log, &build(header))
        })
    }

    fn check_writable(&self, trx: &Transaction, rec: &ClusteredRec) -> Result<()> {
        if rec.trx_id != trx.id() && self.trx_sys.is_active(rec.trx_id) {
            return Err(SombraError::Invalid("row locked by an active transaction"));
        }
        Ok(())
    }

    /// Moves long values of columns `cols` to external storage.
    fn externalize(
        &self,
        table: &TableSchema,
        row: &mut [Datum],
        cols: impl IntoIterator<Item = usize>,
    ) -> Result<()> {
        let pk = table.clustered();
        for i in cols {
            if pk.reads(FieldRef::Stored(i as u16)) {
                continue;
            }
            let Some(value) = row.get_mut(i) else {
                continue;
            };
            let bytes: &[u8] = match value {
                Datum::Text(s) => s.as_bytes(),
                Datum::Bytes(b) => &b[..],
                _ => continue,
            };
            if bytes.len() <= self.opts.extern_threshold {
                continue;
            }
            let eref = self.externs.store(bytes)?;
            let prefix = bytes[..self.opts.extern_prefix_len.min(bytes.len())].to_vec();
            *value = Datum::Extern(ExternField { prefix, eref });
        }
        Ok(())
    }

    /// Reads an externally stored value.
    pub fn read_extern(&self, eref: ExternRef) -> Result<Bytes> {
        self.externs.read(eref)
    }

    /// Inserts a row. Inserting over a delete-marked row with the same
    /// primary key reuses that record.
    pub fn insert(&self, trx: &Transaction, table: TableId, cols: Vec<Datum>) -> Result<()> {
        trx.ensure_state(TrxState::Active)?;
        let ctx = self.schema(table)?;
        let schema = &ctx.table;
        if cols.len() != schema.n_cols() || cols.iter().any(Datum::is_missing) {
            return Err(SombraError::Invalid("row does not match the table columns"));
        }
        let mut cols = cols;
        let n = cols.len();
        self.externalize(schema, &mut cols, 0..n)?;
        let new_row = ctx.materialize(&Row::new(cols.clone()))?;
        let key = schema.row_ref(&cols);
        {
            let mut cursor =
                self.indexes
                    .search(table, schema.clustered().id, &key, LatchMode::ModifyLeaf)?;
            match cursor.record().and_then(IndexRecord::into_clustered) {
                Some(existing) if !existing.delete_marked => {
                    return Err(SombraError::Invalid("duplicate primary key"));
                }
                Some(existing) => {
                    self.check_writable(trx, &existing)?;
                    let old_row = ctx.materialize(&Row::new(existing.cols.clone()))?;
                    let update = diff(schema, &old_row, &new_row);
                    let no_ord_change = !changes_ordering(schema, &update);
                    let updated_extern = update.iter().any(|u| u.old.extern_ref().is_some());
                    let prior = PriorSys {
                        trx_id: existing.trx_id,
                        roll_ptr: existing.roll_ptr,
                        delete_marked: true,
                    };
                    let partial = Some(partial_image(schema, &old_row));
                    let row_ref = key.clone();
                    let ptr = self.write_undo(trx, table, |header| {
                        UndoRecord::UpdateDeleteMarked(ModifyUndo {
                            header,
                            prior,
                            no_ord_change,
                            updated_extern,
                            row_ref,
                            update,
                            partial,
                        })
                    })?;
                    cursor.update_clustered(ClusteredRec {
                        cols,
                        trx_id: trx.id(),
                        roll_ptr: ptr,
                        delete_marked: false,
                    })?;
                }
                None => {
                    let fields = insert_image(schema, &new_row);
                    let ptr = self.write_undo(trx, table, |header| {
                        UndoRecord::Insert(InsertUndo { header, fields })
                    })?;
                    cursor.insert(IndexRecord::Clustered(ClusteredRec {
                        cols,
                        trx_id: trx.id(),
                        roll_ptr: ptr,
                        delete_marked: false,
                    }))?;
                }
            }
        }
        for index in schema.secondaries().filter(|i| i.kind != IndexKind::FullText) {
            if let Some(entry) = index.build_entry(schema, &new_row)? {
                self.mark_secondary(table, index, &entry, false)?;
            }
        }
        debug!(trx_id = %trx.id(), table = %table, "undo.dml.insert");
        Ok(())
    }

    /// Updates non-key columns of the row with row reference `key`. Returns
    /// `false` when no value changed.
    pub fn update(
        &self,
        trx: &Transaction,
        table: TableId,
        key: &[Datum],
        changes: &[(u16, Datum)],
    ) -> Result<bool> {
        trx.ensure_state(TrxState::Active)?;
        let ctx = self.schema(table)?;
        let schema = &ctx.table;
        for (col, value) in changes {
            if usize::from(*col) >= schema.n_cols() || value.is_missing() {
                return Err(SombraError::Invalid("update column out of range"));
            }
            if schema.clustered().reads(FieldRef::Stored(*col)) {
                return Err(SombraError::Invalid("primary key columns cannot be updated"));
            }
        }
        let (old_row, new_row, update) = {
            let mut cursor =
                self.indexes
                    .search(table, schema.clustered().id, key, LatchMode::ModifyLeaf)?;
            let rec = match cursor.record().and_then(IndexRecord::into_clustered) {
                Some(rec) if !rec.delete_marked => rec,
                _ => return Err(SombraError::NotFound),
            };
            self.check_writable(trx, &rec)?;
            let mut cols = rec.cols.clone();
            let mut touched = Vec::new();
            for (col, value) in changes {
                let i = usize::from(*col);
                if cols[i] != *value {
                    cols[i] = value.clone();
                    touched.push(i);
                }
            }
            if touched.is_empty() {
                return Ok(false);
            }
            self.externalize(schema, &mut cols, touched)?;
            let old_row = ctx.materialize(&Row::new(rec.cols.clone()))?;
            let new_row = ctx.materialize(&Row::new(cols.clone()))?;
            let update = diff(schema, &old_row, &new_row);
            let no_ord_change = !changes_ordering(schema, &update);
            let updated_extern = update
                .iter()
                .any(|u| matches!(u.field, FieldRef::Stored(_)) && u.old.extern_ref().is_some());
            let partial = (!no_ord_change).then(|| partial_image(schema, &old_row));
            let prior = PriorSys {
                trx_id: rec.trx_id,
                roll_ptr: rec.roll_ptr,
                delete_marked: false,
            };
            let logged = update.clone();
            let ptr = self.write_undo(trx, table, |header| {
                UndoRecord::UpdateExisting(ModifyUndo {
                    header,
                    prior,
                    no_ord_change,
                    updated_extern,
                    row_ref: key.to_vec(),
                    update: logged,
                    partial,
                })
            })?;
            cursor.update_clustered(ClusteredRec {
                cols,
                trx_id: trx.id(),
                roll_ptr: ptr,
                delete_marked: false,
            })?;
            (old_row, new_row, update)
        };
        let touched: Vec<FieldRef> = update.iter().map(|u| u.field).collect();
        for index in schema
            .secondaries()
            .filter(|i| i.kind != IndexKind::FullText && index_affected(schema, i, &touched))
        {
            let old_entry = index.build_entry(schema, &old_row)?;
            let new_entry = index.build_entry(schema, &new_row)?;
            if old_entry == new_entry {
                continue;
            }
            if let Some(old) = old_entry {
                self.mark_secondary(table, index, &old, true)?;
            }
            if let Some(new) = new_entry {
                self.mark_secondary(table, index, &new, false)?;
            }
        }
        debug!(trx_id = %trx.id(), table = %table, fields = touched.len(), "undo.dml.update");
        Ok(true)
    }

    /// Delete-marks the row with row reference `key`; purge removes it later.
    pub fn delete(&self, trx: &Transaction, table: TableId, key: &[Datum]) -> Result<()> {
        trx.ensure_state(TrxState::Active)?;
        let ctx = self.schema(table)?;
        let schema = &ctx.table;
        let old_row = {
            let mut cursor =
                self.indexes
                    .search(table, schema.clustered().id, key, LatchMode::ModifyLeaf)?;
            let rec = match cursor.record().and_then(IndexRecord::into_clustered) {
                Some(rec) if !rec.delete_marked => rec,
                _ => return Err(SombraError::NotFound),
            };
            self.check_writable(trx, &rec)?;
            let old_row = ctx.materialize(&Row::new(rec.cols.clone()))?;
            let prior = PriorSys {
                trx_id: rec.trx_id,
                roll_ptr: rec.roll_ptr,
                delete_marked: false,
            };
            let partial = Some(partial_image(schema, &old_row));
            let ptr = self.write_undo(trx, table, |header| {
                UndoRecord::DeleteMark(ModifyUndo {
                    header,
                    prior,
                    no_ord_change: true,
                    updated_extern: false,
                    row_ref: key.to_vec(),
                    update: UpdateVector::new(),
                    partial,
                })
            })?;
            cursor.update_clustered(ClusteredRec {
                cols: rec.cols,
                trx_id: trx.id(),
                roll_ptr: ptr,
                delete_marked: true,
            })?;
            old_row
        };
        for index in schema.secondaries().filter(|i| i.kind != IndexKind::FullText) {
            if let Some(entry) = index.build_entry(schema, &old_row)? {
                self.mark_secondary(table, index, &entry, true)?;
            }
        }
        debug!(trx_id = %trx.id(), table = %table, "undo.dml.delete_mark");
        Ok(())
    }

    /// Inserts the hidden metadata record written when columns are added
    /// instantly. It sorts after every user row.
    pub fn insert_metadata(&self, trx: &Transaction, table: TableId) -> Result<()> {
        trx.ensure_state(TrxState::Active)?;
        let ctx = self.schema(table)?;
        let schema = &ctx.table;
        let key = metadata_key(schema);
        let mut cursor =
            self.indexes
                .search(table, schema.clustered().id, &key, LatchMode::ModifyLeaf)?;
        if cursor.is_positioned() {
            return Err(SombraError::Invalid("metadata record already present"));
        }
        let ptr = self.write_undo(trx, table, |header| {
            UndoRecord::InsertMetadata(TableUndo { header })
        })?;
        cursor.insert(IndexRecord::Clustered(ClusteredRec {
            cols: vec![Datum::Null; schema.n_cols()],
            trx_id: trx.id(),
            roll_ptr: ptr,
            delete_marked: false,
        }))?;
        debug!(trx_id = %trx.id(), table = %table, "undo.dml.insert_metadata");
        Ok(())
    }

    /// Logs the start of a bulk insert into an empty table; rolling back
    /// truncates the table instead of undoing rows one by one.
    pub fn begin_bulk_insert(&self, trx: &Transaction, table: TableId) -> Result<()> {
        trx.ensure_state(TrxState::Active)?;
        self.schema(table)?;
        self.write_undo(trx, table, |header| UndoRecord::Empty(TableUndo { header }))?;
        debug!(trx_id = %trx.id(), table = %table, "undo.dml.bulk_insert");
        Ok(())
    }

    /// Renames a table; rollback restores the previous name.
    pub fn rename_table(&self, trx: &Transaction, table: TableId, name: &str) -> Result<()> {
        trx.ensure_state(TrxState::Active)?;
        let ctx = self.schema(table)?;
        let old_name = ctx.table.name.clone();
        self.write_undo(trx, table, |header| {
            UndoRecord::RenameTable(RenameUndo { header, old_name })
        })?;
        self.catalog.rename_table(table, name)?;
        debug!(trx_id = %trx.id(), table = %table, name, "undo.dml.rename");
        Ok(())
    }
}

/// Inverse delta from `new` back to `old`: stored columns plus indexed
/// virtual columns, the latter with their new value as well.
fn diff(table: &TableSchema, old: &Row, new: &Row) -> UpdateVector {
    let mut update: UpdateVector = SmallVec::new();
    for i in 0..table.n_cols() {
        let col = i as u16;
        if old.col(col) != new.col(col) {
            update.push(UpdateField {
                field: FieldRef::Stored(col),
                old: old.col(col).clone(),
                new: None,
            });
        }
    }
    for vcol in table.indexed_vcols() {
        if old.vcol(vcol) != new.vcol(vcol) {
            update.push(UpdateField {
                field: FieldRef::Virtual(vcol),
                old: old.vcol(vcol).clone(),
                new: Some(new.vcol(vcol).clone()),
            });
        }
    }
    update
}

fn changes_ordering(table: &TableSchema, update: &UpdateVector) -> bool {
    update.iter().any(|u| match u.field {
        FieldRef::Stored(col) => table.is_ordering_column(col),
        FieldRef::Virtual(vcol) => table
            .indexes()
            .iter()
            .any(|idx| idx.kind != IndexKind::FullText && idx.reads(FieldRef::Virtual(vcol))),
    })
}

/// Values of every field some non full-text index reads, building or not.
fn partial_image(table: &TableSchema, row: &Row) -> Vec<(FieldRef, Datum)> {
    let mut fields: Vec<FieldRef> = table
        .indexes()
        .iter()
        .filter(|idx| idx.kind != IndexKind::FullText)
        .flat_map(|idx| idx.fields().iter().map(|f| f.field))
        .collect();
    fields.sort();
    fields.dedup();
    fields
        .into_iter()
        .map(|f| {
            let value = match f {
                FieldRef::Stored(col) => row.col(col).clone(),
                FieldRef::Virtual(vcol) => row.vcol(vcol).clone(),
            };
            (f, value)
        })
        .collect()
}

/// Stored columns plus indexed virtual columns of an inserted row.
fn insert_image(table: &TableSchema, row: &Row) -> Vec<(FieldRef, Datum)> {
    let stored = (0..table.n_cols()).map(|i| {
        let col = i as u16;
        (FieldRef::Stored(col), row.col(col).clone())
    });
    let virtuals = table
        .indexed_vcols()
        .into_iter()
        .filter(|v| !row.vcol(*v).is_missing())
        .map(|v| (FieldRef::Virtual(v), row.vcol(v).clone()));
    stored.chain(virtuals).collect()
}
