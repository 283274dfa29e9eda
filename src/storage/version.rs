//! Version chain walks over clustered records.
//!
//! Every walk starts at a live clustered record and follows roll pointers into
//! the undo store, applying each record's inverse delta to rebuild the version
//! before it. The index projection of each version is rebuilt from scratch at
//! every step, so a walk works across columns added since a record was logged.

use tracing::{trace, warn};

use crate::storage::index::{ClusteredRec, SecondaryRec};
use crate::storage::metrics::{NoopMetrics, UndoMetrics};
use crate::storage::roll_ptr::RollPtr;
use crate::storage::row::{Datum, Row};
use crate::storage::schema::IndexDef;
use crate::storage::trx::{ActiveTransactionRef, ReadView, TransactionRegistry};
use crate::storage::undo::UndoStore;
use crate::storage::vcol::SchemaContext;
use crate::types::{Result, SombraError, TrxId};

static NOOP_METRICS: NoopMetrics = NoopMetrics;

/// Default bound on undo records followed by one walk.
pub const DEFAULT_MAX_VERSION_STEPS: usize = 1 << 20;

/// One row version: the clustered record as it looked, plus its virtual columns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Version {
    /// Stored columns, system columns and delete mark.
    pub rec: ClusteredRec,
    /// Virtual column values; [`Datum::Missing`] where unknown.
    pub vcols: Vec<Datum>,
}

impl Version {
    /// Row image of this version.
    pub fn row(&self) -> Row {
        Row {
            cols: self.rec.cols.clone(),
            vcols: self.vcols.clone(),
        }
    }

    /// Consumes the version, returning its row image.
    pub fn into_row(self) -> Row {
        Row {
            cols: self.rec.cols,
            vcols: self.vcols,
        }
    }

    /// Transaction that wrote this version.
    pub fn trx_id(&self) -> TrxId {
        self.rec.trx_id
    }
}

/// Walks version chains of one table.
pub struct VersionBuilder<'a> {
    ctx: &'a SchemaContext,
    undo: &'a UndoStore,
    registry: &'a dyn TransactionRegistry,
    metrics: &'a dyn UndoMetrics,
    max_steps: usize,
}

impl<'a> VersionBuilder<'a> {
    /// Creates a builder reading undo records from `undo`.
    pub fn new(
        ctx: &'a SchemaContext,
        undo: &'a UndoStore,
        registry: &'a dyn TransactionRegistry,
    ) -> Self {
        Self {
            ctx,
            undo,
            registry,
            metrics: &NOOP_METRICS,
            max_steps: DEFAULT_MAX_VERSION_STEPS,
        }
    }

    /// Reports walks to `metrics`.
    pub fn with_metrics(mut self, metrics: &'a dyn UndoMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Bounds the number of undo records a walk may follow.
    pub fn max_steps(mut self, steps: usize) -> Self {
        self.max_steps = steps.max(1);
        self
    }

    /// The live version of `rec`, with virtual columns computed by the evaluator.
    pub fn current_version(&self, rec: &ClusteredRec) -> Result<Version> {
        let mut version = Version {
            rec: rec.clone(),
            vcols: vec![Datum::Missing; self.ctx.table.n_vcols()],
        };
        self.fill_vcols(&mut version)?;
        Ok(version)
    }

    /// The version `v` replaced, or `None` when `v` is the row's first version.
    ///
    /// Fails with [`SombraError::MissingHistory`] when the undo record is gone
    /// or does not belong to `v`.
    pub fn prev_version(&self, v: &Version) -> Result<Option<Version>> {
        self.step(v, false)
    }

    fn fill_vcols(&self, v: &mut Version) -> Result<()> {
        let table = &self.ctx.table;
        if table.n_vcols() == 0 {
            return Ok(());
        }
        let row = Row::new(v.rec.cols.clone());
        for (i, def) in table.virtual_columns.iter().enumerate() {
            if !v.vcols[i].is_missing() || def.base_columns.iter().any(|c| row.col(*c).is_missing())
            {
                continue;
            }
            match self.ctx.evaluator.evaluate(table, i as u16, &row) {
                Ok(value) => v.vcols[i] = value,
                Err(SombraError::VirtualColumnUnavailable { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// One step back. With `tolerant`, a record already released by purge
    /// ends the chain instead of failing.
    fn step(&self, v: &Version, tolerant: bool) -> Result<Option<Version>> {
        let ptr = v.rec.roll_ptr;
        if ptr.ends_chain() {
            return Ok(None);
        }
        let missing = SombraError::MissingHistory { roll_ptr: ptr.raw() };
        let record = match self.undo.read(ptr) {
            Ok(record) => record,
            Err(SombraError::MissingHistory { .. }) if tolerant => return Ok(None),
            Err(SombraError::Corruption(what)) => {
                warn!(roll_ptr = %ptr, what, "undo.version.corrupt_record");
                return Err(missing);
            }
            Err(err) => return Err(err),
        };
        let header = record.header();
        if header.table_id != self.ctx.table.id {
            trace!(roll_ptr = %ptr, table = %header.table_id, "undo.version.foreign_table");
            return Ok(None);
        }
        let Some(modify) = record.as_modify() else {
            return Err(missing);
        };
        if header.trx_id != v.rec.trx_id || modify.prior.trx_id > v.rec.trx_id {
            return Err(missing);
        }
        let (cols, vcols) = modify.apply_to(&self.ctx.table, &v.rec.cols, &v.vcols);
        let mut prev = Version {
            rec: ClusteredRec {
                cols,
                trx_id: modify.prior.trx_id,
                roll_ptr: modify.prior.roll_ptr,
                delete_marked: modify.prior.delete_marked,
            },
            vcols,
        };
        if prev.rec.roll_ptr.ends_chain() {
            self.fill_vcols(&mut prev)?;
        }
        Ok(Some(prev))
    }

    fn counted_step(
        &self,
        v: &Version,
        tolerant: bool,
        steps: &mut usize,
    ) -> Result<Option<Version>> {
        *steps += 1;
        if *steps > self.max_steps {
            return Err(SombraError::Corruption("version chain exceeds step bound"));
        }
        self.step(v, tolerant)
    }

    fn finish<T>(&self, steps: usize, out: Result<T>) -> Result<T> {
        self.metrics.version_walk(steps);
        if let Err(SombraError::MissingHistory { roll_ptr }) = &out {
            self.metrics.missing_history();
            warn!(
                table = %self.ctx.table.id,
                roll_ptr = %RollPtr::from_raw(*roll_ptr),
                "undo.version.missing_history"
            );
        }
        out
    }

    fn require_clustered(index: &IndexDef) -> Result<()> {
        if index.is_clustered() {
            Ok(())
        } else {
            Err(SombraError::Invalid("version walk needs the clustered index"))
        }
    }

    /// The newest version of `rec` visible to `view`, delete-marked or not.
    pub fn build_visible_record(
        &self,
        rec: &ClusteredRec,
        index: &IndexDef,
        view: &ReadView,
    ) -> Result<Option<Version>> {
        Self::require_clustered(index)?;
        let mut steps = 0;
        let out = self.visible_walk(rec, view, &mut steps);
        self.finish(steps, out)
    }

    fn visible_walk(
        &self,
        rec: &ClusteredRec,
        view: &ReadView,
        steps: &mut usize,
    ) -> Result<Option<Version>> {
        let max_trx_id = self.registry.max_trx_id();
        let mut v = self.current_version(rec)?;
        loop {
            let trx_id = v.rec.trx_id;
            if trx_id >= view.low_limit_id() && trx_id >= max_trx_id {
                return Err(SombraError::Corruption("row transaction id is in the future"));
            }
            if view.is_visible(trx_id) {
                return Ok(Some(v));
            }
            match self.counted_step(&v, false, steps)? {
                Some(prev) => v = prev,
                None => return Ok(None),
            }
        }
    }

    /// Consistent read: the row as `view` sees it, `None` when it did not
    /// exist (or was deleted) in that snapshot.
    pub fn build_visible_version(
        &self,
        rec: &ClusteredRec,
        index: &IndexDef,
        view: &ReadView,
    ) -> Result<Option<Row>> {
        Ok(self
            .build_visible_record(rec, index, view)?
            .filter(|v| !v.rec.delete_marked)
            .map(Version::into_row))
    }

    /// The newest version written by a transaction that is no longer active.
    pub fn build_latest_committed_record(
        &self,
        rec: &ClusteredRec,
        index: &IndexDef,
    ) -> Result<Option<Version>> {
        Self::require_clustered(index)?;
        let mut steps = 0;
        let out = self.committed_walk(rec, &mut steps);
        self.finish(steps, out)
    }

    fn committed_walk(&self, rec: &ClusteredRec, steps: &mut usize) -> Result<Option<Version>> {
        let mut v = self.current_version(rec)?;
        loop {
            if !self.registry.is_active(v.rec.trx_id) {
                if *steps > 0 && v.rec.trx_id == rec.trx_id {
                    // The writer committed while we walked; the live record is the answer.
                    return self.current_version(rec).map(Some);
                }
                return Ok(Some(v));
            }
            match self.counted_step(&v, false, steps)? {
                Some(prev) => v = prev,
                None => return Ok(None),
            }
        }
    }

    /// Semi-consistent read: the last committed state of the row, `None` when
    /// it has none or it is delete-marked.
    pub fn build_latest_committed_version(
        &self,
        rec: &ClusteredRec,
        index: &IndexDef,
    ) -> Result<Option<Row>> {
        Ok(self
            .build_latest_committed_record(rec, index)?
            .filter(|v| !v.rec.delete_marked)
            .map(Version::into_row))
    }

    /// Returns the active transaction that implicitly holds an exclusive lock
    /// on the secondary record `sec` of `index`, whose clustered record is `rec`.
    ///
    /// The writer of `rec` holds the lock when some version it produced needs
    /// `sec` in a state other than the one stored; once a step reaches a version
    /// written by another transaction, nothing is locked.
    pub fn find_implicit_lock_holder(
        &self,
        rec: &ClusteredRec,
        index: &IndexDef,
        sec: &SecondaryRec,
    ) -> Result<Option<ActiveTransactionRef>> {
        if index.is_clustered() {
            return Err(SombraError::Invalid("implicit lock check needs a secondary index"));
        }
        let trx_id = rec.trx_id;
        let Some(trx) = self.registry.find(trx_id) else {
            return Ok(None);
        };
        let mut steps = 0;
        let out = self.lock_walk(rec, index, sec, trx_id, &mut steps);
        match self.finish(steps, out)? {
            true if trx.is_active() => Ok(Some(trx)),
            _ => Ok(None),
        }
    }

    fn lock_walk(
        &self,
        rec: &ClusteredRec,
        index: &IndexDef,
        sec: &SecondaryRec,
        trx_id: TrxId,
        steps: &mut usize,
    ) -> Result<bool> {
        let table = &self.ctx.table;
        let rec_del = sec.delete_marked;
        let mut v = self.current_version(rec)?;
        loop {
            let Some(prev) = self.counted_step(&v, false, steps)? else {
                // First version reached: it matches `sec` unless `sec` is delete-marked.
                return Ok(!rec_del);
            };
            let vers_del = prev.rec.delete_marked;
            let entry = index.build_entry(table, &prev.row())?;
            let coll_eq = entry
                .as_deref()
                .map(|e| index.compare(e, &sec.fields).is_eq())
                .unwrap_or(false);
            if coll_eq {
                if rec_del != vers_del {
                    return Ok(true);
                }
                // 'abc' -> 'ABC' keeps the collation order but changes the bytes.
                if !entry
                    .as_deref()
                    .map(|e| IndexDef::binary_eq(e, &sec.fields))
                    .unwrap_or(false)
                {
                    return Ok(true);
                }
            } else if !rec_del {
                return Ok(true);
            }
            if prev.rec.trx_id != trx_id {
                return Ok(false);
            }
            v = prev;
        }
    }

    /// Returns `true` when some version of `rec` still projects to `entry` in
    /// `index` (collation equality). Delete-marked versions are ignored.
    ///
    /// `also_curr` includes the live record. `limit`, the roll pointer of an
    /// undo record being purged, stops the walk before the obsolete version
    /// that record rebuilds. A record released by purge ends the walk.
    pub fn old_has_index_entry(
        &self,
        also_curr: bool,
        rec: &ClusteredRec,
        index: &IndexDef,
        entry: &[Datum],
        limit: Option<RollPtr>,
    ) -> Result<bool> {
        let mut steps = 0;
        let out = self.has_entry_walk(also_curr, rec, index, entry, limit, &mut steps);
        self.finish(steps, out)
    }

    fn has_entry_walk(
        &self,
        also_curr: bool,
        rec: &ClusteredRec,
        index: &IndexDef,
        entry: &[Datum],
        limit: Option<RollPtr>,
        steps: &mut usize,
    ) -> Result<bool> {
        let table = &self.ctx.table;
        let matches = |v: &Version| -> Result<bool> {
            if v.rec.delete_marked {
                return Ok(false);
            }
            Ok(index
                .build_entry(table, &v.row())?
                .map(|e| index.compare(&e, entry).is_eq())
                .unwrap_or(false))
        };
        let mut v = self.current_version(rec)?;
        if also_curr && matches(&v)? {
            return Ok(true);
        }
        loop {
            if limit == Some(v.rec.roll_ptr) {
                return Ok(false);
            }
            match self.counted_step(&v, true, steps)? {
                Some(prev) => {
                    if matches(&prev)? {
                        return Ok(true);
                    }
                    v = prev;
                }
                None => return Ok(false),
            }
        }
    }
}
