//! Index access seam and the in-memory reference index store.
//!
//! Purge, rollback and the row writer only touch index trees through
//! [`IndexStore`] and [`IndexCursor`]. A cursor owns the latch of the tree it
//! was opened on and releases it when dropped.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::storage::roll_ptr::RollPtr;
use crate::storage::row::{Collation, Datum};
use crate::types::{IndexId, Result, SombraError, TableId, TrxId};

/// A clustered index record: the full row plus system columns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusteredRec {
    /// Stored column values.
    pub cols: Vec<Datum>,
    /// `DB_TRX_ID`: last writer.
    pub trx_id: TrxId,
    /// `DB_ROLL_PTR`: undo record of the version this one replaced.
    pub roll_ptr: RollPtr,
    /// Delete mark.
    pub delete_marked: bool,
}

/// A secondary index record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecondaryRec {
    /// Key fields followed by the clustered key suffix.
    pub fields: Vec<Datum>,
    /// Delete mark.
    pub delete_marked: bool,
}

/// Record held by an index tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IndexRecord {
    /// Clustered index record.
    Clustered(ClusteredRec),
    /// Secondary index record.
    Secondary(SecondaryRec),
}

impl IndexRecord {
    /// The clustered record, if this is one.
    pub fn into_clustered(self) -> Option<ClusteredRec> {
        match self {
            IndexRecord::Clustered(rec) => Some(rec),
            IndexRecord::Secondary(_) => None,
        }
    }

    /// The secondary record, if this is one.
    pub fn into_secondary(self) -> Option<SecondaryRec> {
        match self {
            IndexRecord::Secondary(rec) => Some(rec),
            IndexRecord::Clustered(_) => None,
        }
    }

    /// Delete mark.
    pub fn is_delete_marked(&self) -> bool {
        match self {
            IndexRecord::Clustered(rec) => rec.delete_marked,
            IndexRecord::Secondary(rec) => rec.delete_marked,
        }
    }

    fn set_delete_mark(&mut self, marked: bool) {
        match self {
            IndexRecord::Clustered(rec) => rec.delete_marked = marked,
            IndexRecord::Secondary(rec) => rec.delete_marked = marked,
        }
    }
}

/// Latch taken by a search.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// Shared latch, read only.
    SearchLeaf,
    /// Exclusive latch; modifications must stay within one page.
    ModifyLeaf,
    /// Exclusive latch; modifications may restructure the tree.
    ModifyTree,
}

impl LatchMode {
    fn is_modify(self) -> bool {
        !matches!(self, LatchMode::SearchLeaf)
    }
}

/// Result of a delete attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeleteOutcome {
    /// The record is gone.
    Deleted,
    /// An optimistic delete would have required restructuring; retry with
    /// [`LatchMode::ModifyTree`].
    NeedsRestructure,
}

/// Cursor positioned by [`IndexStore::search`].
pub trait IndexCursor {
    /// Returns `true` when the search key matched a record exactly.
    fn is_positioned(&self) -> bool;

    /// Copy of the record under the cursor.
    fn record(&self) -> Option<IndexRecord>;

    /// Removes the record under the cursor. Pessimistic deletes need
    /// [`LatchMode::ModifyTree`] and may fail with [`SombraError::OutOfSpace`].
    fn delete_at(&mut self, optimistic: bool) -> Result<DeleteOutcome>;

    /// Sets or clears the delete mark of the record under the cursor.
    fn set_delete_mark(&mut self, marked: bool) -> Result<()>;

    /// Replaces the clustered record under the cursor; the key must not change.
    fn update_clustered(&mut self, rec: ClusteredRec) -> Result<()>;

    /// Inserts at the searched key, which must not already exist.
    fn insert(&mut self, rec: IndexRecord) -> Result<()>;

    /// Returns `true` when the record under the cursor is the last on its page.
    fn is_last_on_page(&self) -> bool;

    /// Returns `true` when the index forbids purging the record under the cursor.
    fn purge_veto(&self) -> bool {
        false
    }
}

/// Access to index trees.
pub trait IndexStore: Send + Sync {
    /// Latches the tree of `index` in `mode` and positions on `key`: the row
    /// reference for clustered indexes, the full entry for secondaries.
    fn search<'a>(
        &'a self,
        table: TableId,
        index: IndexId,
        key: &[Datum],
        mode: LatchMode,
    ) -> Result<Box<dyn IndexCursor + 'a>>;

    /// Removes every record of every index of `table`.
    fn truncate(&self, table: TableId) -> Result<()>;
}

/// Total order used to lay out keys: binary collation, then value kind.
fn key_cmp(a: &[Datum], b: &[Datum]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = Collation::Binary
            .compare(x, y)
            .then_with(|| kind_tag(x).cmp(&kind_tag(y)));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn kind_tag(d: &Datum) -> u8 {
    match d {
        Datum::Null => 0,
        Datum::Int(_) => 1,
        Datum::Text(_) => 2,
        Datum::Bytes(_) => 3,
        Datum::Extern(_) => 4,
        Datum::Missing => 5,
    }
}

struct Slot {
    key: Vec<Datum>,
    rec: IndexRecord,
}

/// Sorted pages; only a sole page may be empty.
struct Tree {
    pages: Vec<Vec<Slot>>,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            pages: vec![Vec::new()],
        }
    }
}

impl Tree {
    /// `Ok((page, slot))` on an exact match, otherwise the insert position.
    fn locate(&self, key: &[Datum]) -> std::result::Result<(usize, usize), (usize, usize)> {
        let last = self.pages.len() - 1;
        let page = self
            .pages
            .iter()
            .position(|p| {
                p.last()
                    .map(|s| key_cmp(key, &s.key) != Ordering::Greater)
                    .unwrap_or(false)
            })
            .unwrap_or(last);
        match self.pages[page].binary_search_by(|s| key_cmp(&s.key, key)) {
            Ok(slot) => Ok((page, slot)),
            Err(slot) => Err((page, slot)),
        }
    }

    fn len(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }
}

enum TreeGuard {
    Read(ArcRwLockReadGuard<RawRwLock, Tree>),
    Write(ArcRwLockWriteGuard<RawRwLock, Tree>),
}

impl TreeGuard {
    fn tree(&self) -> &Tree {
        match self {
            TreeGuard::Read(g) => &**g,
            TreeGuard::Write(g) => &**g,
        }
    }

    fn tree_mut(&mut self) -> Result<&mut Tree> {
        match self {
            TreeGuard::Read(_) => Err(SombraError::Invalid("cursor holds a shared latch")),
            TreeGuard::Write(g) => Ok(&mut **g),
        }
    }
}

/// Snapshot of reference index store counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexStoreStats {
    /// Trees created.
    pub trees: usize,
    /// Records across all trees.
    pub records: usize,
    /// Pages across all trees.
    pub pages: usize,
}

/// In-memory [`IndexStore`]: one latched tree of sorted pages per index.
///
/// Optimistic deletes fail when they would empty a page that is not the only
/// one. Pessimistic deletes can be made to fail with
/// [`SombraError::OutOfSpace`] through [`MemIndexStore::inject_out_of_space`].
/// Indexes registered with [`MemIndexStore::lock_predicate`] veto purging the
/// last record of a page.
pub struct MemIndexStore {
    page_capacity: usize,
    trees: RwLock<FxHashMap<(TableId, IndexId), Arc<RwLock<Tree>>>>,
    out_of_space: AtomicU32,
    predicate_locks: Mutex<FxHashSet<(TableId, IndexId)>>,
}

impl Default for MemIndexStore {
    fn default() -> Self {
        Self::new(64)
    }
}

impl MemIndexStore {
    /// Creates a store whose pages hold `page_capacity` records.
    pub fn new(page_capacity: usize) -> Self {
        Self {
            page_capacity: page_capacity.max(2),
            trees: RwLock::new(FxHashMap::default()),
            out_of_space: AtomicU32::new(0),
            predicate_locks: Mutex::new(FxHashSet::default()),
        }
    }

    fn tree(&self, table: TableId, index: IndexId) -> Arc<RwLock<Tree>> {
        if let Some(tree) = self.trees.read().get(&(table, index)) {
            return Arc::clone(tree);
        }
        let mut trees = self.trees.write();
        Arc::clone(trees.entry((table, index)).or_default())
    }

    /// Makes the next `n` pessimistic deletes fail with [`SombraError::OutOfSpace`].
    pub fn inject_out_of_space(&self, n: u32) {
        self.out_of_space.store(n, AtomicOrdering::SeqCst);
    }

    /// Registers a predicate lock on `index`.
    pub fn lock_predicate(&self, table: TableId, index: IndexId) {
        self.predicate_locks.lock().insert((table, index));
    }

    /// Drops a predicate lock registered with [`MemIndexStore::lock_predicate`].
    pub fn unlock_predicate(&self, table: TableId, index: IndexId) {
        self.predicate_locks.lock().remove(&(table, index));
    }

    /// Copy of every record of `index`, in key order.
    pub fn records(&self, table: TableId, index: IndexId) -> Vec<IndexRecord> {
        let tree = self.tree(table, index);
        let guard = tree.read();
        guard
            .pages
            .iter()
            .flat_map(|p| p.iter().map(|s| s.rec.clone()))
            .collect()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> IndexStoreStats {
        let trees = self.trees.read();
        let mut stats = IndexStoreStats {
            trees: trees.len(),
            ..IndexStoreStats::default()
        };
        for tree in trees.values() {
            let guard = tree.read();
            stats.records += guard.len();
            stats.pages += guard.pages.len();
        }
        stats
    }

    fn take_fault(&self) -> bool {
        self.out_of_space
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl IndexStore for MemIndexStore {
    fn search<'a>(
        &'a self,
        table: TableId,
        index: IndexId,
        key: &[Datum],
        mode: LatchMode,
    ) -> Result<Box<dyn IndexCursor + 'a>> {
        let tree = self.tree(table, index);
        let guard = if mode.is_modify() {
            TreeGuard::Write(tree.write_arc())
        } else {
            TreeGuard::Read(tree.read_arc())
        };
        let pos = guard.tree().locate(key);
        Ok(Box::new(MemCursor {
            store: self,
            table,
            index,
            mode,
            key: key.to_vec(),
            guard,
            pos,
        }))
    }

    fn truncate(&self, table: TableId) -> Result<()> {
        let trees: Vec<Arc<RwLock<Tree>>> = self
            .trees
            .read()
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, tree)| Arc::clone(tree))
            .collect();
        for tree in trees {
            *tree.write() = Tree::default();
        }
        trace!(table = %table, "undo.index.truncate");
        Ok(())
    }
}

struct MemCursor<'a> {
    store: &'a MemIndexStore,
    table: TableId,
    index: IndexId,
    mode: LatchMode,
    key: Vec<Datum>,
    guard: TreeGuard,
    pos: std::result::Result<(usize, usize), (usize, usize)>,
}

impl MemCursor<'_> {
    fn positioned(&self) -> Result<(usize, usize)> {
        self.pos
            .map_err(|_| SombraError::Invalid("cursor not positioned on a record"))
    }

    fn slot_mut(&mut self) -> Result<&mut Slot> {
        let (page, slot) = self.positioned()?;
        let tree = self.guard.tree_mut()?;
        Ok(&mut tree.pages[page][slot])
    }
}

impl IndexCursor for MemCursor<'_> {
    fn is_positioned(&self) -> bool {
        self.pos.is_ok()
    }

    fn record(&self) -> Option<IndexRecord> {
        let (page, slot) = self.pos.ok()?;
        Some(self.guard.tree().pages[page][slot].rec.clone())
    }

    fn delete_at(&mut self, optimistic: bool) -> Result<DeleteOutcome> {
        let (page, slot) = self.positioned()?;
        if !optimistic && self.mode != LatchMode::ModifyTree {
            return Err(SombraError::Invalid("pessimistic delete needs a tree latch"));
        }
        let tree = self.guard.tree_mut()?;
        let would_empty = tree.pages[page].len() == 1 && tree.pages.len() > 1;
        if optimistic && would_empty {
            return Ok(DeleteOutcome::NeedsRestructure);
        }
        if !optimistic && self.store.take_fault() {
            return Err(SombraError::OutOfSpace);
        }
        let tree = self.guard.tree_mut()?;
        tree.pages[page].remove(slot);
        if tree.pages[page].is_empty() && tree.pages.len() > 1 {
            tree.pages.remove(page);
        }
        self.pos = self.guard.tree().locate(&self.key);
        Ok(DeleteOutcome::Deleted)
    }

    fn set_delete_mark(&mut self, marked: bool) -> Result<()> {
        self.slot_mut()?.rec.set_delete_mark(marked);
        Ok(())
    }

    fn update_clustered(&mut self, rec: ClusteredRec) -> Result<()> {
        let slot = self.slot_mut()?;
        match &mut slot.rec {
            IndexRecord::Clustered(current) => {
                *current = rec;
                Ok(())
            }
            IndexRecord::Secondary(_) => {
                Err(SombraError::Invalid("clustered update on a secondary index"))
            }
        }
    }

    fn insert(&mut self, rec: IndexRecord) -> Result<()> {
        let (page, slot) = match self.pos {
            Ok(_) => return Err(SombraError::Invalid("duplicate index key")),
            Err(at) => at,
        };
        let capacity = self.store.page_capacity;
        let key = self.key.clone();
        let tree = self.guard.tree_mut()?;
        tree.pages[page].insert(slot, Slot { key, rec });
        if tree.pages[page].len() > capacity {
            let upper = tree.pages[page].split_off(capacity / 2);
            tree.pages.insert(page + 1, upper);
        }
        self.pos = self.guard.tree().locate(&self.key);
        Ok(())
    }

    fn is_last_on_page(&self) -> bool {
        match self.pos {
            Ok((page, slot)) => slot + 1 == self.guard.tree().pages[page].len(),
            Err(_) => false,
        }
    }

    fn purge_veto(&self) -> bool {
        self.is_last_on_page()
            && self
                .store
                .predicate_locks
                .lock()
                .contains(&(self.table, self.index))
    }
}
