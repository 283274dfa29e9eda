//! Transaction bookkeeping: ids, commit numbers, read views and the active set.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::storage::undo::{HistoryEntry, HistoryQueue, UndoLog, UndoStore};
use crate::types::{Result, SombraError, TrxId, TrxNo, UndoNo};

/// Immutable visibility snapshot.
#[derive(Clone, Debug)]
pub struct ReadView {
    id: u64,
    creator: TrxId,
    low_limit_id: TrxId,
    up_limit_id: TrxId,
    active: SmallVec<[TrxId; 8]>,
    low_limit_no: TrxNo,
}

impl ReadView {
    /// Returns `true` when changes made by `trx_id` are visible in this snapshot.
    ///
    /// Ids below the up limit committed before the snapshot; ids at or above the
    /// low limit started after it; ids in between are visible unless they were
    /// active when the snapshot was taken. The creator sees its own changes.
    pub fn is_visible(&self, trx_id: TrxId) -> bool {
        if trx_id < self.up_limit_id || trx_id == self.creator {
            return true;
        }
        if trx_id >= self.low_limit_id {
            return false;
        }
        self.active.binary_search(&trx_id).is_err()
    }

    /// Alias of [`ReadView::is_visible`].
    pub fn changes_visible(&self, trx_id: TrxId) -> bool {
        self.is_visible(trx_id)
    }

    /// Registration id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Transaction that owns the view, `TrxId(0)` for standalone views.
    pub fn creator(&self) -> TrxId {
        self.creator
    }

    /// First transaction id that had not started when the view was taken.
    pub fn low_limit_id(&self) -> TrxId {
        self.low_limit_id
    }

    /// Every id below this is visible.
    pub fn up_limit_id(&self) -> TrxId {
        self.up_limit_id
    }

    /// Transactions with a lower commit number are visible to this view.
    pub fn low_limit_no(&self) -> TrxNo {
        self.low_limit_no
    }

    fn without_creator(&self) -> ReadView {
        let mut view = self.clone();
        if view.creator != TrxId(0) {
            if let Err(pos) = view.active.binary_search(&view.creator) {
                view.active.insert(pos, view.creator);
            }
            view.up_limit_id = view.up_limit_id.min(view.creator);
            view.creator = TrxId(0);
        }
        view
    }
}

/// Lifecycle of a transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrxState {
    /// Running.
    Active,
    /// Undoing its changes; still holds its implicit locks.
    RollingBack,
    /// Committed.
    Committed,
    /// Fully rolled back.
    RolledBack,
}

/// Undo position a partial rollback returns to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Savepoint(UndoNo);

impl Savepoint {
    /// First undo number undone when rolling back to this savepoint.
    pub fn undo_no(self) -> UndoNo {
        self.0
    }
}

#[derive(Debug)]
struct TrxInner {
    state: TrxState,
    trx_no: Option<TrxNo>,
    undo: UndoLog,
    view: Option<Arc<ReadView>>,
}

/// A transaction handle.
#[derive(Debug)]
pub struct Transaction {
    id: TrxId,
    inner: Mutex<TrxInner>,
}

/// Shared reference to a transaction found in the registry.
pub type ActiveTransactionRef = Arc<Transaction>;

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> TrxId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TrxState {
        self.inner.lock().state
    }

    /// Returns `true` while the transaction may still hold implicit locks.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), TrxState::Active | TrxState::RollingBack)
    }

    /// Commit number, once committed.
    pub fn trx_no(&self) -> Option<TrxNo> {
        self.inner.lock().trx_no
    }

    /// Captures the current end of the undo log.
    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.inner.lock().undo.next_undo_no())
    }

    /// The view assigned by [`TrxSys::assign_read_view`], if any.
    pub fn read_view(&self) -> Option<Arc<ReadView>> {
        self.inner.lock().view.clone()
    }

    /// Number of undo records the transaction currently owns.
    pub fn undo_len(&self) -> usize {
        self.inner.lock().undo.entries().len()
    }

    pub(crate) fn with_undo<R>(&self, f: impl FnOnce(&mut UndoLog) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner.undo)
    }

    pub(crate) fn ensure_state(&self, expected: TrxState) -> Result<()> {
        if self.state() == expected {
            Ok(())
        } else {
            Err(SombraError::Invalid("transaction in wrong state"))
        }
    }
}

/// Read access to the active transaction set, as needed by version walks.
pub trait TransactionRegistry: Send + Sync {
    /// Returns `true` while `trx_id` is active or rolling back.
    fn is_active(&self, trx_id: TrxId) -> bool;

    /// Returns the transaction while it is active or rolling back.
    fn find(&self, trx_id: TrxId) -> Option<ActiveTransactionRef>;

    /// Next transaction id to be assigned; no row may carry an id at or above it.
    fn max_trx_id(&self) -> TrxId;
}

/// Diagnostics snapshot of the transaction system.
#[derive(Clone, Debug, Default)]
pub struct TrxSysSnapshot {
    /// Next transaction id.
    pub next_trx_id: u64,
    /// Next commit number.
    pub next_trx_no: u64,
    /// Active (or rolling back) transactions.
    pub active: Vec<TrxId>,
    /// Registered views.
    pub open_views: usize,
    /// Low limit commit number of the oldest view.
    pub oldest_view_low_limit_no: Option<TrxNo>,
}

struct SysState {
    next_trx_id: u64,
    next_trx_no: u64,
    next_view_id: u64,
    active: BTreeMap<TrxId, Arc<Transaction>>,
    views: BTreeMap<u64, Arc<ReadView>>,
}

/// Transaction system: allocates ids, tracks active transactions and views,
/// and moves committed undo into the history queue.
pub struct TrxSys {
    state: Mutex<SysState>,
    undo: Arc<UndoStore>,
    history: Arc<HistoryQueue>,
}

impl TrxSys {
    /// Creates a transaction system whose first transaction id is 1.
    pub fn new(undo: Arc<UndoStore>, history: Arc<HistoryQueue>) -> Self {
        Self {
            state: Mutex::new(SysState {
                next_trx_id: 1,
                next_trx_no: 1,
                next_view_id: 1,
                active: BTreeMap::new(),
                views: BTreeMap::new(),
            }),
            undo,
            history,
        }
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        let mut state = self.state.lock();
        let id = TrxId(state.next_trx_id);
        state.next_trx_id += 1;
        let trx = Arc::new(Transaction {
            id,
            inner: Mutex::new(TrxInner {
                state: TrxState::Active,
                trx_no: None,
                undo: self.undo.open_log(),
                view: None,
            }),
        });
        state.active.insert(id, Arc::clone(&trx));
        debug!(trx_id = %id, "undo.trx.begin");
        trx
    }

    fn build_view(state: &mut SysState, creator: TrxId) -> ReadView {
        let low_limit_id = TrxId(state.next_trx_id);
        let active: SmallVec<[TrxId; 8]> = state
            .active
            .keys()
            .copied()
            .filter(|id| *id != creator)
            .collect();
        let up_limit_id = active.first().copied().unwrap_or(low_limit_id);
        let id = state.next_view_id;
        state.next_view_id += 1;
        ReadView {
            id,
            creator,
            low_limit_id,
            up_limit_id,
            active,
            low_limit_no: TrxNo(state.next_trx_no),
        }
    }

    /// Takes and registers a standalone snapshot. Release it with [`TrxSys::close_view`].
    pub fn open_view(&self) -> Arc<ReadView> {
        let mut state = self.state.lock();
        let view = Arc::new(Self::build_view(&mut state, TrxId(0)));
        state.views.insert(view.id, Arc::clone(&view));
        view
    }

    /// Returns the transaction's snapshot, taking one on first use. It is
    /// released when the transaction ends.
    pub fn assign_read_view(&self, trx: &Transaction) -> Arc<ReadView> {
        let mut state = self.state.lock();
        let mut inner = trx.inner.lock();
        if let Some(view) = &inner.view {
            return Arc::clone(view);
        }
        let view = Arc::new(Self::build_view(&mut state, trx.id));
        state.views.insert(view.id, Arc::clone(&view));
        inner.view = Some(Arc::clone(&view));
        view
    }

    /// Unregisters a standalone view.
    pub fn close_view(&self, view: &ReadView) {
        self.state.lock().views.remove(&view.id);
    }

    /// Snapshot purge must respect: the oldest registered view, or a fresh
    /// snapshot when none is open.
    ///
    /// The result has no creator. The oldest view's creator is still running,
    /// so it joins the active set like any other unfinished transaction.
    pub fn purge_view(&self) -> ReadView {
        let mut state = self.state.lock();
        match state.views.values().next() {
            Some(oldest) => oldest.without_creator(),
            None => Self::build_view(&mut state, TrxId(0)),
        }
    }

    /// Commits `trx` and queues its undo records for purge.
    pub fn commit(&self, trx: &Transaction) -> Result<TrxNo> {
        let mut state = self.state.lock();
        let mut inner = trx.inner.lock();
        if inner.state != TrxState::Active {
            return Err(SombraError::Invalid("commit of inactive transaction"));
        }
        let trx_no = TrxNo(state.next_trx_no);
        state.next_trx_no += 1;
        inner.state = TrxState::Committed;
        inner.trx_no = Some(trx_no);
        if let Some(view) = inner.view.take() {
            state.views.remove(&view.id);
        }
        let sealed = self.undo.seal(&mut inner.undo);
        let n_records = sealed.len();
        self.history.push_committed(sealed.into_iter().map(|e| HistoryEntry {
            trx_no,
            trx_id: trx.id,
            undo_no: e.undo_no,
            roll_ptr: e.roll_ptr,
            table_id: e.table_id,
        }));
        state.active.remove(&trx.id);
        debug!(trx_id = %trx.id, trx_no = %trx_no, n_records, "undo.trx.commit");
        Ok(trx_no)
    }

    pub(crate) fn begin_rollback(&self, trx: &Transaction) -> Result<()> {
        let mut inner = trx.inner.lock();
        match inner.state {
            TrxState::Active | TrxState::RollingBack => {
                inner.state = TrxState::RollingBack;
                Ok(())
            }
            _ => Err(SombraError::Invalid("rollback of finished transaction")),
        }
    }

    /// Ends a partial rollback; the transaction keeps running.
    pub(crate) fn resume_after_rollback(&self, trx: &Transaction) {
        let mut inner = trx.inner.lock();
        if inner.state == TrxState::RollingBack {
            inner.state = TrxState::Active;
        }
    }

    pub(crate) fn finish_rollback(&self, trx: &Transaction) {
        let mut state = self.state.lock();
        let mut inner = trx.inner.lock();
        inner.state = TrxState::RolledBack;
        if let Some(view) = inner.view.take() {
            state.views.remove(&view.id);
        }
        state.active.remove(&trx.id);
        debug!(trx_id = %trx.id, "undo.trx.rolled_back");
    }

    /// Diagnostics snapshot.
    pub fn snapshot(&self) -> TrxSysSnapshot {
        let state = self.state.lock();
        TrxSysSnapshot {
            next_trx_id: state.next_trx_id,
            next_trx_no: state.next_trx_no,
            active: state.active.keys().copied().collect(),
            open_views: state.views.len(),
            oldest_view_low_limit_no: state.views.values().next().map(|v| v.low_limit_no),
        }
    }
}

impl TransactionRegistry for TrxSys {
    fn is_active(&self, trx_id: TrxId) -> bool {
        self.state.lock().active.contains_key(&trx_id)
    }

    fn find(&self, trx_id: TrxId) -> Option<ActiveTransactionRef> {
        self.state.lock().active.get(&trx_id).cloned()
    }

    fn max_trx_id(&self) -> TrxId {
        TrxId(self.state.lock().next_trx_id)
    }
}
