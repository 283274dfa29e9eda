//! Queue of committed undo records awaiting purge, in commit order.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::storage::roll_ptr::RollPtr;
use crate::types::{TableId, TrxId, TrxNo, UndoNo};

/// One committed undo record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HistoryEntry {
    /// Commit number of the writing transaction.
    pub trx_no: TrxNo,
    /// Writing transaction.
    pub trx_id: TrxId,
    /// Position in the transaction's undo log.
    pub undo_no: UndoNo,
    /// Record location.
    pub roll_ptr: RollPtr,
    /// Table the record modifies.
    pub table_id: TableId,
}

/// Multi-producer, multi-consumer history queue.
///
/// Entries are appended at commit (under the transaction system latch, so in
/// commit order) and handed out strictly front first. An entry is eligible
/// once its commit number is below the purge view's low limit.
#[derive(Default)]
pub struct HistoryQueue {
    entries: Mutex<VecDeque<HistoryEntry>>,
    wakeup: Condvar,
}

impl HistoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one committed transaction's records, oldest first.
    pub fn push_committed(&self, batch: impl IntoIterator<Item = HistoryEntry>) {
        let mut guard = self.entries.lock();
        let before = guard.len();
        for entry in batch {
            debug_assert!(guard.back().map_or(true, |b| b.trx_no <= entry.trx_no));
            guard.push_back(entry);
        }
        if guard.len() > before {
            self.wakeup.notify_all();
        }
    }

    /// Pops up to `max` entries whose commit number is below `low_limit_no`.
    pub fn pop_eligible(&self, low_limit_no: TrxNo, max: usize) -> Vec<HistoryEntry> {
        let mut guard = self.entries.lock();
        let mut out = Vec::new();
        while out.len() < max {
            match guard.front() {
                Some(front) if front.trx_no < low_limit_no => {
                    if let Some(entry) = guard.pop_front() {
                        out.push(entry);
                    }
                }
                _ => break,
            }
        }
        out
    }

    /// Puts entries back at the front, keeping their relative order.
    pub fn requeue_front(&self, entries: Vec<HistoryEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut guard = self.entries.lock();
        debug!(count = entries.len(), "undo.history.requeue");
        for entry in entries.into_iter().rev() {
            guard.push_front(entry);
        }
        self.wakeup.notify_all();
    }

    /// Entries waiting.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when nothing waits.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Commit number of the oldest waiting entry.
    pub fn oldest_trx_no(&self) -> Option<TrxNo> {
        self.entries.lock().front().map(|e| e.trx_no)
    }

    /// Blocks until an entry is pushed or `timeout` elapses. Returns `true`
    /// when the queue is non-empty on return.
    pub fn wait_for_entries(&self, timeout: Duration) -> bool {
        let mut guard = self.entries.lock();
        if guard.is_empty() {
            let _ = self.wakeup.wait_for(&mut guard, timeout);
        }
        !guard.is_empty()
    }

    /// Wakes every waiter, e.g. on shutdown.
    pub fn notify_all(&self) {
        let _guard = self.entries.lock();
        self.wakeup.notify_all();
    }
}
