//! Storage for column values too long to keep in the row.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::storage::row::ExternRef;
use crate::types::{Result, SombraError};

/// Allocator for externally stored values.
pub trait ExternalStorage: Send + Sync {
    /// Stores `value`, returning its reference.
    fn store(&self, value: &[u8]) -> Result<ExternRef>;

    /// Frees a value. Returns `false` when it was already freed.
    fn free(&self, eref: ExternRef) -> Result<bool>;

    /// Returns `true` while the value is allocated.
    fn is_live(&self, eref: ExternRef) -> bool;

    /// Reads a whole value.
    fn read(&self, eref: ExternRef) -> Result<Bytes>;
}

/// Snapshot of external storage counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExternStoreStats {
    /// Values stored.
    pub stored: u64,
    /// Values freed.
    pub freed: u64,
    /// Values currently allocated.
    pub live: u64,
}

/// In-memory [`ExternalStorage`].
#[derive(Default)]
pub struct MemExternStore {
    values: Mutex<FxHashMap<u64, Bytes>>,
    next_id: AtomicU64,
    stored: AtomicU64,
    freed: AtomicU64,
}

impl MemExternStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ExternStoreStats {
        ExternStoreStats {
            stored: self.stored.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            live: self.values.lock().len() as u64,
        }
    }
}

impl ExternalStorage for MemExternStore {
    fn store(&self, value: &[u8]) -> Result<ExternRef> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.values
            .lock()
            .insert(id, Bytes::copy_from_slice(value));
        self.stored.fetch_add(1, Ordering::Relaxed);
        trace!(id, len = value.len(), "undo.extern.store");
        Ok(ExternRef {
            id,
            len: value.len() as u64,
        })
    }

    fn free(&self, eref: ExternRef) -> Result<bool> {
        let removed = self.values.lock().remove(&eref.id).is_some();
        if removed {
            self.freed.fetch_add(1, Ordering::Relaxed);
            trace!(id = eref.id, "undo.extern.free");
        }
        Ok(removed)
    }

    fn is_live(&self, eref: ExternRef) -> bool {
        self.values.lock().contains_key(&eref.id)
    }

    fn read(&self, eref: ExternRef) -> Result<Bytes> {
        self.values
            .lock()
            .get(&eref.id)
            .cloned()
            .ok_or(SombraError::NotFound)
    }
}
