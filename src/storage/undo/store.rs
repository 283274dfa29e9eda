//! Arena of undo records addressed by roll pointer.
//!
//! Records live on fixed-capacity undo pages grouped into [`UNDO_SEGMENTS`]
//! segments. Every page has its own latch; the segment map latch is only held
//! long enough to find the page. Record images are immutable [`Bytes`], so a
//! reader clones the image, drops the latch, then decodes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use super::record::{self, UndoRecord};
use crate::storage::roll_ptr::{RollPtr, UNDO_SEGMENTS};
use crate::types::{Result, SombraError, TableId, UndoNo};

/// Default undo page capacity in bytes.
pub const DEFAULT_UNDO_PAGE_SIZE: usize = 16 * 1024;

#[derive(Default)]
struct UndoPage {
    records: BTreeMap<u16, Bytes>,
    used: usize,
}

#[derive(Default)]
struct Segment {
    pages: RwLock<FxHashMap<u32, Arc<RwLock<UndoPage>>>>,
    next_page: AtomicU32,
}

/// Position of one record in a transaction's undo log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UndoLogEntry {
    /// Undo number.
    pub undo_no: UndoNo,
    /// Where the record lives.
    pub roll_ptr: RollPtr,
    /// Table the record modifies.
    pub table_id: TableId,
}

/// One transaction's undo log, oldest record first.
#[derive(Debug)]
pub struct UndoLog {
    segment: u8,
    page: Option<u32>,
    entries: Vec<UndoLogEntry>,
    next_undo_no: UndoNo,
}

impl UndoLog {
    /// Undo number the next appended record must carry.
    pub fn next_undo_no(&self) -> UndoNo {
        self.next_undo_no
    }

    /// Records still in the log, oldest first.
    pub fn entries(&self) -> &[UndoLogEntry] {
        &self.entries
    }

    /// Newest record, if any.
    pub fn last(&self) -> Option<UndoLogEntry> {
        self.entries.last().copied()
    }

    /// Returns `true` when the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Undo segment assigned to the log.
    pub fn segment(&self) -> u8 {
        self.segment
    }
}

/// Snapshot of undo store counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct UndoStoreMetricsSnapshot {
    /// Records appended.
    pub records_written: u64,
    /// Records released by purge or rollback.
    pub records_released: u64,
    /// Encoded bytes appended.
    pub bytes_written: u64,
    /// Undo pages allocated.
    pub pages_allocated: u64,
    /// Undo pages freed once empty.
    pub pages_freed: u64,
}

impl UndoStoreMetricsSnapshot {
    /// Records currently held.
    pub fn live_records(&self) -> u64 {
        self.records_written.saturating_sub(self.records_released)
    }
}

#[derive(Default)]
struct UndoStoreMetrics {
    records_written: AtomicU64,
    records_released: AtomicU64,
    bytes_written: AtomicU64,
    pages_allocated: AtomicU64,
    pages_freed: AtomicU64,
}

/// Shared undo record arena.
pub struct UndoStore {
    page_size: usize,
    segments: Vec<Segment>,
    next_segment: AtomicUsize,
    metrics: UndoStoreMetrics,
}

impl UndoStore {
    /// Creates a store whose pages hold `page_size` bytes.
    pub fn new(page_size: usize) -> Result<Self> {
        if page_size == 0 || page_size > usize::from(u16::MAX) + 1 {
            return Err(SombraError::Invalid("undo page size must be 1..=65536"));
        }
        Ok(Self {
            page_size,
            segments: (0..UNDO_SEGMENTS).map(|_| Segment::default()).collect(),
            next_segment: AtomicUsize::new(0),
            metrics: UndoStoreMetrics::default(),
        })
    }

    /// Opens an empty log on the next segment, round robin.
    pub fn open_log(&self) -> UndoLog {
        let segment =
            (self.next_segment.fetch_add(1, Ordering::Relaxed) % usize::from(UNDO_SEGMENTS)) as u8;
        UndoLog {
            segment,
            page: None,
            entries: Vec::new(),
            next_undo_no: UndoNo(0),
        }
    }

    /// Encodes `rec` and appends it to `log`, returning its roll pointer.
    pub fn append(&self, log: &mut UndoLog, rec: &UndoRecord) -> Result<RollPtr> {
        let header = rec.header();
        if header.undo_no != log.next_undo_no {
            return Err(SombraError::Invalid("undo number out of sequence"));
        }
        let image = record::encode(rec)?;
        if image.len() > self.page_size {
            return Err(SombraError::Invalid("undo record larger than an undo page"));
        }
        let segment = &self.segments[usize::from(log.segment)];
        let len = image.len();
        let (page_no, page) = self.page_with_room(segment, log, len);
        let offset = {
            let mut guard = page.write();
            let offset = u16::try_from(guard.used)
                .map_err(|_| SombraError::Corruption("undo page offset overflow"))?;
            guard.used += len;
            guard.records.insert(offset, Bytes::from(image));
            offset
        };
        let ptr = RollPtr::new(rec.kind().is_insert(), log.segment, page_no, offset)?;
        log.entries.push(UndoLogEntry {
            undo_no: header.undo_no,
            roll_ptr: ptr,
            table_id: header.table_id,
        });
        log.next_undo_no = header.undo_no.next();
        self.metrics.records_written.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_written
            .fetch_add(len as u64, Ordering::Relaxed);
        trace!(roll_ptr = %ptr, len, "undo.store.append");
        Ok(ptr)
    }

    fn page_with_room(
        &self,
        segment: &Segment,
        log: &mut UndoLog,
        len: usize,
    ) -> (u32, Arc<RwLock<UndoPage>>) {
        if let Some(page_no) = log.page {
            let cached = segment.pages.read().get(&page_no).cloned();
            if let Some(page) = cached {
                if page.read().used + len <= self.page_size {
                    return (page_no, page);
                }
            }
        }
        let page_no = segment.next_page.fetch_add(1, Ordering::Relaxed) + 1;
        let page = Arc::new(RwLock::new(UndoPage::default()));
        segment.pages.write().insert(page_no, Arc::clone(&page));
        self.metrics.pages_allocated.fetch_add(1, Ordering::Relaxed);
        log.page = Some(page_no);
        (page_no, page)
    }

    fn page(&self, ptr: RollPtr) -> Option<Arc<RwLock<UndoPage>>> {
        let segment = self.segments.get(usize::from(ptr.segment()))?;
        let page = segment.pages.read().get(&ptr.page()).cloned();
        page
    }

    /// Returns the record image, or `None` when nothing lives at `ptr`.
    pub fn fetch(&self, ptr: RollPtr) -> Option<Bytes> {
        if ptr.is_null() {
            return None;
        }
        let page = self.page(ptr)?;
        let image = page.read().records.get(&ptr.offset()).cloned();
        image
    }

    /// Fetches and decodes; an absent record is [`SombraError::MissingHistory`].
    pub fn read(&self, ptr: RollPtr) -> Result<UndoRecord> {
        let image = self
            .fetch(ptr)
            .ok_or(SombraError::MissingHistory { roll_ptr: ptr.raw() })?;
        record::decode(&image)
    }

    /// Drops the record at `ptr`. Returns `false` when it was already gone.
    pub fn release(&self, ptr: RollPtr) -> bool {
        let Some(segment) = self.segments.get(usize::from(ptr.segment())) else {
            return false;
        };
        let Some(page) = self.page(ptr) else {
            return false;
        };
        let (removed, empty) = {
            let mut guard = page.write();
            let removed = guard.records.remove(&ptr.offset()).is_some();
            (removed, guard.records.is_empty())
        };
        if empty {
            let mut pages = segment.pages.write();
            let still_empty = pages
                .get(&ptr.page())
                .map(|p| p.read().records.is_empty())
                .unwrap_or(false);
            if still_empty {
                pages.remove(&ptr.page());
                self.metrics.pages_freed.fetch_add(1, Ordering::Relaxed);
            }
        }
        if removed {
            self.metrics.records_released.fetch_add(1, Ordering::Relaxed);
            trace!(roll_ptr = %ptr, "undo.store.release");
        }
        removed
    }

    /// Removes the newest record of `log` after rollback undid it.
    pub fn pop_newest(&self, log: &mut UndoLog) -> Option<UndoLogEntry> {
        let entry = log.entries.pop()?;
        self.release(entry.roll_ptr);
        log.next_undo_no = entry.undo_no;
        Some(entry)
    }

    /// Hands the log's entries to the caller; the records stay in the store
    /// until purge releases them.
    pub fn seal(&self, log: &mut UndoLog) -> Vec<UndoLogEntry> {
        log.page = None;
        std::mem::take(&mut log.entries)
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> UndoStoreMetricsSnapshot {
        UndoStoreMetricsSnapshot {
            records_written: self.metrics.records_written.load(Ordering::Relaxed),
            records_released: self.metrics.records_released.load(Ordering::Relaxed),
            bytes_written: self.metrics.bytes_written.load(Ordering::Relaxed),
            pages_allocated: self.metrics.pages_allocated.load(Ordering::Relaxed),
            pages_freed: self.metrics.pages_freed.load(Ordering::Relaxed),
        }
    }
}
