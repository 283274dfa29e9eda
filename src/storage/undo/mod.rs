//! Undo records: byte format, the record arena and the purge history queue.

pub mod history;
pub mod record;
pub mod store;

pub use history::{HistoryEntry, HistoryQueue};
pub use record::{
    decode, decode_partial, decode_row, encode, InsertUndo, ModifyUndo, PriorSys, RenameUndo,
    TableUndo, UndoHeader, UndoKind, UndoRecord, UpdateField, UpdateVector,
};
pub use store::{UndoLog, UndoLogEntry, UndoStore, UndoStoreMetricsSnapshot, DEFAULT_UNDO_PAGE_SIZE};
