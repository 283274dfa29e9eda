#![forbid(unsafe_code)]
//! Identifier newtypes and the crate-wide error type.

use std::fmt;

pub mod checksum;

/// Transaction identifier stored in `DB_TRX_ID`.
///
/// Identifier zero is written by purge once a row's history is no longer
/// observable; every read view treats it as visible.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TrxId(pub u64);
/// Commit serialisation number assigned when a transaction commits.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TrxNo(pub u64);
/// Table identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TableId(pub u64);
/// Index identifier, unique across all tables.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IndexId(pub u64);
/// Position of an undo record inside its transaction's undo log (oldest first).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct UndoNo(pub u64);

impl TrxId {
    /// Identifier written by purge after history reset.
    pub const RESET: TrxId = TrxId(0);

    /// Returns `true` for the history-reset identifier.
    pub const fn is_reset(self) -> bool {
        self.0 == 0
    }
}

impl UndoNo {
    /// Returns the following undo number.
    pub const fn next(self) -> UndoNo {
        UndoNo(self.0 + 1)
    }
}

/// Errors surfaced by the undo, version, purge and rollback layers.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("not found")]
    NotFound,
    /// A roll pointer could not be dereferenced, or the record it names is unusable.
    #[error("missing history at roll pointer {roll_ptr:#x}")]
    MissingHistory {
        /// Raw roll pointer that failed to resolve.
        roll_ptr: u64,
    },
    /// An index needs a virtual column value that neither undo nor the evaluator can supply.
    #[error("virtual column {vcol} of table {table} unavailable")]
    VirtualColumnUnavailable {
        /// Owning table.
        table: TableId,
        /// Virtual column number.
        vcol: u16,
    },
    #[error("index page out of space")]
    OutOfSpace,
    /// Bounded retry gave up; the caller must treat this as fatal.
    #[error("retry exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
    #[error("configuration: {0}")]
    Config(String),
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, SombraError>;

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TrxNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UndoNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TrxId {
    fn from(value: u64) -> Self {
        TrxId(value)
    }
}

impl From<TrxId> for u64 {
    fn from(value: TrxId) -> Self {
        value.0
    }
}

impl From<u64> for TableId {
    fn from(value: u64) -> Self {
        TableId(value)
    }
}

impl From<u64> for IndexId {
    fn from(value: u64) -> Self {
        IndexId(value)
    }
}
