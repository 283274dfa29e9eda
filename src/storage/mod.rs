//! Row-version storage: undo records, version chains, purge and rollback.
//!
//! The [`Engine`] ties an undo store, the transaction system and the purge
//! history queue to external collaborators (index trees, table catalog,
//! external storage, virtual column evaluation), which are consumed through
//! traits and shipped here with in-memory implementations.

/// Row writer producing undo records.
mod dml;
/// Engine facade and read paths.
pub mod engine;
/// External storage for long column values.
pub mod extern_store;
/// Index tree interface and the in-memory index store.
pub mod index;
/// Metrics hooks for version walks, purge and rollback.
pub mod metrics;
/// Engine configuration.
pub mod options;
/// History purge and the background purge worker.
pub mod purge;
/// Transaction rollback.
mod rollback;
/// Roll pointer encoding.
pub mod roll_ptr;
/// Column values and row images.
pub mod row;
/// Table and index definitions, and the table catalog.
pub mod schema;
/// Transactions, read views and the transaction system.
pub mod trx;
/// Undo record format, undo store and history queue.
pub mod undo;
/// Virtual column evaluation.
pub mod vcol;
/// Version chain reconstruction.
pub mod version;

pub use engine::{Collaborators, Engine, EngineStats, MemParts};
pub use extern_store::{ExternStoreStats, ExternalStorage, MemExternStore};
pub use index::{
    ClusteredRec, DeleteOutcome, IndexCursor, IndexRecord, IndexStore, LatchMode, MemIndexStore,
    SecondaryRec,
};
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, UndoMetrics};
pub use options::{EngineOptions, PurgeCfg, RetryCfg};
pub use purge::{ClusteredPurge, PurgeStats, PurgeWorker, SecondaryPurge};
pub use roll_ptr::RollPtr;
pub use row::{Collation, Datum, ExternField, ExternRef, Row};
pub use schema::{
    FieldRef, IndexDef, IndexField, IndexKind, IndexState, MemCatalog, TableCatalog, TableSchema,
    TableSchemaBuilder,
};
pub use trx::{
    ActiveTransactionRef, ReadView, Savepoint, Transaction, TransactionRegistry, TrxState, TrxSys,
    TrxSysSnapshot,
};
pub use undo::{HistoryEntry, HistoryQueue, UndoLog, UndoRecord, UndoStore};
pub use vcol::{FnEvaluator, NoVirtualColumns, SchemaContext, VirtualColumnEvaluator};
pub use version::{Version, VersionBuilder, DEFAULT_MAX_VERSION_STEPS};
