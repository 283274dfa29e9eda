//! Multi-version concurrency control for a transactional row store.
//!
//! Writers change the live row in place and log the previous state as an
//! undo record; readers rebuild the version their snapshot may see by
//! following roll pointers backwards. Rollback replays a transaction's undo
//! log in reverse, and purge reclaims history once no snapshot needs it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{Engine, EngineOptions};
pub use types::{Result, SombraError};
