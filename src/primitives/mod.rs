//! Low-level primitives shared by the undo and version layers.

/// Varint and buffer helpers used by the undo record codec.
pub mod bytes;

/// Bounded retry of operations that can transiently run out of space.
pub mod retry;
