//! Replicated state machine key-value store
//!
//! A key-value map whose writes are ordered by an external consensus log.
//! Committed entries are applied deterministically on every replica; the
//! state can be captured and restored as a snapshot for log compaction.

pub mod api;
pub mod core;
pub mod replication;
pub mod state_machine;
pub mod storage;

/// Testing utilities for integration tests.
pub mod testing;
