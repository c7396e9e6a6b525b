//! State machine layer
//!
//! - `KvStore`: the replicated key-value map
//! - `Command`: wire-stable write commands

pub mod command;
pub mod kv;
pub mod traits;

pub use command::{CodecError, Command};
pub use kv::KvStore;
pub use traits::{Snapshotable, StateMachine};
