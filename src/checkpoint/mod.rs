//! Checkpoint module for resumable annotation runs.
//!
//! Provides:
//! - `CheckpointStore`: load/save of the results snapshot
//! - `merge_snapshot`: natural-key merge of prior progress into source rows
//! - `FlushGuard`: final flush on every exit path

mod guard;
mod store;

pub use guard::*;
pub use store::*;
