//! Execution context: state keys and immutable snapshots.

mod keys;
mod snapshot;

pub use keys::{ForkData, StateKey};
pub use snapshot::{ExecutionContext, PipelineParameter, GLOBAL_LINKS_KEY};
