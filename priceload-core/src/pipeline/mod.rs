//! Run drivers: the checkpointed full-history build and the incremental updates.
//!
//! Both drive the same batch fetcher and retry/salvage orchestrator; they
//! differ in what happens to a resolved batch (checkpoint vs. collect).

pub mod full;
pub mod incremental;

pub use full::{FullHistoryPipeline, RunSummary};
pub use incremental::{last_trading_day, IncrementalUpdater, UpdateReport};

use std::sync::atomic::{AtomicBool, Ordering};

/// Cancellation is honored between batches only.
fn cancelled(flag: Option<&AtomicBool>) -> bool {
    flag.is_some_and(|f| f.load(Ordering::Relaxed))
}
