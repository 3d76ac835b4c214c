//! Data layer: collaborator contracts, adapters, fetching, checkpoints, writes.

pub mod batch;
pub mod checkpoint;
pub mod failures;
pub mod memory;
pub mod postgrest;
pub mod provider;
pub mod retry;
pub mod stitch;
pub mod universe;
pub mod upsert;
pub mod yahoo;

pub use batch::{Batch, BatchFetcher, DateWindow};
pub use checkpoint::{CheckpointStore, LoadedCheckpoints};
pub use failures::FailureLog;
pub use memory::MemoryStore;
pub use postgrest::PostgrestClient;
pub use provider::{
    BarResponse, MarketDataSource, PriceRecord, PriceStore, ReferenceSource, SourceError,
    TickerQuery,
};
pub use retry::{BatchOutcome, RetryPolicy, RetryingFetcher};
pub use universe::{resolve_universe, Universe, UniverseRequest};
pub use upsert::{UpsertReport, UpsertWriter};
pub use yahoo::YahooProvider;
