//! priceload core: daily equity price ingestion.
//!
//! This crate contains:
//! - Domain types (tickers, universe members, raw bars, rows, stitched bars)
//! - Contracts for the reference listing, market-data source and price store
//! - Universe resolution with pagination and client-side filtering
//! - Batch fetching with bounded retries and per-symbol salvage
//! - Per-batch Parquet checkpoints, stitching and rolling ADDV
//! - Chunked idempotent upserts
//! - The full-history and incremental run drivers

pub mod config;
pub mod data;
pub mod domain;
pub mod error;
pub mod pipeline;

pub use config::IngestConfig;
pub use error::IngestError;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: domain types and collaborator contracts are Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send + ?Sized>() {}
        fn require_sync<T: Sync + ?Sized>() {}

        // Domain types
        require_send::<domain::Ticker>();
        require_sync::<domain::Ticker>();
        require_send::<domain::UniverseMember>();
        require_sync::<domain::UniverseMember>();
        require_send::<domain::RawBar>();
        require_sync::<domain::RawBar>();
        require_send::<domain::PriceRow>();
        require_sync::<domain::PriceRow>();
        require_send::<domain::PriceBar>();
        require_sync::<domain::PriceBar>();
        require_send::<data::PriceRecord>();
        require_sync::<data::PriceRecord>();

        // Contracts
        require_send::<dyn data::ReferenceSource>();
        require_sync::<dyn data::ReferenceSource>();
        require_send::<dyn data::MarketDataSource>();
        require_sync::<dyn data::MarketDataSource>();
        require_send::<dyn data::PriceStore>();
        require_sync::<dyn data::PriceStore>();

        // Adapters
        require_send::<data::YahooProvider>();
        require_sync::<data::YahooProvider>();
        require_send::<data::PostgrestClient>();
        require_sync::<data::PostgrestClient>();
        require_send::<data::MemoryStore>();
        require_sync::<data::MemoryStore>();

        // Run state
        require_send::<data::Universe>();
        require_sync::<data::Universe>();
        require_send::<data::CheckpointStore>();
        require_sync::<data::CheckpointStore>();
        require_send::<IngestError>();
        require_sync::<IngestError>();
        require_send::<pipeline::RunSummary>();
        require_sync::<pipeline::RunSummary>();
    }
}
