//! Contracts for the external collaborators and their structured errors.
//!
//! The pipeline only talks to the reference listing, the market-data source,
//! and the store through these traits, so adapters can be swapped and mocked
//! in tests.

use crate::domain::{RawBar, Ticker};
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Structured error types for adapter operations.
///
/// Classification is explicit: callers branch on `is_unsupported_filter` and
/// `is_transient` instead of treating every failure alike.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("filter not supported by source: {0}")]
    UnsupportedFilter(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl SourceError {
    /// Worth retrying: the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::NetworkUnreachable(_)
                | SourceError::RateLimited { .. }
                | SourceError::ServerError { .. }
        )
    }

    /// The source does not support a requested filter (capability gap, not an outage).
    pub fn is_unsupported_filter(&self) -> bool {
        matches!(self, SourceError::UnsupportedFilter(_))
    }
}

/// Server-side filters for a reference listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickerQuery {
    pub tracked_only: bool,
    pub symbols: Option<Vec<String>>,
}

/// Paginated symbol listing.
pub trait ReferenceSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch one page of tickers ordered by symbol. A page shorter than
    /// `limit` means the listing is exhausted.
    fn fetch_page(
        &self,
        query: &TickerQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Ticker>, SourceError>;
}

/// Response shapes of a bar query.
#[derive(Debug, Clone, PartialEq)]
pub enum BarResponse {
    /// Per-provider-symbol tables (multi-symbol requests).
    Nested(BTreeMap<String, Vec<RawBar>>),
    /// A single table (single-symbol requests).
    Flat(Vec<RawBar>),
}

impl BarResponse {
    pub fn bar_count(&self) -> usize {
        match self {
            BarResponse::Nested(tables) => tables.values().map(Vec::len).sum(),
            BarResponse::Flat(bars) => bars.len(),
        }
    }
}

/// Batched daily-bar source.
pub trait MarketDataSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Maximum provider symbols accepted by one `fetch_bars` call.
    fn max_symbols_per_call(&self) -> usize;

    /// Fetch daily bars for `[start, end_exclusive)`.
    ///
    /// Symbols with no data are simply absent from the response. An `Err`
    /// means the call as a whole failed.
    fn fetch_bars(
        &self,
        provider_symbols: &[String],
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> Result<BarResponse, SourceError>;
}

/// Transport-safe price record, keyed on (symbol, date).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PriceRecord {
    pub symbol: String,
    pub name: String,
    /// Calendar date, `YYYY-MM-DD`.
    pub date: String,
    pub adj_close: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
    pub dollar_volume: Option<f64>,
    pub addv_20d: Option<f64>,
}

/// Durable price store.
pub trait PriceStore: Send + Sync {
    /// Human-readable name of this store.
    fn name(&self) -> &str;

    /// Upsert records keyed on (symbol, date); conflicting rows are overwritten.
    fn upsert(&self, records: &[PriceRecord]) -> Result<(), SourceError>;

    /// Rows with `start <= date <= end`, projected to `columns`, ordered by (symbol, date).
    fn query_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        columns: &[&str],
    ) -> Result<Vec<Value>, SourceError>;
}
