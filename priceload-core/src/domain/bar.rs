//! Bar types: provider output, normalized rows, and finished price bars.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily bar as returned by a market-data source (before validation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub date: NaiveDate,
    pub adj_close: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

impl RawBar {
    pub fn new(date: NaiveDate, adj_close: f64, close: f64, volume: f64) -> Self {
        Self {
            date,
            adj_close: Some(adj_close),
            close: Some(close),
            volume: Some(volume),
        }
    }
}

/// Normalized tidy row: one symbol, one date, optional numeric fields.
///
/// `is_complete` is the validation applied at the ingestion boundary; only
/// complete rows are checkpointed, stitched, or written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub symbol: String,
    pub name: String,
    pub date: NaiveDate,
    pub adj_close: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

impl PriceRow {
    /// True when adjusted close, close and volume are all present and finite.
    pub fn is_complete(&self) -> bool {
        [self.adj_close, self.close, self.volume]
            .into_iter()
            .all(|v| v.is_some_and(f64::is_finite))
    }

    /// Close × volume, when both are present.
    pub fn dollar_volume(&self) -> Option<f64> {
        Some(self.close? * self.volume?)
    }
}

/// A stitched bar with derived liquidity metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub name: String,
    pub date: NaiveDate,
    pub adj_close: f64,
    pub close: f64,
    pub volume: f64,
    pub dollar_volume: f64,
    /// Trailing mean of `dollar_volume` over this symbol's own series.
    pub addv: f64,
}
