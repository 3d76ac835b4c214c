//! Yahoo Finance market-data source.
//!
//! Fetches daily bars from Yahoo's v8 chart API, one HTTP request per
//! symbol. Multi-symbol calls fan out over a rayon pool and assemble a
//! nested response; symbols Yahoo does not know are simply absent.
//!
//! No retries happen here: the batch orchestrator owns retry and salvage.

use super::provider::{BarResponse, MarketDataSource, SourceError};
use crate::domain::RawBar;
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Symbols accepted by one `fetch_bars` call.
pub const MAX_SYMBOLS_PER_CALL: usize = 200;

const BASE_URL: &str = "https://query2.finance.yahoo.com/v8/finance/chart";

/// Top-level chart envelope: either results or an error object.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

/// Outcome of a single-symbol chart request.
enum ChartFetch {
    Bars(Vec<RawBar>),
    NotFound,
}

pub struct YahooProvider {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl YahooProvider {
    pub fn new() -> Result<Self, SourceError> {
        Self::with_base_url(BASE_URL)
    }

    /// Point the provider at a different chart endpoint (mirrors, proxies).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| SourceError::NetworkUnreachable(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn chart_url(&self, symbol: &str, start: NaiveDate, end_exclusive: NaiveDate) -> String {
        let start_ts = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        let end_ts = end_exclusive
            .and_time(chrono::NaiveTime::MIN)
            .and_utc()
            .timestamp();
        format!(
            "{}/{symbol}?period1={start_ts}&period2={end_ts}&interval=1d&includeAdjustedClose=true",
            self.base_url
        )
    }

    fn fetch_one(
        &self,
        symbol: &str,
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> Result<ChartFetch, SourceError> {
        let url = self.chart_url(symbol, start, end_exclusive);
        let resp = self.client.get(&url).send().map_err(|e| {
            SourceError::NetworkUnreachable(format!("{symbol}: {e}"))
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(SourceError::RateLimited { retry_after_secs });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(ChartFetch::NotFound);
        }
        if status.is_server_error() {
            return Err(SourceError::ServerError {
                status: status.as_u16(),
                message: format!("chart request for {symbol}"),
            });
        }
        if !status.is_success() {
            return Err(SourceError::Rejected(format!("HTTP {status} for {symbol}")));
        }

        let chart: ChartResponse = resp.json().map_err(|e| {
            SourceError::ResponseFormatChanged(format!("failed to parse response for {symbol}: {e}"))
        })?;
        parse_response(chart)
    }
}

/// Parse the chart API response into raw bars.
///
/// Timestamps with every field missing (holidays) are skipped; partially
/// missing fields are kept as `None` and filtered downstream.
fn parse_response(resp: ChartResponse) -> Result<ChartFetch, SourceError> {
    let Some(result) = resp.chart.result else {
        return match resp.chart.error {
            Some(err) if err.code == "Not Found" => Ok(ChartFetch::NotFound),
            Some(err) => Err(SourceError::ResponseFormatChanged(format!(
                "{}: {}",
                err.code, err.description
            ))),
            None => Err(SourceError::ResponseFormatChanged(
                "empty result with no error".into(),
            )),
        };
    };

    let Some(data) = result.into_iter().next() else {
        return Ok(ChartFetch::NotFound);
    };
    // No timestamps: the symbol exists but has no bars in the window.
    let Some(timestamps) = data.timestamp else {
        return Ok(ChartFetch::Bars(Vec::new()));
    };

    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::ResponseFormatChanged("no quote data".into()))?;
    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose);

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| SourceError::ResponseFormatChanged(format!("invalid timestamp: {ts}")))?;

        let close = quote.close.get(i).copied().flatten();
        let volume = quote.volume.get(i).copied().flatten();
        let adj_close = adj_closes.as_ref().and_then(|v| v.get(i).copied().flatten());

        if close.is_none() && volume.is_none() && adj_close.is_none() {
            continue;
        }
        bars.push(RawBar {
            date,
            adj_close,
            close,
            volume,
        });
    }
    Ok(ChartFetch::Bars(bars))
}

impl MarketDataSource for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn max_symbols_per_call(&self) -> usize {
        MAX_SYMBOLS_PER_CALL
    }

    fn fetch_bars(
        &self,
        provider_symbols: &[String],
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> Result<BarResponse, SourceError> {
        if let [only] = provider_symbols {
            return match self.fetch_one(only, start, end_exclusive)? {
                ChartFetch::Bars(bars) => Ok(BarResponse::Flat(bars)),
                ChartFetch::NotFound => Ok(BarResponse::Flat(Vec::new())),
            };
        }

        let results: Vec<(&String, Result<ChartFetch, SourceError>)> = provider_symbols
            .par_iter()
            .map(|symbol| (symbol, self.fetch_one(symbol, start, end_exclusive)))
            .collect();
        assemble(results)
    }
}

/// Build a nested response from per-symbol results.
///
/// Individual failures leave the symbol absent. When every symbol failed
/// the call as a whole failed, and the first error is returned so the
/// caller can classify it.
fn assemble(results: Vec<(&String, Result<ChartFetch, SourceError>)>) -> Result<BarResponse, SourceError> {
    let total = results.len();
    let mut tables = BTreeMap::new();
    let mut first_error = None;
    let mut failed = 0;

    for (symbol, result) in results {
        match result {
            Ok(ChartFetch::Bars(bars)) if !bars.is_empty() => {
                tables.insert(symbol.clone(), bars);
            }
            Ok(_) => debug!(%symbol, "no bars"),
            Err(e) => {
                warn!(%symbol, error = %e, "chart request failed");
                failed += 1;
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) if failed == total => Err(e),
        _ => Ok(BarResponse::Nested(tables)),
    }
}
