//! Incremental updates: the latest trading day, or an arbitrary window.
//!
//! No checkpoints. Rows for every batch are collected, de-duplicated and
//! upserted in one pass at the end.

use super::cancelled;
use crate::config::IngestConfig;
use crate::data::batch::{BatchFetcher, DateWindow};
use crate::data::failures::FailureLog;
use crate::data::provider::{BarResponse, MarketDataSource, PriceRecord, PriceStore, ReferenceSource};
use crate::data::retry::RetryingFetcher;
use crate::data::stitch::dedup_sorted;
use crate::data::universe::{resolve_universe, UniverseRequest};
use crate::data::upsert::UpsertWriter;
use crate::domain::provider_symbol_fallback;
use crate::error::IngestError;
use chrono::{Duration, NaiveDate};
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

/// Latest date with a usable close for `probe_symbol` in the `probe_days`
/// calendar days ending `today`; yesterday when the probe finds nothing.
pub fn last_trading_day(
    market: &dyn MarketDataSource,
    probe_symbol: &str,
    probe_days: u32,
    today: NaiveDate,
) -> NaiveDate {
    let yesterday = today - Duration::days(1);
    let start = today - Duration::days(i64::from(probe_days.max(1)) - 1);
    let provider_symbol = provider_symbol_fallback(probe_symbol);

    let latest = match market.fetch_bars(
        std::slice::from_ref(&provider_symbol),
        start,
        today + Duration::days(1),
    ) {
        Ok(BarResponse::Flat(bars)) => bars
            .into_iter()
            .filter(|b| b.close.is_some_and(f64::is_finite) && b.date <= today)
            .map(|b| b.date)
            .max(),
        Ok(BarResponse::Nested(mut tables)) => tables
            .remove(&provider_symbol)
            .unwrap_or_default()
            .into_iter()
            .filter(|b| b.close.is_some_and(f64::is_finite) && b.date <= today)
            .map(|b| b.date)
            .max(),
        Err(e) => {
            warn!(probe = probe_symbol, error = %e, "trading-day probe failed");
            None
        }
    };

    match latest {
        Some(day) => {
            info!(probe = probe_symbol, %day, "last trading day");
            day
        }
        None => {
            warn!(probe = probe_symbol, fallback = %yesterday, "probe returned no bars; using yesterday");
            yesterday
        }
    }
}

/// What an incremental update did.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub window: DateWindow,
    pub symbols: usize,
    pub batches_failed: usize,
    /// Complete, de-duplicated rows ready for the store.
    pub rows_prepared: usize,
    pub rows_upserted: usize,
    /// Symbols that produced no rows, sorted.
    pub unavailable: Vec<String>,
    pub dry_run: bool,
    pub cancelled: bool,
}

pub struct IncrementalUpdater<'a> {
    reference: &'a dyn ReferenceSource,
    market: &'a dyn MarketDataSource,
    store: &'a dyn PriceStore,
    config: &'a IngestConfig,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> IncrementalUpdater<'a> {
    pub fn new(
        reference: &'a dyn ReferenceSource,
        market: &'a dyn MarketDataSource,
        store: &'a dyn PriceStore,
        config: &'a IngestConfig,
    ) -> Self {
        Self {
            reference,
            market,
            store,
            config,
            cancel: None,
        }
    }

    /// Stop before the next batch once `flag` is set; nothing is written.
    pub fn with_cancel_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Fetch and upsert the most recent trading day.
    pub fn run_daily(&self, request: &UniverseRequest, today: NaiveDate) -> Result<UpdateReport, IngestError> {
        let day = last_trading_day(
            self.market,
            &self.config.fetch.probe_symbol,
            self.config.fetch.probe_days,
            today,
        );
        self.run_range(request, DateWindow::single(day), false)
    }

    /// Fetch `window` for the universe and upsert it, unless `dry_run`.
    pub fn run_range(
        &self,
        request: &UniverseRequest,
        window: DateWindow,
        dry_run: bool,
    ) -> Result<UpdateReport, IngestError> {
        let universe = resolve_universe(self.reference, request, self.config.universe.page_size)?;
        let fetcher = BatchFetcher::new(self.market, &universe, self.config.fetch.batch_size);
        let retrying = RetryingFetcher::new(&fetcher, self.config.retry_policy());
        let batches = fetcher.batches();

        info!(
            symbols = universe.len(),
            batches = batches.len(),
            start = %window.start(),
            end = %window.end(),
            dry_run,
            "incremental update starting"
        );

        let mut report = UpdateReport {
            window,
            symbols: universe.len(),
            batches_failed: 0,
            rows_prepared: 0,
            rows_upserted: 0,
            unavailable: Vec::new(),
            dry_run,
            cancelled: false,
        };
        let mut failures = FailureLog::new();
        let mut rows = Vec::new();

        for batch in &batches {
            if cancelled(self.cancel) {
                warn!(batch = batch.index, "cancelled; nothing written");
                report.cancelled = true;
                return Ok(report);
            }
            let outcome = retrying.fetch_batch(batch, window);
            failures.extend(outcome.unavailable().iter().cloned());
            if !outcome.is_complete() {
                report.batches_failed += 1;
            }
            info!(
                batch = batch.index + 1,
                total = batches.len(),
                rows = outcome.rows().len(),
                "batch fetched"
            );
            rows.extend(outcome.into_rows());
        }

        let rows = dedup_sorted(rows);
        let present: HashSet<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
        report.unavailable = failures.unresolved(&present);
        report.rows_prepared = rows.len();

        if dry_run {
            info!(rows = rows.len(), "dry run; no write performed");
            return Ok(report);
        }
        if rows.is_empty() {
            warn!("no rows prepared; nothing to upsert");
            return Ok(report);
        }

        let records: Vec<PriceRecord> = rows.iter().map(PriceRecord::from_row).collect();
        let written = UpsertWriter::new(self.store, self.config.store.upsert_chunk).write(&records)?;
        report.rows_upserted = written.rows_written;
        Ok(report)
    }
}
