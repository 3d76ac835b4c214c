//! Retry orchestration: bounded bulk retries per batch, then per-symbol salvage.
//!
//! A bulk call is fast but fails atomically for the whole batch. When the
//! retry ceiling is exhausted every symbol is refetched on its own, in order,
//! with a short pause between calls, which isolates exactly which symbols are
//! unavailable. A bulk call that succeeds but leaves symbols without a
//! complete row gets the same per-symbol pass for just those symbols before
//! the batch is reported. Backoff sleeps block the caller; nothing here is
//! cancellable mid-batch.

use super::batch::{Batch, BatchFetcher, DateWindow};
use super::provider::SourceError;
use crate::domain::PriceRow;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

/// Bulk retry ceiling and pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Bulk attempts before salvage (at least 1).
    pub max_attempts: u32,
    /// Fixed sleep between bulk attempts.
    pub backoff: Duration,
    /// Sleep between individual salvage calls.
    pub salvage_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(20),
            salvage_delay: Duration::from_millis(100),
        }
    }
}

/// How a batch resolved.
#[derive(Debug)]
pub enum BatchOutcome {
    /// A bulk attempt succeeded.
    Bulk {
        rows: Vec<PriceRow>,
        attempts: u32,
        /// Symbols missing from the bulk response that a single-symbol call
        /// recovered.
        recovered: usize,
        /// Symbols left without a complete row after the single-symbol pass.
        unavailable: Vec<String>,
    },
    /// Bulk attempts were exhausted; per-symbol salvage recovered some rows.
    Salvaged {
        rows: Vec<PriceRow>,
        unavailable: Vec<String>,
    },
    /// Neither bulk nor salvage produced a usable row.
    Failed {
        unavailable: Vec<String>,
        last_error: SourceError,
    },
}

impl BatchOutcome {
    /// Bulk and salvage outcomes complete the batch (and get checkpointed).
    pub fn is_complete(&self) -> bool {
        !matches!(self, BatchOutcome::Failed { .. })
    }

    pub fn rows(&self) -> &[PriceRow] {
        match self {
            BatchOutcome::Bulk { rows, .. } | BatchOutcome::Salvaged { rows, .. } => rows,
            BatchOutcome::Failed { .. } => &[],
        }
    }

    pub fn into_rows(self) -> Vec<PriceRow> {
        match self {
            BatchOutcome::Bulk { rows, .. } | BatchOutcome::Salvaged { rows, .. } => rows,
            BatchOutcome::Failed { .. } => Vec::new(),
        }
    }

    /// Symbols to record as failures.
    pub fn unavailable(&self) -> &[String] {
        match self {
            BatchOutcome::Bulk { unavailable, .. }
            | BatchOutcome::Salvaged { unavailable, .. }
            | BatchOutcome::Failed { unavailable, .. } => unavailable,
        }
    }
}

/// Drives one batch through bulk retries and salvage.
pub struct RetryingFetcher<'a> {
    fetcher: &'a BatchFetcher<'a>,
    policy: RetryPolicy,
}

impl<'a> RetryingFetcher<'a> {
    pub fn new(fetcher: &'a BatchFetcher<'a>, policy: RetryPolicy) -> Self {
        Self { fetcher, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Resolve `batch` completely: bulk attempts, then salvage if needed.
    pub fn fetch_batch(&self, batch: &Batch, window: DateWindow) -> BatchOutcome {
        let symbols = &batch.provider_symbols;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.fetcher.fetch(symbols, window) {
                Ok(rows) => {
                    let mut rows: Vec<PriceRow> = rows.into_iter().filter(PriceRow::is_complete).collect();
                    let missing = symbols_without_rows(self.fetcher, symbols, &rows);
                    info!(
                        batch = batch.index,
                        attempt,
                        rows = rows.len(),
                        missing = missing.len(),
                        "bulk fetch ok"
                    );
                    let mut recovered = 0;
                    let mut unavailable = Vec::new();
                    if !missing.is_empty() {
                        let pass = self.fetch_individually(batch.index, &missing, window);
                        recovered = missing.len() - pass.unavailable.len();
                        rows.extend(pass.rows);
                        unavailable = pass.unavailable;
                    }
                    return BatchOutcome::Bulk {
                        rows,
                        attempts: attempt,
                        recovered,
                        unavailable,
                    };
                }
                Err(e) => {
                    warn!(
                        batch = batch.index,
                        attempt,
                        max_attempts,
                        error = %e,
                        "bulk fetch failed"
                    );
                    let transient = e.is_transient();
                    last_error = Some(e);
                    if !transient {
                        break;
                    }
                    if attempt < max_attempts {
                        sleep(self.policy.backoff);
                    }
                }
            }
        }

        let bulk_error = last_error
            .unwrap_or_else(|| SourceError::Rejected("bulk fetch made no attempt".into()));
        self.salvage(batch, window, bulk_error)
    }

    /// Refetch each symbol on its own, sequentially.
    fn salvage(&self, batch: &Batch, window: DateWindow, bulk_error: SourceError) -> BatchOutcome {
        info!(
            batch = batch.index,
            symbols = batch.provider_symbols.len(),
            "entering salvage mode"
        );

        let pass = self.fetch_individually(batch.index, &batch.provider_symbols, window);
        if pass.rows.is_empty() {
            warn!(
                batch = batch.index,
                "salvage recovered nothing; batch marked failed"
            );
            return BatchOutcome::Failed {
                unavailable: pass.unavailable,
                last_error: pass.last_error.unwrap_or(bulk_error),
            };
        }

        info!(
            batch = batch.index,
            rows = pass.rows.len(),
            unavailable = pass.unavailable.len(),
            "salvage complete"
        );
        BatchOutcome::Salvaged {
            rows: pass.rows,
            unavailable: pass.unavailable,
        }
    }

    /// One call per provider symbol with a pause between calls. Symbols with
    /// no complete row, or whose call failed, are reported by canonical name.
    fn fetch_individually(&self, index: usize, provider_symbols: &[String], window: DateWindow) -> SinglePass {
        let mut pass = SinglePass::default();
        for (i, symbol) in provider_symbols.iter().enumerate() {
            if i > 0 {
                sleep(self.policy.salvage_delay);
            }
            match self.fetcher.fetch(std::slice::from_ref(symbol), window) {
                Ok(symbol_rows) => {
                    let complete: Vec<PriceRow> =
                        symbol_rows.into_iter().filter(PriceRow::is_complete).collect();
                    if complete.is_empty() {
                        pass.unavailable.push(self.fetcher.canonical_symbol(symbol));
                    } else {
                        pass.rows.extend(complete);
                    }
                }
                Err(e) => {
                    warn!(batch = index, %symbol, error = %e, "single-symbol fetch failed");
                    pass.unavailable.push(self.fetcher.canonical_symbol(symbol));
                    pass.last_error = Some(e);
                }
            }
        }
        pass
    }
}

#[derive(Default)]
struct SinglePass {
    rows: Vec<PriceRow>,
    unavailable: Vec<String>,
    last_error: Option<SourceError>,
}

/// Provider symbols requested in this batch that have no row in `rows`.
fn symbols_without_rows(
    fetcher: &BatchFetcher<'_>,
    requested: &[String],
    rows: &[PriceRow],
) -> Vec<String> {
    let present: HashSet<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
    requested
        .iter()
        .filter(|provider_symbol| !present.contains(fetcher.canonical_symbol(provider_symbol).as_str()))
        .cloned()
        .collect()
}

fn sleep(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::{BarResponse, MarketDataSource};
    use crate::data::universe::Universe;
    use crate::domain::{RawBar, Ticker};
    use chrono::NaiveDate;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    fn universe(symbols: &[&str]) -> Universe {
        Universe::from_members(symbols.iter().map(|s| Ticker::new(*s).resolve()))
    }

    fn no_wait(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::ZERO,
            salvage_delay: Duration::ZERO,
        }
    }

    /// Scripted source: bulk calls fail `bulk_failures` times; `broken`
    /// symbols always fail individually; `empty` symbols return no bars;
    /// `dropped` symbols are missing from bulk responses only; `incomplete`
    /// symbols return bars without an adjusted close.
    struct Scripted {
        bulk_failures: usize,
        bulk_error_transient: bool,
        broken: HashSet<String>,
        empty: HashSet<String>,
        dropped: HashSet<String>,
        incomplete: HashSet<String>,
        bulk_calls: AtomicUsize,
        single_calls: AtomicUsize,
    }

    impl Scripted {
        fn new(bulk_failures: usize) -> Self {
            Self {
                bulk_failures,
                bulk_error_transient: true,
                broken: HashSet::new(),
                empty: HashSet::new(),
                dropped: HashSet::new(),
                incomplete: HashSet::new(),
                bulk_calls: AtomicUsize::new(0),
                single_calls: AtomicUsize::new(0),
            }
        }

        fn bars(&self, symbol: &str) -> Vec<RawBar> {
            let mut bar = RawBar::new(d(19), 10.0, 10.0, 100.0);
            if self.incomplete.contains(symbol) {
                bar.adj_close = None;
            }
            vec![bar]
        }
    }

    impl MarketDataSource for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn max_symbols_per_call(&self) -> usize {
            100
        }

        fn fetch_bars(
            &self,
            provider_symbols: &[String],
            _start: NaiveDate,
            _end_exclusive: NaiveDate,
        ) -> Result<BarResponse, SourceError> {
            if provider_symbols.len() > 1 {
                let n = self.bulk_calls.fetch_add(1, Ordering::SeqCst);
                if n < self.bulk_failures {
                    return Err(if self.bulk_error_transient {
                        SourceError::NetworkUnreachable("timeout".into())
                    } else {
                        SourceError::Rejected("bad request".into())
                    });
                }
                let tables: BTreeMap<String, Vec<RawBar>> = provider_symbols
                    .iter()
                    .filter(|s| !self.empty.contains(*s) && !self.dropped.contains(*s))
                    .map(|s| (s.clone(), self.bars(s)))
                    .collect();
                return Ok(BarResponse::Nested(tables));
            }
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            let symbol = &provider_symbols[0];
            if self.broken.contains(symbol) {
                return Err(SourceError::NetworkUnreachable("reset".into()));
            }
            if self.empty.contains(symbol) {
                return Ok(BarResponse::Flat(Vec::new()));
            }
            Ok(BarResponse::Flat(self.bars(symbol)))
        }
    }

    fn batch(uni: &Universe) -> Batch {
        Batch {
            index: 0,
            provider_symbols: uni.provider_symbols(),
        }
    }

    #[test]
    fn bulk_success_after_transient_failures() {
        let uni = universe(&["AAPL", "MSFT"]);
        let src = Scripted::new(2);
        let fetcher = BatchFetcher::new(&src, &uni, 100);
        let outcome = RetryingFetcher::new(&fetcher, no_wait(3))
            .fetch_batch(&batch(&uni), DateWindow::single(d(19)));

        match outcome {
            BatchOutcome::Bulk { rows, attempts, unavailable, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(rows.len(), 2);
                assert!(unavailable.is_empty());
            }
            other => panic!("expected bulk outcome, got {other:?}"),
        }
        assert_eq!(src.single_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn salvage_recovers_every_symbol_when_bulk_always_fails() {
        let uni = universe(&["AAPL", "MSFT", "SPY"]);
        let src = Scripted::new(usize::MAX);
        let fetcher = BatchFetcher::new(&src, &uni, 100);
        let outcome = RetryingFetcher::new(&fetcher, no_wait(3))
            .fetch_batch(&batch(&uni), DateWindow::single(d(19)));

        assert!(outcome.is_complete());
        assert!(matches!(outcome, BatchOutcome::Salvaged { .. }));
        assert_eq!(outcome.rows().len(), 3);
        assert!(outcome.unavailable().is_empty());
        assert_eq!(src.bulk_calls.load(Ordering::SeqCst), 3);
        assert_eq!(src.single_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn salvage_records_symbols_that_still_fail() {
        let uni = universe(&["AAPL", "DEAD", "GONE"]);
        let mut src = Scripted::new(usize::MAX);
        src.broken.insert("DEAD".into());
        src.empty.insert("GONE".into());
        let fetcher = BatchFetcher::new(&src, &uni, 100);
        let outcome = RetryingFetcher::new(&fetcher, no_wait(2))
            .fetch_batch(&batch(&uni), DateWindow::single(d(19)));

        assert!(matches!(outcome, BatchOutcome::Salvaged { .. }));
        assert_eq!(outcome.rows().len(), 1);
        assert_eq!(outcome.unavailable(), ["DEAD".to_string(), "GONE".to_string()]);
    }

    #[test]
    fn batch_fails_when_salvage_finds_nothing() {
        let uni = universe(&["DEAD", "GONE"]);
        let mut src = Scripted::new(usize::MAX);
        src.broken.insert("DEAD".into());
        src.empty.insert("GONE".into());
        let fetcher = BatchFetcher::new(&src, &uni, 100);
        let outcome = RetryingFetcher::new(&fetcher, no_wait(2))
            .fetch_batch(&batch(&uni), DateWindow::single(d(19)));

        assert!(!outcome.is_complete());
        assert_eq!(outcome.unavailable().len(), 2);
        assert!(outcome.rows().is_empty());
    }

    #[test]
    fn non_transient_bulk_error_skips_remaining_attempts() {
        let uni = universe(&["AAPL", "MSFT"]);
        let mut src = Scripted::new(usize::MAX);
        src.bulk_error_transient = false;
        let fetcher = BatchFetcher::new(&src, &uni, 100);
        let outcome = RetryingFetcher::new(&fetcher, no_wait(5))
            .fetch_batch(&batch(&uni), DateWindow::single(d(19)));

        assert_eq!(src.bulk_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, BatchOutcome::Salvaged { .. }));
    }

    #[test]
    fn bulk_success_reports_symbols_emptied_by_validation() {
        let uni = universe(&["AAPL", "THIN"]);
        let mut src = Scripted::new(0);
        src.empty.insert("THIN".into());
        let fetcher = BatchFetcher::new(&src, &uni, 100);
        let outcome = RetryingFetcher::new(&fetcher, no_wait(1))
            .fetch_batch(&batch(&uni), DateWindow::single(d(19)));

        assert!(matches!(outcome, BatchOutcome::Bulk { .. }));
        assert_eq!(outcome.unavailable(), ["THIN".to_string()]);
    }

    #[test]
    fn bulk_success_refetches_symbols_missing_from_the_response() {
        let uni = universe(&["AAPL", "MSFT", "SPY"]);
        let mut src = Scripted::new(0);
        src.dropped.insert("MSFT".into());
        let fetcher = BatchFetcher::new(&src, &uni, 100);
        let outcome = RetryingFetcher::new(&fetcher, no_wait(3))
            .fetch_batch(&batch(&uni), DateWindow::single(d(19)));

        match &outcome {
            BatchOutcome::Bulk { attempts, recovered, .. } => {
                assert_eq!(*attempts, 1);
                assert_eq!(*recovered, 1);
            }
            other => panic!("expected bulk outcome, got {other:?}"),
        }
        assert!(outcome.unavailable().is_empty());
        let symbols: HashSet<&str> = outcome.rows().iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, HashSet::from(["AAPL", "MSFT", "SPY"]));
        assert_eq!(src.bulk_calls.load(Ordering::SeqCst), 1);
        assert_eq!(src.single_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn incomplete_rows_leave_a_symbol_unavailable_after_bulk() {
        let uni = universe(&["AAPL", "HALF"]);
        let mut src = Scripted::new(0);
        src.incomplete.insert("HALF".into());
        let fetcher = BatchFetcher::new(&src, &uni, 100);
        let outcome = RetryingFetcher::new(&fetcher, no_wait(1))
            .fetch_batch(&batch(&uni), DateWindow::single(d(19)));

        assert!(matches!(outcome, BatchOutcome::Bulk { recovered: 0, .. }));
        assert_eq!(outcome.unavailable(), ["HALF".to_string()]);
        assert!(outcome.rows().iter().all(|r| r.symbol == "AAPL"));
    }

    #[test]
    fn incomplete_rows_leave_a_symbol_unavailable_after_salvage() {
        let uni = universe(&["AAPL", "HALF"]);
        let mut src = Scripted::new(usize::MAX);
        src.incomplete.insert("HALF".into());
        let fetcher = BatchFetcher::new(&src, &uni, 100);
        let outcome = RetryingFetcher::new(&fetcher, no_wait(2))
            .fetch_batch(&batch(&uni), DateWindow::single(d(19)));

        assert!(matches!(outcome, BatchOutcome::Salvaged { .. }));
        assert_eq!(outcome.unavailable(), ["HALF".to_string()]);
        assert_eq!(outcome.rows().len(), 1);
    }
}
