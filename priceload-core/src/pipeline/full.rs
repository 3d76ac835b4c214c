//! Full-history build: resolve, fetch batch by batch with checkpoints,
//! stitch, write the merged output and the failure report, then upsert.
//!
//! Resumable: batches with a readable checkpoint are skipped, so an
//! interrupted run picks up at the first incomplete batch. An unreadable
//! checkpoint is quarantined and its batch fetched again.

use super::cancelled;
use crate::config::IngestConfig;
use crate::data::batch::{BatchFetcher, DateWindow};
use crate::data::checkpoint::CheckpointStore;
use crate::data::failures::{self, FailureLog};
use crate::data::provider::{MarketDataSource, PriceRecord, PriceStore, ReferenceSource};
use crate::data::retry::{BatchOutcome, RetryingFetcher};
use crate::data::stitch;
use crate::data::universe::{resolve_universe, UniverseRequest};
use crate::data::upsert::UpsertWriter;
use crate::error::IngestError;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

/// What a full-history run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub symbols: usize,
    pub batches_total: usize,
    /// Batches skipped because a checkpoint already existed.
    pub batches_skipped: usize,
    pub batches_bulk: usize,
    pub batches_salvaged: usize,
    pub batches_failed: usize,
    pub rows_stitched: usize,
    /// `None` when no store was configured.
    pub rows_upserted: Option<usize>,
    /// Failed symbols with no rows in the stitched output, sorted.
    pub unavailable: Vec<String>,
    /// Stopped at a batch boundary; nothing was stitched or written.
    pub cancelled: bool,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        !self.cancelled && self.batches_failed == 0 && self.unavailable.is_empty()
    }
}

pub struct FullHistoryPipeline<'a> {
    reference: &'a dyn ReferenceSource,
    market: &'a dyn MarketDataSource,
    config: &'a IngestConfig,
    store: Option<&'a dyn PriceStore>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> FullHistoryPipeline<'a> {
    pub fn new(
        reference: &'a dyn ReferenceSource,
        market: &'a dyn MarketDataSource,
        config: &'a IngestConfig,
    ) -> Self {
        Self {
            reference,
            market,
            config,
            store: None,
            cancel: None,
        }
    }

    /// Upsert the stitched result into `store` after writing the merged file.
    pub fn with_store(mut self, store: &'a dyn PriceStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Stop before the next batch once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn run(&self, request: &UniverseRequest, window: DateWindow) -> Result<RunSummary, IngestError> {
        let universe = resolve_universe(self.reference, request, self.config.universe.page_size)?;
        let fetcher = BatchFetcher::new(self.market, &universe, self.config.fetch.batch_size);
        let retrying = RetryingFetcher::new(&fetcher, self.config.retry_policy());
        let checkpoints = CheckpointStore::new(&self.config.paths.checkpoint_dir);
        let batches = fetcher.batches();

        let mut summary = RunSummary {
            symbols: universe.len(),
            batches_total: batches.len(),
            ..RunSummary::default()
        };
        let mut failures = FailureLog::new();

        info!(
            source = fetcher.source_name(),
            symbols = universe.len(),
            batches = batches.len(),
            batch_size = fetcher.batch_size(),
            start = %window.start(),
            end = %window.end(),
            "full-history run starting"
        );

        for batch in &batches {
            if cancelled(self.cancel) {
                warn!(batch = batch.index, "cancelled; remaining batches skipped");
                summary.cancelled = true;
                return Ok(summary);
            }
            if checkpoints.verify(batch.index)? {
                info!(batch = batch.index, "checkpoint exists; skipping");
                summary.batches_skipped += 1;
                continue;
            }

            let outcome = retrying.fetch_batch(batch, window);
            failures.extend(outcome.unavailable().iter().cloned());
            match outcome {
                BatchOutcome::Bulk { rows, .. } => {
                    checkpoints.write(batch.index, &rows)?;
                    summary.batches_bulk += 1;
                }
                BatchOutcome::Salvaged { rows, .. } => {
                    checkpoints.write(batch.index, &rows)?;
                    summary.batches_salvaged += 1;
                }
                BatchOutcome::Failed { last_error, .. } => {
                    let err = IngestError::BatchFetchFailure {
                        batch: batch.index,
                        source: last_error,
                    };
                    warn!(error = %err, "no checkpoint written; batch will be retried next run");
                    summary.batches_failed += 1;
                }
            }
        }

        let loaded = checkpoints.load_all()?;
        for index in loaded.quarantined {
            warn!(batch = index, "checkpoint unreadable at stitch time; batch will be refetched next run");
            summary.batches_failed += 1;
            if let Some(batch) = batches.get(index) {
                failures.extend(batch.provider_symbols.iter().map(|s| fetcher.canonical_symbol(s)));
            }
        }
        let bars = stitch::stitch(loaded.rows, self.config.metrics.addv_window);
        summary.rows_stitched = bars.len();
        stitch::write_merged(&self.config.paths.output, &bars)?;

        let present: HashSet<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();
        summary.unavailable = failures.unresolved(&present);
        if !summary.unavailable.is_empty() {
            failures::write_report(&self.config.paths.failures, &summary.unavailable)?;
        }

        if let Some(store) = self.store {
            let records: Vec<PriceRecord> = bars.iter().map(PriceRecord::from_bar).collect();
            let report = UpsertWriter::new(store, self.config.store.upsert_chunk).write(&records)?;
            summary.rows_upserted = Some(report.rows_written);
        }

        info!(
            batches = summary.batches_total,
            skipped = summary.batches_skipped,
            bulk = summary.batches_bulk,
            salvaged = summary.batches_salvaged,
            failed = summary.batches_failed,
            rows = summary.rows_stitched,
            unavailable = summary.unavailable.len(),
            "full-history run complete"
        );
        Ok(summary)
    }
}
