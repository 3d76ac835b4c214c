//! Chunked idempotent writes to the price store.
//!
//! Records are keyed on (symbol, date), so re-running a write overwrites in
//! place. Chunks are written in order and the first failing chunk stops the
//! write; everything before it stays committed.

use super::provider::{PriceRecord, PriceStore};
use crate::domain::{PriceBar, PriceRow};
use crate::error::IngestError;
use chrono::NaiveDate;
use tracing::{debug, info};

/// Finite values only; NaN and infinities become null.
fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

impl PriceRecord {
    /// Record for a stitched bar, ADDV included.
    pub fn from_bar(bar: &PriceBar) -> Self {
        Self {
            symbol: bar.symbol.clone(),
            name: bar.name.clone(),
            date: format_date(bar.date),
            adj_close: finite(Some(bar.adj_close)),
            close: finite(Some(bar.close)),
            volume: finite(Some(bar.volume)).map(|v| v as i64),
            dollar_volume: finite(Some(bar.dollar_volume)),
            addv_20d: finite(Some(bar.addv)),
        }
    }

    /// Record for an incremental row. ADDV is left null: a short window
    /// cannot produce a meaningful trailing mean.
    pub fn from_row(row: &PriceRow) -> Self {
        Self {
            symbol: row.symbol.clone(),
            name: row.name.clone(),
            date: format_date(row.date),
            adj_close: finite(row.adj_close),
            close: finite(row.close),
            volume: finite(row.volume).map(|v| v as i64),
            dollar_volume: finite(row.dollar_volume()),
            addv_20d: None,
        }
    }
}

/// Totals of a completed write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub rows_written: usize,
    pub chunks: usize,
}

/// Splits records into fixed-size chunks and upserts them in order.
pub struct UpsertWriter<'a> {
    store: &'a dyn PriceStore,
    chunk_size: usize,
}

impl<'a> UpsertWriter<'a> {
    pub fn new(store: &'a dyn PriceStore, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn write(&self, records: &[PriceRecord]) -> Result<UpsertReport, IngestError> {
        let mut report = UpsertReport::default();
        let total_chunks = records.len().div_ceil(self.chunk_size);

        for (chunk, slice) in records.chunks(self.chunk_size).enumerate() {
            self.store
                .upsert(slice)
                .map_err(|source| IngestError::WriteFailure {
                    chunk,
                    rows_written: report.rows_written,
                    source,
                })?;
            report.rows_written += slice.len();
            report.chunks += 1;
            debug!(
                store = self.store.name(),
                chunk = chunk + 1,
                total_chunks,
                rows = slice.len(),
                "upserted chunk"
            );
        }

        info!(
            store = self.store.name(),
            rows = report.rows_written,
            chunks = report.chunks,
            "upsert complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::SourceError;
    use serde_json::Value;
    use std::sync::Mutex;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    /// Accepts chunks until `fail_on` (0-based call index).
    struct CountingStore {
        fail_on: Option<usize>,
        calls: Mutex<Vec<usize>>,
    }

    impl PriceStore for CountingStore {
        fn name(&self) -> &str {
            "counting"
        }

        fn upsert(&self, records: &[PriceRecord]) -> Result<(), SourceError> {
            let mut calls = self.calls.lock().unwrap();
            if Some(calls.len()) == self.fail_on {
                return Err(SourceError::ServerError {
                    status: 500,
                    message: "boom".into(),
                });
            }
            calls.push(records.len());
            Ok(())
        }

        fn query_range(&self, _: NaiveDate, _: NaiveDate, _: &[&str]) -> Result<Vec<Value>, SourceError> {
            Ok(Vec::new())
        }
    }

    fn records(n: usize) -> Vec<PriceRecord> {
        (0..n)
            .map(|i| PriceRecord {
                symbol: format!("S{i}"),
                name: format!("S{i}"),
                date: "2025-08-19".into(),
                adj_close: Some(1.0),
                close: Some(1.0),
                volume: Some(1),
                dollar_volume: Some(1.0),
                addv_20d: None,
            })
            .collect()
    }

    #[test]
    fn chunks_are_sized_and_ordered() {
        let store = CountingStore {
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        };
        let report = UpsertWriter::new(&store, 800).write(&records(2000)).unwrap();
        assert_eq!(report, UpsertReport { rows_written: 2000, chunks: 3 });
        assert_eq!(*store.calls.lock().unwrap(), vec![800, 800, 400]);
    }

    #[test]
    fn failure_reports_partial_progress() {
        let store = CountingStore {
            fail_on: Some(1),
            calls: Mutex::new(Vec::new()),
        };
        let err = UpsertWriter::new(&store, 800).write(&records(2000)).unwrap_err();
        match err {
            IngestError::WriteFailure { chunk, rows_written, .. } => {
                assert_eq!(chunk, 1);
                assert_eq!(rows_written, 800);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_input_writes_nothing() {
        let store = CountingStore {
            fail_on: Some(0),
            calls: Mutex::new(Vec::new()),
        };
        let report = UpsertWriter::new(&store, 800).write(&[]).unwrap();
        assert_eq!(report.rows_written, 0);
    }

    #[test]
    fn non_finite_values_become_null() {
        let bar = PriceBar {
            symbol: "AAPL".into(),
            name: "Apple Inc.".into(),
            date: d(19),
            adj_close: 230.5,
            close: f64::NAN,
            volume: 1_234_567.9,
            dollar_volume: f64::INFINITY,
            addv: 10.0,
        };
        let record = PriceRecord::from_bar(&bar);
        assert_eq!(record.date, "2025-08-19");
        assert_eq!(record.close, None);
        assert_eq!(record.dollar_volume, None);
        assert_eq!(record.volume, Some(1_234_567));
        assert_eq!(record.addv_20d, Some(10.0));
    }

    #[test]
    fn incremental_records_carry_no_addv() {
        let row = PriceRow {
            symbol: "SPY".into(),
            name: "SPDR S&P 500".into(),
            date: d(20),
            adj_close: Some(640.0),
            close: Some(640.0),
            volume: Some(10.0),
        };
        let record = PriceRecord::from_row(&row);
        assert_eq!(record.addv_20d, None);
        assert_eq!(record.dollar_volume, Some(6400.0));
    }
}
