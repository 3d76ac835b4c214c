//! In-memory price store keyed on (symbol, date).
//!
//! Used by dry runs that still want a store, and by tests to check
//! idempotence without a network.

use super::provider::{PriceRecord, PriceStore, SourceError};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<(String, String), PriceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored record for a key, if any.
    pub fn get(&self, symbol: &str, date: NaiveDate) -> Option<PriceRecord> {
        let key = (symbol.to_string(), date.format("%Y-%m-%d").to_string());
        self.rows.lock().ok()?.get(&key).cloned()
    }

    /// All records in key order.
    pub fn records(&self) -> Vec<PriceRecord> {
        self.rows
            .lock()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned() -> SourceError {
    SourceError::Rejected("memory store lock poisoned".into())
}

impl PriceStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn upsert(&self, records: &[PriceRecord]) -> Result<(), SourceError> {
        let mut rows = self.rows.lock().map_err(|_| poisoned())?;
        for record in records {
            rows.insert((record.symbol.clone(), record.date.clone()), record.clone());
        }
        Ok(())
    }

    fn query_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        columns: &[&str],
    ) -> Result<Vec<Value>, SourceError> {
        // ISO dates order lexicographically.
        let (start, end) = (
            start.format("%Y-%m-%d").to_string(),
            end.format("%Y-%m-%d").to_string(),
        );
        let rows = self.rows.lock().map_err(|_| poisoned())?;
        let mut out = Vec::new();
        for record in rows.values().filter(|r| start <= r.date && r.date <= end) {
            let Value::Object(full) = serde_json::to_value(record)
                .map_err(|e| SourceError::ResponseFormatChanged(e.to_string()))?
            else {
                continue;
            };
            let projected: Map<String, Value> = full
                .into_iter()
                .filter(|(key, _)| columns.is_empty() || columns.contains(&key.as_str()))
                .collect();
            out.push(Value::Object(projected));
        }
        Ok(out)
    }
}
