//! Failed-symbol accumulation and the reconciled failure report.

use crate::error::IngestError;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use tracing::info;

/// Symbols that produced no data at some point during a run.
///
/// A symbol can fail in one batch attempt and still end up with rows (for
/// example from a checkpoint of an earlier run), so the report is
/// reconciled against the stitched output before it is written.
#[derive(Debug, Clone, Default)]
pub struct FailureLog {
    symbols: Vec<String>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, symbol: impl Into<String>) {
        self.symbols.push(symbol.into());
    }

    pub fn extend<I, S>(&mut self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols.extend(symbols.into_iter().map(Into::into));
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Failed symbols absent from `present`, sorted and unique.
    pub fn unresolved(&self, present: &HashSet<&str>) -> Vec<String> {
        self.symbols
            .iter()
            .filter(|s| !present.contains(s.as_str()))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Write a single-column CSV (`symbol`) of unresolved symbols.
pub fn write_report(path: &Path, symbols: &[String]) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| IngestError::Report(format!("create {}: {e}", parent.display())))?;
    }
    let mut writer =
        csv::Writer::from_path(path).map_err(|e| IngestError::Report(format!("open: {e}")))?;
    writer
        .write_record(["symbol"])
        .map_err(|e| IngestError::Report(e.to_string()))?;
    for symbol in symbols {
        writer
            .write_record([symbol])
            .map_err(|e| IngestError::Report(e.to_string()))?;
    }
    writer.flush().map_err(|e| IngestError::Report(e.to_string()))?;

    info!(path = %path.display(), symbols = symbols.len(), "failure report written");
    Ok(())
}
