//! Per-batch checkpoint artifacts.
//!
//! Layout: `{checkpoint_dir}/batch_{index:04}.parquet`
//!
//! - One artifact per completed batch, written right after the fetch
//! - Existence is the completion signal: an existing batch is never refetched
//! - Atomic writes (write to .tmp, rename into place)
//! - Only complete rows are persisted
//! - Corrupt artifacts are quarantined ({filename}.quarantined); `verify`
//!   does this before a batch is skipped, so the batch is refetched in the
//!   same run

use crate::domain::PriceRow;
use crate::error::IngestError;
use chrono::NaiveDate;
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PREFIX: &str = "batch_";
const EXTENSION: &str = "parquet";

/// Rows read back from the checkpoints, plus the batches that were unreadable.
#[derive(Debug, Default)]
pub struct LoadedCheckpoints {
    pub rows: Vec<PriceRow>,
    /// Indices quarantined while loading, ascending.
    pub quarantined: Vec<usize>,
}

/// Directory of batch checkpoints for one full-history run.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory of the checkpoints.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the artifact for `index`: `{dir}/batch_{index:04}.parquet`
    pub fn path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{index:04}.{EXTENSION}"))
    }

    /// Whether batch `index` already completed in this or an earlier run.
    pub fn exists(&self, index: usize) -> bool {
        self.path(index).is_file()
    }

    /// Persist the complete rows of batch `index`. Returns the rows written.
    ///
    /// A batch with no complete rows still gets an (empty) artifact so the
    /// completion is recorded.
    pub fn write(&self, index: usize, rows: &[PriceRow]) -> Result<usize, IngestError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| IngestError::Checkpoint(format!("create {}: {e}", self.dir.display())))?;

        let complete: Vec<&PriceRow> = rows.iter().filter(|r| r.is_complete()).collect();
        let df = rows_to_dataframe(&complete)?;
        write_parquet_atomic(&df, &self.path(index))?;

        debug!(batch = index, rows = complete.len(), "checkpoint written");
        Ok(complete.len())
    }

    /// Indices of all artifacts on disk, ascending.
    pub fn indices(&self) -> Result<Vec<usize>, IngestError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| IngestError::Checkpoint(format!("read dir: {e}")))?;

        let mut indices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| IngestError::Checkpoint(format!("dir entry: {e}")))?;
            if let Some(index) = parse_index(&entry.path()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Whether batch `index` has a readable artifact. An unreadable one is
    /// quarantined and reported as absent.
    pub fn verify(&self, index: usize) -> Result<bool, IngestError> {
        if !self.exists(index) {
            return Ok(false);
        }
        match read_rows(&self.path(index)) {
            Ok(_) => Ok(true),
            Err(e) => {
                self.quarantine(index, &e)?;
                Ok(false)
            }
        }
    }

    /// Rows of every artifact, concatenated in batch-index order.
    pub fn load_all(&self) -> Result<LoadedCheckpoints, IngestError> {
        let indices = self.indices()?;
        if indices.is_empty() {
            return Err(IngestError::NoCheckpoints);
        }

        let mut loaded = LoadedCheckpoints::default();
        for index in indices {
            match read_rows(&self.path(index)) {
                Ok(batch_rows) => loaded.rows.extend(batch_rows),
                Err(e) => {
                    self.quarantine(index, &e)?;
                    loaded.quarantined.push(index);
                }
            }
        }
        Ok(loaded)
    }

    /// Move an unreadable artifact aside so the batch counts as incomplete.
    fn quarantine(&self, index: usize, cause: &IngestError) -> Result<(), IngestError> {
        let path = self.path(index);
        let target = path.with_extension("parquet.quarantined");
        warn!(
            path = %path.display(),
            error = %cause,
            "quarantining corrupt checkpoint"
        );
        fs::rename(&path, &target)
            .map_err(|e| IngestError::Checkpoint(format!("quarantine {}: {e}", path.display())))
    }

    /// Rows of a single artifact.
    pub fn load(&self, index: usize) -> Result<Vec<PriceRow>, IngestError> {
        read_rows(&self.path(index))
    }
}

/// `batch_0007.parquet` → 7. Temp and quarantined files do not match.
fn parse_index(path: &Path) -> Option<usize> {
    if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(PREFIX)?
        .parse()
        .ok()
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Days since the Unix epoch, the physical representation of a polars `Date`.
pub(crate) fn to_epoch_days(date: NaiveDate) -> i32 {
    (date - epoch()).num_days() as i32
}

pub(crate) fn from_epoch_days(days: i32) -> NaiveDate {
    epoch() + chrono::Duration::days(i64::from(days))
}

pub(crate) fn date_column(name: &str, dates: Vec<i32>) -> Result<Column, IngestError> {
    Column::new(name.into(), dates)
        .cast(&DataType::Date)
        .map_err(|e| IngestError::Parquet(format!("{name} cast: {e}")))
}

/// Convert complete rows to a DataFrame (numeric fields are non-null).
fn rows_to_dataframe(rows: &[&PriceRow]) -> Result<DataFrame, IngestError> {
    let symbols: Vec<String> = rows.iter().map(|r| r.symbol.clone()).collect();
    let names: Vec<String> = rows.iter().map(|r| r.name.clone()).collect();
    let dates: Vec<i32> = rows.iter().map(|r| to_epoch_days(r.date)).collect();
    let adj_closes: Vec<f64> = rows.iter().map(|r| r.adj_close.unwrap_or(f64::NAN)).collect();
    let closes: Vec<f64> = rows.iter().map(|r| r.close.unwrap_or(f64::NAN)).collect();
    let volumes: Vec<f64> = rows.iter().map(|r| r.volume.unwrap_or(f64::NAN)).collect();

    DataFrame::new(vec![
        Column::new("symbol".into(), symbols),
        Column::new("name".into(), names),
        date_column("date", dates)?,
        Column::new("adj_close".into(), adj_closes),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| IngestError::Parquet(format!("dataframe creation: {e}")))
}

/// Write a DataFrame to `path` via a `.tmp` sibling and rename.
pub(crate) fn write_parquet_atomic(df: &DataFrame, path: &Path) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| IngestError::Parquet(format!("create {}: {e}", parent.display())))?;
    }
    let tmp_path = path.with_extension("parquet.tmp");

    let file = fs::File::create(&tmp_path)
        .map_err(|e| IngestError::Parquet(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| IngestError::Parquet(format!("write parquet: {e}")))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        IngestError::Parquet(format!("atomic rename failed: {e}"))
    })
}

pub(crate) fn read_parquet(path: &Path) -> Result<DataFrame, IngestError> {
    let file = fs::File::open(path).map_err(|e| IngestError::Parquet(format!("open: {e}")))?;
    ParquetReader::new(file)
        .finish()
        .map_err(|e| IngestError::Parquet(format!("read: {e}")))
}

/// Load a checkpoint and convert it back to rows, validating its columns.
fn read_rows(path: &Path) -> Result<Vec<PriceRow>, IngestError> {
    let df = read_parquet(path)?;
    let column_err = |e: PolarsError| IngestError::Parquet(format!("column read: {e}"));

    let symbols = df.column("symbol").map_err(column_err)?.str().map_err(column_err)?;
    let names = df.column("name").map_err(column_err)?.str().map_err(column_err)?;
    let dates = df.column("date").map_err(column_err)?.date().map_err(column_err)?;
    let adj_closes = df.column("adj_close").map_err(column_err)?.f64().map_err(column_err)?;
    let closes = df.column("close").map_err(column_err)?.f64().map_err(column_err)?;
    let volumes = df.column("volume").map_err(column_err)?.f64().map_err(column_err)?;

    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let symbol = symbols
            .get(i)
            .ok_or_else(|| IngestError::Parquet(format!("null symbol at row {i}")))?;
        let days = dates
            .get(i)
            .ok_or_else(|| IngestError::Parquet(format!("null date at row {i}")))?;
        rows.push(PriceRow {
            symbol: symbol.to_string(),
            name: names.get(i).unwrap_or(symbol).to_string(),
            date: from_epoch_days(days),
            adj_close: adj_closes.get(i),
            close: closes.get(i),
            volume: volumes.get(i),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(symbol: &str, day: u32, close: Option<f64>) -> PriceRow {
        PriceRow {
            symbol: symbol.into(),
            name: format!("{symbol} Corp"),
            date: NaiveDate::from_ymd_opt(2025, 8, day).unwrap(),
            adj_close: close,
            close,
            volume: Some(1_000.0),
        }
    }

    #[test]
    fn write_and_load_keeps_only_complete_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let written = store
            .write(0, &[row("AAPL", 19, Some(230.5)), row("AAPL", 20, None)])
            .unwrap();
        assert_eq!(written, 1);

        let loaded = store.load(0).unwrap();
        assert_eq!(loaded, vec![row("AAPL", 19, Some(230.5))]);
    }

    #[test]
    fn existence_marks_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(!store.exists(3));
        store.write(3, &[row("SPY", 19, Some(640.0))]).unwrap();
        assert!(store.exists(3));
        assert!(!store.exists(4));
        assert!(store.path(3).ends_with("batch_0003.parquet"));
    }

    #[test]
    fn empty_batch_still_records_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert_eq!(store.write(0, &[row("AAPL", 19, None)]).unwrap(), 0);
        assert!(store.exists(0));
        assert!(store.load(0).unwrap().is_empty());
    }

    #[test]
    fn load_all_concatenates_in_index_order_and_ignores_strays() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.write(10, &[row("MSFT", 19, Some(500.0))]).unwrap();
        store.write(2, &[row("AAPL", 19, Some(230.0))]).unwrap();
        fs::write(dir.path().join("batch_0005.parquet.tmp"), b"partial").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(store.indices().unwrap(), vec![2, 10]);
        let symbols: Vec<String> = store.load_all().unwrap().rows.into_iter().map(|r| r.symbol).collect();
        assert_eq!(symbols, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn corrupt_checkpoint_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.write(0, &[row("AAPL", 19, Some(230.0))]).unwrap();
        fs::write(store.path(1), b"not parquet").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.rows.len(), 1);
        assert_eq!(loaded.quarantined, vec![1]);
        assert!(!store.exists(1));
        assert!(dir.path().join("batch_0001.parquet.quarantined").exists());
    }

    #[test]
    fn verify_quarantines_unreadable_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.write(0, &[row("AAPL", 19, Some(230.0))]).unwrap();
        fs::write(store.path(1), b"garbage").unwrap();

        assert!(store.verify(0).unwrap());
        assert!(!store.verify(1).unwrap());
        assert!(!store.verify(2).unwrap());
        assert!(!store.exists(1));
        assert!(dir.path().join("batch_0001.parquet.quarantined").exists());
    }

    #[test]
    fn missing_directory_means_no_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("never-created"));
        assert!(store.indices().unwrap().is_empty());
        assert!(matches!(store.load_all(), Err(IngestError::NoCheckpoints)));
    }

    #[test]
    fn epoch_day_conversion_is_symmetric() {
        let date = NaiveDate::from_ymd_opt(2025, 8, 19).unwrap();
        assert_eq!(from_epoch_days(to_epoch_days(date)), date);
    }
}
