//! Pipeline error type.
//!
//! Adapter failures are `SourceError`s; this enum classifies what they mean
//! for a run. Symbol-level unavailability and malformed rows are not errors
//! here: the former is a failure-report entry, the latter a silent filter.

use crate::config::ConfigError;
use crate::data::provider::SourceError;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("universe resolved to 0 symbols after filtering and de-duplication")]
    EmptyUniverse,

    #[error("end date {end} is before start date {start}")]
    DateRangeInvalid { start: NaiveDate, end: NaiveDate },

    #[error("batch {batch} fetch failed: {source}")]
    BatchFetchFailure {
        batch: usize,
        #[source]
        source: SourceError,
    },

    #[error("upsert of chunk {chunk} failed after {rows_written} rows were written: {source}")]
    WriteFailure {
        chunk: usize,
        rows_written: usize,
        #[source]
        source: SourceError,
    },

    #[error("reference data: {0}")]
    Reference(#[source] SourceError),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("no checkpoint artifacts found; nothing to stitch")]
    NoCheckpoints,

    #[error("failure report: {0}")]
    Report(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
