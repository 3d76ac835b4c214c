//! Stitching checkpoints into one de-duplicated, sorted series with ADDV.
//!
//! ADDV is the trailing mean of dollar volume over each symbol's own
//! series with a minimum of one observation, so the first bar of every
//! symbol has an ADDV equal to its dollar volume.

use super::checkpoint::{date_column, to_epoch_days, write_parquet_atomic};
use crate::domain::{PriceBar, PriceRow};
use crate::error::IngestError;
use polars::prelude::*;
use std::path::Path;
use tracing::info;

/// Complete rows sorted by (symbol, date), keeping the first row seen per key.
///
/// The sort is stable, so "first" means first in input (batch) order.
pub fn dedup_sorted(rows: Vec<PriceRow>) -> Vec<PriceRow> {
    let mut rows: Vec<PriceRow> = rows.into_iter().filter(PriceRow::is_complete).collect();
    rows.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.date.cmp(&b.date)));
    rows.dedup_by(|later, earlier| later.symbol == earlier.symbol && later.date == earlier.date);
    rows
}

/// Trailing mean over `window` observations, shorter at the start of the series.
///
/// Running sum: add the newest value, drop the one leaving the window.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, value) in values.iter().enumerate() {
        sum += value;
        if i >= window {
            sum -= values[i - window];
        }
        let count = (i + 1).min(window);
        out.push(sum / count as f64);
    }
    out
}

/// De-duplicate, sort and derive dollar volume plus ADDV per symbol.
pub fn stitch(rows: Vec<PriceRow>, addv_window: usize) -> Vec<PriceBar> {
    let rows = dedup_sorted(rows);
    let mut bars = Vec::with_capacity(rows.len());

    let mut start = 0;
    while start < rows.len() {
        let symbol = &rows[start].symbol;
        let end = rows[start..]
            .iter()
            .position(|r| &r.symbol != symbol)
            .map_or(rows.len(), |offset| start + offset);
        let group = &rows[start..end];

        let dollar_volumes: Vec<f64> = group
            .iter()
            .map(|r| r.dollar_volume().unwrap_or(0.0))
            .collect();
        let addv = rolling_mean(&dollar_volumes, addv_window);

        for ((row, dv), addv) in group.iter().zip(dollar_volumes).zip(addv) {
            // Complete rows only reach this point.
            bars.push(PriceBar {
                symbol: row.symbol.clone(),
                name: row.name.clone(),
                date: row.date,
                adj_close: row.adj_close.unwrap_or_default(),
                close: row.close.unwrap_or_default(),
                volume: row.volume.unwrap_or_default(),
                dollar_volume: dv,
                addv,
            });
        }
        start = end;
    }
    bars
}

/// Atomically write the merged output as Parquet.
///
/// Columns: symbol, name, date, adj_close, close, volume, dollar_volume, addv_20d
pub fn write_merged(path: &Path, bars: &[PriceBar]) -> Result<(), IngestError> {
    let df = bars_to_dataframe(bars)?;
    write_parquet_atomic(&df, path)?;
    info!(path = %path.display(), rows = bars.len(), "merged output written");
    Ok(())
}

fn bars_to_dataframe(bars: &[PriceBar]) -> Result<DataFrame, IngestError> {
    let symbols: Vec<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();
    let names: Vec<&str> = bars.iter().map(|b| b.name.as_str()).collect();
    let dates: Vec<i32> = bars.iter().map(|b| to_epoch_days(b.date)).collect();
    let adj_closes: Vec<f64> = bars.iter().map(|b| b.adj_close).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    let dollar_volumes: Vec<f64> = bars.iter().map(|b| b.dollar_volume).collect();
    let addv: Vec<f64> = bars.iter().map(|b| b.addv).collect();

    DataFrame::new(vec![
        Column::new("symbol".into(), symbols),
        Column::new("name".into(), names),
        date_column("date", dates)?,
        Column::new("adj_close".into(), adj_closes),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("dollar_volume".into(), dollar_volumes),
        Column::new("addv_20d".into(), addv),
    ])
    .map_err(|e| IngestError::Parquet(format!("dataframe creation: {e}")))
}
