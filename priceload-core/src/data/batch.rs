//! Batch fetching: fixed-size universe slices and response normalization.
//!
//! The market-data source takes an exclusive end bound; callers think in
//! inclusive windows. Requests are extended by one day and results re-clipped
//! to the inclusive window because providers occasionally over-return.

use super::provider::{BarResponse, MarketDataSource, SourceError};
use super::universe::Universe;
use crate::domain::{PriceRow, RawBar, UniverseMember};
use crate::error::IngestError;
use chrono::{Duration, NaiveDate};
use tracing::debug;

/// Inclusive calendar window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, IngestError> {
        if end < start {
            return Err(IngestError::DateRangeInvalid { start, end });
        }
        Ok(Self { start, end })
    }

    /// A window covering exactly one day.
    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Exclusive end bound for the provider request.
    pub fn end_exclusive(&self) -> NaiveDate {
        self.end + Duration::days(1)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// An ordered slice of the universe fetched with one bulk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    pub provider_symbols: Vec<String>,
}

/// Splits the universe into batches and turns bar responses into tidy rows.
pub struct BatchFetcher<'a> {
    source: &'a dyn MarketDataSource,
    universe: &'a Universe,
    batch_size: usize,
}

impl<'a> BatchFetcher<'a> {
    /// `batch_size` is capped by the source's per-call symbol limit.
    pub fn new(source: &'a dyn MarketDataSource, universe: &'a Universe, batch_size: usize) -> Self {
        let batch_size = batch_size.min(source.max_symbols_per_call()).max(1);
        Self {
            source,
            universe,
            batch_size,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Universe symbol behind a provider symbol (the provider symbol itself if unmapped).
    pub fn canonical_symbol(&self, provider_symbol: &str) -> String {
        self.universe
            .member_for_provider(provider_symbol)
            .map_or_else(|| provider_symbol.to_string(), |m| m.symbol.clone())
    }

    /// Universe split into consecutive batches, indexed from 0.
    pub fn batches(&self) -> Vec<Batch> {
        self.universe
            .provider_symbols()
            .chunks(self.batch_size)
            .enumerate()
            .map(|(index, chunk)| Batch {
                index,
                provider_symbols: chunk.to_vec(),
            })
            .collect()
    }

    /// One call to the source for `provider_symbols` over `window`.
    pub fn fetch(
        &self,
        provider_symbols: &[String],
        window: DateWindow,
    ) -> Result<Vec<PriceRow>, SourceError> {
        if provider_symbols.is_empty() {
            return Ok(Vec::new());
        }
        let response =
            self.source
                .fetch_bars(provider_symbols, window.start(), window.end_exclusive())?;
        debug!(
            symbols = provider_symbols.len(),
            bars = response.bar_count(),
            "bar response"
        );
        normalize(self.universe, provider_symbols, response, window)
    }
}

/// Flatten either response shape into rows clipped to `window`.
///
/// Tables for provider symbols outside the universe are dropped. A flat
/// table is only attributable when exactly one symbol was requested.
pub fn normalize(
    universe: &Universe,
    requested: &[String],
    response: BarResponse,
    window: DateWindow,
) -> Result<Vec<PriceRow>, SourceError> {
    let tables: Vec<(String, Vec<RawBar>)> = match response {
        BarResponse::Nested(tables) => tables.into_iter().collect(),
        BarResponse::Flat(bars) => match requested {
            [only] => vec![(only.clone(), bars)],
            _ => {
                return Err(SourceError::ResponseFormatChanged(format!(
                    "flat table returned for a {}-symbol request",
                    requested.len()
                )))
            }
        },
    };

    let mut rows = Vec::new();
    for (provider_symbol, bars) in tables {
        let Some(member) = universe.member_for_provider(&provider_symbol) else {
            debug!(%provider_symbol, "response table outside the universe; dropped");
            continue;
        };
        rows.extend(
            bars.into_iter()
                .filter(|bar| window.contains(bar.date))
                .map(|bar| to_row(member, universe, bar)),
        );
    }
    Ok(rows)
}

fn to_row(member: &UniverseMember, universe: &Universe, bar: RawBar) -> PriceRow {
    PriceRow {
        symbol: member.symbol.clone(),
        name: universe.names().name_of(&member.symbol).to_string(),
        date: bar.date,
        adj_close: bar.adj_close,
        close: bar.close,
        volume: bar.volume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Ticker;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    fn universe(symbols: &[&str]) -> Universe {
        Universe::from_members(symbols.iter().map(|s| Ticker::new(*s).resolve()))
    }

    /// Returns bars for every requested day plus one extra day past the end.
    struct OverReturning {
        cap: usize,
        requests: Mutex<Vec<(Vec<String>, NaiveDate, NaiveDate)>>,
    }

    impl MarketDataSource for OverReturning {
        fn name(&self) -> &str {
            "over-returning"
        }

        fn max_symbols_per_call(&self) -> usize {
            self.cap
        }

        fn fetch_bars(
            &self,
            provider_symbols: &[String],
            start: NaiveDate,
            end_exclusive: NaiveDate,
        ) -> Result<BarResponse, SourceError> {
            self.requests
                .lock()
                .unwrap()
                .push((provider_symbols.to_vec(), start, end_exclusive));
            let bars: Vec<RawBar> = start
                .iter_days()
                .take_while(|day| *day <= end_exclusive)
                .map(|day| RawBar::new(day, 10.0, 10.0, 100.0))
                .collect();
            if provider_symbols.len() == 1 {
                return Ok(BarResponse::Flat(bars));
            }
            Ok(BarResponse::Nested(
                provider_symbols
                    .iter()
                    .map(|s| (s.clone(), bars.clone()))
                    .collect(),
            ))
        }
    }

    fn source(cap: usize) -> OverReturning {
        OverReturning {
            cap,
            requests: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn inverted_window_is_rejected() {
        let err = DateWindow::new(d(21), d(19)).unwrap_err();
        assert!(matches!(err, IngestError::DateRangeInvalid { .. }));
    }

    #[test]
    fn batches_are_fixed_size_and_ordered() {
        let uni = universe(&["A", "B", "C", "D", "E"]);
        let src = source(100);
        let fetcher = BatchFetcher::new(&src, &uni, 2);
        let batches = fetcher.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].provider_symbols, vec!["A", "B"]);
        assert_eq!(batches[2].index, 2);
        assert_eq!(batches[2].provider_symbols, vec!["E"]);
    }

    #[test]
    fn batch_size_is_capped_by_source() {
        let uni = universe(&["A", "B", "C"]);
        let src = source(1);
        assert_eq!(BatchFetcher::new(&src, &uni, 150).batch_size(), 1);
    }

    #[test]
    fn request_extends_end_and_output_is_clipped() {
        let uni = universe(&["AAPL", "MSFT"]);
        let src = source(150);
        let fetcher = BatchFetcher::new(&src, &uni, 150);
        let window = DateWindow::new(d(19), d(21)).unwrap();

        let rows = fetcher.fetch(&uni.provider_symbols(), window).unwrap();

        let (_, start, end_exclusive) = src.requests.lock().unwrap()[0].clone();
        assert_eq!(start, d(19));
        assert_eq!(end_exclusive, d(22));
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| r.date <= d(21)));
        assert!(!rows.iter().any(|r| r.date == d(22)));
    }

    #[test]
    fn flat_response_maps_to_single_symbol() {
        let uni = Universe::from_members(vec![Ticker::new("BRK.B").with_name("Berkshire").resolve()]);
        let src = source(150);
        let fetcher = BatchFetcher::new(&src, &uni, 150);

        let rows = fetcher
            .fetch(&["BRK-B".to_string()], DateWindow::single(d(19)))
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BRK.B");
        assert_eq!(rows[0].name, "Berkshire");
    }

    #[test]
    fn flat_response_for_many_symbols_is_a_format_error() {
        let uni = universe(&["A", "B"]);
        let err = normalize(
            &uni,
            &uni.provider_symbols(),
            BarResponse::Flat(vec![RawBar::new(d(19), 1.0, 1.0, 1.0)]),
            DateWindow::single(d(19)),
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::ResponseFormatChanged(_)));
    }

    #[test]
    fn missing_and_unknown_tables_are_silently_absent() {
        let uni = universe(&["AAPL", "MSFT"]);
        let mut tables = BTreeMap::new();
        tables.insert("AAPL".to_string(), vec![RawBar::new(d(19), 1.0, 1.0, 1.0)]);
        tables.insert("ZZZZ".to_string(), vec![RawBar::new(d(19), 1.0, 1.0, 1.0)]);

        let rows = normalize(
            &uni,
            &uni.provider_symbols(),
            BarResponse::Nested(tables),
            DateWindow::single(d(19)),
        )
        .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "AAPL");
    }

    #[test]
    fn incomplete_bars_pass_through_normalization() {
        let uni = universe(&["AAPL"]);
        let bar = RawBar {
            date: d(19),
            adj_close: None,
            close: Some(1.0),
            volume: Some(5.0),
        };
        let rows = normalize(
            &uni,
            &uni.provider_symbols(),
            BarResponse::Flat(vec![bar]),
            DateWindow::single(d(19)),
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_complete());
    }
}
