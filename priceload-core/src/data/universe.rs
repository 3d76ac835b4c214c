//! Universe resolution: pages the reference listing into a deduplicated
//! symbol universe with provider-symbol mapping.
//!
//! Paging continues until a short page; a full page never ends the listing.
//! The tracked filter is sent to the source when it supports it and applied
//! client-side otherwise. An explicit allow-list replaces the tracked filter
//! and is enforced on both sides.

use super::provider::{ReferenceSource, TickerQuery};
use crate::domain::{Ticker, UniverseMember};
use crate::error::IngestError;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Which symbols a run should cover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniverseRequest {
    pub tracked_only: bool,
    /// Explicit allow-list (upper-cased). Overrides `tracked_only`.
    pub symbols: Option<BTreeSet<String>>,
}

impl UniverseRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tracked() -> Self {
        Self {
            tracked_only: true,
            symbols: None,
        }
    }

    /// Allow-list from a comma-separated string (`"aapl, MSFT,,spy"`).
    pub fn from_csv(csv: &str) -> Self {
        Self::from_symbols(csv.split(','))
    }

    pub fn from_symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = symbols
            .into_iter()
            .map(|s| s.as_ref().trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            tracked_only: false,
            symbols: Some(set),
        }
    }

    fn tracked_filter_active(&self) -> bool {
        self.tracked_only && self.symbols.is_none()
    }
}

/// Run-scoped symbol → display name lookup.
///
/// Built once per run from the resolved universe and handed to the
/// components that attach names to rows; never persisted.
#[derive(Debug, Clone, Default)]
pub struct NameCache {
    names: HashMap<String, String>,
}

impl NameCache {
    pub fn insert(&mut self, symbol: &str, name: &str) {
        self.names.insert(symbol.to_string(), name.to_string());
    }

    /// Display name for `symbol`, or the symbol itself when unknown.
    pub fn name_of<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.names.get(symbol).map(String::as_str).unwrap_or(symbol)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// The resolved ingestion universe.
#[derive(Debug, Clone)]
pub struct Universe {
    members: Vec<UniverseMember>,
    by_provider: HashMap<String, usize>,
    names: NameCache,
}

impl Universe {
    /// Build from resolved members, keeping the first occurrence of each
    /// symbol and of each provider symbol.
    pub fn from_members(candidates: impl IntoIterator<Item = UniverseMember>) -> Self {
        let mut members = Vec::new();
        let mut by_provider = HashMap::new();
        let mut names = NameCache::default();
        let mut seen = HashSet::new();

        for member in candidates {
            if !seen.insert(member.symbol.clone()) {
                continue;
            }
            if let Some(&existing) = by_provider.get(&member.provider_symbol) {
                let kept: &UniverseMember = &members[existing];
                warn!(
                    provider_symbol = %member.provider_symbol,
                    kept = %kept.symbol,
                    dropped = %member.symbol,
                    "provider symbol claimed twice; dropping later symbol"
                );
                continue;
            }
            by_provider.insert(member.provider_symbol.clone(), members.len());
            names.insert(&member.symbol, &member.name);
            members.push(member);
        }

        Self {
            members,
            by_provider,
            names,
        }
    }

    pub fn members(&self) -> &[UniverseMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Provider symbols in universe order.
    pub fn provider_symbols(&self) -> Vec<String> {
        self.members.iter().map(|m| m.provider_symbol.clone()).collect()
    }

    /// Map a provider symbol back to its universe member.
    pub fn member_for_provider(&self, provider_symbol: &str) -> Option<&UniverseMember> {
        self.by_provider.get(provider_symbol).map(|&i| &self.members[i])
    }

    pub fn names(&self) -> &NameCache {
        &self.names
    }
}

/// Page the reference source to exhaustion and resolve the universe.
pub fn resolve_universe(
    source: &dyn ReferenceSource,
    request: &UniverseRequest,
    page_size: usize,
) -> Result<Universe, IngestError> {
    let page_size = page_size.max(1);
    let mut query = TickerQuery {
        tracked_only: request.tracked_filter_active(),
        symbols: request.symbols.as_ref().map(|s| s.iter().cloned().collect()),
    };

    let mut tickers: Vec<Ticker> = Vec::new();
    let mut offset = 0;

    loop {
        let page = match source.fetch_page(&query, offset, page_size) {
            Ok(page) => page,
            Err(e) if e.is_unsupported_filter() && query.tracked_only => {
                warn!(
                    source = source.name(),
                    error = %e,
                    "tracked filter unsupported server-side; filtering client-side"
                );
                query.tracked_only = false;
                source
                    .fetch_page(&query, offset, page_size)
                    .map_err(IngestError::Reference)?
            }
            Err(e) => return Err(IngestError::Reference(e)),
        };

        let page_len = page.len();
        debug!(offset, rows = page_len, "reference page");
        tickers.extend(page);

        if page_len < page_size {
            break;
        }
        offset += page_size;
    }

    info!(
        source = source.name(),
        rows = tickers.len(),
        "reference listing collected"
    );

    let tickers = filter_client_side(tickers, request);
    let universe = Universe::from_members(tickers.iter().map(Ticker::resolve));

    if universe.is_empty() {
        return Err(IngestError::EmptyUniverse);
    }

    info!(symbols = universe.len(), "universe resolved");
    Ok(universe)
}

fn filter_client_side(mut tickers: Vec<Ticker>, request: &UniverseRequest) -> Vec<Ticker> {
    if request.tracked_filter_active() && tickers.iter().any(|t| t.tracked.is_some()) {
        tickers.retain(|t| t.tracked == Some(true));
    }
    if let Some(allow) = &request.symbols {
        tickers.retain(|t| allow.contains(&t.symbol.trim().to_uppercase()));
    }
    tickers
}
