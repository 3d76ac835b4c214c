//! Ticker: reference-data entry, and its resolved universe form.

use serde::{Deserialize, Serialize};

/// A symbol as listed by the reference-data source.
///
/// Every field other than `symbol` is optional: the source may not carry a
/// display name, a provider override, or a tracked flag for every row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub name: Option<String>,
    pub provider_symbol: Option<String>,
    pub tracked: Option<bool>,
}

impl Ticker {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: None,
            provider_symbol: None,
            tracked: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_provider_symbol(mut self, provider_symbol: impl Into<String>) -> Self {
        self.provider_symbol = Some(provider_symbol.into());
        self
    }

    pub fn with_tracked(mut self, tracked: bool) -> Self {
        self.tracked = Some(tracked);
        self
    }

    /// Resolve the member form: override or fallback provider symbol, name or symbol.
    pub fn resolve(&self) -> UniverseMember {
        let provider_symbol = self
            .provider_symbol
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| provider_symbol_fallback(&self.symbol));
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.symbol)
            .to_string();
        UniverseMember {
            symbol: self.symbol.clone(),
            name,
            provider_symbol,
        }
    }
}

/// Deterministic provider-symbol fallback: class-share dots become dashes (`BRK.B` → `BRK-B`).
pub fn provider_symbol_fallback(symbol: &str) -> String {
    symbol.replace('.', "-")
}

/// A resolved member of the ingestion universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseMember {
    pub symbol: String,
    pub name: String,
    pub provider_symbol: String,
}
