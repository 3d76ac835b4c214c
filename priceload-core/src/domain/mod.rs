//! Domain types for priceload

pub mod bar;
pub mod ticker;

pub use bar::{PriceBar, PriceRow, RawBar};
pub use ticker::{provider_symbol_fallback, Ticker, UniverseMember};
