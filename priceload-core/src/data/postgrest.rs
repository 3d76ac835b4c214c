//! PostgREST client for the ticker listing and the price table.
//!
//! Speaks the plain PostgREST HTTP dialect (Supabase exposes it under
//! `/rest/v1`). One client serves both roles: `ReferenceSource` over the
//! ticker table and `PriceStore` over the price table.

use super::provider::{PriceRecord, PriceStore, ReferenceSource, SourceError, TickerQuery};
use crate::config::StoreConfig;
use crate::domain::Ticker;
use chrono::NaiveDate;
use reqwest::blocking::{RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Postgres "undefined column": the filter names a column the table lacks.
const UNDEFINED_COLUMN: &str = "42703";

/// Rows per page when reading back a price range.
const READ_PAGE: usize = 1000;

/// Ticker table row; every column other than `symbol` may be absent.
#[derive(Debug, Deserialize)]
struct TickerRow {
    symbol: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    provider_symbol_yf: Option<String>,
    #[serde(default)]
    is_tracked: Option<bool>,
}

impl From<TickerRow> for Ticker {
    fn from(row: TickerRow) -> Self {
        Ticker {
            symbol: row.symbol,
            name: row.name,
            provider_symbol: row.provider_symbol_yf,
            tracked: row.is_tracked,
        }
    }
}

pub struct PostgrestClient {
    client: reqwest::blocking::Client,
    rest_url: String,
    api_key: String,
    ticker_table: String,
    price_table: String,
}

impl PostgrestClient {
    /// `base_url` is the project URL; `/rest/v1` is appended.
    pub fn new(base_url: &str, api_key: &str, store: &StoreConfig) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SourceError::NetworkUnreachable(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            ticker_table: store.ticker_table.clone(),
            price_table: store.price_table.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{table}", self.rest_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, SourceError> {
        let resp = self
            .authorized(request)
            .send()
            .map_err(|e| SourceError::NetworkUnreachable(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = resp.text().unwrap_or_default();
        Err(classify(status, retry_after, body))
    }

    fn read_json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, SourceError> {
        resp.json()
            .map_err(|e| SourceError::ResponseFormatChanged(format!("response body: {e}")))
    }
}

/// Map a non-success status to a classified error.
fn classify(status: StatusCode, retry_after: Option<u64>, body: String) -> SourceError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return SourceError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(60),
        };
    }
    if status.is_server_error() {
        return SourceError::ServerError {
            status: status.as_u16(),
            message: body,
        };
    }
    if status == StatusCode::BAD_REQUEST && body.contains(UNDEFINED_COLUMN) {
        return SourceError::UnsupportedFilter(body);
    }
    SourceError::Rejected(format!("HTTP {status}: {body}"))
}

/// PostgREST `in` list with every value double-quoted.
fn in_list(values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("\"{}\"", v.replace('"', "")))
        .collect();
    format!("in.({})", quoted.join(","))
}

impl ReferenceSource for PostgrestClient {
    fn name(&self) -> &str {
        "postgrest"
    }

    fn fetch_page(
        &self,
        query: &TickerQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Ticker>, SourceError> {
        let mut params: Vec<(&str, String)> = vec![
            ("select", "*".to_string()),
            ("order", "symbol.asc".to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        if query.tracked_only {
            params.push(("is_tracked", "eq.true".to_string()));
        }
        if let Some(symbols) = &query.symbols {
            params.push(("symbol", in_list(symbols)));
        }

        let request = self.client.get(self.table_url(&self.ticker_table)).query(&params);
        let rows: Vec<TickerRow> = Self::read_json(self.send(request)?)?;
        debug!(table = %self.ticker_table, offset, rows = rows.len(), "ticker page");
        Ok(rows.into_iter().map(Ticker::from).collect())
    }
}

impl PriceStore for PostgrestClient {
    fn name(&self) -> &str {
        "postgrest"
    }

    fn upsert(&self, records: &[PriceRecord]) -> Result<(), SourceError> {
        let request = self
            .client
            .post(self.table_url(&self.price_table))
            .query(&[("on_conflict", "symbol,date")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(records);
        self.send(request)?;
        Ok(())
    }

    fn query_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        columns: &[&str],
    ) -> Result<Vec<Value>, SourceError> {
        let select = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.join(",")
        };
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let params = [
                ("select", select.clone()),
                ("date", format!("gte.{}", start.format("%Y-%m-%d"))),
                ("date", format!("lte.{}", end.format("%Y-%m-%d"))),
                ("order", "symbol.asc,date.asc".to_string()),
                ("offset", offset.to_string()),
                ("limit", READ_PAGE.to_string()),
            ];
            let request = self.client.get(self.table_url(&self.price_table)).query(&params);
            let page: Vec<Value> = Self::read_json(self.send(request)?)?;
            let fetched = page.len();
            out.extend(page);
            if fetched < READ_PAGE {
                return Ok(out);
            }
            offset += fetched;
        }
    }
}
