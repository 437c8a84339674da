pub mod iss_client;

use std::future::Future;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::types::Granularity;

pub use iss_client::{IssClient, IssSettings};

/// A column-named table as returned by the upstream API: names in `columns`,
/// positional values in each row. Column order is not guaranteed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(rename = "data", default)]
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Raw candle batch before normalization.
pub type RawCandles = DataTable;

impl DataTable {
    /// Position of `name` in `columns`.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell at `row`/`column_name`, `None` if either is missing or JSON null.
    pub fn cell(&self, row: usize, column_name: &str) -> Option<&serde_json::Value> {
        let idx = self.column(column_name)?;
        self.rows
            .get(row)?
            .get(idx)
            .filter(|v| !v.is_null())
    }
}

/// Upstream sends numbers either as JSON numbers or as strings.
pub fn value_as_f64(val: &serde_json::Value) -> Option<f64> {
    let parsed = match val {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// Non-negative integral value.
pub fn value_as_u64(val: &serde_json::Value) -> Option<u64> {
    if let Some(n) = val.as_u64() {
        return Some(n);
    }
    let f = value_as_f64(val)?;
    (f >= 0.0 && f.fract() == 0.0).then_some(f as u64)
}

/// Static description of a listed security.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub ticker: String,
    pub name: String,
    pub isin: Option<String>,
    pub lot_size: Option<u64>,
    pub currency: Option<String>,
    pub prev_price: Option<f64>,
    pub last_price: Option<f64>,
}

/// Source of candle batches and last-trade prices.
///
/// Implementations decide transport, timeouts and TLS policy. Every failure
/// maps onto [`ClientError`]; callers treat all of them as non-fatal.
pub trait MarketDataClient: Send + Sync + 'static {
    /// Candles for `instrument` at `granularity`, starting at `from`
    /// (exchange-local wall clock).
    fn fetch_candles(
        &self,
        instrument: &str,
        granularity: Granularity,
        from: NaiveDateTime,
    ) -> impl Future<Output = Result<RawCandles, ClientError>> + Send;

    /// Last trade price, `None` when the exchange reports none.
    fn fetch_last_price(
        &self,
        instrument: &str,
    ) -> impl Future<Output = Result<Option<f64>, ClientError>> + Send;

    /// Security card, `None` for an unknown ticker.
    fn fetch_security_info(
        &self,
        instrument: &str,
    ) -> impl Future<Output = Result<Option<SecurityInfo>, ClientError>> + Send;
}
