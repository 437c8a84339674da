// =============================================================================
// ISS REST Client — Moscow Exchange market data over HTTPS
// =============================================================================
//
// OPERATIONAL QUIRK: the ISS endpoints have served certificates that do not
// validate against common trust stores. `accept_invalid_certs` (on by default)
// disables verification for this client only; nothing else in the process
// shares its connection pool.
//
// The candles endpoint returns at most one page of rows per call; follow-up
// pages are requested with a `start` offset until a short page comes back.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::ClientError;
use crate::market_data::{
    value_as_f64, value_as_u64, DataTable, MarketDataClient, RawCandles, SecurityInfo,
};
use crate::types::Granularity;

/// Rows per candles page served by ISS.
const ISS_PAGE_SIZE: usize = 500;

/// Connection parameters for [`IssClient`].
#[derive(Debug, Clone)]
pub struct IssSettings {
    pub base_url: String,
    pub board: String,
    pub candle_timeout: Duration,
    pub price_timeout: Duration,
    pub accept_invalid_certs: bool,
    pub max_pages: usize,
}

impl Default for IssSettings {
    fn default() -> Self {
        Self {
            base_url: "https://iss.moex.com/iss".to_string(),
            board: "TQBR".to_string(),
            candle_timeout: Duration::from_secs(30),
            price_timeout: Duration::from_secs(5),
            accept_invalid_certs: true,
            max_pages: 20,
        }
    }
}

#[derive(Deserialize)]
struct CandlesEnvelope {
    candles: Option<DataTable>,
}

#[derive(Deserialize)]
struct SecuritiesEnvelope {
    securities: Option<DataTable>,
}

/// ISS client for one trading board.
#[derive(Clone)]
pub struct IssClient {
    settings: IssSettings,
    client: reqwest::Client,
}

impl IssClient {
    pub fn new(settings: IssSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client for IssClient")?;

        debug!(
            base_url = %settings.base_url,
            board = %settings.board,
            accept_invalid_certs = settings.accept_invalid_certs,
            "IssClient initialised"
        );

        Ok(Self { settings, client })
    }

    fn securities_url(&self, instrument: &str) -> String {
        format!(
            "{}/engines/stock/markets/shares/boards/{}/securities/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.board,
            instrument
        )
    }

    /// GET `url` with `query`, returning the decoded JSON body.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::UpstreamUnavailable(format!(
                "GET {url} returned HTTP {status}"
            )));
        }

        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::MalformedResponse(format!("GET {url}: {e}")))
    }

    async fn securities_table(
        &self,
        instrument: &str,
        columns: &str,
    ) -> Result<DataTable, ClientError> {
        let url = format!("{}.json", self.securities_url(instrument));
        let body: SecuritiesEnvelope = self
            .get_json(
                &url,
                &[
                    ("iss.meta", "off".to_string()),
                    ("securities.columns", columns.to_string()),
                ],
                self.settings.price_timeout,
            )
            .await?;
        body.securities
            .ok_or_else(|| ClientError::MalformedResponse("missing 'securities' block".into()))
    }
}

impl MarketDataClient for IssClient {
    /// GET `.../securities/{ticker}/candles.json`, following pages.
    #[instrument(skip(self), name = "iss::fetch_candles")]
    async fn fetch_candles(
        &self,
        instrument: &str,
        granularity: Granularity,
        from: NaiveDateTime,
    ) -> Result<RawCandles, ClientError> {
        let url = format!("{}/candles.json", self.securities_url(instrument));
        let from_param = granularity.format_from(from);
        let mut merged: Option<DataTable> = None;

        for page in 0..self.settings.max_pages.max(1) {
            let start = page * ISS_PAGE_SIZE;
            let body: CandlesEnvelope = self
                .get_json(
                    &url,
                    &[
                        ("interval", granularity.code().to_string()),
                        ("from", from_param.clone()),
                        ("start", start.to_string()),
                    ],
                    self.settings.candle_timeout,
                )
                .await?;

            let table = body
                .candles
                .ok_or_else(|| ClientError::MalformedResponse("missing 'candles' block".into()))?;
            let page_rows = table.rows.len();

            match merged.as_mut() {
                None => merged = Some(table),
                Some(acc) => {
                    if acc.columns != table.columns {
                        return Err(ClientError::MalformedResponse(format!(
                            "column set changed on page {page}"
                        )));
                    }
                    acc.rows.extend(table.rows);
                }
            }

            if page_rows < ISS_PAGE_SIZE {
                break;
            }
            if page + 1 == self.settings.max_pages {
                warn!(
                    instrument,
                    pages = self.settings.max_pages,
                    "candle fetch truncated at page limit"
                );
            }
        }

        let table = merged.unwrap_or_default();
        debug!(instrument, interval = %granularity, rows = table.rows.len(), "candles fetched");
        Ok(table)
    }

    /// Last trade price from the `securities` block, resolved by column name.
    #[instrument(skip(self), name = "iss::fetch_last_price")]
    async fn fetch_last_price(&self, instrument: &str) -> Result<Option<f64>, ClientError> {
        let table = self.securities_table(instrument, "SECID,LAST").await?;
        if !table.rows.is_empty() && table.column("LAST").is_none() {
            return Err(ClientError::MalformedResponse("missing 'LAST' column".into()));
        }
        let price = table.cell(0, "LAST").and_then(value_as_f64);
        debug!(instrument, ?price, "last price fetched");
        Ok(price)
    }

    #[instrument(skip(self), name = "iss::fetch_security_info")]
    async fn fetch_security_info(
        &self,
        instrument: &str,
    ) -> Result<Option<SecurityInfo>, ClientError> {
        let table = self
            .securities_table(
                instrument,
                "SECID,SHORTNAME,ISIN,LOTSIZE,FACEUNIT,PREVPRICE,LAST",
            )
            .await?;
        Ok(security_info_from(&table, instrument))
    }
}

fn security_info_from(table: &DataTable, instrument: &str) -> Option<SecurityInfo> {
    if table.rows.is_empty() {
        return None;
    }
    let text = |col: &str| {
        table
            .cell(0, col)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    Some(SecurityInfo {
        ticker: text("SECID").unwrap_or_else(|| instrument.to_string()),
        name: text("SHORTNAME").unwrap_or_else(|| instrument.to_string()),
        isin: text("ISIN"),
        lot_size: table.cell(0, "LOTSIZE").and_then(value_as_u64),
        currency: text("FACEUNIT"),
        prev_price: table.cell(0, "PREVPRICE").and_then(value_as_f64),
        last_price: table.cell(0, "LAST").and_then(value_as_f64),
    })
}

impl std::fmt::Debug for IssClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssClient")
            .field("base_url", &self.settings.base_url)
            .field("board", &self.settings.board)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn securities_url_uses_board_and_trims_slash() {
        let client = IssClient::new(IssSettings {
            base_url: "https://example.test/iss/".into(),
            ..IssSettings::default()
        })
        .unwrap();
        assert_eq!(
            client.securities_url("SBER"),
            "https://example.test/iss/engines/stock/markets/shares/boards/TQBR/securities/SBER"
        );
    }

    #[test]
    fn candles_envelope_without_block_is_detected() {
        let body: CandlesEnvelope = serde_json::from_value(json!({ "other": {} })).unwrap();
        assert!(body.candles.is_none());
    }

    #[test]
    fn security_info_resolves_columns_by_name() {
        let table: DataTable = serde_json::from_value(json!({
            "columns": ["LAST", "SECID", "LOTSIZE", "SHORTNAME", "PREVPRICE", "FACEUNIT", "ISIN"],
            "data": [[271.5, "SBER", 10, "Сбербанк", "270.1", "SUR", "RU0009029540"]]
        }))
        .unwrap();
        let info = security_info_from(&table, "SBER").unwrap();
        assert_eq!(info.ticker, "SBER");
        assert_eq!(info.name, "Сбербанк");
        assert_eq!(info.lot_size, Some(10));
        assert_eq!(info.prev_price, Some(270.1));
        assert_eq!(info.last_price, Some(271.5));
        assert_eq!(info.isin.as_deref(), Some("RU0009029540"));
    }

    #[test]
    fn security_info_for_unknown_ticker_is_none() {
        let table: DataTable =
            serde_json::from_value(json!({ "columns": ["SECID"], "data": [] })).unwrap();
        assert!(security_info_from(&table, "NOPE").is_none());
    }
}
