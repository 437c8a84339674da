// =============================================================================
// Query Service — history and stored-candle reads for the presentation layer
// =============================================================================
//
// History is fetched live from upstream and never persisted here. When
// upstream fails, stored candles for the same granularity on or after `from`
// are served instead; the error only surfaces when that fallback is empty too.
// Sub-hour results are then composited with the current price.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration, Months, NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{ClientError, StoreError};
use crate::ingest::normalize;
use crate::live::LiveCompositor;
use crate::market_data::MarketDataClient;
use crate::store::CandleStore;
use crate::types::{Candle, CandlePoint, ExchangeClock, Granularity, DATE_FORMAT};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Upstream(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// History response body. `from` is always a bare date.
#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub ticker: String,
    pub interval: Granularity,
    pub from: String,
    pub count: usize,
    pub points: Vec<CandlePoint>,
}

/// Stored-candles response body.
#[derive(Debug, Clone, Serialize)]
pub struct StoredCandles {
    pub ticker: String,
    pub count: usize,
    pub points: Vec<CandlePoint>,
}

/// Lookback applied when the caller gives no `from`.
pub fn default_from(granularity: Granularity, now: NaiveDateTime) -> NaiveDateTime {
    let months_back = |n: u32| {
        now.checked_sub_months(Months::new(n))
            .unwrap_or(now - Duration::days(30 * i64::from(n)))
    };
    match granularity {
        Granularity::Minute1 => now - Duration::hours(6),
        Granularity::Minute10 => now - Duration::days(15),
        Granularity::Hour1 => now - Duration::days(30),
        Granularity::Day => months_back(6),
        Granularity::Week => months_back(12),
        Granularity::Month => NaiveDate::from_ymd_opt(2023, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_else(|| months_back(24)),
    }
}

pub struct QueryService<C> {
    client: Arc<C>,
    store: CandleStore,
    clock: ExchangeClock,
    compositor: LiveCompositor,
}

impl<C: MarketDataClient> QueryService<C> {
    pub fn new(
        client: Arc<C>,
        store: CandleStore,
        clock: ExchangeClock,
        compositor: LiveCompositor,
    ) -> Self {
        Self {
            client,
            store,
            clock,
            compositor,
        }
    }

    /// History for `instrument` (already normalized) from `from`, or from the
    /// interval's default lookback.
    pub async fn history(
        &self,
        instrument: &str,
        granularity: Granularity,
        from: Option<NaiveDateTime>,
    ) -> Result<History, QueryError> {
        let from = from.unwrap_or_else(|| default_from(granularity, self.clock.now_local()));

        let candles = match self.fetch_upstream(instrument, granularity, from).await {
            Ok(candles) => candles,
            Err(e) => {
                let stored: Vec<Candle> = self
                    .store
                    .read_all(instrument, granularity)?
                    .into_iter()
                    .filter(|c| c.time >= from)
                    .collect();
                if stored.is_empty() {
                    return Err(e.into());
                }
                warn!(
                    instrument,
                    interval = %granularity,
                    error = %e,
                    served = stored.len(),
                    "upstream history failed, serving stored candles"
                );
                stored
            }
        };

        let candles = self
            .compositor
            .compose_live(self.client.as_ref(), instrument, candles, granularity)
            .await;

        let points: Vec<CandlePoint> = candles.iter().map(CandlePoint::from).collect();
        Ok(History {
            ticker: instrument.to_string(),
            interval: granularity,
            from: from.format(DATE_FORMAT).to_string(),
            count: points.len(),
            points,
        })
    }

    async fn fetch_upstream(
        &self,
        instrument: &str,
        granularity: Granularity,
        from: NaiveDateTime,
    ) -> Result<Vec<Candle>, ClientError> {
        let raw = self.client.fetch_candles(instrument, granularity, from).await?;
        let mut candles = normalize(instrument, &raw)?.candles;
        candles.sort_by_key(|c| c.time);
        candles.dedup_by_key(|c| c.time);
        debug!(instrument, rows = candles.len(), "history fetched upstream");
        Ok(candles)
    }

    /// Every stored candle for `(instrument, granularity)`.
    pub fn all_stored(
        &self,
        instrument: &str,
        granularity: Granularity,
    ) -> Result<StoredCandles, StoreError> {
        let points: Vec<CandlePoint> = self
            .store
            .read_all(instrument, granularity)?
            .iter()
            .map(CandlePoint::from)
            .collect();
        Ok(StoredCandles {
            ticker: instrument.to_string(),
            count: points.len(),
            points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::fake::{table, FakeClient};
    use crate::types::parse_wall_clock;

    fn at(s: &str) -> NaiveDateTime {
        parse_wall_clock(s).unwrap()
    }

    fn service(client: FakeClient) -> (tempfile::TempDir, QueryService<FakeClient>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = ExchangeClock::default();
        let svc = QueryService::new(
            Arc::new(client),
            CandleStore::new(dir.path()),
            clock,
            LiveCompositor::new(clock, std::time::Duration::from_secs(1)),
        );
        (dir, svc)
    }

    fn stored(time: &str, close: f64) -> Candle {
        Candle {
            instrument: "SBER".into(),
            time: at(time),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1,
        }
    }

    #[test]
    fn default_lookbacks() {
        let now = at("2025-06-15 12:00:00");
        assert_eq!(default_from(Granularity::Minute1, now), at("2025-06-15 06:00:00"));
        assert_eq!(default_from(Granularity::Minute10, now), at("2025-05-31 12:00:00"));
        assert_eq!(default_from(Granularity::Hour1, now), at("2025-05-16 12:00:00"));
        assert_eq!(default_from(Granularity::Day, now), at("2024-12-15 12:00:00"));
        assert_eq!(default_from(Granularity::Week, now), at("2024-06-15 12:00:00"));
        assert_eq!(default_from(Granularity::Month, now), at("2023-01-01 00:00:00"));
    }

    #[tokio::test]
    async fn history_comes_from_upstream_and_is_not_persisted() {
        let client = FakeClient::default().with_candles(
            "SBER",
            table(&[
                ("2025-06-03 00:00:00", 2.0, 2.0, 2.0, 2.0, 2),
                ("2025-06-02 00:00:00", 1.0, 1.0, 1.0, 1.0, 1),
            ]),
        );
        let (_dir, svc) = service(client);

        let h = svc
            .history("SBER", Granularity::Day, Some(at("2025-06-01 00:00:00")))
            .await
            .unwrap();
        assert_eq!(h.count, 2);
        assert_eq!(h.from, "2025-06-01");
        assert_eq!(h.points[0].time, "2025-06-02 00:00:00");
        assert!(svc.all_stored("SBER", Granularity::Day).unwrap().points.is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_falls_back_to_store() {
        let client = FakeClient::default().with_failure("SBER", "HTTP 502");
        let (_dir, svc) = service(client);
        let mut ledger = svc.store.open_ledger("SBER", Granularity::Day).unwrap();
        ledger
            .append(&[stored("2025-05-01 00:00:00", 1.0), stored("2025-06-02 00:00:00", 2.0)])
            .unwrap();

        let h = svc
            .history("SBER", Granularity::Day, Some(at("2025-06-01 00:00:00")))
            .await
            .unwrap();
        assert_eq!(h.count, 1);
        assert!((h.points[0].close - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn upstream_failure_with_empty_store_surfaces() {
        let client = FakeClient::default().with_failure("SBER", "HTTP 502");
        let (_dir, svc) = service(client);

        let err = svc
            .history("SBER", Granularity::Day, Some(at("2025-06-01 00:00:00")))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Upstream(ClientError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn intraday_history_gets_a_live_candle() {
        let client = FakeClient::default()
            .with_candles("SBER", table(&[("2025-06-02 10:00:00", 1.0, 1.0, 1.0, 1.0, 1)]))
            .with_price("SBER", 3.0);
        let (_dir, svc) = service(client);

        let h = svc
            .history("SBER", Granularity::Minute10, Some(at("2025-06-02 00:00:00")))
            .await
            .unwrap();
        assert_eq!(h.count, 2);
        assert_eq!(h.points[1].volume, 0);
        assert!((h.points[1].open - 1.0).abs() < f64::EPSILON);
        assert!((h.points[1].close - 3.0).abs() < f64::EPSILON);
        // Echoed as a date even for intraday intervals.
        assert_eq!(h.from, "2025-06-02");
    }
}
