// =============================================================================
// Live Candle Compositor — closed history plus the unclosed current bucket
// =============================================================================
//
// Output is transient: nothing composed here is ever written to the store.
// Only sub-hour granularities are composited; every other granularity passes
// through unchanged. Missing or slow prices degrade to history-only output,
// never to an error.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use tracing::{debug, warn};

use crate::market_data::MarketDataClient;
use crate::types::{Candle, ExchangeClock, Granularity};

/// Start of the bucket containing `now` (exchange-local). Buckets are aligned
/// to local midnight and half-open, so a boundary instant opens a new bucket.
/// `None` for granularities without a fixed sub-day length.
pub fn interval_start(now: NaiveDateTime, granularity: Granularity) -> Option<NaiveDateTime> {
    let step = granularity.fixed_duration()?.num_seconds();
    if step <= 0 || step > 86_400 {
        return None;
    }
    let midnight = now.date().and_time(NaiveTime::MIN);
    let elapsed = (now - midnight).num_seconds();
    Some(midnight + chrono::Duration::seconds(elapsed - elapsed % step))
}

/// Pure compositing step. `now` is exchange-local wall-clock time.
pub fn compose_at(
    instrument: &str,
    mut stored: Vec<Candle>,
    price: Option<f64>,
    now: NaiveDateTime,
    granularity: Granularity,
) -> Vec<Candle> {
    if !granularity.supports_live_candle() {
        return stored;
    }
    let Some(price) = price.filter(|p| p.is_finite()) else {
        return stored;
    };
    let Some(start) = interval_start(now, granularity) else {
        return stored;
    };

    match stored.last_mut() {
        Some(last) if last.time == start => {
            last.high = last.high.max(price);
            last.low = last.low.min(price);
            last.close = price;
        }
        Some(last) if last.time > start => {
            // Stored data is ahead of the clock; leave it alone.
            debug!(instrument, last = %last.time, "stored tail is newer than current bucket");
        }
        last => {
            let open = last.map(|c| c.close).unwrap_or(price);
            stored.push(Candle {
                instrument: instrument.to_string(),
                time: start,
                open,
                high: open.max(price),
                low: open.min(price),
                close: price,
                volume: 0,
            });
        }
    }
    stored
}

/// Fetches one last price per call and composes it onto stored history.
#[derive(Debug, Clone)]
pub struct LiveCompositor {
    clock: ExchangeClock,
    price_timeout: Duration,
}

impl LiveCompositor {
    pub fn new(clock: ExchangeClock, price_timeout: Duration) -> Self {
        Self {
            clock,
            price_timeout,
        }
    }

    pub fn compose(
        &self,
        instrument: &str,
        stored: Vec<Candle>,
        price: Option<f64>,
        now: DateTime<Utc>,
        granularity: Granularity,
    ) -> Vec<Candle> {
        compose_at(instrument, stored, price, self.clock.to_local(now), granularity)
    }

    /// Look up the last price (bounded by the price timeout) and compose.
    pub async fn compose_live<C: MarketDataClient>(
        &self,
        client: &C,
        instrument: &str,
        stored: Vec<Candle>,
        granularity: Granularity,
    ) -> Vec<Candle> {
        if !granularity.supports_live_candle() {
            return stored;
        }

        let lookup = client.fetch_last_price(instrument);
        let price = match tokio::time::timeout(self.price_timeout, lookup).await {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                warn!(instrument, error = %e, "last price unavailable, serving history only");
                None
            }
            Err(_) => {
                warn!(
                    instrument,
                    timeout_ms = self.price_timeout.as_millis() as u64,
                    "last price timed out, serving history only"
                );
                None
            }
        };

        self.compose(instrument, stored, price, Utc::now(), granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::fake::FakeClient;
    use crate::types::parse_wall_clock;

    fn at(s: &str) -> NaiveDateTime {
        parse_wall_clock(s).unwrap()
    }

    fn candle(time: &str, o: f64, h: f64, l: f64, c: f64, v: u64) -> Candle {
        Candle {
            instrument: "SBER".into(),
            time: at(time),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < f64::EPSILON
    }

    #[test]
    fn interval_start_floors_to_bucket() {
        assert_eq!(
            interval_start(at("2025-01-01 10:07:59"), Granularity::Minute10),
            Some(at("2025-01-01 10:00:00"))
        );
        assert_eq!(
            interval_start(at("2025-01-01 10:10:00"), Granularity::Minute10),
            Some(at("2025-01-01 10:10:00"))
        );
        assert_eq!(
            interval_start(at("2025-01-01 10:02:10"), Granularity::Minute1),
            Some(at("2025-01-01 10:02:00"))
        );
        assert_eq!(interval_start(at("2025-01-01 10:02:10"), Granularity::Month), None);
    }

    #[test]
    fn current_bucket_is_updated_as_a_copy() {
        let stored = vec![candle("2025-01-01 10:00:00", 100.0, 104.0, 99.0, 101.0, 500)];
        let out = compose_at(
            "SBER",
            stored.clone(),
            Some(105.0),
            at("2025-01-01 10:00:30"),
            Granularity::Minute1,
        );
        assert_eq!(out.len(), 1);
        let c = &out[0];
        assert!(approx(c.open, 100.0));
        assert!(approx(c.high, 105.0));
        assert!(approx(c.low, 99.0));
        assert!(approx(c.close, 105.0));
        assert_eq!(c.volume, 500);
        // Input untouched.
        assert!(approx(stored[0].close, 101.0));
    }

    #[test]
    fn new_bucket_is_synthesized_from_previous_close() {
        let stored = vec![candle("2025-01-01 10:00:00", 100.0, 106.0, 99.0, 105.0, 500)];
        let out = compose_at(
            "SBER",
            stored,
            Some(107.0),
            at("2025-01-01 10:02:10"),
            Granularity::Minute1,
        );
        assert_eq!(out.len(), 2);
        let c = &out[1];
        assert_eq!(c.time, at("2025-01-01 10:02:00"));
        assert!(approx(c.open, 105.0));
        assert!(approx(c.high, 107.0));
        assert!(approx(c.low, 105.0));
        assert!(approx(c.close, 107.0));
        assert_eq!(c.volume, 0);
    }

    #[test]
    fn boundary_instant_opens_a_new_bucket() {
        let stored = vec![candle("2025-01-01 10:00:00", 100.0, 101.0, 99.0, 100.0, 1)];
        let out = compose_at(
            "SBER",
            stored,
            Some(98.0),
            at("2025-01-01 10:10:00"),
            Granularity::Minute10,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].time, at("2025-01-01 10:10:00"));
        assert!(approx(out[1].low, 98.0));
        assert!(approx(out[1].high, 100.0));
    }

    #[test]
    fn missing_price_or_history_edge_cases() {
        let stored = vec![candle("2025-01-01 10:00:00", 1.0, 1.0, 1.0, 1.0, 1)];
        let now = at("2025-01-01 10:05:00");

        assert_eq!(
            compose_at("SBER", stored.clone(), None, now, Granularity::Minute1),
            stored
        );
        assert!(compose_at("SBER", Vec::new(), None, now, Granularity::Minute1).is_empty());
        assert_eq!(
            compose_at("SBER", stored.clone(), Some(f64::NAN), now, Granularity::Minute1),
            stored
        );

        let out = compose_at("SBER", Vec::new(), Some(50.0), now, Granularity::Minute1);
        assert_eq!(out.len(), 1);
        assert!(approx(out[0].open, 50.0));
        assert!(approx(out[0].high, 50.0));
        assert!(approx(out[0].low, 50.0));
    }

    #[test]
    fn hourly_and_longer_pass_through() {
        let stored = vec![candle("2025-01-01 10:00:00", 1.0, 1.0, 1.0, 1.0, 1)];
        for g in [Granularity::Hour1, Granularity::Day, Granularity::Week, Granularity::Month] {
            let out = compose_at("SBER", stored.clone(), Some(9.0), at("2025-01-01 12:30:00"), g);
            assert_eq!(out, stored);
        }
    }

    #[test]
    fn compose_converts_utc_to_exchange_time() {
        use chrono::TimeZone;
        let compositor = LiveCompositor::new(ExchangeClock::default(), Duration::from_secs(1));
        let stored = vec![candle("2025-01-01 10:00:00", 100.0, 104.0, 99.0, 101.0, 500)];
        // 07:00:30Z is 10:00:30 in UTC+3.
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 7, 0, 30).unwrap();
        let out = compositor.compose("SBER", stored, Some(105.0), now, Granularity::Minute1);
        assert_eq!(out.len(), 1);
        assert!(approx(out[0].close, 105.0));
    }

    #[tokio::test]
    async fn slow_price_degrades_to_history() {
        let client = FakeClient {
            price_delay: Some(Duration::from_millis(200)),
            ..FakeClient::default()
        }
        .with_price("SBER", 10.0);
        let compositor = LiveCompositor::new(ExchangeClock::default(), Duration::from_millis(20));

        let out = compositor
            .compose_live(&client, "SBER", Vec::new(), Granularity::Minute1)
            .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn non_live_granularity_skips_the_price_lookup() {
        use std::sync::atomic::Ordering;
        let client = FakeClient::default().with_price("SBER", 10.0);
        let compositor = LiveCompositor::new(ExchangeClock::default(), Duration::from_secs(1));

        let out = compositor
            .compose_live(&client, "SBER", Vec::new(), Granularity::Day)
            .await;
        assert!(out.is_empty());
        assert_eq!(client.price_calls.load(Ordering::Relaxed), 0);

        let out = compositor
            .compose_live(&client, "SBER", Vec::new(), Granularity::Minute10)
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(client.price_calls.load(Ordering::Relaxed), 1);
    }
}
