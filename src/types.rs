// =============================================================================
// Shared types used across the candle ledger
// =============================================================================

use chrono::{DateTime, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock format used both on disk and by the upstream `begin` column.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Date-only format accepted for query parameters and upstream `from`.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// One time bucket of trading activity for one instrument.
///
/// `time` is the bucket start in exchange-local wall-clock time; no offset is
/// stored alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub instrument: String,
    pub time: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            instrument: self.instrument.clone(),
            time: self.time,
        }
    }
}

/// Natural key of a stored candle.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CandleKey {
    pub instrument: String,
    pub time: NaiveDateTime,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument, self.time.format(TIME_FORMAT))
    }
}

/// JSON shape handed to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandlePoint {
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl From<&Candle> for CandlePoint {
    fn from(c: &Candle) -> Self {
        Self {
            time: c.time.format(TIME_FORMAT).to_string(),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }
}

/// Uppercase and validate an instrument identifier.
///
/// Returns `None` for empty input or anything outside ASCII alphanumerics.
pub fn normalize_instrument(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(trimmed.to_ascii_uppercase())
}

/// Parse either `YYYY-MM-DD HH:MM:SS` or a bare `YYYY-MM-DD` (midnight).
pub fn parse_wall_clock(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

// =============================================================================
// Granularity
// =============================================================================

/// Candle bucket size, identified upstream by a numeric interval code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Granularity {
    Minute1,
    Minute10,
    Hour1,
    Day,
    Week,
    Month,
}

impl Granularity {
    pub const ALL: [Granularity; 6] = [
        Self::Minute1,
        Self::Minute10,
        Self::Hour1,
        Self::Day,
        Self::Week,
        Self::Month,
    ];

    /// Upstream interval code.
    pub fn code(self) -> u32 {
        match self {
            Self::Minute1 => 1,
            Self::Minute10 => 10,
            Self::Hour1 => 60,
            Self::Day => 24,
            Self::Week => 7,
            Self::Month => 31,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.code() == code)
    }

    /// Minute and hour buckets; these carry a time-of-day in `from`.
    pub fn is_intraday(self) -> bool {
        matches!(self, Self::Minute1 | Self::Minute10 | Self::Hour1)
    }

    /// Sub-hour buckets where an in-progress candle is worth drawing.
    pub fn supports_live_candle(self) -> bool {
        matches!(self, Self::Minute1 | Self::Minute10)
    }

    /// Fixed bucket length. Calendar months have none.
    pub fn fixed_duration(self) -> Option<Duration> {
        match self {
            Self::Minute1 => Some(Duration::minutes(1)),
            Self::Minute10 => Some(Duration::minutes(10)),
            Self::Hour1 => Some(Duration::hours(1)),
            Self::Day => Some(Duration::days(1)),
            Self::Week => Some(Duration::days(7)),
            Self::Month => None,
        }
    }

    /// Advance `t` by exactly one bucket.
    pub fn step_forward(self, t: NaiveDateTime) -> NaiveDateTime {
        match self.fixed_duration() {
            Some(d) => t + d,
            None => t
                .checked_add_months(Months::new(1))
                .unwrap_or(t + Duration::days(31)),
        }
    }

    /// Render a window start the way the upstream `from` parameter expects.
    pub fn format_from(self, t: NaiveDateTime) -> String {
        if self.is_intraday() {
            t.format(TIME_FORMAT).to_string()
        } else {
            t.format(DATE_FORMAT).to_string()
        }
    }
}

impl TryFrom<u32> for Granularity {
    type Error = String;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unsupported interval code {code}"))
    }
}

impl From<Granularity> for u32 {
    fn from(g: Granularity) -> Self {
        g.code()
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minute1 => write!(f, "1m"),
            Self::Minute10 => write!(f, "10m"),
            Self::Hour1 => write!(f, "1h"),
            Self::Day => write!(f, "1d"),
            Self::Week => write!(f, "1w"),
            Self::Month => write!(f, "1M"),
        }
    }
}

// =============================================================================
// ExchangeClock
// =============================================================================

/// Fixed-offset view of "now" in exchange-local wall-clock time.
///
/// Interval boundaries are always computed through this, never through the
/// host's time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeClock {
    offset: FixedOffset,
}

impl ExchangeClock {
    /// `None` when the offset is outside +-24h.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.offset).naive_local()
    }

    pub fn now_local(&self) -> NaiveDateTime {
        self.to_local(Utc::now())
    }
}

impl Default for ExchangeClock {
    /// Moscow Exchange: UTC+03:00, no DST.
    fn default() -> Self {
        Self {
            offset: FixedOffset::east_opt(3 * 3600).expect("UTC+3 is a valid offset"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
