// =============================================================================
// Normalization — upstream column/row table into candles
// =============================================================================
//
// Required fields are located by column name once per response. A missing
// column rejects the whole response; a bad cell rejects only its row. Nothing
// is ever zero-filled.
// =============================================================================

use tracing::{debug, warn};

use crate::error::ClientError;
use crate::market_data::{value_as_f64, value_as_u64, RawCandles};
use crate::types::{parse_wall_clock, Candle};

pub const REQUIRED_COLUMNS: [&str; 6] = ["open", "close", "high", "low", "volume", "begin"];

/// Positions of the required columns within one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnIndex {
    pub open: usize,
    pub high: usize,
    pub low: usize,
    pub close: usize,
    pub volume: usize,
    pub begin: usize,
}

impl ColumnIndex {
    pub fn resolve(columns: &[String]) -> Result<Self, ClientError> {
        let find = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|name| find(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ClientError::MalformedResponse(format!(
                "missing required columns: {}",
                missing.join(", ")
            )));
        }

        // All present, checked above.
        let at = |name: &str| find(name).unwrap_or_default();
        Ok(Self {
            open: at("open"),
            high: at("high"),
            low: at("low"),
            close: at("close"),
            volume: at("volume"),
            begin: at("begin"),
        })
    }
}

/// Normalized batch plus the number of rows that had to be dropped.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub candles: Vec<Candle>,
    pub rejected_rows: usize,
}

/// Normalize `raw` for `instrument` (already uppercase).
pub fn normalize(instrument: &str, raw: &RawCandles) -> Result<Normalized, ClientError> {
    let idx = ColumnIndex::resolve(&raw.columns)?;
    let mut out = Normalized {
        candles: Vec::with_capacity(raw.rows.len()),
        rejected_rows: 0,
    };

    for (i, row) in raw.rows.iter().enumerate() {
        match parse_row(instrument, &idx, row) {
            Some(c) => out.candles.push(c),
            None => {
                out.rejected_rows += 1;
                debug!(instrument, row = i, "dropping unparseable upstream row");
            }
        }
    }

    if out.rejected_rows > 0 {
        warn!(
            instrument,
            rejected = out.rejected_rows,
            kept = out.candles.len(),
            "upstream rows dropped during normalization"
        );
    }
    Ok(out)
}

fn parse_row(instrument: &str, idx: &ColumnIndex, row: &[serde_json::Value]) -> Option<Candle> {
    let num = |i: usize| row.get(i).and_then(value_as_f64);
    Some(Candle {
        instrument: instrument.to_string(),
        time: parse_wall_clock(row.get(idx.begin)?.as_str()?)?,
        open: num(idx.open)?,
        high: num(idx.high)?,
        low: num(idx.low)?,
        close: num(idx.close)?,
        volume: row.get(idx.volume).and_then(value_as_u64)?,
    })
}
