// =============================================================================
// Candle Rows — CSV encoding and tolerant decoding of persisted rows
// =============================================================================

use chrono::NaiveDateTime;
use csv::{ByteRecord, StringRecord};

use crate::types::{parse_wall_clock, Candle, TIME_FORMAT};

pub const HEADER: [&str; 7] = ["instrument", "time", "open", "high", "low", "close", "volume"];

/// Number of fields a complete row carries.
pub const FIELD_COUNT: usize = HEADER.len();

/// What a single physical row turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Blank,
    Header,
    Candle(Candle),
    /// Fewer than [`FIELD_COUNT`] fields; carries the count seen.
    Short(usize),
    /// Enough fields, but one of them did not parse.
    Unparseable(String),
}

/// Encode the header line, terminator included.
pub fn encode_header() -> Result<Vec<u8>, csv::Error> {
    encode_record(&HEADER)
}

/// Encode one candle as a complete CSV line, terminator included, so it can
/// be appended with a single write.
pub fn encode_candle(c: &Candle) -> Result<Vec<u8>, csv::Error> {
    encode_record(&[
        c.instrument.clone(),
        c.time.format(TIME_FORMAT).to_string(),
        c.open.to_string(),
        c.high.to_string(),
        c.low.to_string(),
        c.close.to_string(),
        c.volume.to_string(),
    ])
}

fn encode_record<I, T>(fields: I) -> Result<Vec<u8>, csv::Error>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(64));
    wtr.write_record(fields)?;
    wtr.into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// Reader configured for the persisted layout: no implicit header, ragged
/// rows allowed, whitespace trimmed.
pub fn reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes)
}

fn is_header(rec: &StringRecord) -> bool {
    let first = rec.get(0).unwrap_or("");
    let second = rec.get(1).unwrap_or("");
    first.eq_ignore_ascii_case("instrument")
        || first.eq_ignore_ascii_case("ticker")
        || second.eq_ignore_ascii_case("time")
}

/// Classify one raw record.
pub fn decode(raw: &ByteRecord) -> Row {
    let rec = match StringRecord::from_byte_record(raw.clone()) {
        Ok(r) => r,
        Err(e) => return Row::Unparseable(format!("invalid UTF-8: {e}")),
    };

    if rec.iter().all(|f| f.is_empty()) {
        return Row::Blank;
    }
    if is_header(&rec) {
        return Row::Header;
    }
    if rec.len() < FIELD_COUNT {
        return Row::Short(rec.len());
    }

    match parse_candle(&rec) {
        Ok(c) => Row::Candle(c),
        Err(msg) => Row::Unparseable(msg),
    }
}

fn parse_candle(rec: &StringRecord) -> Result<Candle, String> {
    let instrument = rec[0].to_ascii_uppercase();
    if instrument.is_empty() {
        return Err("empty instrument".into());
    }
    let time: NaiveDateTime =
        parse_wall_clock(&rec[1]).ok_or_else(|| format!("bad time {:?}", &rec[1]))?;

    let price = |idx: usize, name: &str| -> Result<f64, String> {
        rec[idx]
            .parse::<f64>()
            .map_err(|_| format!("bad {name} {:?}", &rec[idx]))
    };

    Ok(Candle {
        instrument,
        time,
        open: price(2, "open")?,
        high: price(3, "high")?,
        low: price(4, "low")?,
        close: price(5, "close")?,
        volume: parse_volume(&rec[6]).ok_or_else(|| format!("bad volume {:?}", &rec[6]))?,
    })
}

/// Integer volume; tolerates a trailing `.0` written by other tools.
fn parse_volume(s: &str) -> Option<u64> {
    if let Ok(v) = s.parse::<u64>() {
        return Some(v);
    }
    let f = s.parse::<f64>().ok()?;
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0).then_some(f as u64)
}
