// =============================================================================
// Candle Store — one CSV ledger per (instrument, granularity)
// =============================================================================
//
// Layout under the data directory:
//   SBER.csv       daily candles (the historical default)
//   SBER_10.csv    any other granularity, suffixed by its interval code
//
// Reads never go through a ledger: they re-scan the file on every call, may
// run concurrently with each other and with an in-flight append, and never
// fail on an individual malformed row.
// =============================================================================

pub mod ledger;
pub mod rows;

use std::path::PathBuf;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{Candle, Granularity};

pub use ledger::CandleLedger;
use rows::Row;

/// Outcome of a full scan of one candle file.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Parsed candles, ascending by time.
    pub candles: Vec<Candle>,
    /// Rows with fewer than seven fields.
    pub short_rows: usize,
    /// Rows with enough fields where one failed to parse.
    pub unparseable_rows: usize,
    /// Well-formed rows naming another instrument.
    pub foreign_rows: usize,
}

impl ScanReport {
    pub fn skipped(&self) -> usize {
        self.short_rows + self.unparseable_rows + self.foreign_rows
    }
}

/// Directory-level handle. Cheap to clone; holds no file state.
#[derive(Debug, Clone)]
pub struct CandleStore {
    root: PathBuf,
}

impl CandleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File backing `(instrument, granularity)`. `instrument` must already be
    /// normalized.
    pub fn path_for(&self, instrument: &str, granularity: Granularity) -> PathBuf {
        let name = match granularity {
            Granularity::Day => format!("{instrument}.csv"),
            other => format!("{instrument}_{}.csv", other.code()),
        };
        self.root.join(name)
    }

    /// Open the single writer for `(instrument, granularity)`.
    pub fn open_ledger(
        &self,
        instrument: &str,
        granularity: Granularity,
    ) -> Result<CandleLedger, StoreError> {
        CandleLedger::open(self.path_for(instrument, granularity), instrument, granularity)
    }

    /// Full scan with per-category skip counts. A missing file is an empty
    /// report, not an error.
    pub fn scan(&self, instrument: &str, granularity: Granularity) -> Result<ScanReport, StoreError> {
        let path = self.path_for(instrument, granularity);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "candle file not found");
                return Ok(ScanReport::default());
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut report = ScanReport::default();
        let mut rdr = rows::reader(&bytes);
        for rec in rdr.byte_records() {
            let rec = rec.map_err(|e| StoreError::csv(&path, e))?;
            match rows::decode(&rec) {
                Row::Candle(c) if c.instrument.eq_ignore_ascii_case(instrument) => {
                    report.candles.push(c)
                }
                Row::Candle(c) => {
                    report.foreign_rows += 1;
                    if report.foreign_rows <= 3 {
                        warn!(
                            path = %path.display(),
                            found = %c.instrument,
                            "skipping row for foreign instrument"
                        );
                    }
                }
                Row::Blank | Row::Header => {}
                Row::Short(fields) => {
                    report.short_rows += 1;
                    if report.short_rows <= 3 {
                        warn!(path = %path.display(), fields, "skipping short row");
                    }
                }
                Row::Unparseable(reason) => {
                    report.unparseable_rows += 1;
                    if report.unparseable_rows <= 3 {
                        warn!(path = %path.display(), %reason, "skipping unparseable row");
                    }
                }
            }
        }

        // On-disk order is arrival order, not time order.
        report.candles.sort_by_key(|c| c.time);

        if report.skipped() > 0 {
            warn!(
                path = %path.display(),
                short = report.short_rows,
                unparseable = report.unparseable_rows,
                foreign = report.foreign_rows,
                "malformed rows skipped during read"
            );
        }
        debug!(path = %path.display(), rows = report.candles.len(), "candle file read");
        Ok(report)
    }

    /// Every stored candle, ascending by time.
    pub fn read_all(
        &self,
        instrument: &str,
        granularity: Granularity,
    ) -> Result<Vec<Candle>, StoreError> {
        Ok(self.scan(instrument, granularity)?.candles)
    }

    /// Latest stored bucket start, or `None` for an absent or header-only file.
    pub fn last_timestamp(
        &self,
        instrument: &str,
        granularity: Granularity,
    ) -> Result<Option<NaiveDateTime>, StoreError> {
        Ok(self
            .scan(instrument, granularity)?
            .candles
            .last()
            .map(|c| c.time))
    }
}

// =============================================================================
// Tests
// =============================================================================
