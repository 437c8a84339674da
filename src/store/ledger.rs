// =============================================================================
// CandleLedger — append-only, deduplicated writer for one candle file
// =============================================================================
//
// The key index is built by a single scan when the ledger is opened and then
// maintained incrementally, so appends never rescan the file.
//
// Appending takes `&mut self`: holding a ledger is the single-writer
// capability for its file. The ingestion pipeline hands ledgers out under a
// per-instrument lock; nothing here locks internally.
//
// Every row is written with one `write_all` on an append-mode handle, so a
// concurrent reader sees either the full row or nothing of it.
// =============================================================================

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::rows::{self, Row};
use crate::types::{Candle, CandleKey, Granularity};

pub struct CandleLedger {
    instrument: String,
    granularity: Granularity,
    path: PathBuf,
    index: HashSet<CandleKey>,
    last_time: Option<NaiveDateTime>,
    /// File exists and is non-empty (header already present).
    initialised: bool,
    /// Previous writer died mid-line; the next append starts a fresh line.
    needs_newline: bool,
}

impl CandleLedger {
    /// Open the ledger at `path`, scanning any existing content once.
    pub fn open(
        path: impl Into<PathBuf>,
        instrument: &str,
        granularity: Granularity,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let mut ledger = Self {
            instrument: instrument.to_ascii_uppercase(),
            granularity,
            path,
            index: HashSet::new(),
            last_time: None,
            initialised: false,
            needs_newline: false,
        };

        let bytes = match std::fs::read(&ledger.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %ledger.path.display(), "ledger file absent, starting empty");
                return Ok(ledger);
            }
            Err(e) => return Err(StoreError::io(&ledger.path, e)),
        };

        ledger.initialised = !bytes.is_empty();
        ledger.needs_newline = bytes.last().is_some_and(|b| *b != b'\n');

        let mut skipped = 0usize;
        let mut rdr = rows::reader(&bytes);
        for rec in rdr.byte_records() {
            let rec = rec.map_err(|e| StoreError::csv(&ledger.path, e))?;
            // Only rows a reader would return count; torn or foreign rows
            // must not block a retry or move the cursor.
            match rows::decode(&rec) {
                Row::Candle(c) if c.instrument.eq_ignore_ascii_case(&ledger.instrument) => {
                    ledger.last_time = ledger.last_time.max(Some(c.time));
                    ledger.index.insert(c.key());
                }
                Row::Candle(_) | Row::Short(_) | Row::Unparseable(_) => skipped += 1,
                Row::Blank | Row::Header => {}
            }
        }

        info!(
            instrument = %ledger.instrument,
            interval = %granularity,
            keys = ledger.index.len(),
            skipped,
            "ledger opened"
        );
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct keys on disk.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Latest stored bucket start; the ingestion cursor.
    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.last_time
    }

    /// Append every candle whose key is not yet stored and return how many
    /// rows were written.
    ///
    /// First write wins: a candle whose key already exists (on disk or earlier
    /// in the same batch) is dropped, even if its values differ. Candles for a
    /// different instrument are rejected.
    pub fn append(&mut self, candles: &[Candle]) -> Result<usize, StoreError> {
        let mut batch_keys: HashSet<CandleKey> = HashSet::with_capacity(candles.len());
        let mut fresh: Vec<&Candle> = Vec::new();

        for c in candles {
            if !c.instrument.eq_ignore_ascii_case(&self.instrument) {
                warn!(
                    ledger = %self.instrument,
                    candle = %c.instrument,
                    "candle for foreign instrument rejected"
                );
                continue;
            }
            let key = CandleKey {
                instrument: self.instrument.clone(),
                time: c.time,
            };
            if self.index.contains(&key) || !batch_keys.insert(key) {
                continue;
            }
            fresh.push(c);
        }

        if fresh.is_empty() {
            debug!(instrument = %self.instrument, offered = candles.len(), "nothing new to append");
            return Ok(0);
        }

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;

        if self.needs_newline {
            file.write_all(b"\n")
                .map_err(|e| StoreError::io(&self.path, e))?;
            self.needs_newline = false;
        }

        if !self.initialised {
            let header = rows::encode_header().map_err(|e| StoreError::csv(&self.path, e))?;
            file.write_all(&header)
                .map_err(|e| StoreError::io(&self.path, e))?;
            self.initialised = true;
        }

        let mut written = 0usize;
        for c in fresh {
            let row = Candle {
                instrument: self.instrument.clone(),
                ..c.clone()
            };
            let line = rows::encode_candle(&row).map_err(|e| StoreError::csv(&self.path, e))?;
            file.write_all(&line)
                .map_err(|e| StoreError::io(&self.path, e))?;

            // Index only what actually reached the file.
            self.last_time = self.last_time.max(Some(row.time));
            self.index.insert(row.key());
            written += 1;
        }

        file.sync_data()
            .map_err(|e| StoreError::io(&self.path, e))?;

        debug!(instrument = %self.instrument, written, total = self.index.len(), "rows appended");
        Ok(written)
    }
}

impl std::fmt::Debug for CandleLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleLedger")
            .field("instrument", &self.instrument)
            .field("granularity", &self.granularity)
            .field("path", &self.path)
            .field("keys", &self.index.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_wall_clock;

    fn candle(time: &str, close: f64) -> Candle {
        Candle {
            instrument: "SBER".into(),
            time: parse_wall_clock(time).unwrap(),
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close,
            volume: 100,
        }
    }

    fn open(dir: &tempfile::TempDir) -> CandleLedger {
        CandleLedger::open(dir.path().join("SBER.csv"), "sber", Granularity::Day).unwrap()
    }

    #[test]
    fn first_append_creates_file_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(&dir);
        assert!(ledger.is_empty());
        assert_eq!(ledger.last_timestamp(), None);

        let n = ledger.append(&[candle("2025-01-01 00:00:00", 11.0)]).unwrap();
        assert_eq!(n, 1);

        let text = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(
            text,
            "instrument,time,open,high,low,close,volume\n\
             SBER,2025-01-01 00:00:00,10,12,9,11,100\n"
        );
    }

    #[test]
    fn reappending_same_batch_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(&dir);
        let batch = vec![
            candle("2025-01-02 00:00:00", 11.0),
            candle("2025-01-01 00:00:00", 10.5),
        ];

        assert_eq!(ledger.append(&batch).unwrap(), 2);
        let before = std::fs::read(ledger.path()).unwrap();

        assert_eq!(ledger.append(&batch).unwrap(), 0);
        let after = std::fs::read(ledger.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn duplicates_within_a_batch_keep_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(&dir);
        let n = ledger
            .append(&[
                candle("2025-01-01 00:00:00", 11.0),
                candle("2025-01-01 00:00:00", 99.0),
            ])
            .unwrap();
        assert_eq!(n, 1);
        let text = std::fs::read_to_string(ledger.path()).unwrap();
        assert!(text.contains(",11,100"));
        assert!(!text.contains(",99,"));
    }

    #[test]
    fn reopen_rebuilds_index_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = open(&dir);
            ledger
                .append(&[
                    candle("2025-01-03 00:00:00", 12.0),
                    candle("2025-01-01 00:00:00", 10.0),
                ])
                .unwrap();
        }

        let mut ledger = open(&dir);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.last_timestamp(), parse_wall_clock("2025-01-03 00:00:00"));
        assert_eq!(ledger.append(&[candle("2025-01-01 00:00:00", 50.0)]).unwrap(), 0);
        assert_eq!(ledger.append(&[candle("2025-01-02 00:00:00", 11.0)]).unwrap(), 1);
        // Cursor is the max, not the most recently written.
        assert_eq!(ledger.last_timestamp(), parse_wall_clock("2025-01-03 00:00:00"));
    }

    #[test]
    fn header_only_file_has_no_cursor_and_no_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SBER.csv");
        std::fs::write(&path, "instrument,time,open,high,low,close,volume\n").unwrap();

        let mut ledger = CandleLedger::open(&path, "SBER", Granularity::Day).unwrap();
        assert_eq!(ledger.last_timestamp(), None);
        ledger.append(&[candle("2025-01-01 00:00:00", 11.0)]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("instrument,time").count(), 1);
    }

    #[test]
    fn torn_tail_is_terminated_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SBER.csv");
        std::fs::write(
            &path,
            "instrument,time,open,high,low,close,volume\nSBER,2025-01-01 00:00:00,10,1",
        )
        .unwrap();

        let mut ledger = CandleLedger::open(&path, "SBER", Granularity::Day).unwrap();
        assert_eq!(ledger.append(&[candle("2025-01-02 00:00:00", 11.0)]).unwrap(), 1);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("10,1\nSBER,2025-01-02 00:00:00,10,12,9,11,100\n"));
    }

    #[test]
    fn retry_after_torn_row_makes_the_candle_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SBER.csv");
        std::fs::write(
            &path,
            "instrument,time,open,high,low,close,volume\n\
             SBER,2025-01-01 00:00:00,10,12,9,11,100\n\
             SBER,2025-01-02 00:00:00,10,1",
        )
        .unwrap();

        let mut ledger = CandleLedger::open(&path, "SBER", Granularity::Day).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.last_timestamp(), parse_wall_clock("2025-01-01 00:00:00"));

        let batch = [candle("2025-01-01 00:00:00", 11.0), candle("2025-01-02 00:00:00", 12.0)];
        assert_eq!(ledger.append(&batch).unwrap(), 1);
        assert_eq!(ledger.append(&batch).unwrap(), 0);

        let store = crate::store::CandleStore::new(dir.path());
        let all = store.read_all("SBER", Granularity::Day).unwrap();
        assert_eq!(all.len(), 2);
        assert!((all[1].close - 12.0).abs() < f64::EPSILON);
        assert_eq!(ledger.last_timestamp(), store.last_timestamp("SBER", Granularity::Day).unwrap());
    }

    #[test]
    fn malformed_or_foreign_rows_do_not_move_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SBER.csv");
        std::fs::write(
            &path,
            "instrument,time,open,high,low,close,volume\n\
             SBER,2025-01-01 00:00:00,10,12,9,11,100\n\
             SBER,2099-01-01 00:00:00,x\n\
             SBER,2098-01-01 00:00:00,x,12,9,11,100\n\
             GAZP,2097-01-01 00:00:00,10,12,9,11,100\n",
        )
        .unwrap();

        let ledger = CandleLedger::open(&path, "SBER", Granularity::Day).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.last_timestamp(), parse_wall_clock("2025-01-01 00:00:00"));
    }

    #[test]
    fn foreign_instrument_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = open(&dir);
        let mut gazp = candle("2025-01-01 00:00:00", 11.0);
        gazp.instrument = "GAZP".into();
        assert_eq!(ledger.append(&[gazp]).unwrap(), 0);
        assert!(!ledger.path().exists());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("SBER.csv");
        let mut ledger = CandleLedger::open(&path, "SBER", Granularity::Day).unwrap();
        assert_eq!(ledger.append(&[candle("2025-01-01 00:00:00", 11.0)]).unwrap(), 1);
        assert!(path.exists());
    }
}
