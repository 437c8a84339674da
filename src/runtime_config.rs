// =============================================================================
// Runtime Configuration — data location, upstream endpoint, ingestion knobs
// =============================================================================
//
// Loaded from a JSON file, then overridden from the environment (`.env` is
// honoured by `main`). All fields carry `#[serde(default)]` so that a partial
// or older config file still loads.
// =============================================================================

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::IssSettings;
use crate::types::{normalize_instrument, ExchangeClock, Granularity};

/// Largest offset accepted for the exchange clock, in minutes.
const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("storage/securities")
}

fn default_instruments() -> Vec<String> {
    vec!["SBER".to_string()]
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_iss_base_url() -> String {
    "https://iss.moex.com/iss".to_string()
}

fn default_board() -> String {
    "TQBR".to_string()
}

fn default_candle_timeout_secs() -> u64 {
    30
}

fn default_price_timeout_secs() -> u64 {
    5
}

fn default_exchange_utc_offset_minutes() -> i32 {
    180
}

fn default_ingest_parallelism() -> usize {
    4
}

fn default_interval() -> u32 {
    Granularity::Day.code()
}

fn default_max_pages() -> usize {
    20
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Storage -------------------------------------------------------------

    /// Directory holding one CSV file per instrument and granularity.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Allow-list of instruments served and ingested.
    #[serde(default = "default_instruments")]
    pub instruments: Vec<String>,

    // --- HTTP ----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Upstream ------------------------------------------------------------

    #[serde(default = "default_iss_base_url")]
    pub iss_base_url: String,

    /// Trading board the securities are quoted on.
    #[serde(default = "default_board")]
    pub board: String,

    #[serde(default = "default_candle_timeout_secs")]
    pub candle_timeout_secs: u64,

    /// Bound on the last-price lookup used for live candles.
    #[serde(default = "default_price_timeout_secs")]
    pub price_timeout_secs: u64,

    /// Skip TLS certificate verification for the upstream only.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,

    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    // --- Time & ingestion ----------------------------------------------------

    /// Fixed exchange offset from UTC; 180 is Moscow.
    #[serde(default = "default_exchange_utc_offset_minutes")]
    pub exchange_utc_offset_minutes: i32,

    #[serde(default = "default_ingest_parallelism")]
    pub ingest_parallelism: usize,

    /// Interval code used when a request or CLI call names none.
    #[serde(default = "default_interval")]
    pub default_interval: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            instruments: default_instruments(),
            bind_addr: default_bind_addr(),
            iss_base_url: default_iss_base_url(),
            board: default_board(),
            candle_timeout_secs: default_candle_timeout_secs(),
            price_timeout_secs: default_price_timeout_secs(),
            accept_invalid_certs: default_true(),
            max_pages: default_max_pages(),
            exchange_utc_offset_minutes: default_exchange_utc_offset_minutes(),
            ingest_parallelism: default_ingest_parallelism(),
            default_interval: default_interval(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = ?config.instruments,
            data_dir = %config.data_dir.display(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply `CANDLE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("CANDLE_DATA_DIR").filter(|s| !s.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir.trim());
        }
        if let Some(list) = lookup("CANDLE_INSTRUMENTS") {
            self.instruments = list
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(addr) = lookup("CANDLE_BIND_ADDR").filter(|s| !s.trim().is_empty()) {
            self.bind_addr = addr.trim().to_string();
        }
        if let Some(url) = lookup("CANDLE_ISS_BASE_URL").filter(|s| !s.trim().is_empty()) {
            self.iss_base_url = url.trim().to_string();
        }
    }

    /// Reject settings the engine cannot run with. Instruments are normalized
    /// in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.ingest_parallelism == 0 {
            bail!("ingest_parallelism must be at least 1");
        }
        if self.exchange_utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            bail!(
                "exchange_utc_offset_minutes {} is outside +-{}",
                self.exchange_utc_offset_minutes,
                MAX_UTC_OFFSET_MINUTES
            );
        }
        if Granularity::from_code(self.default_interval).is_none() {
            bail!("default_interval {} is not a supported interval code", self.default_interval);
        }
        self.bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind_addr {:?}", self.bind_addr))?;

        let mut normalized = Vec::with_capacity(self.instruments.len());
        for raw in &self.instruments {
            let Some(inst) = normalize_instrument(raw) else {
                bail!("invalid instrument identifier {raw:?}");
            };
            if !normalized.contains(&inst) {
                normalized.push(inst);
            }
        }
        if normalized.is_empty() {
            bail!("at least one instrument must be configured");
        }
        self.instruments = normalized;
        Ok(())
    }

    pub fn default_granularity(&self) -> Granularity {
        Granularity::from_code(self.default_interval).unwrap_or(Granularity::Day)
    }

    pub fn exchange_clock(&self) -> ExchangeClock {
        ExchangeClock::from_offset_minutes(self.exchange_utc_offset_minutes).unwrap_or_default()
    }

    pub fn price_timeout(&self) -> Duration {
        Duration::from_secs(self.price_timeout_secs)
    }

    pub fn iss_settings(&self) -> IssSettings {
        IssSettings {
            base_url: self.iss_base_url.clone(),
            board: self.board.clone(),
            candle_timeout: Duration::from_secs(self.candle_timeout_secs),
            price_timeout: self.price_timeout(),
            accept_invalid_certs: self.accept_invalid_certs,
            max_pages: self.max_pages,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.data_dir, PathBuf::from("storage/securities"));
        assert_eq!(cfg.instruments, vec!["SBER"]);
        assert_eq!(cfg.ingest_parallelism, 4);
        assert_eq!(cfg.default_granularity(), Granularity::Day);
        assert!(cfg.accept_invalid_certs);
        assert_eq!(cfg.exchange_clock(), ExchangeClock::default());
    }

    #[test]
    fn deserialise_partial_json_uses_defaults() {
        let cfg: RuntimeConfig =
            serde_json::from_str(r#"{ "instruments": ["gazp"], "default_interval": 10 }"#).unwrap();
        assert_eq!(cfg.instruments, vec!["gazp"]);
        assert_eq!(cfg.default_granularity(), Granularity::Minute10);
        assert_eq!(cfg.board, "TQBR");
        assert_eq!(cfg.candle_timeout_secs, 30);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("candle_ledger.json");
        std::fs::write(&path, r#"{ "data_dir": "/tmp/candles", "max_pages": 3 }"#).unwrap();

        let cfg = RuntimeConfig::load(&path).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/candles"));
        assert_eq!(cfg.max_pages, 3);
        assert!(RuntimeConfig::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn env_overrides_replace_fields() {
        let env: HashMap<&str, &str> = [
            ("CANDLE_INSTRUMENTS", " sber, gazp ,,lkoh"),
            ("CANDLE_DATA_DIR", "/var/lib/candles"),
            ("CANDLE_BIND_ADDR", "127.0.0.1:8080"),
        ]
        .into_iter()
        .collect();

        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.instruments, vec!["SBER", "GAZP", "LKOH"]);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/candles"));
        assert_eq!(cfg.bind_addr, "127.0.0.1:8080");
        assert_eq!(cfg.iss_base_url, "https://iss.moex.com/iss");
    }

    #[test]
    fn validate_normalizes_and_rejects() {
        let mut cfg = RuntimeConfig {
            instruments: vec!["sber".into(), "SBER".into(), "gazp".into()],
            ..RuntimeConfig::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.instruments, vec!["SBER", "GAZP"]);

        let mut bad = RuntimeConfig {
            ingest_parallelism: 0,
            ..RuntimeConfig::default()
        };
        assert!(bad.validate().is_err());

        let mut bad = RuntimeConfig {
            exchange_utc_offset_minutes: 20 * 60,
            ..RuntimeConfig::default()
        };
        assert!(bad.validate().is_err());

        let mut bad = RuntimeConfig {
            default_interval: 5,
            ..RuntimeConfig::default()
        };
        assert!(bad.validate().is_err());

        let mut bad = RuntimeConfig {
            instruments: vec!["SB-ER".into()],
            ..RuntimeConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
