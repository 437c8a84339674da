// =============================================================================
// Ingestion Pipeline — fetch window, upstream call, normalize, append
// =============================================================================
//
// POLICY: one instrument's failure never aborts a batch. Upstream and payload
// problems mark the instrument as skipped; store failures are reported for
// that instrument only.
//
// At most one run per (instrument, granularity) is in flight. The registry
// below owns the ledgers and lends each out under its own async mutex; a run
// that finds its ledger busy is skipped, not queued.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Months, NaiveDateTime};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{ClientError, StoreError};
use crate::ingest::normalize::normalize;
use crate::market_data::MarketDataClient;
use crate::store::{CandleLedger, CandleStore};
use crate::types::{ExchangeClock, Granularity, TIME_FORMAT};

/// Lookback used when nothing is stored yet.
const INITIAL_LOOKBACK_DAYS: i64 = 30;
/// Lookback used for a forced full reload.
const FULL_RELOAD_MONTHS: u32 = 24;

/// Why an instrument produced no write this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Upstream(String),
    Malformed(String),
    /// Another run for the same ledger is in flight.
    Busy,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upstream(msg) => write!(f, "upstream unavailable: {msg}"),
            Self::Malformed(msg) => write!(f, "malformed response: {msg}"),
            Self::Busy => write!(f, "ingestion already running"),
        }
    }
}

impl From<ClientError> for SkipReason {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::UpstreamUnavailable(msg) => Self::Upstream(msg),
            ClientError::MalformedResponse(msg) => Self::Malformed(msg),
        }
    }
}

/// Result of one successful (non-erroring) run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted(usize),
    Skipped(SkipReason),
}

/// Per-instrument line of a batch report.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestStatus {
    Inserted { count: usize },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct InstrumentReport {
    pub instrument: String,
    #[serde(flatten)]
    pub status: IngestStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: String,
    pub interval: Granularity,
    pub force_full_reload: bool,
    pub instruments: Vec<InstrumentReport>,
}

impl BatchReport {
    pub fn inserted_total(&self) -> usize {
        self.instruments
            .iter()
            .map(|r| match r.status {
                IngestStatus::Inserted { count } => count,
                _ => 0,
            })
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.instruments
            .iter()
            .filter(|r| matches!(r.status, IngestStatus::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.instruments
            .iter()
            .filter(|r| matches!(r.status, IngestStatus::Skipped { .. }))
            .count()
    }
}

/// Start of the next fetch window.
pub fn fetch_window_start(
    now: NaiveDateTime,
    last_stored: Option<NaiveDateTime>,
    granularity: Granularity,
    force_full_reload: bool,
) -> NaiveDateTime {
    if force_full_reload {
        return now
            .checked_sub_months(Months::new(FULL_RELOAD_MONTHS))
            .unwrap_or(now - Duration::days(730));
    }
    match last_stored {
        Some(last) => granularity.step_forward(last),
        None => now - Duration::days(INITIAL_LOOKBACK_DAYS),
    }
}

type LedgerSlot = Arc<tokio::sync::Mutex<Option<CandleLedger>>>;

/// Owns the open ledgers, one lockable slot per (instrument, granularity).
struct LedgerRegistry {
    store: CandleStore,
    slots: parking_lot::Mutex<HashMap<(String, Granularity), LedgerSlot>>,
}

impl LedgerRegistry {
    fn slot(&self, instrument: &str, granularity: Granularity) -> LedgerSlot {
        self.slots
            .lock()
            .entry((instrument.to_string(), granularity))
            .or_default()
            .clone()
    }
}

pub struct IngestionPipeline<C> {
    client: Arc<C>,
    registry: LedgerRegistry,
    clock: ExchangeClock,
    parallelism: usize,
}

impl<C: MarketDataClient> IngestionPipeline<C> {
    pub fn new(client: Arc<C>, store: CandleStore, clock: ExchangeClock, parallelism: usize) -> Self {
        Self {
            client,
            registry: LedgerRegistry {
                store,
                slots: parking_lot::Mutex::new(HashMap::new()),
            },
            clock,
            parallelism: parallelism.max(1),
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &CandleStore {
        &self.registry.store
    }

    /// Ingest one instrument. `instrument` must already be normalized.
    pub async fn run(
        &self,
        instrument: &str,
        granularity: Granularity,
        force_full_reload: bool,
    ) -> Result<IngestOutcome, StoreError> {
        let now = self.clock.now_local();
        self.run_at(instrument, granularity, force_full_reload, now)
            .await
    }

    /// [`run`](Self::run) with an explicit exchange-local "now".
    pub async fn run_at(
        &self,
        instrument: &str,
        granularity: Granularity,
        force_full_reload: bool,
        now: NaiveDateTime,
    ) -> Result<IngestOutcome, StoreError> {
        let slot = self.registry.slot(instrument, granularity);
        let Ok(mut guard) = slot.try_lock_owned() else {
            warn!(instrument, interval = %granularity, "ingestion already in flight, skipping");
            return Ok(IngestOutcome::Skipped(SkipReason::Busy));
        };

        let ledger = match guard.take() {
            Some(ledger) => ledger,
            None => self.registry.store.open_ledger(instrument, granularity)?,
        };
        let ledger = guard.insert(ledger);

        if ledger.is_empty() && !force_full_reload {
            debug!(instrument, interval = %granularity, "no stored candles, using initial lookback");
        }
        let from = fetch_window_start(now, ledger.last_timestamp(), granularity, force_full_reload);
        if from > now {
            debug!(instrument, from = %from.format(TIME_FORMAT), "store already current");
            return Ok(IngestOutcome::Inserted(0));
        }

        info!(
            instrument,
            interval = %granularity,
            from = %from.format(TIME_FORMAT),
            force_full_reload,
            "fetching candles"
        );

        let raw = match self.client.fetch_candles(instrument, granularity, from).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(instrument, error = %e, "candle fetch failed, instrument skipped");
                return Ok(IngestOutcome::Skipped(e.into()));
            }
        };

        let normalized = match normalize(instrument, &raw) {
            Ok(n) => n,
            Err(e) => {
                warn!(instrument, error = %e, "unusable upstream payload, instrument skipped");
                return Ok(IngestOutcome::Skipped(e.into()));
            }
        };

        match ledger.append(&normalized.candles) {
            Ok(inserted) => {
                info!(
                    instrument,
                    interval = %granularity,
                    fetched = normalized.candles.len(),
                    inserted,
                    stored = ledger.len(),
                    path = %ledger.path().display(),
                    "ingestion complete"
                );
                Ok(IngestOutcome::Inserted(inserted))
            }
            Err(e) => {
                // Rescan on the next run; the file may hold a partial row.
                *guard = None;
                Err(e)
            }
        }
    }

    /// Ingest every instrument with bounded parallelism. Reports come back in
    /// input order.
    pub async fn run_batch(
        &self,
        instruments: &[String],
        granularity: Granularity,
        force_full_reload: bool,
    ) -> BatchReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("ingest_batch", run_id = %run_id, interval = %granularity);

        async {
            info!(count = instruments.len(), force_full_reload, "batch started");

            let reports: Vec<InstrumentReport> = stream::iter(instruments.iter().cloned())
                .map(|instrument| async move {
                    let status = match self.run(&instrument, granularity, force_full_reload).await {
                        Ok(IngestOutcome::Inserted(count)) => IngestStatus::Inserted { count },
                        Ok(IngestOutcome::Skipped(reason)) => IngestStatus::Skipped {
                            reason: reason.to_string(),
                        },
                        Err(e) => {
                            error!(instrument = %instrument, error = %e, "store failure");
                            IngestStatus::Failed {
                                error: e.to_string(),
                            }
                        }
                    };
                    InstrumentReport { instrument, status }
                })
                .buffered(self.parallelism)
                .collect()
                .await;

            let report = BatchReport {
                run_id: run_id.clone(),
                interval: granularity,
                force_full_reload,
                instruments: reports,
            };
            info!(
                inserted = report.inserted_total(),
                skipped = report.skipped(),
                failed = report.failed(),
                "batch finished"
            );
            report
        }
        .instrument(span)
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================
