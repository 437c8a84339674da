// =============================================================================
// Central Application State — shared by the HTTP handlers and the CLI
// =============================================================================
//
// Ties the configured store, upstream client, ingestion pipeline and query
// service together. Generic over the market-data client so the router can be
// driven by an in-memory client in tests; production uses `IssClient`.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use crate::ingest::IngestionPipeline;
use crate::live::LiveCompositor;
use crate::market_data::{IssClient, MarketDataClient};
use crate::query::QueryService;
use crate::runtime_config::RuntimeConfig;
use crate::store::CandleStore;
use crate::types::{normalize_instrument, Granularity};

pub struct AppState<C = IssClient> {
    pub config: RuntimeConfig,
    pub client: Arc<C>,
    pub pipeline: IngestionPipeline<C>,
    pub query: QueryService<C>,
    pub start_time: Instant,
}

impl<C: MarketDataClient> AppState<C> {
    /// `config` is expected to have passed [`RuntimeConfig::validate`].
    pub fn new(config: RuntimeConfig, client: Arc<C>) -> Self {
        let clock = config.exchange_clock();
        let store = CandleStore::new(&config.data_dir);
        let pipeline = IngestionPipeline::new(
            client.clone(),
            store.clone(),
            clock,
            config.ingest_parallelism,
        );
        let query = QueryService::new(
            client.clone(),
            store,
            clock,
            LiveCompositor::new(clock, config.price_timeout()),
        );

        Self {
            config,
            client,
            pipeline,
            query,
            start_time: Instant::now(),
        }
    }

    /// Normalized identifier if `raw` names a configured instrument.
    pub fn known_instrument(&self, raw: &str) -> Option<String> {
        normalize_instrument(raw).filter(|inst| self.config.instruments.contains(inst))
    }

    /// Interval for `code`, or the configured default when absent. `Err`
    /// carries the rejected code.
    pub fn granularity_or_default(&self, code: Option<u32>) -> Result<Granularity, u32> {
        match code {
            None => Ok(self.config.default_granularity()),
            Some(c) => Granularity::from_code(c).ok_or(c),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
