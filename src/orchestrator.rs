// ─────────────────────────────────────────────────────────────────────────────
// orchestrator.rs — runs many pair engines over shared transports.
//
// Owns the pooled HTTP client (10s timeout), the streaming transport, and
// the market metadata cache. Engines start sequentially so a broken pair
// cannot starve the rest of startup diagnostics, and a single failure does
// not abort its siblings. Shutdown stops every engine in parallel, then
// closes the stream.
// ─────────────────────────────────────────────────────────────────────────────
use futures_util::future::join_all;
use std::sync::{Arc, Mutex};

use crate::config::{Config, ConfigError};
use crate::engine::{EngineStatus, PairEngine};
use crate::exchange::{ExchangeSession, InfoApi, InfoClient, OrderApi};
use crate::metadata::MarketMetadataCache;
use crate::stream::StreamClient;

const HTTP_TIMEOUT_SECS: u64 = 10;

pub struct Orchestrator {
    cfg: Arc<Config>,
    metadata: Arc<MarketMetadataCache>,
    stream: Arc<StreamClient>,
    engines: Vec<Arc<PairEngine>>,
    refresh_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(cfg: Config) -> Result<Self, ConfigError> {
        let cfg = Arc::new(cfg);
        let env = cfg.environment;

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| ConfigError(format!("http client: {}", e)))?;

        let info: Arc<dyn InfoApi> = Arc::new(InfoClient::new(env.http_url(), http.clone()));
        let metadata = Arc::new(MarketMetadataCache::new(info.clone()));
        let stream = StreamClient::spawn(env.ws_url().to_string());

        let mut engines = Vec::new();
        for pair in cfg.enabled_pairs() {
            let follower_account = pair.follower_account()?;
            let orders: Arc<dyn OrderApi> = Arc::new(ExchangeSession::new(
                env.http_url(),
                http.clone(),
                pair.follower_private_key.clone(),
                pair.follower_vault_address.clone(),
                env.agent_source(),
            ));
            engines.push(Arc::new(PairEngine::new(
                &cfg,
                pair.clone(),
                follower_account,
                info.clone(),
                orders,
                metadata.clone(),
                stream.clone(),
            )));
        }

        Ok(Self {
            cfg,
            metadata,
            stream,
            engines,
            refresh_task: Mutex::new(None),
        })
    }

    /// Loads shared metadata (fatal on failure), starts the background
    /// price refresher, then brings pairs up one by one.
    pub async fn start(&self) -> Result<(), String> {
        self.metadata
            .ensure_loaded()
            .await
            .map_err(|e| format!("metadata load failed: {}", e))?;
        self.metadata.refresh_mid_prices().await;

        let metadata = self.metadata.clone();
        let interval_ms = self.cfg.refresh_account_interval_ms.max(1_000);
        *self.refresh_task.lock().unwrap() = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                metadata.refresh_mark_prices().await;
                metadata.refresh_mid_prices().await;
            }
        }));

        let mut started = 0usize;
        for engine in &self.engines {
            match engine.start().await {
                Ok(()) => started += 1,
                Err(e) => {
                    // Siblings keep starting; this pair stays in error state.
                    log::error!("pair {} failed to start: {}", engine.pair_id(), e);
                }
            }
        }
        if started == 0 {
            return Err("no pair engine started".to_string());
        }
        log::info!("{}/{} pair engine(s) running", started, self.engines.len());
        Ok(())
    }

    /// Stops every engine in parallel, then closes the shared stream.
    pub async fn stop(&self) {
        join_all(self.engines.iter().map(|e| e.stop())).await;
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
        self.stream.close();
        log::info!("orchestrator stopped");
    }

    pub fn status(&self) -> Vec<EngineStatus> {
        self.engines.iter().map(|e| e.status()).collect()
    }
}
