// ─────────────────────────────────────────────────────────────────────────────
// engine.rs — one leader/follower pair.
//
// Owns the pair's state stores, history tracker, persistence, signal
// processor, reconciler and stream subscription, and drives them through
// the created → starting → running → stopping → stopped lifecycle. Stop is
// idempotent and never throws.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::{Arc, Mutex};

use crate::config::{Config, PairConfig};
use crate::exchange::{InfoApi, OrderApi};
use crate::history::HistoricalPositionTracker;
use crate::logger::PairLogger;
use crate::metadata::MarketMetadataCache;
use crate::persistence::PairPersistence;
use crate::reconciler::Reconciler;
use crate::signal::SignalProcessor;
use crate::state::TraderStateStore;
use crate::stream::StreamClient;
use crate::trade_log::TradeLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "created",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
            EngineState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub pair_id: String,
    pub state: &'static str,
    pub leader_address: String,
    pub follower_address: String,
}

pub struct PairEngine {
    log: PairLogger,
    cfg: Arc<PairConfig>,
    session_id: String,
    follower_account: String,
    reconciliation_interval_ms: u64,
    aggregate_fills: bool,
    stream: Arc<StreamClient>,
    metadata: Arc<MarketMetadataCache>,
    leader_store: Arc<Mutex<TraderStateStore>>,
    history: Arc<Mutex<HistoricalPositionTracker>>,
    follower_store: Arc<Mutex<TraderStateStore>>,
    persistence: Arc<PairPersistence>,
    processor: Arc<SignalProcessor>,
    reconciler: Arc<Reconciler>,
    state: Mutex<EngineState>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PairEngine {
    pub fn new(
        global: &Config,
        pair: PairConfig,
        follower_account: String,
        info: Arc<dyn InfoApi>,
        orders: Arc<dyn OrderApi>,
        metadata: Arc<MarketMetadataCache>,
        stream: Arc<StreamClient>,
    ) -> Self {
        let cfg = Arc::new(pair);
        let log = PairLogger::new(&cfg.id);
        let state_dir = std::path::Path::new(&global.state_dir);

        let persistence = Arc::new(PairPersistence::new(
            state_dir,
            &cfg.id,
            &cfg.leader_address,
            cfg.sync_debounce_ms,
        ));
        let trade_log = Arc::new(TradeLog::new(
            state_dir,
            &cfg.leader_address,
            global.enable_trade_log,
        ));
        let leader_store = Arc::new(Mutex::new(TraderStateStore::new()));
        let follower_store = Arc::new(Mutex::new(TraderStateStore::new()));
        let history = Arc::new(Mutex::new(HistoricalPositionTracker::new(
            persistence.clone(),
            log.clone(),
        )));

        let processor = Arc::new(SignalProcessor::new(
            log.clone(),
            cfg.clone(),
            follower_account.clone(),
            info.clone(),
            orders.clone(),
            metadata.clone(),
            leader_store.clone(),
            follower_store.clone(),
            history.clone(),
            persistence.clone(),
            trade_log.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            log.clone(),
            cfg.clone(),
            follower_account.clone(),
            info,
            orders,
            metadata.clone(),
            leader_store.clone(),
            follower_store.clone(),
            history.clone(),
        ));

        Self {
            log,
            cfg,
            session_id: uuid::Uuid::new_v4().to_string(),
            follower_account,
            reconciliation_interval_ms: global.reconciliation_interval_ms,
            aggregate_fills: global.websocket_aggregate_fills,
            stream,
            metadata,
            leader_store,
            follower_store,
            history,
            persistence,
            processor,
            reconciler,
            state: Mutex::new(EngineState::Created),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn pair_id(&self) -> &str {
        &self.cfg.id
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            pair_id: self.cfg.id.clone(),
            state: self.state().as_str(),
            leader_address: self.cfg.leader_address.clone(),
            follower_address: self.follower_account.clone(),
        }
    }

    fn set_state(&self, next: EngineState) {
        *self.state.lock().unwrap() = next;
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), String> {
        {
            let state = self.state.lock().unwrap();
            match *state {
                EngineState::Running | EngineState::Starting => return Ok(()),
                EngineState::Created => {}
                // The lifecycle is one-way; a stopped or failed engine is
                // rebuilt, not restarted.
                other => return Err(format!("cannot start engine from state {}", other.as_str())),
            }
        }
        self.set_state(EngineState::Starting);
        self.log.info(format!(
            "starting engine (session {}): leader {} -> follower {}",
            self.session_id, self.cfg.leader_address, self.follower_account
        ));

        match self.start_inner().await {
            Ok(()) => {
                self.set_state(EngineState::Running);
                self.log.info("engine running".to_string());
                Ok(())
            }
            Err(e) => {
                self.set_state(EngineState::Error);
                self.log.error(format!("engine start failed: {}", e));
                Err(e)
            }
        }
    }

    async fn start_inner(self: &Arc<Self>) -> Result<(), String> {
        self.metadata
            .ensure_loaded()
            .await
            .map_err(|e| format!("metadata load: {}", e))?;

        // Seed both stores; the history tracker needs the leader's live
        // positions before anything may be copied.
        self.reconciler
            .seed()
            .await
            .map_err(|e| format!("initial reconcile: {}", e))?;

        let follower_equity = self.follower_store.lock().unwrap().equity();
        if follower_equity <= 0.0 {
            self.log.error(format!(
                "CRITICAL: follower {} has no equity (${:.2}); orders will be skipped",
                self.follower_account, follower_equity
            ));
        }

        let leader_positions: Vec<(String, f64)> = self
            .leader_store
            .lock()
            .unwrap()
            .positions()
            .map(|p| (p.coin.clone(), p.size))
            .collect();
        self.history.lock().unwrap().initialize(&leader_positions);

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.persistence.spawn_writer());

        // Fill consumer: one event fully processed before the next is read.
        let mut rx = self
            .stream
            .subscribe_user_fills(&self.cfg.leader_address, self.aggregate_fills);
        let processor = self.processor.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                processor.on_fill_event(event).await;
            }
        }));

        // Reconcile timer. Ticks elide rather than overlap.
        let reconciler = self.reconciler.clone();
        let interval_ms = self.reconciliation_interval_ms.max(1_000);
        tasks.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // the seed reconcile already ran
            loop {
                interval.tick().await;
                reconciler.run_once().await;
            }
        }));

        Ok(())
    }

    /// Idempotent, infallible stop: unsubscribe, stop timers, flush state.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                EngineState::Stopped | EngineState::Stopping => return,
                _ => *state = EngineState::Stopping,
            }
        }
        self.log.info("stopping engine".to_string());

        self.stream.unsubscribe_user_fills(&self.cfg.leader_address);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.persistence.save_now();

        self.set_state(EngineState::Stopped);
        self.log.info("engine stopped".to_string());
    }
}
