// ─────────────────────────────────────────────────────────────────────────────
// persistence.rs — durable per-pair state.
//
// One pretty-printed JSON document per pair under the state directory.
// Mutations mark the document dirty and schedule a write after a quiet
// window; `save_now` flushes synchronously on engine stop. A corrupt or
// mismatched file is rebuilt rather than trusted.
// ─────────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::numeric::now_ms;

pub const SCHEMA_VERSION: u32 = 2;
/// Cleared-position audit entries kept per pair.
const CLEARED_RING_CAP: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalRecord {
    pub coin: String,
    /// "long" or "short" at record time.
    pub direction: String,
    pub size: f64,
    pub recorded_at: u64,
}

impl HistoricalRecord {
    pub fn is_long(&self) -> bool {
        self.direction == "long"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearedRecord {
    pub coin: String,
    pub reason: String,
    pub size_at_clear: f64,
    pub cleared_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPairState {
    pub pair_id: String,
    pub schema_version: u32,
    pub leader_address: String,
    pub first_started_at: u64,
    pub last_run_at: u64,
    /// Older documents predate this field; its absence means the pair has
    /// already run, so the migration default is true.
    #[serde(default)]
    pub initialized_snapshot: Option<bool>,
    #[serde(default)]
    pub historical_positions: Vec<HistoricalRecord>,
    #[serde(default)]
    pub cleared_positions: Vec<ClearedRecord>,
    /// Fund ratio captured when a position was opened. Recorded for audit,
    /// never consumed by the trading path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin_ratio_cache: Option<std::collections::HashMap<String, f64>>,
}

impl PersistedPairState {
    fn fresh(pair_id: &str, leader_address: &str) -> Self {
        let now = now_ms();
        Self {
            pair_id: pair_id.to_string(),
            schema_version: SCHEMA_VERSION,
            leader_address: leader_address.to_string(),
            first_started_at: now,
            last_run_at: now,
            initialized_snapshot: Some(false),
            historical_positions: Vec::new(),
            cleared_positions: Vec::new(),
            coin_ratio_cache: None,
        }
    }

    pub fn initialized(&self) -> bool {
        self.initialized_snapshot.unwrap_or(true)
    }

    pub fn historical(&self, coin: &str) -> Option<&HistoricalRecord> {
        self.historical_positions.iter().find(|r| r.coin == coin)
    }

    /// Idempotent per coin: an existing record wins.
    pub fn record_historical(&mut self, coin: &str, size: f64, ts: u64) {
        if self.historical(coin).is_some() {
            return;
        }
        self.historical_positions.push(HistoricalRecord {
            coin: coin.to_string(),
            direction: if size > 0.0 { "long" } else { "short" }.to_string(),
            size,
            recorded_at: ts,
        });
    }

    pub fn clear_historical(&mut self, coin: &str, reason: &str, size_at_clear: f64) {
        self.historical_positions.retain(|r| r.coin != coin);
        self.cleared_positions.push(ClearedRecord {
            coin: coin.to_string(),
            reason: reason.to_string(),
            size_at_clear,
            cleared_at: now_ms(),
        });
        if self.cleared_positions.len() > CLEARED_RING_CAP {
            let excess = self.cleared_positions.len() - CLEARED_RING_CAP;
            self.cleared_positions.drain(0..excess);
        }
    }
}

pub struct PairPersistence {
    path: PathBuf,
    state: Mutex<PersistedPairState>,
    dirty: AtomicBool,
    dirty_tx: UnboundedSender<()>,
    rx_slot: Mutex<Option<UnboundedReceiver<()>>>,
    debounce_ms: u64,
}

impl PairPersistence {
    pub fn new(state_dir: &Path, pair_id: &str, leader_address: &str, debounce_ms: u64) -> Self {
        if let Err(e) = std::fs::create_dir_all(state_dir) {
            log::error!("[{}] failed to create state dir {:?}: {}", pair_id, state_dir, e);
        }
        let path = state_dir.join(format!("{}.json", pair_id));
        let state = load_or_rebuild(&path, pair_id, leader_address);
        let (dirty_tx, dirty_rx) = unbounded_channel();
        Self {
            path,
            state: Mutex::new(state),
            dirty: AtomicBool::new(false),
            dirty_tx,
            rx_slot: Mutex::new(Some(dirty_rx)),
            debounce_ms: debounce_ms.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read<R>(&self, f: impl FnOnce(&PersistedPairState) -> R) -> R {
        let state = self.state.lock().unwrap();
        f(&state)
    }

    /// Applies a mutation and schedules a debounced write.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut PersistedPairState) -> R) -> R {
        let out = {
            let mut state = self.state.lock().unwrap();
            f(&mut state)
        };
        self.dirty.store(true, Ordering::SeqCst);
        let _ = self.dirty_tx.send(());
        out
    }

    /// Background writer: waits for a mutation, then flushes once the quiet
    /// window elapses with no further mutations. A failed write stays dirty
    /// and is retried on the next wakeup.
    pub fn spawn_writer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let me = self.clone();
        let mut rx = match self.rx_slot.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                log::debug!("debounce writer already running for {:?}", self.path);
                return tokio::spawn(async {});
            }
        };
        tokio::spawn(async move {
            let quiet = std::time::Duration::from_millis(me.debounce_ms);
            loop {
                if rx.recv().await.is_none() {
                    return;
                }
                // Absorb further mutations until the window stays quiet.
                loop {
                    match tokio::time::timeout(quiet, rx.recv()).await {
                        Ok(Some(_)) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                if !me.flush() {
                    // Retry after another quiet window.
                    tokio::time::sleep(quiet).await;
                    let _ = me.dirty_tx.send(());
                }
            }
        })
    }

    /// Synchronous flush, called on engine stop.
    pub fn save_now(&self) {
        self.flush();
    }

    fn flush(&self) -> bool {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return true;
        }
        let json = {
            let mut state = self.state.lock().unwrap();
            state.last_run_at = now_ms();
            serde_json::to_string_pretty(&*state)
        };
        match json {
            Ok(content) => match std::fs::write(&self.path, content) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("failed to write state file {:?}: {}", self.path, e);
                    self.dirty.store(true, Ordering::SeqCst);
                    false
                }
            },
            Err(e) => {
                log::error!("failed to serialize state for {:?}: {}", self.path, e);
                self.dirty.store(true, Ordering::SeqCst);
                false
            }
        }
    }
}

fn load_or_rebuild(path: &Path, pair_id: &str, leader_address: &str) -> PersistedPairState {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => {
            log::info!("[{}] no state file at {:?}; starting fresh", pair_id, path);
            return PersistedPairState::fresh(pair_id, leader_address);
        }
    };

    let mut state: PersistedPairState = match serde_json::from_str(&content) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("[{}] state file {:?} unreadable ({}); rebuilding", pair_id, path, e);
            return PersistedPairState::fresh(pair_id, leader_address);
        }
    };

    if state.pair_id != pair_id {
        log::warn!(
            "[{}] state file pairId mismatch ({}); rebuilding",
            pair_id,
            state.pair_id
        );
        return PersistedPairState::fresh(pair_id, leader_address);
    }

    if !state.leader_address.eq_ignore_ascii_case(leader_address) {
        log::warn!(
            "[{}] leader changed {} -> {}; resetting pair state",
            pair_id,
            state.leader_address,
            leader_address
        );
        let mut fresh = PersistedPairState::fresh(pair_id, leader_address);
        fresh.cleared_positions.push(ClearedRecord {
            coin: "*".to_string(),
            reason: format!("leader changed from {}", state.leader_address),
            size_at_clear: 0.0,
            cleared_at: now_ms(),
        });
        return fresh;
    }

    // Migration: a pre-schema-2 file that exists at all has run before.
    if state.initialized_snapshot.is_none() {
        state.initialized_snapshot = Some(true);
        state.schema_version = SCHEMA_VERSION;
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("copy-engine-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    const LEADER: &str = "0xAbCd000000000000000000000000000000000001";

    #[test]
    fn fresh_state_roundtrips_through_disk() {
        let dir = temp_state_dir();
        let p = PairPersistence::new(&dir, "pair-1", LEADER, 1000);
        assert!(!p.read(|s| s.initialized()));

        p.with_state(|s| {
            s.initialized_snapshot = Some(true);
            s.record_historical("ETH", 1.0, 123);
        });
        p.save_now();

        let p2 = PairPersistence::new(&dir, "pair-1", LEADER, 1000);
        assert!(p2.read(|s| s.initialized()));
        let rec = p2.read(|s| s.historical("ETH").cloned()).unwrap();
        assert_eq!(rec.direction, "long");
        assert_eq!(rec.size, 1.0);
    }

    #[test]
    fn leader_mismatch_rebuilds_with_audit_entry() {
        let dir = temp_state_dir();
        let p = PairPersistence::new(&dir, "pair-1", LEADER, 1000);
        p.with_state(|s| s.record_historical("ETH", 1.0, 1));
        p.save_now();

        let other = "0x9999000000000000000000000000000000000009";
        let p2 = PairPersistence::new(&dir, "pair-1", other, 1000);
        assert!(p2.read(|s| s.historical_positions.is_empty()));
        assert!(p2.read(|s| s.cleared_positions.iter().any(|c| c.reason.contains("leader changed"))));
    }

    #[test]
    fn leader_match_is_case_insensitive() {
        let dir = temp_state_dir();
        let p = PairPersistence::new(&dir, "pair-1", LEADER, 1000);
        p.with_state(|s| s.record_historical("ETH", -2.0, 1));
        p.save_now();

        let p2 = PairPersistence::new(&dir, "pair-1", &LEADER.to_lowercase(), 1000);
        assert!(p2.read(|s| s.historical("ETH").is_some()));
    }

    #[test]
    fn pair_id_mismatch_rebuilds() {
        let dir = temp_state_dir();
        let p = PairPersistence::new(&dir, "pair-1", LEADER, 1000);
        p.with_state(|s| s.record_historical("ETH", 1.0, 1));
        p.save_now();
        // Same file name, different configured id: simulate by renaming.
        std::fs::rename(dir.join("pair-1.json"), dir.join("pair-2.json")).unwrap();

        let p2 = PairPersistence::new(&dir, "pair-2", LEADER, 1000);
        assert!(p2.read(|s| s.historical_positions.is_empty()));
    }

    #[test]
    fn missing_initialized_flag_migrates_to_true() {
        let dir = temp_state_dir();
        let legacy = serde_json::json!({
            "pairId": "pair-1",
            "schemaVersion": 1,
            "leaderAddress": LEADER,
            "firstStartedAt": 1u64,
            "lastRunAt": 2u64,
            "historicalPositions": []
        });
        std::fs::write(dir.join("pair-1.json"), legacy.to_string()).unwrap();

        let p = PairPersistence::new(&dir, "pair-1", LEADER, 1000);
        assert!(p.read(|s| s.initialized()));
    }

    #[test]
    fn corrupt_file_rebuilds() {
        let dir = temp_state_dir();
        std::fs::write(dir.join("pair-1.json"), "{not json").unwrap();
        let p = PairPersistence::new(&dir, "pair-1", LEADER, 1000);
        assert!(!p.read(|s| s.initialized()));
    }

    #[test]
    fn cleared_ring_is_bounded() {
        let dir = temp_state_dir();
        let p = PairPersistence::new(&dir, "pair-1", LEADER, 1000);
        p.with_state(|s| {
            for i in 0..150 {
                s.record_historical(&format!("C{}", i), 1.0, i);
                s.clear_historical(&format!("C{}", i), "closed", 0.0);
            }
        });
        assert_eq!(p.read(|s| s.cleared_positions.len()), 100);
        assert_eq!(p.read(|s| s.cleared_positions[0].coin.clone()), "C50");
    }

    #[test]
    fn record_historical_is_idempotent_per_coin() {
        let dir = temp_state_dir();
        let p = PairPersistence::new(&dir, "pair-1", LEADER, 1000);
        p.with_state(|s| {
            s.record_historical("ETH", 1.0, 1);
            s.record_historical("ETH", 5.0, 2);
        });
        assert_eq!(p.read(|s| s.historical_positions.len()), 1);
        assert_eq!(p.read(|s| s.historical("ETH").unwrap().size), 1.0);
    }

    #[tokio::test]
    async fn debounced_writer_flushes_after_quiet_window() {
        let dir = temp_state_dir();
        let p = Arc::new(PairPersistence::new(&dir, "pair-1", LEADER, 20));
        let handle = p.spawn_writer();

        p.with_state(|s| s.record_historical("BTC", 0.5, 1));
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;

        let on_disk: PersistedPairState =
            serde_json::from_str(&std::fs::read_to_string(p.path()).unwrap()).unwrap();
        assert!(on_disk.historical("BTC").is_some());
        handle.abort();
    }
}
