// ─────────────────────────────────────────────────────────────────────────────
// history.rs — startup-snapshot exclusion set.
//
// Leader positions that existed before copy trading started are never
// mirrored. The set is persisted per pair and survives restarts; a position
// leaves the set when the leader closes it, flips it, or re-opens it after
// a close observed while we were running or offline.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::sync::Arc;

use crate::logger::PairLogger;
use crate::numeric::{is_dust, now_ms};
use crate::persistence::PairPersistence;

pub struct HistoricalPositionTracker {
    persistence: Arc<PairPersistence>,
    log: PairLogger,
    initialized: bool,
    /// Last leader size observed per coin, updated on every `can_copy` read.
    last_seen: HashMap<String, f64>,
}

impl HistoricalPositionTracker {
    pub fn new(persistence: Arc<PairPersistence>, log: PairLogger) -> Self {
        Self {
            persistence,
            log,
            initialized: false,
            last_seen: HashMap::new(),
        }
    }

    /// Seeds the tracker from the leader positions observed at engine start
    /// (coin, signed size).
    ///
    /// First start records every live leader position as historical.
    /// A restart instead reconciles the persisted set against what the
    /// leader holds now: positions closed or flipped while we were offline
    /// are cleared.
    pub fn initialize(&mut self, leader_positions: &[(String, f64)]) {
        let by_coin: HashMap<&str, f64> = leader_positions
            .iter()
            .map(|(c, s)| (c.as_str(), *s))
            .collect();

        if !self.persistence.read(|s| s.initialized()) {
            let ts = now_ms();
            let mut recorded = 0usize;
            self.persistence.with_state(|s| {
                for (coin, size) in leader_positions {
                    if !is_dust(*size) {
                        s.record_historical(coin, *size, ts);
                        recorded += 1;
                    }
                }
                s.initialized_snapshot = Some(true);
            });
            self.persistence.save_now();
            self.log.info(format!(
                "startup snapshot: {} leader position(s) marked historical",
                recorded
            ));
        } else {
            let stale: Vec<(String, bool, f64)> = self.persistence.read(|s| {
                s.historical_positions
                    .iter()
                    .map(|r| (r.coin.clone(), r.is_long(), r.size))
                    .collect()
            });
            for (coin, was_long, _size) in stale {
                let current = by_coin.get(coin.as_str()).copied().unwrap_or(0.0);
                if is_dust(current) {
                    self.log.info(format!("historical {} closed while offline; cleared", coin));
                    self.persistence
                        .with_state(|s| s.clear_historical(&coin, "closed", current));
                } else if (current > 0.0) != was_long {
                    self.log.info(format!("historical {} flipped while offline; cleared", coin));
                    self.persistence
                        .with_state(|s| s.clear_historical(&coin, "flipped", current));
                }
            }
        }

        for (coin, size) in leader_positions {
            self.last_seen.insert(coin.clone(), *size);
        }
        self.initialized = true;
    }

    /// Single oracle for both the signal path and the reconciler's cleanup:
    /// may this leader position (now at `leader_size`) be copied?
    ///
    /// Transitions out of the historical set happen here as a side effect of
    /// the read, so callers must invoke it exactly once per observation.
    pub fn can_copy(&mut self, coin: &str, leader_size: f64) -> bool {
        if !self.initialized {
            self.log.warn(format!(
                "can_copy({}) before initialize; refusing to copy",
                coin
            ));
            return false;
        }

        let record = self.persistence.read(|s| s.historical(coin).cloned());
        let previous = self.last_seen.get(coin).copied();
        self.last_seen.insert(coin.to_string(), leader_size);

        let record = match record {
            None => return true,
            Some(r) => r,
        };

        if is_dust(leader_size) {
            // The close of a historical position is itself not copied.
            self.log.info(format!("historical {} closed by leader; cleared", coin));
            self.persistence
                .with_state(|s| s.clear_historical(coin, "closed", leader_size));
            return false;
        }

        if previous.map(is_dust).unwrap_or(false) {
            self.log.info(format!("historical {} re-opened; copying resumes", coin));
            self.persistence
                .with_state(|s| s.clear_historical(coin, "reopened", leader_size));
            return true;
        }

        if (leader_size > 0.0) != record.is_long() {
            self.log.info(format!("historical {} flipped; copying resumes", coin));
            self.persistence
                .with_state(|s| s.clear_historical(coin, "flipped", leader_size));
            return true;
        }

        false
    }

    pub fn is_historical(&self, coin: &str) -> bool {
        self.persistence.read(|s| s.historical(coin).is_some())
    }
}
