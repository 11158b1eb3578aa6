// ─────────────────────────────────────────────────────────────────────────────
// trade_log.rs — append-only trade audit trail.
//
// One JSONL file per leader per UTC day under
// <stateDir>/trades/<leaderAddress>/<YYYY-MM-DD>.jsonl. Write failures are
// logged and never interrupt trading.
// ─────────────────────────────────────────────────────────────────────────────
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

use crate::numeric::day_stamp;

/// Outcome of one observed leader signal on the follower side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Received,
    Executed,
    Skipped,
    Failed,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Received => "received",
            TradeOutcome::Executed => "executed",
            TradeOutcome::Skipped => "skipped",
            TradeOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub ts: u64,
    pub pair_id: String,
    pub coin: String,
    pub direction: String,
    pub outcome: String,
    pub size: f64,
    pub price: f64,
    pub leader_oid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloid: Option<String>,
}

pub struct TradeLog {
    dir: PathBuf,
    enabled: bool,
}

impl TradeLog {
    pub fn new(state_dir: &std::path::Path, leader_address: &str, enabled: bool) -> Self {
        Self {
            dir: state_dir.join("trades").join(leader_address.to_lowercase()),
            enabled,
        }
    }

    pub fn append(&self, record: &TradeRecord) {
        if !self.enabled {
            return;
        }
        let path = self.dir.join(format!("{}.jsonl", day_stamp(record.ts)));
        if let Err(e) = self.append_inner(&path, record) {
            log::error!("trade log write failed ({:?}): {}", path, e);
        }
    }

    fn append_inner(&self, path: &std::path::Path, record: &TradeRecord) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(outcome: TradeOutcome) -> TradeRecord {
        TradeRecord {
            ts: 1_705_276_800_000, // 2024-01-15
            pair_id: "pair-1".to_string(),
            coin: "BTC".to_string(),
            direction: "OpenLong".to_string(),
            outcome: outcome.as_str().to_string(),
            size: 0.005,
            price: 60000.0,
            leader_oid: 42,
            reason: None,
            oid: Some(77),
            cloid: Some("0xdeadbeef".to_string()),
        }
    }

    #[test]
    fn appends_one_json_object_per_line() {
        let dir = std::env::temp_dir().join(format!("copy-tradelog-{}", uuid::Uuid::new_v4()));
        let log = TradeLog::new(&dir, "0xAB", true);
        log.append(&record(TradeOutcome::Received));
        log.append(&record(TradeOutcome::Executed));

        let path = dir.join("trades").join("0xab").join("2024-01-15.jsonl");
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["outcome"], "received");
        assert_eq!(first["leaderOid"], 42);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["outcome"], "executed");
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let dir = std::env::temp_dir().join(format!("copy-tradelog-{}", uuid::Uuid::new_v4()));
        let log = TradeLog::new(&dir, "0xAB", false);
        log.append(&record(TradeOutcome::Skipped));
        assert!(!dir.exists());
    }
}
