// ─────────────────────────────────────────────────────────────────────────────
// state.rs — in-memory mirror of one trader's account on the exchange.
//
// Two update modes: `apply_snapshot` replaces everything from an
// authoritative clearinghouseState document; `apply_fill` folds a single
// trade into the existing view. Each pair holds two stores, one for the
// leader and one for the follower.
// ─────────────────────────────────────────────────────────────────────────────
use serde_json::Value;
use std::collections::HashMap;

use crate::exchange::ExchangeError;
use crate::numeric::{is_dust, now_ms, parse_f64, parse_f64_or_zero};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeverageType {
    Cross,
    Isolated,
}

impl LeverageType {
    pub fn from_wire(s: &str) -> Self {
        if s == "isolated" {
            LeverageType::Isolated
        } else {
            LeverageType::Cross
        }
    }

    pub fn is_cross(&self) -> bool {
        matches!(self, LeverageType::Cross)
    }
}

#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub coin: String,
    /// Signed size: positive long, negative short. Never dust while stored.
    pub size: f64,
    pub entry_price: f64,
    pub position_value_usd: f64,
    pub leverage: f64,
    pub leverage_type: LeverageType,
    pub margin_used_usd: f64,
    pub liquidation_price: Option<f64>,
    pub last_updated_ms: u64,
}

impl PositionSnapshot {
    pub fn is_long(&self) -> bool {
        self.size > 0.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccountMetrics {
    pub account_value_usd: f64,
    pub total_notional_usd: f64,
    pub total_margin_used_usd: f64,
    pub withdrawable_usd: f64,
    pub last_updated_ms: u64,
}

#[derive(Debug, Default)]
pub struct TraderStateStore {
    positions: HashMap<String, PositionSnapshot>,
    metrics: AccountMetrics,
}

impl TraderStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, coin: &str) -> Option<&PositionSnapshot> {
        self.positions.get(coin)
    }

    /// Signed size, 0.0 when flat.
    pub fn signed_size(&self, coin: &str) -> f64 {
        self.positions.get(coin).map(|p| p.size).unwrap_or(0.0)
    }

    pub fn positions(&self) -> impl Iterator<Item = &PositionSnapshot> {
        self.positions.values()
    }

    pub fn metrics(&self) -> &AccountMetrics {
        &self.metrics
    }

    pub fn equity(&self) -> f64 {
        self.metrics.account_value_usd
    }

    /// Replaces positions and metrics from a clearinghouseState document.
    ///
    /// Hedged-mode entries are dropped (only one-way positions are tracked)
    /// and dust positions are elided. Required numeric fields that fail to
    /// parse fail the whole call and leave the store untouched.
    pub fn apply_snapshot(&mut self, doc: &Value) -> Result<(), ExchangeError> {
        let ts = now_ms();
        let summary = &doc["marginSummary"];
        let account_value = parse_f64(&summary["accountValue"])
            .ok_or_else(|| ExchangeError::Parse("marginSummary.accountValue".to_string()))?;
        let total_notional = parse_f64(&summary["totalNtlPos"])
            .ok_or_else(|| ExchangeError::Parse("marginSummary.totalNtlPos".to_string()))?;
        let total_margin = parse_f64(&summary["totalMarginUsed"])
            .ok_or_else(|| ExchangeError::Parse("marginSummary.totalMarginUsed".to_string()))?;
        let withdrawable = parse_f64_or_zero(&doc["withdrawable"]);

        let mut positions = HashMap::new();
        if let Some(entries) = doc["assetPositions"].as_array() {
            for entry in entries {
                // Only one-way positions are mirrored.
                if entry["type"].as_str().map(|t| t != "oneWay").unwrap_or(false) {
                    continue;
                }
                let pos = &entry["position"];
                let coin = match pos["coin"].as_str() {
                    Some(c) => c.to_string(),
                    None => continue,
                };
                let size = parse_f64(&pos["szi"])
                    .ok_or_else(|| ExchangeError::Parse(format!("{} szi", coin)))?;
                if is_dust(size) {
                    continue;
                }
                let entry_price = parse_f64(&pos["entryPx"])
                    .ok_or_else(|| ExchangeError::Parse(format!("{} entryPx", coin)))?;

                positions.insert(
                    coin.clone(),
                    PositionSnapshot {
                        coin,
                        size,
                        entry_price,
                        position_value_usd: parse_f64_or_zero(&pos["positionValue"]),
                        leverage: parse_f64_or_zero(&pos["leverage"]["value"]),
                        leverage_type: LeverageType::from_wire(
                            pos["leverage"]["type"].as_str().unwrap_or("cross"),
                        ),
                        margin_used_usd: parse_f64_or_zero(&pos["marginUsed"]),
                        liquidation_price: parse_f64(&pos["liquidationPx"]),
                        last_updated_ms: ts,
                    },
                );
            }
        }

        self.positions = positions;
        self.metrics = AccountMetrics {
            account_value_usd: account_value,
            total_notional_usd: total_notional,
            total_margin_used_usd: total_margin,
            withdrawable_usd: withdrawable,
            last_updated_ms: ts,
        };
        Ok(())
    }

    /// Folds one fill into the view. A missing or dust prior position is
    /// treated as a blank prior; this never fails.
    ///
    /// Entry-price rules:
    ///   1. no prior entry → fill price
    ///   2. adding in the same direction → size-weighted average
    ///   3. opposite direction, |fill| ≤ |old| → keep old entry
    ///   4. opposite direction, |fill| > |old| (flip) → fill price
    pub fn apply_fill(&mut self, coin: &str, is_buy: bool, size: f64, price: f64, time: u64) {
        let signed_fill = if is_buy { size } else { -size };
        let prior = self.positions.get(coin);
        let old_size = prior.map(|p| p.size).unwrap_or(0.0);
        let old_entry = prior.map(|p| p.entry_price).unwrap_or(0.0);
        let leverage = prior.map(|p| p.leverage).unwrap_or(1.0);
        let leverage_type = prior.map(|p| p.leverage_type).unwrap_or(LeverageType::Cross);
        let liquidation_price = prior.and_then(|p| p.liquidation_price);

        let new_size = old_size + signed_fill;
        if is_dust(new_size) {
            self.positions.remove(coin);
            return;
        }

        let entry_price = if is_dust(old_size) || old_entry <= 0.0 {
            price
        } else if old_size.signum() == signed_fill.signum() {
            (old_size.abs() * old_entry + signed_fill.abs() * price) / new_size.abs()
        } else if signed_fill.abs() <= old_size.abs() {
            old_entry
        } else {
            // Flip: the surviving position was opened at the fill price.
            price
        };

        self.positions.insert(
            coin.to_string(),
            PositionSnapshot {
                coin: coin.to_string(),
                size: new_size,
                entry_price,
                position_value_usd: new_size.abs() * price,
                leverage,
                leverage_type,
                margin_used_usd: new_size.abs() * price,
                liquidation_price,
                last_updated_ms: time,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clearinghouse_doc() -> Value {
        json!({
            "marginSummary": {
                "accountValue": "100000.0",
                "totalNtlPos": "30000.0",
                "totalMarginUsed": "750.0"
            },
            "withdrawable": "99250.0",
            "assetPositions": [
                {"type": "oneWay", "position": {
                    "coin": "BTC", "szi": "0.5", "entryPx": "60000.0",
                    "positionValue": "30000.0",
                    "leverage": {"value": 40, "type": "cross"},
                    "marginUsed": "750.0", "liquidationPx": "21000.0"
                }},
                {"type": "oneWay", "position": {
                    "coin": "DUST", "szi": "0.0000000001", "entryPx": "1.0",
                    "positionValue": "0", "leverage": {"value": 1, "type": "cross"},
                    "marginUsed": "0"
                }},
                {"type": "hedged", "position": {
                    "coin": "ETH", "szi": "1.0", "entryPx": "3000.0",
                    "positionValue": "3000.0",
                    "leverage": {"value": 10, "type": "isolated"},
                    "marginUsed": "300.0"
                }}
            ]
        })
    }

    #[test]
    fn snapshot_replaces_state_and_drops_hedged_and_dust() {
        let mut store = TraderStateStore::new();
        store.apply_snapshot(&clearinghouse_doc()).unwrap();

        assert_eq!(store.equity(), 100000.0);
        assert_eq!(store.metrics().total_notional_usd, 30000.0);
        assert_eq!(store.metrics().withdrawable_usd, 99250.0);

        let btc = store.position("BTC").unwrap();
        assert_eq!(btc.size, 0.5);
        assert_eq!(btc.entry_price, 60000.0);
        assert_eq!(btc.leverage, 40.0);
        assert_eq!(btc.leverage_type, LeverageType::Cross);
        assert_eq!(btc.liquidation_price, Some(21000.0));

        assert!(store.position("DUST").is_none());
        assert!(store.position("ETH").is_none());
        assert_eq!(store.positions().count(), 1);
    }

    #[test]
    fn snapshot_with_unparseable_required_field_fails_and_keeps_state() {
        let mut store = TraderStateStore::new();
        store.apply_snapshot(&clearinghouse_doc()).unwrap();

        let bad = json!({
            "marginSummary": {"accountValue": "oops", "totalNtlPos": "0", "totalMarginUsed": "0"},
            "assetPositions": []
        });
        assert!(store.apply_snapshot(&bad).is_err());
        // Prior state survives a failed apply.
        assert_eq!(store.signed_size("BTC"), 0.5);
    }

    #[test]
    fn fill_with_no_prior_opens_at_fill_price() {
        let mut store = TraderStateStore::new();
        store.apply_fill("BTC", true, 0.5, 60000.0, 1);
        let pos = store.position("BTC").unwrap();
        assert_eq!(pos.size, 0.5);
        assert_eq!(pos.entry_price, 60000.0);
        assert_eq!(pos.position_value_usd, 30000.0);
    }

    #[test]
    fn adding_averages_entry_price() {
        let mut store = TraderStateStore::new();
        store.apply_fill("BTC", true, 1.0, 60000.0, 1);
        store.apply_fill("BTC", true, 1.0, 62000.0, 2);
        let pos = store.position("BTC").unwrap();
        assert_eq!(pos.size, 2.0);
        assert!((pos.entry_price - 61000.0).abs() < 1e-6);
    }

    #[test]
    fn pure_reduction_keeps_entry_price() {
        let mut store = TraderStateStore::new();
        store.apply_fill("BTC", true, 2.0, 60000.0, 1);
        store.apply_fill("BTC", false, 0.5, 65000.0, 2);
        let pos = store.position("BTC").unwrap();
        assert_eq!(pos.size, 1.5);
        assert_eq!(pos.entry_price, 60000.0);
    }

    #[test]
    fn flip_resets_entry_to_fill_price() {
        let mut store = TraderStateStore::new();
        store.apply_fill("BTC", true, 1.0, 60000.0, 1);
        store.apply_fill("BTC", false, 3.0, 58000.0, 2);
        let pos = store.position("BTC").unwrap();
        assert_eq!(pos.size, -2.0);
        assert_eq!(pos.entry_price, 58000.0);
    }

    #[test]
    fn full_close_removes_entry() {
        let mut store = TraderStateStore::new();
        store.apply_fill("ETH", false, 1.0, 3000.0, 1);
        store.apply_fill("ETH", true, 1.0, 2900.0, 2);
        assert!(store.position("ETH").is_none());
    }

    #[test]
    fn fill_carries_leverage_from_snapshot() {
        let mut store = TraderStateStore::new();
        store.apply_snapshot(&clearinghouse_doc()).unwrap();
        store.apply_fill("BTC", true, 0.1, 61000.0, 5);
        let pos = store.position("BTC").unwrap();
        assert_eq!(pos.leverage, 40.0);
        assert_eq!(pos.leverage_type, LeverageType::Cross);
        assert_eq!(pos.liquidation_price, Some(21000.0));
        assert!((pos.size - 0.6).abs() < 1e-9);
    }

    #[test]
    fn fill_sequence_matches_signed_sum() {
        let mut store = TraderStateStore::new();
        store.apply_snapshot(&clearinghouse_doc()).unwrap();
        let fills = [
            (true, 0.2, 60500.0),
            (false, 0.1, 60800.0),
            (false, 0.35, 61000.0),
            (true, 0.05, 60900.0),
        ];
        let mut expected = 0.5;
        for (i, (is_buy, sz, px)) in fills.iter().enumerate() {
            store.apply_fill("BTC", *is_buy, *sz, *px, i as u64);
            expected += if *is_buy { *sz } else { -*sz };
        }
        assert!((store.signed_size("BTC") - expected).abs() < crate::numeric::EPS);
    }
}
