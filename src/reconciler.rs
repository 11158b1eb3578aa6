// ─────────────────────────────────────────────────────────────────────────────
// reconciler.rs — periodic convergence between leader and follower.
//
// Each tick replaces both state stores from authoritative clearinghouse
// snapshots, then closes follower positions the leader no longer holds
// (the recovery path for fills lost across stream gaps). In smart-order
// mode it also cancels resting orders that no longer correspond to a
// leader position and forces reductions that have been resting too long.
// Ticks never overlap: a tick that fires while one is running is elided.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::{Arc, Mutex};

use crate::config::PairConfig;
use crate::exchange::{ExchangeError, InfoApi, OpenOrder, OrderApi, OrderStatus};
use crate::history::HistoricalPositionTracker;
use crate::logger::PairLogger;
use crate::metadata::MarketMetadataCache;
use crate::numeric::{clamp_to_band, float_to_wire, is_dust, now_ms, round_price, round_to_decimals};
use crate::signing::{random_cloid, OrderSpec, Tif};
use crate::state::{PositionSnapshot, TraderStateStore};

pub struct Reconciler {
    log: PairLogger,
    cfg: Arc<PairConfig>,
    leader_address: String,
    follower_account: String,
    info: Arc<dyn InfoApi>,
    orders: Arc<dyn OrderApi>,
    metadata: Arc<MarketMetadataCache>,
    leader: Arc<Mutex<TraderStateStore>>,
    follower: Arc<Mutex<TraderStateStore>>,
    history: Arc<Mutex<HistoricalPositionTracker>>,
    /// At-most-one tick in flight.
    in_flight: tokio::sync::Mutex<()>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: PairLogger,
        cfg: Arc<PairConfig>,
        follower_account: String,
        info: Arc<dyn InfoApi>,
        orders: Arc<dyn OrderApi>,
        metadata: Arc<MarketMetadataCache>,
        leader: Arc<Mutex<TraderStateStore>>,
        follower: Arc<Mutex<TraderStateStore>>,
        history: Arc<Mutex<HistoricalPositionTracker>>,
    ) -> Self {
        let leader_address = cfg.leader_address.to_lowercase();
        Self {
            log,
            cfg,
            leader_address,
            follower_account,
            info,
            orders,
            metadata,
            leader,
            follower,
            history,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Timer entry point. Elides the tick when one is already running.
    pub async fn run_once(&self) {
        match self.in_flight.try_lock() {
            Ok(_guard) => {
                if let Err(e) = self.tick().await {
                    self.log.error(format!("reconcile tick failed: {}", e));
                }
            }
            Err(_) => self.log.debug("reconcile tick elided: previous still running"),
        }
    }

    /// Startup variant: state must be seeded before the engine can run, so
    /// the error propagates instead of waiting for the next tick.
    pub async fn seed(&self) -> Result<(), ExchangeError> {
        let _guard = self.in_flight.lock().await;
        self.refresh_states().await
    }

    async fn tick(&self) -> Result<(), ExchangeError> {
        self.refresh_states().await?;
        self.close_orphan_positions().await;
        if self.cfg.enable_smart_order {
            self.clean_resting_orders().await;
        }
        Ok(())
    }

    async fn refresh_states(&self) -> Result<(), ExchangeError> {
        let (leader_doc, follower_doc) = tokio::join!(
            self.info.clearinghouse_state(&self.leader_address),
            self.info.clearinghouse_state(&self.follower_account),
        );
        let leader_doc = leader_doc?;
        let follower_doc = follower_doc?;

        let mut leader = self.leader.lock().unwrap();
        let mut follower = self.follower.lock().unwrap();
        leader.apply_snapshot(&leader_doc)?;
        follower.apply_snapshot(&follower_doc)?;
        Ok(())
    }

    /// Follower positions with no live leader counterpart get a reduce-only
    /// IOC close at mark-based slippage. One order per orphan per tick; if
    /// it fails, the next tick retries.
    async fn close_orphan_positions(&self) {
        let orphans: Vec<PositionSnapshot> = {
            let leader = self.leader.lock().unwrap();
            let follower = self.follower.lock().unwrap();
            follower
                .positions()
                .filter(|p| !is_dust(p.size) && is_dust(leader.signed_size(&p.coin)))
                .cloned()
                .collect()
        };

        for pos in orphans {
            self.log.warn(format!(
                "orphan position: follower holds {:.6} {} with leader flat; closing",
                pos.size, pos.coin
            ));
            match self.close_size_at_mark(&pos.coin, pos.size).await {
                Ok(()) => {
                    // Clear any lingering historical marker for the coin.
                    self.history.lock().unwrap().can_copy(&pos.coin, 0.0);
                }
                Err(e) => {
                    self.log
                        .error(format!("orphan close failed for {}: {}", pos.coin, e));
                }
            }
        }
    }

    /// Reduce-only IOC for `|signed_size|` of `coin` at mark ± slippage,
    /// clamped to [0.5, 2] × mark.
    async fn close_size_at_mark(&self, coin: &str, signed_size: f64) -> Result<(), ExchangeError> {
        let asset = self
            .metadata
            .asset(coin)
            .await
            .ok_or_else(|| ExchangeError::Parse(format!("unknown asset {}", coin)))?;
        let mark = self
            .metadata
            .mark_price(coin)
            .await
            .filter(|m| *m > 0.0)
            .ok_or_else(|| ExchangeError::Parse(format!("no mark price for {}", coin)))?;

        let is_buy = signed_size < 0.0;
        let slippage = self.cfg.risk.slippage();
        let raw = if is_buy { mark * (1.0 + slippage) } else { mark * (1.0 - slippage) };
        let limit = clamp_to_band(raw, mark, 0.5, 2.0);

        let size = round_to_decimals(signed_size.abs(), asset.sz_decimals);
        if is_dust(size) {
            return Ok(());
        }
        let reference = self
            .metadata
            .mark_price_raw(coin)
            .await
            .unwrap_or_else(|| float_to_wire(mark));

        let spec = OrderSpec {
            asset: asset.asset_id,
            is_buy,
            limit_px: round_price(limit, &reference),
            sz: float_to_wire(size),
            reduce_only: true,
            tif: Tif::Ioc,
            cloid: Some(random_cloid()),
        };
        let statuses = self.orders.place_orders(vec![spec]).await?;
        match statuses.into_iter().next() {
            Some(OrderStatus::Rejected(e)) => Err(e),
            Some(_) => {
                self.log.info(format!("reduce-only close submitted for {}", coin));
                Ok(())
            }
            None => Err(ExchangeError::Parse("empty statuses".to_string())),
        }
    }

    /// Smart-mode housekeeping over the follower's resting orders:
    ///   1. orders on coins with no leader position → batch cancel
    ///   2. reduce orders older than the timeout → cancel, then force the
    ///      reduction with an aggressive reduce-only IOC
    async fn clean_resting_orders(&self) {
        let open_orders = match self.info.open_orders(&self.follower_account).await {
            Ok(o) => o,
            Err(e) => {
                self.log.warn(format!("openOrders fetch failed: {}", e));
                return;
            }
        };
        if open_orders.is_empty() {
            return;
        }

        let now = now_ms();
        let timeout = self.cfg.risk.reduce_order_timeout_ms;
        let mut to_cancel: Vec<(u32, u64)> = Vec::new();
        let mut to_force: Vec<OpenOrder> = Vec::new();

        for order in &open_orders {
            let leader_size = self.leader.lock().unwrap().signed_size(&order.coin);
            let follower_size = self.follower.lock().unwrap().signed_size(&order.coin);

            if is_dust(leader_size) {
                if let Some(asset) = self.metadata.asset(&order.coin).await {
                    self.log.info(format!(
                        "cancelling stray order {} on {} (leader flat)",
                        order.oid, order.coin
                    ));
                    to_cancel.push((asset.asset_id, order.oid));
                }
                continue;
            }

            if timeout == 0 {
                continue;
            }
            let reduces_current = (follower_size > 0.0 && !order.is_buy())
                || (follower_size < 0.0 && order.is_buy());
            let age = now.saturating_sub(order.timestamp);
            if reduces_current && age > timeout {
                self.log.warn(format!(
                    "reduce order {} on {} @ {} stale after {}ms; forcing",
                    order.oid, order.coin, order.limit_px, age
                ));
                to_force.push(order.clone());
            }
        }

        for order in &to_force {
            if let Some(asset) = self.metadata.asset(&order.coin).await {
                to_cancel.push((asset.asset_id, order.oid));
            }
        }

        if !to_cancel.is_empty() {
            if let Err(e) = self.orders.cancel_orders(to_cancel).await {
                // A failed cancel usually means the order already filled.
                self.log.debug(format!("batch cancel failed: {}", e));
            }
        }

        for order in to_force {
            let follower_size = self.follower.lock().unwrap().signed_size(&order.coin);
            if is_dust(follower_size) {
                continue;
            }
            let remaining = order.sz.min(follower_size.abs());
            if is_dust(remaining) {
                continue;
            }
            let signed = if follower_size > 0.0 { remaining } else { -remaining };
            if let Err(e) = self.close_size_at_mark(&order.coin, signed).await {
                self.log.warn(format!("forced reduction failed for {}: {}", order.coin, e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    use crate::persistence::PairPersistence;

    const LEADER: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const FOLLOWER: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const FOLLOWER_KEY: &str =
        "0x0123456789012345678901234567890123456789012345678901234567890123";

    struct MockInfo {
        leader_doc: Value,
        follower_doc: Value,
        open: Vec<OpenOrder>,
    }

    #[async_trait]
    impl InfoApi for MockInfo {
        async fn meta_and_asset_ctxs(&self) -> Result<Value, ExchangeError> {
            Ok(json!([
                {"universe": [
                    {"name": "BTC", "szDecimals": 5, "maxLeverage": 40},
                    {"name": "ETH", "szDecimals": 4, "maxLeverage": 25}
                ]},
                [{"markPx": "60000.0"}, {"markPx": "3000.0"}]
            ]))
        }
        async fn clearinghouse_state(&self, user: &str) -> Result<Value, ExchangeError> {
            if user.eq_ignore_ascii_case(LEADER) {
                Ok(self.leader_doc.clone())
            } else {
                Ok(self.follower_doc.clone())
            }
        }
        async fn all_mids(&self) -> Result<HashMap<String, String>, ExchangeError> {
            Ok(HashMap::new())
        }
        async fn l2_book(&self, _coin: &str) -> Result<Value, ExchangeError> {
            Ok(json!({}))
        }
        async fn open_orders(&self, _user: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
            Ok(self.open.clone())
        }
    }

    #[derive(Default)]
    struct MockOrders {
        placed: Mutex<Vec<OrderSpec>>,
        cancelled: Mutex<Vec<(u32, u64)>>,
    }

    #[async_trait]
    impl OrderApi for MockOrders {
        async fn place_orders(
            &self,
            orders: Vec<OrderSpec>,
        ) -> Result<Vec<OrderStatus>, ExchangeError> {
            let n = orders.len();
            self.placed.lock().unwrap().extend(orders);
            Ok((0..n).map(|i| OrderStatus::Filled { oid: 2000 + i as u64 }).collect())
        }
        async fn cancel_orders(&self, cancels: Vec<(u32, u64)>) -> Result<(), ExchangeError> {
            self.cancelled.lock().unwrap().extend(cancels);
            Ok(())
        }
        async fn update_leverage(&self, _: u32, _: bool, _: u32) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    fn clearinghouse(account_value: f64, positions: Value) -> Value {
        json!({
            "marginSummary": {
                "accountValue": account_value.to_string(),
                "totalNtlPos": "0",
                "totalMarginUsed": "0"
            },
            "withdrawable": account_value.to_string(),
            "assetPositions": positions
        })
    }

    fn eth_position(szi: &str) -> Value {
        json!([{"type": "oneWay", "position": {
            "coin": "ETH", "szi": szi, "entryPx": "3000.0",
            "positionValue": "300.0",
            "leverage": {"value": 10, "type": "cross"},
            "marginUsed": "30.0"
        }}])
    }

    struct Harness {
        reconciler: Reconciler,
        orders: Arc<MockOrders>,
    }

    async fn harness(info: MockInfo, smart: bool, timeout_ms: u64) -> Harness {
        let cfg = Arc::new(
            crate::config::Config::parse(&format!(
                r#"{{"pairs": [{{"id": "p1", "leaderAddress": "{}", "followerPrivateKey": "{}",
                    "followerAddress": "{}", "enableSmartOrder": {},
                    "risk": {{"reduceOrderTimeoutMs": {}}}}}]}}"#,
                LEADER, FOLLOWER_KEY, FOLLOWER, smart, timeout_ms
            ))
            .unwrap()
            .pairs
            .remove(0),
        );

        let info: Arc<dyn InfoApi> = Arc::new(info);
        let orders = Arc::new(MockOrders::default());
        let metadata = Arc::new(MarketMetadataCache::new(info.clone()));
        metadata.ensure_loaded().await.unwrap();

        let dir = std::env::temp_dir().join(format!("copy-reconcile-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let persistence = Arc::new(PairPersistence::new(&dir, "p1", LEADER, 1000));
        let mut tracker =
            HistoricalPositionTracker::new(persistence.clone(), PairLogger::new("p1"));
        tracker.initialize(&[("ETH".to_string(), 0.1)]);

        let reconciler = Reconciler::new(
            PairLogger::new("p1"),
            cfg,
            FOLLOWER.to_string(),
            info,
            orders.clone() as Arc<dyn OrderApi>,
            metadata,
            Arc::new(Mutex::new(TraderStateStore::new())),
            Arc::new(Mutex::new(TraderStateStore::new())),
            Arc::new(Mutex::new(tracker)),
        );
        Harness { reconciler, orders }
    }

    #[tokio::test]
    async fn orphan_position_gets_one_reduce_only_close() {
        // Scenario 6: leader flattened ETH during an outage; follower still
        // holds 0.1.
        let h = harness(
            MockInfo {
                leader_doc: clearinghouse(100_000.0, json!([])),
                follower_doc: clearinghouse(1_000.0, eth_position("0.1")),
                open: vec![],
            },
            false,
            0,
        )
        .await;

        h.reconciler.run_once().await;

        let placed = h.orders.placed.lock().unwrap();
        assert_eq!(placed.len(), 1);
        let o = &placed[0];
        assert_eq!(o.asset, 1);
        assert!(!o.is_buy); // closing a long
        assert!(o.reduce_only);
        assert_eq!(o.tif, Tif::Ioc);
        assert_eq!(o.sz, "0.1");
        // mark 3000 * (1 - 0.05) = 2850, to mark precision.
        assert_eq!(o.limit_px, "2850");

        // The historical marker cleared on successful close.
        assert!(!h
            .reconciler
            .history
            .lock()
            .unwrap()
            .is_historical("ETH"));
    }

    #[tokio::test]
    async fn orphan_short_is_bought_back() {
        let h = harness(
            MockInfo {
                leader_doc: clearinghouse(100_000.0, json!([])),
                follower_doc: clearinghouse(1_000.0, eth_position("-0.1")),
                open: vec![],
            },
            false,
            0,
        )
        .await;
        h.reconciler.run_once().await;
        let placed = h.orders.placed.lock().unwrap();
        assert_eq!(placed.len(), 1);
        assert!(placed[0].is_buy);
        assert_eq!(placed[0].limit_px, "3150");
    }

    #[tokio::test]
    async fn matching_positions_produce_no_orders() {
        let h = harness(
            MockInfo {
                leader_doc: clearinghouse(100_000.0, eth_position("1.0")),
                follower_doc: clearinghouse(1_000.0, eth_position("0.01")),
                open: vec![],
            },
            false,
            0,
        )
        .await;
        h.reconciler.run_once().await;
        assert!(h.orders.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_snapshot_fetch_skips_the_tick() {
        struct FailingInfo;
        #[async_trait]
        impl InfoApi for FailingInfo {
            async fn meta_and_asset_ctxs(&self) -> Result<Value, ExchangeError> {
                Ok(json!([{"universe": []}, []]))
            }
            async fn clearinghouse_state(&self, _user: &str) -> Result<Value, ExchangeError> {
                Err(ExchangeError::Network("boom".to_string()))
            }
            async fn all_mids(&self) -> Result<HashMap<String, String>, ExchangeError> {
                Ok(HashMap::new())
            }
            async fn l2_book(&self, _coin: &str) -> Result<Value, ExchangeError> {
                Ok(json!({}))
            }
            async fn open_orders(&self, _user: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
                Ok(vec![])
            }
        }

        let cfg = Arc::new(
            crate::config::Config::parse(&format!(
                r#"{{"pairs": [{{"id": "p1", "leaderAddress": "{}", "followerPrivateKey": "{}",
                    "followerAddress": "{}"}}]}}"#,
                LEADER, FOLLOWER_KEY, FOLLOWER
            ))
            .unwrap()
            .pairs
            .remove(0),
        );
        let info: Arc<dyn InfoApi> = Arc::new(FailingInfo);
        let orders = Arc::new(MockOrders::default());
        let metadata = Arc::new(MarketMetadataCache::new(info.clone()));
        let dir = std::env::temp_dir().join(format!("copy-reconcile-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let persistence = Arc::new(PairPersistence::new(&dir, "p1", LEADER, 1000));
        let tracker = HistoricalPositionTracker::new(persistence, PairLogger::new("p1"));

        let reconciler = Reconciler::new(
            PairLogger::new("p1"),
            cfg,
            FOLLOWER.to_string(),
            info,
            orders.clone() as Arc<dyn OrderApi>,
            metadata,
            Arc::new(Mutex::new(TraderStateStore::new())),
            Arc::new(Mutex::new(TraderStateStore::new())),
            Arc::new(Mutex::new(tracker)),
        );

        reconciler.run_once().await; // must not panic, no orders
        assert!(orders.placed.lock().unwrap().is_empty());
        assert!(reconciler.seed().await.is_err());
    }

    #[tokio::test]
    async fn smart_mode_cancels_orders_without_leader_position() {
        let stray = OpenOrder {
            oid: 500,
            coin: "BTC".to_string(),
            side: "B".to_string(),
            limit_px: 59000.0,
            sz: 0.001,
            reduce_only: false,
            timestamp: now_ms(),
            cloid: None,
        };
        let h = harness(
            MockInfo {
                leader_doc: clearinghouse(100_000.0, eth_position("1.0")),
                follower_doc: clearinghouse(1_000.0, eth_position("0.01")),
                open: vec![stray],
            },
            true,
            0,
        )
        .await;
        h.reconciler.run_once().await;

        assert_eq!(h.orders.cancelled.lock().unwrap().as_slice(), &[(0u32, 500u64)]);
        assert!(h.orders.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_reduce_order_is_cancelled_and_forced() {
        // Follower long 0.01 ETH with a sell (reduce) order resting for 10
        // minutes; leader still holds ETH so it is not a stray.
        let stale = OpenOrder {
            oid: 600,
            coin: "ETH".to_string(),
            side: "A".to_string(),
            limit_px: 3100.0,
            sz: 0.005,
            reduce_only: true,
            timestamp: now_ms() - 600_000,
            cloid: None,
        };
        let h = harness(
            MockInfo {
                leader_doc: clearinghouse(100_000.0, eth_position("1.0")),
                follower_doc: clearinghouse(1_000.0, eth_position("0.01")),
                open: vec![stale],
            },
            true,
            180_000,
        )
        .await;
        h.reconciler.run_once().await;

        assert_eq!(h.orders.cancelled.lock().unwrap().as_slice(), &[(1u32, 600u64)]);
        let placed = h.orders.placed.lock().unwrap();
        assert_eq!(placed.len(), 1);
        assert!(!placed[0].is_buy);
        assert!(placed[0].reduce_only);
        assert_eq!(placed[0].tif, Tif::Ioc);
        assert_eq!(placed[0].sz, "0.005");
    }

    #[tokio::test]
    async fn fresh_reduce_orders_are_left_alone() {
        let fresh = OpenOrder {
            oid: 700,
            coin: "ETH".to_string(),
            side: "A".to_string(),
            limit_px: 3100.0,
            sz: 0.005,
            reduce_only: true,
            timestamp: now_ms() - 10_000,
            cloid: None,
        };
        let h = harness(
            MockInfo {
                leader_doc: clearinghouse(100_000.0, eth_position("1.0")),
                follower_doc: clearinghouse(1_000.0, eth_position("0.01")),
                open: vec![fresh],
            },
            true,
            180_000,
        )
        .await;
        h.reconciler.run_once().await;
        assert!(h.orders.cancelled.lock().unwrap().is_empty());
        assert!(h.orders.placed.lock().unwrap().is_empty());
    }
}
