// ─────────────────────────────────────────────────────────────────────────────
// signal.rs — the copy-trading core.
//
// Turns a batch of leader fills into at most one follower order per leader
// order id: aggregate → classify → historical filter → equity-proportional
// sizing with the minimum-notional boost policy → action determination →
// order construction and submission. One fill event is processed at a time
// per pair; overlapping events are dropped (the next event carries the
// latest state).
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{PairConfig, RiskConfig};
use crate::exchange::{ExchangeError, InfoApi, OrderApi, OrderStatus};
use crate::history::HistoricalPositionTracker;
use crate::logger::PairLogger;
use crate::metadata::MarketMetadataCache;
use crate::numeric::{
    clamp_to_band, float_to_wire, is_dust, now_ms, round_price, round_to_decimals, EPS,
};
use crate::persistence::PairPersistence;
use crate::signing::{random_cloid, OrderSpec, Tif};
use crate::state::TraderStateStore;
use crate::stream::{Fill, FillEvent};
use crate::trade_log::{TradeLog, TradeOutcome, TradeRecord};

/// Extra dollar added on top of the minimum notional when boosting.
const BOOST_MARGIN_USD: f64 = 1.0;
/// A reduction covering at least this share of the leader position closes
/// the follower entirely.
const FULL_CLOSE_RATIO: f64 = 0.99;

// ─── Direction ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
    LongToShort,
    ShortToLong,
}

impl Direction {
    /// Maps the stream's `dir` field. Anything outside the perpetuals set
    /// (spot "Buy"/"Sell" included) is None.
    pub fn from_wire(dir: &str) -> Option<Self> {
        match dir {
            "Open Long" => Some(Direction::OpenLong),
            "Close Long" => Some(Direction::CloseLong),
            "Open Short" => Some(Direction::OpenShort),
            "Close Short" => Some(Direction::CloseShort),
            "Long > Short" => Some(Direction::LongToShort),
            "Short > Long" => Some(Direction::ShortToLong),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::OpenLong => "OpenLong",
            Direction::CloseLong => "CloseLong",
            Direction::OpenShort => "OpenShort",
            Direction::CloseShort => "CloseShort",
            Direction::LongToShort => "LongToShort",
            Direction::ShortToLong => "ShortToLong",
        }
    }

    /// Mirror for inverse-configured pairs.
    pub fn inverted(&self) -> Self {
        match self {
            Direction::OpenLong => Direction::OpenShort,
            Direction::OpenShort => Direction::OpenLong,
            Direction::CloseLong => Direction::CloseShort,
            Direction::CloseShort => Direction::CloseLong,
            Direction::LongToShort => Direction::ShortToLong,
            Direction::ShortToLong => Direction::LongToShort,
        }
    }

    pub fn is_opening(&self) -> bool {
        matches!(
            self,
            Direction::OpenLong
                | Direction::OpenShort
                | Direction::LongToShort
                | Direction::ShortToLong
        )
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, Direction::CloseLong | Direction::CloseShort)
    }

    pub fn is_reversal(&self) -> bool {
        matches!(self, Direction::LongToShort | Direction::ShortToLong)
    }
}

// ─── Signal model ────────────────────────────────────────────────────────────

/// One leader order, reconstructed from its fills.
#[derive(Debug, Clone)]
pub struct TradingSignal {
    pub coin: String,
    pub direction: Direction,
    /// Total filled size, absolute.
    pub size: f64,
    pub avg_price: f64,
    pub order_id: u64,
    pub start_position: f64,
    pub end_position: f64,
    pub timestamp: u64,
    pub crossed: bool,
    pub is_new_position: bool,
    pub is_full_close: bool,
}

#[derive(Debug)]
struct AggregatedFill {
    coin: String,
    direction: Direction,
    oid: u64,
    size: f64,
    notional: f64,
    start_position: f64,
    signed_sum: f64,
    timestamp: u64,
    crossed: bool,
}

/// Collapses a fill batch into one synthetic fill per order id, dropping
/// spot trades (coin prefixed `@`, or a direction outside the perp set).
fn aggregate_fills(fills: &[Fill]) -> Vec<AggregatedFill> {
    let mut order: Vec<u64> = Vec::new();
    let mut by_oid: HashMap<u64, AggregatedFill> = HashMap::new();

    for fill in fills {
        if fill.coin.starts_with('@') {
            continue;
        }
        let direction = match Direction::from_wire(&fill.dir) {
            Some(d) => d,
            None => continue,
        };
        let size = fill.sz_f64();
        let price = fill.px_f64();
        let signed = if fill.is_buy() { size } else { -size };

        let entry = by_oid.entry(fill.oid).or_insert_with(|| {
            order.push(fill.oid);
            AggregatedFill {
                coin: fill.coin.clone(),
                direction,
                oid: fill.oid,
                size: 0.0,
                notional: 0.0,
                start_position: fill.start_position_f64(),
                signed_sum: 0.0,
                timestamp: fill.time,
                crossed: false,
            }
        });
        entry.size += size;
        entry.notional += size * price;
        entry.signed_sum += signed;
        entry.timestamp = entry.timestamp.max(fill.time);
        entry.crossed |= fill.crossed;
    }

    order
        .into_iter()
        .filter_map(|oid| by_oid.remove(&oid))
        .collect()
}

fn to_signal(agg: AggregatedFill) -> Option<TradingSignal> {
    if is_dust(agg.size) {
        return None;
    }
    let end_position = agg.start_position + agg.signed_sum;
    Some(TradingSignal {
        coin: agg.coin,
        direction: agg.direction,
        size: agg.size,
        avg_price: agg.notional / agg.size,
        order_id: agg.oid,
        start_position: agg.start_position,
        end_position,
        timestamp: agg.timestamp,
        crossed: agg.crossed,
        is_new_position: is_dust(agg.start_position),
        is_full_close: is_dust(end_position),
    })
}

// ─── Sizing (opening actions) ────────────────────────────────────────────────

#[derive(Debug)]
pub struct SizingInputs<'a> {
    pub risk: &'a RiskConfig,
    pub min_order_notional_usd: f64,
    pub leader_equity: f64,
    pub follower_equity: f64,
    pub current_mark: Option<f64>,
}

#[derive(Debug, PartialEq)]
pub enum Sizing {
    Proceed { size: f64, boosted: bool },
    Skip { reason: String },
}

/// Equity-proportional size for an opening action, with the
/// minimum-notional boost policy:
///   - at or above the minimum → proceed as computed
///   - below it, new position or reversal → boost to (minimum + $1)
///   - below it, add to existing → boost only if the current mark is not
///     worse than the leader's price by more than the threshold
///
/// For a reversal the opening leg is the leader's end position, not the
/// whole fill (the closing leg is sized off the follower's live position).
pub fn compute_opening_size(
    signal: &TradingSignal,
    effective: Direction,
    inputs: &SizingInputs,
) -> Sizing {
    let leader_open = if signal.direction.is_reversal() {
        signal.end_position.abs()
    } else {
        signal.size
    };
    let equity_ratio = inputs.follower_equity / inputs.leader_equity;
    let size = leader_open * equity_ratio * inputs.risk.copy_ratio;
    let notional = size * signal.avg_price;
    let boost_target = inputs.min_order_notional_usd + BOOST_MARGIN_USD;

    if notional >= inputs.min_order_notional_usd {
        return Sizing::Proceed { size, boosted: false };
    }

    if signal.is_new_position || signal.direction.is_reversal() {
        return Sizing::Proceed { size: boost_target / signal.avg_price, boosted: true };
    }

    // Add to an existing position: only boost when the price moved in our
    // favor (or nearly so) since the leader filled.
    let mark = match inputs.current_mark {
        Some(m) if m > 0.0 => m,
        _ => {
            return Sizing::Skip {
                reason: format!("{}: no mark price for favorability check", signal.coin),
            }
        }
    };
    let price_diff = (mark - signal.avg_price) / signal.avg_price;
    let threshold = inputs.risk.boost_price_threshold;
    let favorable = match effective {
        Direction::OpenLong => price_diff <= threshold,
        Direction::OpenShort => price_diff >= -threshold,
        _ => false,
    };
    if favorable {
        Sizing::Proceed { size: boost_target / signal.avg_price, boosted: true }
    } else {
        Sizing::Skip {
            reason: format!(
                "{}: add unfavorable (mark {:.6} vs fill {:.6}, diff {:+.5})",
                signal.coin, mark, signal.avg_price, price_diff
            ),
        }
    }
}

// ─── Action determination ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub coin: String,
    pub is_buy: bool,
    pub size: f64,
    pub reduce_only: bool,
    /// True for add/reduce of an existing position: the only case smart
    /// mode rests a GTC at the leader's price. New, full-close and
    /// reversal orders are always aggressive.
    pub passive_eligible: bool,
}

#[derive(Debug, PartialEq)]
pub enum ActionDecision {
    Submit(OrderIntent),
    Skip { reason: String },
}

#[derive(Debug)]
pub struct ActionInputs {
    pub min_order_notional_usd: f64,
    pub boost_price_threshold: f64,
    /// Follower's current signed position in the coin.
    pub follower_signed: f64,
    /// Leader's position after the authoritative refresh.
    pub leader_signed: f64,
    pub current_mark: Option<f64>,
}

/// Maps an effective direction plus the follower's live position onto a
/// concrete order. `opening_size` is the §sizing output and is required for
/// opening directions.
pub fn determine_action(
    signal: &TradingSignal,
    effective: Direction,
    opening_size: Option<f64>,
    inputs: &ActionInputs,
) -> ActionDecision {
    let follower = inputs.follower_signed;
    match effective {
        Direction::OpenLong | Direction::OpenShort => {
            let size = opening_size.unwrap_or(0.0);
            if is_dust(size) {
                return ActionDecision::Skip { reason: "computed size is zero".to_string() };
            }
            ActionDecision::Submit(OrderIntent {
                coin: signal.coin.clone(),
                is_buy: effective == Direction::OpenLong,
                size,
                reduce_only: false,
                passive_eligible: !is_dust(follower),
            })
        }

        Direction::CloseLong => close_action(signal, inputs, true),
        Direction::CloseShort => close_action(signal, inputs, false),

        Direction::LongToShort | Direction::ShortToLong => {
            let opening = opening_size.unwrap_or(0.0);
            let closing = if effective == Direction::LongToShort {
                follower.max(0.0)
            } else {
                (-follower).max(0.0)
            };
            let size = closing + opening;
            if is_dust(size) {
                return ActionDecision::Skip { reason: "nothing to reverse".to_string() };
            }
            // One aggressive order crossing through flat.
            ActionDecision::Submit(OrderIntent {
                coin: signal.coin.clone(),
                is_buy: effective == Direction::ShortToLong,
                size,
                reduce_only: false,
                passive_eligible: false,
            })
        }
    }
}

fn close_action(signal: &TradingSignal, inputs: &ActionInputs, closing_long: bool) -> ActionDecision {
    let follower = inputs.follower_signed;

    // Leader already flat: force the follower flat whichever way it points.
    if is_dust(inputs.leader_signed) && !is_dust(follower) {
        return ActionDecision::Submit(OrderIntent {
            coin: signal.coin.clone(),
            is_buy: follower < 0.0,
            size: follower.abs(),
            reduce_only: true,
            passive_eligible: false,
        });
    }

    let held = if closing_long { follower } else { -follower };
    if held <= EPS {
        return ActionDecision::Skip {
            reason: format!(
                "no follower {} to reduce",
                if closing_long { "long" } else { "short" }
            ),
        };
    }

    let ratio = if is_dust(signal.start_position) {
        1.0
    } else {
        signal.size / signal.start_position.abs()
    };
    let full = signal.is_full_close || ratio >= FULL_CLOSE_RATIO;
    let boost_target = inputs.min_order_notional_usd + BOOST_MARGIN_USD;

    let mut size = if full { held } else { held * ratio };
    let mut passive_eligible = !full;

    if !full && size * signal.avg_price < inputs.min_order_notional_usd {
        let whole_notional = held * signal.avg_price;
        if whole_notional >= boost_target {
            let mark = match inputs.current_mark {
                Some(m) if m > 0.0 => m,
                _ => {
                    return ActionDecision::Skip {
                        reason: format!("{}: no mark price for favorability check", signal.coin),
                    }
                }
            };
            let price_diff = (mark - signal.avg_price) / signal.avg_price;
            let unfavorable = if closing_long {
                price_diff < -inputs.boost_price_threshold
            } else {
                price_diff > inputs.boost_price_threshold
            };
            if unfavorable {
                return ActionDecision::Skip {
                    reason: format!(
                        "{}: reduce unfavorable (mark drifted {:+.5})",
                        signal.coin, price_diff
                    ),
                };
            }
            size = boost_target / signal.avg_price;
        } else {
            // The whole position is below the boost target; take it all off.
            size = held;
            passive_eligible = false;
        }
    }

    ActionDecision::Submit(OrderIntent {
        coin: signal.coin.clone(),
        is_buy: !closing_long,
        size,
        reduce_only: true,
        passive_eligible,
    })
}

// ─── Processor ───────────────────────────────────────────────────────────────

pub struct SignalProcessor {
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
    persistence: Arc<PairPersistence>,
    trade_log: Arc<TradeLog>,
    /// Single-entry gate: one fill event at a time per pair.
    processing: AtomicBool,
    /// (leverage, is_cross) last pushed per coin, to avoid redundant writes.
    leverage_cache: Mutex<HashMap<String, (u32, bool)>>,
}

impl SignalProcessor {
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
        persistence: Arc<PairPersistence>,
        trade_log: Arc<TradeLog>,
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
            persistence,
            trade_log,
            processing: AtomicBool::new(false),
            leverage_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Entry point for one streaming event.
    pub async fn on_fill_event(&self, event: FillEvent) {
        if event.fills.is_empty() {
            return;
        }
        if event.is_snapshot {
            self.log.debug("ignoring snapshot fill batch");
            return;
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.log
                .debug("fill event dropped: previous event still processing");
            return;
        }
        self.process(event).await;
        self.processing.store(false, Ordering::SeqCst);
    }

    async fn process(&self, event: FillEvent) {
        {
            let mut leader = self.leader.lock().unwrap();
            for fill in &event.fills {
                leader.apply_fill(&fill.coin, fill.is_buy(), fill.sz_f64(), fill.px_f64(), fill.time);
            }
        }

        let signals: Vec<TradingSignal> = aggregate_fills(&event.fills)
            .into_iter()
            .filter_map(to_signal)
            .collect();

        for signal in signals {
            self.audit(&signal, TradeOutcome::Received, None, None, None);

            let can_copy = self
                .history
                .lock()
                .unwrap()
                .can_copy(&signal.coin, signal.end_position);
            if !can_copy {
                let reason = if signal.is_full_close {
                    "close of historical position"
                } else {
                    "ongoing historical position"
                };
                self.log.info(format!(
                    "skip {} {} oid={}: {}",
                    signal.direction.as_str(),
                    signal.coin,
                    signal.order_id,
                    reason
                ));
                self.audit(&signal, TradeOutcome::Skipped, Some(reason.to_string()), None, None);
                continue;
            }

            self.execute_signal(signal).await;
        }
    }

    async fn execute_signal(&self, signal: TradingSignal) {
        // Sizing depends on live equity on both sides; pull authoritative
        // snapshots in parallel before acting.
        let (leader_doc, follower_doc) = tokio::join!(
            self.info.clearinghouse_state(&self.leader_address),
            self.info.clearinghouse_state(&self.follower_account),
        );
        let (leader_doc, follower_doc) = match (leader_doc, follower_doc) {
            (Ok(l), Ok(f)) => (l, f),
            (l, f) => {
                let err = l.err().or(f.err()).map(|e| e.to_string()).unwrap_or_default();
                self.log.error(format!("state refresh failed before signal: {}", err));
                self.audit(
                    &signal,
                    TradeOutcome::Skipped,
                    Some(format!("state refresh failed: {}", err)),
                    None,
                    None,
                );
                return;
            }
        };

        let applied = {
            let mut leader = self.leader.lock().unwrap();
            let mut follower = self.follower.lock().unwrap();
            leader
                .apply_snapshot(&leader_doc)
                .and_then(|_| follower.apply_snapshot(&follower_doc))
        };
        if let Err(e) = applied {
            self.log.error(format!("snapshot apply failed: {}", e));
            self.audit(
                &signal,
                TradeOutcome::Skipped,
                Some(format!("snapshot apply failed: {}", e)),
                None,
                None,
            );
            return;
        }

        let (leader_equity, leader_signed, leader_pos) = {
            let leader = self.leader.lock().unwrap();
            (
                leader.equity(),
                leader.signed_size(&signal.coin),
                leader.position(&signal.coin).cloned(),
            )
        };
        let (follower_equity, follower_signed) = {
            let follower = self.follower.lock().unwrap();
            (follower.equity(), follower.signed_size(&signal.coin))
        };
        if leader_equity <= 0.0 || follower_equity <= 0.0 {
            self.audit(
                &signal,
                TradeOutcome::Skipped,
                Some("non-positive equity".to_string()),
                None,
                None,
            );
            return;
        }

        let effective = if self.cfg.risk.inverse {
            signal.direction.inverted()
        } else {
            signal.direction
        };
        let current_mark = self.metadata.mark_price(&signal.coin).await;

        let opening_size = if effective.is_opening() {
            let sizing = compute_opening_size(
                &signal,
                effective,
                &SizingInputs {
                    risk: &self.cfg.risk,
                    min_order_notional_usd: self.cfg.min_order_notional_usd,
                    leader_equity,
                    follower_equity,
                    current_mark,
                },
            );
            match sizing {
                Sizing::Proceed { size, boosted } => {
                    if boosted {
                        self.log.info(format!(
                            "{} {}: boosting below-minimum order to ${:.2}",
                            effective.as_str(),
                            signal.coin,
                            self.cfg.min_order_notional_usd + BOOST_MARGIN_USD
                        ));
                    }
                    Some(size)
                }
                Sizing::Skip { reason } => {
                    self.log.info(format!("skip {}: {}", signal.order_id, reason));
                    self.audit(&signal, TradeOutcome::Skipped, Some(reason), None, None);
                    return;
                }
            }
        } else {
            None
        };

        let decision = determine_action(
            &signal,
            effective,
            opening_size,
            &ActionInputs {
                min_order_notional_usd: self.cfg.min_order_notional_usd,
                boost_price_threshold: self.cfg.risk.boost_price_threshold,
                follower_signed,
                leader_signed,
                current_mark,
            },
        );

        let mut intent = match decision {
            ActionDecision::Submit(intent) => intent,
            ActionDecision::Skip { reason } => {
                self.log.info(format!(
                    "skip {} {} oid={}: {}",
                    signal.direction.as_str(),
                    signal.coin,
                    signal.order_id,
                    reason
                ));
                self.audit(&signal, TradeOutcome::Skipped, Some(reason), None, None);
                return;
            }
        };

        // Notional cap applies to risk-increasing orders only.
        let max_notional = self.cfg.risk.max_notional_usd;
        if !intent.reduce_only && max_notional > 0.0 {
            let notional = intent.size * signal.avg_price;
            if notional > max_notional {
                let capped = max_notional / signal.avg_price;
                self.log.warn(format!(
                    "{}: capping notional ${:.2} -> ${:.2}",
                    signal.coin, notional, max_notional
                ));
                intent.size = capped;
            }
        }
        if is_dust(intent.size) {
            self.audit(
                &signal,
                TradeOutcome::Skipped,
                Some("size zero after caps".to_string()),
                None,
                None,
            );
            return;
        }

        let opening_new = !intent.reduce_only && is_dust(follower_signed);
        if opening_new {
            self.sync_leverage(&signal.coin, leader_pos.as_ref()).await;
        }

        self.submit(&signal, intent, leader_equity, follower_equity, opening_new)
            .await;
    }

    /// Pushes the leader's leverage setting onto the follower before a new
    /// position. Best-effort: failures are logged and the trade proceeds.
    async fn sync_leverage(&self, coin: &str, leader_pos: Option<&crate::state::PositionSnapshot>) {
        if !self.cfg.risk.sync_leverage {
            return;
        }
        let pos = match leader_pos {
            Some(p) if p.leverage > 0.0 => p,
            _ => return,
        };
        let asset = match self.metadata.asset(coin).await {
            Some(a) => a,
            None => return,
        };

        let mut target = pos.leverage.floor() as u32;
        target = target.clamp(1, asset.max_leverage.max(1));
        if self.cfg.risk.max_leverage > 0 {
            target = target.min(self.cfg.risk.max_leverage);
        }
        let is_cross = pos.leverage_type.is_cross();

        {
            let cache = self.leverage_cache.lock().unwrap();
            if cache.get(coin) == Some(&(target, is_cross)) {
                return;
            }
        }

        match self.orders.update_leverage(asset.asset_id, is_cross, target).await {
            Ok(()) => {
                self.log.info(format!(
                    "leverage synced for {}: {}x {}",
                    coin,
                    target,
                    if is_cross { "cross" } else { "isolated" }
                ));
                self.leverage_cache
                    .lock()
                    .unwrap()
                    .insert(coin.to_string(), (target, is_cross));
            }
            Err(e) => {
                self.log
                    .warn(format!("leverage sync failed for {}: {} (continuing)", coin, e));
            }
        }
    }

    async fn submit(
        &self,
        signal: &TradingSignal,
        intent: OrderIntent,
        leader_equity: f64,
        follower_equity: f64,
        opening_new: bool,
    ) {
        let asset = match self.metadata.asset(&intent.coin).await {
            Some(a) => a,
            None => {
                self.audit(signal, TradeOutcome::Skipped, Some("unknown asset".to_string()), None, None);
                return;
            }
        };
        let mut exec = self.metadata.execution_price(&intent.coin).await;
        if exec.is_none() {
            // Last resort before aborting: pull the book top for this coin.
            self.metadata.refresh_book(&intent.coin).await;
            exec = self.metadata.execution_price(&intent.coin).await;
        }
        let exec = match exec {
            Some(px) if px > 0.0 => px,
            _ => {
                self.log
                    .warn(format!("{}: no execution price; aborting order", intent.coin));
                self.audit(
                    signal,
                    TradeOutcome::Skipped,
                    Some("no execution price".to_string()),
                    None,
                    None,
                );
                return;
            }
        };

        // Smart mode rests add/reduce orders at the leader's price; every
        // other shape is an aggressive IOC around the execution price.
        let passive = self.cfg.enable_smart_order && intent.passive_eligible;
        let (raw_px, tif) = if passive {
            (signal.avg_price, Tif::Gtc)
        } else {
            let slippage = self.cfg.risk.slippage();
            let px = if intent.is_buy { exec * (1.0 + slippage) } else { exec * (1.0 - slippage) };
            (px, Tif::Ioc)
        };
        let limit = clamp_to_band(raw_px, exec, 0.5, 2.0);

        let size_rounded = round_to_decimals(intent.size, asset.sz_decimals);
        if is_dust(size_rounded) {
            self.audit(
                signal,
                TradeOutcome::Skipped,
                Some("size rounds to zero".to_string()),
                None,
                None,
            );
            return;
        }
        let reference = self
            .metadata
            .mark_price_raw(&intent.coin)
            .await
            .unwrap_or_else(|| float_to_wire(exec));
        let px_str = round_price(limit, &reference);
        let sz_str = float_to_wire(size_rounded);

        let cloid = random_cloid();
        let spec = OrderSpec {
            asset: asset.asset_id,
            is_buy: intent.is_buy,
            limit_px: px_str.clone(),
            sz: sz_str.clone(),
            reduce_only: intent.reduce_only,
            tif,
            cloid: Some(cloid.clone()),
        };

        self.log.info(format!(
            "submitting {} {} {} @ {} ({}{}) oid={}",
            if intent.is_buy { "buy" } else { "sell" },
            sz_str,
            intent.coin,
            px_str,
            tif.as_wire(),
            if intent.reduce_only { ", reduce-only" } else { "" },
            signal.order_id,
        ));

        match self.orders.place_orders(vec![spec]).await {
            Ok(statuses) => match statuses.into_iter().next() {
                Some(status @ (OrderStatus::Resting { .. } | OrderStatus::Filled { .. })) => {
                    let oid = status.oid();
                    self.log.info(format!(
                        "order accepted for {} (oid={:?})",
                        intent.coin, oid
                    ));
                    self.audit(signal, TradeOutcome::Executed, None, oid, Some(cloid));
                    if opening_new {
                        let ratio = follower_equity / leader_equity * self.cfg.risk.copy_ratio;
                        let coin = intent.coin.clone();
                        self.persistence.with_state(|s| {
                            s.coin_ratio_cache
                                .get_or_insert_with(HashMap::new)
                                .insert(coin, ratio);
                        });
                    }
                }
                Some(OrderStatus::Rejected(ExchangeError::InsufficientMargin(msg))) => {
                    self.log
                        .warn(format!("{}: insufficient margin: {}", intent.coin, msg));
                    self.audit(signal, TradeOutcome::Failed, Some(msg), None, Some(cloid));
                }
                Some(OrderStatus::Rejected(e)) => {
                    self.log.warn(format!("{}: order rejected: {}", intent.coin, e));
                    self.audit(signal, TradeOutcome::Failed, Some(e.to_string()), None, Some(cloid));
                }
                None => {
                    self.log.warn("empty status array from order submit".to_string());
                    self.audit(
                        signal,
                        TradeOutcome::Failed,
                        Some("empty statuses".to_string()),
                        None,
                        Some(cloid),
                    );
                }
            },
            Err(e) => {
                // No retry here; the reconciler is the recovery mechanism.
                self.log.error(format!("order submit failed for {}: {}", intent.coin, e));
                self.audit(signal, TradeOutcome::Failed, Some(e.to_string()), None, Some(cloid));
            }
        }
    }

    fn audit(
        &self,
        signal: &TradingSignal,
        outcome: TradeOutcome,
        reason: Option<String>,
        oid: Option<u64>,
        cloid: Option<String>,
    ) {
        self.trade_log.append(&TradeRecord {
            ts: now_ms(),
            pair_id: self.cfg.id.clone(),
            coin: signal.coin.clone(),
            direction: signal.direction.as_str().to_string(),
            outcome: outcome.as_str().to_string(),
            size: signal.size,
            price: signal.avg_price,
            leader_oid: signal.order_id,
            reason,
            oid,
            cloid,
        });
    }
}
