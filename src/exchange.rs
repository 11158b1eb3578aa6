// ─────────────────────────────────────────────────────────────────────────────
// exchange.rs — HTTP boundary with Hyperliquid.
//
// `InfoClient` wraps the read-only /info endpoint and is shared by every
// pair. `ExchangeSession` wraps the signed /exchange endpoint and is owned
// per pair (each pair trades with its own key, optionally against a vault).
// Both sit behind traits so the engine logic can be exercised against
// in-memory fakes.
// ─────────────────────────────────────────────────────────────────────────────
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::numeric::{now_ms, parse_f64_or_zero};
use crate::signing::{self, OrderSpec};

// ─── Error taxonomy ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ExchangeError {
    /// Transport-level failure (connect, timeout, malformed body).
    Network(String),
    /// HTTP 429 or a "rate limited" body returned with status 200.
    RateLimited,
    /// The exchange accepted the request but rejected the action.
    Api(String),
    /// Rejection specifically for insufficient margin (expected class).
    InsufficientMargin(String),
    /// Local signing failure (bad key, serialization).
    Signing(String),
    /// A required field in a response was missing or unparseable.
    Parse(String),
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::Network(s) => write!(f, "network error: {}", s),
            ExchangeError::RateLimited => write!(f, "rate limited"),
            ExchangeError::Api(s) => write!(f, "exchange error: {}", s),
            ExchangeError::InsufficientMargin(s) => write!(f, "insufficient margin: {}", s),
            ExchangeError::Signing(s) => write!(f, "signing error: {}", s),
            ExchangeError::Parse(s) => write!(f, "parse error: {}", s),
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Sorts an exchange-reported order rejection into the margin class or the
/// generic API class.
pub fn classify_rejection(msg: &str) -> ExchangeError {
    let lower = msg.to_lowercase();
    if lower.contains("margin") || lower.contains("insufficient") {
        ExchangeError::InsufficientMargin(msg.to_string())
    } else {
        ExchangeError::Api(msg.to_string())
    }
}

// ─── Response models ─────────────────────────────────────────────────────────

/// One resting order as reported by the `openOrders` info request.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub oid: u64,
    pub coin: String,
    /// "B" = bid/buy, "A" = ask/sell.
    pub side: String,
    pub limit_px: f64,
    pub sz: f64,
    pub reduce_only: bool,
    pub timestamp: u64,
    pub cloid: Option<String>,
}

impl OpenOrder {
    pub fn is_buy(&self) -> bool {
        self.side == "B"
    }
}

/// Per-order outcome inside an `order` action response.
#[derive(Debug, Clone)]
pub enum OrderStatus {
    Resting { oid: u64 },
    Filled { oid: u64 },
    Rejected(ExchangeError),
}

impl OrderStatus {
    pub fn is_ok(&self) -> bool {
        !matches!(self, OrderStatus::Rejected(_))
    }

    pub fn oid(&self) -> Option<u64> {
        match self {
            OrderStatus::Resting { oid } | OrderStatus::Filled { oid } => Some(*oid),
            OrderStatus::Rejected(_) => None,
        }
    }
}

// ─── Traits (engine-facing seams) ────────────────────────────────────────────

#[async_trait]
pub trait InfoApi: Send + Sync {
    /// `metaAndAssetCtxs`: [{universe}, [assetCtx...]] as raw JSON.
    async fn meta_and_asset_ctxs(&self) -> Result<Value, ExchangeError>;
    /// `clearinghouseState` for one user, as raw JSON.
    async fn clearinghouse_state(&self, user: &str) -> Result<Value, ExchangeError>;
    /// `allMids`: coin → mid price (raw wire string preserved for precision).
    async fn all_mids(&self) -> Result<HashMap<String, String>, ExchangeError>;
    /// `l2Book` top levels for one coin, as raw JSON.
    async fn l2_book(&self, coin: &str) -> Result<Value, ExchangeError>;
    /// `openOrders` for one user.
    async fn open_orders(&self, user: &str) -> Result<Vec<OpenOrder>, ExchangeError>;
}

#[async_trait]
pub trait OrderApi: Send + Sync {
    /// Submits a batch of orders (grouping "na"), one status per order.
    async fn place_orders(&self, orders: Vec<OrderSpec>) -> Result<Vec<OrderStatus>, ExchangeError>;
    /// Cancels a batch of (asset, oid) pairs.
    async fn cancel_orders(&self, cancels: Vec<(u32, u64)>) -> Result<(), ExchangeError>;
    async fn update_leverage(
        &self,
        asset: u32,
        is_cross: bool,
        leverage: u32,
    ) -> Result<(), ExchangeError>;
}

// ─── Info client ─────────────────────────────────────────────────────────────

pub struct InfoClient {
    base_url: String,
    client: reqwest::Client,
}

impl InfoClient {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self { base_url: base_url.to_string(), client }
    }

    async fn post_info(&self, payload: Value) -> Result<Value, ExchangeError> {
        let resp = self
            .client
            .post(format!("{}/info", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        // Some endpoints report rate limiting in the body with status 200.
        if let Some(err) = data["error"].as_str() {
            if err.contains("rate limited") {
                return Err(ExchangeError::RateLimited);
            }
        }
        Ok(data)
    }
}

#[async_trait]
impl InfoApi for InfoClient {
    async fn meta_and_asset_ctxs(&self) -> Result<Value, ExchangeError> {
        self.post_info(serde_json::json!({"type": "metaAndAssetCtxs"})).await
    }

    async fn clearinghouse_state(&self, user: &str) -> Result<Value, ExchangeError> {
        self.post_info(serde_json::json!({"type": "clearinghouseState", "user": user}))
            .await
    }

    async fn all_mids(&self) -> Result<HashMap<String, String>, ExchangeError> {
        let data = self.post_info(serde_json::json!({"type": "allMids"})).await?;
        let mut mids = HashMap::new();
        if let Some(obj) = data.as_object() {
            for (coin, px) in obj {
                if let Some(px_str) = px.as_str() {
                    mids.insert(coin.clone(), px_str.to_string());
                }
            }
        }
        Ok(mids)
    }

    async fn l2_book(&self, coin: &str) -> Result<Value, ExchangeError> {
        self.post_info(serde_json::json!({"type": "l2Book", "coin": coin})).await
    }

    async fn open_orders(&self, user: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let data = self
            .post_info(serde_json::json!({"type": "openOrders", "user": user}))
            .await?;
        Ok(parse_open_orders(&data))
    }
}

pub fn parse_open_orders(data: &Value) -> Vec<OpenOrder> {
    let mut orders = Vec::new();
    if let Some(arr) = data.as_array() {
        for o in arr {
            let oid = match o["oid"].as_u64() {
                Some(oid) => oid,
                None => continue,
            };
            let coin = match o["coin"].as_str() {
                Some(c) => c.to_string(),
                None => continue,
            };
            orders.push(OpenOrder {
                oid,
                coin,
                side: o["side"].as_str().unwrap_or("").to_string(),
                limit_px: parse_f64_or_zero(&o["limitPx"]),
                sz: parse_f64_or_zero(&o["sz"]),
                reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
                timestamp: o["timestamp"].as_u64().unwrap_or(0),
                cloid: o["cloid"].as_str().map(|s| s.to_string()),
            });
        }
    }
    orders
}

// ─── Exchange session (signed actions, per pair) ─────────────────────────────

pub struct ExchangeSession {
    base_url: String,
    client: reqwest::Client,
    private_key: String,
    vault_address: Option<String>,
    agent_source: String,
}

impl ExchangeSession {
    pub fn new(
        base_url: &str,
        client: reqwest::Client,
        private_key: String,
        vault_address: Option<String>,
        agent_source: &str,
    ) -> Self {
        Self {
            base_url: base_url.to_string(),
            client,
            private_key,
            vault_address,
            agent_source: agent_source.to_string(),
        }
    }

    async fn post_exchange(
        &self,
        action: Value,
        nonce: u64,
        signature: signing::Signature,
    ) -> Result<Value, ExchangeError> {
        let payload = serde_json::json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": self.vault_address,
        });

        let resp = self
            .client
            .post(format!("{}/exchange", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }

        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;
        let data: Value =
            serde_json::from_str(&text).map_err(|e| ExchangeError::Network(e.to_string()))?;

        if data["status"].as_str() == Some("err") {
            let msg = data["response"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| {
                    data["response"]["data"]["error"].as_str().unwrap_or_default().to_string()
                });
            if msg.contains("rate limited") || msg.contains("cumulative requests") {
                return Err(ExchangeError::RateLimited);
            }
            return Err(classify_rejection(&msg));
        }
        Ok(data)
    }

    fn vault(&self) -> Option<&str> {
        self.vault_address.as_deref()
    }
}

/// Maps the statuses array of an `order` response onto per-order outcomes.
/// The exchange can return status "ok" with per-order errors inside, so each
/// entry must be inspected.
pub fn parse_order_statuses(data: &Value, expected: usize) -> Result<Vec<OrderStatus>, ExchangeError> {
    let statuses = data["response"]["data"]["statuses"]
        .as_array()
        .ok_or_else(|| ExchangeError::Parse("order response missing statuses".to_string()))?;

    let mut out = Vec::with_capacity(statuses.len());
    for s in statuses {
        if let Some(err) = s["error"].as_str() {
            out.push(OrderStatus::Rejected(classify_rejection(err)));
        } else if let Some(oid) = s["resting"]["oid"].as_u64() {
            out.push(OrderStatus::Resting { oid });
        } else if let Some(oid) = s["filled"]["oid"].as_u64() {
            out.push(OrderStatus::Filled { oid });
        } else {
            out.push(OrderStatus::Rejected(ExchangeError::Parse(format!(
                "unrecognized order status: {}",
                s
            ))));
        }
    }
    if out.len() != expected {
        return Err(ExchangeError::Parse(format!(
            "expected {} statuses, got {}",
            expected,
            out.len()
        )));
    }
    Ok(out)
}

#[async_trait]
impl OrderApi for ExchangeSession {
    async fn place_orders(&self, orders: Vec<OrderSpec>) -> Result<Vec<OrderStatus>, ExchangeError> {
        if orders.is_empty() {
            return Ok(Vec::new());
        }
        let nonce = now_ms();
        let (sig, action) = signing::sign_order_action(
            &self.private_key,
            &orders,
            nonce,
            self.vault(),
            &self.agent_source,
        )?;
        let data = self.post_exchange(action, nonce, sig).await?;
        parse_order_statuses(&data, orders.len())
    }

    async fn cancel_orders(&self, cancels: Vec<(u32, u64)>) -> Result<(), ExchangeError> {
        if cancels.is_empty() {
            return Ok(());
        }
        let nonce = now_ms();
        let (sig, action) = signing::sign_cancel_action(
            &self.private_key,
            &cancels,
            nonce,
            self.vault(),
            &self.agent_source,
        )?;
        self.post_exchange(action, nonce, sig).await?;
        Ok(())
    }

    async fn update_leverage(
        &self,
        asset: u32,
        is_cross: bool,
        leverage: u32,
    ) -> Result<(), ExchangeError> {
        let nonce = now_ms();
        let (sig, action) = signing::sign_update_leverage_action(
            &self.private_key,
            asset,
            is_cross,
            leverage,
            nonce,
            self.vault(),
            &self.agent_source,
        )?;
        self.post_exchange(action, nonce, sig).await?;
        Ok(())
    }
}
