// ─────────────────────────────────────────────────────────────────────────────
// metadata.rs — shared per-coin market metadata.
//
// Owned by the orchestrator; engines hold read references. Asset identity
// (id, size decimals, max leverage) is fixed after the first universe load;
// prices are refreshed best-effort in the background and consumers tolerate
// stale reads.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::exchange::{ExchangeError, InfoApi};
use crate::numeric::{now_ms, parse_f64};

#[derive(Debug, Clone)]
pub struct AssetMeta {
    pub asset_id: u32,
    pub sz_decimals: u32,
    pub max_leverage: u32,
    pub margin_table_id: Option<u64>,
}

/// Top-of-book record from `l2Book`, kept for diagnostics and as a mid source.
#[derive(Debug, Clone)]
pub struct BookTop {
    pub best_bid: f64,
    pub best_ask: f64,
    pub time: u64,
}

impl BookTop {
    pub fn mid(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }
}

#[derive(Default)]
struct MetaInner {
    loaded: bool,
    assets: HashMap<String, AssetMeta>,
    /// Mark price, parsed and in raw wire form (the raw string carries the
    /// exchange's tick precision for price formatting).
    mark: HashMap<String, (f64, String)>,
    mid: HashMap<String, f64>,
    book: HashMap<String, BookTop>,
}

pub struct MarketMetadataCache {
    info: Arc<dyn InfoApi>,
    inner: RwLock<MetaInner>,
}

impl MarketMetadataCache {
    pub fn new(info: Arc<dyn InfoApi>) -> Self {
        Self { info, inner: RwLock::new(MetaInner::default()) }
    }

    /// Idempotent universe + asset-context load. Fatal at startup if it
    /// fails; callers decide.
    pub async fn ensure_loaded(&self) -> Result<(), ExchangeError> {
        if self.inner.read().await.loaded {
            return Ok(());
        }
        let doc = self.info.meta_and_asset_ctxs().await?;
        let (assets, marks) = parse_meta_and_ctxs(&doc)?;

        let mut inner = self.inner.write().await;
        if inner.loaded {
            return Ok(());
        }
        log::info!("Loaded {} assets from universe.", assets.len());
        inner.assets = assets;
        inner.mark = marks;
        inner.loaded = true;
        Ok(())
    }

    /// Best-effort mark refresh. Failures are logged; last-known values stay.
    pub async fn refresh_mark_prices(&self) {
        match self.info.meta_and_asset_ctxs().await {
            Ok(doc) => match parse_meta_and_ctxs(&doc) {
                Ok((_, marks)) => {
                    let mut inner = self.inner.write().await;
                    // Asset identity never changes after first load; only
                    // prices are replaced here.
                    inner.mark = marks;
                }
                Err(e) => log::warn!("mark refresh parse failed: {}", e),
            },
            Err(e) => log::warn!("mark refresh failed: {}", e),
        }
    }

    /// Best-effort mid refresh from `allMids`.
    pub async fn refresh_mid_prices(&self) {
        match self.info.all_mids().await {
            Ok(mids) => {
                let mut parsed = HashMap::new();
                for (coin, raw) in mids {
                    if let Ok(px) = raw.parse::<f64>() {
                        if px > 0.0 {
                            parsed.insert(coin, px);
                        }
                    }
                }
                let mut inner = self.inner.write().await;
                inner.mid = parsed;
            }
            Err(e) => log::warn!("mid refresh failed: {}", e),
        }
    }

    /// Best-effort top-of-book refresh for one coin; also feeds the mid map.
    pub async fn refresh_book(&self, coin: &str) {
        match self.info.l2_book(coin).await {
            Ok(doc) => {
                if let Some(top) = parse_book_top(&doc) {
                    let mut inner = self.inner.write().await;
                    inner.mid.insert(coin.to_string(), top.mid());
                    inner.book.insert(coin.to_string(), top);
                }
            }
            Err(e) => log::warn!("l2Book refresh failed for {}: {}", coin, e),
        }
    }

    /// Mid price if known, else mark, else None. Callers must abort the
    /// order build on None.
    pub async fn execution_price(&self, coin: &str) -> Option<f64> {
        let inner = self.inner.read().await;
        inner
            .mid
            .get(coin)
            .copied()
            .or_else(|| inner.mark.get(coin).map(|(px, _)| *px))
    }

    pub async fn mark_price(&self, coin: &str) -> Option<f64> {
        self.inner.read().await.mark.get(coin).map(|(px, _)| *px)
    }

    /// Raw wire form of the mark price, used as the precision reference when
    /// formatting order prices.
    pub async fn mark_price_raw(&self, coin: &str) -> Option<String> {
        self.inner.read().await.mark.get(coin).map(|(_, raw)| raw.clone())
    }

    pub async fn asset(&self, coin: &str) -> Option<AssetMeta> {
        self.inner.read().await.assets.get(coin).cloned()
    }

    pub async fn book_top(&self, coin: &str) -> Option<BookTop> {
        self.inner.read().await.book.get(coin).cloned()
    }
}

fn parse_meta_and_ctxs(
    doc: &serde_json::Value,
) -> Result<(HashMap<String, AssetMeta>, HashMap<String, (f64, String)>), ExchangeError> {
    let arr = doc
        .as_array()
        .filter(|a| a.len() >= 2)
        .ok_or_else(|| ExchangeError::Parse("metaAndAssetCtxs shape".to_string()))?;
    let universe = arr[0]["universe"]
        .as_array()
        .ok_or_else(|| ExchangeError::Parse("metaAndAssetCtxs universe".to_string()))?;
    let ctxs = arr[1]
        .as_array()
        .ok_or_else(|| ExchangeError::Parse("metaAndAssetCtxs contexts".to_string()))?;

    let mut assets = HashMap::new();
    let mut marks = HashMap::new();
    for (i, entry) in universe.iter().enumerate() {
        let name = match entry["name"].as_str() {
            Some(n) => n.to_string(),
            None => continue,
        };
        assets.insert(
            name.clone(),
            AssetMeta {
                asset_id: i as u32,
                sz_decimals: entry["szDecimals"].as_u64().unwrap_or(4) as u32,
                max_leverage: entry["maxLeverage"].as_u64().unwrap_or(20) as u32,
                margin_table_id: entry["marginTableId"].as_u64(),
            },
        );
        if let Some(ctx) = ctxs.get(i) {
            let raw = match &ctx["markPx"] {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if let Some(px) = parse_f64(&ctx["markPx"]) {
                marks.insert(name, (px, raw));
            }
        }
    }
    Ok((assets, marks))
}

fn parse_book_top(doc: &serde_json::Value) -> Option<BookTop> {
    let levels = doc["levels"].as_array()?;
    let best_bid = parse_f64(&levels.first()?.as_array()?.first()?["px"])?;
    let best_ask = parse_f64(&levels.get(1)?.as_array()?.first()?["px"])?;
    Some(BookTop {
        best_bid,
        best_ask,
        time: doc["time"].as_u64().unwrap_or_else(now_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct FixedInfo {
        meta: Value,
        mids: HashMap<String, String>,
    }

    #[async_trait]
    impl InfoApi for FixedInfo {
        async fn meta_and_asset_ctxs(&self) -> Result<Value, ExchangeError> {
            Ok(self.meta.clone())
        }
        async fn clearinghouse_state(&self, _user: &str) -> Result<Value, ExchangeError> {
            Ok(json!({}))
        }
        async fn all_mids(&self) -> Result<HashMap<String, String>, ExchangeError> {
            Ok(self.mids.clone())
        }
        async fn l2_book(&self, _coin: &str) -> Result<Value, ExchangeError> {
            Ok(json!({
                "time": 1_700_000_000_000u64,
                "levels": [
                    [{"px": "60000.0", "sz": "1.2"}],
                    [{"px": "60010.0", "sz": "0.8"}]
                ]
            }))
        }
        async fn open_orders(
            &self,
            _user: &str,
        ) -> Result<Vec<crate::exchange::OpenOrder>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    fn sample_meta() -> Value {
        json!([
            {"universe": [
                {"name": "BTC", "szDecimals": 5, "maxLeverage": 40, "marginTableId": 1},
                {"name": "ETH", "szDecimals": 4, "maxLeverage": 25, "marginTableId": 2}
            ]},
            [
                {"markPx": "60050.0"},
                {"markPx": "3005.5"}
            ]
        ])
    }

    fn cache() -> MarketMetadataCache {
        let mut mids = HashMap::new();
        mids.insert("BTC".to_string(), "60040.5".to_string());
        MarketMetadataCache::new(Arc::new(FixedInfo { meta: sample_meta(), mids }))
    }

    #[tokio::test]
    async fn load_parses_universe_and_marks() {
        let cache = cache();
        cache.ensure_loaded().await.unwrap();

        let btc = cache.asset("BTC").await.unwrap();
        assert_eq!(btc.asset_id, 0);
        assert_eq!(btc.sz_decimals, 5);
        assert_eq!(btc.max_leverage, 40);
        let eth = cache.asset("ETH").await.unwrap();
        assert_eq!(eth.asset_id, 1);

        assert_eq!(cache.mark_price("BTC").await, Some(60050.0));
        assert_eq!(cache.mark_price_raw("BTC").await.as_deref(), Some("60050.0"));
    }

    #[tokio::test]
    async fn execution_price_prefers_mid_then_mark() {
        let cache = cache();
        cache.ensure_loaded().await.unwrap();

        // No mids loaded yet: mark is the fallback.
        assert_eq!(cache.execution_price("BTC").await, Some(60050.0));

        cache.refresh_mid_prices().await;
        assert_eq!(cache.execution_price("BTC").await, Some(60040.5));
        // ETH has no mid; falls back to mark. Unknown coins yield None.
        assert_eq!(cache.execution_price("ETH").await, Some(3005.5));
        assert_eq!(cache.execution_price("DOGE").await, None);
    }

    #[tokio::test]
    async fn book_refresh_feeds_mid_and_top() {
        let cache = cache();
        cache.ensure_loaded().await.unwrap();
        cache.refresh_book("BTC").await;

        let top = cache.book_top("BTC").await.unwrap();
        assert_eq!(top.best_bid, 60000.0);
        assert_eq!(top.best_ask, 60010.0);
        assert_eq!(cache.execution_price("BTC").await, Some(60005.0));
    }

    #[tokio::test]
    async fn asset_identity_survives_mark_refresh() {
        let cache = cache();
        cache.ensure_loaded().await.unwrap();
        let before = cache.asset("BTC").await.unwrap();
        cache.refresh_mark_prices().await;
        let after = cache.asset("BTC").await.unwrap();
        assert_eq!(before.sz_decimals, after.sz_decimals);
        assert_eq!(before.asset_id, after.asset_id);
    }
}
