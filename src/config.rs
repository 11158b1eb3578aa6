// ─────────────────────────────────────────────────────────────────────────────
// config.rs — daemon configuration.
//
// A single JSON document (path from COPY_CONFIG, argv[1], or ./config.json)
// holding global settings plus one entry per copied pair. Private keys are
// never written inline: `${VAR}` values are substituted from the
// environment at load time. Invalid configuration is fatal at startup.
// ─────────────────────────────────────────────────────────────────────────────
use ethers_signers::{LocalWallet, Signer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Mainnet,
    Testnet,
}

impl Environment {
    pub fn http_url(&self) -> &'static str {
        match self {
            Environment::Mainnet => "https://api.hyperliquid.xyz",
            Environment::Testnet => "https://api.hyperliquid-testnet.xyz",
        }
    }

    pub fn ws_url(&self) -> &'static str {
        match self {
            Environment::Mainnet => "wss://api.hyperliquid.xyz/ws",
            Environment::Testnet => "wss://api.hyperliquid-testnet.xyz/ws",
        }
    }

    /// Phantom-agent source for signing: "a" on mainnet, "b" on testnet.
    pub fn agent_source(&self) -> &'static str {
        match self {
            Environment::Mainnet => "a",
            Environment::Testnet => "b",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RiskConfig {
    pub copy_ratio: f64,
    /// 0 = no cap beyond the asset's own limit.
    pub max_leverage: u32,
    /// 0 = uncapped.
    pub max_notional_usd: f64,
    /// 0 = use `market_order_slippage` instead.
    pub max_slippage_bps: u32,
    pub inverse: bool,
    pub market_order_slippage: f64,
    pub boost_price_threshold: f64,
    /// Smart-order mode: stale reduce orders older than this are forced.
    /// 0 disables the timeout.
    pub reduce_order_timeout_ms: u64,
    pub sync_leverage: bool,
    // Recognized for config compatibility; the deviation-based forced-sync
    // path they belonged to is retired.
    pub max_position_deviation_percent: Option<f64>,
    pub trend_offset_multiplier: Option<f64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            copy_ratio: 1.0,
            max_leverage: 0,
            max_notional_usd: 0.0,
            max_slippage_bps: 0,
            inverse: false,
            market_order_slippage: 0.05,
            boost_price_threshold: 0.0005,
            reduce_order_timeout_ms: 180_000,
            sync_leverage: true,
            max_position_deviation_percent: None,
            trend_offset_multiplier: None,
        }
    }
}

impl RiskConfig {
    /// Effective slippage fraction for aggressive (market-style) orders.
    /// A bps setting wins over the legacy fraction but is floored at 3%.
    pub fn slippage(&self) -> f64 {
        if self.max_slippage_bps > 0 {
            (self.max_slippage_bps as f64 / 10_000.0).max(0.03)
        } else {
            self.market_order_slippage
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairConfig {
    pub id: String,
    pub leader_address: String,
    pub follower_private_key: String,
    /// API-wallet mode: the account queried/traded when the key is only an
    /// agent for this address.
    #[serde(default)]
    pub follower_address: Option<String>,
    #[serde(default)]
    pub follower_vault_address: Option<String>,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default = "default_min_order_notional")]
    pub min_order_notional_usd: f64,
    #[serde(default = "default_sync_debounce_ms")]
    pub sync_debounce_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub enable_smart_order: bool,
}

fn default_min_order_notional() -> f64 {
    15.0
}

fn default_sync_debounce_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

impl PairConfig {
    /// The follower account address: explicit (API-wallet / vault setups)
    /// or derived from the signing key.
    pub fn follower_account(&self) -> Result<String, ConfigError> {
        if let Some(vault) = &self.follower_vault_address {
            return Ok(vault.to_lowercase());
        }
        if let Some(addr) = &self.follower_address {
            return Ok(addr.to_lowercase());
        }
        let wallet = LocalWallet::from_str(&self.follower_private_key)
            .map_err(|e| ConfigError(format!("pair {}: bad follower key: {}", self.id, e)))?;
        Ok(format!("0x{}", hex::encode(wallet.address().as_bytes())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub environment: Environment,
    pub log_level: String,
    pub reconciliation_interval_ms: u64,
    pub refresh_account_interval_ms: u64,
    pub websocket_aggregate_fills: bool,
    pub state_dir: String,
    pub enable_trade_log: bool,
    pub pairs: Vec<PairConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Mainnet,
            log_level: "info".to_string(),
            reconciliation_interval_ms: 60_000,
            refresh_account_interval_ms: 30_000,
            websocket_aggregate_fills: true,
            state_dir: "state".to_string(),
            enable_trade_log: true,
            pairs: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("cannot read {:?}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config =
            serde_json::from_str(content).map_err(|e| ConfigError(format!("bad JSON: {}", e)))?;
        for pair in &mut cfg.pairs {
            pair.follower_private_key = substitute_env(&pair.follower_private_key)
                .map_err(|e| ConfigError(format!("pair {}: {}", pair.id, e.0)))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn enabled_pairs(&self) -> impl Iterator<Item = &PairConfig> {
        self.pairs.iter().filter(|p| p.enabled)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled_pairs().next().is_none() {
            return Err(ConfigError("no enabled pairs".to_string()));
        }
        let mut ids = HashSet::new();
        for pair in &self.pairs {
            if pair.id.is_empty() {
                return Err(ConfigError("pair with empty id".to_string()));
            }
            if !ids.insert(pair.id.as_str()) {
                return Err(ConfigError(format!("duplicate pair id {}", pair.id)));
            }
            if !is_address(&pair.leader_address) {
                return Err(ConfigError(format!(
                    "pair {}: leaderAddress {:?} is not a 0x-prefixed 40-hex address",
                    pair.id, pair.leader_address
                )));
            }
            if pair.enabled && pair.follower_private_key.is_empty() {
                return Err(ConfigError(format!("pair {}: empty followerPrivateKey", pair.id)));
            }
            if pair.risk.copy_ratio <= 0.0 {
                return Err(ConfigError(format!(
                    "pair {}: copyRatio must be positive",
                    pair.id
                )));
            }
        }
        Ok(())
    }
}

fn is_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// `${VAR}` → value of VAR. Anything else passes through untouched.
pub fn substitute_env(value: &str) -> Result<String, ConfigError> {
    if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        std::env::var(name).map_err(|_| ConfigError(format!("env var {} is not set", name)))
    } else {
        Ok(value.to_string())
    }
}
