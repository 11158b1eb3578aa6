// ─────────────────────────────────────────────────────────────────────────────
// signing.rs — Hyperliquid L1 action signing.
//
// An action is msgpack-hashed (abbreviated keys, struct-map ordering), the
// nonce and optional vault address are appended, and the keccak digest is
// signed as an EIP-712 "phantom agent". The server re-msgpacks the JSON
// request body preserving key order to verify the signature, so the JSON
// action must be built with the exact key order the SDK uses.
// ─────────────────────────────────────────────────────────────────────────────
use ethers_core::types::{Address, H256, U256};
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use rand::RngCore;
use rmp_serde::Serializer;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::exchange::ExchangeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
    pub v: u8,
}

/// Time-in-force for a limit order, in the exchange's wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tif {
    Ioc,
    Gtc,
}

impl Tif {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Tif::Ioc => "Ioc",
            Tif::Gtc => "Gtc",
        }
    }
}

/// One order inside an `order` action, pre-formatted as wire strings.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub asset: u32,
    pub is_buy: bool,
    pub limit_px: String,
    pub sz: String,
    pub reduce_only: bool,
    pub tif: Tif,
    pub cloid: Option<String>,
}

/// Generates a 0x-prefixed 32-hex-char client order id.
pub fn random_cloid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("0x{}", hex::encode(bytes))
}

// ─── MsgPack wire types (hash computation) ───────────────────────────────────
// Abbreviated single-letter keys matching the SDK's OrderWire:
// {"a": asset, "b": is_buy, "p": limit_px, "s": sz, "r": reduce_only,
//  "t": order_type, "c": cloid?}

#[derive(Serialize)]
struct OrderWireMsgPack {
    a: u32,
    b: bool,
    p: String,
    s: String,
    r: bool,
    t: OrderTypeWireMsgPack,
    #[serde(skip_serializing_if = "Option::is_none")]
    c: Option<String>,
}

#[derive(Serialize)]
struct OrderTypeWireMsgPack {
    limit: LimitOrderWireMsgPack,
}

#[derive(Serialize)]
struct LimitOrderWireMsgPack {
    tif: String,
}

#[derive(Serialize)]
struct OrderActionMsgPack {
    r#type: String,
    orders: Vec<OrderWireMsgPack>,
    grouping: String,
}

#[derive(Serialize)]
struct CancelWireMsgPack {
    a: u32,
    o: u64,
}

#[derive(Serialize)]
struct CancelActionMsgPack {
    r#type: String,
    cancels: Vec<CancelWireMsgPack>,
}

#[derive(Serialize)]
#[allow(non_snake_case)]
struct UpdateLeverageActionMsgPack {
    r#type: String,
    asset: u32,
    isCross: bool,
    leverage: u32,
}

// ─── Hash + phantom-agent signature ──────────────────────────────────────────

/// Appends nonce and vault marker to the msgpack bytes and keccaks the lot,
/// matching the SDK's `action_hash()` (expires_after is never set here).
fn action_hash(mut msgpack: Vec<u8>, nonce: u64, vault_address: Option<&str>) -> [u8; 32] {
    msgpack.extend_from_slice(&nonce.to_be_bytes());
    match vault_address {
        None => msgpack.push(0x00),
        Some(addr) => {
            msgpack.push(0x01);
            let clean = addr.strip_prefix("0x").unwrap_or(addr);
            if let Ok(bytes) = hex::decode(clean) {
                msgpack.extend_from_slice(&bytes);
            }
        }
    }
    keccak256(&msgpack)
}

fn msgpack_bytes<T: Serialize>(action: &T) -> Result<Vec<u8>, ExchangeError> {
    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    action
        .serialize(&mut serializer)
        .map_err(|e| ExchangeError::Signing(format!("msgpack: {}", e)))?;
    Ok(buf)
}

/// EIP-712 signature over the phantom agent
/// {source: "a"|"b", connectionId: action_hash}.
/// Domain: {name: "Exchange", version: "1", chainId: 1337, verifyingContract: 0x0}.
fn sign_phantom_agent(
    private_key: &str,
    hash: [u8; 32],
    agent_source: &str,
) -> Result<Signature, ExchangeError> {
    let wallet =
        LocalWallet::from_str(private_key).map_err(|e| ExchangeError::Signing(e.to_string()))?;

    let domain = ethers_core::types::transaction::eip712::EIP712Domain {
        name: Some("Exchange".to_string()),
        version: Some("1".to_string()),
        chain_id: Some(U256::from(1337)),
        verifying_contract: Some(Address::zero()),
        salt: None,
    };
    let domain_hash = domain.separator();

    let agent_type_hash = keccak256("Agent(string source,bytes32 connectionId)".as_bytes());
    let source_hash = keccak256(agent_source.as_bytes());

    let mut encoded = Vec::new();
    encoded.extend_from_slice(&agent_type_hash);
    encoded.extend_from_slice(&source_hash);
    encoded.extend_from_slice(H256::from(hash).as_bytes());
    let struct_hash = keccak256(&encoded);

    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x19, 0x01]);
    payload.extend_from_slice(&domain_hash);
    payload.extend_from_slice(&struct_hash);
    let digest = H256::from(keccak256(&payload));

    let sig = wallet
        .sign_hash(digest)
        .map_err(|e| ExchangeError::Signing(e.to_string()))?;

    Ok(Signature {
        r: format!("0x{:0>64x}", sig.r),
        s: format!("0x{:0>64x}", sig.s),
        v: sig.v as u8,
    })
}

// ─── JSON action builders (exact key order) ──────────────────────────────────

fn order_json(spec: &OrderSpec) -> serde_json::Value {
    // Key insertion order: a, b, p, s, r, t, c (s before r is a known trap).
    let mut order_map = serde_json::Map::new();
    order_map.insert("a".to_string(), serde_json::Value::from(spec.asset));
    order_map.insert("b".to_string(), serde_json::Value::from(spec.is_buy));
    order_map.insert("p".to_string(), serde_json::Value::from(spec.limit_px.clone()));
    order_map.insert("s".to_string(), serde_json::Value::from(spec.sz.clone()));
    order_map.insert("r".to_string(), serde_json::Value::from(spec.reduce_only));

    let mut tif_map = serde_json::Map::new();
    tif_map.insert("tif".to_string(), serde_json::Value::from(spec.tif.as_wire()));
    let mut limit_map = serde_json::Map::new();
    limit_map.insert("limit".to_string(), serde_json::Value::Object(tif_map));
    order_map.insert("t".to_string(), serde_json::Value::Object(limit_map));

    if let Some(cloid) = &spec.cloid {
        order_map.insert("c".to_string(), serde_json::Value::from(cloid.clone()));
    }
    serde_json::Value::Object(order_map)
}

/// Signs an `order` action. Returns the signature plus the JSON action to put
/// in the request body.
pub fn sign_order_action(
    private_key: &str,
    orders: &[OrderSpec],
    nonce: u64,
    vault_address: Option<&str>,
    agent_source: &str,
) -> Result<(Signature, serde_json::Value), ExchangeError> {
    let msgpack_orders: Vec<OrderWireMsgPack> = orders
        .iter()
        .map(|o| OrderWireMsgPack {
            a: o.asset,
            b: o.is_buy,
            p: o.limit_px.clone(),
            s: o.sz.clone(),
            r: o.reduce_only,
            t: OrderTypeWireMsgPack {
                limit: LimitOrderWireMsgPack { tif: o.tif.as_wire().to_string() },
            },
            c: o.cloid.clone(),
        })
        .collect();

    let action = OrderActionMsgPack {
        r#type: "order".to_string(),
        orders: msgpack_orders,
        grouping: "na".to_string(),
    };
    let hash = action_hash(msgpack_bytes(&action)?, nonce, vault_address);
    let signature = sign_phantom_agent(private_key, hash, agent_source)?;

    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from("order"));
    action_map.insert(
        "orders".to_string(),
        serde_json::Value::Array(orders.iter().map(order_json).collect()),
    );
    action_map.insert("grouping".to_string(), serde_json::Value::from("na"));

    Ok((signature, serde_json::Value::Object(action_map)))
}

/// Signs a `cancel` action covering a batch of (asset, oid) pairs.
pub fn sign_cancel_action(
    private_key: &str,
    cancels: &[(u32, u64)],
    nonce: u64,
    vault_address: Option<&str>,
    agent_source: &str,
) -> Result<(Signature, serde_json::Value), ExchangeError> {
    let action = CancelActionMsgPack {
        r#type: "cancel".to_string(),
        cancels: cancels
            .iter()
            .map(|&(a, o)| CancelWireMsgPack { a, o })
            .collect(),
    };
    let hash = action_hash(msgpack_bytes(&action)?, nonce, vault_address);
    let signature = sign_phantom_agent(private_key, hash, agent_source)?;

    let json_cancels: Vec<serde_json::Value> = cancels
        .iter()
        .map(|&(a, o)| {
            let mut m = serde_json::Map::new();
            m.insert("a".to_string(), serde_json::Value::from(a));
            m.insert("o".to_string(), serde_json::Value::from(o));
            serde_json::Value::Object(m)
        })
        .collect();

    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from("cancel"));
    action_map.insert("cancels".to_string(), serde_json::Value::Array(json_cancels));

    Ok((signature, serde_json::Value::Object(action_map)))
}

/// Signs an `updateLeverage` action for one asset.
pub fn sign_update_leverage_action(
    private_key: &str,
    asset: u32,
    is_cross: bool,
    leverage: u32,
    nonce: u64,
    vault_address: Option<&str>,
    agent_source: &str,
) -> Result<(Signature, serde_json::Value), ExchangeError> {
    let action = UpdateLeverageActionMsgPack {
        r#type: "updateLeverage".to_string(),
        asset,
        isCross: is_cross,
        leverage,
    };
    let hash = action_hash(msgpack_bytes(&action)?, nonce, vault_address);
    let signature = sign_phantom_agent(private_key, hash, agent_source)?;

    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from("updateLeverage"));
    action_map.insert("asset".to_string(), serde_json::Value::from(asset));
    action_map.insert("isCross".to_string(), serde_json::Value::from(is_cross));
    action_map.insert("leverage".to_string(), serde_json::Value::from(leverage));

    Ok((signature, serde_json::Value::Object(action_map)))
}
