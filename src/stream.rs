// ─────────────────────────────────────────────────────────────────────────────
// stream.rs — shared WebSocket transport for leader fill streams.
//
// One connection serves every pair: each leader address gets a `userFills`
// subscription whose events are fanned out over an unbounded channel to the
// owning engine. Reconnects are infinite with exponential backoff capped at
// 32s; every (re)connect resubscribes the full registry and re-arms the
// snapshot gate so historical replays are never delivered.
// ─────────────────────────────────────────────────────────────────────────────
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

// ─── Wire types ──────────────────────────────────────────────────────────────

/// One fill from the `userFills` channel. Prices and sizes arrive as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub coin: String,
    pub px: String,
    pub sz: String,
    /// "B" = buy, "A" = sell.
    pub side: String,
    pub time: u64,
    #[serde(default)]
    pub start_position: String,
    #[serde(default)]
    pub dir: String,
    pub oid: u64,
    #[serde(default)]
    pub crossed: bool,
}

impl Fill {
    pub fn is_buy(&self) -> bool {
        self.side == "B"
    }

    pub fn px_f64(&self) -> f64 {
        self.px.parse().unwrap_or(0.0)
    }

    pub fn sz_f64(&self) -> f64 {
        self.sz.parse().unwrap_or(0.0)
    }

    pub fn start_position_f64(&self) -> f64 {
        self.start_position.parse().unwrap_or(0.0)
    }
}

/// A batch of fills for one user, as delivered to an engine.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub is_snapshot: bool,
    pub fills: Vec<Fill>,
}

// ─── Snapshot gate ───────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum EventDisposition {
    Forward,
    DropSnapshot,
    /// First event after subscribe carried no snapshot flag: contract
    /// violation, dropped to prevent trading a historical replay.
    DropViolation,
}

fn classify_event(expects_snapshot: bool, is_snapshot: Option<bool>) -> EventDisposition {
    match (expects_snapshot, is_snapshot) {
        (_, Some(true)) => EventDisposition::DropSnapshot,
        (true, _) => EventDisposition::DropViolation,
        (false, _) => EventDisposition::Forward,
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

enum Command {
    Subscribe { user: String, aggregate: bool },
    Unsubscribe { user: String },
    Close,
}

struct SubEntry {
    aggregate: bool,
    tx: UnboundedSender<FillEvent>,
    /// Armed at subscribe time and after every reconnect.
    expects_snapshot: bool,
}

pub struct StreamClient {
    cmd_tx: UnboundedSender<Command>,
    subs: Arc<Mutex<HashMap<String, SubEntry>>>,
}

impl StreamClient {
    /// Spawns the connection task and returns the shared handle.
    pub fn spawn(ws_url: String) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let subs: Arc<Mutex<HashMap<String, SubEntry>>> = Arc::new(Mutex::new(HashMap::new()));
        let client = Arc::new(Self { cmd_tx, subs: subs.clone() });
        tokio::spawn(run_loop(ws_url, subs, cmd_rx));
        client
    }

    /// Registers a `userFills` subscription for `user` and returns the event
    /// channel. Snapshot events are consumed by the transport.
    pub fn subscribe_user_fills(&self, user: &str, aggregate: bool) -> UnboundedReceiver<FillEvent> {
        let key = user.to_lowercase();
        let (tx, rx) = unbounded_channel();
        self.subs.lock().unwrap().insert(
            key.clone(),
            SubEntry { aggregate, tx, expects_snapshot: true },
        );
        let _ = self.cmd_tx.send(Command::Subscribe { user: key, aggregate });
        rx
    }

    pub fn unsubscribe_user_fills(&self, user: &str) {
        let key = user.to_lowercase();
        self.subs.lock().unwrap().remove(&key);
        let _ = self.cmd_tx.send(Command::Unsubscribe { user: key });
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

fn subscribe_payload(user: &str, aggregate: bool) -> String {
    serde_json::json!({
        "method": "subscribe",
        "subscription": {"type": "userFills", "user": user, "aggregateByTime": aggregate}
    })
    .to_string()
}

fn unsubscribe_payload(user: &str) -> String {
    serde_json::json!({
        "method": "unsubscribe",
        "subscription": {"type": "userFills", "user": user}
    })
    .to_string()
}

async fn run_loop(
    ws_url: String,
    subs: Arc<Mutex<HashMap<String, SubEntry>>>,
    mut cmd_rx: UnboundedReceiver<Command>,
) {
    let mut retry_delay_secs: u64 = 1;
    let max_delay_secs: u64 = 32;

    loop {
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                log::error!("invalid WS url {}: {}", ws_url, e);
                return;
            }
        };

        log::info!("Connecting to Hyperliquid WS: {}", ws_url);
        match connect_async(url).await {
            Ok((ws_stream, _)) => {
                log::info!("WS connected.");
                retry_delay_secs = 1;
                let (mut write, mut read) = ws_stream.split();

                // Resubscribe the whole registry; every subscription expects
                // a fresh snapshot on this connection.
                let pending: Vec<(String, bool)> = {
                    let mut map = subs.lock().unwrap();
                    map.values_mut().for_each(|e| e.expects_snapshot = true);
                    map.iter().map(|(u, e)| (u.clone(), e.aggregate)).collect()
                };
                for (user, aggregate) in pending {
                    if let Err(e) = write
                        .send(Message::Text(subscribe_payload(&user, aggregate)))
                        .await
                    {
                        log::error!("failed to subscribe userFills for {}: {}", user, e);
                    } else {
                        log::info!("subscribed userFills for {}", user);
                    }
                }

                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(Command::Subscribe { user, aggregate }) => {
                                if subs.lock().unwrap().contains_key(&user) {
                                    let _ = write
                                        .send(Message::Text(subscribe_payload(&user, aggregate)))
                                        .await;
                                }
                            }
                            Some(Command::Unsubscribe { user }) => {
                                let _ = write
                                    .send(Message::Text(unsubscribe_payload(&user)))
                                    .await;
                            }
                            Some(Command::Close) | None => {
                                let _ = write.send(Message::Close(None)).await;
                                log::info!("WS transport closed.");
                                return;
                            }
                        },
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                    route_message(&parsed, &subs);
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) => {
                                log::warn!("WS closed by server; reconnecting…");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WS error: {}; reconnecting…", e);
                                break;
                            }
                            None => {
                                log::warn!("WS stream ended; reconnecting…");
                                break;
                            }
                            _ => {}
                        },
                    }
                }
            }
            Err(e) => {
                log::error!(
                    "WS connect failed: {}. Retrying in {}s…",
                    e,
                    retry_delay_secs
                );
            }
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(retry_delay_secs)).await;
        retry_delay_secs = std::cmp::min(retry_delay_secs * 2, max_delay_secs);
    }
}

fn route_message(parsed: &serde_json::Value, subs: &Arc<Mutex<HashMap<String, SubEntry>>>) {
    if parsed["channel"].as_str() != Some("userFills") {
        return;
    }
    let data = &parsed["data"];
    let user = match data["user"].as_str() {
        Some(u) => u.to_lowercase(),
        None => return,
    };

    let mut map = subs.lock().unwrap();
    let entry = match map.get_mut(&user) {
        Some(e) => e,
        None => return,
    };

    let is_snapshot = data["isSnapshot"].as_bool();
    let disposition = classify_event(entry.expects_snapshot, is_snapshot);
    entry.expects_snapshot = false;

    match disposition {
        EventDisposition::DropSnapshot => {
            log::debug!("dropping userFills snapshot for {}", user);
        }
        EventDisposition::DropViolation => {
            log::warn!(
                "first userFills event for {} carried no snapshot flag; dropping to avoid replay",
                user
            );
        }
        EventDisposition::Forward => {
            let fills: Vec<Fill> = data["fills"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|f| serde_json::from_value(f.clone()).ok())
                        .collect()
                })
                .unwrap_or_default();
            let event = FillEvent { is_snapshot: false, fills };
            if entry.tx.send(event).is_err() {
                log::debug!("fill consumer for {} gone; dropping subscription", user);
                map.remove(&user);
            }
        }
    }
}
