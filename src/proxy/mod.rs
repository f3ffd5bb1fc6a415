// =============================================================================
// Streaming Proxy — WebSocket fan-out between clients and broker adapters
// =============================================================================
//
// Per-client lifecycle: CONNECTED -> AUTHENTICATED -> ACTIVE -> CLOSING ->
// CLOSED. The first frame must authenticate; subscribe/unsubscribe frames
// manage routing; cleanup mirrors every registration on the way out.
//
// Each client owns a bounded outgoing queue. A slow client overflows its
// queue and is closed — backpressure never reaches the bus or a broker
// socket. Fan-out reads a snapshot of the subscriber set, so no lock is
// held while sending.
// =============================================================================

pub mod adapters;
pub mod subscriptions;
pub mod throttle;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::AuthService;
use crate::bus::{BusMessage, MarketDataBus};
use crate::symbols::SymbolRegistry;
use crate::types::{Exchange, SubscriptionMode};

pub use adapters::AdapterPool;
pub use subscriptions::{ClientId, SubKey, SubscriptionIndex};
pub use throttle::LtpThrottle;

/// Outgoing queue depth per client; overflow closes the client.
const CLIENT_QUEUE: usize = 256;

struct ClientHandle {
    user_id: String,
    tx: mpsc::Sender<Message>,
}

/// Authenticated context carried by a client task.
#[derive(Clone)]
struct ClientSession {
    user_id: String,
    broker: String,
}

enum Flow {
    Continue,
    Close,
}

pub struct StreamingProxy {
    auth: Arc<AuthService>,
    registry: Arc<SymbolRegistry>,
    pool: Arc<AdapterPool>,
    subs: SubscriptionIndex,
    throttle: LtpThrottle,
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    next_id: AtomicU64,
}

impl StreamingProxy {
    pub fn new(
        auth: Arc<AuthService>,
        registry: Arc<SymbolRegistry>,
        pool: Arc<AdapterPool>,
    ) -> Self {
        Self {
            auth,
            registry,
            pool,
            subs: SubscriptionIndex::new(),
            throttle: LtpThrottle::new(),
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscription_index(&self) -> &SubscriptionIndex {
        &self.subs
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.read().len()
    }

    /// Register an out-of-band client. The handle receives fan-out frames
    /// exactly like a WebSocket client; embedded consumers and tests use
    /// this instead of a socket.
    pub fn attach_client(&self, client_id: ClientId, user_id: &str, tx: mpsc::Sender<Message>) {
        self.clients
            .write()
            .insert(client_id, ClientHandle { user_id: user_id.to_string(), tx });
    }

    /// Register a subscription for an attached client without a broker call.
    pub fn add_subscription(
        &self,
        client_id: ClientId,
        symbol: &str,
        exchange: Exchange,
        mode: SubscriptionMode,
    ) {
        self.subs.add(client_id, SubKey::new(symbol, exchange, mode));
    }

    // -------------------------------------------------------------------------
    // Frame handling
    // -------------------------------------------------------------------------

    async fn handle_frame(
        self: &Arc<Self>,
        client_id: ClientId,
        tx: &mpsc::Sender<Message>,
        session: &mut Option<ClientSession>,
        text: &str,
    ) -> Flow {
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                send_json(tx, json!({"type": "error", "message": "malformed frame"}));
                return Flow::Close;
            }
        };

        match frame["action"].as_str() {
            Some("authenticate") => self.handle_authenticate(client_id, tx, session, &frame),
            Some("subscribe") => {
                let Some(session) = session.as_ref() else {
                    send_json(tx, json!({"type": "error", "message": "authenticate first"}));
                    return Flow::Close;
                };
                self.handle_subscribe(client_id, tx, session, &frame).await
            }
            Some("unsubscribe") => {
                let Some(session) = session.as_ref() else {
                    send_json(tx, json!({"type": "error", "message": "authenticate first"}));
                    return Flow::Close;
                };
                self.handle_unsubscribe(client_id, tx, session, &frame).await
            }
            _ => {
                send_json(tx, json!({"type": "error", "message": "unknown action"}));
                Flow::Continue
            }
        }
    }

    fn handle_authenticate(
        self: &Arc<Self>,
        client_id: ClientId,
        tx: &mpsc::Sender<Message>,
        session: &mut Option<ClientSession>,
        frame: &Value,
    ) -> Flow {
        let api_key = frame["api_key"].as_str().unwrap_or_default();

        match self.auth.verify_key(api_key) {
            Ok(identity) => {
                let Some(broker) = identity.default_broker.clone() else {
                    send_json(
                        tx,
                        json!({
                            "type": "auth_response",
                            "status": "error",
                            "message": "no default broker configured for this account",
                        }),
                    );
                    return Flow::Close;
                };

                self.clients.write().insert(
                    client_id,
                    ClientHandle { user_id: identity.user_id.clone(), tx: tx.clone() },
                );
                *session = Some(ClientSession { user_id: identity.user_id.clone(), broker });

                info!(client_id, user_id = %identity.user_id, "websocket client authenticated");
                send_json(
                    tx,
                    json!({
                        "type": "auth_response",
                        "status": "success",
                        "message": "authenticated",
                    }),
                );
                Flow::Continue
            }
            Err(e) => {
                warn!(client_id, "websocket authentication failed");
                send_json(
                    tx,
                    json!({
                        "type": "auth_response",
                        "status": "error",
                        "message": e.to_string(),
                    }),
                );
                Flow::Close
            }
        }
    }

    async fn handle_subscribe(
        self: &Arc<Self>,
        client_id: ClientId,
        tx: &mpsc::Sender<Message>,
        session: &ClientSession,
        frame: &Value,
    ) -> Flow {
        let Some(mode) = SubscriptionMode::from_client_value(&frame["mode"]) else {
            send_json(tx, json!({"type": "error", "message": "invalid mode"}));
            return Flow::Continue;
        };
        let depth_level = frame["depth_level"].as_u64().map(|d| d as u8);
        let symbols = frame["symbols"].as_array().cloned().unwrap_or_default();

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for entry in &symbols {
            let symbol = entry["symbol"].as_str().unwrap_or_default();
            let exchange: Exchange = match entry["exchange"].as_str().unwrap_or_default().parse() {
                Ok(e) => e,
                Err(_) => {
                    rejected.push(json!({"symbol": symbol, "reason": "unknown exchange"}));
                    continue;
                }
            };

            // Resolve against the contract master before touching the broker.
            if let Err(e) = self.registry.resolve(symbol, exchange) {
                rejected.push(json!({"symbol": symbol, "reason": e.to_string()}));
                continue;
            }

            let adapter = match self.pool.ensure(&session.user_id, &session.broker, client_id).await
            {
                Ok(adapter) => adapter,
                Err(e) => {
                    rejected.push(json!({"symbol": symbol, "reason": e.to_string()}));
                    continue;
                }
            };

            if let Err(e) = adapter.subscribe(symbol, exchange, mode, depth_level).await {
                rejected.push(json!({"symbol": symbol, "reason": e.to_string()}));
                continue;
            }

            self.subs.add(client_id, SubKey::new(symbol, exchange, mode));
            accepted.push(json!({"symbol": symbol, "exchange": exchange.as_str()}));
        }

        send_json(
            tx,
            json!({
                "type": "subscribe_response",
                "status": if rejected.is_empty() { "success" } else { "partial" },
                "mode": mode.code(),
                "subscribed": accepted,
                "rejected": rejected,
            }),
        );
        Flow::Continue
    }

    async fn handle_unsubscribe(
        self: &Arc<Self>,
        client_id: ClientId,
        tx: &mpsc::Sender<Message>,
        session: &ClientSession,
        frame: &Value,
    ) -> Flow {
        let symbols = frame["symbols"].as_array().cloned().unwrap_or_default();
        let mut removed = Vec::new();

        for entry in &symbols {
            let symbol = entry["symbol"].as_str().unwrap_or_default();
            let Ok(exchange) = entry["exchange"].as_str().unwrap_or_default().parse::<Exchange>()
            else {
                continue;
            };

            for (key, emptied) in self.subs.remove_symbol(client_id, symbol, exchange) {
                // Last subscriber gone: release the instrument at the broker.
                if emptied {
                    if let Some(adapter) =
                        self.pool.get(&session.user_id, &session.broker).await
                    {
                        if let Err(e) =
                            adapter.unsubscribe(&key.symbol, key.exchange, key.mode).await
                        {
                            warn!(symbol = %key.symbol, error = %e, "broker unsubscribe failed");
                        }
                    }
                }
                removed.push(json!({"symbol": key.symbol, "mode": key.mode.code()}));
            }
        }

        send_json(
            tx,
            json!({
                "type": "unsubscribe_response",
                "status": "success",
                "unsubscribed": removed,
            }),
        );
        Flow::Continue
    }

    // -------------------------------------------------------------------------
    // Cleanup
    // -------------------------------------------------------------------------

    /// Tear down everything a client registered. Idempotent: eviction by the
    /// fan-out path and the client task's own exit may both land here.
    async fn cleanup_client(self: &Arc<Self>, client_id: ClientId, session: Option<&ClientSession>) {
        self.clients.write().remove(&client_id);

        let removed = self.subs.remove_client(client_id);
        if let Some(session) = session {
            for (key, emptied) in removed {
                if emptied {
                    if let Some(adapter) =
                        self.pool.get(&session.user_id, &session.broker).await
                    {
                        let _ = adapter.unsubscribe(&key.symbol, key.exchange, key.mode).await;
                    }
                }
            }
        }

        self.pool.detach_client(client_id).await;
        debug!(client_id, "websocket client cleaned up");
    }

    /// Evict a client whose send queue overflowed or closed.
    async fn evict_client(self: &Arc<Self>, client_id: ClientId) {
        let user_broker = {
            let clients = self.clients.read();
            clients.get(&client_id).map(|h| h.user_id.clone())
        };
        warn!(client_id, "closing slow or dead websocket client");

        // Dropping the handle drops its queue sender; the forward task ends
        // and the socket closes. Subscriptions are torn down here so fan-out
        // stops immediately.
        let session = user_broker.and_then(|user_id| {
            // Broker lookup mirrors what the client task holds.
            self.auth
                .store()
                .default_broker(&user_id)
                .ok()
                .flatten()
                .map(|(broker, _)| ClientSession { user_id, broker })
        });
        self.cleanup_client(client_id, session.as_ref()).await;
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Route one bus message to every subscribed client.
    pub async fn dispatch(self: &Arc<Self>, msg: BusMessage) {
        let topic = msg.topic;

        // LTP floor: one gate per (symbol, exchange), global across clients.
        if topic.mode == SubscriptionMode::Ltp
            && !self.throttle.allow(&topic.symbol, topic.exchange)
        {
            return;
        }

        let key = SubKey::new(topic.symbol.clone(), topic.exchange, topic.mode);
        let subscribers = self.subs.subscribers(&key);
        if subscribers.is_empty() {
            return;
        }

        let frame = json!({
            "type": "market_data",
            "symbol": topic.symbol,
            "exchange": topic.exchange.as_str(),
            "mode": topic.mode.code(),
            "data": msg.payload,
        })
        .to_string();

        let mut dead = Vec::new();
        {
            let clients = self.clients.read();
            for id in subscribers {
                match clients.get(&id) {
                    Some(handle) => {
                        if handle.tx.try_send(Message::Text(frame.clone())).is_err() {
                            dead.push(id);
                        }
                    }
                    None => dead.push(id),
                }
            }
        }

        for id in dead {
            self.evict_client(id).await;
        }
    }
}

impl std::fmt::Debug for StreamingProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingProxy")
            .field("clients", &self.connected_clients())
            .field("subs", &self.subs)
            .finish()
    }
}

fn send_json(tx: &mpsc::Sender<Message>, value: Value) {
    let _ = tx.try_send(Message::Text(value.to_string()));
}

// =============================================================================
// WebSocket server
// =============================================================================

pub fn router(proxy: Arc<StreamingProxy>) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(proxy)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(proxy): State<Arc<StreamingProxy>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, proxy))
}

/// One task per client: a bounded forward queue plus the receive loop that
/// drives the state machine. Client disconnect cancels any in-flight work
/// simply by ending this task's loop.
async fn handle_client(socket: WebSocket, proxy: Arc<StreamingProxy>) {
    let client_id = proxy.next_id.fetch_add(1, Ordering::Relaxed);
    debug!(client_id, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE);

    let forward = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut session: Option<ClientSession> = None;

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                match proxy.handle_frame(client_id, &tx, &mut session, &text).await {
                    Flow::Continue => {}
                    Flow::Close => break,
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = tx.try_send(Message::Pong(data));
            }
            Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(client_id, "close frame received");
                break;
            }
            Err(e) => {
                debug!(client_id, error = %e, "websocket receive error");
                break;
            }
        }
    }

    proxy.cleanup_client(client_id, session.as_ref()).await;
    drop(tx);
    let _ = forward.await;
    debug!(client_id, "websocket client closed");
}

/// Serve the proxy: the WS listener plus the bus fan-out loop. Returns when
/// the bus closes (shutdown).
pub async fn serve(
    proxy: Arc<StreamingProxy>,
    bus: Arc<MarketDataBus>,
    addr: String,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "streaming proxy listening");

    let app = router(proxy.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "streaming proxy server stopped");
        }
    });

    while let Some(msg) = bus.recv().await {
        proxy.dispatch(msg).await;
    }
    info!("bus closed — fan-out loop ending");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthStore;
    use crate::broker::factory::AdapterFactory;
    use crate::crypto::CredentialVault;
    use crate::types::TickPayload;

    fn proxy() -> (Arc<StreamingProxy>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.db");
        let store = Arc::new(AuthStore::new(path.to_str().unwrap()).unwrap());
        let vault = Arc::new(CredentialVault::new("0123456789abcdef0123456789abcdef"));
        let auth = Arc::new(AuthService::new(store, vault, "pepper-pepper-pepper-pepper-1234"));
        let bus = Arc::new(MarketDataBus::new("127.0.0.1:5555"));
        let factory = Arc::new(AdapterFactory::new(bus));
        let pool = Arc::new(AdapterPool::new(factory, auth.clone()));
        let registry = Arc::new(SymbolRegistry::new());
        (Arc::new(StreamingProxy::new(auth, registry, pool)), dir)
    }

    #[tokio::test]
    async fn dispatch_without_subscribers_is_a_noop() {
        let (proxy, _d) = proxy();
        let msg = BusMessage {
            topic: crate::bus::Topic::new(
                "flattrade",
                Exchange::Nse,
                "RELIANCE",
                SubscriptionMode::Ltp,
            ),
            payload: TickPayload::ltp("RELIANCE", Exchange::Nse, 2450.0),
        };
        proxy.dispatch(msg).await;
        assert_eq!(proxy.connected_clients(), 0);
    }

    #[tokio::test]
    async fn fanout_sends_to_each_subscriber_exactly_once() {
        let (proxy, _d) = proxy();

        let (tx1, mut rx1) = mpsc::channel::<Message>(8);
        let (tx2, mut rx2) = mpsc::channel::<Message>(8);
        let (tx3, mut rx3) = mpsc::channel::<Message>(8);
        proxy.clients.write().insert(1, ClientHandle { user_id: "u1".into(), tx: tx1 });
        proxy.clients.write().insert(2, ClientHandle { user_id: "u2".into(), tx: tx2 });
        proxy.clients.write().insert(3, ClientHandle { user_id: "u3".into(), tx: tx3 });

        let key = SubKey::new("RELIANCE", Exchange::Nse, SubscriptionMode::Quote);
        proxy.subs.add(1, key.clone());
        proxy.subs.add(2, key.clone());
        // Client 3 subscribes to a different mode.
        proxy.subs.add(3, SubKey::new("RELIANCE", Exchange::Nse, SubscriptionMode::Ltp));

        let msg = BusMessage {
            topic: crate::bus::Topic::new(
                "flattrade",
                Exchange::Nse,
                "RELIANCE",
                SubscriptionMode::Quote,
            ),
            payload: TickPayload::ltp("RELIANCE", Exchange::Nse, 2450.0),
        };
        proxy.dispatch(msg).await;

        for rx in [&mut rx1, &mut rx2] {
            let Message::Text(text) = rx.try_recv().unwrap() else {
                panic!("expected text frame")
            };
            let v: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(v["type"], "market_data");
            assert_eq!(v["mode"], 2);
            assert_eq!(v["data"]["ltp"], 2450.0);
            assert!(rx.try_recv().is_err(), "client must receive exactly one frame");
        }
        assert!(rx3.try_recv().is_err(), "other-mode client must receive nothing");
    }

    #[tokio::test]
    async fn ltp_throttle_drops_inside_floor() {
        let (proxy, _d) = proxy();
        let (tx, mut rx) = mpsc::channel::<Message>(8);
        proxy.clients.write().insert(1, ClientHandle { user_id: "u1".into(), tx });
        proxy.subs.add(1, SubKey::new("SBIN", Exchange::Nse, SubscriptionMode::Ltp));

        let mk = |price: f64| BusMessage {
            topic: crate::bus::Topic::new("flattrade", Exchange::Nse, "SBIN", SubscriptionMode::Ltp),
            payload: TickPayload::ltp("SBIN", Exchange::Nse, price),
        };

        proxy.dispatch(mk(500.0)).await;
        proxy.dispatch(mk(500.25)).await; // inside 50 ms — dropped

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn queue_overflow_evicts_the_slow_client() {
        let (proxy, _d) = proxy();
        let (tx, _rx) = mpsc::channel::<Message>(1);
        proxy.clients.write().insert(1, ClientHandle { user_id: "u1".into(), tx });
        proxy.subs.add(1, SubKey::new("SBIN", Exchange::Nse, SubscriptionMode::Quote));

        let mk = || BusMessage {
            topic: crate::bus::Topic::new(
                "flattrade",
                Exchange::Nse,
                "SBIN",
                SubscriptionMode::Quote,
            ),
            payload: TickPayload::ltp("SBIN", Exchange::Nse, 1.0),
        };

        proxy.dispatch(mk()).await; // fills the queue (capacity 1)
        proxy.dispatch(mk()).await; // overflow -> eviction

        assert_eq!(proxy.connected_clients(), 0);
        assert_eq!(proxy.subs.client_subscription_count(1), 0);
    }
}
