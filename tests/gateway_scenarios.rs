// =============================================================================
// End-to-end gateway scenarios against a stub broker adapter
// =============================================================================
//
// Covers the full order path (auth -> rate limit -> mode gate -> dispatch or
// queue), the approval path with its ownership check, streaming fan-out with
// the LTP throttle, and the persistent-session disconnect quirk.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use meridian_gateway::auth::{AuthService, AuthStore};
use meridian_gateway::broker::factory::AdapterFactory;
use meridian_gateway::broker::{
    AuthStyle, BrokerAdapter, BrokerCapabilities, BrokerCredentials, BrokerError,
};
use meridian_gateway::bus::{MarketDataBus, Topic};
use meridian_gateway::crypto::CredentialVault;
use meridian_gateway::error::GatewayError;
use meridian_gateway::proxy::AdapterPool;
use meridian_gateway::ratelimit::RateLimiter;
use meridian_gateway::router::{
    ActionCenter, LiveDispatcher, OrderRouter, OrdersStore, PendingStatus, SandboxRoute,
};
use meridian_gateway::symbols::{Instrument, RegistryTable, SymbolRegistry};
use meridian_gateway::types::{
    Candle, Exchange, FundLimits, Holding, InstrumentType, Order, OrderMode, OrderModify,
    OrderRequest, Position, SubscriptionMode, TickPayload, Trade,
};

// =============================================================================
// Stub adapter
// =============================================================================

#[derive(Default)]
struct StubState {
    calls: Vec<String>,
    positions: Vec<Position>,
}

struct StubAdapter {
    name: String,
    state: Arc<Mutex<StubState>>,
    order_seq: AtomicU32,
}

impl StubAdapter {
    fn new(name: &str, state: Arc<Mutex<StubState>>) -> Self {
        Self { name: name.to_string(), state, order_seq: AtomicU32::new(1) }
    }
}

#[async_trait]
impl BrokerAdapter for StubAdapter {
    fn broker_name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _creds: BrokerCredentials) -> Result<(), BrokerError> {
        self.state.lock().calls.push("initialize".into());
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        let n = self.order_seq.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .calls
            .push(format!("place_order:{}:{}", request.symbol, request.quantity));
        Ok(format!("Z-{n:03}"))
    }

    async fn modify_order(&self, id: &str, _f: &OrderModify) -> Result<(), BrokerError> {
        self.state.lock().calls.push(format!("modify_order:{id}"));
        Ok(())
    }

    async fn cancel_order(&self, id: &str) -> Result<(), BrokerError> {
        self.state.lock().calls.push(format!("cancel_order:{id}"));
        Ok(())
    }

    async fn orderbook(&self) -> Result<Vec<Order>, BrokerError> {
        Ok(vec![])
    }
    async fn tradebook(&self) -> Result<Vec<Trade>, BrokerError> {
        Ok(vec![])
    }
    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        Ok(self.state.lock().positions.clone())
    }
    async fn holdings(&self) -> Result<Vec<Holding>, BrokerError> {
        Ok(vec![])
    }
    async fn funds(&self) -> Result<FundLimits, BrokerError> {
        Ok(FundLimits {
            available_balance: 100_000.0,
            used_margin: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        })
    }
    async fn quote(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError> {
        Ok(TickPayload::ltp(symbol, exchange, 100.0))
    }
    async fn depth(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError> {
        Ok(TickPayload::ltp(symbol, exchange, 100.0))
    }
    async fn history(
        &self,
        _s: &str,
        _e: Exchange,
        _i: &str,
        _f: i64,
        _t: i64,
    ) -> Result<Vec<Candle>, BrokerError> {
        Ok(vec![])
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        self.state.lock().calls.push("connect".into());
        Ok(())
    }
    async fn disconnect(&self) {
        self.state.lock().calls.push("disconnect".into());
    }
    async fn subscribe(
        &self,
        symbol: &str,
        _e: Exchange,
        mode: SubscriptionMode,
        _d: Option<u8>,
    ) -> Result<(), BrokerError> {
        self.state.lock().calls.push(format!("subscribe:{symbol}:{mode}"));
        Ok(())
    }
    async fn unsubscribe(
        &self,
        symbol: &str,
        _e: Exchange,
        _m: SubscriptionMode,
    ) -> Result<(), BrokerError> {
        self.state.lock().calls.push(format!("unsubscribe:{symbol}"));
        Ok(())
    }
    async fn unsubscribe_all(&self) -> Result<(), BrokerError> {
        self.state.lock().calls.push("unsubscribe_all".into());
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct NoSandbox;

#[async_trait]
impl SandboxRoute for NoSandbox {
    async fn handle(
        &self,
        _u: &str,
        _a: &str,
        _b: &serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        panic!("sandbox path must not be taken in these scenarios");
    }
}

struct Harness {
    auth: Arc<AuthService>,
    router: OrderRouter,
    orders: Arc<OrdersStore>,
    stub_state: Arc<Mutex<StubState>>,
    factory: Arc<AdapterFactory>,
    _dir: tempfile::TempDir,
}

fn harness(stub_caps: BrokerCapabilities) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("main.db");
    let db = db.to_str().unwrap();

    let vault = Arc::new(CredentialVault::new("0123456789abcdef0123456789abcdef"));
    let store = Arc::new(AuthStore::new(db).unwrap());
    let auth = Arc::new(AuthService::new(
        store,
        vault.clone(),
        "pepper-pepper-pepper-pepper-1234",
    ));

    let bus = Arc::new(MarketDataBus::new("127.0.0.1:5555"));
    let factory = Arc::new(AdapterFactory::new(bus));

    let stub_state = Arc::new(Mutex::new(StubState::default()));
    {
        let state = stub_state.clone();
        factory.register(
            "stub",
            Arc::new(move |_publisher| {
                Arc::new(StubAdapter::new("stub", state.clone())) as Arc<dyn BrokerAdapter>
            }),
            stub_caps,
        );
    }

    let orders = Arc::new(OrdersStore::new(db).unwrap());
    let action_center = ActionCenter::new(db).unwrap();
    let dispatcher = Arc::new(LiveDispatcher::new(auth.clone(), factory.clone(), orders.clone()));
    let limiter = Arc::new(RateLimiter::new(Default::default()));

    let router = OrderRouter::new(
        auth.clone(),
        limiter,
        dispatcher,
        Arc::new(NoSandbox),
        action_center,
    );

    Harness { auth, router, orders, stub_state, factory, _dir: dir }
}

impl Harness {
    /// Register a user bound to the stub broker and issue a key.
    fn user_with_key(&self, user_id: &str, mode: OrderMode) -> String {
        self.auth.register_user(user_id, "pw").unwrap();
        let blob = self
            .auth
            .vault()
            .encrypt(r#"{"api_key":"stub-key","api_secret":"stub-secret"}"#)
            .unwrap();
        self.auth
            .store()
            .upsert_broker_binding(user_id, "stub", &blob, true)
            .unwrap();
        self.auth.issue_key(user_id, mode).unwrap()
    }

    fn calls(&self) -> Vec<String> {
        self.stub_state.lock().calls.clone()
    }
}

fn reliance_order() -> serde_json::Value {
    json!({
        "symbol": "RELIANCE",
        "exchange": "NSE",
        "action": "BUY",
        "quantity": 1,
        "pricetype": "MARKET",
        "product": "MIS",
    })
}

// =============================================================================
// S1 — Auto mode order placement, happy path
// =============================================================================

#[tokio::test]
async fn s1_auto_mode_places_immediately() {
    let h = harness(BrokerCapabilities::default());
    let key = h.user_with_key("U1", OrderMode::Auto);

    let mut body = reliance_order();
    body["apikey"] = json!(key);

    let result = h.router.handle(&key, "placeorder", &body, false).await.unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(result["orderid"], "Z-001");

    // The broker was called; nothing was queued.
    assert!(h.calls().iter().any(|c| c == "place_order:RELIANCE:1"));
    assert!(h.router.action_center().list("U1").unwrap().is_empty());

    // One OPEN order row recorded with the broker id.
    let rows = h.orders.for_user("U1").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, meridian_gateway::types::OrderStatus::Open);
    assert_eq!(rows[0].broker_order_id.as_deref(), Some("Z-001"));
}

// =============================================================================
// S2 — Semi-auto mode queues a placeorder
// =============================================================================

#[tokio::test]
async fn s2_semi_auto_queues_without_broker_call() {
    let h = harness(BrokerCapabilities::default());
    let key = h.user_with_key("U1", OrderMode::SemiAuto);

    let mut body = reliance_order();
    body["apikey"] = json!(key);

    let result = h.router.handle(&key, "placeorder", &body, false).await.unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(result["mode"], "semi_auto");
    let pending_id = result["pending_order_id"].as_i64().unwrap();

    // Row exists, pending, with the api key stripped from the blob.
    let rows = h.router.action_center().list("U1").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, pending_id);
    assert_eq!(rows[0].status, PendingStatus::Pending);
    assert_eq!(rows[0].api_type, "placeorder");
    assert!(rows[0].order_blob.get("apikey").is_none());

    // No broker interaction of any kind.
    assert!(h.calls().is_empty());
}

// =============================================================================
// S3 — Approve own pending; ownership check on foreign pending
// =============================================================================

#[tokio::test]
async fn s3_approval_dispatches_and_foreign_approval_is_refused() {
    let h = harness(BrokerCapabilities::default());
    let key = h.user_with_key("U1", OrderMode::SemiAuto);
    h.user_with_key("U2", OrderMode::Auto);

    let mut body = reliance_order();
    body["apikey"] = json!(key);
    let queued = h.router.handle(&key, "placeorder", &body, false).await.unwrap();
    let pending_id = queued["pending_order_id"].as_i64().unwrap();

    // A foreign user cannot approve; the row is untouched.
    let err = h.router.approve(pending_id, "U2").await.unwrap_err();
    assert!(matches!(err, GatewayError::OwnershipViolation));
    assert_eq!(
        h.router.action_center().get(pending_id, "U1").unwrap().status,
        PendingStatus::Pending
    );
    assert!(h.calls().is_empty());

    // The owner approves: the original blob dispatches and the broker id
    // lands on the row.
    let result = h.router.approve(pending_id, "U1").await.unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(result["orderid"], "Z-001");

    let row = h.router.action_center().get(pending_id, "U1").unwrap();
    assert_eq!(row.status, PendingStatus::Approved);
    assert_eq!(row.broker_order_id.as_deref(), Some("Z-001"));
    assert!(h.calls().iter().any(|c| c.starts_with("place_order:RELIANCE")));
}

// =============================================================================
// Mode gate: restricted operations in Semi-Auto
// =============================================================================

#[tokio::test]
async fn restricted_operations_refused_for_semi_auto_only() {
    let h = harness(BrokerCapabilities::default());
    let semi = h.user_with_key("U1", OrderMode::SemiAuto);
    let auto = h.user_with_key("U2", OrderMode::Auto);

    for api_type in ["cancelorder", "modifyorder", "closeposition", "cancelallorder"] {
        let body = json!({"orderid": "Z-001", "symbol": "RELIANCE"});
        let err = h.router.handle(&semi, api_type, &body, false).await.unwrap_err();
        assert!(
            matches!(err, GatewayError::OperationNotAllowed { .. }),
            "{api_type} must be refused in Semi-Auto"
        );
    }

    // The same operation from an Auto key reaches the broker.
    let body = json!({"orderid": "Z-001"});
    let result = h.router.handle(&auto, "cancelorder", &body, false).await.unwrap();
    assert_eq!(result["status"], "success");
    assert!(h.calls().iter().any(|c| c == "cancel_order:Z-001"));

    // UI-initiated calls bypass the restriction.
    let result = h.router.handle(&semi, "cancelorder", &body, true).await.unwrap();
    assert_eq!(result["status"], "success");
}

#[tokio::test]
async fn immediate_reads_work_in_semi_auto() {
    let h = harness(BrokerCapabilities::default());
    let key = h.user_with_key("U1", OrderMode::SemiAuto);

    let result = h.router.handle(&key, "funds", &json!({}), false).await.unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(result["data"]["availablecash"], 100_000.0);
}

#[tokio::test]
async fn invalid_key_is_rejected_before_anything_else() {
    let h = harness(BrokerCapabilities::default());
    let err = h
        .router
        .handle("not-a-key", "placeorder", &reliance_order(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidApiKey));
    assert!(h.calls().is_empty());
}

// =============================================================================
// S4 — Streaming fan-out and LTP throttle
// =============================================================================

mod streaming {
    use super::*;
    use axum::extract::ws::Message;
    use meridian_gateway::bus::BusMessage;
    use meridian_gateway::proxy::StreamingProxy;
    use tokio::sync::mpsc;

    fn registry_with(symbols: &[(&str, Exchange)]) -> Arc<SymbolRegistry> {
        let registry = Arc::new(SymbolRegistry::new());
        let instruments = symbols
            .iter()
            .map(|(symbol, exchange)| Instrument {
                symbol: symbol.to_string(),
                exchange: *exchange,
                instrument_type: InstrumentType::Equity,
                lot_size: 1,
                tick_size: 0.05,
                expiry: None,
                strike: None,
            })
            .collect();
        registry.swap(RegistryTable::build(instruments, vec![]));
        registry
    }

    #[tokio::test]
    async fn s4_fanout_delivers_throttled_ltp_to_both_clients() {
        let h = harness(BrokerCapabilities::default());
        let pool = Arc::new(AdapterPool::new(h.factory.clone(), h.auth.clone()));
        let registry = registry_with(&[("RELIANCE", Exchange::Nse)]);
        let proxy = Arc::new(StreamingProxy::new(h.auth.clone(), registry, pool));

        // Two clients subscribed to (RELIANCE, NSE, LTP) via the test seam.
        let (tx1, mut rx1) = mpsc::channel::<Message>(16);
        let (tx2, mut rx2) = mpsc::channel::<Message>(16);
        proxy.attach_client(1, "U1", tx1);
        proxy.attach_client(2, "U2", tx2);
        proxy.add_subscription(1, "RELIANCE", Exchange::Nse, SubscriptionMode::Ltp);
        proxy.add_subscription(2, "RELIANCE", Exchange::Nse, SubscriptionMode::Ltp);

        let tick = |price: f64| BusMessage {
            topic: Topic::new("stub", Exchange::Nse, "RELIANCE", SubscriptionMode::Ltp),
            payload: TickPayload::ltp("RELIANCE", Exchange::Nse, price),
        };

        // t=0, 10, 60, 120 ms.
        proxy.dispatch(tick(2450.00)).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        proxy.dispatch(tick(2450.25)).await; // dropped by the 50 ms floor
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        proxy.dispatch(tick(2450.50)).await;
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        proxy.dispatch(tick(2450.75)).await;

        for rx in [&mut rx1, &mut rx2] {
            let mut prices = Vec::new();
            while let Ok(Message::Text(text)) = rx.try_recv() {
                let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                prices.push(v["data"]["ltp"].as_f64().unwrap());
            }
            assert_eq!(prices, vec![2450.00, 2450.50, 2450.75]);
        }
    }
}

// =============================================================================
// S5 — Persistent-session disconnect quirk
// =============================================================================

#[tokio::test]
async fn s5_cooldown_broker_keeps_session_across_client_churn() {
    let caps = BrokerCapabilities {
        persistent_on_client_disconnect: true,
        authentication_style: AuthStyle::SessionToken,
        ..Default::default()
    };
    let h = harness(caps);
    h.user_with_key("U1", OrderMode::Auto);

    let pool = AdapterPool::new(h.factory.clone(), h.auth.clone());

    // First client brings the adapter up.
    let adapter = pool.ensure("U1", "stub", 1).await.unwrap();
    adapter
        .subscribe("NIFTY", Exchange::NseIndex, SubscriptionMode::Quote, None)
        .await
        .unwrap();
    assert_eq!(h.calls(), vec!["initialize", "connect", "subscribe:NIFTY:QUOTE"]);

    // Last client leaves: subscriptions are released, the session stays.
    pool.detach_client(1).await;
    let calls = h.calls();
    assert_eq!(calls.iter().filter(|c| *c == "unsubscribe_all").count(), 1);
    assert!(!calls.iter().any(|c| *c == "disconnect"));

    // A new client reuses the warm adapter with no reconnection.
    let again = pool.ensure("U1", "stub", 2).await.unwrap();
    assert!(Arc::ptr_eq(&adapter, &again));
    assert_eq!(h.calls().iter().filter(|c| *c == "connect").count(), 1);
}

#[tokio::test]
async fn non_cooldown_broker_disconnects_on_last_client() {
    let h = harness(BrokerCapabilities::default());
    h.user_with_key("U1", OrderMode::Auto);

    let pool = AdapterPool::new(h.factory.clone(), h.auth.clone());
    pool.ensure("U1", "stub", 1).await.unwrap();
    pool.detach_client(1).await;

    let calls = h.calls();
    assert!(calls.iter().any(|c| *c == "disconnect"));
    assert!(!calls.iter().any(|c| *c == "unsubscribe_all"));

    // The next client gets a fresh adapter (initialize + connect again).
    pool.ensure("U1", "stub", 2).await.unwrap();
    assert_eq!(h.calls().iter().filter(|c| *c == "connect").count(), 2);
}
