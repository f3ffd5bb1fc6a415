// =============================================================================
// Noren Adapter — Flattrade & Shoonya (shared protocol family)
// =============================================================================
//
// REST: POST form body `jData=<json>&jKey=<session token>`; responses carry
// `stat: "Ok" | "Not_Ok"`. A "Session Expired" emsg maps to InvalidToken.
//
// Feed: a single WebSocket carrying touchline (`t`) and depth (`d`)
// subscriptions keyed as `EXCH|TOKEN`. Both brokers impose a server-side
// cooldown after a clean disconnect, so the proxy keeps this adapter alive
// across client churn and only ever calls `unsubscribe_all`.
//
// SECURITY: the session token is held in a zeroized buffer and appears in
// neither logs nor Debug output.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::broker::{
    normalize_price, with_timeout, AuthStyle, BrokerAdapter, BrokerCapabilities,
    BrokerCredentials, BrokerError,
};
use crate::bus::{BusPublisher, Topic};
use crate::types::{
    ist_timestamp, Candle, DepthLevel, DepthLevels, Exchange, FundLimits, Holding, Order,
    OrderModify, OrderRequest, Position, QuoteFields, SubscriptionMode, TickPayload, Trade,
};

const REST_BASE: &str = "https://piconnect.flattrade.in/PiConnectTP";
const WS_URL: &str = "wss://piconnect.flattrade.in/PiConnectWSTp/";

struct Session {
    uid: String,
    actid: String,
    token: Zeroizing<String>,
}

/// One feed subscription: the wire key it was sent with and the canonical
/// identity it publishes as.
#[derive(Clone)]
struct FeedSub {
    symbol: String,
    exchange: Exchange,
    mode: SubscriptionMode,
}

struct Inner {
    broker: String,
    http: reqwest::Client,
    publisher: BusPublisher,
    session: RwLock<Option<Session>>,
    /// Wire key (`EXCH|SYMBOL`) -> canonical identity, per mode.
    subs: RwLock<HashMap<String, FeedSub>>,
    /// Outgoing frames for the feed task (subscribes, unsubscribes).
    feed_tx: RwLock<Option<mpsc::UnboundedSender<String>>>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Adapter for the Noren protocol family.
pub struct NorenAdapter {
    inner: Arc<Inner>,
}

impl NorenAdapter {
    pub fn new(broker: String, publisher: BusPublisher) -> Self {
        let (shutdown, _) = watch::channel(false);
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            inner: Arc::new(Inner {
                broker,
                http,
                publisher,
                session: RwLock::new(None),
                subs: RwLock::new(HashMap::new()),
                feed_tx: RwLock::new(None),
                connected: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn capabilities() -> BrokerCapabilities {
        BrokerCapabilities {
            max_symbols_per_connection: 1000,
            price_divisor: 1.0,
            persistent_on_client_disconnect: true,
            requires_market_data_creds: false,
            authentication_style: AuthStyle::SessionToken,
        }
    }
}

// =============================================================================
// REST plumbing
// =============================================================================

impl Inner {
    /// POST a Noren endpoint with the `jData`/`jKey` form body.
    async fn call(&self, endpoint: &str, payload: Value) -> Result<Value, BrokerError> {
        let (jdata, jkey) = {
            let session = self.session.read();
            let session = session.as_ref().ok_or(BrokerError::InvalidToken)?;
            let mut payload = payload;
            payload["uid"] = json!(session.uid);
            if payload.get("actid").is_none() {
                payload["actid"] = json!(session.actid);
            }
            (payload.to_string(), session.token.to_string())
        };

        let url = format!("{REST_BASE}/{endpoint}");
        let body = format!("jData={jdata}&jKey={jkey}");

        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        let value: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Network(format!("bad response body: {e}")))?;

        // Book endpoints answer with a bare array on success.
        if value.is_array() {
            return Ok(value);
        }

        if value["stat"].as_str() == Some("Ok") {
            return Ok(value);
        }

        let emsg = value["emsg"].as_str().unwrap_or("unknown error").to_string();
        if emsg.contains("Session Expired") || emsg.contains("Invalid Session") {
            Err(BrokerError::InvalidToken)
        } else if endpoint == "PlaceOrder" || endpoint == "ModifyOrder" {
            Err(BrokerError::OrderRejected(emsg))
        } else {
            Err(BrokerError::InvalidInput(emsg))
        }
    }

    fn exchange_token(exchange: Exchange) -> &'static str {
        // Noren uses the canonical exchange tokens verbatim.
        exchange.as_str()
    }

    fn wire_key(symbol: &str, exchange: Exchange) -> String {
        format!("{}|{}", Self::exchange_token(exchange), symbol)
    }
}

// =============================================================================
// Feed task
// =============================================================================

async fn run_feed(inner: Arc<Inner>, mut outgoing: mpsc::UnboundedReceiver<String>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            return;
        }

        match feed_session(&inner, &mut outgoing, &mut shutdown).await {
            Ok(()) => return, // clean shutdown
            Err(e) => {
                error!(broker = %inner.broker, error = %e, "feed error — reconnecting in 5s");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// One feed connection: authenticate, replay subscriptions, pump messages.
async fn feed_session(
    inner: &Arc<Inner>,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let auth_frame = {
        let session = inner.session.read();
        let session = session.as_ref().ok_or_else(|| anyhow::anyhow!("no session"))?;
        json!({
            "t": "c",
            "uid": session.uid,
            "actid": session.actid,
            "susertoken": session.token.as_str(),
            "source": "API",
        })
        .to_string()
    };

    let (ws, _) = connect_async(WS_URL).await?;
    info!(broker = %inner.broker, "feed connected");
    let (mut write, mut read) = ws.split();

    write.send(WsMessage::Text(auth_frame)).await?;

    // Replay the current subscription set after (re)connect.
    let (touchline_keys, depth_keys) = {
        let subs = inner.subs.read();
        let mut tl = Vec::new();
        let mut dp = Vec::new();
        for (key, sub) in subs.iter() {
            match sub.mode {
                SubscriptionMode::Depth => dp.push(key.clone()),
                _ => tl.push(key.clone()),
            }
        }
        (tl, dp)
    };
    if !touchline_keys.is_empty() {
        write
            .send(WsMessage::Text(
                json!({"t": "t", "k": touchline_keys.join("#")}).to_string(),
            ))
            .await?;
    }
    if !depth_keys.is_empty() {
        write
            .send(WsMessage::Text(
                json!({"t": "d", "k": depth_keys.join("#")}).to_string(),
            ))
            .await?;
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }

            frame = outgoing.recv() => {
                match frame {
                    Some(text) => write.send(WsMessage::Text(text)).await?,
                    None => return Ok(()),
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some((topic, payload)) = parse_feed_message(inner, &text) {
                            inner.publisher.publish(topic, payload);
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        anyhow::bail!("feed socket closed by broker");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

/// Parse a Noren tick (`tk`/`tf` touchline acks and updates, `dk`/`df`
/// depth) into a canonical tick. Unknown or partial frames yield nothing.
fn parse_feed_message(inner: &Arc<Inner>, text: &str) -> Option<(Topic, TickPayload)> {
    let v: Value = serde_json::from_str(text).ok()?;
    let kind = v["t"].as_str()?;
    if !matches!(kind, "tk" | "tf" | "dk" | "df") {
        return None;
    }

    let exchange_token = v["e"].as_str()?;
    let wire_symbol = v["ts"].as_str().unwrap_or_default();
    let key = format!("{exchange_token}|{wire_symbol}");

    let sub = inner.subs.read().get(&key).cloned()?;
    let ltp = field_f64(&v, "lp")?;

    let mut payload = TickPayload {
        symbol: sub.symbol.clone(),
        exchange: sub.exchange,
        ltp: normalize_price(ltp, 1.0),
        timestamp: ist_timestamp(),
        quote: None,
        depth: None,
    };

    if sub.mode != SubscriptionMode::Ltp {
        payload.quote = Some(QuoteFields {
            open: field_f64(&v, "o").unwrap_or(0.0),
            high: field_f64(&v, "h").unwrap_or(0.0),
            low: field_f64(&v, "l").unwrap_or(0.0),
            close: field_f64(&v, "c").unwrap_or(0.0),
            volume: field_f64(&v, "v").unwrap_or(0.0),
            bid: field_f64(&v, "bp1").unwrap_or(0.0),
            ask: field_f64(&v, "sp1").unwrap_or(0.0),
            bid_qty: field_f64(&v, "bq1").unwrap_or(0.0),
            ask_qty: field_f64(&v, "sq1").unwrap_or(0.0),
        });
    }

    if sub.mode == SubscriptionMode::Depth {
        let mut buy = Vec::with_capacity(5);
        let mut sell = Vec::with_capacity(5);
        for level in 1..=5 {
            buy.push(DepthLevel {
                price: field_f64(&v, &format!("bp{level}")).unwrap_or(0.0),
                qty: field_f64(&v, &format!("bq{level}")).unwrap_or(0.0),
                orders: field_f64(&v, &format!("bo{level}")).unwrap_or(0.0) as u32,
            });
            sell.push(DepthLevel {
                price: field_f64(&v, &format!("sp{level}")).unwrap_or(0.0),
                qty: field_f64(&v, &format!("sq{level}")).unwrap_or(0.0),
                orders: field_f64(&v, &format!("so{level}")).unwrap_or(0.0) as u32,
            });
        }
        payload.depth = Some(DepthLevels { buy, sell });
    }

    let topic = Topic::new(inner.broker.clone(), sub.exchange, sub.symbol, sub.mode);
    Some((topic, payload))
}

/// Noren sends numerics as strings.
fn field_f64(v: &Value, key: &str) -> Option<f64> {
    match &v[key] {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// =============================================================================
// Adapter contract
// =============================================================================

#[async_trait]
impl BrokerAdapter for NorenAdapter {
    fn broker_name(&self) -> &str {
        &self.inner.broker
    }

    async fn initialize(&self, creds: BrokerCredentials) -> Result<(), BrokerError> {
        let token = creds
            .access_token
            .as_ref()
            .ok_or_else(|| BrokerError::InvalidInput("missing session token".into()))?;

        *self.inner.session.write() = Some(Session {
            uid: creds.api_key.to_string(),
            actid: creds.api_key.to_string(),
            token: Zeroizing::new(token.to_string()),
        });
        debug!(broker = %self.inner.broker, "session installed");
        Ok(())
    }

    // --- Orders --------------------------------------------------------------

    async fn place_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        let payload = json!({
            "exch": Inner::exchange_token(request.exchange),
            "tsym": request.symbol,
            "qty": request.quantity.to_string(),
            "prc": request.price.unwrap_or(0.0).to_string(),
            "trgprc": request.trigger_price.map(|p| p.to_string()),
            "prd": match request.product {
                crate::types::Product::Mis => "I",
                crate::types::Product::Cnc => "C",
                crate::types::Product::Nrml => "M",
            },
            "trantype": match request.action {
                crate::types::OrderAction::Buy => "B",
                crate::types::OrderAction::Sell => "S",
            },
            "prctyp": match request.price_type {
                crate::types::PriceType::Market => "MKT",
                crate::types::PriceType::Limit => "LMT",
                crate::types::PriceType::StopLoss => "SL-LMT",
                crate::types::PriceType::StopLossMarket => "SL-MKT",
            },
            "ret": "DAY",
        });

        let resp = with_timeout(self.inner.call("PlaceOrder", payload)).await?;
        resp["norenordno"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::OrderRejected("no order id in response".into()))
    }

    async fn modify_order(
        &self,
        broker_order_id: &str,
        fields: &OrderModify,
    ) -> Result<(), BrokerError> {
        let mut payload = json!({ "norenordno": broker_order_id });
        if let Some(qty) = fields.quantity {
            payload["qty"] = json!(qty.to_string());
        }
        if let Some(price) = fields.price {
            payload["prc"] = json!(price.to_string());
        }
        if let Some(trigger) = fields.trigger_price {
            payload["trgprc"] = json!(trigger.to_string());
        }
        with_timeout(self.inner.call("ModifyOrder", payload)).await?;
        Ok(())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        with_timeout(self.inner.call("CancelOrder", json!({ "norenordno": broker_order_id })))
            .await?;
        Ok(())
    }

    // --- Books ---------------------------------------------------------------

    async fn orderbook(&self) -> Result<Vec<Order>, BrokerError> {
        let resp = with_timeout(self.inner.call("OrderBook", json!({}))).await?;
        let rows = resp.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(|r| parse_order_row(r)).collect())
    }

    async fn tradebook(&self) -> Result<Vec<Trade>, BrokerError> {
        let resp = with_timeout(self.inner.call("TradeBook", json!({}))).await?;
        let rows = resp.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(|r| parse_trade_row(r)).collect())
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let resp = with_timeout(self.inner.call("PositionBook", json!({}))).await?;
        let rows = resp.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(|r| parse_position_row(r)).collect())
    }

    async fn holdings(&self) -> Result<Vec<Holding>, BrokerError> {
        let resp = with_timeout(self.inner.call("Holdings", json!({"prd": "C"}))).await?;
        let rows = resp.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(|r| parse_holding_row(r)).collect())
    }

    async fn funds(&self) -> Result<FundLimits, BrokerError> {
        let resp = with_timeout(self.inner.call("Limits", json!({}))).await?;
        Ok(FundLimits {
            available_balance: field_f64(&resp, "cash").unwrap_or(0.0),
            used_margin: field_f64(&resp, "marginused").unwrap_or(0.0),
            realized_pnl: field_f64(&resp, "rpnl").unwrap_or(0.0),
            unrealized_pnl: field_f64(&resp, "urmtom").unwrap_or(0.0),
        })
    }

    async fn quote(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError> {
        let payload = json!({
            "exch": Inner::exchange_token(exchange),
            "tsym": symbol,
        });
        let resp = with_timeout(self.inner.call("GetQuotes", payload)).await?;

        let ltp = field_f64(&resp, "lp")
            .ok_or_else(|| BrokerError::InvalidInput("quote missing last price".into()))?;
        Ok(TickPayload::ltp(symbol, exchange, normalize_price(ltp, 1.0)).with_quote(QuoteFields {
            open: field_f64(&resp, "o").unwrap_or(0.0),
            high: field_f64(&resp, "h").unwrap_or(0.0),
            low: field_f64(&resp, "l").unwrap_or(0.0),
            close: field_f64(&resp, "c").unwrap_or(0.0),
            volume: field_f64(&resp, "v").unwrap_or(0.0),
            bid: field_f64(&resp, "bp1").unwrap_or(0.0),
            ask: field_f64(&resp, "sp1").unwrap_or(0.0),
            bid_qty: field_f64(&resp, "bq1").unwrap_or(0.0),
            ask_qty: field_f64(&resp, "sq1").unwrap_or(0.0),
        }))
    }

    async fn depth(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError> {
        // Noren's quote response already carries the 5-level ladder.
        let payload = json!({
            "exch": Inner::exchange_token(exchange),
            "tsym": symbol,
        });
        let resp = with_timeout(self.inner.call("GetQuotes", payload)).await?;
        let ltp = field_f64(&resp, "lp")
            .ok_or_else(|| BrokerError::InvalidInput("quote missing last price".into()))?;

        let mut buy = Vec::with_capacity(5);
        let mut sell = Vec::with_capacity(5);
        for level in 1..=5 {
            buy.push(DepthLevel {
                price: field_f64(&resp, &format!("bp{level}")).unwrap_or(0.0),
                qty: field_f64(&resp, &format!("bq{level}")).unwrap_or(0.0),
                orders: field_f64(&resp, &format!("bo{level}")).unwrap_or(0.0) as u32,
            });
            sell.push(DepthLevel {
                price: field_f64(&resp, &format!("sp{level}")).unwrap_or(0.0),
                qty: field_f64(&resp, &format!("sq{level}")).unwrap_or(0.0),
                orders: field_f64(&resp, &format!("so{level}")).unwrap_or(0.0) as u32,
            });
        }

        Ok(TickPayload::ltp(symbol, exchange, normalize_price(ltp, 1.0))
            .with_quote(QuoteFields::default())
            .with_depth(DepthLevels { buy, sell }))
    }

    async fn history(
        &self,
        symbol: &str,
        exchange: Exchange,
        interval: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, BrokerError> {
        let payload = json!({
            "exch": Inner::exchange_token(exchange),
            "tsym": symbol,
            "st": from.to_string(),
            "et": to.to_string(),
            "intrv": interval,
        });
        let resp = with_timeout(self.inner.call("TPSeries", payload)).await?;
        let rows = resp.as_array().cloned().unwrap_or_default();

        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(Candle {
                    timestamp: field_f64(r, "ssboe")? as i64,
                    open: field_f64(r, "into")?,
                    high: field_f64(r, "inth")?,
                    low: field_f64(r, "intl")?,
                    close: field_f64(r, "intc")?,
                    volume: field_f64(r, "intv").unwrap_or(0.0),
                })
            })
            .collect())
    }

    // --- Streaming -----------------------------------------------------------

    async fn connect(&self) -> Result<(), BrokerError> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.session.read().is_none() {
            self.inner.connected.store(false, Ordering::SeqCst);
            return Err(BrokerError::InvalidToken);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.feed_tx.write() = Some(tx);
        let _ = self.inner.shutdown.send(false);

        tokio::spawn(run_feed(self.inner.clone(), rx));
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        *self.inner.feed_tx.write() = None;
        self.inner.subs.write().clear();
        info!(broker = %self.inner.broker, "feed disconnected");
    }

    async fn subscribe(
        &self,
        symbol: &str,
        exchange: Exchange,
        mode: SubscriptionMode,
        _depth_level: Option<u8>,
    ) -> Result<(), BrokerError> {
        let key = Inner::wire_key(symbol, exchange);
        self.inner.subs.write().insert(
            key.clone(),
            FeedSub { symbol: symbol.to_string(), exchange, mode },
        );

        let frame = match mode {
            SubscriptionMode::Depth => json!({"t": "d", "k": key}),
            _ => json!({"t": "t", "k": key}),
        };
        self.send_feed_frame(frame.to_string())
    }

    async fn unsubscribe(
        &self,
        symbol: &str,
        exchange: Exchange,
        mode: SubscriptionMode,
    ) -> Result<(), BrokerError> {
        let key = Inner::wire_key(symbol, exchange);
        self.inner.subs.write().remove(&key);

        let frame = match mode {
            SubscriptionMode::Depth => json!({"t": "ud", "k": key}),
            _ => json!({"t": "u", "k": key}),
        };
        self.send_feed_frame(frame.to_string())
    }

    async fn unsubscribe_all(&self) -> Result<(), BrokerError> {
        let (touchline, depth): (Vec<String>, Vec<String>) = {
            let mut subs = self.inner.subs.write();
            let mut tl = Vec::new();
            let mut dp = Vec::new();
            for (key, sub) in subs.drain() {
                match sub.mode {
                    SubscriptionMode::Depth => dp.push(key),
                    _ => tl.push(key),
                }
            }
            (tl, dp)
        };

        // Unsubscribe frames only; the connection stays up (cooldown quirk).
        if !touchline.is_empty() {
            self.send_feed_frame(json!({"t": "u", "k": touchline.join("#")}).to_string())?;
        }
        if !depth.is_empty() {
            self.send_feed_frame(json!({"t": "ud", "k": depth.join("#")}).to_string())?;
        }
        debug!(broker = %self.inner.broker, "all subscriptions released, connection kept");
        Ok(())
    }
}

impl NorenAdapter {
    fn send_feed_frame(&self, frame: String) -> Result<(), BrokerError> {
        let tx = self.inner.feed_tx.read();
        match tx.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| BrokerError::Network("feed task gone".into())),
            None => {
                // Not connected yet — the frame will be replayed from the
                // subscription set on connect.
                warn!(broker = %self.inner.broker, "feed frame buffered until connect");
                Ok(())
            }
        }
    }
}

// =============================================================================
// Book row parsing
// =============================================================================

fn parse_exchange(v: &Value, key: &str) -> Option<Exchange> {
    v[key].as_str()?.parse().ok()
}

fn parse_order_row(r: &Value) -> Option<Order> {
    let status = match r["status"].as_str()? {
        "OPEN" | "TRIGGER_PENDING" | "PENDING" => crate::types::OrderStatus::Open,
        "COMPLETE" => crate::types::OrderStatus::Complete,
        "REJECTED" => crate::types::OrderStatus::Rejected,
        "CANCELED" | "CANCELLED" => crate::types::OrderStatus::Cancelled,
        _ => return None,
    };

    Some(Order {
        order_id: r["norenordno"].as_str()?.to_string(),
        user_id: String::new(),
        symbol: r["tsym"].as_str()?.to_string(),
        exchange: parse_exchange(r, "exch")?,
        action: if r["trantype"].as_str() == Some("B") {
            crate::types::OrderAction::Buy
        } else {
            crate::types::OrderAction::Sell
        },
        quantity: field_f64(r, "qty").unwrap_or(0.0) as u32,
        price_type: match r["prctyp"].as_str() {
            Some("MKT") => crate::types::PriceType::Market,
            Some("SL-LMT") => crate::types::PriceType::StopLoss,
            Some("SL-MKT") => crate::types::PriceType::StopLossMarket,
            _ => crate::types::PriceType::Limit,
        },
        price: field_f64(r, "prc"),
        trigger_price: field_f64(r, "trgprc"),
        product: match r["prd"].as_str() {
            Some("C") => crate::types::Product::Cnc,
            Some("M") => crate::types::Product::Nrml,
            _ => crate::types::Product::Mis,
        },
        status,
        filled_quantity: field_f64(r, "fillshares").unwrap_or(0.0) as u32,
        average_price: field_f64(r, "avgprc").unwrap_or(0.0),
        margin_blocked: 0.0,
        created_at: r["norentm"].as_str().unwrap_or_default().to_string(),
        updated_at: r["norentm"].as_str().unwrap_or_default().to_string(),
        broker_order_id: r["norenordno"].as_str().map(str::to_string),
    })
}

fn parse_trade_row(r: &Value) -> Option<Trade> {
    Some(Trade {
        trade_id: r["flid"].as_str().unwrap_or_default().to_string(),
        order_id: r["norenordno"].as_str()?.to_string(),
        symbol: r["tsym"].as_str()?.to_string(),
        exchange: parse_exchange(r, "exch")?,
        action: if r["trantype"].as_str() == Some("B") {
            crate::types::OrderAction::Buy
        } else {
            crate::types::OrderAction::Sell
        },
        quantity: field_f64(r, "flqty").unwrap_or(0.0) as u32,
        price: field_f64(r, "flprc").unwrap_or(0.0),
        product: match r["prd"].as_str() {
            Some("C") => crate::types::Product::Cnc,
            Some("M") => crate::types::Product::Nrml,
            _ => crate::types::Product::Mis,
        },
        timestamp: r["fltm"].as_str().unwrap_or_default().to_string(),
    })
}

fn parse_position_row(r: &Value) -> Option<Position> {
    Some(Position {
        user_id: String::new(),
        symbol: r["tsym"].as_str()?.to_string(),
        exchange: parse_exchange(r, "exch")?,
        product: match r["prd"].as_str() {
            Some("C") => crate::types::Product::Cnc,
            Some("M") => crate::types::Product::Nrml,
            _ => crate::types::Product::Mis,
        },
        net_quantity: field_f64(r, "netqty").unwrap_or(0.0) as i64,
        avg_price: field_f64(r, "netavgprc").unwrap_or(0.0),
        unrealized_pnl: field_f64(r, "urmtom").unwrap_or(0.0),
        realized_pnl: field_f64(r, "rpnl").unwrap_or(0.0),
        ltp: field_f64(r, "lp").unwrap_or(0.0),
    })
}

fn parse_holding_row(r: &Value) -> Option<Holding> {
    Some(Holding {
        user_id: String::new(),
        symbol: r["tsym"].as_str().or_else(|| r["sym"].as_str())?.to_string(),
        exchange: parse_exchange(r, "exch").unwrap_or(Exchange::Nse),
        quantity: field_f64(r, "npoadqty")
            .or_else(|| field_f64(r, "holdqty"))
            .unwrap_or(0.0) as i64,
        avg_price: field_f64(r, "upldprc").unwrap_or(0.0),
        ltp: field_f64(r, "lp").unwrap_or(0.0),
        pnl: 0.0,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MarketDataBus;

    fn adapter() -> (NorenAdapter, Arc<MarketDataBus>) {
        let bus = Arc::new(MarketDataBus::new("127.0.0.1:5555"));
        let publisher = bus.publisher("flattrade");
        (NorenAdapter::new("flattrade".into(), publisher), bus)
    }

    #[test]
    fn capabilities_mark_cooldown() {
        let caps = NorenAdapter::capabilities();
        assert!(caps.persistent_on_client_disconnect);
        assert_eq!(caps.authentication_style, AuthStyle::SessionToken);
        assert_eq!(caps.price_divisor, 1.0);
    }

    #[tokio::test]
    async fn touchline_update_publishes_canonical_ltp() {
        let (adapter, bus) = adapter();
        adapter
            .inner
            .subs
            .write()
            .insert(
                "NSE|RELIANCE".into(),
                FeedSub {
                    symbol: "RELIANCE".into(),
                    exchange: Exchange::Nse,
                    mode: SubscriptionMode::Ltp,
                },
            );

        let frame = r#"{"t":"tf","e":"NSE","ts":"RELIANCE","lp":"2450.50"}"#;
        let (topic, payload) = parse_feed_message(&adapter.inner, frame).unwrap();
        adapter.inner.publisher.publish(topic.clone(), payload);

        assert_eq!(topic.format(), "flattrade_NSE_RELIANCE_LTP");
        let msg = bus.try_recv().unwrap();
        assert_eq!(msg.payload.ltp, 2450.5);
        assert_eq!(msg.payload.symbol, "RELIANCE");
        assert!(msg.payload.quote.is_none());
    }

    #[tokio::test]
    async fn depth_update_carries_five_levels() {
        let (adapter, _bus) = adapter();
        adapter.inner.subs.write().insert(
            "NSE_INDEX|NIFTY".into(),
            FeedSub {
                symbol: "NIFTY".into(),
                exchange: Exchange::NseIndex,
                mode: SubscriptionMode::Depth,
            },
        );

        let frame = r#"{"t":"df","e":"NSE_INDEX","ts":"NIFTY","lp":"22000",
            "bp1":"21999","bq1":"50","bo1":"3","sp1":"22001","sq1":"25","so1":"1"}"#;
        let (topic, payload) = parse_feed_message(&adapter.inner, frame).unwrap();

        assert_eq!(topic.mode, SubscriptionMode::Depth);
        let depth = payload.depth.unwrap();
        assert_eq!(depth.buy.len(), 5);
        assert_eq!(depth.buy[0].price, 21999.0);
        assert_eq!(depth.sell[0].qty, 25.0);
    }

    #[tokio::test]
    async fn unknown_ticker_is_ignored() {
        let (adapter, _bus) = adapter();
        let frame = r#"{"t":"tf","e":"NSE","ts":"UNSUBSCRIBED","lp":"1.0"}"#;
        assert!(parse_feed_message(&adapter.inner, frame).is_none());
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_set_but_not_connection_flag() {
        let (adapter, _bus) = adapter();
        adapter.inner.connected.store(true, Ordering::SeqCst);
        adapter.inner.subs.write().insert(
            "NSE|SBIN".into(),
            FeedSub {
                symbol: "SBIN".into(),
                exchange: Exchange::Nse,
                mode: SubscriptionMode::Ltp,
            },
        );

        adapter.unsubscribe_all().await.unwrap();
        assert!(adapter.inner.subs.read().is_empty());
        assert!(adapter.inner.connected.load(Ordering::SeqCst));
    }

    #[test]
    fn order_row_maps_status_and_product() {
        let row = serde_json::json!({
            "norenordno": "24080100001",
            "tsym": "SBIN",
            "exch": "NSE",
            "trantype": "B",
            "qty": "10",
            "prctyp": "LMT",
            "prc": "500",
            "prd": "I",
            "status": "OPEN",
            "norentm": "09:30:01 01-08-2026"
        });
        let order = parse_order_row(&row).unwrap();
        assert_eq!(order.status, crate::types::OrderStatus::Open);
        assert_eq!(order.product, crate::types::Product::Mis);
        assert_eq!(order.quantity, 10);
        assert_eq!(order.price, Some(500.0));
    }
}
