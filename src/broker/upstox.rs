// =============================================================================
// Upstox Adapter — OAuth2 bearer broker, widest feed connections
// =============================================================================
//
// The access token arrives from the OAuth2 dance handled outside the
// adapter; `initialize` installs it and every REST call carries it as a
// Bearer header. A 401 anywhere maps to InvalidToken, which revokes the
// stored session upstream.
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
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::broker::{
    normalize_price, with_timeout, AuthStyle, BrokerAdapter, BrokerCapabilities,
    BrokerCredentials, BrokerError,
};
use crate::bus::{BusPublisher, Topic};
use crate::types::{
    ist_timestamp, Candle, Exchange, FundLimits, Holding, Order, OrderModify, OrderRequest,
    Position, QuoteFields, SubscriptionMode, TickPayload, Trade,
};

const REST_BASE: &str = "https://api.upstox.com/v2";
const WS_URL: &str = "wss://api.upstox.com/v2/feed/market-data-feed";

#[derive(Clone)]
struct FeedSub {
    symbol: String,
    exchange: Exchange,
    mode: SubscriptionMode,
}

struct Inner {
    http: reqwest::Client,
    publisher: BusPublisher,
    token: RwLock<Option<Zeroizing<String>>>,
    subs: RwLock<HashMap<String, FeedSub>>,
    feed_tx: RwLock<Option<mpsc::UnboundedSender<String>>>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

pub struct UpstoxAdapter {
    inner: Arc<Inner>,
}

impl UpstoxAdapter {
    pub fn new(publisher: BusPublisher) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(10))
                    .build()
                    .expect("failed to build reqwest client"),
                publisher,
                token: RwLock::new(None),
                subs: RwLock::new(HashMap::new()),
                feed_tx: RwLock::new(None),
                connected: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn capabilities() -> BrokerCapabilities {
        BrokerCapabilities {
            max_symbols_per_connection: 3000,
            price_divisor: 1.0,
            persistent_on_client_disconnect: false,
            requires_market_data_creds: false,
            authentication_style: AuthStyle::OAuth2,
        }
    }

    fn wire_key(symbol: &str, exchange: Exchange) -> String {
        format!("{}|{}", exchange.as_str(), symbol)
    }
}

impl Inner {
    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BrokerError> {
        let bearer = {
            let token = self.token.read();
            let token = token.as_ref().ok_or(BrokerError::InvalidToken)?;
            format!("Bearer {}", token.as_str())
        };

        let mut req = self
            .http
            .request(method, format!("{REST_BASE}{path}"))
            .header("Authorization", bearer)
            .header("Accept", "application/json");
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|e| BrokerError::Network(e.to_string()))?;
        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Network(format!("bad response body: {e}")))?;

        if status.as_u16() == 401 {
            return Err(BrokerError::InvalidToken);
        }
        if value["status"].as_str() == Some("success") {
            Ok(value["data"].clone())
        } else {
            let msg = value["errors"][0]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string();
            Err(BrokerError::InvalidInput(msg))
        }
    }
}

async fn run_feed(inner: Arc<Inner>, mut outgoing: mpsc::UnboundedReceiver<String>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let url = {
            let token = inner.token.read();
            match token.as_ref() {
                Some(t) => format!("{WS_URL}?token={}", t.as_str()),
                None => return,
            }
        };

        let result: anyhow::Result<()> = async {
            let (ws, _) = connect_async(&url).await?;
            info!("upstox feed connected");
            let (mut write, mut read) = ws.split();

            let keys: Vec<String> = inner.subs.read().keys().cloned().collect();
            if !keys.is_empty() {
                write
                    .send(WsMessage::Text(
                        json!({"method": "sub", "instrumentKeys": keys}).to_string(),
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
                                if let Some((topic, payload)) = parse_feed_message(&inner, &text) {
                                    inner.publisher.publish(topic, payload);
                                }
                            }
                            Some(Ok(WsMessage::Ping(data))) => {
                                write.send(WsMessage::Pong(data)).await?;
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                anyhow::bail!("upstox feed closed by broker");
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => return Err(e.into()),
                        }
                    }
                }
            }
        }
        .await;

        if let Err(e) = result {
            error!(error = %e, "upstox feed error — reconnecting in 5s");
        } else {
            return;
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

fn parse_feed_message(inner: &Arc<Inner>, text: &str) -> Option<(Topic, TickPayload)> {
    let v: Value = serde_json::from_str(text).ok()?;
    let key = v["instrumentKey"].as_str()?;
    let sub = inner.subs.read().get(key).cloned()?;

    let ltp = v["ltp"].as_f64()?;
    let mut payload = TickPayload {
        symbol: sub.symbol.clone(),
        exchange: sub.exchange,
        ltp: normalize_price(ltp, 1.0),
        timestamp: ist_timestamp(),
        quote: None,
        depth: None,
    };

    if sub.mode != SubscriptionMode::Ltp {
        let ohlc = &v["ohlc"];
        payload.quote = Some(QuoteFields {
            open: ohlc["open"].as_f64().unwrap_or(0.0),
            high: ohlc["high"].as_f64().unwrap_or(0.0),
            low: ohlc["low"].as_f64().unwrap_or(0.0),
            close: ohlc["close"].as_f64().unwrap_or(0.0),
            volume: v["volume"].as_f64().unwrap_or(0.0),
            bid: v["bidPrice"].as_f64().unwrap_or(0.0),
            ask: v["askPrice"].as_f64().unwrap_or(0.0),
            bid_qty: v["bidQty"].as_f64().unwrap_or(0.0),
            ask_qty: v["askQty"].as_f64().unwrap_or(0.0),
        });
    }

    let topic = Topic::new("upstox", sub.exchange, sub.symbol, sub.mode);
    Some((topic, payload))
}

#[async_trait]
impl BrokerAdapter for UpstoxAdapter {
    fn broker_name(&self) -> &str {
        "upstox"
    }

    async fn initialize(&self, creds: BrokerCredentials) -> Result<(), BrokerError> {
        let token = creds
            .access_token
            .as_ref()
            .ok_or_else(|| BrokerError::InvalidInput("missing OAuth2 access token".into()))?;
        *self.inner.token.write() = Some(Zeroizing::new(token.to_string()));
        debug!("upstox bearer installed");
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        let body = json!({
            "instrument_token": format!("{}|{}", request.exchange.as_str(), request.symbol),
            "transaction_type": request.action.as_str(),
            "quantity": request.quantity,
            "order_type": request.price_type.as_str(),
            "product": request.product.as_str(),
            "price": request.price.unwrap_or(0.0),
            "trigger_price": request.trigger_price.unwrap_or(0.0),
            "validity": "DAY",
            "is_amo": false,
        });
        let data = with_timeout(self.inner.call(reqwest::Method::POST, "/order/place", Some(body)))
            .await
            .map_err(|e| match e {
                BrokerError::InvalidInput(msg) => BrokerError::OrderRejected(msg),
                other => other,
            })?;
        data["order_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::OrderRejected("no order id in response".into()))
    }

    async fn modify_order(
        &self,
        broker_order_id: &str,
        fields: &OrderModify,
    ) -> Result<(), BrokerError> {
        let mut body = json!({ "order_id": broker_order_id });
        if let Some(qty) = fields.quantity {
            body["quantity"] = json!(qty);
        }
        if let Some(price) = fields.price {
            body["price"] = json!(price);
        }
        if let Some(trigger) = fields.trigger_price {
            body["trigger_price"] = json!(trigger);
        }
        if let Some(pt) = fields.price_type {
            body["order_type"] = json!(pt.as_str());
        }
        with_timeout(self.inner.call(reqwest::Method::PUT, "/order/modify", Some(body))).await?;
        Ok(())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let path = format!("/order/cancel?order_id={broker_order_id}");
        with_timeout(self.inner.call(reqwest::Method::DELETE, &path, None)).await?;
        Ok(())
    }

    async fn orderbook(&self) -> Result<Vec<Order>, BrokerError> {
        let data =
            with_timeout(self.inner.call(reqwest::Method::GET, "/order/retrieve-all", None)).await?;
        Ok(data.as_array().cloned().unwrap_or_default().iter().filter_map(parse_order_row).collect())
    }

    async fn tradebook(&self) -> Result<Vec<Trade>, BrokerError> {
        let data = with_timeout(self.inner.call(
            reqwest::Method::GET,
            "/order/trades/get-trades-for-day",
            None,
        ))
        .await?;
        Ok(data
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|r| {
                Some(Trade {
                    trade_id: r["trade_id"].as_str()?.to_string(),
                    order_id: r["order_id"].as_str()?.to_string(),
                    symbol: r["tradingsymbol"].as_str()?.to_string(),
                    exchange: r["exchange"].as_str()?.parse().ok()?,
                    action: if r["transaction_type"].as_str() == Some("BUY") {
                        crate::types::OrderAction::Buy
                    } else {
                        crate::types::OrderAction::Sell
                    },
                    quantity: r["quantity"].as_u64().unwrap_or(0) as u32,
                    price: r["average_price"].as_f64().unwrap_or(0.0),
                    product: parse_product(r),
                    timestamp: r["order_timestamp"].as_str().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let data = with_timeout(self.inner.call(
            reqwest::Method::GET,
            "/portfolio/short-term-positions",
            None,
        ))
        .await?;
        Ok(data
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|r| {
                Some(Position {
                    user_id: String::new(),
                    symbol: r["tradingsymbol"].as_str()?.to_string(),
                    exchange: r["exchange"].as_str()?.parse().ok()?,
                    product: parse_product(r),
                    net_quantity: r["quantity"].as_i64().unwrap_or(0),
                    avg_price: r["average_price"].as_f64().unwrap_or(0.0),
                    unrealized_pnl: r["unrealised"].as_f64().unwrap_or(0.0),
                    realized_pnl: r["realised"].as_f64().unwrap_or(0.0),
                    ltp: r["last_price"].as_f64().unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn holdings(&self) -> Result<Vec<Holding>, BrokerError> {
        let data = with_timeout(self.inner.call(
            reqwest::Method::GET,
            "/portfolio/long-term-holdings",
            None,
        ))
        .await?;
        Ok(data
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|r| {
                Some(Holding {
                    user_id: String::new(),
                    symbol: r["tradingsymbol"].as_str()?.to_string(),
                    exchange: r["exchange"].as_str().unwrap_or("NSE").parse().ok()?,
                    quantity: r["quantity"].as_i64().unwrap_or(0),
                    avg_price: r["average_price"].as_f64().unwrap_or(0.0),
                    ltp: r["last_price"].as_f64().unwrap_or(0.0),
                    pnl: r["pnl"].as_f64().unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn funds(&self) -> Result<FundLimits, BrokerError> {
        let data = with_timeout(self.inner.call(
            reqwest::Method::GET,
            "/user/get-funds-and-margin",
            None,
        ))
        .await?;
        let equity = &data["equity"];
        Ok(FundLimits {
            available_balance: equity["available_margin"].as_f64().unwrap_or(0.0),
            used_margin: equity["used_margin"].as_f64().unwrap_or(0.0),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        })
    }

    async fn quote(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError> {
        let key = Self::wire_key(symbol, exchange);
        let path = format!("/market-quote/quotes?instrument_key={key}");
        let data = with_timeout(self.inner.call(reqwest::Method::GET, &path, None)).await?;
        let q = &data[&key];

        let ltp = q["last_price"]
            .as_f64()
            .ok_or_else(|| BrokerError::InvalidInput("quote missing last price".into()))?;
        let ohlc = &q["ohlc"];
        Ok(TickPayload::ltp(symbol, exchange, normalize_price(ltp, 1.0)).with_quote(QuoteFields {
            open: ohlc["open"].as_f64().unwrap_or(0.0),
            high: ohlc["high"].as_f64().unwrap_or(0.0),
            low: ohlc["low"].as_f64().unwrap_or(0.0),
            close: ohlc["close"].as_f64().unwrap_or(0.0),
            volume: q["volume"].as_f64().unwrap_or(0.0),
            bid: q["depth"]["buy"][0]["price"].as_f64().unwrap_or(0.0),
            ask: q["depth"]["sell"][0]["price"].as_f64().unwrap_or(0.0),
            bid_qty: q["depth"]["buy"][0]["quantity"].as_f64().unwrap_or(0.0),
            ask_qty: q["depth"]["sell"][0]["quantity"].as_f64().unwrap_or(0.0),
        }))
    }

    async fn depth(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError> {
        self.quote(symbol, exchange).await
    }

    async fn history(
        &self,
        symbol: &str,
        exchange: Exchange,
        interval: &str,
        _from: i64,
        _to: i64,
    ) -> Result<Vec<Candle>, BrokerError> {
        let key = Self::wire_key(symbol, exchange);
        let path = format!("/historical-candle/{key}/{interval}");
        let data = with_timeout(self.inner.call(reqwest::Method::GET, &path, None)).await?;
        let rows = data["candles"].as_array().cloned().unwrap_or_default();

        Ok(rows
            .iter()
            .filter_map(|r| {
                let arr = r.as_array()?;
                Some(Candle {
                    timestamp: chrono::DateTime::parse_from_rfc3339(arr.first()?.as_str()?)
                        .ok()?
                        .timestamp(),
                    open: arr.get(1)?.as_f64()?,
                    high: arr.get(2)?.as_f64()?,
                    low: arr.get(3)?.as_f64()?,
                    close: arr.get(4)?.as_f64()?,
                    volume: arr.get(5).and_then(Value::as_f64).unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.token.read().is_none() {
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
        info!("upstox feed disconnected");
    }

    async fn subscribe(
        &self,
        symbol: &str,
        exchange: Exchange,
        mode: SubscriptionMode,
        _depth_level: Option<u8>,
    ) -> Result<(), BrokerError> {
        let key = Self::wire_key(symbol, exchange);
        self.inner.subs.write().insert(
            key.clone(),
            FeedSub { symbol: symbol.to_string(), exchange, mode },
        );
        self.send_feed_frame(json!({"method": "sub", "instrumentKeys": [key]}).to_string())
    }

    async fn unsubscribe(
        &self,
        symbol: &str,
        exchange: Exchange,
        _mode: SubscriptionMode,
    ) -> Result<(), BrokerError> {
        let key = Self::wire_key(symbol, exchange);
        self.inner.subs.write().remove(&key);
        self.send_feed_frame(json!({"method": "unsub", "instrumentKeys": [key]}).to_string())
    }

    async fn unsubscribe_all(&self) -> Result<(), BrokerError> {
        let keys: Vec<String> = {
            let mut subs = self.inner.subs.write();
            let keys = subs.keys().cloned().collect();
            subs.clear();
            keys
        };
        if !keys.is_empty() {
            self.send_feed_frame(json!({"method": "unsub", "instrumentKeys": keys}).to_string())?;
        }
        Ok(())
    }
}

impl UpstoxAdapter {
    fn send_feed_frame(&self, frame: String) -> Result<(), BrokerError> {
        if let Some(tx) = self.inner.feed_tx.read().as_ref() {
            tx.send(frame)
                .map_err(|_| BrokerError::Network("feed task gone".into()))?;
        }
        Ok(())
    }
}

fn parse_product(r: &Value) -> crate::types::Product {
    match r["product"].as_str() {
        Some("D") | Some("CNC") => crate::types::Product::Cnc,
        Some("NRML") => crate::types::Product::Nrml,
        _ => crate::types::Product::Mis,
    }
}

fn parse_order_row(r: &Value) -> Option<Order> {
    let status = match r["status"].as_str()? {
        "open" | "trigger pending" | "pending" => crate::types::OrderStatus::Open,
        "complete" => crate::types::OrderStatus::Complete,
        "rejected" => crate::types::OrderStatus::Rejected,
        "cancelled" => crate::types::OrderStatus::Cancelled,
        _ => return None,
    };

    Some(Order {
        order_id: r["order_id"].as_str()?.to_string(),
        user_id: String::new(),
        symbol: r["tradingsymbol"].as_str()?.to_string(),
        exchange: r["exchange"].as_str()?.parse().ok()?,
        action: if r["transaction_type"].as_str() == Some("BUY") {
            crate::types::OrderAction::Buy
        } else {
            crate::types::OrderAction::Sell
        },
        quantity: r["quantity"].as_u64().unwrap_or(0) as u32,
        price_type: match r["order_type"].as_str() {
            Some("MARKET") => crate::types::PriceType::Market,
            Some("SL") => crate::types::PriceType::StopLoss,
            Some("SL-M") => crate::types::PriceType::StopLossMarket,
            _ => crate::types::PriceType::Limit,
        },
        price: r["price"].as_f64(),
        trigger_price: r["trigger_price"].as_f64(),
        product: parse_product(r),
        status,
        filled_quantity: r["filled_quantity"].as_u64().unwrap_or(0) as u32,
        average_price: r["average_price"].as_f64().unwrap_or(0.0),
        margin_blocked: 0.0,
        created_at: r["order_timestamp"].as_str().unwrap_or_default().to_string(),
        updated_at: r["order_timestamp"].as_str().unwrap_or_default().to_string(),
        broker_order_id: r["order_id"].as_str().map(str::to_string),
    })
}

// =============================================================================
// Tests
// =============================================================================
