// =============================================================================
// XTS Adapter — dual-credential broker class, paise price scale
// =============================================================================
//
// XTS-class brokers segregate the interactive (order) API from the market
// data API behind separate credential pairs; `initialize` logs into both.
// Prices arrive in paise and are normalized with `price_divisor = 100`
// before anything leaves this adapter.
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
    ist_timestamp, Candle, DepthLevel, DepthLevels, Exchange, FundLimits, Holding, Order,
    OrderModify, OrderRequest, Position, QuoteFields, SubscriptionMode, TickPayload, Trade,
};

const REST_BASE: &str = "https://xts-api.trading/interactive";
const MARKET_BASE: &str = "https://xts-api.trading/apimarketdata";
const WS_URL: &str = "wss://xts-api.trading/apimarketdata/socket";

/// Upstream paise scale.
const PRICE_DIVISOR: f64 = 100.0;

struct Tokens {
    interactive: Zeroizing<String>,
    market: Zeroizing<String>,
}

#[derive(Clone)]
struct FeedSub {
    symbol: String,
    exchange: Exchange,
    mode: SubscriptionMode,
}

struct Inner {
    http: reqwest::Client,
    publisher: BusPublisher,
    tokens: RwLock<Option<Tokens>>,
    subs: RwLock<HashMap<String, FeedSub>>,
    feed_tx: RwLock<Option<mpsc::UnboundedSender<String>>>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

pub struct XtsAdapter {
    inner: Arc<Inner>,
}

impl XtsAdapter {
    pub fn new(publisher: BusPublisher) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(10))
                    .build()
                    .expect("failed to build reqwest client"),
                publisher,
                tokens: RwLock::new(None),
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
            price_divisor: PRICE_DIVISOR,
            persistent_on_client_disconnect: false,
            requires_market_data_creds: true,
            authentication_style: AuthStyle::ApiKeyPair,
        }
    }

    fn wire_key(symbol: &str, exchange: Exchange) -> String {
        format!("{}|{}", exchange.as_str(), symbol)
    }
}

impl Inner {
    async fn login_pair(
        &self,
        base: &str,
        key: &str,
        secret: &str,
    ) -> Result<Zeroizing<String>, BrokerError> {
        let resp = self
            .http
            .post(format!("{base}/user/session"))
            .json(&json!({ "appKey": key, "secretKey": secret, "source": "WebAPI" }))
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Network(format!("bad login body: {e}")))?;

        if body["type"].as_str() != Some("success") {
            return Err(BrokerError::InvalidToken);
        }
        body["result"]["token"]
            .as_str()
            .map(|t| Zeroizing::new(t.to_string()))
            .ok_or(BrokerError::InvalidToken)
    }

    /// Issue an authorized call against the interactive API.
    async fn interactive(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BrokerError> {
        let token = {
            let tokens = self.tokens.read();
            let tokens = tokens.as_ref().ok_or(BrokerError::InvalidToken)?;
            tokens.interactive.to_string()
        };

        let mut req = self
            .http
            .request(method, format!("{REST_BASE}{path}"))
            .header("Authorization", token);
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
        if value["type"].as_str() == Some("success") {
            Ok(value["result"].clone())
        } else {
            let desc = value["description"].as_str().unwrap_or("unknown").to_string();
            Err(BrokerError::InvalidInput(desc))
        }
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

        let token = match inner.tokens.read().as_ref() {
            Some(tokens) => tokens.market.to_string(),
            None => return,
        };
        let url = format!("{WS_URL}?token={token}");

        let result: anyhow::Result<()> = async {
            let (ws, _) = connect_async(&url).await?;
            info!("xts feed connected");
            let (mut write, mut read) = ws.split();

            // Replay current subscriptions.
            let keys: Vec<String> = inner.subs.read().keys().cloned().collect();
            if !keys.is_empty() {
                write
                    .send(WsMessage::Text(
                        json!({"action": "subscribe", "instruments": keys}).to_string(),
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
                                anyhow::bail!("xts feed closed by broker");
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
            error!(error = %e, "xts feed error — reconnecting in 5s");
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

/// XTS publishes paise; everything is normalized on the way out.
fn parse_feed_message(inner: &Arc<Inner>, text: &str) -> Option<(Topic, TickPayload)> {
    let v: Value = serde_json::from_str(text).ok()?;
    let instrument = v["instrument"].as_str()?;
    let sub = inner.subs.read().get(instrument).cloned()?;

    let ltp = v["ltp"].as_f64()?;
    let mut payload = TickPayload {
        symbol: sub.symbol.clone(),
        exchange: sub.exchange,
        ltp: normalize_price(ltp, PRICE_DIVISOR),
        timestamp: ist_timestamp(),
        quote: None,
        depth: None,
    };

    if sub.mode != SubscriptionMode::Ltp {
        payload.quote = Some(QuoteFields {
            open: normalize_price(v["open"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
            high: normalize_price(v["high"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
            low: normalize_price(v["low"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
            close: normalize_price(v["close"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
            volume: v["volume"].as_f64().unwrap_or(0.0),
            bid: normalize_price(v["bidPrice"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
            ask: normalize_price(v["askPrice"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
            bid_qty: v["bidQty"].as_f64().unwrap_or(0.0),
            ask_qty: v["askQty"].as_f64().unwrap_or(0.0),
        });
    }

    if sub.mode == SubscriptionMode::Depth {
        let ladder = |side: &str| -> Vec<DepthLevel> {
            v[side]
                .as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .map(|l| DepthLevel {
                            price: normalize_price(l["price"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
                            qty: l["qty"].as_f64().unwrap_or(0.0),
                            orders: l["orders"].as_u64().unwrap_or(0) as u32,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        payload.depth = Some(DepthLevels { buy: ladder("bids"), sell: ladder("asks") });
    }

    let topic = Topic::new("xts", sub.exchange, sub.symbol, sub.mode);
    Some((topic, payload))
}

// =============================================================================
// Adapter contract
// =============================================================================

#[async_trait]
impl BrokerAdapter for XtsAdapter {
    fn broker_name(&self) -> &str {
        "xts"
    }

    /// Logs into both APIs. The market-data pair is mandatory for this
    /// broker class.
    async fn initialize(&self, creds: BrokerCredentials) -> Result<(), BrokerError> {
        let market_key = creds
            .market_api_key
            .as_ref()
            .ok_or_else(|| BrokerError::InvalidInput("missing market data credentials".into()))?;
        let market_secret = creds
            .market_api_secret
            .as_ref()
            .ok_or_else(|| BrokerError::InvalidInput("missing market data credentials".into()))?;

        let interactive = self
            .inner
            .login_pair(REST_BASE, &creds.api_key, &creds.api_secret)
            .await?;
        let market = self
            .inner
            .login_pair(MARKET_BASE, market_key, market_secret)
            .await?;

        *self.inner.tokens.write() = Some(Tokens { interactive, market });
        debug!("xts sessions established (interactive + market data)");
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        let body = json!({
            "exchangeSegment": request.exchange.as_str(),
            "tradingSymbol": request.symbol,
            "orderSide": request.action.as_str(),
            "orderQuantity": request.quantity,
            "orderType": request.price_type.as_str(),
            "productType": request.product.as_str(),
            "limitPrice": request.price.unwrap_or(0.0),
            "stopPrice": request.trigger_price.unwrap_or(0.0),
            "timeInForce": "DAY",
        });
        let result =
            with_timeout(self.inner.interactive(reqwest::Method::POST, "/orders", Some(body)))
                .await
                .map_err(|e| match e {
                    BrokerError::InvalidInput(msg) => BrokerError::OrderRejected(msg),
                    other => other,
                })?;

        result["AppOrderID"]
            .as_u64()
            .map(|id| id.to_string())
            .or_else(|| result["AppOrderID"].as_str().map(str::to_string))
            .ok_or_else(|| BrokerError::OrderRejected("no order id in response".into()))
    }

    async fn modify_order(
        &self,
        broker_order_id: &str,
        fields: &OrderModify,
    ) -> Result<(), BrokerError> {
        let mut body = json!({ "appOrderID": broker_order_id });
        if let Some(qty) = fields.quantity {
            body["modifiedOrderQuantity"] = json!(qty);
        }
        if let Some(price) = fields.price {
            body["modifiedLimitPrice"] = json!(price);
        }
        if let Some(trigger) = fields.trigger_price {
            body["modifiedStopPrice"] = json!(trigger);
        }
        with_timeout(self.inner.interactive(reqwest::Method::PUT, "/orders", Some(body))).await?;
        Ok(())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let path = format!("/orders?appOrderID={broker_order_id}");
        with_timeout(self.inner.interactive(reqwest::Method::DELETE, &path, None)).await?;
        Ok(())
    }

    async fn orderbook(&self) -> Result<Vec<Order>, BrokerError> {
        let result =
            with_timeout(self.inner.interactive(reqwest::Method::GET, "/orders", None)).await?;
        Ok(result.as_array().cloned().unwrap_or_default().iter().filter_map(parse_order_row).collect())
    }

    async fn tradebook(&self) -> Result<Vec<Trade>, BrokerError> {
        let result =
            with_timeout(self.inner.interactive(reqwest::Method::GET, "/orders/trades", None))
                .await?;
        Ok(result.as_array().cloned().unwrap_or_default().iter().filter_map(parse_trade_row).collect())
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let result = with_timeout(self.inner.interactive(
            reqwest::Method::GET,
            "/portfolio/positions?dayOrNet=NetWise",
            None,
        ))
        .await?;
        let rows = result["positionList"].as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(parse_position_row).collect())
    }

    async fn holdings(&self) -> Result<Vec<Holding>, BrokerError> {
        let result = with_timeout(self.inner.interactive(
            reqwest::Method::GET,
            "/portfolio/holdings",
            None,
        ))
        .await?;
        let rows = result["holdingsList"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(Holding {
                    user_id: String::new(),
                    symbol: r["tradingSymbol"].as_str()?.to_string(),
                    exchange: Exchange::Nse,
                    quantity: r["holdingQuantity"].as_i64().unwrap_or(0),
                    avg_price: normalize_price(r["buyAvgPrice"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
                    ltp: 0.0,
                    pnl: 0.0,
                })
            })
            .collect())
    }

    async fn funds(&self) -> Result<FundLimits, BrokerError> {
        let result = with_timeout(self.inner.interactive(
            reqwest::Method::GET,
            "/user/balance",
            None,
        ))
        .await?;
        Ok(FundLimits {
            available_balance: result["netMarginAvailable"].as_f64().unwrap_or(0.0),
            used_margin: result["marginUtilized"].as_f64().unwrap_or(0.0),
            realized_pnl: result["realizedMTM"].as_f64().unwrap_or(0.0),
            unrealized_pnl: result["unrealizedMTM"].as_f64().unwrap_or(0.0),
        })
    }

    async fn quote(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError> {
        let path = format!(
            "/instruments/quotes?exchangeSegment={}&symbol={}",
            exchange.as_str(),
            symbol
        );
        let result = with_timeout(self.inner.interactive(reqwest::Method::GET, &path, None)).await?;

        let ltp = result["ltp"]
            .as_f64()
            .ok_or_else(|| BrokerError::InvalidInput("quote missing ltp".into()))?;
        Ok(
            TickPayload::ltp(symbol, exchange, normalize_price(ltp, PRICE_DIVISOR)).with_quote(
                QuoteFields {
                    open: normalize_price(result["open"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
                    high: normalize_price(result["high"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
                    low: normalize_price(result["low"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
                    close: normalize_price(result["close"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
                    volume: result["volume"].as_f64().unwrap_or(0.0),
                    bid: normalize_price(result["bidPrice"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
                    ask: normalize_price(result["askPrice"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
                    bid_qty: result["bidQty"].as_f64().unwrap_or(0.0),
                    ask_qty: result["askQty"].as_f64().unwrap_or(0.0),
                },
            ),
        )
    }

    async fn depth(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError> {
        // The quote endpoint carries the ladder for this broker class.
        self.quote(symbol, exchange).await
    }

    async fn history(
        &self,
        symbol: &str,
        exchange: Exchange,
        interval: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, BrokerError> {
        let path = format!(
            "/instruments/ohlc?exchangeSegment={}&symbol={}&startTime={}&endTime={}&compressionValue={}",
            exchange.as_str(),
            symbol,
            from,
            to,
            interval
        );
        let result = with_timeout(self.inner.interactive(reqwest::Method::GET, &path, None)).await?;
        let rows = result["dataReponse"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(Candle {
                    timestamp: r["timestamp"].as_i64()?,
                    open: normalize_price(r["open"].as_f64()?, PRICE_DIVISOR),
                    high: normalize_price(r["high"].as_f64()?, PRICE_DIVISOR),
                    low: normalize_price(r["low"].as_f64()?, PRICE_DIVISOR),
                    close: normalize_price(r["close"].as_f64()?, PRICE_DIVISOR),
                    volume: r["volume"].as_f64().unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.tokens.read().is_none() {
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
        info!("xts feed disconnected");
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
        self.send_feed_frame(json!({"action": "subscribe", "instruments": [key]}).to_string())
    }

    async fn unsubscribe(
        &self,
        symbol: &str,
        exchange: Exchange,
        _mode: SubscriptionMode,
    ) -> Result<(), BrokerError> {
        let key = Self::wire_key(symbol, exchange);
        self.inner.subs.write().remove(&key);
        self.send_feed_frame(json!({"action": "unsubscribe", "instruments": [key]}).to_string())
    }

    async fn unsubscribe_all(&self) -> Result<(), BrokerError> {
        let keys: Vec<String> = {
            let mut subs = self.inner.subs.write();
            let keys = subs.keys().cloned().collect();
            subs.clear();
            keys
        };
        if !keys.is_empty() {
            self.send_feed_frame(
                json!({"action": "unsubscribe", "instruments": keys}).to_string(),
            )?;
        }
        Ok(())
    }
}

impl XtsAdapter {
    fn send_feed_frame(&self, frame: String) -> Result<(), BrokerError> {
        if let Some(tx) = self.inner.feed_tx.read().as_ref() {
            tx.send(frame)
                .map_err(|_| BrokerError::Network("feed task gone".into()))?;
        }
        Ok(())
    }
}

// =============================================================================
// Row parsing
// =============================================================================

fn parse_order_row(r: &Value) -> Option<Order> {
    let status = match r["OrderStatus"].as_str()? {
        "New" | "Open" | "PendingNew" | "Replaced" => crate::types::OrderStatus::Open,
        "Filled" => crate::types::OrderStatus::Complete,
        "Rejected" => crate::types::OrderStatus::Rejected,
        "Cancelled" => crate::types::OrderStatus::Cancelled,
        _ => return None,
    };

    Some(Order {
        order_id: r["AppOrderID"].as_u64()?.to_string(),
        user_id: String::new(),
        symbol: r["TradingSymbol"].as_str()?.to_string(),
        exchange: r["ExchangeSegment"].as_str()?.parse().ok()?,
        action: if r["OrderSide"].as_str() == Some("BUY") {
            crate::types::OrderAction::Buy
        } else {
            crate::types::OrderAction::Sell
        },
        quantity: r["OrderQuantity"].as_u64().unwrap_or(0) as u32,
        price_type: match r["OrderType"].as_str() {
            Some("MARKET") => crate::types::PriceType::Market,
            Some("SL") => crate::types::PriceType::StopLoss,
            Some("SL-M") => crate::types::PriceType::StopLossMarket,
            _ => crate::types::PriceType::Limit,
        },
        price: r["OrderPrice"].as_f64().map(|p| normalize_price(p, PRICE_DIVISOR)),
        trigger_price: r["OrderStopPrice"].as_f64().map(|p| normalize_price(p, PRICE_DIVISOR)),
        product: match r["ProductType"].as_str() {
            Some("CNC") => crate::types::Product::Cnc,
            Some("NRML") => crate::types::Product::Nrml,
            _ => crate::types::Product::Mis,
        },
        status,
        filled_quantity: r["CumulativeQuantity"].as_u64().unwrap_or(0) as u32,
        average_price: normalize_price(r["OrderAverageTradedPrice"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
        margin_blocked: 0.0,
        created_at: r["OrderGeneratedDateTime"].as_str().unwrap_or_default().to_string(),
        updated_at: r["LastUpdateDateTime"].as_str().unwrap_or_default().to_string(),
        broker_order_id: r["AppOrderID"].as_u64().map(|id| id.to_string()),
    })
}

fn parse_trade_row(r: &Value) -> Option<Trade> {
    Some(Trade {
        trade_id: r["ExecutionID"].as_str().unwrap_or_default().to_string(),
        order_id: r["AppOrderID"].as_u64()?.to_string(),
        symbol: r["TradingSymbol"].as_str()?.to_string(),
        exchange: r["ExchangeSegment"].as_str()?.parse().ok()?,
        action: if r["OrderSide"].as_str() == Some("BUY") {
            crate::types::OrderAction::Buy
        } else {
            crate::types::OrderAction::Sell
        },
        quantity: r["LastTradedQuantity"].as_u64().unwrap_or(0) as u32,
        price: normalize_price(r["LastTradedPrice"].as_f64().unwrap_or(0.0), PRICE_DIVISOR),
        product: match r["ProductType"].as_str() {
            Some("CNC") => crate::types::Product::Cnc,
            Some("NRML") => crate::types::Product::Nrml,
            _ => crate::types::Product::Mis,
        },
        timestamp: r["ExecutionDateTime"].as_str().unwrap_or_default().to_string(),
    })
}

fn parse_position_row(r: &Value) -> Option<Position> {
    Some(Position {
        user_id: String::new(),
        symbol: r["TradingSymbol"].as_str()?.to_string(),
        exchange: r["ExchangeSegment"].as_str()?.parse().ok()?,
        product: match r["ProductType"].as_str() {
            Some("CNC") => crate::types::Product::Cnc,
            Some("NRML") => crate::types::Product::Nrml,
            _ => crate::types::Product::Mis,
        },
        net_quantity: r["Quantity"].as_i64().unwrap_or(0),
        avg_price: normalize_price(
            r["BuyAveragePrice"].as_f64().or_else(|| r["SellAveragePrice"].as_f64()).unwrap_or(0.0),
            PRICE_DIVISOR,
        ),
        unrealized_pnl: r["UnrealizedMTM"].as_f64().unwrap_or(0.0),
        realized_pnl: r["RealizedMTM"].as_f64().unwrap_or(0.0),
        ltp: 0.0,
    })
}

// =============================================================================
// Tests
// =============================================================================
