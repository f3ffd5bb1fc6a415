// =============================================================================
// Sandbox Engine — paper-trading execution, isolated from live brokers
// =============================================================================
//
// The sandbox answers the same operations a live broker does, against its
// own store and seed capital. Its only reach into the live side is the
// read-only quote path used to price fills and margin.
// =============================================================================

pub mod execution;
pub mod margin;
pub mod squareoff;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::router::SandboxRoute;
use crate::symbols::SymbolRegistry;
use crate::types::{Exchange, Order, OrderAction, OrderRequest, OrderStatus, PriceType};

pub use margin::{margin_price, required_margin, Leverages};
pub use store::{SandboxFunds, SandboxStore, SEED_CAPITAL};

/// Read-only access to live last-traded prices. The live implementation
/// rides the user's broker adapter; tests script it.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn ltp(
        &self,
        user_id: &str,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<f64, GatewayError>;
}

/// Quote source that rides the user's own broker adapter, read-only. A
/// fresh adapter is created per call and dropped with its credentials.
pub struct LiveQuoteSource {
    auth: Arc<crate::auth::AuthService>,
    factory: Arc<crate::broker::factory::AdapterFactory>,
}

impl LiveQuoteSource {
    pub fn new(
        auth: Arc<crate::auth::AuthService>,
        factory: Arc<crate::broker::factory::AdapterFactory>,
    ) -> Self {
        Self { auth, factory }
    }
}

#[async_trait]
impl QuoteSource for LiveQuoteSource {
    async fn ltp(
        &self,
        user_id: &str,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<f64, GatewayError> {
        let (broker, _) = self
            .auth
            .store()
            .default_broker(user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or_else(|| GatewayError::Internal("no default broker binding".into()))?;

        let (adapter, _caps) = self.factory.create(&broker)?;
        let creds = self.auth.broker_credentials(user_id, &broker)?;
        adapter.initialize(creds).await.map_err(GatewayError::from)?;
        let tick = adapter.quote(symbol, exchange).await.map_err(GatewayError::from)?;
        Ok(tick.ltp)
    }
}

pub struct SandboxEngine {
    store: Arc<SandboxStore>,
    quotes: Arc<dyn QuoteSource>,
    registry: Arc<SymbolRegistry>,
}

impl SandboxEngine {
    pub fn new(
        store: Arc<SandboxStore>,
        quotes: Arc<dyn QuoteSource>,
        registry: Arc<SymbolRegistry>,
    ) -> Self {
        Self { store, quotes, registry }
    }

    pub fn store(&self) -> &Arc<SandboxStore> {
        &self.store
    }

    pub fn quotes(&self) -> &Arc<dyn QuoteSource> {
        &self.quotes
    }

    pub fn registry(&self) -> &Arc<SymbolRegistry> {
        &self.registry
    }

    // -------------------------------------------------------------------------
    // Order placement
    // -------------------------------------------------------------------------

    /// Validate, margin, persist. MARKET orders execute immediately at LTP;
    /// everything else stays OPEN for the execution loop.
    pub async fn place_order(
        &self,
        user_id: &str,
        request: &OrderRequest,
    ) -> Result<Value, GatewayError> {
        // 1. Validation.
        let instrument = self.registry.resolve(&request.symbol, request.exchange)?;
        if request.quantity == 0 {
            return Err(GatewayError::Broker(crate::broker::BrokerError::InvalidInput(
                "quantity must be positive".into(),
            )));
        }
        if request.price_type.needs_price() && request.price.is_none() {
            return Err(GatewayError::Broker(crate::broker::BrokerError::InvalidInput(
                format!("{} orders need a price", request.price_type),
            )));
        }
        if request.price_type.needs_trigger() && request.trigger_price.is_none() {
            return Err(GatewayError::Broker(crate::broker::BrokerError::InvalidInput(
                format!("{} orders need a trigger price", request.price_type),
            )));
        }

        // 2. Current price.
        let ltp = self
            .quotes
            .ltp(user_id, &request.symbol, request.exchange)
            .await?;

        // 3. Margin.
        let price = margin_price(request, ltp)?;
        let underlying = if instrument.instrument_type.is_option() {
            instrument.strike.unwrap_or(ltp)
        } else {
            ltp
        };
        let leverages = Leverages::from_config(&self.store);
        let margin = required_margin(
            request,
            instrument.instrument_type,
            instrument.lot_size,
            price,
            underlying,
            &leverages,
        );

        // 4. Funds check.
        let mut funds = self
            .store
            .funds(user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        if margin > funds.available_balance {
            return Err(GatewayError::InsufficientFunds {
                required: margin,
                available: funds.available_balance,
            });
        }

        // 5. Block margin and persist OPEN.
        funds.available_balance -= margin;
        funds.used_margin += margin;
        self.store
            .write_funds(&funds)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        let order = Order {
            order_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symbol: request.symbol.clone(),
            exchange: request.exchange,
            action: request.action,
            quantity: request.quantity,
            price_type: request.price_type,
            price: request.price,
            trigger_price: request.trigger_price,
            product: request.product,
            status: OrderStatus::Open,
            filled_quantity: 0,
            average_price: 0.0,
            margin_blocked: margin,
            created_at: now.clone(),
            updated_at: now,
            broker_order_id: None,
        };
        self.store
            .insert_order(&order)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        info!(
            order_id = %order.order_id,
            user_id,
            symbol = %order.symbol,
            margin,
            "sandbox order accepted"
        );

        // 6. MARKET fills now.
        if request.price_type == PriceType::Market {
            execution::fill_order(&self.store, &order, ltp, &instrument, &leverages)
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
        }

        Ok(json!({"status": "success", "orderid": order.order_id}))
    }

    /// Cancel an OPEN order and release its margin.
    pub fn cancel_order(&self, user_id: &str, order_id: &str) -> Result<Value, GatewayError> {
        let order = self
            .store
            .find_order(order_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .filter(|o| o.user_id == user_id)
            .ok_or_else(|| GatewayError::Internal(format!("order {order_id} not found")))?;

        if !self
            .store
            .set_order_status(order_id, OrderStatus::Cancelled)
            .map_err(|e| GatewayError::Internal(e.to_string()))?
        {
            return Err(GatewayError::Internal(format!("order {order_id} is not open")));
        }

        let mut funds = self
            .store
            .funds(user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        funds.available_balance += order.margin_blocked;
        funds.used_margin -= order.margin_blocked;
        self.store
            .write_funds(&funds)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(json!({"status": "success", "orderid": order_id}))
    }

    /// Reverse a position at the current LTP with a MARKET order.
    async fn close_position(
        &self,
        user_id: &str,
        symbol: &str,
        exchange: Exchange,
        product: crate::types::Product,
    ) -> Result<Option<String>, GatewayError> {
        let (position, _) = self
            .store
            .position(user_id, symbol, exchange, product)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        if position.net_quantity == 0 {
            return Ok(None);
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            exchange,
            action: if position.net_quantity > 0 { OrderAction::Sell } else { OrderAction::Buy },
            quantity: position.net_quantity.unsigned_abs() as u32,
            price_type: PriceType::Market,
            price: None,
            trigger_price: None,
            product,
        };
        let result = self.place_order(user_id, &request).await?;
        Ok(result["orderid"].as_str().map(str::to_string))
    }
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine").field("store", &self.store).finish()
    }
}

// =============================================================================
// Router surface
// =============================================================================

#[async_trait]
impl SandboxRoute for SandboxEngine {
    async fn handle(
        &self,
        user_id: &str,
        api_type: &str,
        blob: &Value,
    ) -> Result<Value, GatewayError> {
        match api_type {
            "placeorder" | "smartorder" | "optionsorder" => {
                let request: OrderRequest = serde_json::from_value(blob.clone()).map_err(|e| {
                    GatewayError::Broker(crate::broker::BrokerError::InvalidInput(e.to_string()))
                })?;
                self.place_order(user_id, &request).await
            }

            "basketorder" | "optionsmultiorder" => {
                let legs = blob["orders"].as_array().cloned().unwrap_or_default();
                let mut results = Vec::with_capacity(legs.len());
                for leg in &legs {
                    let outcome = match serde_json::from_value::<OrderRequest>(leg.clone()) {
                        Ok(request) => self.place_order(user_id, &request).await,
                        Err(e) => Err(GatewayError::Broker(
                            crate::broker::BrokerError::InvalidInput(e.to_string()),
                        )),
                    };
                    results.push(match outcome {
                        Ok(v) => v,
                        Err(e) => json!({"status": "error", "message": e.to_string()}),
                    });
                }
                Ok(json!({"status": "success", "results": results}))
            }

            "splitorder" => {
                let request: OrderRequest = serde_json::from_value(blob.clone()).map_err(|e| {
                    GatewayError::Broker(crate::broker::BrokerError::InvalidInput(e.to_string()))
                })?;
                let split = blob["splitsize"].as_u64().unwrap_or(0) as u32;
                if split == 0 {
                    return Err(GatewayError::Broker(
                        crate::broker::BrokerError::InvalidInput("splitsize must be positive".into()),
                    ));
                }
                let mut remaining = request.quantity;
                let mut orderids = Vec::new();
                while remaining > 0 {
                    let mut part = request.clone();
                    part.quantity = remaining.min(split);
                    let result = self.place_order(user_id, &part).await?;
                    if let Some(id) = result["orderid"].as_str() {
                        orderids.push(id.to_string());
                    }
                    remaining -= part.quantity;
                }
                Ok(json!({"status": "success", "orderids": orderids}))
            }

            "modifyorder" | "cancelorder" => {
                let order_id = blob["orderid"].as_str().ok_or_else(|| {
                    GatewayError::Broker(crate::broker::BrokerError::InvalidInput(
                        "missing orderid".into(),
                    ))
                })?;
                if api_type == "cancelorder" {
                    self.cancel_order(user_id, order_id)
                } else {
                    // Modify is cancel-and-replace against the same id flow.
                    self.cancel_order(user_id, order_id)?;
                    let request: OrderRequest =
                        serde_json::from_value(blob.clone()).map_err(|e| {
                            GatewayError::Broker(crate::broker::BrokerError::InvalidInput(
                                e.to_string(),
                            ))
                        })?;
                    self.place_order(user_id, &request).await
                }
            }

            "cancelallorder" => {
                let orders = self
                    .store
                    .orders_for_user(user_id)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                let mut cancelled = Vec::new();
                for order in orders.iter().filter(|o| o.status == OrderStatus::Open) {
                    if self.cancel_order(user_id, &order.order_id).is_ok() {
                        cancelled.push(order.order_id.clone());
                    }
                }
                Ok(json!({"status": "success", "cancelled": cancelled}))
            }

            "closeposition" => {
                let symbol = blob["symbol"].as_str().unwrap_or_default();
                let exchange: Exchange = blob["exchange"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Exchange::Nse);
                let product = match blob["product"].as_str() {
                    Some("CNC") => crate::types::Product::Cnc,
                    Some("NRML") => crate::types::Product::Nrml,
                    _ => crate::types::Product::Mis,
                };
                let orderid = self.close_position(user_id, symbol, exchange, product).await?;
                Ok(json!({"status": "success", "orderid": orderid}))
            }

            "closeallpositions" => {
                let positions = self
                    .store
                    .positions_for_user(user_id)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                let mut closed = Vec::new();
                for position in positions.iter().filter(|p| p.net_quantity != 0) {
                    if let Some(orderid) = self
                        .close_position(user_id, &position.symbol, position.exchange, position.product)
                        .await?
                    {
                        closed.push(json!({"symbol": position.symbol, "orderid": orderid}));
                    }
                }
                Ok(json!({"status": "success", "closed": closed}))
            }

            "orderbook" => {
                let orders = self
                    .store
                    .orders_for_user(user_id)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                Ok(json!({"status": "success", "data": orders}))
            }

            "orderstatus" => {
                let order_id = blob["orderid"].as_str().unwrap_or_default();
                let order = self
                    .store
                    .find_order(order_id)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?
                    .filter(|o| o.user_id == user_id)
                    .ok_or_else(|| {
                        GatewayError::Internal(format!("order {order_id} not found"))
                    })?;
                Ok(json!({"status": "success", "data": order}))
            }

            "tradebook" => {
                let trades = self
                    .store
                    .trades_for_user(user_id)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                Ok(json!({"status": "success", "data": trades}))
            }

            "positions" | "openposition" => {
                let positions = self
                    .store
                    .positions_for_user(user_id)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                if api_type == "openposition" {
                    let symbol = blob["symbol"].as_str().unwrap_or_default();
                    let qty = positions
                        .iter()
                        .find(|p| p.symbol == symbol)
                        .map(|p| p.net_quantity)
                        .unwrap_or(0);
                    return Ok(json!({"status": "success", "quantity": qty}));
                }
                Ok(json!({"status": "success", "data": positions}))
            }

            "holdings" => {
                let holdings = self
                    .store
                    .holdings_for_user(user_id)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                Ok(json!({"status": "success", "data": holdings}))
            }

            "funds" => {
                let funds = self
                    .store
                    .funds(user_id)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                Ok(json!({"status": "success", "data": funds}))
            }

            "quote" | "depth" => {
                let symbol = blob["symbol"].as_str().unwrap_or_default();
                let exchange: Exchange = blob["exchange"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(Exchange::Nse);
                let ltp = self.quotes.ltp(user_id, symbol, exchange).await?;
                Ok(json!({"status": "success", "data": {"symbol": symbol, "ltp": ltp}}))
            }

            other => Err(GatewayError::Internal(format!(
                "api_type {other} not supported in sandbox"
            ))),
        }
    }
}
