// =============================================================================
// Order Router & Mode Gate — immediate vs queued routing per API key
// =============================================================================
//
// The gate, in order:
//   1. verify the key (identity carries the order mode)
//   2. rate-limit by operation category
//   3. sandbox users route to the sandbox engine, full stop
//   4. restricted operations are refused for Semi-Auto keys on the live path
//   5. immediate operations and Auto keys dispatch to the broker
//   6. queueable operations under Semi-Auto land in the Action Center
//
// UI-initiated calls (the user already holds a live broker session) skip the
// restriction check — direct control stays with the human.
// =============================================================================

pub mod action_center;
pub mod orders;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::AuthService;
use crate::broker::factory::AdapterFactory;
use crate::broker::{retry_once_on_transient, BrokerAdapter, BrokerError};
use crate::error::GatewayError;
use crate::ratelimit::{Category, RateLimiter};
use crate::types::{Exchange, OrderAction, OrderMode, OrderModify, OrderRequest, PriceType};

pub use action_center::{ActionCenter, ActionEvent, PendingOrder, PendingStatus};
pub use orders::OrdersStore;

// =============================================================================
// Operation classification (compile-time sets)
// =============================================================================

/// Operations that always dispatch immediately, whatever the order mode.
pub const IMMEDIATE_ALWAYS: &[&str] = &[
    "closeposition",
    "closeallpositions",
    "cancelorder",
    "cancelallorder",
    "modifyorder",
    "orderstatus",
    "orderbook",
    "tradebook",
    "positions",
    "holdings",
    "funds",
    "openposition",
];

/// Operations a Semi-Auto key queues into the Action Center.
pub const QUEUEABLE: &[&str] = &[
    "placeorder",
    "smartorder",
    "basketorder",
    "splitorder",
    "optionsorder",
    "optionsmultiorder",
];

/// Operations refused outright for Semi-Auto keys on the live path.
pub const RESTRICTED_IN_SEMI_AUTO: &[&str] = &[
    "closeposition",
    "cancelorder",
    "cancelallorder",
    "modifyorder",
    "analyzer/toggle",
];

pub fn is_immediate(api_type: &str) -> bool {
    IMMEDIATE_ALWAYS.contains(&api_type)
}

pub fn is_queueable(api_type: &str) -> bool {
    QUEUEABLE.contains(&api_type)
}

pub fn is_restricted(api_type: &str) -> bool {
    RESTRICTED_IN_SEMI_AUTO.contains(&api_type)
}

fn category_for(api_type: &str) -> Category {
    match api_type {
        "smartorder" => Category::SmartOrder,
        t if is_queueable(t) => Category::OrderPlacement,
        _ => Category::General,
    }
}

// =============================================================================
// Routing seams
// =============================================================================

/// Immediate dispatch into a live broker. The router talks through this seam
/// so tests can substitute a stub.
#[async_trait]
pub trait OrderDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        user_id: &str,
        api_type: &str,
        blob: &Value,
    ) -> Result<Value, GatewayError>;
}

/// The sandbox engine's request surface, as the router sees it.
#[async_trait]
pub trait SandboxRoute: Send + Sync {
    async fn handle(
        &self,
        user_id: &str,
        api_type: &str,
        blob: &Value,
    ) -> Result<Value, GatewayError>;
}

// =============================================================================
// Router
// =============================================================================

pub struct OrderRouter {
    auth: Arc<AuthService>,
    limiter: Arc<RateLimiter>,
    dispatcher: Arc<dyn OrderDispatcher>,
    sandbox: Arc<dyn SandboxRoute>,
    action_center: Arc<ActionCenter>,
}

impl OrderRouter {
    pub fn new(
        auth: Arc<AuthService>,
        limiter: Arc<RateLimiter>,
        dispatcher: Arc<dyn OrderDispatcher>,
        sandbox: Arc<dyn SandboxRoute>,
        action_center: Arc<ActionCenter>,
    ) -> Self {
        Self { auth, limiter, dispatcher, sandbox, action_center }
    }

    pub fn action_center(&self) -> &Arc<ActionCenter> {
        &self.action_center
    }

    /// Route an API request. `via_ui` marks calls from a session the user
    /// drives directly; those skip the Semi-Auto restriction check.
    pub async fn handle(
        &self,
        api_key: &str,
        api_type: &str,
        blob: &Value,
        via_ui: bool,
    ) -> Result<Value, GatewayError> {
        // 1. Identity.
        let identity = self.auth.verify_key(api_key)?;

        // 2. Rate limit by category.
        self.limiter.check(api_key, category_for(api_type))?;

        let sandbox_enabled = self
            .auth
            .store()
            .sandbox_enabled(&identity.user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        // The sandbox toggle is the router's own operation: restricted under
        // Semi-Auto on the live path, always available inside the sandbox.
        if api_type == "analyzer/toggle" {
            if !sandbox_enabled
                && identity.order_mode == OrderMode::SemiAuto
                && !via_ui
            {
                return Err(GatewayError::OperationNotAllowed { api_type: api_type.into() });
            }
            let next = !sandbox_enabled;
            self.auth
                .store()
                .set_sandbox_enabled(&identity.user_id, next)
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
            return Ok(json!({"status": "success", "analyzer_mode": next}));
        }

        // 3. Sandbox users never touch the live path.
        if sandbox_enabled {
            return self.sandbox.handle(&identity.user_id, api_type, blob).await;
        }

        // 4. Semi-Auto restriction on the live path.
        if !via_ui && identity.order_mode == OrderMode::SemiAuto && is_restricted(api_type) {
            warn!(
                user_id = %identity.user_id,
                api_type,
                "restricted operation refused in Semi-Auto mode"
            );
            return Err(GatewayError::OperationNotAllowed { api_type: api_type.into() });
        }

        // 5. Immediate operations and Auto keys dispatch now.
        if is_immediate(api_type) || identity.order_mode == OrderMode::Auto {
            return self.dispatcher.dispatch(&identity.user_id, api_type, blob).await;
        }

        // 6. Queueable + Semi-Auto: park it in the Action Center.
        if !is_queueable(api_type) {
            return Err(GatewayError::Internal(format!("unknown api_type {api_type}")));
        }

        let pending_id = self.action_center.enqueue(&identity.user_id, api_type, blob)?;
        Ok(json!({
            "status": "success",
            "message": "Order queued for approval in Action Center",
            "mode": "semi_auto",
            "pending_order_id": pending_id,
        }))
    }

    // -------------------------------------------------------------------------
    // Approval path
    // -------------------------------------------------------------------------

    /// Approve a pending order: ownership check, then re-invoke the
    /// immediate dispatch path with the original blob.
    pub async fn approve(&self, pending_id: i64, caller: &str) -> Result<Value, GatewayError> {
        let row = self.action_center.approve(pending_id, caller)?;

        let result = self
            .dispatcher
            .dispatch(&row.user_id, &row.api_type, &row.order_blob)
            .await?;

        let broker_order_id = result["orderid"].as_str().map(str::to_string);
        self.action_center
            .mark_approved(pending_id, caller, broker_order_id.as_deref())?;

        info!(pending_order_id = pending_id, "approved pending order dispatched");
        Ok(result)
    }

    /// Reject a pending order with a reason. Ownership enforced.
    pub fn reject(&self, pending_id: i64, caller: &str, reason: &str) -> Result<(), GatewayError> {
        self.action_center.reject(pending_id, caller, reason)
    }
}

impl std::fmt::Debug for OrderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderRouter").finish_non_exhaustive()
    }
}

// =============================================================================
// Live dispatcher
// =============================================================================

/// Dispatches immediate operations against the user's default broker. A
/// fresh adapter is created per call (REST operations carry no connection
/// state); credentials are decrypted, used, and dropped.
pub struct LiveDispatcher {
    auth: Arc<AuthService>,
    factory: Arc<AdapterFactory>,
    orders: Arc<OrdersStore>,
}

impl LiveDispatcher {
    pub fn new(auth: Arc<AuthService>, factory: Arc<AdapterFactory>, orders: Arc<OrdersStore>) -> Self {
        Self { auth, factory, orders }
    }

    async fn adapter_for(
        &self,
        user_id: &str,
    ) -> Result<(Arc<dyn BrokerAdapter>, String), GatewayError> {
        let (broker, _) = self
            .auth
            .store()
            .default_broker(user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or_else(|| GatewayError::Internal("no default broker binding".into()))?;

        let (adapter, _caps) = self.factory.create(&broker)?;
        let creds = self.auth.broker_credentials(user_id, &broker)?;
        adapter
            .initialize(creds)
            .await
            .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
        Ok((adapter, broker))
    }

    /// InvalidToken revokes the stored broker session before surfacing.
    fn map_broker_error(&self, user_id: &str, broker: &str, e: BrokerError) -> GatewayError {
        if e == BrokerError::InvalidToken {
            warn!(user_id, broker, "broker session invalid — revoking");
            let _ = self.auth.store().revoke_session(user_id, broker);
        }
        GatewayError::from(e)
    }

    fn parse_request(blob: &Value) -> Result<OrderRequest, GatewayError> {
        let request: OrderRequest = serde_json::from_value(blob.clone())
            .map_err(|e| GatewayError::Broker(BrokerError::InvalidInput(e.to_string())))?;
        if request.quantity == 0 {
            return Err(GatewayError::Broker(BrokerError::InvalidInput(
                "quantity must be positive".into(),
            )));
        }
        if request.price_type.needs_price() && request.price.is_none() {
            return Err(GatewayError::Broker(BrokerError::InvalidInput(
                format!("{} orders need a price", request.price_type),
            )));
        }
        if request.price_type.needs_trigger() && request.trigger_price.is_none() {
            return Err(GatewayError::Broker(BrokerError::InvalidInput(
                format!("{} orders need a trigger price", request.price_type),
            )));
        }
        Ok(request)
    }

    async fn place_one(
        &self,
        user_id: &str,
        broker: &str,
        adapter: &Arc<dyn BrokerAdapter>,
        request: &OrderRequest,
    ) -> Result<String, GatewayError> {
        let broker_order_id = adapter
            .place_order(request)
            .await
            .map_err(|e| self.map_broker_error(user_id, broker, e))?;
        self.orders
            .record_routed(user_id, request, &broker_order_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        Ok(broker_order_id)
    }
}

#[async_trait]
impl OrderDispatcher for LiveDispatcher {
    async fn dispatch(
        &self,
        user_id: &str,
        api_type: &str,
        blob: &Value,
    ) -> Result<Value, GatewayError> {
        let (adapter, broker) = self.adapter_for(user_id).await?;

        match api_type {
            "placeorder" | "optionsorder" => {
                let request = Self::parse_request(blob)?;
                let orderid = self.place_one(user_id, &broker, &adapter, &request).await?;
                Ok(json!({"status": "success", "orderid": orderid}))
            }

            // Smart order: when a target position size is given, trade only
            // the delta between it and the current net quantity.
            "smartorder" => {
                let mut request = Self::parse_request(blob)?;
                if let Some(target) = blob["position_size"].as_i64() {
                    let positions = adapter
                        .positions()
                        .await
                        .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                    let current = positions
                        .iter()
                        .find(|p| {
                            p.symbol == request.symbol
                                && p.exchange == request.exchange
                                && p.product == request.product
                        })
                        .map(|p| p.net_quantity)
                        .unwrap_or(0);

                    let delta = target - current;
                    if delta == 0 {
                        return Ok(json!({
                            "status": "success",
                            "message": "position already at target size",
                        }));
                    }
                    request.action =
                        if delta > 0 { OrderAction::Buy } else { OrderAction::Sell };
                    request.quantity = delta.unsigned_abs() as u32;
                }
                let orderid = self.place_one(user_id, &broker, &adapter, &request).await?;
                Ok(json!({"status": "success", "orderid": orderid}))
            }

            "basketorder" | "optionsmultiorder" => {
                let legs = blob["orders"].as_array().cloned().unwrap_or_default();
                let mut results = Vec::with_capacity(legs.len());
                for leg in &legs {
                    match Self::parse_request(leg) {
                        Ok(request) => {
                            match self.place_one(user_id, &broker, &adapter, &request).await {
                                Ok(orderid) => results.push(json!({
                                    "symbol": request.symbol,
                                    "status": "success",
                                    "orderid": orderid,
                                })),
                                Err(e) => results.push(json!({
                                    "symbol": request.symbol,
                                    "status": "error",
                                    "message": e.to_string(),
                                })),
                            }
                        }
                        Err(e) => results.push(json!({
                            "status": "error",
                            "message": e.to_string(),
                        })),
                    }
                }
                Ok(json!({"status": "success", "results": results}))
            }

            // Split a large order into broker-palatable chunks.
            "splitorder" => {
                let request = Self::parse_request(blob)?;
                let split_size = blob["splitsize"].as_u64().unwrap_or(0) as u32;
                if split_size == 0 {
                    return Err(GatewayError::Broker(BrokerError::InvalidInput(
                        "splitsize must be positive".into(),
                    )));
                }

                let mut remaining = request.quantity;
                let mut orderids = Vec::new();
                while remaining > 0 {
                    let chunk = remaining.min(split_size);
                    let mut part = request.clone();
                    part.quantity = chunk;
                    let orderid = self.place_one(user_id, &broker, &adapter, &part).await?;
                    orderids.push(orderid);
                    remaining -= chunk;
                }
                Ok(json!({"status": "success", "orderids": orderids}))
            }

            "modifyorder" => {
                let orderid = required_str(blob, "orderid")?;
                let fields: OrderModify = serde_json::from_value(blob.clone())
                    .map_err(|e| GatewayError::Broker(BrokerError::InvalidInput(e.to_string())))?;
                adapter
                    .modify_order(orderid, &fields)
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                Ok(json!({"status": "success", "orderid": orderid}))
            }

            "cancelorder" => {
                let orderid = required_str(blob, "orderid")?;
                adapter
                    .cancel_order(orderid)
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                self.orders
                    .update_status(orderid, crate::types::OrderStatus::Cancelled)
                    .ok();
                Ok(json!({"status": "success", "orderid": orderid}))
            }

            "cancelallorder" => {
                let book = adapter
                    .orderbook()
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                let mut cancelled = Vec::new();
                for order in book.iter().filter(|o| o.status == crate::types::OrderStatus::Open) {
                    let id = order.broker_order_id.as_deref().unwrap_or(&order.order_id);
                    if adapter.cancel_order(id).await.is_ok() {
                        cancelled.push(id.to_string());
                    }
                }
                Ok(json!({"status": "success", "cancelled": cancelled}))
            }

            "closeposition" | "closeallpositions" => {
                let positions = adapter
                    .positions()
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;

                let target_symbol = blob["symbol"].as_str();
                let mut closed = Vec::new();
                for position in positions.iter().filter(|p| p.net_quantity != 0) {
                    if api_type == "closeposition"
                        && target_symbol.is_some_and(|s| s != position.symbol)
                    {
                        continue;
                    }
                    let request = OrderRequest {
                        symbol: position.symbol.clone(),
                        exchange: position.exchange,
                        action: if position.net_quantity > 0 {
                            OrderAction::Sell
                        } else {
                            OrderAction::Buy
                        },
                        quantity: position.net_quantity.unsigned_abs() as u32,
                        price_type: PriceType::Market,
                        price: None,
                        trigger_price: None,
                        product: position.product,
                    };
                    let orderid = self.place_one(user_id, &broker, &adapter, &request).await?;
                    closed.push(json!({"symbol": position.symbol, "orderid": orderid}));
                }
                Ok(json!({"status": "success", "closed": closed}))
            }

            "orderstatus" => {
                let orderid = required_str(blob, "orderid")?;
                let order = self
                    .orders
                    .find(orderid)
                    .map_err(|e| GatewayError::Internal(e.to_string()))?
                    .ok_or_else(|| GatewayError::Internal(format!("order {orderid} not found")))?;
                Ok(json!({"status": "success", "data": order}))
            }

            "openposition" => {
                let symbol = required_str(blob, "symbol")?;
                let positions = retry_once_on_transient("positions", || adapter.positions())
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                let qty = positions
                    .iter()
                    .find(|p| p.symbol == symbol)
                    .map(|p| p.net_quantity)
                    .unwrap_or(0);
                Ok(json!({"status": "success", "quantity": qty}))
            }

            "orderbook" => {
                let book = retry_once_on_transient("orderbook", || adapter.orderbook())
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                Ok(json!({"status": "success", "data": book}))
            }

            "tradebook" => {
                let book = retry_once_on_transient("tradebook", || adapter.tradebook())
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                Ok(json!({"status": "success", "data": book}))
            }

            "positions" => {
                let data = retry_once_on_transient("positions", || adapter.positions())
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                Ok(json!({"status": "success", "data": data}))
            }

            "holdings" => {
                let data = retry_once_on_transient("holdings", || adapter.holdings())
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                Ok(json!({"status": "success", "data": data}))
            }

            "funds" => {
                let data = retry_once_on_transient("funds", || adapter.funds())
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                Ok(json!({"status": "success", "data": data}))
            }

            "quote" => {
                let symbol = required_str(blob, "symbol")?;
                let exchange = required_exchange(blob)?;
                let data = retry_once_on_transient("quote", || adapter.quote(symbol, exchange))
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                Ok(json!({"status": "success", "data": data}))
            }

            "depth" => {
                let symbol = required_str(blob, "symbol")?;
                let exchange = required_exchange(blob)?;
                let data = retry_once_on_transient("depth", || adapter.depth(symbol, exchange))
                    .await
                    .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                Ok(json!({"status": "success", "data": data}))
            }

            "history" => {
                let symbol = required_str(blob, "symbol")?;
                let exchange = required_exchange(blob)?;
                let interval = blob["interval"].as_str().unwrap_or("1m");
                let from = blob["from"].as_i64().unwrap_or(0);
                let to = blob["to"].as_i64().unwrap_or(0);
                let data = retry_once_on_transient("history", || {
                    adapter.history(symbol, exchange, interval, from, to)
                })
                .await
                .map_err(|e| self.map_broker_error(user_id, &broker, e))?;
                Ok(json!({"status": "success", "data": data}))
            }

            other => Err(GatewayError::Internal(format!("unknown api_type {other}"))),
        }
    }
}

impl std::fmt::Debug for LiveDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveDispatcher").finish_non_exhaustive()
    }
}

fn required_str<'a>(blob: &'a Value, key: &str) -> Result<&'a str, GatewayError> {
    blob[key]
        .as_str()
        .ok_or_else(|| GatewayError::Broker(BrokerError::InvalidInput(format!("missing {key}"))))
}

fn required_exchange(blob: &Value) -> Result<Exchange, GatewayError> {
    blob["exchange"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| GatewayError::Broker(BrokerError::InvalidInput("missing exchange".into())))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_sets_are_disjoint_where_required() {
        for op in QUEUEABLE {
            assert!(!is_immediate(op), "{op} cannot be both queueable and immediate");
        }
        // closeposition is deliberately in both immediate and restricted.
        assert!(is_immediate("closeposition"));
        assert!(is_restricted("closeposition"));
        assert!(is_restricted("analyzer/toggle"));
        assert!(!is_restricted("placeorder"));
    }

    #[test]
    fn category_mapping() {
        assert_eq!(category_for("placeorder"), Category::OrderPlacement);
        assert_eq!(category_for("basketorder"), Category::OrderPlacement);
        assert_eq!(category_for("smartorder"), Category::SmartOrder);
        assert_eq!(category_for("orderbook"), Category::General);
        assert_eq!(category_for("funds"), Category::General);
    }
}
