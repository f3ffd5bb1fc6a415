// =============================================================================
// Live Order Store — gateway-side records of broker-routed orders
// =============================================================================
//
// The broker is the source of truth for execution; these rows exist so the
// gateway can answer order-status queries and correlate approvals with
// broker order ids.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::types::{Order, OrderRequest, OrderStatus};

pub struct OrdersStore {
    db_path: String,
}

impl OrdersStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Self { db_path: db_path.to_string() };
        store.init_db()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("failed to open orders store at {}", self.db_path))
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                action TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price_type TEXT NOT NULL,
                price REAL,
                trigger_price REAL,
                product TEXT NOT NULL,
                status TEXT NOT NULL,
                filled_quantity INTEGER NOT NULL DEFAULT 0,
                average_price REAL NOT NULL DEFAULT 0,
                broker_order_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Record a freshly routed order as OPEN with its broker id.
    pub fn record_routed(
        &self,
        user_id: &str,
        request: &OrderRequest,
        broker_order_id: &str,
    ) -> Result<String> {
        let order_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO orders (order_id, user_id, symbol, exchange, action, quantity,
                price_type, price, trigger_price, product, status, broker_order_id,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                order_id,
                user_id,
                request.symbol,
                request.exchange.as_str(),
                request.action.as_str(),
                request.quantity,
                request.price_type.as_str(),
                request.price,
                request.trigger_price,
                request.product.as_str(),
                OrderStatus::Open.as_str(),
                broker_order_id,
                now,
            ],
        )?;
        Ok(order_id)
    }

    /// Transition an order's status. Terminal states are absorbing: a row
    /// already terminal is left untouched.
    pub fn update_status(&self, order_id: &str, status: OrderStatus) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE orders SET status = ?1, updated_at = ?2
             WHERE order_id = ?3 AND status = 'OPEN'",
            params![status.as_str(), Utc::now().to_rfc3339(), order_id],
        )?;
        Ok(n > 0)
    }

    pub fn find(&self, order_id: &str) -> Result<Option<Order>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT order_id, user_id, symbol, exchange, action, quantity, price_type,
                    price, trigger_price, product, status, filled_quantity, average_price,
                    broker_order_id, created_at, updated_at
             FROM orders WHERE order_id = ?1",
            params![order_id],
            |row| {
                Ok(Order {
                    order_id: row.get(0)?,
                    user_id: row.get(1)?,
                    symbol: row.get(2)?,
                    exchange: row.get::<_, String>(3)?.parse().unwrap_or(crate::types::Exchange::Nse),
                    action: if row.get::<_, String>(4)? == "BUY" {
                        crate::types::OrderAction::Buy
                    } else {
                        crate::types::OrderAction::Sell
                    },
                    quantity: row.get(5)?,
                    price_type: match row.get::<_, String>(6)?.as_str() {
                        "MARKET" => crate::types::PriceType::Market,
                        "SL" => crate::types::PriceType::StopLoss,
                        "SL-M" => crate::types::PriceType::StopLossMarket,
                        _ => crate::types::PriceType::Limit,
                    },
                    price: row.get(7)?,
                    trigger_price: row.get(8)?,
                    product: match row.get::<_, String>(9)?.as_str() {
                        "CNC" => crate::types::Product::Cnc,
                        "NRML" => crate::types::Product::Nrml,
                        _ => crate::types::Product::Mis,
                    },
                    status: row.get::<_, String>(10)?.parse().unwrap_or(OrderStatus::Open),
                    filled_quantity: row.get(11)?,
                    average_price: row.get(12)?,
                    margin_blocked: 0.0,
                    broker_order_id: row.get(13)?,
                    created_at: row.get(14)?,
                    updated_at: row.get(15)?,
                })
            },
        )
        .optional()
        .context("failed to read order")
    }

    pub fn for_user(&self, user_id: &str) -> Result<Vec<Order>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT order_id FROM orders WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        let mut orders = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(order) = self.find(&id)? {
                orders.push(order);
            }
        }
        Ok(orders)
    }
}

impl std::fmt::Debug for OrdersStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrdersStore").field("db_path", &self.db_path).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
