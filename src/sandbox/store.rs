// =============================================================================
// Sandbox Store — isolated persistence for the paper-trading engine
// =============================================================================
//
// Lives in its own database; nothing here touches live-broker state. Funds
// carry the accounting invariant the engine maintains:
//
//     available + used_margin = total_capital + realized_pnl
//
// Config is a key/value table (~18 keys) seeded with defaults and editable
// at runtime; the square-off scheduler hot-reloads from it.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::types::{
    Exchange, Holding, Order, OrderAction, OrderStatus, Position, PriceType, Product, Trade,
};

/// Seed capital for every sandbox account.
pub const SEED_CAPITAL: f64 = 10_000_000.0;

/// Sandbox fund state per user.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxFunds {
    pub user_id: String,
    pub total_capital: f64,
    pub available_balance: f64,
    pub used_margin: f64,
    pub realized_pnl: f64,
    pub reset_count: i64,
}

impl SandboxFunds {
    /// The accounting identity, to rounding.
    pub fn balanced(&self) -> bool {
        let lhs = self.available_balance + self.used_margin;
        let rhs = self.total_capital + self.realized_pnl;
        (lhs - rhs).abs() < 0.01
    }
}

/// Default configuration rows seeded on first open.
pub const DEFAULT_CONFIG: &[(&str, &str)] = &[
    ("starting_capital", "10000000"),
    ("equity_mis_leverage", "5"),
    ("equity_cnc_leverage", "1"),
    ("futures_leverage", "10"),
    ("option_buy_leverage", "1"),
    ("option_sell_leverage", "10"),
    ("order_rate_limit", "10"),
    ("smart_order_rate_limit", "2"),
    ("api_rate_limit", "50"),
    ("order_check_interval", "5"),
    ("mtm_update_interval", "5"),
    ("square_off_enabled", "true"),
    ("nse_bse_square_off_time", "15:15"),
    ("cds_bcd_square_off_time", "16:45"),
    ("mcx_square_off_time", "23:30"),
    ("ncdex_square_off_time", "17:00"),
    ("reset_day", "sun"),
    ("reset_time", "00:00"),
];

pub struct SandboxStore {
    db_path: String,
}

impl SandboxStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Self { db_path: db_path.to_string() };
        store.init_db()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("failed to open sandbox store at {}", self.db_path))
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_orders (
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
                margin_blocked REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_trades (
                trade_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                action TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price REAL NOT NULL,
                product TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_positions (
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                product TEXT NOT NULL,
                net_quantity INTEGER NOT NULL DEFAULT 0,
                avg_price REAL NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                margin_blocked REAL NOT NULL DEFAULT 0,
                ltp REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, symbol, exchange, product)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_holdings (
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                quantity INTEGER NOT NULL DEFAULT 0,
                avg_price REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, symbol, exchange)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_funds (
                user_id TEXT PRIMARY KEY,
                total_capital REAL NOT NULL,
                available_balance REAL NOT NULL,
                used_margin REAL NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                reset_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sandbox_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        for (key, value) in DEFAULT_CONFIG {
            conn.execute(
                "INSERT OR IGNORE INTO sandbox_config (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Config
    // -------------------------------------------------------------------------

    pub fn config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM sandbox_config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read sandbox config")
    }

    pub fn config_f64(&self, key: &str, default: f64) -> f64 {
        self.config(key)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sandbox_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        info!(key, value, "sandbox config updated");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Funds
    // -------------------------------------------------------------------------

    /// The user's fund row, created at seed capital on first touch.
    pub fn funds(&self, user_id: &str) -> Result<SandboxFunds> {
        let conn = self.conn()?;
        let seed = self.config_f64("starting_capital", SEED_CAPITAL);

        conn.execute(
            "INSERT OR IGNORE INTO sandbox_funds
               (user_id, total_capital, available_balance, updated_at)
             VALUES (?1, ?2, ?2, ?3)",
            params![user_id, seed, Utc::now().to_rfc3339()],
        )?;

        conn.query_row(
            "SELECT user_id, total_capital, available_balance, used_margin,
                    realized_pnl, reset_count
             FROM sandbox_funds WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(SandboxFunds {
                    user_id: row.get(0)?,
                    total_capital: row.get(1)?,
                    available_balance: row.get(2)?,
                    used_margin: row.get(3)?,
                    realized_pnl: row.get(4)?,
                    reset_count: row.get(5)?,
                })
            },
        )
        .context("failed to read sandbox funds")
    }

    pub fn write_funds(&self, funds: &SandboxFunds) -> Result<()> {
        debug_assert!(funds.balanced(), "sandbox fund equation violated");
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sandbox_funds
             SET available_balance = ?1, used_margin = ?2, realized_pnl = ?3, updated_at = ?4
             WHERE user_id = ?5",
            params![
                funds.available_balance,
                funds.used_margin,
                funds.realized_pnl,
                Utc::now().to_rfc3339(),
                funds.user_id
            ],
        )?;
        Ok(())
    }

    /// Weekly reset: every account back to seed capital, reset counter up.
    pub fn reset_all_funds(&self) -> Result<usize> {
        let conn = self.conn()?;
        let seed = self.config_f64("starting_capital", SEED_CAPITAL);
        let n = conn.execute(
            "UPDATE sandbox_funds
             SET total_capital = ?1, available_balance = ?1, used_margin = 0,
                 realized_pnl = 0, reset_count = reset_count + 1, updated_at = ?2",
            params![seed, Utc::now().to_rfc3339()],
        )?;
        info!(accounts = n, "sandbox funds reset to seed capital");
        Ok(n)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub fn insert_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sandbox_orders (order_id, user_id, symbol, exchange, action,
                quantity, price_type, price, trigger_price, product, status,
                filled_quantity, average_price, margin_blocked, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                order.order_id,
                order.user_id,
                order.symbol,
                order.exchange.as_str(),
                order.action.as_str(),
                order.quantity,
                order.price_type.as_str(),
                order.price,
                order.trigger_price,
                order.product.as_str(),
                order.status.as_str(),
                order.filled_quantity,
                order.average_price,
                order.margin_blocked,
                order.created_at,
                order.updated_at,
            ],
        )?;
        Ok(())
    }

    fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
        Ok(Order {
            order_id: row.get(0)?,
            user_id: row.get(1)?,
            symbol: row.get(2)?,
            exchange: row.get::<_, String>(3)?.parse().unwrap_or(Exchange::Nse),
            action: if row.get::<_, String>(4)? == "BUY" {
                OrderAction::Buy
            } else {
                OrderAction::Sell
            },
            quantity: row.get(5)?,
            price_type: match row.get::<_, String>(6)?.as_str() {
                "MARKET" => PriceType::Market,
                "SL" => PriceType::StopLoss,
                "SL-M" => PriceType::StopLossMarket,
                _ => PriceType::Limit,
            },
            price: row.get(7)?,
            trigger_price: row.get(8)?,
            product: match row.get::<_, String>(9)?.as_str() {
                "CNC" => Product::Cnc,
                "NRML" => Product::Nrml,
                _ => Product::Mis,
            },
            status: row.get::<_, String>(10)?.parse().unwrap_or(OrderStatus::Open),
            filled_quantity: row.get(11)?,
            average_price: row.get(12)?,
            margin_blocked: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            broker_order_id: None,
        })
    }

    const ORDER_COLUMNS: &'static str =
        "order_id, user_id, symbol, exchange, action, quantity, price_type, price,
         trigger_price, product, status, filled_quantity, average_price, margin_blocked,
         created_at, updated_at";

    pub fn find_order(&self, order_id: &str) -> Result<Option<Order>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM sandbox_orders WHERE order_id = ?1",
            Self::ORDER_COLUMNS
        );
        conn.query_row(&sql, params![order_id], Self::order_from_row)
            .optional()
            .context("failed to read sandbox order")
    }

    /// Every OPEN order across all users, oldest first.
    pub fn open_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM sandbox_orders WHERE status = 'OPEN' ORDER BY created_at",
            Self::ORDER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let orders = stmt
            .query_map([], Self::order_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(orders)
    }

    pub fn orders_for_user(&self, user_id: &str) -> Result<Vec<Order>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM sandbox_orders WHERE user_id = ?1 ORDER BY created_at DESC",
            Self::ORDER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let orders = stmt
            .query_map(params![user_id], Self::order_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(orders)
    }

    pub fn open_mis_orders_for_exchanges(&self, exchanges: &[Exchange]) -> Result<Vec<Order>> {
        Ok(self
            .open_orders()?
            .into_iter()
            .filter(|o| o.product == Product::Mis && exchanges.contains(&o.exchange))
            .collect())
    }

    /// OPEN -> terminal transition; terminal states are absorbing.
    pub fn set_order_status(&self, order_id: &str, status: OrderStatus) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE sandbox_orders SET status = ?1, updated_at = ?2
             WHERE order_id = ?3 AND status = 'OPEN'",
            params![status.as_str(), Utc::now().to_rfc3339(), order_id],
        )?;
        Ok(n > 0)
    }

    pub fn mark_filled(&self, order_id: &str, quantity: u32, price: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sandbox_orders
             SET status = 'COMPLETE', filled_quantity = ?1, average_price = ?2, updated_at = ?3
             WHERE order_id = ?4 AND status = 'OPEN'",
            params![quantity, price, Utc::now().to_rfc3339(), order_id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub fn insert_trade(&self, trade: &Trade, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sandbox_trades (trade_id, order_id, user_id, symbol, exchange,
                action, quantity, price, product, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trade.trade_id,
                trade.order_id,
                user_id,
                trade.symbol,
                trade.exchange.as_str(),
                trade.action.as_str(),
                trade.quantity,
                trade.price,
                trade.product.as_str(),
                trade.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn trades_for_user(&self, user_id: &str) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT trade_id, order_id, symbol, exchange, action, quantity, price, product,
                    timestamp
             FROM sandbox_trades WHERE user_id = ?1 ORDER BY timestamp DESC",
        )?;
        let trades = stmt
            .query_map(params![user_id], |row| {
                Ok(Trade {
                    trade_id: row.get(0)?,
                    order_id: row.get(1)?,
                    symbol: row.get(2)?,
                    exchange: row.get::<_, String>(3)?.parse().unwrap_or(Exchange::Nse),
                    action: if row.get::<_, String>(4)? == "BUY" {
                        OrderAction::Buy
                    } else {
                        OrderAction::Sell
                    },
                    quantity: row.get(5)?,
                    price: row.get(6)?,
                    product: match row.get::<_, String>(7)?.as_str() {
                        "CNC" => Product::Cnc,
                        "NRML" => Product::Nrml,
                        _ => Product::Mis,
                    },
                    timestamp: row.get(8)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(trades)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// The position row for this key, zeroed if absent. Margin ridden on the
    /// position is tracked alongside for release on reduce.
    pub fn position(
        &self,
        user_id: &str,
        symbol: &str,
        exchange: Exchange,
        product: Product,
    ) -> Result<(Position, f64)> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT net_quantity, avg_price, realized_pnl, margin_blocked, ltp
                 FROM sandbox_positions
                 WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3 AND product = ?4",
                params![user_id, symbol, exchange.as_str(), product.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                    ))
                },
            )
            .optional()?;

        let (net_quantity, avg_price, realized_pnl, margin, ltp) =
            row.unwrap_or((0, 0.0, 0.0, 0.0, 0.0));
        Ok((
            Position {
                user_id: user_id.to_string(),
                symbol: symbol.to_string(),
                exchange,
                product,
                net_quantity,
                avg_price,
                unrealized_pnl: 0.0,
                realized_pnl,
                ltp,
            },
            margin,
        ))
    }

    /// Write a position row. Zero-quantity rows are kept for history.
    pub fn write_position(&self, position: &Position, margin_blocked: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sandbox_positions
               (user_id, symbol, exchange, product, net_quantity, avg_price,
                realized_pnl, margin_blocked, ltp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, symbol, exchange, product)
             DO UPDATE SET net_quantity = ?5, avg_price = ?6, realized_pnl = ?7,
                           margin_blocked = ?8, ltp = ?9",
            params![
                position.user_id,
                position.symbol,
                position.exchange.as_str(),
                position.product.as_str(),
                position.net_quantity,
                position.avg_price,
                position.realized_pnl,
                margin_blocked,
                position.ltp,
            ],
        )?;
        Ok(())
    }

    pub fn positions_for_user(&self, user_id: &str) -> Result<Vec<Position>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, exchange, product, net_quantity, avg_price, realized_pnl, ltp
             FROM sandbox_positions WHERE user_id = ?1",
        )?;
        let positions = stmt
            .query_map(params![user_id], |row| {
                Ok(Position {
                    user_id: user_id.to_string(),
                    symbol: row.get(0)?,
                    exchange: row.get::<_, String>(1)?.parse().unwrap_or(Exchange::Nse),
                    product: match row.get::<_, String>(2)?.as_str() {
                        "CNC" => Product::Cnc,
                        "NRML" => Product::Nrml,
                        _ => Product::Mis,
                    },
                    net_quantity: row.get(3)?,
                    avg_price: row.get(4)?,
                    unrealized_pnl: 0.0,
                    realized_pnl: row.get(5)?,
                    ltp: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    /// Non-zero MIS positions on the given exchanges (square-off targets).
    pub fn open_mis_positions_for_exchanges(
        &self,
        exchanges: &[Exchange],
    ) -> Result<Vec<Position>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, symbol, exchange, net_quantity, avg_price, realized_pnl, ltp
             FROM sandbox_positions WHERE product = 'MIS' AND net_quantity != 0",
        )?;
        let positions: Vec<Position> = stmt
            .query_map([], |row| {
                Ok(Position {
                    user_id: row.get(0)?,
                    symbol: row.get(1)?,
                    exchange: row.get::<_, String>(2)?.parse().unwrap_or(Exchange::Nse),
                    product: Product::Mis,
                    net_quantity: row.get(3)?,
                    avg_price: row.get(4)?,
                    unrealized_pnl: 0.0,
                    realized_pnl: row.get(5)?,
                    ltp: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions
            .into_iter()
            .filter(|p| exchanges.contains(&p.exchange))
            .collect())
    }

    // -------------------------------------------------------------------------
    // Holdings
    // -------------------------------------------------------------------------

    pub fn upsert_holding(
        &self,
        user_id: &str,
        symbol: &str,
        exchange: Exchange,
        delta_qty: i64,
        price: f64,
    ) -> Result<()> {
        let conn = self.conn()?;
        let existing = conn
            .query_row(
                "SELECT quantity, avg_price FROM sandbox_holdings
                 WHERE user_id = ?1 AND symbol = ?2 AND exchange = ?3",
                params![user_id, symbol, exchange.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;

        let (qty, avg) = existing.unwrap_or((0, 0.0));
        let new_qty = qty + delta_qty;
        let new_avg = if delta_qty > 0 && new_qty > 0 {
            (qty as f64 * avg + delta_qty as f64 * price) / new_qty as f64
        } else {
            avg
        };

        conn.execute(
            "INSERT INTO sandbox_holdings (user_id, symbol, exchange, quantity, avg_price)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, symbol, exchange)
             DO UPDATE SET quantity = ?4, avg_price = ?5",
            params![user_id, symbol, exchange.as_str(), new_qty, new_avg],
        )?;
        Ok(())
    }

    pub fn holdings_for_user(&self, user_id: &str) -> Result<Vec<Holding>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, exchange, quantity, avg_price FROM sandbox_holdings
             WHERE user_id = ?1 AND quantity != 0",
        )?;
        let holdings = stmt
            .query_map(params![user_id], |row| {
                Ok(Holding {
                    user_id: user_id.to_string(),
                    symbol: row.get(0)?,
                    exchange: row.get::<_, String>(1)?.parse().unwrap_or(Exchange::Nse),
                    quantity: row.get(2)?,
                    avg_price: row.get(3)?,
                    ltp: 0.0,
                    pnl: 0.0,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(holdings)
    }
}

impl std::fmt::Debug for SandboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxStore").field("db_path", &self.db_path).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (SandboxStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.db");
        (SandboxStore::new(path.to_str().unwrap()).unwrap(), dir)
    }

    #[test]
    fn funds_seed_at_ten_million() {
        let (s, _d) = store();
        let funds = s.funds("u1").unwrap();
        assert_eq!(funds.available_balance, SEED_CAPITAL);
        assert_eq!(funds.used_margin, 0.0);
        assert_eq!(funds.reset_count, 0);
        assert!(funds.balanced());
    }

    #[test]
    fn config_seeds_defaults_and_updates() {
        let (s, _d) = store();
        assert_eq!(s.config_f64("equity_mis_leverage", 0.0), 5.0);
        assert_eq!(s.config("nse_bse_square_off_time").unwrap().unwrap(), "15:15");
        assert_eq!(DEFAULT_CONFIG.len(), 18);

        s.set_config("equity_mis_leverage", "4").unwrap();
        assert_eq!(s.config_f64("equity_mis_leverage", 0.0), 4.0);
    }

    #[test]
    fn weekly_reset_restores_seed_and_counts() {
        let (s, _d) = store();
        let mut funds = s.funds("u1").unwrap();
        funds.available_balance -= 1000.0;
        funds.used_margin += 1000.0;
        s.write_funds(&funds).unwrap();

        s.reset_all_funds().unwrap();
        let funds = s.funds("u1").unwrap();
        assert_eq!(funds.available_balance, SEED_CAPITAL);
        assert_eq!(funds.used_margin, 0.0);
        assert_eq!(funds.reset_count, 1);
    }

    #[test]
    fn zero_quantity_positions_are_kept() {
        let (s, _d) = store();
        let (mut pos, _) = s.position("u1", "SBIN", Exchange::Nse, Product::Mis).unwrap();
        pos.net_quantity = 0;
        pos.realized_pnl = 42.0;
        s.write_position(&pos, 0.0).unwrap();

        let positions = s.positions_for_user("u1").unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].net_quantity, 0);
        assert_eq!(positions[0].realized_pnl, 42.0);
    }

    #[test]
    fn open_order_queries_filter_by_product_and_exchange() {
        let (s, _d) = store();
        let now = Utc::now().to_rfc3339();
        let mk = |id: &str, exchange: Exchange, product: Product| Order {
            order_id: id.into(),
            user_id: "u1".into(),
            symbol: "SBIN".into(),
            exchange,
            action: OrderAction::Buy,
            quantity: 1,
            price_type: PriceType::Limit,
            price: Some(100.0),
            trigger_price: None,
            product,
            status: OrderStatus::Open,
            filled_quantity: 0,
            average_price: 0.0,
            margin_blocked: 20.0,
            created_at: now.clone(),
            updated_at: now.clone(),
            broker_order_id: None,
        };
        s.insert_order(&mk("o1", Exchange::Nse, Product::Mis)).unwrap();
        s.insert_order(&mk("o2", Exchange::Mcx, Product::Mis)).unwrap();
        s.insert_order(&mk("o3", Exchange::Nse, Product::Cnc)).unwrap();

        let mis_nse = s
            .open_mis_orders_for_exchanges(&[Exchange::Nse, Exchange::Bse])
            .unwrap();
        assert_eq!(mis_nse.len(), 1);
        assert_eq!(mis_nse[0].order_id, "o1");
    }
}
