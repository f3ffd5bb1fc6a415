// =============================================================================
// Sandbox Execution Loop — trigger checks, fills, position accounting
// =============================================================================
//
// Every 5 seconds: collect OPEN orders, batch-fetch one LTP per instrument,
// fill whatever the trigger rules admit. Margin blocked at placement is
// released on fill and re-blocked at the fill price; reducing fills release
// proportional position margin and realize P&L into available balance.
//
// The fund identity `available + used = capital + realized` holds after
// every mutation (debug-asserted in the store).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sandbox::margin::{required_margin, Leverages};
use crate::sandbox::store::SandboxStore;
use crate::sandbox::SandboxEngine;
use crate::symbols::Instrument;
use crate::types::{
    Exchange, InstrumentType, Order, OrderAction, OrderRequest, PriceType, Product, Trade,
};

/// Loop period.
pub const CYCLE_SECS: u64 = 5;

// =============================================================================
// Trigger rules
// =============================================================================

/// Whether an OPEN order fills at this LTP.
///
///   LIMIT BUY:  ltp <= price      LIMIT SELL: ltp >= price
///   SL(-M) BUY: ltp >= trigger    SL(-M) SELL: ltp <= trigger
pub fn should_fill(order: &Order, ltp: f64) -> bool {
    match (order.price_type, order.action) {
        (PriceType::Market, _) => true,
        (PriceType::Limit, OrderAction::Buy) => {
            order.price.map(|p| ltp <= p).unwrap_or(false)
        }
        (PriceType::Limit, OrderAction::Sell) => {
            order.price.map(|p| ltp >= p).unwrap_or(false)
        }
        (PriceType::StopLoss | PriceType::StopLossMarket, OrderAction::Buy) => {
            order.trigger_price.map(|t| ltp >= t).unwrap_or(false)
        }
        (PriceType::StopLoss | PriceType::StopLossMarket, OrderAction::Sell) => {
            order.trigger_price.map(|t| ltp <= t).unwrap_or(false)
        }
    }
}

// =============================================================================
// Fills
// =============================================================================

/// P&L and margin scale per filled unit: derivatives carry the lot size.
fn contract_multiplier(instrument_type: InstrumentType, lot_size: u32) -> f64 {
    match instrument_type {
        InstrumentType::Future | InstrumentType::CallOption | InstrumentType::PutOption => {
            lot_size.max(1) as f64
        }
        _ => 1.0,
    }
}

/// Book a complete fill for an OPEN order at `fill_price`.
pub fn fill_order(
    store: &Arc<SandboxStore>,
    order: &Order,
    fill_price: f64,
    instrument: &Instrument,
    leverages: &Leverages,
) -> anyhow::Result<()> {
    let user_id = &order.user_id;
    let qty = order.quantity as i64;
    let signed_qty = qty * order.action.sign();
    let multiplier = contract_multiplier(instrument.instrument_type, instrument.lot_size);

    let mut funds = store.funds(user_id)?;
    // The margin blocked at placement comes off first; the fill re-blocks at
    // the executed price below.
    funds.available_balance += order.margin_blocked;
    funds.used_margin -= order.margin_blocked;

    let fill_request = OrderRequest {
        symbol: order.symbol.clone(),
        exchange: order.exchange,
        action: order.action,
        quantity: order.quantity,
        price_type: order.price_type,
        price: Some(fill_price),
        trigger_price: order.trigger_price,
        product: order.product,
    };
    let underlying = if instrument.instrument_type.is_option() {
        instrument.strike.unwrap_or(fill_price)
    } else {
        fill_price
    };
    let fill_margin = required_margin(
        &fill_request,
        instrument.instrument_type,
        instrument.lot_size,
        fill_price,
        underlying,
        leverages,
    );

    let (mut position, mut position_margin) =
        store.position(user_id, &order.symbol, order.exchange, order.product)?;

    if position.net_quantity == 0 || position.net_quantity.signum() == signed_qty.signum() {
        // Opening or adding: weighted average, margin rides the position.
        let total = position.net_quantity.abs() + qty;
        position.avg_price = (position.net_quantity.abs() as f64 * position.avg_price
            + qty as f64 * fill_price)
            / total as f64;
        position.net_quantity += signed_qty;
        position_margin += fill_margin;
        funds.available_balance -= fill_margin;
        funds.used_margin += fill_margin;
    } else {
        // Reducing or reversing.
        let closing = position.net_quantity.abs().min(qty);
        let fraction = closing as f64 / position.net_quantity.abs() as f64;
        let released = position_margin * fraction;
        let realized = (fill_price - position.avg_price)
            * closing as f64
            * multiplier
            * position.net_quantity.signum() as f64;

        position_margin -= released;
        funds.available_balance += released + realized;
        funds.used_margin -= released;
        funds.realized_pnl += realized;
        position.realized_pnl += realized;

        let remaining = position.net_quantity + signed_qty;
        if remaining != 0 && remaining.signum() != position.net_quantity.signum() {
            // Reversal: the residual opens fresh at the fill price.
            let residual = remaining.abs();
            let residual_margin = fill_margin * residual as f64 / qty as f64;
            position.avg_price = fill_price;
            position_margin = residual_margin;
            funds.available_balance -= residual_margin;
            funds.used_margin += residual_margin;
        }
        position.net_quantity = remaining;
    }

    position.ltp = fill_price;
    store.write_position(&position, position_margin)?;
    store.write_funds(&funds)?;

    let trade = Trade {
        trade_id: Uuid::new_v4().to_string(),
        order_id: order.order_id.clone(),
        symbol: order.symbol.clone(),
        exchange: order.exchange,
        action: order.action,
        quantity: order.quantity,
        price: fill_price,
        product: order.product,
        timestamp: Utc::now().to_rfc3339(),
    };
    store.insert_trade(&trade, user_id)?;
    store.mark_filled(&order.order_id, order.quantity, fill_price)?;

    // CNC fills settle into holdings.
    if order.product == Product::Cnc {
        store.upsert_holding(user_id, &order.symbol, order.exchange, signed_qty, fill_price)?;
    }

    info!(
        order_id = %order.order_id,
        user_id,
        symbol = %order.symbol,
        qty = order.quantity,
        price = fill_price,
        "sandbox fill"
    );
    Ok(())
}

// =============================================================================
// Cycle
// =============================================================================

/// One execution pass: batch quotes per instrument, fill what triggers.
/// Fills per cycle are capped by `order_rate_limit × period`.
pub async fn run_cycle(engine: &Arc<SandboxEngine>) -> anyhow::Result<usize> {
    let store = engine.store();
    let open = store.open_orders()?;
    if open.is_empty() {
        return Ok(0);
    }

    let leverages = Leverages::from_config(store);
    let max_fills =
        (store.config_f64("order_rate_limit", 10.0) * CYCLE_SECS as f64).max(1.0) as usize;

    // One quote per (symbol, exchange); keyed by the first order's user so
    // the read rides that user's broker session.
    let mut quotes: HashMap<(String, Exchange), f64> = HashMap::new();
    for order in &open {
        let key = (order.symbol.clone(), order.exchange);
        if quotes.contains_key(&key) {
            continue;
        }
        match engine
            .quotes()
            .ltp(&order.user_id, &order.symbol, order.exchange)
            .await
        {
            Ok(ltp) if ltp > 0.0 => {
                quotes.insert(key, ltp);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(symbol = %order.symbol, error = %e, "sandbox quote fetch failed");
            }
        }
    }

    let mut fills = 0usize;
    for order in &open {
        if fills >= max_fills {
            debug!(max_fills, "fill rate cap reached for this cycle");
            break;
        }
        let Some(&ltp) = quotes.get(&(order.symbol.clone(), order.exchange)) else {
            continue;
        };
        if !should_fill(order, ltp) {
            continue;
        }
        let Ok(instrument) = engine_instrument(engine, order) else {
            continue;
        };
        fill_order(store, order, ltp, &instrument, &leverages)?;
        fills += 1;
    }

    Ok(fills)
}

// Registry lookup; master rows can lag a day, so fall back to an equity
// profile rather than wedging the order forever.
fn engine_instrument(
    engine: &Arc<SandboxEngine>,
    order: &Order,
) -> Result<Instrument, crate::error::GatewayError> {
    engine
        .registry()
        .resolve(&order.symbol, order.exchange)
        .or_else(|_| {
            Ok(Instrument {
                symbol: order.symbol.clone(),
                exchange: order.exchange,
                instrument_type: InstrumentType::Equity,
                lot_size: 1,
                tick_size: 0.05,
                expiry: None,
                strike: None,
            })
        })
}

/// Background driver: one pass every [`CYCLE_SECS`], until shutdown.
pub fn spawn_execution_loop(
    engine: Arc<SandboxEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(CYCLE_SECS));
        info!("sandbox execution loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match run_cycle(&engine).await {
                        Ok(fills) if fills > 0 => debug!(fills, "sandbox cycle complete"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "sandbox cycle failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("sandbox execution loop stopping");
                        return;
                    }
                }
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::store::SEED_CAPITAL;
    use crate::sandbox::QuoteSource;
    use crate::symbols::{RegistryTable, SymbolRegistry};
    use crate::types::Exchange;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted quote source: one LTP sequence per symbol; the last value
    /// repeats once the script runs dry.
    struct ScriptedQuotes {
        scripts: Mutex<HashMap<String, VecDeque<f64>>>,
    }

    impl ScriptedQuotes {
        fn new(scripts: &[(&str, &[f64])]) -> Arc<Self> {
            let mut map = HashMap::new();
            for (symbol, prices) in scripts {
                map.insert(symbol.to_string(), prices.iter().copied().collect());
            }
            Arc::new(Self { scripts: Mutex::new(map) })
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedQuotes {
        async fn ltp(
            &self,
            _user_id: &str,
            symbol: &str,
            _exchange: Exchange,
        ) -> Result<f64, crate::error::GatewayError> {
            let mut scripts = self.scripts.lock();
            let script = scripts.get_mut(symbol).ok_or_else(|| {
                crate::error::GatewayError::SymbolNotFound {
                    symbol: symbol.to_string(),
                    exchange: "NSE".into(),
                }
            })?;
            let price = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                *script.front().unwrap()
            };
            Ok(price)
        }
    }

    fn registry_with_sbin() -> Arc<SymbolRegistry> {
        let registry = Arc::new(SymbolRegistry::new());
        registry.swap(RegistryTable::build(
            vec![Instrument {
                symbol: "SBIN".into(),
                exchange: Exchange::Nse,
                instrument_type: InstrumentType::Equity,
                lot_size: 1,
                tick_size: 0.05,
                expiry: None,
                strike: None,
            }],
            vec![],
        ));
        registry
    }

    fn engine(quotes: Arc<dyn QuoteSource>) -> (Arc<SandboxEngine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.db");
        let store = Arc::new(SandboxStore::new(path.to_str().unwrap()).unwrap());
        (
            Arc::new(SandboxEngine::new(store, quotes, registry_with_sbin())),
            dir,
        )
    }

    fn limit_buy_10_sbin_at_500() -> OrderRequest {
        OrderRequest {
            symbol: "SBIN".into(),
            exchange: Exchange::Nse,
            action: OrderAction::Buy,
            quantity: 10,
            price_type: PriceType::Limit,
            price: Some(500.0),
            trigger_price: None,
            product: Product::Mis,
        }
    }

    #[tokio::test]
    async fn limit_buy_fills_only_when_ltp_crosses() {
        // LTP script: 505 at placement, then 502, 499, 498 per cycle.
        let quotes = ScriptedQuotes::new(&[("SBIN", &[505.0, 502.0, 499.0, 498.0])]);
        let (engine, _d) = engine(quotes);

        let result = engine.place_order("u1", &limit_buy_10_sbin_at_500()).await.unwrap();
        let order_id = result["orderid"].as_str().unwrap().to_string();

        // 502: no fill.
        assert_eq!(run_cycle(&engine).await.unwrap(), 0);
        assert_eq!(
            engine.store().find_order(&order_id).unwrap().unwrap().status,
            crate::types::OrderStatus::Open
        );

        // 499: fills at LTP.
        assert_eq!(run_cycle(&engine).await.unwrap(), 1);
        let order = engine.store().find_order(&order_id).unwrap().unwrap();
        assert_eq!(order.status, crate::types::OrderStatus::Complete);
        assert_eq!(order.average_price, 499.0);

        let trades = engine.store().trades_for_user("u1").unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, 10);
        assert_eq!(trades[0].price, 499.0);

        let (position, _) = engine
            .store()
            .position("u1", "SBIN", Exchange::Nse, Product::Mis)
            .unwrap();
        assert_eq!(position.net_quantity, 10);
        assert_eq!(position.avg_price, 499.0);

        let funds = engine.store().funds("u1").unwrap();
        assert_eq!(funds.used_margin, 998.0); // 499·10/5
        assert!(funds.balanced());

        // 498: nothing further fills.
        assert_eq!(run_cycle(&engine).await.unwrap(), 0);
        assert_eq!(engine.store().trades_for_user("u1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn market_order_fills_immediately() {
        let quotes = ScriptedQuotes::new(&[("SBIN", &[500.0])]);
        let (engine, _d) = engine(quotes);

        let mut request = limit_buy_10_sbin_at_500();
        request.price_type = PriceType::Market;
        request.price = None;
        engine.place_order("u1", &request).await.unwrap();

        let (position, _) = engine
            .store()
            .position("u1", "SBIN", Exchange::Nse, Product::Mis)
            .unwrap();
        assert_eq!(position.net_quantity, 10);
        assert!(engine.store().funds("u1").unwrap().balanced());
    }

    #[tokio::test]
    async fn insufficient_funds_rejects_before_margin_block() {
        let quotes = ScriptedQuotes::new(&[("SBIN", &[500.0])]);
        let (engine, _d) = engine(quotes);

        let mut request = limit_buy_10_sbin_at_500();
        request.quantity = 1_000_000; // 500·1e6/5 = 1e8 > seed capital
        let err = engine.place_order("u1", &request).await.unwrap_err();
        assert!(matches!(err, crate::error::GatewayError::InsufficientFunds { .. }));

        let funds = engine.store().funds("u1").unwrap();
        assert_eq!(funds.available_balance, SEED_CAPITAL);
        assert_eq!(funds.used_margin, 0.0);
    }

    #[tokio::test]
    async fn reducing_fill_realizes_pnl_into_available() {
        let quotes = ScriptedQuotes::new(&[("SBIN", &[500.0, 520.0])]);
        let (engine, _d) = engine(quotes);

        // Open long 10 @ 500 via MARKET.
        let mut buy = limit_buy_10_sbin_at_500();
        buy.price_type = PriceType::Market;
        buy.price = None;
        engine.place_order("u1", &buy).await.unwrap();

        // Close at 520 via MARKET SELL.
        let mut sell = buy.clone();
        sell.action = OrderAction::Sell;
        engine.place_order("u1", &sell).await.unwrap();

        let funds = engine.store().funds("u1").unwrap();
        assert!((funds.realized_pnl - 200.0).abs() < 1e-9); // (520-500)·10
        assert_eq!(funds.used_margin, 0.0);
        assert!((funds.available_balance - (SEED_CAPITAL + 200.0)).abs() < 1e-9);
        assert!(funds.balanced());

        let (position, _) = engine
            .store()
            .position("u1", "SBIN", Exchange::Nse, Product::Mis)
            .unwrap();
        assert_eq!(position.net_quantity, 0);
        assert!((position.realized_pnl - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sl_buy_triggers_at_or_above_trigger() {
        let quotes = ScriptedQuotes::new(&[("SBIN", &[500.0, 504.0, 506.0])]);
        let (engine, _d) = engine(quotes);

        let request = OrderRequest {
            symbol: "SBIN".into(),
            exchange: Exchange::Nse,
            action: OrderAction::Buy,
            quantity: 5,
            price_type: PriceType::StopLossMarket,
            price: None,
            trigger_price: Some(505.0),
            product: Product::Mis,
        };
        engine.place_order("u1", &request).await.unwrap();

        assert_eq!(run_cycle(&engine).await.unwrap(), 0); // 504 < 505
        assert_eq!(run_cycle(&engine).await.unwrap(), 1); // 506 >= 505

        let trades = engine.store().trades_for_user("u1").unwrap();
        assert_eq!(trades[0].price, 506.0); // fills at LTP, not at trigger
    }

    #[test]
    fn trigger_table_is_exact() {
        let base = Order {
            order_id: "o".into(),
            user_id: "u".into(),
            symbol: "S".into(),
            exchange: Exchange::Nse,
            action: OrderAction::Buy,
            quantity: 1,
            price_type: PriceType::Limit,
            price: Some(100.0),
            trigger_price: Some(105.0),
            product: Product::Mis,
            status: crate::types::OrderStatus::Open,
            filled_quantity: 0,
            average_price: 0.0,
            margin_blocked: 0.0,
            created_at: String::new(),
            updated_at: String::new(),
            broker_order_id: None,
        };

        let mut limit_buy = base.clone();
        limit_buy.price_type = PriceType::Limit;
        assert!(should_fill(&limit_buy, 100.0));
        assert!(should_fill(&limit_buy, 99.0));
        assert!(!should_fill(&limit_buy, 101.0));

        let mut limit_sell = limit_buy.clone();
        limit_sell.action = OrderAction::Sell;
        assert!(should_fill(&limit_sell, 100.0));
        assert!(!should_fill(&limit_sell, 99.0));

        let mut sl_buy = base.clone();
        sl_buy.price_type = PriceType::StopLoss;
        assert!(should_fill(&sl_buy, 105.0));
        assert!(!should_fill(&sl_buy, 104.0));

        let mut sl_sell = sl_buy.clone();
        sl_sell.action = OrderAction::Sell;
        assert!(should_fill(&sl_sell, 105.0));
        assert!(should_fill(&sl_sell, 104.0));
        assert!(!should_fill(&sl_sell, 106.0));
    }
}
