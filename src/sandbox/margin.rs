// =============================================================================
// Sandbox Margin — leverage table and margin price selection
// =============================================================================
//
// Margin price by price type: MARKET uses the live LTP, LIMIT uses the limit
// price, SL/SL-M use the trigger price. Leverages come from sandbox config
// and divide notional; option buys block the full premium.
// =============================================================================

use crate::error::GatewayError;
use crate::sandbox::store::SandboxStore;
use crate::types::{InstrumentType, OrderAction, OrderRequest, PriceType};

/// Leverage set loaded from sandbox config.
#[derive(Debug, Clone, Copy)]
pub struct Leverages {
    pub equity_mis: f64,
    pub equity_cnc: f64,
    pub futures: f64,
    pub option_sell: f64,
}

impl Leverages {
    pub fn from_config(store: &SandboxStore) -> Self {
        Self {
            equity_mis: store.config_f64("equity_mis_leverage", 5.0),
            equity_cnc: store.config_f64("equity_cnc_leverage", 1.0),
            futures: store.config_f64("futures_leverage", 10.0),
            option_sell: store.config_f64("option_sell_leverage", 10.0),
        }
    }
}

impl Default for Leverages {
    fn default() -> Self {
        Self { equity_mis: 5.0, equity_cnc: 1.0, futures: 10.0, option_sell: 10.0 }
    }
}

/// The price margin is computed against, per price type.
pub fn margin_price(request: &OrderRequest, ltp: f64) -> Result<f64, GatewayError> {
    let price = match request.price_type {
        PriceType::Market => ltp,
        PriceType::Limit => request.price.unwrap_or(ltp),
        PriceType::StopLoss | PriceType::StopLossMarket => {
            request.trigger_price.unwrap_or(ltp)
        }
    };
    if price <= 0.0 {
        return Err(GatewayError::Internal("no price available for margin".into()));
    }
    Ok(price)
}

/// Margin required to accept an order.
///
/// * Equity MIS:   price × qty / equity_mis_leverage
/// * Equity CNC:   price × qty / equity_cnc_leverage
/// * Futures:      price × lot × qty / futures_leverage
/// * Option BUY:   premium × lot × qty (full premium)
/// * Option SELL:  underlying_ltp × lot × qty / option_sell_leverage
pub fn required_margin(
    request: &OrderRequest,
    instrument_type: InstrumentType,
    lot_size: u32,
    price: f64,
    underlying_ltp: f64,
    leverages: &Leverages,
) -> f64 {
    let qty = request.quantity as f64;
    let lot = lot_size.max(1) as f64;

    let margin = match instrument_type {
        InstrumentType::Equity | InstrumentType::Index => {
            let leverage = match request.product {
                crate::types::Product::Cnc => leverages.equity_cnc,
                _ => leverages.equity_mis,
            };
            price * qty / leverage.max(1.0)
        }
        InstrumentType::Future => price * lot * qty / leverages.futures.max(1.0),
        InstrumentType::CallOption | InstrumentType::PutOption => match request.action {
            OrderAction::Buy => price * lot * qty,
            OrderAction::Sell => {
                underlying_ltp * lot * qty / leverages.option_sell.max(1.0)
            }
        },
    };

    (margin * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, Product};

    fn request(
        action: OrderAction,
        quantity: u32,
        price_type: PriceType,
        price: Option<f64>,
        trigger: Option<f64>,
        product: Product,
    ) -> OrderRequest {
        OrderRequest {
            symbol: "TEST".into(),
            exchange: Exchange::Nse,
            action,
            quantity,
            price_type,
            price,
            trigger_price: trigger,
            product,
        }
    }

    #[test]
    fn margin_price_follows_price_type() {
        let market = request(OrderAction::Buy, 10, PriceType::Market, None, None, Product::Mis);
        assert_eq!(margin_price(&market, 500.0).unwrap(), 500.0);

        let limit =
            request(OrderAction::Buy, 10, PriceType::Limit, Some(495.0), None, Product::Mis);
        assert_eq!(margin_price(&limit, 500.0).unwrap(), 495.0);

        let sl = request(
            OrderAction::Sell,
            10,
            PriceType::StopLoss,
            Some(488.0),
            Some(490.0),
            Product::Mis,
        );
        assert_eq!(margin_price(&sl, 500.0).unwrap(), 490.0);
    }

    #[test]
    fn equity_mis_uses_five_x() {
        let r = request(OrderAction::Buy, 10, PriceType::Limit, Some(500.0), None, Product::Mis);
        let m = required_margin(&r, InstrumentType::Equity, 1, 500.0, 0.0, &Leverages::default());
        assert_eq!(m, 1000.0); // 500*10/5
    }

    #[test]
    fn equity_cnc_is_unlevered() {
        let r = request(OrderAction::Buy, 10, PriceType::Limit, Some(500.0), None, Product::Cnc);
        let m = required_margin(&r, InstrumentType::Equity, 1, 500.0, 0.0, &Leverages::default());
        assert_eq!(m, 5000.0);
    }

    #[test]
    fn futures_use_lot_and_ten_x() {
        let r = request(OrderAction::Buy, 2, PriceType::Market, None, None, Product::Nrml);
        let m =
            required_margin(&r, InstrumentType::Future, 50, 22000.0, 0.0, &Leverages::default());
        assert_eq!(m, 220_000.0); // 22000*50*2/10
    }

    #[test]
    fn option_buy_blocks_full_premium() {
        let r = request(OrderAction::Buy, 1, PriceType::Market, None, None, Product::Nrml);
        let m = required_margin(
            &r,
            InstrumentType::CallOption,
            50,
            120.0,
            22000.0,
            &Leverages::default(),
        );
        assert_eq!(m, 6000.0); // 120*50*1
    }

    #[test]
    fn option_sell_margins_on_underlying() {
        let r = request(OrderAction::Sell, 1, PriceType::Market, None, None, Product::Nrml);
        let m = required_margin(
            &r,
            InstrumentType::PutOption,
            50,
            120.0,
            22000.0,
            &Leverages::default(),
        );
        assert_eq!(m, 110_000.0); // 22000*50*1/10
    }

    #[test]
    fn sbin_limit_buy_margins_differ_at_place_and_fill() {
        // LIMIT BUY 10 SBIN @ 500, fills at 499: margin blocks at the limit
        // price — 500·10/5 = 1000; the fill itself books 499·10/5 = 998.
        let r = request(OrderAction::Buy, 10, PriceType::Limit, Some(500.0), None, Product::Mis);
        let at_fill = required_margin(
            &request(OrderAction::Buy, 10, PriceType::Limit, Some(499.0), None, Product::Mis),
            InstrumentType::Equity,
            1,
            499.0,
            0.0,
            &Leverages::default(),
        );
        assert_eq!(at_fill, 998.0);
        let at_place =
            required_margin(&r, InstrumentType::Equity, 1, 500.0, 0.0, &Leverages::default());
        assert_eq!(at_place, 1000.0);
    }
}
