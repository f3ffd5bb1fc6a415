// =============================================================================
// Shared types used across the Meridian gateway
// =============================================================================
//
// The canonical domain model: orders, trades, positions, and the normalized
// tick wire shapes every broker adapter must publish. Brokers differ wildly
// in naming and scaling; everything past the adapter boundary speaks these
// types only.
// =============================================================================

use chrono::{FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Exchanges
// =============================================================================

/// Exchanges the gateway routes to. `NSE_INDEX` and `BSE_INDEX` are synthetic
/// index "exchanges" whose wire token contains an underscore — topic parsing
/// must treat them atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    #[serde(rename = "NSE")]
    Nse,
    #[serde(rename = "BSE")]
    Bse,
    #[serde(rename = "NFO")]
    Nfo,
    #[serde(rename = "BFO")]
    Bfo,
    #[serde(rename = "MCX")]
    Mcx,
    #[serde(rename = "CDS")]
    Cds,
    #[serde(rename = "BCD")]
    Bcd,
    #[serde(rename = "NCDEX")]
    Ncdex,
    #[serde(rename = "NSE_INDEX")]
    NseIndex,
    #[serde(rename = "BSE_INDEX")]
    BseIndex,
}

impl Exchange {
    /// All exchanges, in wire-token order. Multi-token entries first so
    /// prefix matching consumes them before their substrings.
    pub const ALL: [Exchange; 10] = [
        Exchange::NseIndex,
        Exchange::BseIndex,
        Exchange::Nse,
        Exchange::Bse,
        Exchange::Nfo,
        Exchange::Bfo,
        Exchange::Mcx,
        Exchange::Cds,
        Exchange::Bcd,
        Exchange::Ncdex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nse => "NSE",
            Self::Bse => "BSE",
            Self::Nfo => "NFO",
            Self::Bfo => "BFO",
            Self::Mcx => "MCX",
            Self::Cds => "CDS",
            Self::Bcd => "BCD",
            Self::Ncdex => "NCDEX",
            Self::NseIndex => "NSE_INDEX",
            Self::BseIndex => "BSE_INDEX",
        }
    }

    /// True for the derivatives segments where lot sizes apply.
    pub fn is_derivative(&self) -> bool {
        matches!(self, Self::Nfo | Self::Bfo | Self::Mcx | Self::Cds | Self::Bcd | Self::Ncdex)
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Exchange::ALL
            .iter()
            .find(|e| e.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown exchange '{s}'"))
    }
}

// =============================================================================
// Subscription modes
// =============================================================================

/// Market-data subscription modes, by increasing payload richness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionMode {
    Ltp,
    Quote,
    Depth,
}

impl SubscriptionMode {
    /// Numeric wire code (`LTP=1, Quote=2, Depth=3`).
    pub fn code(&self) -> u8 {
        match self {
            Self::Ltp => 1,
            Self::Quote => 2,
            Self::Depth => 3,
        }
    }

    /// Topic token (`LTP`, `QUOTE`, `DEPTH`).
    pub fn topic_token(&self) -> &'static str {
        match self {
            Self::Ltp => "LTP",
            Self::Quote => "QUOTE",
            Self::Depth => "DEPTH",
        }
    }

    pub fn from_topic_token(s: &str) -> Option<Self> {
        match s {
            "LTP" => Some(Self::Ltp),
            "QUOTE" => Some(Self::Quote),
            "DEPTH" => Some(Self::Depth),
            _ => None,
        }
    }

    /// Parse the client-facing mode field, which may be a name (`"LTP"`,
    /// `"Quote"`, `"Depth"`) or a numeric code (1/2/3).
    pub fn from_client_value(v: &serde_json::Value) -> Option<Self> {
        if let Some(n) = v.as_u64() {
            return match n {
                1 => Some(Self::Ltp),
                2 => Some(Self::Quote),
                3 => Some(Self::Depth),
                _ => None,
            };
        }
        match v.as_str()?.to_ascii_uppercase().as_str() {
            "LTP" => Some(Self::Ltp),
            "QUOTE" => Some(Self::Quote),
            "DEPTH" => Some(Self::Depth),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.topic_token())
    }
}

// =============================================================================
// Order vocabulary
// =============================================================================

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl OrderAction {
    /// +1 for BUY, -1 for SELL; the sign applied to position quantities.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order price types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "SL-M")]
    StopLossMarket,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopLoss => "SL",
            Self::StopLossMarket => "SL-M",
        }
    }

    pub fn needs_price(&self) -> bool {
        matches!(self, Self::Limit | Self::StopLoss)
    }

    pub fn needs_trigger(&self) -> bool {
        matches!(self, Self::StopLoss | Self::StopLossMarket)
    }
}

impl std::fmt::Display for PriceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product types: intraday, delivery, carry-forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Product {
    #[serde(rename = "MIS")]
    Mis,
    #[serde(rename = "CNC")]
    Cnc,
    #[serde(rename = "NRML")]
    Nrml,
}

impl Product {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mis => "MIS",
            Self::Cnc => "CNC",
            Self::Nrml => "NRML",
        }
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle status. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Complete => "COMPLETE",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "COMPLETE" => Ok(Self::Complete),
            "REJECTED" => Ok(Self::Rejected),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("unknown order status '{s}'")),
        }
    }
}

/// Per-API-key routing mode: Auto executes immediately, Semi-Auto queues
/// order placements into the Action Center for human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderMode {
    #[serde(rename = "AUTO")]
    Auto,
    #[serde(rename = "SEMI_AUTO")]
    SemiAuto,
}

impl Default for OrderMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl OrderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::SemiAuto => "SEMI_AUTO",
        }
    }
}

impl std::fmt::Display for OrderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTO" => Ok(Self::Auto),
            "SEMI_AUTO" => Ok(Self::SemiAuto),
            _ => Err(format!("unknown order mode '{s}'")),
        }
    }
}

/// Instrument classification in the contract master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentType {
    #[serde(rename = "EQ")]
    Equity,
    #[serde(rename = "FUT")]
    Future,
    #[serde(rename = "OPT-CE")]
    CallOption,
    #[serde(rename = "OPT-PE")]
    PutOption,
    #[serde(rename = "INDEX")]
    Index,
}

impl InstrumentType {
    pub fn is_option(&self) -> bool {
        matches!(self, Self::CallOption | Self::PutOption)
    }
}

// =============================================================================
// Orders, trades, positions
// =============================================================================

/// An order as submitted by a client, in canonical symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: Exchange,
    pub action: OrderAction,
    pub quantity: u32,
    #[serde(rename = "pricetype")]
    pub price_type: PriceType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default, rename = "trigger_price")]
    pub trigger_price: Option<f64>,
    pub product: Product,
}

/// Fields a client may change on an open order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderModify {
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub price_type: Option<PriceType>,
}

/// A persisted order with server-assigned identity and lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub action: OrderAction,
    pub quantity: u32,
    pub price_type: PriceType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    pub product: Product,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_quantity: u32,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub margin_blocked: f64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub broker_order_id: Option<String>,
}

/// An immutable fill record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub action: OrderAction,
    pub quantity: u32,
    pub price: f64,
    pub product: Product,
    pub timestamp: String,
}

/// Net position per (user, symbol, exchange, product). Kept at zero quantity
/// for history rather than deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub product: Product,
    /// Signed: positive long, negative short.
    pub net_quantity: i64,
    pub avg_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub ltp: f64,
}

/// A T+1 settled CNC holding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub user_id: String,
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: i64,
    pub avg_price: f64,
    #[serde(default)]
    pub ltp: f64,
    #[serde(default)]
    pub pnl: f64,
}

/// Fund limits returned by `funds()` — live broker or sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundLimits {
    #[serde(rename = "availablecash")]
    pub available_balance: f64,
    #[serde(rename = "utiliseddebits")]
    pub used_margin: f64,
    #[serde(default, rename = "m2mrealized")]
    pub realized_pnl: f64,
    #[serde(default, rename = "m2munrealized")]
    pub unrealized_pnl: f64,
}

/// One OHLCV bar from `history()`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// =============================================================================
// Normalized tick wire shapes
// =============================================================================
//
// LTP ⊂ QUOTE ⊂ DEPTH: the quote block flattens into the payload when
// present, and depth adds the ladder on top. Prices are post-divisor;
// timestamps are RFC-3339 with the fixed IST offset.
// =============================================================================

/// OHLCV + best bid/ask block carried by QUOTE and DEPTH ticks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuoteFields {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
}

/// One level of the depth ladder.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: f64,
    pub orders: u32,
}

/// Buy/sell ladders carried by DEPTH ticks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DepthLevels {
    pub buy: Vec<DepthLevel>,
    pub sell: Vec<DepthLevel>,
}

/// The canonical tick every adapter publishes onto the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickPayload {
    pub symbol: String,
    pub exchange: Exchange,
    pub ltp: f64,
    pub timestamp: String,
    #[serde(flatten)]
    pub quote: Option<QuoteFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<DepthLevels>,
}

impl TickPayload {
    pub fn ltp(symbol: impl Into<String>, exchange: Exchange, ltp: f64) -> Self {
        Self {
            symbol: symbol.into(),
            exchange,
            ltp,
            timestamp: ist_timestamp(),
            quote: None,
            depth: None,
        }
    }

    pub fn with_quote(mut self, quote: QuoteFields) -> Self {
        self.quote = Some(quote);
        self
    }

    pub fn with_depth(mut self, depth: DepthLevels) -> Self {
        self.depth = Some(depth);
        self
    }

    /// The richest mode this payload can serve.
    pub fn mode(&self) -> SubscriptionMode {
        if self.depth.is_some() {
            SubscriptionMode::Depth
        } else if self.quote.is_some() {
            SubscriptionMode::Quote
        } else {
            SubscriptionMode::Ltp
        }
    }
}

/// The fixed IST offset (+05:30) used for every tick timestamp.
pub fn ist_offset() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 1800).expect("valid fixed offset")
}

/// Current time as RFC-3339 with the fixed IST offset.
pub fn ist_timestamp() -> String {
    Utc::now()
        .with_timezone(&ist_offset())
        .to_rfc3339_opts(SecondsFormat::Millis, false)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_roundtrip_includes_index_tokens() {
        for e in Exchange::ALL {
            let parsed: Exchange = e.as_str().parse().unwrap();
            assert_eq!(parsed, e);
        }
        assert_eq!("NSE_INDEX".parse::<Exchange>().unwrap(), Exchange::NseIndex);
        assert!("NYSE".parse::<Exchange>().is_err());
    }

    #[test]
    fn mode_codes_match_wire_protocol() {
        assert_eq!(SubscriptionMode::Ltp.code(), 1);
        assert_eq!(SubscriptionMode::Quote.code(), 2);
        assert_eq!(SubscriptionMode::Depth.code(), 3);
    }

    #[test]
    fn mode_parses_names_and_codes() {
        use serde_json::json;
        assert_eq!(
            SubscriptionMode::from_client_value(&json!("Quote")),
            Some(SubscriptionMode::Quote)
        );
        assert_eq!(
            SubscriptionMode::from_client_value(&json!(3)),
            Some(SubscriptionMode::Depth)
        );
        assert_eq!(SubscriptionMode::from_client_value(&json!("candles")), None);
    }

    #[test]
    fn price_type_serde_uses_broker_tokens() {
        let sl: PriceType = serde_json::from_str("\"SL-M\"").unwrap();
        assert_eq!(sl, PriceType::StopLossMarket);
        assert_eq!(serde_json::to_string(&PriceType::StopLoss).unwrap(), "\"SL\"");
    }

    #[test]
    fn ltp_tick_serializes_flat() {
        let tick = TickPayload::ltp("RELIANCE", Exchange::Nse, 2450.5);
        let v = serde_json::to_value(&tick).unwrap();
        assert_eq!(v["symbol"], "RELIANCE");
        assert_eq!(v["exchange"], "NSE");
        assert_eq!(v["ltp"], 2450.5);
        assert!(v.get("open").is_none());
        assert!(v.get("depth").is_none());
    }

    #[test]
    fn quote_tick_flattens_ohlc_fields() {
        let tick = TickPayload::ltp("SBIN", Exchange::Nse, 500.0).with_quote(QuoteFields {
            open: 495.0,
            high: 502.0,
            low: 494.0,
            close: 498.0,
            volume: 1_000_000.0,
            bid: 499.95,
            ask: 500.05,
            bid_qty: 150.0,
            ask_qty: 90.0,
        });
        assert_eq!(tick.mode(), SubscriptionMode::Quote);
        let v = serde_json::to_value(&tick).unwrap();
        assert_eq!(v["open"], 495.0);
        assert_eq!(v["bid_qty"], 150.0);
    }

    #[test]
    fn depth_tick_is_richest_mode() {
        let tick = TickPayload::ltp("NIFTY", Exchange::NseIndex, 22000.0)
            .with_quote(QuoteFields::default())
            .with_depth(DepthLevels {
                buy: vec![DepthLevel { price: 21999.0, qty: 50.0, orders: 3 }],
                sell: vec![DepthLevel { price: 22001.0, qty: 25.0, orders: 1 }],
            });
        assert_eq!(tick.mode(), SubscriptionMode::Depth);
    }

    #[test]
    fn ist_timestamp_carries_fixed_offset() {
        let ts = ist_timestamp();
        assert!(ts.ends_with("+05:30"), "timestamp {ts} missing IST offset");
    }

    #[test]
    fn terminal_statuses_are_absorbing() {
        assert!(!OrderStatus::Open.is_terminal());
        assert!(OrderStatus::Complete.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
    }
}
