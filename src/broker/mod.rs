// =============================================================================
// Broker Adapter Contract — the uniform capability surface per broker
// =============================================================================
//
// Order operations are synchronous request/response within a per-broker
// timeout. Streaming operations are cooperative: connect/subscribe feed the
// pub/sub bus from the adapter's receive loop.
//
// `unsubscribe_all` sends unsubscribe messages but does NOT tear down the
// connection — brokers with a server-side cooldown after a clean disconnect
// (Flattrade, Shoonya) set `persistent_on_client_disconnect` and keep their
// socket warm across client churn.
// =============================================================================

pub mod factory;
pub mod noren;
pub mod upstox;
pub mod xts;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

use crate::types::{
    Candle, Exchange, FundLimits, Holding, Order, OrderModify, OrderRequest, Position,
    SubscriptionMode, TickPayload, Trade,
};

/// Default timeout for outbound broker calls.
pub const BROKER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Errors
// =============================================================================

/// Kinds of broker failure the gateway distinguishes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker rejected the request: {0}")]
    InvalidInput(String),

    /// The session token is dead. Non-retryable; the caller must revoke the
    /// stored broker session and force a re-login.
    #[error("broker session token invalid or expired")]
    InvalidToken,

    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Transient transport failure. Retryable once on idempotent reads.
    #[error("broker network error: {0}")]
    Network(String),

    #[error("broker call timed out")]
    Timeout,
}

impl BrokerError {
    /// Safe to retry exactly once — only transient transport kinds, and the
    /// caller must additionally ensure the operation is an idempotent read.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

// =============================================================================
// Credentials & capabilities
// =============================================================================

/// How a broker authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStyle {
    OAuth2,
    ApiKeyPair,
    SessionToken,
}

/// Decrypted credentials handed to `initialize`. Fields are zeroized when
/// the value drops; adapters must not copy them into long-lived state beyond
/// what signing requires.
pub struct BrokerCredentials {
    pub api_key: Zeroizing<String>,
    pub api_secret: Zeroizing<String>,
    pub access_token: Option<Zeroizing<String>>,
    pub feed_token: Option<Zeroizing<String>>,
    /// Second credential pair for brokers that segregate market data.
    pub market_api_key: Option<Zeroizing<String>>,
    pub market_api_secret: Option<Zeroizing<String>>,
}

impl BrokerCredentials {
    pub fn from_tokens(api_key: &str, api_secret: &str, access_token: Option<&str>) -> Self {
        Self {
            api_key: Zeroizing::new(api_key.to_string()),
            api_secret: Zeroizing::new(api_secret.to_string()),
            access_token: access_token.map(|t| Zeroizing::new(t.to_string())),
            feed_token: None,
            market_api_key: None,
            market_api_secret: None,
        }
    }
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Declarative adapter capabilities, discoverable at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerCapabilities {
    /// Symbols one feed connection can carry.
    pub max_symbols_per_connection: usize,
    /// Upstream price scale; published prices are divided by this.
    pub price_divisor: f64,
    /// True for brokers with a server-side cooldown after clean disconnect;
    /// the proxy keeps the adapter alive across client churn.
    pub persistent_on_client_disconnect: bool,
    /// True for XTS-class brokers needing a second credential pair.
    pub requires_market_data_creds: bool,
    pub authentication_style: AuthStyle,
}

impl Default for BrokerCapabilities {
    fn default() -> Self {
        Self {
            max_symbols_per_connection: 1000,
            price_divisor: 1.0,
            persistent_on_client_disconnect: false,
            requires_market_data_creds: false,
            authentication_style: AuthStyle::ApiKeyPair,
        }
    }
}

// =============================================================================
// Adapter contract
// =============================================================================

/// The capability contract every broker implements. One live adapter exists
/// per (user, broker); the streaming proxy owns its lifecycle.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn broker_name(&self) -> &str;

    /// Install credentials and perform whatever login handshake the broker
    /// needs. Must be called before any other operation.
    async fn initialize(&self, creds: BrokerCredentials) -> Result<(), BrokerError>;

    // --- Order operations (synchronous) -------------------------------------

    async fn place_order(&self, request: &OrderRequest) -> Result<String, BrokerError>;
    async fn modify_order(
        &self,
        broker_order_id: &str,
        fields: &OrderModify,
    ) -> Result<(), BrokerError>;
    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    async fn orderbook(&self) -> Result<Vec<Order>, BrokerError>;
    async fn tradebook(&self) -> Result<Vec<Trade>, BrokerError>;
    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;
    async fn holdings(&self) -> Result<Vec<Holding>, BrokerError>;
    async fn funds(&self) -> Result<FundLimits, BrokerError>;

    async fn quote(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError>;
    async fn depth(&self, symbol: &str, exchange: Exchange) -> Result<TickPayload, BrokerError>;
    async fn history(
        &self,
        symbol: &str,
        exchange: Exchange,
        interval: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, BrokerError>;

    // --- Streaming operations (cooperative) ---------------------------------

    async fn connect(&self) -> Result<(), BrokerError>;
    async fn disconnect(&self);

    async fn subscribe(
        &self,
        symbol: &str,
        exchange: Exchange,
        mode: SubscriptionMode,
        depth_level: Option<u8>,
    ) -> Result<(), BrokerError>;

    async fn unsubscribe(
        &self,
        symbol: &str,
        exchange: Exchange,
        mode: SubscriptionMode,
    ) -> Result<(), BrokerError>;

    /// Unsubscribe every active symbol but keep the connection up.
    async fn unsubscribe_all(&self) -> Result<(), BrokerError>;
}

// =============================================================================
// Normalization helpers
// =============================================================================

/// Scale an upstream price by the broker's divisor and round half-up to two
/// decimals (paise-quoting brokers publish integers).
pub fn normalize_price(raw: f64, divisor: f64) -> f64 {
    let scaled = if divisor > 0.0 { raw / divisor } else { raw };
    (scaled * 100.0).round() / 100.0
}

/// Retry a transient failure exactly once with a short backoff. Only for
/// idempotent reads — order placement must never pass through here.
pub async fn retry_once_on_transient<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!(op = op_name, error = %e, "transient broker error — retrying once");
            tokio::time::sleep(Duration::from_millis(250)).await;
            op().await
        }
        other => other,
    }
}

/// Apply the standard call timeout to a broker future.
pub async fn with_timeout<T, Fut>(fut: Fut) -> Result<T, BrokerError>
where
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(BROKER_CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn price_normalization_divides_and_rounds() {
        assert_eq!(normalize_price(245050.0, 100.0), 2450.5);
        assert_eq!(normalize_price(2450.505, 1.0), 2450.51);
        assert_eq!(normalize_price(99.994, 1.0), 99.99);
        // A zero divisor must not wipe the price out.
        assert_eq!(normalize_price(10.0, 0.0), 10.0);
    }

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Network("reset".into()).is_transient());
        assert!(BrokerError::Timeout.is_transient());
        assert!(!BrokerError::InvalidToken.is_transient());
        assert!(!BrokerError::OrderRejected("margin".into()).is_transient());
    }

    #[tokio::test]
    async fn retry_once_recovers_from_single_transient() {
        let calls = AtomicU32::new(0);
        let result = retry_once_on_transient("quote", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BrokerError::Network("reset".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_once_gives_up_after_second_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = retry_once_on_transient("quote", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::Timeout) }
        })
        .await;
        assert_eq!(result, Err(BrokerError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = retry_once_on_transient("place", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::InvalidToken) }
        })
        .await;
        assert_eq!(result, Err(BrokerError::InvalidToken));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = BrokerCredentials::from_tokens("k-123", "s-456", Some("t-789"));
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("k-123"));
        assert!(!dbg.contains("s-456"));
        assert!(!dbg.contains("t-789"));
    }
}
