// =============================================================================
// Market-Data Pub/Sub Bus — topic-routed, best-effort, drop-oldest
// =============================================================================
//
// Publishers are broker adapter receive loops; the single subscriber is the
// streaming proxy. A publish never blocks: each publisher owns a bounded
// ring (SEND_HWM messages) and overflow drops the oldest buffered tick —
// loss is preferable to backpressure into a broker socket.
//
// Ordering: FIFO per publisher, nothing across publishers.
//
// The bus is in-process; BUS_HOST/BUS_PORT name its advertised endpoint for
// the day the proxy moves to its own process.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::{Exchange, SubscriptionMode, TickPayload};

/// Per-publisher high-water mark: buffered messages beyond this are dropped
/// oldest-first.
pub const SEND_HWM: usize = 1000;
/// How long `close` lingers for the subscriber to drain buffered messages.
pub const SHUTDOWN_LINGER: Duration = Duration::from_secs(1);

// =============================================================================
// Topic grammar
// =============================================================================

/// A parsed bus topic: `BROKER_EXCHANGE_SYMBOL_MODE`.
///
/// `NSE_INDEX` and `BSE_INDEX` contain an underscore and are consumed
/// atomically before the remaining fields split. The broker token carries no
/// underscore; the symbol may.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub broker: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub mode: SubscriptionMode,
}

impl Topic {
    pub fn new(
        broker: impl Into<String>,
        exchange: Exchange,
        symbol: impl Into<String>,
        mode: SubscriptionMode,
    ) -> Self {
        Self { broker: broker.into(), exchange, symbol: symbol.into(), mode }
    }

    /// Format as the wire string.
    pub fn format(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.broker,
            self.exchange.as_str(),
            self.symbol,
            self.mode.topic_token()
        )
    }

    /// Parse a wire topic. Inverse of [`Topic::format`] for every canonical
    /// (broker, exchange, symbol, mode).
    pub fn parse(raw: &str) -> Option<Self> {
        // Broker: everything before the first underscore.
        let (broker, rest) = raw.split_once('_')?;
        if broker.is_empty() {
            return None;
        }

        // Mode: everything after the last underscore.
        let (rest, mode_token) = rest.rsplit_once('_')?;
        let mode = SubscriptionMode::from_topic_token(mode_token)?;

        // Exchange: longest-token prefix match so NSE_INDEX/BSE_INDEX are
        // consumed whole before NSE/BSE could match. A prefix hit that is not
        // followed by '_' is spurious (e.g. symbol INDEXA on NSE) and falls
        // through to the next token.
        for exchange in Exchange::ALL {
            let token = exchange.as_str();
            if let Some(after) = rest.strip_prefix(token) {
                if let Some(symbol) = after.strip_prefix('_') {
                    if !symbol.is_empty() {
                        return Some(Self::new(broker, exchange, symbol, mode));
                    }
                }
            }
        }
        None
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

// =============================================================================
// Messages
// =============================================================================

/// One message in flight on the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: Topic,
    pub payload: TickPayload,
}

// =============================================================================
// Bus internals
// =============================================================================

struct PublisherQueue {
    name: String,
    buf: Mutex<VecDeque<BusMessage>>,
    dropped: AtomicU64,
}

struct BusShared {
    publishers: RwLock<Vec<Arc<PublisherQueue>>>,
    notify: Notify,
    closed: AtomicBool,
    hwm: usize,
    endpoint: String,
}

/// Handle held by one adapter's receive loop. Publishing is lock-brief and
/// never blocks; FIFO holds within this handle.
#[derive(Clone)]
pub struct BusPublisher {
    queue: Arc<PublisherQueue>,
    shared: Arc<BusShared>,
}

impl BusPublisher {
    /// Buffer a message for the subscriber. On overflow the oldest buffered
    /// message is dropped.
    pub fn publish(&self, topic: Topic, payload: TickPayload) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }

        {
            let mut buf = self.queue.buf.lock();
            if buf.len() >= self.shared.hwm {
                buf.pop_front();
                let dropped = self.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 1000 == 1 {
                    warn!(
                        publisher = %self.queue.name,
                        dropped,
                        "bus overflow — dropping oldest"
                    );
                }
            }
            buf.push_back(BusMessage { topic, payload });
        }

        self.shared.notify.notify_one();
    }

    /// Messages dropped from this publisher's ring so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusPublisher").field("name", &self.queue.name).finish()
    }
}

/// The bus. One subscriber (the proxy) drains every publisher's ring.
pub struct MarketDataBus {
    shared: Arc<BusShared>,
}

impl MarketDataBus {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_hwm(endpoint, SEND_HWM)
    }

    pub fn with_hwm(endpoint: impl Into<String>, hwm: usize) -> Self {
        let endpoint = endpoint.into();
        debug!(endpoint = %endpoint, hwm, "market data bus created");
        Self {
            shared: Arc::new(BusShared {
                publishers: RwLock::new(Vec::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                hwm,
                endpoint,
            }),
        }
    }

    /// The advertised endpoint (from BUS_HOST/BUS_PORT).
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Obtain a publish handle. One per adapter receive loop.
    pub fn publisher(&self, name: impl Into<String>) -> BusPublisher {
        let queue = Arc::new(PublisherQueue {
            name: name.into(),
            buf: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        });
        self.shared.publishers.write().push(queue.clone());
        BusPublisher { queue, shared: self.shared.clone() }
    }

    /// Receive the next message, awaiting if every ring is empty. Returns
    /// `None` once the bus is closed and fully drained.
    pub async fn recv(&self) -> Option<BusMessage> {
        loop {
            // Register interest before scanning so a publish between the
            // scan and the await still wakes us.
            let notified = self.shared.notify.notified();

            if let Some(msg) = self.try_recv() {
                return Some(msg);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    /// Non-blocking drain: the first buffered message from any publisher,
    /// scanning publishers round-robin-ish (registration order).
    pub fn try_recv(&self) -> Option<BusMessage> {
        let publishers = self.shared.publishers.read();
        for queue in publishers.iter() {
            if let Some(msg) = queue.buf.lock().pop_front() {
                return Some(msg);
            }
        }
        None
    }

    /// Close the bus. Publishes after this are dropped; `recv` drains what
    /// is buffered and then returns `None`. Callers should allow
    /// [`SHUTDOWN_LINGER`] for the drain.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

impl std::fmt::Debug for MarketDataBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataBus")
            .field("endpoint", &self.shared.endpoint)
            .field("publishers", &self.shared.publishers.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, ltp: f64) -> TickPayload {
        TickPayload::ltp(symbol, Exchange::Nse, ltp)
    }

    #[test]
    fn topic_roundtrip_plain_exchange() {
        let t = Topic::new("flattrade", Exchange::Nse, "RELIANCE", SubscriptionMode::Ltp);
        assert_eq!(t.format(), "flattrade_NSE_RELIANCE_LTP");
        assert_eq!(Topic::parse(&t.format()), Some(t));
    }

    #[test]
    fn topic_roundtrip_index_exchanges() {
        for exchange in [Exchange::NseIndex, Exchange::BseIndex] {
            let t = Topic::new("shoonya", exchange, "NIFTY", SubscriptionMode::Quote);
            let parsed = Topic::parse(&t.format()).unwrap();
            assert_eq!(parsed.exchange, exchange);
            assert_eq!(parsed.symbol, "NIFTY");
        }
    }

    #[test]
    fn topic_symbol_may_contain_underscores() {
        let t = Topic::new("xts", Exchange::NseIndex, "NIFTY_50", SubscriptionMode::Depth);
        assert_eq!(Topic::parse("xts_NSE_INDEX_NIFTY_50_DEPTH"), Some(t));
    }

    #[test]
    fn spurious_index_prefix_falls_through() {
        // An NSE symbol that happens to start with "INDEX" must not be
        // swallowed by the NSE_INDEX token.
        let parsed = Topic::parse("xts_NSE_INDEXA_LTP").unwrap();
        assert_eq!(parsed.exchange, Exchange::Nse);
        assert_eq!(parsed.symbol, "INDEXA");
    }

    #[test]
    fn topic_rejects_malformed_strings() {
        assert_eq!(Topic::parse(""), None);
        assert_eq!(Topic::parse("flattrade"), None);
        assert_eq!(Topic::parse("flattrade_NSE_RELIANCE"), None);
        assert_eq!(Topic::parse("flattrade_NSE_RELIANCE_CANDLE"), None);
        assert_eq!(Topic::parse("flattrade_NYSE_AAPL_LTP"), None);
        assert_eq!(Topic::parse("flattrade_NSE__LTP"), None);
    }

    #[tokio::test]
    async fn publish_then_recv_preserves_fifo() {
        let bus = MarketDataBus::new("127.0.0.1:5555");
        let publisher = bus.publisher("flattrade");
        let topic = Topic::new("flattrade", Exchange::Nse, "SBIN", SubscriptionMode::Ltp);

        for i in 0..5 {
            publisher.publish(topic.clone(), tick("SBIN", 500.0 + i as f64));
        }

        for i in 0..5 {
            let msg = bus.recv().await.unwrap();
            assert_eq!(msg.payload.ltp, 500.0 + i as f64);
        }
        assert!(bus.try_recv().is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_never_blocks() {
        let bus = MarketDataBus::with_hwm("127.0.0.1:5555", 3);
        let publisher = bus.publisher("flattrade");
        let topic = Topic::new("flattrade", Exchange::Nse, "SBIN", SubscriptionMode::Ltp);

        for i in 0..10 {
            publisher.publish(topic.clone(), tick("SBIN", i as f64));
        }
        assert_eq!(publisher.dropped(), 7);

        // The surviving messages are the newest three, still in order.
        let mut got = Vec::new();
        while let Some(msg) = bus.try_recv() {
            got.push(msg.payload.ltp);
        }
        assert_eq!(got, vec![7.0, 8.0, 9.0]);
    }

    #[tokio::test]
    async fn closed_bus_drains_then_ends() {
        let bus = MarketDataBus::new("127.0.0.1:5555");
        let publisher = bus.publisher("flattrade");
        let topic = Topic::new("flattrade", Exchange::Nse, "SBIN", SubscriptionMode::Ltp);

        publisher.publish(topic.clone(), tick("SBIN", 1.0));
        bus.close();
        publisher.publish(topic, tick("SBIN", 2.0)); // dropped

        assert_eq!(bus.recv().await.unwrap().payload.ltp, 1.0);
        assert!(bus.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = Arc::new(MarketDataBus::new("127.0.0.1:5555"));
        let publisher = bus.publisher("flattrade");
        let topic = Topic::new("flattrade", Exchange::Nse, "SBIN", SubscriptionMode::Ltp);

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(topic, tick("SBIN", 42.0));

        let msg = waiter.await.unwrap().unwrap();
        assert_eq!(msg.payload.ltp, 42.0);
    }
}
