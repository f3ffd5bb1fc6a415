// =============================================================================
// Adapter Factory — exhaustive startup registration
// =============================================================================
//
// Every broker registers a constructor and its capability record at startup;
// `create` hands out a fresh, uninitialized adapter per call. There is no
// dynamic discovery: an unregistered name is an `UnknownBroker` error, and
// adding a broker is a one-line registration.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::broker::noren::NorenAdapter;
use crate::broker::upstox::UpstoxAdapter;
use crate::broker::xts::XtsAdapter;
use crate::broker::{BrokerAdapter, BrokerCapabilities};
use crate::bus::{BusPublisher, MarketDataBus};
use crate::error::GatewayError;

/// Builds one adapter instance around a bus publish handle.
pub type AdapterConstructor =
    Arc<dyn Fn(BusPublisher) -> Arc<dyn BrokerAdapter> + Send + Sync>;

struct Registration {
    constructor: AdapterConstructor,
    capabilities: BrokerCapabilities,
}

/// The broker registry. Registration happens at startup (or on-demand for
/// tests); creation is cheap and lock-brief.
pub struct AdapterFactory {
    registry: RwLock<HashMap<String, Registration>>,
    bus: Arc<MarketDataBus>,
}

impl AdapterFactory {
    pub fn new(bus: Arc<MarketDataBus>) -> Self {
        Self { registry: RwLock::new(HashMap::new()), bus }
    }

    /// Register a broker under `name`. Re-registration replaces the previous
    /// entry (used by tests to install stubs).
    pub fn register(
        &self,
        name: &str,
        constructor: AdapterConstructor,
        capabilities: BrokerCapabilities,
    ) {
        info!(
            broker = name,
            persistent = capabilities.persistent_on_client_disconnect,
            max_symbols = capabilities.max_symbols_per_connection,
            "broker registered"
        );
        self.registry
            .write()
            .insert(name.to_string(), Registration { constructor, capabilities });
    }

    /// Capability record for a registered broker.
    pub fn capabilities(&self, name: &str) -> Result<BrokerCapabilities, GatewayError> {
        self.registry
            .read()
            .get(name)
            .map(|r| r.capabilities.clone())
            .ok_or_else(|| GatewayError::UnknownBroker { name: name.to_string() })
    }

    /// Registered broker names, sorted.
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a fresh, uninitialized adapter for `name`.
    pub fn create(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn BrokerAdapter>, BrokerCapabilities), GatewayError> {
        let registry = self.registry.read();
        let registration = registry
            .get(name)
            .ok_or_else(|| GatewayError::UnknownBroker { name: name.to_string() })?;

        let publisher = self.bus.publisher(name);
        let adapter = (registration.constructor)(publisher);
        Ok((adapter, registration.capabilities.clone()))
    }
}

impl std::fmt::Debug for AdapterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterFactory")
            .field("registered", &self.registered())
            .finish()
    }
}

// =============================================================================
// Stock registrations
// =============================================================================

/// Register the brokers this build ships with.
///
/// The cooldown quirk is a per-broker capability, not a contract property:
/// exactly Flattrade and Shoonya carry `persistent_on_client_disconnect`
/// today. A broker later found to impose a cooldown gets its flag flipped
/// here, nothing else changes.
pub fn register_stock_brokers(factory: &AdapterFactory) {
    for name in ["flattrade", "shoonya"] {
        let broker = name.to_string();
        factory.register(
            name,
            Arc::new(move |publisher| {
                Arc::new(NorenAdapter::new(broker.clone(), publisher)) as Arc<dyn BrokerAdapter>
            }),
            NorenAdapter::capabilities(),
        );
    }

    factory.register(
        "xts",
        Arc::new(|publisher| Arc::new(XtsAdapter::new(publisher)) as Arc<dyn BrokerAdapter>),
        XtsAdapter::capabilities(),
    );

    factory.register(
        "upstox",
        Arc::new(|publisher| Arc::new(UpstoxAdapter::new(publisher)) as Arc<dyn BrokerAdapter>),
        UpstoxAdapter::capabilities(),
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> AdapterFactory {
        let bus = Arc::new(MarketDataBus::new("127.0.0.1:5555"));
        let f = AdapterFactory::new(bus);
        register_stock_brokers(&f);
        f
    }

    #[test]
    fn stock_brokers_are_registered() {
        let f = factory();
        assert_eq!(f.registered(), vec!["flattrade", "shoonya", "upstox", "xts"]);
    }

    #[test]
    fn unknown_broker_is_an_error() {
        let f = factory();
        assert!(matches!(
            f.create("zerodha"),
            Err(GatewayError::UnknownBroker { .. })
        ));
        assert!(matches!(
            f.capabilities("zerodha"),
            Err(GatewayError::UnknownBroker { .. })
        ));
    }

    #[test]
    fn cooldown_flag_set_only_for_noren_family() {
        let f = factory();
        assert!(f.capabilities("flattrade").unwrap().persistent_on_client_disconnect);
        assert!(f.capabilities("shoonya").unwrap().persistent_on_client_disconnect);
        assert!(!f.capabilities("xts").unwrap().persistent_on_client_disconnect);
        assert!(!f.capabilities("upstox").unwrap().persistent_on_client_disconnect);
    }

    #[test]
    fn created_adapters_are_fresh_instances() {
        let f = factory();
        let (a, _) = f.create("flattrade").unwrap();
        let (b, _) = f.create("flattrade").unwrap();
        assert_eq!(a.broker_name(), "flattrade");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn xts_requires_market_data_creds_and_paise_divisor() {
        let f = factory();
        let caps = f.capabilities("xts").unwrap();
        assert!(caps.requires_market_data_creds);
        assert_eq!(caps.price_divisor, 100.0);
    }
}
