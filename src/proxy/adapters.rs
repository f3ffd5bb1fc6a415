// =============================================================================
// Adapter Pool — per-(user, broker) adapter lifecycle
// =============================================================================
//
// At most one live adapter exists per (user, broker). The first client
// needing it instantiates, initializes, and connects it; the last client
// leaving either releases only the subscriptions (brokers with a disconnect
// cooldown) or tears the adapter down entirely.
//
// Credentials are decrypted on demand, handed to `initialize`, and dropped;
// plaintext never sits in the pool.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::auth::AuthService;
use crate::broker::factory::AdapterFactory;
use crate::broker::{BrokerAdapter, BrokerCapabilities};
use crate::error::GatewayError;
use crate::proxy::subscriptions::ClientId;

struct PoolEntry {
    adapter: Arc<dyn BrokerAdapter>,
    capabilities: BrokerCapabilities,
    clients: HashSet<ClientId>,
}

pub struct AdapterPool {
    factory: Arc<AdapterFactory>,
    auth: Arc<AuthService>,
    /// (user_id, broker_name) -> live adapter. The async mutex serializes
    /// lifecycle transitions; adapter calls happen outside it.
    entries: Mutex<HashMap<(String, String), PoolEntry>>,
}

impl AdapterPool {
    pub fn new(factory: Arc<AdapterFactory>, auth: Arc<AuthService>) -> Self {
        Self { factory, auth, entries: Mutex::new(HashMap::new()) }
    }

    /// The live adapter for (user, broker), creating and connecting it on
    /// first need. The client is attached either way.
    pub async fn ensure(
        &self,
        user_id: &str,
        broker: &str,
        client: ClientId,
    ) -> Result<Arc<dyn BrokerAdapter>, GatewayError> {
        let key = (user_id.to_string(), broker.to_string());

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&key) {
            entry.clients.insert(client);
            return Ok(entry.adapter.clone());
        }

        let (adapter, capabilities) = self.factory.create(broker)?;

        // Decrypt-on-demand: the credential value lives only for this call.
        let creds = self.auth.broker_credentials(user_id, broker)?;
        if let Err(e) = adapter.initialize(creds).await {
            return Err(GatewayError::from(e));
        }
        if let Err(e) = adapter.connect().await {
            return Err(GatewayError::from(e));
        }

        info!(user_id, broker, "adapter instantiated and connected");
        let mut clients = HashSet::new();
        clients.insert(client);
        entries.insert(key, PoolEntry { adapter: adapter.clone(), capabilities, clients });
        Ok(adapter)
    }

    /// The adapter for (user, broker) if one is live.
    pub async fn get(&self, user_id: &str, broker: &str) -> Option<Arc<dyn BrokerAdapter>> {
        self.entries
            .lock()
            .await
            .get(&(user_id.to_string(), broker.to_string()))
            .map(|e| e.adapter.clone())
    }

    /// Detach a client from every adapter it touched. When an adapter loses
    /// its last client:
    ///   - cooldown brokers get `unsubscribe_all()` and stay connected;
    ///   - everyone else gets `disconnect()` and is dropped from the pool.
    pub async fn detach_client(&self, client: ClientId) {
        let mut entries = self.entries.lock().await;
        let mut to_release = Vec::new();
        let mut to_drop = Vec::new();

        for (key, entry) in entries.iter_mut() {
            if !entry.clients.remove(&client) {
                continue;
            }
            if entry.clients.is_empty() {
                if entry.capabilities.persistent_on_client_disconnect {
                    to_release.push((key.clone(), entry.adapter.clone()));
                } else {
                    to_drop.push(key.clone());
                }
            }
        }

        let dropped: Vec<(String, String, Arc<dyn BrokerAdapter>)> = to_drop
            .into_iter()
            .filter_map(|key| {
                entries
                    .remove(&key)
                    .map(|entry| (key.0, key.1, entry.adapter))
            })
            .collect();
        drop(entries);

        for ((user, broker), adapter) in to_release {
            if let Err(e) = adapter.unsubscribe_all().await {
                warn!(user, broker, error = %e, "unsubscribe_all failed on last disconnect");
            } else {
                info!(user, broker, "last client left — subscriptions released, session kept warm");
            }
        }
        for (user, broker, adapter) in dropped {
            adapter.disconnect().await;
            info!(user, broker, "last client left — adapter disconnected and released");
        }
    }

    /// Disconnect everything (process shutdown).
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<dyn BrokerAdapter>> = {
            let mut map = self.entries.lock().await;
            map.drain().map(|(_, e)| e.adapter).collect()
        };
        for adapter in entries {
            adapter.disconnect().await;
        }
    }

    /// Attach an already-built adapter (tests and the sandbox quote path).
    pub async fn install(
        &self,
        user_id: &str,
        broker: &str,
        adapter: Arc<dyn BrokerAdapter>,
        capabilities: BrokerCapabilities,
        client: ClientId,
    ) {
        let mut clients = HashSet::new();
        clients.insert(client);
        self.entries.lock().await.insert(
            (user_id.to_string(), broker.to_string()),
            PoolEntry { adapter, capabilities, clients },
        );
    }
}

impl std::fmt::Debug for AdapterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterPool").finish_non_exhaustive()
    }
}
