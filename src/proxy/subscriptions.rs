// =============================================================================
// Subscription Index — O(1) fan-out routing
// =============================================================================
//
// Two maps kept in lockstep: topic -> clients for fan-out, client -> topics
// for disconnect cleanup. Each map is guarded by a single writer lock;
// fan-out reads take a snapshot of the target set so no lock is held while
// sending.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::types::{Exchange, SubscriptionMode};

/// Identifier the proxy assigns to each WebSocket client.
pub type ClientId = u64;

/// One routing key: (symbol, exchange, mode).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubKey {
    pub symbol: String,
    pub exchange: Exchange,
    pub mode: SubscriptionMode,
}

impl SubKey {
    pub fn new(symbol: impl Into<String>, exchange: Exchange, mode: SubscriptionMode) -> Self {
        Self { symbol: symbol.into(), exchange, mode }
    }
}

#[derive(Default)]
pub struct SubscriptionIndex {
    by_topic: RwLock<HashMap<SubKey, HashSet<ClientId>>>,
    by_client: RwLock<HashMap<ClientId, HashSet<SubKey>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Returns true when this is the key's first
    /// subscriber (the caller then subscribes at broker level).
    pub fn add(&self, client: ClientId, key: SubKey) -> bool {
        let mut by_topic = self.by_topic.write();
        let clients = by_topic.entry(key.clone()).or_default();
        let first = clients.is_empty();
        clients.insert(client);
        drop(by_topic);

        self.by_client.write().entry(client).or_default().insert(key);
        first
    }

    /// Remove one subscription. Returns true when the key has no remaining
    /// subscribers (the caller then unsubscribes at broker level).
    pub fn remove(&self, client: ClientId, key: &SubKey) -> bool {
        let mut by_topic = self.by_topic.write();
        let emptied = if let Some(clients) = by_topic.get_mut(key) {
            clients.remove(&client);
            if clients.is_empty() {
                by_topic.remove(key);
                true
            } else {
                false
            }
        } else {
            false
        };
        drop(by_topic);

        if let Some(keys) = self.by_client.write().get_mut(&client) {
            keys.remove(key);
        }
        emptied
    }

    /// Remove every subscription a client holds for (symbol, exchange),
    /// across modes. Returns the removed keys and whether each was emptied.
    pub fn remove_symbol(
        &self,
        client: ClientId,
        symbol: &str,
        exchange: Exchange,
    ) -> Vec<(SubKey, bool)> {
        let keys: Vec<SubKey> = self
            .by_client
            .read()
            .get(&client)
            .map(|keys| {
                keys.iter()
                    .filter(|k| k.symbol == symbol && k.exchange == exchange)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        keys.into_iter()
            .map(|key| {
                let emptied = self.remove(client, &key);
                (key, emptied)
            })
            .collect()
    }

    /// Tear down every subscription a client holds. Returns (key, emptied)
    /// pairs for broker-level cleanup.
    pub fn remove_client(&self, client: ClientId) -> Vec<(SubKey, bool)> {
        let keys: Vec<SubKey> = self
            .by_client
            .write()
            .remove(&client)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();

        let mut by_topic = self.by_topic.write();
        keys.into_iter()
            .map(|key| {
                let emptied = if let Some(clients) = by_topic.get_mut(&key) {
                    clients.remove(&client);
                    if clients.is_empty() {
                        by_topic.remove(&key);
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };
                (key, emptied)
            })
            .collect()
    }

    /// Snapshot of the clients subscribed to a key. Copy-on-read so the
    /// caller sends without holding the lock.
    pub fn subscribers(&self, key: &SubKey) -> Vec<ClientId> {
        self.by_topic
            .read()
            .get(key)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of distinct keys a client holds.
    pub fn client_subscription_count(&self, client: ClientId) -> usize {
        self.by_client.read().get(&client).map(HashSet::len).unwrap_or(0)
    }
}

impl std::fmt::Debug for SubscriptionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionIndex")
            .field("topics", &self.by_topic.read().len())
            .field("clients", &self.by_client.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
