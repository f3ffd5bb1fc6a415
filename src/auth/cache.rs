// =============================================================================
// Two-Tier Auth Cache — bounded TTL maps for valid and invalid API keys
// =============================================================================
//
// Lookup order on every authenticated request:
//   1. invalid_keys hit  -> reject without touching the store
//   2. valid_keys hit    -> cached identity, no store hit
//   3. miss              -> caller verifies against the store and caches
//
// Both tiers are bounded; when full, the oldest entry is evicted. Entries
// expire by insertion time, not last access.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::OrderMode;

/// Default TTL for verified keys (10 hours).
pub const VALID_TTL: Duration = Duration::from_secs(10 * 3600);
/// Default TTL for rejected keys (5 minutes).
pub const INVALID_TTL: Duration = Duration::from_secs(5 * 60);
/// Default per-tier entry bound.
const MAX_ENTRIES: usize = 10_000;

/// Identity attached to a verified API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIdentity {
    pub key_id: i64,
    pub user_id: String,
    pub order_mode: OrderMode,
    /// The user's default broker binding, if any.
    pub default_broker: Option<String>,
}

struct Entry<T> {
    value: T,
    inserted: Instant,
}

struct Tier<T> {
    map: HashMap<String, Entry<T>>,
    ttl: Duration,
    cap: usize,
}

impl<T: Clone> Tier<T> {
    fn new(ttl: Duration, cap: usize) -> Self {
        Self { map: HashMap::new(), ttl, cap }
    }

    fn get(&mut self, key: &str, now: Instant) -> Option<T> {
        match self.map.get(key) {
            Some(e) if now.duration_since(e.inserted) < self.ttl => Some(e.value.clone()),
            Some(_) => {
                self.map.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: String, value: T, now: Instant) {
        if self.map.len() >= self.cap && !self.map.contains_key(&key) {
            // Evict the oldest entry to stay bounded.
            if let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| k.clone())
            {
                self.map.remove(&oldest);
            }
        }
        self.map.insert(key, Entry { value, inserted: now });
    }

    fn remove(&mut self, key: &str) {
        self.map.remove(key);
    }

    fn retain(&mut self, mut f: impl FnMut(&T) -> bool) {
        self.map.retain(|_, e| f(&e.value));
    }
}

/// The two-tier cache. One lock per tier keeps the hot read path short.
pub struct AuthCache {
    valid: Mutex<Tier<KeyIdentity>>,
    invalid: Mutex<Tier<()>>,
}

/// Result of a cache probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Key is cached as valid with this identity.
    Valid(KeyIdentity),
    /// Key is cached as invalid; reject without a store hit.
    Invalid,
    /// Not cached either way; the caller must consult the store.
    Miss,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::with_ttls(VALID_TTL, INVALID_TTL)
    }

    /// Custom TTLs, used by tests to exercise expiry without sleeping hours.
    pub fn with_ttls(valid_ttl: Duration, invalid_ttl: Duration) -> Self {
        Self {
            valid: Mutex::new(Tier::new(valid_ttl, MAX_ENTRIES)),
            invalid: Mutex::new(Tier::new(invalid_ttl, MAX_ENTRIES)),
        }
    }

    /// Probe both tiers. The invalid tier wins: a key cached as invalid is
    /// rejected even if a stale valid entry also exists.
    pub fn lookup(&self, raw_key: &str) -> CacheLookup {
        let now = Instant::now();

        if self.invalid.lock().get(raw_key, now).is_some() {
            return CacheLookup::Invalid;
        }
        if let Some(identity) = self.valid.lock().get(raw_key, now) {
            return CacheLookup::Valid(identity);
        }
        CacheLookup::Miss
    }

    pub fn cache_valid(&self, raw_key: &str, identity: KeyIdentity) {
        self.valid
            .lock()
            .insert(raw_key.to_string(), identity, Instant::now());
    }

    pub fn cache_invalid(&self, raw_key: &str) {
        self.invalid.lock().insert(raw_key.to_string(), (), Instant::now());
    }

    /// Purge one raw key from both tiers.
    pub fn purge_key(&self, raw_key: &str) {
        self.valid.lock().remove(raw_key);
        self.invalid.lock().remove(raw_key);
    }

    /// Purge every valid entry belonging to `user_id`. Used on revocation and
    /// credential rotation, where the raw key may not be at hand.
    pub fn purge_user(&self, user_id: &str) {
        let mut valid = self.valid.lock();
        let before = valid.map.len();
        valid.retain(|identity| identity.user_id != user_id);
        let evicted = before - valid.map.len();
        if evicted > 0 {
            debug!(user_id, evicted, "auth cache purged for user");
        }
    }
}

impl Default for AuthCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AuthCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCache")
            .field("valid_entries", &self.valid.lock().map.len())
            .field("invalid_entries", &self.invalid.lock().map.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
