// =============================================================================
// Auth Service — API-key verification with the two-tier cache
// =============================================================================
//
// Lookup order on every authenticated request:
//   1. invalid cache -> InvalidApiKey, no store hit
//   2. valid cache   -> cached identity, no store hit
//   3. store         -> digest lookup + Argon2 confirmation; cache the result
//
// Revocation purges both cache tiers for the key's user and revokes every
// broker session tied to that user.
// =============================================================================

pub mod cache;
pub mod store;

use std::sync::Arc;

use chrono::{NaiveTime, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use tracing::{debug, info, warn};

use crate::crypto::{generate_api_key, lookup_digest, CredentialVault, PasswordHasherService};
use crate::error::GatewayError;
use crate::types::OrderMode;

pub use cache::{AuthCache, CacheLookup, KeyIdentity};
pub use store::{AuthStore, SessionRow};

/// Verifies API keys, issues and revokes them, and manages broker sessions.
pub struct AuthService {
    cache: AuthCache,
    store: Arc<AuthStore>,
    hasher: PasswordHasherService,
    vault: Arc<CredentialVault>,
    pepper: String,
}

impl AuthService {
    pub fn new(
        store: Arc<AuthStore>,
        vault: Arc<CredentialVault>,
        pepper: impl Into<String>,
    ) -> Self {
        let pepper = pepper.into();
        Self {
            cache: AuthCache::new(),
            store,
            hasher: PasswordHasherService::new(pepper.clone()),
            vault,
            pepper,
        }
    }

    /// Test constructor with short cache TTLs.
    pub fn with_cache(
        store: Arc<AuthStore>,
        vault: Arc<CredentialVault>,
        pepper: impl Into<String>,
        cache: AuthCache,
    ) -> Self {
        let pepper = pepper.into();
        Self {
            cache,
            store,
            hasher: PasswordHasherService::new(pepper.clone()),
            vault,
            pepper,
        }
    }

    pub fn store(&self) -> &Arc<AuthStore> {
        &self.store
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Verify a raw API key and return the attached identity.
    pub fn verify_key(&self, raw_key: &str) -> Result<KeyIdentity, GatewayError> {
        match self.cache.lookup(raw_key) {
            CacheLookup::Invalid => return Err(GatewayError::InvalidApiKey),
            CacheLookup::Valid(identity) => return Ok(identity),
            CacheLookup::Miss => {}
        }

        let digest = lookup_digest(&self.pepper, raw_key);
        let row = match self.store.find_key_by_digest(&digest) {
            Ok(Some(row)) if row.is_active => row,
            Ok(_) => {
                self.cache.cache_invalid(raw_key);
                return Err(GatewayError::InvalidApiKey);
            }
            Err(e) => return Err(GatewayError::Internal(e.to_string())),
        };

        // The digest located the row; the memory-hard hash confirms it.
        let outcome = self
            .hasher
            .verify(raw_key, &row.key_hash)
            .map_err(|_| GatewayError::InvalidApiKey)?;
        if !outcome.valid {
            self.cache.cache_invalid(raw_key);
            return Err(GatewayError::InvalidApiKey);
        }

        if outcome.needs_rehash {
            match self.hasher.hash(raw_key) {
                Ok(new_hash) => {
                    if let Err(e) = self.store.update_key_hash(row.id, &new_hash) {
                        warn!(key_id = row.id, error = %e, "background rehash failed");
                    } else {
                        debug!(key_id = row.id, "api key rehashed with current parameters");
                    }
                }
                Err(e) => warn!(key_id = row.id, error = %e, "rehash computation failed"),
            }
        }

        if let Err(e) = self.store.touch_last_used(row.id) {
            warn!(key_id = row.id, error = %e, "failed to update last_used_at");
        }

        let default_broker = self
            .store
            .default_broker(&row.user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .map(|(broker, _)| broker);

        let identity = KeyIdentity {
            key_id: row.id,
            user_id: row.user_id,
            order_mode: row.order_mode,
            default_broker,
        };
        self.cache.cache_valid(raw_key, identity.clone());
        Ok(identity)
    }

    // -------------------------------------------------------------------------
    // Issuance & revocation
    // -------------------------------------------------------------------------

    /// Issue a fresh API key for a user. The raw key is returned exactly
    /// once; only its hash and ciphertext are stored.
    pub fn issue_key(&self, user_id: &str, mode: OrderMode) -> Result<String, GatewayError> {
        let raw = generate_api_key();
        let digest = lookup_digest(&self.pepper, &raw);
        let hash = self.hasher.hash(&raw).map_err(GatewayError::from)?;
        let ct = self.vault.encrypt(&raw).map_err(GatewayError::from)?;

        self.store
            .insert_api_key(user_id, &digest, &hash, &ct, mode)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        info!(user_id, "api key issued");
        Ok(raw)
    }

    /// Revoke a key: deactivate the row, purge both cache tiers for the
    /// owning user, and revoke every broker session tied to that user.
    pub fn revoke_key(&self, key_id: i64) -> Result<(), GatewayError> {
        let user_id = self
            .store
            .revoke_key(key_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or(GatewayError::InvalidApiKey)?;

        self.cache.purge_user(&user_id);
        self.store
            .revoke_sessions_for_user(&user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        info!(key_id, user_id, "api key revoked");
        Ok(())
    }

    /// Switch a key between Auto and Semi-Auto. Cached attributes for the
    /// owning user are purged so the change is visible immediately.
    pub fn set_order_mode(
        &self,
        key_id: i64,
        user_id: &str,
        mode: OrderMode,
    ) -> Result<(), GatewayError> {
        self.store
            .set_order_mode(key_id, mode)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        self.cache.purge_user(user_id);
        info!(key_id, user_id, mode = %mode, "order mode changed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Broker sessions
    // -------------------------------------------------------------------------

    /// Store a fresh broker session after a successful login. Tokens are
    /// encrypted at rest; the deadline is the next occurrence of the daily
    /// `cutoff` (IST).
    pub fn install_broker_session(
        &self,
        user_id: &str,
        broker: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        feed_token: Option<&str>,
        cutoff: NaiveTime,
    ) -> Result<i64, GatewayError> {
        let access_ct = self.vault.encrypt(access_token).map_err(GatewayError::from)?;
        let refresh_ct = refresh_token
            .map(|t| self.vault.encrypt(t))
            .transpose()
            .map_err(GatewayError::from)?;
        let feed_ct = feed_token
            .map(|t| self.vault.encrypt(t))
            .transpose()
            .map_err(GatewayError::from)?;

        let expires_at = next_session_expiry(cutoff);
        let id = self
            .store
            .create_session(
                user_id,
                broker,
                &access_ct,
                refresh_ct.as_deref(),
                feed_ct.as_deref(),
                &expires_at,
            )
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        info!(user_id, broker, expires_at = %expires_at, "broker session installed");
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Broker credentials
    // -------------------------------------------------------------------------

    /// Assemble decrypted credentials for (user, broker) from the binding
    /// blob and the live session row. Plaintext lives only inside the
    /// returned value, which zeroizes on drop.
    ///
    /// A failed decrypt is fatal for the session: the broker session is
    /// revoked and the user must log in again.
    pub fn broker_credentials(
        &self,
        user_id: &str,
        broker: &str,
    ) -> Result<crate::broker::BrokerCredentials, GatewayError> {
        let binding = self
            .store
            .default_broker(user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let blob_ct = match binding {
            Some((bound_broker, ct)) if bound_broker == broker => ct,
            _ => {
                return Err(GatewayError::Internal(format!(
                    "user has no binding for broker {broker}"
                )))
            }
        };

        let decrypt = |ct: &str| -> Result<zeroize::Zeroizing<String>, GatewayError> {
            self.vault.decrypt(ct).map_err(|_| {
                warn!(user_id, broker, "credential decrypt failed — revoking session");
                let _ = self.store.revoke_session(user_id, broker);
                GatewayError::Crypto
            })
        };

        let blob = decrypt(&blob_ct)?;
        let parsed: serde_json::Value =
            serde_json::from_str(&blob).map_err(|_| GatewayError::Crypto)?;

        let mut creds = crate::broker::BrokerCredentials::from_tokens(
            parsed["api_key"].as_str().unwrap_or_default(),
            parsed["api_secret"].as_str().unwrap_or_default(),
            None,
        );
        if let Some(mk) = parsed["market_api_key"].as_str() {
            creds.market_api_key = Some(zeroize::Zeroizing::new(mk.to_string()));
        }
        if let Some(ms) = parsed["market_api_secret"].as_str() {
            creds.market_api_secret = Some(zeroize::Zeroizing::new(ms.to_string()));
        }

        let session = self
            .store
            .active_session(user_id, broker)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        if let Some(session) = session {
            creds.access_token = Some(decrypt(&session.access_token_ct)?);
            if let Some(feed_ct) = &session.feed_token_ct {
                creds.feed_token = Some(decrypt(feed_ct)?);
            }
        }

        Ok(creds)
    }

    // -------------------------------------------------------------------------
    // Passwords
    // -------------------------------------------------------------------------

    /// Verify a user's password, re-hashing in the background when the
    /// stored parameters have drifted.
    pub fn verify_password(&self, user_id: &str, password: &str) -> Result<bool, GatewayError> {
        let stored = self
            .store
            .password_hash(user_id)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let Some(stored) = stored else { return Ok(false) };

        let outcome = self
            .hasher
            .verify(password, &stored)
            .map_err(GatewayError::from)?;

        if outcome.valid && outcome.needs_rehash {
            if let Ok(new_hash) = self.hasher.hash(password) {
                let _ = self.store.update_password_hash(user_id, &new_hash);
            }
        }

        Ok(outcome.valid)
    }

    /// Register a user with a freshly hashed password.
    pub fn register_user(&self, user_id: &str, password: &str) -> Result<(), GatewayError> {
        let hash = self.hasher.hash(password).map_err(GatewayError::from)?;
        self.store
            .create_user(user_id, &hash)
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("cache", &self.cache)
            .field("store", &self.store)
            .finish()
    }
}

// =============================================================================
// Session expiry
// =============================================================================

/// Compute the RFC-3339 deadline for a broker session: the next occurrence
/// of the daily `HH:MM` cutoff in IST (today if still ahead, else tomorrow).
pub fn next_session_expiry(cutoff: NaiveTime) -> String {
    let now_ist = Utc::now().with_timezone(&Kolkata);
    let today_cutoff = now_ist.date_naive().and_time(cutoff);

    let expiry_naive = if now_ist.time() < cutoff {
        today_cutoff
    } else {
        today_cutoff + chrono::Duration::days(1)
    };

    Kolkata
        .from_local_datetime(&expiry_naive)
        .earliest()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| (Utc::now() + chrono::Duration::hours(12)).to_rfc3339())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn service() -> (AuthService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.db");
        let store = Arc::new(AuthStore::new(path.to_str().unwrap()).unwrap());
        let vault = Arc::new(CredentialVault::new("0123456789abcdef0123456789abcdef"));
        let svc = AuthService::new(store, vault, "test-pepper-test-pepper-test-pep");
        (svc, dir)
    }

    #[test]
    fn issued_key_verifies_and_caches() {
        let (svc, _d) = service();
        svc.register_user("u1", "pw").unwrap();
        svc.store.upsert_broker_binding("u1", "flattrade", "ct", true).unwrap();

        let raw = svc.issue_key("u1", OrderMode::Auto).unwrap();
        let id1 = svc.verify_key(&raw).unwrap();
        assert_eq!(id1.user_id, "u1");
        assert_eq!(id1.order_mode, OrderMode::Auto);
        assert_eq!(id1.default_broker.as_deref(), Some("flattrade"));

        // Second verification must be served from cache (same identity).
        let id2 = svc.verify_key(&raw).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn unknown_key_is_rejected_and_negative_cached() {
        let (svc, _d) = service();
        assert!(matches!(
            svc.verify_key("no-such-key"),
            Err(GatewayError::InvalidApiKey)
        ));
        // The second call is served from the invalid tier.
        assert_eq!(svc.cache.lookup("no-such-key"), CacheLookup::Invalid);
    }

    #[test]
    fn revocation_defeats_a_warm_cache() {
        let (svc, _d) = service();
        svc.register_user("u1", "pw").unwrap();
        let raw = svc.issue_key("u1", OrderMode::Auto).unwrap();

        let identity = svc.verify_key(&raw).unwrap();
        svc.revoke_key(identity.key_id).unwrap();

        assert!(matches!(svc.verify_key(&raw), Err(GatewayError::InvalidApiKey)));
    }

    #[test]
    fn revocation_revokes_broker_sessions() {
        let (svc, _d) = service();
        svc.register_user("u1", "pw").unwrap();
        let raw = svc.issue_key("u1", OrderMode::Auto).unwrap();
        let future = (Utc::now() + chrono::Duration::hours(8)).to_rfc3339();
        svc.store
            .create_session("u1", "flattrade", "at", None, None, &future)
            .unwrap();

        let identity = svc.verify_key(&raw).unwrap();
        svc.revoke_key(identity.key_id).unwrap();

        assert!(svc.store.active_session("u1", "flattrade").unwrap().is_none());
    }

    #[test]
    fn order_mode_change_invalidates_cached_attributes() {
        let (svc, _d) = service();
        svc.register_user("u1", "pw").unwrap();
        let raw = svc.issue_key("u1", OrderMode::Auto).unwrap();
        let identity = svc.verify_key(&raw).unwrap();

        svc.set_order_mode(identity.key_id, "u1", OrderMode::SemiAuto).unwrap();
        assert_eq!(svc.verify_key(&raw).unwrap().order_mode, OrderMode::SemiAuto);
    }

    #[test]
    fn password_roundtrip() {
        let (svc, _d) = service();
        svc.register_user("u1", "correct horse").unwrap();
        assert!(svc.verify_password("u1", "correct horse").unwrap());
        assert!(!svc.verify_password("u1", "wrong").unwrap());
        assert!(!svc.verify_password("ghost", "anything").unwrap());
    }

    #[test]
    fn expired_negative_entry_allows_fresh_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.db");
        let store = Arc::new(AuthStore::new(path.to_str().unwrap()).unwrap());
        let vault = Arc::new(CredentialVault::new("0123456789abcdef0123456789abcdef"));
        let svc = AuthService::with_cache(
            store,
            vault,
            "test-pepper-test-pepper-test-pep",
            AuthCache::with_ttls(Duration::from_secs(3600), Duration::from_millis(10)),
        );

        assert!(svc.verify_key("ghost-key").is_err());
        std::thread::sleep(Duration::from_millis(25));
        // Negative entry expired; a lookup goes back to the store.
        assert_eq!(svc.cache.lookup("ghost-key"), CacheLookup::Miss);
    }

    #[test]
    fn installed_session_is_encrypted_and_live_until_cutoff() {
        let (svc, _d) = service();
        svc.register_user("u1", "pw").unwrap();
        svc.store.upsert_broker_binding("u1", "flattrade", "ct", true).unwrap();

        let cutoff = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        svc.install_broker_session("u1", "flattrade", "raw-access", Some("raw-refresh"), None, cutoff)
            .unwrap();

        let session = svc.store.active_session("u1", "flattrade").unwrap().unwrap();
        // Ciphertext at rest, decryptable with the vault.
        assert_ne!(session.access_token_ct, "raw-access");
        assert_eq!(svc.vault.decrypt(&session.access_token_ct).unwrap().as_str(), "raw-access");
        assert!(session.refresh_token_ct.is_some());
        assert!(session.feed_token_ct.is_none());
    }

    #[test]
    fn session_expiry_is_in_the_future() {
        let cutoff = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        let expiry = next_session_expiry(cutoff);
        let parsed = chrono::DateTime::parse_from_rfc3339(&expiry).unwrap();
        assert!(parsed > Utc::now());
        assert!(parsed <= Utc::now() + chrono::Duration::days(1) + chrono::Duration::minutes(1));
    }
}
