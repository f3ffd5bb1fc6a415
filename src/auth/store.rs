// =============================================================================
// Auth Store — users, API keys, broker bindings, broker sessions (SQLite)
// =============================================================================
//
// Secret columns hold AEAD ciphertext only. The API-key row carries both a
// deterministic lookup digest (index) and the memory-hard hash (proof); a
// row is authoritative only after the Argon2 verification passes.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::types::OrderMode;

/// A row from `api_keys`, located by lookup digest.
#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: i64,
    pub user_id: String,
    pub key_hash: String,
    pub order_mode: OrderMode,
    pub is_active: bool,
}

/// A row from `broker_sessions`.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub user_id: String,
    pub broker_name: String,
    pub access_token_ct: String,
    pub refresh_token_ct: Option<String>,
    pub feed_token_ct: Option<String>,
    /// RFC-3339; the session is invalid at or after this instant.
    pub expires_at: String,
    pub is_revoked: bool,
}

impl SessionRow {
    /// A session is live only while unrevoked and unexpired.
    pub fn is_live(&self, now: chrono::DateTime<Utc>) -> bool {
        if self.is_revoked {
            return false;
        }
        match chrono::DateTime::parse_from_rfc3339(&self.expires_at) {
            Ok(exp) => now < exp,
            Err(_) => false,
        }
    }
}

/// SQLite-backed auth store.
pub struct AuthStore {
    db_path: String,
}

impl AuthStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Self { db_path: db_path.to_string() };
        store.init_db()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("failed to open auth store at {}", self.db_path))
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                sandbox_enabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS broker_bindings (
                user_id TEXT NOT NULL,
                broker_name TEXT NOT NULL,
                credential_blob_ct TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, broker_name),
                FOREIGN KEY (user_id) REFERENCES users(user_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                lookup_digest TEXT UNIQUE NOT NULL,
                key_hash TEXT NOT NULL,
                key_ct TEXT NOT NULL,
                order_mode TEXT NOT NULL DEFAULT 'AUTO',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_used_at TEXT,
                FOREIGN KEY (user_id) REFERENCES users(user_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS broker_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                broker_name TEXT NOT NULL,
                access_token_ct TEXT NOT NULL,
                refresh_token_ct TEXT,
                feed_token_ct TEXT,
                expires_at TEXT NOT NULL,
                is_revoked INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(user_id)
            )",
            [],
        )?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    pub fn create_user(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, password_hash, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, password_hash, Utc::now().to_rfc3339()],
        )
        .context("failed to insert user")?;
        info!(user_id, "user created");
        Ok(())
    }

    pub fn password_hash(&self, user_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT password_hash FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read password hash")
    }

    pub fn update_password_hash(&self, user_id: &str, new_hash: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE user_id = ?2",
            params![new_hash, user_id],
        )?;
        Ok(())
    }

    pub fn sandbox_enabled(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let enabled: Option<i64> = conn
            .query_row(
                "SELECT sandbox_enabled FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(enabled.unwrap_or(0) != 0)
    }

    pub fn set_sandbox_enabled(&self, user_id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET sandbox_enabled = ?1 WHERE user_id = ?2",
            params![enabled as i64, user_id],
        )?;
        info!(user_id, enabled, "sandbox mode toggled");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Broker bindings
    // -------------------------------------------------------------------------

    /// Insert or replace a broker binding. Setting `is_default` clears the
    /// default flag on the user's other bindings first (at most one default).
    pub fn upsert_broker_binding(
        &self,
        user_id: &str,
        broker_name: &str,
        credential_blob_ct: &str,
        is_default: bool,
    ) -> Result<()> {
        let conn = self.conn()?;
        if is_default {
            conn.execute(
                "UPDATE broker_bindings SET is_default = 0 WHERE user_id = ?1",
                params![user_id],
            )?;
        }
        conn.execute(
            "INSERT INTO broker_bindings (user_id, broker_name, credential_blob_ct, is_default)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, broker_name)
             DO UPDATE SET credential_blob_ct = ?3, is_default = ?4",
            params![user_id, broker_name, credential_blob_ct, is_default as i64],
        )?;
        Ok(())
    }

    /// The user's default broker binding: (broker_name, credential ciphertext).
    pub fn default_broker(&self, user_id: &str) -> Result<Option<(String, String)>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT broker_name, credential_blob_ct FROM broker_bindings
             WHERE user_id = ?1 AND is_default = 1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("failed to read default broker binding")
    }

    // -------------------------------------------------------------------------
    // API keys
    // -------------------------------------------------------------------------

    pub fn insert_api_key(
        &self,
        user_id: &str,
        lookup_digest: &str,
        key_hash: &str,
        key_ct: &str,
        order_mode: OrderMode,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO api_keys (user_id, lookup_digest, key_hash, key_ct, order_mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                lookup_digest,
                key_hash,
                key_ct,
                order_mode.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_key_by_digest(&self, lookup_digest: &str) -> Result<Option<ApiKeyRow>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, user_id, key_hash, order_mode, is_active
             FROM api_keys WHERE lookup_digest = ?1",
            params![lookup_digest],
            |row| {
                let mode: String = row.get(3)?;
                Ok(ApiKeyRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    key_hash: row.get(2)?,
                    order_mode: mode.parse().unwrap_or_default(),
                    is_active: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()
        .context("failed to look up api key")
    }

    pub fn touch_last_used(&self, key_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), key_id],
        )?;
        Ok(())
    }

    pub fn update_key_hash(&self, key_id: i64, new_hash: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE api_keys SET key_hash = ?1 WHERE id = ?2",
            params![new_hash, key_id],
        )?;
        Ok(())
    }

    pub fn set_order_mode(&self, key_id: i64, mode: OrderMode) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE api_keys SET order_mode = ?1 WHERE id = ?2",
            params![mode.as_str(), key_id],
        )?;
        Ok(())
    }

    /// Deactivate a key. The caller is responsible for cache purges and
    /// session revocation (see `AuthService::revoke_key`).
    pub fn revoke_key(&self, key_id: i64) -> Result<Option<String>> {
        let conn = self.conn()?;
        let user_id: Option<String> = conn
            .query_row(
                "SELECT user_id FROM api_keys WHERE id = ?1",
                params![key_id],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute(
            "UPDATE api_keys SET is_active = 0 WHERE id = ?1",
            params![key_id],
        )?;
        Ok(user_id)
    }

    // -------------------------------------------------------------------------
    // Broker sessions
    // -------------------------------------------------------------------------

    pub fn create_session(
        &self,
        user_id: &str,
        broker_name: &str,
        access_token_ct: &str,
        refresh_token_ct: Option<&str>,
        feed_token_ct: Option<&str>,
        expires_at: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO broker_sessions
               (user_id, broker_name, access_token_ct, refresh_token_ct, feed_token_ct,
                expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                broker_name,
                access_token_ct,
                refresh_token_ct,
                feed_token_ct,
                expires_at,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The newest live session for (user, broker), if any.
    pub fn active_session(&self, user_id: &str, broker_name: &str) -> Result<Option<SessionRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, user_id, broker_name, access_token_ct, refresh_token_ct,
                        feed_token_ct, expires_at, is_revoked
                 FROM broker_sessions
                 WHERE user_id = ?1 AND broker_name = ?2 AND is_revoked = 0
                 ORDER BY id DESC LIMIT 1",
                params![user_id, broker_name],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        broker_name: row.get(2)?,
                        access_token_ct: row.get(3)?,
                        refresh_token_ct: row.get(4)?,
                        feed_token_ct: row.get(5)?,
                        expires_at: row.get(6)?,
                        is_revoked: row.get::<_, i64>(7)? != 0,
                    })
                },
            )
            .optional()?;

        Ok(row.filter(|s| s.is_live(Utc::now())))
    }

    /// Revoke every session for a user. Monotonic: revoked sessions never
    /// come back.
    pub fn revoke_sessions_for_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE broker_sessions SET is_revoked = 1 WHERE user_id = ?1 AND is_revoked = 0",
            params![user_id],
        )?;
        if n > 0 {
            info!(user_id, revoked = n, "broker sessions revoked");
        }
        Ok(n)
    }

    /// Revoke sessions for one (user, broker) pair, e.g. after InvalidToken.
    pub fn revoke_session(&self, user_id: &str, broker_name: &str) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "UPDATE broker_sessions SET is_revoked = 1
             WHERE user_id = ?1 AND broker_name = ?2 AND is_revoked = 0",
            params![user_id, broker_name],
        )?)
    }
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStore").field("db_path", &self.db_path).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (AuthStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.db");
        (AuthStore::new(path.to_str().unwrap()).unwrap(), dir)
    }

    #[test]
    fn api_key_lookup_roundtrip() {
        let (s, _d) = store();
        s.create_user("u1", "hash").unwrap();
        let id = s
            .insert_api_key("u1", "digest-1", "argon-hash", "ct", OrderMode::SemiAuto)
            .unwrap();

        let row = s.find_key_by_digest("digest-1").unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.user_id, "u1");
        assert_eq!(row.order_mode, OrderMode::SemiAuto);
        assert!(row.is_active);

        assert!(s.find_key_by_digest("other").unwrap().is_none());
    }

    #[test]
    fn revoked_key_row_reports_inactive() {
        let (s, _d) = store();
        s.create_user("u1", "hash").unwrap();
        let id = s
            .insert_api_key("u1", "digest-1", "argon-hash", "ct", OrderMode::Auto)
            .unwrap();
        let user = s.revoke_key(id).unwrap();
        assert_eq!(user.as_deref(), Some("u1"));
        assert!(!s.find_key_by_digest("digest-1").unwrap().unwrap().is_active);
    }

    #[test]
    fn at_most_one_default_binding() {
        let (s, _d) = store();
        s.create_user("u1", "hash").unwrap();
        s.upsert_broker_binding("u1", "flattrade", "ct1", true).unwrap();
        s.upsert_broker_binding("u1", "xts", "ct2", true).unwrap();

        let (broker, ct) = s.default_broker("u1").unwrap().unwrap();
        assert_eq!(broker, "xts");
        assert_eq!(ct, "ct2");
    }

    #[test]
    fn expired_session_is_not_live() {
        let (s, _d) = store();
        s.create_user("u1", "hash").unwrap();
        let past = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        s.create_session("u1", "flattrade", "at-ct", None, None, &past).unwrap();
        assert!(s.active_session("u1", "flattrade").unwrap().is_none());
    }

    #[test]
    fn revocation_is_monotonic() {
        let (s, _d) = store();
        s.create_user("u1", "hash").unwrap();
        let future = (Utc::now() + chrono::Duration::hours(8)).to_rfc3339();
        s.create_session("u1", "flattrade", "at-ct", Some("rt-ct"), None, &future)
            .unwrap();

        assert!(s.active_session("u1", "flattrade").unwrap().is_some());
        assert_eq!(s.revoke_sessions_for_user("u1").unwrap(), 1);
        assert!(s.active_session("u1", "flattrade").unwrap().is_none());
        // Re-revoking touches nothing.
        assert_eq!(s.revoke_sessions_for_user("u1").unwrap(), 0);
    }

    #[test]
    fn sandbox_toggle_persists() {
        let (s, _d) = store();
        s.create_user("u1", "hash").unwrap();
        assert!(!s.sandbox_enabled("u1").unwrap());
        s.set_sandbox_enabled("u1", true).unwrap();
        assert!(s.sandbox_enabled("u1").unwrap());
    }
}
