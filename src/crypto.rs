// =============================================================================
// Credential Store Primitives — AEAD vault + memory-hard hashing
// =============================================================================
//
// SECURITY: plaintext secrets never outlive the scope that needs them; every
// decrypt hands back a zeroized buffer. The AEAD key is derived once at
// startup from APP_KEY via a slow KDF; a failed authentication tag is fatal
// for the calling session (the caller must force a re-login).
// =============================================================================

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Fixed application salt for the AEAD key derivation. The derived key's
/// secrecy rests entirely on APP_KEY; the salt only domain-separates it.
const KDF_SALT: &[u8] = b"meridian-gateway-credential-vault";
/// PBKDF2-SHA256 iteration count for the startup key derivation.
const KDF_ROUNDS: u32 = 600_000;
/// AES-GCM nonce length in bytes, prepended to every ciphertext.
const NONCE_LEN: usize = 12;

/// Failures from the vault or the hasher. Authentication-tag failures and a
/// missing key both surface as `Decrypt` — callers treat either as fatal for
/// the session.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed — ciphertext tampered or key unavailable")]
    Decrypt,
    #[error("password hash is malformed")]
    MalformedHash,
}

impl From<CryptoError> for crate::error::GatewayError {
    fn from(_: CryptoError) -> Self {
        crate::error::GatewayError::Crypto
    }
}

// =============================================================================
// Credential vault (AEAD at rest)
// =============================================================================

/// AES-256-GCM vault for credentials at rest. The wire format is
/// `base64(nonce || ciphertext+tag)`.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    /// Derive the AEAD key from the process-wide secret and build the vault.
    pub fn new(app_key: &str) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(app_key.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key[..]);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        Self { cipher }
    }

    /// Encrypt a secret for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a stored secret into a zeroized buffer.
    ///
    /// Fails when the tag does not verify (tampering, key rotation without
    /// re-encryption) — the caller must treat this as fatal for the session.
    pub fn decrypt(&self, stored: &str) -> Result<Zeroizing<String>, CryptoError> {
        let raw = BASE64.decode(stored).map_err(|_| CryptoError::Decrypt)?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(nonce, ciphertext)
                .map_err(|_| CryptoError::Decrypt)?,
        );

        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").field("cipher", &"<aes-256-gcm>").finish()
    }
}

// =============================================================================
// Memory-hard hashing (Argon2id + pepper)
// =============================================================================

/// Outcome of a verification: whether the input matched, and whether the
/// stored hash should be recomputed with current parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub needs_rehash: bool,
}

/// Argon2id hasher with the server-wide pepper appended before hashing.
pub struct PasswordHasherService {
    pepper: String,
}

impl PasswordHasherService {
    pub fn new(pepper: impl Into<String>) -> Self {
        Self { pepper: pepper.into() }
    }

    fn peppered(&self, input: &str) -> Zeroizing<String> {
        Zeroizing::new(format!("{input}{}", self.pepper))
    }

    /// Hash a password or API key with Argon2id and a fresh random salt.
    pub fn hash(&self, input: &str) -> Result<String, CryptoError> {
        let salt = SaltString::generate(&mut OsRng);
        let peppered = self.peppered(input);
        Argon2::default()
            .hash_password(peppered.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|_| CryptoError::MalformedHash)
    }

    /// Verify an input against a stored hash, reporting whether the hash
    /// parameters have drifted from the current defaults.
    pub fn verify(&self, input: &str, stored: &str) -> Result<VerifyOutcome, CryptoError> {
        let parsed = PasswordHash::new(stored).map_err(|_| CryptoError::MalformedHash)?;
        let peppered = self.peppered(input);

        let valid = Argon2::default()
            .verify_password(peppered.as_bytes(), &parsed)
            .is_ok();

        Ok(VerifyOutcome {
            valid,
            needs_rehash: valid && Self::needs_rehash_inner(&parsed),
        })
    }

    /// True when the stored hash was produced with parameters other than the
    /// current Argon2id defaults — callers re-hash on next successful login.
    pub fn needs_rehash(&self, stored: &str) -> Result<bool, CryptoError> {
        let parsed = PasswordHash::new(stored).map_err(|_| CryptoError::MalformedHash)?;
        Ok(Self::needs_rehash_inner(&parsed))
    }

    fn needs_rehash_inner(parsed: &PasswordHash<'_>) -> bool {
        if parsed.algorithm != argon2::Algorithm::Argon2id.ident() {
            return true;
        }
        match Params::try_from(parsed) {
            Ok(params) => {
                let current = Params::default();
                params.m_cost() != current.m_cost()
                    || params.t_cost() != current.t_cost()
                    || params.p_cost() != current.p_cost()
            }
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for PasswordHasherService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordHasherService")
            .field("pepper", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Deterministic lookup digest & key generation
// =============================================================================

/// Deterministic digest used as the DB index for API keys: the memory-hard
/// hash is salted and cannot be used for lookup, so rows are located by
/// `HMAC-SHA256(pepper, key)` and then confirmed with the Argon2 hash.
pub fn lookup_digest(pepper: &str, key: &str) -> String {
    let mut mac =
        <HmacSha256 as hmac::Mac>::new_from_slice(pepper.as_bytes()).expect("HMAC accepts any key size");
    mac.update(key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Generate a fresh opaque API key: 32 random bytes, hex-encoded.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// =============================================================================
// Tests
// =============================================================================
