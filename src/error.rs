// =============================================================================
// Error taxonomy — typed kinds with a uniform HTTP surface
// =============================================================================
//
// Every error a client can observe carries a machine-readable code and maps
// to one HTTP status. Sensitive material (api keys, tokens, passwords) is
// redacted before a message leaves the process, whether through a response
// or a log line.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::broker::BrokerError;

// =============================================================================
// Error codes
// =============================================================================

/// Machine-readable error codes surfaced in `{"error_code": ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidApiKey,
    RateLimitExceeded,
    OperationNotAllowed,
    OwnershipViolation,
    InsufficientFunds,
    SymbolNotFound,
    BrokerError,
    BrokerTimeout,
    CryptoError,
    InternalError,
}

// =============================================================================
// GatewayError
// =============================================================================

/// Crate-wide error type. Variants map 1:1 onto the taxonomy the gateway
/// exposes to clients.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid or revoked API key")]
    InvalidApiKey,

    #[error("rate limit exceeded; retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("operation {api_type} is not allowed in Semi-Auto mode. Use the Action Center or switch the key to Auto mode")]
    OperationNotAllowed { api_type: String },

    #[error("pending order does not belong to the caller")]
    OwnershipViolation,

    #[error("insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("symbol {symbol} not found on {exchange}")]
    SymbolNotFound { symbol: String, exchange: String },

    #[error("broker {name} is not registered")]
    UnknownBroker { name: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("broker call timed out")]
    BrokerTimeout,

    #[error("credential decryption failed")]
    Crypto,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidApiKey => ErrorCode::InvalidApiKey,
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            Self::OperationNotAllowed { .. } => ErrorCode::OperationNotAllowed,
            Self::OwnershipViolation => ErrorCode::OwnershipViolation,
            Self::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            Self::SymbolNotFound { .. } => ErrorCode::SymbolNotFound,
            Self::UnknownBroker { .. } => ErrorCode::BrokerError,
            Self::Broker(BrokerError::Timeout) => ErrorCode::BrokerTimeout,
            Self::Broker(_) => ErrorCode::BrokerError,
            Self::BrokerTimeout => ErrorCode::BrokerTimeout,
            Self::Crypto => ErrorCode::CryptoError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// The HTTP status this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidApiKey => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::OperationNotAllowed { .. } | Self::OwnershipViolation => StatusCode::FORBIDDEN,
            Self::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
            Self::SymbolNotFound { .. } => StatusCode::NOT_FOUND,
            Self::UnknownBroker { .. } => StatusCode::BAD_REQUEST,
            Self::Broker(kind) => match kind {
                BrokerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                BrokerError::InvalidToken => StatusCode::UNAUTHORIZED,
                BrokerError::OrderRejected(_) => StatusCode::BAD_REQUEST,
                BrokerError::Network(_) => StatusCode::BAD_GATEWAY,
                BrokerError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            },
            Self::BrokerTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Crypto | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(format!("store error: {e}"))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {e}"))
    }
}

// =============================================================================
// HTTP surface
// =============================================================================

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
    error_code: ErrorCode,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            status: "error",
            message: self.to_string(),
            error_code: self.code(),
        };
        if status.is_server_error() {
            tracing::error!(error_code = ?body.error_code, message = %body.message, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Redaction
// =============================================================================

/// Masks registered secrets inside any outbound string. Secrets are matched
/// as exact substrings; the mask preserves nothing of the original.
#[derive(Default, Clone)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret to be masked. Empty and very short values are
    /// ignored (masking 1–3 char fragments would mangle ordinary text).
    pub fn register(&mut self, secret: &str) {
        if secret.len() >= 4 && !self.secrets.iter().any(|s| s == secret) {
            self.secrets.push(secret.to_string());
        }
    }

    /// Replace every occurrence of every registered secret with `***`.
    pub fn redact(&self, input: &str) -> String {
        let mut out = input.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), "***");
            }
        }
        out
    }

    /// True when `input` contains no registered secret. Used by tests and
    /// debug assertions on outbound payloads.
    pub fn is_clean(&self, input: &str) -> bool {
        self.secrets.iter().all(|s| !input.contains(s.as_str()))
    }
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("secrets", &format!("<{} registered>", self.secrets.len()))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(GatewayError::InvalidApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::RateLimitExceeded { retry_after_secs: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::OperationNotAllowed { api_type: "cancelorder".into() }.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(GatewayError::OwnershipViolation.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::InsufficientFunds { required: 100.0, available: 1.0 }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::BrokerTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(GatewayError::Crypto.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn broker_kinds_map_to_distinct_statuses() {
        assert_eq!(
            GatewayError::from(BrokerError::InvalidToken).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::from(BrokerError::Network("dns".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::from(BrokerError::Timeout).code(),
            ErrorCode::BrokerTimeout
        );
    }

    #[test]
    fn redactor_masks_all_registered_secrets() {
        let mut r = Redactor::new();
        r.register("super-secret-key");
        r.register("tok_abc123");

        let msg = "auth failed for super-secret-key with token tok_abc123";
        let clean = r.redact(msg);
        assert!(!clean.contains("super-secret-key"));
        assert!(!clean.contains("tok_abc123"));
        assert!(clean.contains("***"));
        assert!(r.is_clean(&clean));
    }

    #[test]
    fn redactor_ignores_short_fragments() {
        let mut r = Redactor::new();
        r.register("ab");
        assert_eq!(r.redact("about"), "about");
    }
}
