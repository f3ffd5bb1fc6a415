// =============================================================================
// Gateway Configuration — environment-driven settings
// =============================================================================
//
// Every tunable lives here so that operational changes never require touching
// call sites. Rate limits are expressed as "N per second|minute|hour" strings
// so the documented defaults stay config, not code.
//
// `API_KEY_PEPPER` and `APP_KEY` are mandatory 32-byte secrets; startup fails
// without them.
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use tracing::warn;

// =============================================================================
// Rate-limit quota
// =============================================================================

/// A parsed "N per <unit>" quota: at most `count` events per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub count: u32,
    pub window: Duration,
}

impl Quota {
    pub const fn new(count: u32, window: Duration) -> Self {
        Self { count, window }
    }

    /// Parse a quota string such as `"10 per second"` or `"25 per hour"`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let count: u32 = parts
            .next()
            .context("empty quota string")?
            .parse()
            .with_context(|| format!("invalid quota count in '{s}'"))?;

        match parts.next() {
            Some("per") => {}
            _ => bail!("quota '{s}' missing 'per'"),
        }

        let window = match parts.next() {
            Some("second") | Some("seconds") => Duration::from_secs(1),
            Some("minute") | Some("minutes") => Duration::from_secs(60),
            Some("hour") | Some("hours") => Duration::from_secs(3600),
            Some("day") | Some("days") => Duration::from_secs(86_400),
            other => bail!("quota '{s}' has unknown unit {other:?}"),
        };

        Ok(Self { count, window })
    }
}

/// Read a quota from the environment, falling back to `default` with a
/// warning when the variable is missing or malformed.
fn quota_from_env(key: &str, default: Quota) -> Quota {
    match std::env::var(key) {
        Ok(raw) => match Quota::parse(&raw) {
            Ok(q) => q,
            Err(e) => {
                warn!(key, value = %raw, error = %e, "malformed rate limit — using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn string_from_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn port_from_env(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// =============================================================================
// Rate-limit settings
// =============================================================================

/// Per-category request quotas; every value is env-overridable.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// `ORDER_RATE_LIMIT` — order placement, default 10/s.
    pub order: Quota,
    /// `SMART_ORDER_RATE_LIMIT` — smart orders, default 2/s.
    pub smart_order: Quota,
    /// `API_RATE_LIMIT` — general API, default 50/s.
    pub api: Quota,
    /// `LOGIN_RATE_LIMIT_MIN` — login attempts, default 5/min.
    pub login_minute: Quota,
    /// `LOGIN_RATE_LIMIT_HOUR` — login attempts, default 25/hour.
    pub login_hour: Quota,
    /// `PASSWORD_RESET_RATE_LIMIT` — default 15/hour.
    pub password_reset: Quota,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            order: Quota::new(10, Duration::from_secs(1)),
            smart_order: Quota::new(2, Duration::from_secs(1)),
            api: Quota::new(50, Duration::from_secs(1)),
            login_minute: Quota::new(5, Duration::from_secs(60)),
            login_hour: Quota::new(25, Duration::from_secs(3600)),
            password_reset: Quota::new(15, Duration::from_secs(3600)),
        }
    }
}

impl RateLimitSettings {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            order: quota_from_env("ORDER_RATE_LIMIT", d.order),
            smart_order: quota_from_env("SMART_ORDER_RATE_LIMIT", d.smart_order),
            api: quota_from_env("API_RATE_LIMIT", d.api),
            login_minute: quota_from_env("LOGIN_RATE_LIMIT_MIN", d.login_minute),
            login_hour: quota_from_env("LOGIN_RATE_LIMIT_HOUR", d.login_hour),
            password_reset: quota_from_env("PASSWORD_RESET_RATE_LIMIT", d.password_reset),
        }
    }
}

// =============================================================================
// GatewayConfig
// =============================================================================

/// Top-level gateway configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // --- Bind endpoints ------------------------------------------------------
    /// `WEBSOCKET_HOST` / `WEBSOCKET_PORT` — streaming proxy endpoint.
    pub websocket_host: String,
    pub websocket_port: u16,

    /// `REST_HOST` / `REST_PORT` — REST control surface endpoint.
    pub rest_host: String,
    pub rest_port: u16,

    /// `BUS_HOST` / `BUS_PORT` — advertised internal pub/sub endpoint.
    /// The bus runs in-process today; the endpoint is carried so a later
    /// split into a separate process needs no config change.
    pub bus_host: String,
    pub bus_port: u16,

    // --- Secrets -------------------------------------------------------------
    /// `API_KEY_PEPPER` — server-wide pepper appended before hashing.
    pub api_key_pepper: String,
    /// `APP_KEY` — process-wide secret the AEAD key is derived from.
    pub app_key: String,

    // --- Sessions ------------------------------------------------------------
    /// `SESSION_EXPIRY_TIME` — daily `HH:MM` cutoff (IST) for broker sessions.
    pub session_expiry_time: NaiveTime,

    // --- Stores --------------------------------------------------------------
    /// `DATABASE_URL` — main store (SQLite path).
    pub database_url: String,
    /// `SANDBOX_DATABASE_URL` — sandbox store (SQLite path).
    pub sandbox_database_url: String,

    // --- Rate limits ---------------------------------------------------------
    pub rate_limits: RateLimitSettings,

    // --- Background cadence --------------------------------------------------
    /// `SQUAREOFF_RELOAD_SECS` — square-off scheduler tick, default 30 s.
    pub squareoff_tick_secs: u64,
    /// `FUND_RESET_DAY` — weekday of the weekly sandbox fund reset.
    pub fund_reset_day: chrono::Weekday,
    /// `FUND_RESET_TIME` — `HH:MM` (IST) of the weekly sandbox fund reset.
    pub fund_reset_time: NaiveTime,
}

impl GatewayConfig {
    /// Assemble the configuration from the process environment.
    ///
    /// Fails when a mandatory secret is missing or too short; everything else
    /// falls back to documented defaults.
    pub fn from_env() -> Result<Self> {
        let api_key_pepper =
            std::env::var("API_KEY_PEPPER").context("API_KEY_PEPPER must be set")?;
        let app_key = std::env::var("APP_KEY").context("APP_KEY must be set")?;

        if api_key_pepper.len() < 32 {
            bail!("API_KEY_PEPPER must be at least 32 bytes");
        }
        if app_key.len() < 32 {
            bail!("APP_KEY must be at least 32 bytes");
        }

        let session_expiry_time = parse_hhmm(
            &string_from_env("SESSION_EXPIRY_TIME", "03:00"),
            "SESSION_EXPIRY_TIME",
        )?;
        let fund_reset_time =
            parse_hhmm(&string_from_env("FUND_RESET_TIME", "00:00"), "FUND_RESET_TIME")?;

        let fund_reset_day = match string_from_env("FUND_RESET_DAY", "sun").to_lowercase().as_str()
        {
            "mon" => chrono::Weekday::Mon,
            "tue" => chrono::Weekday::Tue,
            "wed" => chrono::Weekday::Wed,
            "thu" => chrono::Weekday::Thu,
            "fri" => chrono::Weekday::Fri,
            "sat" => chrono::Weekday::Sat,
            _ => chrono::Weekday::Sun,
        };

        Ok(Self {
            websocket_host: string_from_env("WEBSOCKET_HOST", "0.0.0.0"),
            websocket_port: port_from_env("WEBSOCKET_PORT", 8765),
            rest_host: string_from_env("REST_HOST", "0.0.0.0"),
            rest_port: port_from_env("REST_PORT", 5000),
            bus_host: string_from_env("BUS_HOST", "127.0.0.1"),
            bus_port: port_from_env("BUS_PORT", 5555),
            api_key_pepper,
            app_key,
            session_expiry_time,
            database_url: string_from_env("DATABASE_URL", "meridian.db"),
            sandbox_database_url: string_from_env("SANDBOX_DATABASE_URL", "meridian_sandbox.db"),
            rate_limits: RateLimitSettings::from_env(),
            squareoff_tick_secs: std::env::var("SQUAREOFF_RELOAD_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            fund_reset_day,
            fund_reset_time,
        })
    }

    /// Streaming proxy bind address.
    pub fn websocket_addr(&self) -> String {
        format!("{}:{}", self.websocket_host, self.websocket_port)
    }

    /// REST bind address.
    pub fn rest_addr(&self) -> String {
        format!("{}:{}", self.rest_host, self.rest_port)
    }

    /// Advertised bus endpoint.
    pub fn bus_addr(&self) -> String {
        format!("{}:{}", self.bus_host, self.bus_port)
    }
}

fn parse_hhmm(raw: &str, key: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .with_context(|| format!("{key} must be HH:MM, got '{raw}'"))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_per_second_quota() {
        let q = Quota::parse("10 per second").unwrap();
        assert_eq!(q.count, 10);
        assert_eq!(q.window, Duration::from_secs(1));
    }

    #[test]
    fn parses_per_minute_and_hour() {
        assert_eq!(
            Quota::parse("5 per minute").unwrap(),
            Quota::new(5, Duration::from_secs(60))
        );
        assert_eq!(
            Quota::parse("25 per hour").unwrap(),
            Quota::new(25, Duration::from_secs(3600))
        );
    }

    #[test]
    fn rejects_malformed_quota() {
        assert!(Quota::parse("").is_err());
        assert!(Quota::parse("ten per second").is_err());
        assert!(Quota::parse("10 every second").is_err());
        assert!(Quota::parse("10 per fortnight").is_err());
    }

    #[test]
    fn default_rate_limits_match_documented_values() {
        let d = RateLimitSettings::default();
        assert_eq!(d.order.count, 10);
        assert_eq!(d.smart_order.count, 2);
        assert_eq!(d.api.count, 50);
        assert_eq!(d.login_minute.count, 5);
        assert_eq!(d.login_hour.count, 25);
        assert_eq!(d.password_reset.count, 15);
    }

    #[test]
    fn parses_session_cutoff() {
        let t = parse_hhmm("03:00", "SESSION_EXPIRY_TIME").unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(3, 0, 0).unwrap());
        assert!(parse_hhmm("3 am", "SESSION_EXPIRY_TIME").is_err());
    }
}
