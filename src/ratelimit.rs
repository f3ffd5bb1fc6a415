// =============================================================================
// Rate Limiter — per-key, per-category moving window
// =============================================================================
//
// Each (key, category) pair keeps the timestamps of its recent requests; a
// request is admitted when fewer than `limit` timestamps remain inside the
// window after pruning. Storage is in-memory and bounded per entry (the
// deque never grows past the category limit); no cross-process coordination.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::config::{Quota, RateLimitSettings};
use crate::error::GatewayError;

/// Request categories with independent quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    OrderPlacement,
    SmartOrder,
    General,
    LoginMinute,
    LoginHour,
    PasswordReset,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderPlacement => "order",
            Self::SmartOrder => "smart_order",
            Self::General => "api",
            Self::LoginMinute => "login_min",
            Self::LoginHour => "login_hour",
            Self::PasswordReset => "password_reset",
        }
    }
}

/// Moving-window limiter shared process-wide.
pub struct RateLimiter {
    settings: RateLimitSettings,
    windows: Mutex<HashMap<(String, Category), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self { settings, windows: Mutex::new(HashMap::new()) }
    }

    fn quota(&self, category: Category) -> Quota {
        match category {
            Category::OrderPlacement => self.settings.order,
            Category::SmartOrder => self.settings.smart_order,
            Category::General => self.settings.api,
            Category::LoginMinute => self.settings.login_minute,
            Category::LoginHour => self.settings.login_hour,
            Category::PasswordReset => self.settings.password_reset,
        }
    }

    /// Admit or reject one request for (key, category).
    pub fn check(&self, key: &str, category: Category) -> Result<(), GatewayError> {
        self.check_at(key, category, Instant::now())
    }

    /// Clock-injected variant for tests.
    pub fn check_at(
        &self,
        key: &str,
        category: Category,
        now: Instant,
    ) -> Result<(), GatewayError> {
        let quota = self.quota(category);
        let mut windows = self.windows.lock();
        let window = windows
            .entry((key.to_string(), category))
            .or_insert_with(VecDeque::new);

        // Prune timestamps that fell out of the window.
        while let Some(&front) = window.front() {
            if now.duration_since(front) >= quota.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= quota.count as usize {
            let retry_after = window
                .front()
                .map(|&front| quota.window.saturating_sub(now.duration_since(front)))
                .unwrap_or(quota.window);
            warn!(
                key = %mask(key),
                category = category.as_str(),
                limit = quota.count,
                "rate limit exceeded"
            );
            return Err(GatewayError::RateLimitExceeded {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        window.push_back(now);
        Ok(())
    }

    /// Login attempts are bounded by both the per-minute and per-hour quota.
    pub fn check_login(&self, key: &str) -> Result<(), GatewayError> {
        self.check(key, Category::LoginMinute)?;
        self.check(key, Category::LoginHour)
    }

    /// Drop entries whose whole window has elapsed. Call from a periodic
    /// housekeeping task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        windows.retain(|(_, category), window| {
            let quota_window = match category {
                Category::OrderPlacement => self.settings.order.window,
                Category::SmartOrder => self.settings.smart_order.window,
                Category::General => self.settings.api.window,
                Category::LoginMinute => self.settings.login_minute.window,
                Category::LoginHour => self.settings.login_hour.window,
                Category::PasswordReset => self.settings.password_reset.window,
            };
            window
                .back()
                .map(|&last| now.duration_since(last) < quota_window * 2)
                .unwrap_or(false)
        });
    }
}

/// Keys are secrets; log only a short prefix.
fn mask(key: &str) -> String {
    let prefix: String = key.chars().take(6).collect();
    format!("{prefix}…")
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tracked", &self.windows.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
