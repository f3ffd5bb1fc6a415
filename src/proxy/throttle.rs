// =============================================================================
// LTP Throttle — 50 ms floor between LTP ticks per (symbol, exchange)
// =============================================================================
//
// LTP subscribers only care about the freshest price, so a tick arriving
// inside the floor is dropped, not delayed. QUOTE and DEPTH are never
// throttled. The gate is global across clients: one decision per tick.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::Exchange;

/// Minimum spacing between delivered LTP ticks for one instrument.
pub const LTP_MIN_INTERVAL: Duration = Duration::from_millis(50);

pub struct LtpThrottle {
    min_interval: Duration,
    last_sent: Mutex<HashMap<(String, Exchange), Instant>>,
}

impl LtpThrottle {
    pub fn new() -> Self {
        Self::with_interval(LTP_MIN_INTERVAL)
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self { min_interval, last_sent: Mutex::new(HashMap::new()) }
    }

    /// True when this tick may be delivered; records the delivery instant.
    pub fn allow(&self, symbol: &str, exchange: Exchange) -> bool {
        self.allow_at(symbol, exchange, Instant::now())
    }

    /// Clock-injected variant for tests.
    pub fn allow_at(&self, symbol: &str, exchange: Exchange, now: Instant) -> bool {
        let mut last_sent = self.last_sent.lock();
        let key = (symbol.to_string(), exchange);

        match last_sent.get(&key) {
            Some(&last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                last_sent.insert(key, now);
                true
            }
        }
    }
}

impl Default for LtpThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LtpThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LtpThrottle")
            .field("instruments", &self.last_sent.lock().len())
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
    fn burst_timing_sequence() {
        // Ticks at t=0, 10, 60, 120 ms: the 10 ms tick drops, the rest pass.
        let throttle = LtpThrottle::new();
        let t0 = Instant::now();

        assert!(throttle.allow_at("RELIANCE", Exchange::Nse, t0));
        assert!(!throttle.allow_at("RELIANCE", Exchange::Nse, t0 + Duration::from_millis(10)));
        assert!(throttle.allow_at("RELIANCE", Exchange::Nse, t0 + Duration::from_millis(60)));
        assert!(throttle.allow_at("RELIANCE", Exchange::Nse, t0 + Duration::from_millis(120)));
    }

    #[test]
    fn instruments_are_gated_independently() {
        let throttle = LtpThrottle::new();
        let t0 = Instant::now();

        assert!(throttle.allow_at("RELIANCE", Exchange::Nse, t0));
        assert!(throttle.allow_at("SBIN", Exchange::Nse, t0));
        // Same symbol on another exchange is its own gate.
        assert!(throttle.allow_at("RELIANCE", Exchange::Bse, t0));
    }

    #[test]
    fn dropped_tick_does_not_reset_the_gate() {
        let throttle = LtpThrottle::new();
        let t0 = Instant::now();

        assert!(throttle.allow_at("SBIN", Exchange::Nse, t0));
        assert!(!throttle.allow_at("SBIN", Exchange::Nse, t0 + Duration::from_millis(40)));
        // 50 ms since the *delivered* tick, not since the dropped one.
        assert!(throttle.allow_at("SBIN", Exchange::Nse, t0 + Duration::from_millis(50)));
    }
}
