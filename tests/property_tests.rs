// =============================================================================
// Property suites for the gateway's universally quantified invariants
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use meridian_gateway::bus::Topic;
use meridian_gateway::proxy::throttle::LtpThrottle;
use meridian_gateway::router::ActionCenter;
use meridian_gateway::sandbox::store::SandboxStore;
use meridian_gateway::types::{Exchange, SubscriptionMode};

// =============================================================================
// Topic parser identity
// =============================================================================

fn exchange_strategy() -> impl Strategy<Value = Exchange> {
    prop::sample::select(Exchange::ALL.to_vec())
}

fn mode_strategy() -> impl Strategy<Value = SubscriptionMode> {
    prop::sample::select(vec![
        SubscriptionMode::Ltp,
        SubscriptionMode::Quote,
        SubscriptionMode::Depth,
    ])
}

proptest! {
    /// parse(format(b,e,s,m)) = (b,e,s,m) — including the NSE_INDEX and
    /// BSE_INDEX exchanges whose wire token contains an underscore.
    #[test]
    fn topic_roundtrip(
        broker in "[a-z][a-z0-9]{0,11}",
        exchange in exchange_strategy(),
        symbol in "[A-Z][A-Z0-9]{0,9}(_[A-Z0-9]{1,5})?",
        mode in mode_strategy(),
    ) {
        // An NSE symbol that itself starts with "INDEX_" is indistinguishable
        // on the wire from the NSE_INDEX exchange; canonical symbols never
        // take that shape.
        prop_assume!(!(matches!(exchange, Exchange::Nse | Exchange::Bse)
            && symbol.starts_with("INDEX_")));

        let topic = Topic::new(broker.clone(), exchange, symbol.clone(), mode);
        let parsed = Topic::parse(&topic.format()).expect("canonical topics must parse");

        prop_assert_eq!(parsed.broker, broker);
        prop_assert_eq!(parsed.exchange, exchange);
        prop_assert_eq!(parsed.symbol, symbol);
        prop_assert_eq!(parsed.mode, mode);
    }

    /// Junk never parses into an index exchange with an empty symbol.
    #[test]
    fn parser_never_yields_empty_fields(raw in "[A-Za-z0-9_]{0,40}") {
        if let Some(topic) = Topic::parse(&raw) {
            prop_assert!(!topic.broker.is_empty());
            prop_assert!(!topic.symbol.is_empty());
        }
    }
}

// =============================================================================
// LTP throttle spacing
// =============================================================================

proptest! {
    /// For any arrival pattern, delivered LTP ticks for one instrument are
    /// at least 50 ms apart.
    #[test]
    fn delivered_ticks_respect_the_floor(deltas in prop::collection::vec(0u64..200, 1..60)) {
        let throttle = LtpThrottle::new();
        let start = Instant::now();

        let mut at = 0u64;
        let mut delivered = Vec::new();
        for delta in deltas {
            at += delta;
            let now = start + Duration::from_millis(at);
            if throttle.allow_at("SBIN", Exchange::Nse, now) {
                delivered.push(at);
            }
        }

        for pair in delivered.windows(2) {
            prop_assert!(pair[1] - pair[0] >= 50,
                "delivered ticks {}ms apart", pair[1] - pair[0]);
        }
    }
}

// =============================================================================
// Action Center ownership
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// For any two distinct users, a pending order owned by the first is
    /// immune to approve/reject/delete from the second.
    #[test]
    fn foreign_users_cannot_decide_pending_orders(
        owner in "[a-z]{3,10}",
        other in "[a-z]{3,10}",
        api_type in prop::sample::select(vec!["placeorder", "smartorder", "basketorder"]),
    ) {
        prop_assume!(owner != other);

        let dir = tempfile::tempdir().unwrap();
        let center = ActionCenter::new(dir.path().join("m.db").to_str().unwrap()).unwrap();

        let id = center
            .enqueue(&owner, api_type, &serde_json::json!({"symbol": "SBIN"}))
            .unwrap();

        prop_assert!(center.approve(id, &other).is_err());
        prop_assert!(center.reject(id, &other, "no").is_err());
        prop_assert!(center.delete(id, &other).is_err());

        // Untouched and still decidable by the owner.
        let row = center.get(id, &owner).unwrap();
        prop_assert!(row.decided_by.is_none());
        prop_assert!(center.approve(id, &owner).is_ok());
    }
}

// =============================================================================
// Sandbox fund equation
// =============================================================================

mod funds {
    use super::*;
    use async_trait::async_trait;
    use meridian_gateway::error::GatewayError;
    use meridian_gateway::sandbox::{QuoteSource, SandboxEngine};
    use meridian_gateway::symbols::{Instrument, RegistryTable, SymbolRegistry};
    use meridian_gateway::types::{InstrumentType, OrderAction, OrderRequest, PriceType, Product};
    use parking_lot::Mutex;

    struct SequenceQuotes {
        prices: Mutex<Vec<f64>>,
        fallback: f64,
    }

    #[async_trait]
    impl QuoteSource for SequenceQuotes {
        async fn ltp(
            &self,
            _u: &str,
            _s: &str,
            _e: Exchange,
        ) -> Result<f64, GatewayError> {
            let mut prices = self.prices.lock();
            Ok(if prices.is_empty() { self.fallback } else { prices.remove(0) })
        }
    }

    fn engine_with_prices(prices: Vec<f64>) -> (Arc<SandboxEngine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SandboxStore::new(dir.path().join("s.db").to_str().unwrap()).unwrap(),
        );
        let registry = Arc::new(SymbolRegistry::new());
        registry.swap(RegistryTable::build(
            vec![Instrument {
                symbol: "SBIN".into(),
                exchange: Exchange::Nse,
                instrument_type: InstrumentType::Equity,
                lot_size: 1,
                tick_size: 0.05,
                expiry: None,
                strike: None,
            }],
            vec![],
        ));
        let quotes = Arc::new(SequenceQuotes { prices: Mutex::new(prices), fallback: 100.0 });
        (Arc::new(SandboxEngine::new(store, quotes, registry)), dir)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// After any sequence of MARKET fills (long and short, opening,
        /// reducing, reversing), the fund identity
        /// `available + used_margin = total_capital + realized_pnl` holds.
        #[test]
        fn fund_equation_survives_any_fill_sequence(
            trades in prop::collection::vec(
                (prop::bool::ANY, 1u32..50, 50u32..500),
                1..12,
            ),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            rt.block_on(async {
                let prices: Vec<f64> =
                    trades.iter().map(|(_, _, p)| *p as f64).collect();
                let (engine, _dir) = engine_with_prices(prices);

                for (is_buy, qty, _) in &trades {
                    let request = OrderRequest {
                        symbol: "SBIN".into(),
                        exchange: Exchange::Nse,
                        action: if *is_buy { OrderAction::Buy } else { OrderAction::Sell },
                        quantity: *qty,
                        price_type: PriceType::Market,
                        price: None,
                        trigger_price: None,
                        product: Product::Mis,
                    };
                    // Rejections (insufficient funds) are fine; the equation
                    // must hold either way.
                    let _ = engine.place_order("u1", &request).await;

                    let funds = engine.store().funds("u1").unwrap();
                    prop_assert!(
                        funds.balanced(),
                        "available={} used={} capital={} realized={}",
                        funds.available_balance,
                        funds.used_margin,
                        funds.total_capital,
                        funds.realized_pnl
                    );
                    prop_assert!(funds.used_margin > -0.01);
                }
                Ok(())
            })?;
        }
    }
}

// =============================================================================
// Two-tier cache monotonicity
// =============================================================================

mod cache {
    use super::*;
    use meridian_gateway::auth::cache::{AuthCache, CacheLookup, KeyIdentity};
    use meridian_gateway::types::OrderMode;

    fn identity(user: &str) -> KeyIdentity {
        KeyIdentity {
            key_id: 1,
            user_id: user.to_string(),
            order_mode: OrderMode::Auto,
            default_broker: None,
        }
    }

    proptest! {
        /// Whatever interleaving of positive and negative caching happened
        /// before, a key cached as invalid is rejected without a store hit,
        /// and purging a user removes every cached key of that user.
        #[test]
        fn invalid_tier_always_wins_and_purge_is_complete(
            keys in prop::collection::hash_set("[a-f0-9]{8}", 1..20),
            invalid_mask in prop::collection::vec(prop::bool::ANY, 1..20),
        ) {
            let keys: Vec<String> = keys.into_iter().collect();
            let cache = AuthCache::new();

            for (i, key) in keys.iter().enumerate() {
                cache.cache_valid(key, identity("victim"));
                if invalid_mask.get(i).copied().unwrap_or(false) {
                    cache.cache_invalid(key);
                }
            }

            for (i, key) in keys.iter().enumerate() {
                let expect_invalid = invalid_mask.get(i).copied().unwrap_or(false);
                match cache.lookup(key) {
                    CacheLookup::Invalid => prop_assert!(expect_invalid),
                    CacheLookup::Valid(_) => prop_assert!(!expect_invalid),
                    CacheLookup::Miss => prop_assert!(false, "nothing expired yet"),
                }
            }

            cache.purge_user("victim");
            for (i, key) in keys.iter().enumerate() {
                let expect_invalid = invalid_mask.get(i).copied().unwrap_or(false);
                match cache.lookup(key) {
                    // Negative entries survive a user purge; they carry no
                    // identity to match on and age out on their own.
                    CacheLookup::Invalid => prop_assert!(expect_invalid),
                    CacheLookup::Miss => prop_assert!(!expect_invalid),
                    CacheLookup::Valid(_) => prop_assert!(false, "purged key still valid"),
                }
            }
        }
    }
}

// =============================================================================
// Revocation defeats a warm cache (deterministic, many key shapes)
// =============================================================================

mod revocation {
    use super::*;
    use meridian_gateway::auth::{AuthService, AuthStore};
    use meridian_gateway::crypto::CredentialVault;
    use meridian_gateway::types::OrderMode;

    #[test]
    fn every_issued_key_fails_after_revocation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            AuthStore::new(dir.path().join("auth.db").to_str().unwrap()).unwrap(),
        );
        let vault = Arc::new(CredentialVault::new("0123456789abcdef0123456789abcdef"));
        let auth = AuthService::new(store, vault, "pepper-pepper-pepper-pepper-1234");

        auth.register_user("u1", "pw").unwrap();
        for _ in 0..3 {
            let raw = auth.issue_key("u1", OrderMode::Auto).unwrap();

            // Warm the cache, then revoke.
            let id = auth.verify_key(&raw).unwrap();
            auth.verify_key(&raw).unwrap();
            auth.revoke_key(id.key_id).unwrap();

            // Every subsequent verification fails, cache warmth or not.
            for _ in 0..3 {
                assert!(auth.verify_key(&raw).is_err());
            }
        }
    }
}
