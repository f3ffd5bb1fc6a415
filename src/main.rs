// =============================================================================
// Meridian Gateway — Main Entry Point
// =============================================================================
//
// Startup order matters: stores and crypto come up before anything that can
// take traffic; the bus exists before adapters register; background loops
// start last. Shutdown reverses it with a short bus linger so buffered
// ticks drain.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_gateway::api::{self, ApiContext};
use meridian_gateway::auth::{AuthService, AuthStore};
use meridian_gateway::broker::factory::{register_stock_brokers, AdapterFactory};
use meridian_gateway::bus::{MarketDataBus, SHUTDOWN_LINGER};
use meridian_gateway::config::GatewayConfig;
use meridian_gateway::crypto::CredentialVault;
use meridian_gateway::proxy::{self, AdapterPool, StreamingProxy};
use meridian_gateway::ratelimit::RateLimiter;
use meridian_gateway::router::{ActionCenter, LiveDispatcher, OrderRouter, OrdersStore};
use meridian_gateway::sandbox::execution::spawn_execution_loop;
use meridian_gateway::sandbox::squareoff::{spawn_scheduler, SquareOffScheduler};
use meridian_gateway::sandbox::{LiveQuoteSource, SandboxEngine, SandboxStore};
use meridian_gateway::symbols::master::{ContractSource, HttpContractSource};
use meridian_gateway::symbols::SymbolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Meridian Gateway — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = GatewayConfig::from_env()?;
    info!(
        ws = %config.websocket_addr(),
        rest = %config.rest_addr(),
        bus = %config.bus_addr(),
        "endpoints configured"
    );

    // ── 2. Crypto & stores ───────────────────────────────────────────────
    let vault = Arc::new(CredentialVault::new(&config.app_key));
    let auth_store = Arc::new(AuthStore::new(&config.database_url)?);
    let orders_store = Arc::new(OrdersStore::new(&config.database_url)?);
    let action_center = ActionCenter::new(&config.database_url)?;
    let sandbox_store = Arc::new(SandboxStore::new(&config.sandbox_database_url)?);

    let auth = Arc::new(AuthService::new(
        auth_store.clone(),
        vault.clone(),
        config.api_key_pepper.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));

    // ── 3. Symbol registry & master refresh ──────────────────────────────
    let registry = Arc::new(SymbolRegistry::new());
    let contract_sources: Vec<Arc<dyn ContractSource>> = std::env::var("CONTRACT_MASTER_URLS")
        .map(|urls| {
            urls.split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(|u| Arc::new(HttpContractSource::new(u)) as Arc<dyn ContractSource>)
                .collect()
        })
        .unwrap_or_default();

    if contract_sources.is_empty() {
        warn!("no CONTRACT_MASTER_URLS configured — symbol registry starts empty");
    } else {
        let registry_refresh = registry.clone();
        let sources = contract_sources.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(24 * 3600));
            loop {
                interval.tick().await;
                match meridian_gateway::symbols::master::refresh(
                    &registry_refresh,
                    &sources,
                    meridian_gateway::symbols::ExpiryFormat::Live,
                )
                .await
                {
                    Ok(count) => info!(instruments = count, "daily master refresh complete"),
                    Err(e) => error!(error = %e, "daily master refresh failed"),
                }
            }
        });
    }

    // ── 4. Bus, broker factory, adapter pool ─────────────────────────────
    let bus = Arc::new(MarketDataBus::new(config.bus_addr()));
    let factory = Arc::new(AdapterFactory::new(bus.clone()));
    register_stock_brokers(&factory);
    info!(brokers = ?factory.registered(), "broker registry ready");

    let pool = Arc::new(AdapterPool::new(factory.clone(), auth.clone()));

    // ── 5. Streaming proxy ───────────────────────────────────────────────
    let streaming = Arc::new(StreamingProxy::new(auth.clone(), registry.clone(), pool.clone()));
    {
        let streaming = streaming.clone();
        let bus = bus.clone();
        let addr = config.websocket_addr();
        tokio::spawn(async move {
            if let Err(e) = proxy::serve(streaming, bus, addr).await {
                error!(error = %e, "streaming proxy failed");
            }
        });
    }

    // ── 6. Sandbox engine & background loops ─────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let quotes = Arc::new(LiveQuoteSource::new(auth.clone(), factory.clone()));
    let sandbox = Arc::new(SandboxEngine::new(
        sandbox_store.clone(),
        quotes,
        registry.clone(),
    ));
    let _execution_loop = spawn_execution_loop(sandbox.clone(), shutdown_rx.clone());

    let scheduler = Arc::new(SquareOffScheduler::new(sandbox.clone()));
    let _squareoff_loop =
        spawn_scheduler(scheduler, config.squareoff_tick_secs, shutdown_rx.clone());

    // ── 7. Order router & REST server ────────────────────────────────────
    let dispatcher = Arc::new(LiveDispatcher::new(
        auth.clone(),
        factory.clone(),
        orders_store.clone(),
    ));
    let order_router = Arc::new(OrderRouter::new(
        auth.clone(),
        limiter.clone(),
        dispatcher,
        sandbox.clone(),
        action_center.clone(),
    ));

    let ctx = Arc::new(ApiContext {
        router: order_router,
        auth: auth.clone(),
        limiter: limiter.clone(),
        registry: registry.clone(),
        contract_sources,
    });
    {
        let app = api::rest::router(ctx);
        let addr = config.rest_addr();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .expect("failed to bind REST server");
            info!(addr = %addr, "REST server listening");
            axum::serve(listener, app).await.expect("REST server failed");
        });
    }

    // ── 8. Rate-limiter housekeeping ─────────────────────────────────────
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                limiter.cleanup();
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    bus.close();
    pool.shutdown().await;
    tokio::time::sleep(SHUTDOWN_LINGER).await;

    info!("Meridian Gateway shut down complete.");
    Ok(())
}
