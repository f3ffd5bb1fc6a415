// =============================================================================
// REST surface — the HTTP edge of the gateway core
// =============================================================================

pub mod rest;

use std::sync::Arc;

use crate::auth::AuthService;
use crate::ratelimit::RateLimiter;
use crate::router::OrderRouter;
use crate::symbols::master::ContractSource;
use crate::symbols::SymbolRegistry;

/// Everything the REST handlers need, shared via `State`.
pub struct ApiContext {
    pub router: Arc<OrderRouter>,
    pub auth: Arc<AuthService>,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<SymbolRegistry>,
    pub contract_sources: Vec<Arc<dyn ContractSource>>,
}

impl std::fmt::Debug for ApiContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiContext")
            .field("contract_sources", &self.contract_sources.len())
            .finish_non_exhaustive()
    }
}
