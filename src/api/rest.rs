// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Thin edge over the order router and action center: every order-path
// request carries an `apikey` field in its JSON body; the router verifies,
// rate-limits, and gates it. Full request schemas belong to the outer API
// layer — these routes exist to drive the core.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::ApiContext;
use crate::error::GatewayError;
use crate::ratelimit::Category;
use crate::symbols::master::refresh;
use crate::symbols::ExpiryFormat;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST router with CORS middleware and shared state.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Order path (api_type inferred from the route) ───────────
        .route("/api/v1/placeorder", post(|s, b| handle_api(s, b, "placeorder")))
        .route("/api/v1/smartorder", post(|s, b| handle_api(s, b, "smartorder")))
        .route("/api/v1/basketorder", post(|s, b| handle_api(s, b, "basketorder")))
        .route("/api/v1/splitorder", post(|s, b| handle_api(s, b, "splitorder")))
        .route("/api/v1/optionsorder", post(|s, b| handle_api(s, b, "optionsorder")))
        .route(
            "/api/v1/optionsmultiorder",
            post(|s, b| handle_api(s, b, "optionsmultiorder")),
        )
        .route("/api/v1/modifyorder", post(|s, b| handle_api(s, b, "modifyorder")))
        .route("/api/v1/cancelorder", post(|s, b| handle_api(s, b, "cancelorder")))
        .route("/api/v1/cancelallorder", post(|s, b| handle_api(s, b, "cancelallorder")))
        .route("/api/v1/closeposition", post(|s, b| handle_api(s, b, "closeposition")))
        .route(
            "/api/v1/closeallpositions",
            post(|s, b| handle_api(s, b, "closeallpositions")),
        )
        .route("/api/v1/orderstatus", post(|s, b| handle_api(s, b, "orderstatus")))
        .route("/api/v1/openposition", post(|s, b| handle_api(s, b, "openposition")))
        .route("/api/v1/orderbook", post(|s, b| handle_api(s, b, "orderbook")))
        .route("/api/v1/tradebook", post(|s, b| handle_api(s, b, "tradebook")))
        .route("/api/v1/positions", post(|s, b| handle_api(s, b, "positions")))
        .route("/api/v1/holdings", post(|s, b| handle_api(s, b, "holdings")))
        .route("/api/v1/funds", post(|s, b| handle_api(s, b, "funds")))
        .route("/api/v1/quote", post(|s, b| handle_api(s, b, "quote")))
        .route("/api/v1/depth", post(|s, b| handle_api(s, b, "depth")))
        .route("/api/v1/history", post(|s, b| handle_api(s, b, "history")))
        .route("/api/v1/analyzer/toggle", post(|s, b| handle_api(s, b, "analyzer/toggle")))
        // ── Action Center ───────────────────────────────────────────
        .route("/api/v1/pendingorders", post(list_pending))
        .route("/api/v1/pendingorders/:id/approve", post(approve_pending))
        .route("/api/v1/pendingorders/:id/reject", post(reject_pending))
        .route("/api/v1/pendingorders/:id", delete(delete_pending))
        // ── Master contracts ────────────────────────────────────────
        .route("/api/v1/master/refresh", post(refresh_master))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "instruments": ctx.registry.snapshot().len(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Order path
// =============================================================================

fn take_api_key(body: &Value) -> Result<String, GatewayError> {
    body["apikey"]
        .as_str()
        .or_else(|| body["api_key"].as_str())
        .map(str::to_string)
        .ok_or(GatewayError::InvalidApiKey)
}

async fn handle_api(
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<Value>,
    api_type: &'static str,
) -> Result<Json<Value>, GatewayError> {
    let api_key = take_api_key(&body)?;
    let result = ctx.router.handle(&api_key, api_type, &body, false).await?;
    Ok(Json(result))
}

// =============================================================================
// Action Center
// =============================================================================

async fn list_pending(
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let api_key = take_api_key(&body)?;
    let identity = ctx.auth.verify_key(&api_key)?;
    ctx.limiter.check(&api_key, Category::General)?;

    let rows = ctx.router.action_center().list(&identity.user_id)?;
    Ok(Json(json!({"status": "success", "data": rows})))
}

async fn approve_pending(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let api_key = take_api_key(&body)?;
    let identity = ctx.auth.verify_key(&api_key)?;
    ctx.limiter.check(&api_key, Category::OrderPlacement)?;

    let result = ctx.router.approve(id, &identity.user_id).await?;
    Ok(Json(result))
}

async fn reject_pending(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let api_key = take_api_key(&body)?;
    let identity = ctx.auth.verify_key(&api_key)?;
    ctx.limiter.check(&api_key, Category::General)?;

    let reason = body["reason"].as_str().unwrap_or("rejected from Action Center");
    ctx.router.reject(id, &identity.user_id, reason)?;
    Ok(Json(json!({"status": "success", "pending_order_id": id})))
}

async fn delete_pending(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let api_key = take_api_key(&body)?;
    let identity = ctx.auth.verify_key(&api_key)?;
    ctx.limiter.check(&api_key, Category::General)?;

    ctx.router.action_center().delete(id, &identity.user_id)?;
    Ok(Json(json!({"status": "success", "pending_order_id": id})))
}

// =============================================================================
// Master contracts
// =============================================================================

async fn refresh_master(
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let api_key = take_api_key(&body)?;
    ctx.auth.verify_key(&api_key)?;
    ctx.limiter.check(&api_key, Category::General)?;

    let count = refresh(&ctx.registry, &ctx.contract_sources, ExpiryFormat::Live).await?;
    info!(instruments = count, "manual master refresh complete");
    Ok(Json(json!({"status": "success", "instruments": count})))
}
