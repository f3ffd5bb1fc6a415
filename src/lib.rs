// =============================================================================
// Meridian Gateway — broker-agnostic algorithmic trading gateway
// =============================================================================
//
// Crate layout:
//   config     — environment-driven gateway configuration
//   error      — error taxonomy and its HTTP surface
//   types      — shared domain types (orders, positions, ticks)
//   crypto     — credential vault (AEAD) and memory-hard hashing
//   auth       — API-key verification with the two-tier cache
//   symbols    — symbol & contract registry with atomic rebuild
//   broker     — adapter contract, capabilities, factory, adapters
//   bus        — internal market-data pub/sub bus
//   proxy      — streaming WebSocket proxy and adapter pool
//   router     — order router, mode gate, action center
//   sandbox    — paper-trading execution engine
//   ratelimit  — per-key, per-category moving-window limiter
//   api        — thin REST surface driving the core
// =============================================================================

pub mod api;
pub mod auth;
pub mod broker;
pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod proxy;
pub mod ratelimit;
pub mod router;
pub mod sandbox;
pub mod symbols;
pub mod types;

pub use config::GatewayConfig;
pub use error::{ErrorCode, GatewayError};
