//! HTTP server: the router REST surface, the reputation RPC surface,
//! receiver webhook endpoints, and health/metrics.

mod error;
mod health;
mod router_api;
mod server;
mod state;
mod webhooks;

pub use server::start_http_server;
pub use state::ApiState;
