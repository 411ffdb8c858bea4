//! API route definitions and shared application state.
//!
//! Grounded on the teacher's `api::routes` (`AppState` struct +
//! `create_router` building one `Router` with `.with_state`), expanded
//! from the teacher's single `db`/`broadcast` pair into the full set of
//! collaborators this service wires together.

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{handlers, middleware, rate_limit::RateLimiter, sse, ws};
use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::driver::Driver;
use crate::hub::Hub;
use crate::store::RunStore;

/// Shared application state threaded through every handler via axum's
/// `State` extractor. Field order here is load-bearing: handlers and
/// tests construct this struct literal directly.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub local_driver: Arc<dyn Driver>,
    #[cfg(feature = "k8s-driver")]
    pub k8s_driver: Option<Arc<dyn Driver>>,
    pub collaborators: Collaborators,
    pub hub: Arc<Hub>,
    pub config: Arc<Config>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<crate::api::metrics::Metrics>,
    /// Cancellation token per in-flight run, so `DELETE /runs/{id}` can
    /// signal the scheduler driving it without reaching into its task.
    pub active_runs: Arc<DashMap<String, CancellationToken>>,
}

/// Build the complete API router, with CORS, tracing, rate limiting, and
/// optional bearer auth layered around it (spec §4.6/§6).
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
        .allow_origin(middleware::cors_origin_predicate(state.config.clone()));

    Router::new()
        .route("/runs", post(handlers::create_run))
        .route("/runs/:id", get(handlers::get_run).delete(handlers::cancel_run))
        .route(
            "/runs/:id/checkpoints",
            post(handlers::create_checkpoint).get(handlers::list_checkpoints),
        )
        .route("/runs/:id/events", get(sse::sse_events))
        .route("/ws/streams/:streamId", get(ws::ws_upgrade))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::auth_middleware))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::metrics::Metrics;
    use crate::driver::local::LocalProcessDriver;
    use crate::store::memory::MemoryStore;

    fn test_state() -> AppState {
        let config = Arc::new(Config::load().unwrap());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
        AppState {
            store: Arc::new(MemoryStore::new()),
            local_driver: Arc::new(LocalProcessDriver::new()),
            #[cfg(feature = "k8s-driver")]
            k8s_driver: None,
            collaborators: Collaborators::in_memory(),
            hub: Arc::new(Hub::new()),
            config,
            rate_limiter,
            metrics: Arc::new(Metrics::new()),
            active_runs: Arc::new(DashMap::new()),
        }
    }

    #[test]
    fn router_builds_without_panicking() {
        let _router = create_router(test_state());
    }
}
