//! MentatLab core server binary: builds the RunStore, the local and
//! (optionally) Kubernetes drivers, the Event Hub, and the API router,
//! then serves HTTP with graceful shutdown.
//!
//! Grounded on the teacher's `bin/orchestrator-server.rs` (tracing init,
//! config load, migrations, router build, `axum::serve` with a
//! ctrl_c/SIGTERM `shutdown_signal`), trimmed of the teacher's
//! LDAP/SSL/server-identity bookkeeping, which has no counterpart here.

use std::sync::Arc;

use dashmap::DashMap;
use mentatlab_core::api::routes::{create_router, AppState};
use mentatlab_core::api::{metrics::Metrics, rate_limit::RateLimiter};
use mentatlab_core::collaborators::Collaborators;
use mentatlab_core::config::{Config, StorageBackend};
use mentatlab_core::driver::local::LocalProcessDriver;
use mentatlab_core::hub::Hub;
use mentatlab_core::store::memory::MemoryStore;
use mentatlab_core::store::sqlite::SqliteStore;
use mentatlab_core::store::RunStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    tracing::info!("loading configuration");
    let config = Arc::new(Config::load()?);

    tracing::info!(backend = ?config.storage_backend, "initializing run store");
    let store: Arc<dyn RunStore> = match config.storage_backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => {
            let store = SqliteStore::connect(&config.sqlite_database_url).await?;
            Arc::new(store)
        }
    };

    let hub = Arc::new(Hub::new());

    #[cfg(feature = "redis-backend")]
    if let Some(redis_url) = &config.redis_url {
        tracing::info!(url = %redis_url, "starting redis hub relay subscriber");
        let relay_hub = hub.clone();
        let redis_url = redis_url.clone();
        tokio::spawn(async move {
            if let Err(err) = mentatlab_core::hub::redis_relay::run_subscriber(&redis_url, relay_hub).await {
                tracing::error!(error = %err, "redis hub relay subscriber exited");
            }
        });
    }

    let local_driver: Arc<dyn mentatlab_core::driver::Driver> = Arc::new(LocalProcessDriver::new());

    #[cfg(feature = "k8s-driver")]
    let k8s_driver: Option<Arc<dyn mentatlab_core::driver::Driver>> = {
        let mut driver = mentatlab_core::driver::container::ContainerJobDriver::new(config.k8s.namespace.clone());
        driver.service_account = config.k8s.service_account.clone();
        driver.image_pull_secrets = config.k8s.image_pull_secrets.clone();
        driver.cpu_request = config.k8s.cpu_request.clone();
        driver.memory_request = config.k8s.memory_request.clone();
        driver.cpu_limit = config.k8s.cpu_limit.clone();
        driver.memory_limit = config.k8s.memory_limit.clone();
        driver.active_deadline_secs = config.k8s.active_deadline_secs;
        driver.ttl_seconds_after_finished = config.k8s.ttl_seconds_after_finished;
        Some(Arc::new(driver))
    };

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
    let state = AppState {
        store,
        local_driver,
        #[cfg(feature = "k8s-driver")]
        k8s_driver,
        collaborators: Collaborators::in_memory(),
        hub,
        config: config.clone(),
        rate_limiter,
        metrics: Arc::new(Metrics::new()),
        active_runs: Arc::new(DashMap::new()),
    };

    tracing::info!("building api router");
    let app = create_router(state);

    tracing::info!(addr = %config.listen_addr, "starting server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

/// Ctrl-C or SIGTERM (unix only); `driver::SIGTERM_GRACE_PERIOD_SECS`
/// governs how long in-flight subprocess nodes get before SIGKILL once
/// a run's own cancellation is triggered, independent of this signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received sigterm, shutting down"),
    }
}
