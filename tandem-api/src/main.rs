//! tandem API server entry point
//!
//! Loads configuration, builds the etcd pool, both repositories, the cache
//! and the invalidation bus, then serves HTTP until ctrl-c.

use std::sync::Arc;

use tandem_api::telemetry::init_tracing;
use tandem_api::{
    create_router, invalidation_listener_task, ApiError, ApiResult, AppConfig, AppState,
    InvalidationListenerMetrics, KeyValueService,
};
use tandem_storage::{
    ClientPool, EtcdConnectionFactory, EtcdInvalidationBus, EtcdRepository, InvalidationBus,
    MemoryCache, PostgresRepository,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing()?;

    let config = AppConfig::from_env()?;

    let pool = ClientPool::from_config(EtcdConnectionFactory::new(config.etcd.clone()), &config.etcd);
    let pg_pool = config.db.create_pool()?;

    let cache = Arc::new(MemoryCache::new(&config.cache));
    let bus: Arc<dyn InvalidationBus> = Arc::new(EtcdInvalidationBus::new(pool.clone()));
    let service = Arc::new(KeyValueService::new(
        cache.clone(),
        Arc::new(EtcdRepository::new(pool.clone())),
        Arc::new(PostgresRepository::new(pg_pool, config.retry)),
        bus.clone(),
        config.cache.ttl,
    ));

    let shutdown = CancellationToken::new();
    let gc = cache.spawn_gc(config.cache.gc_interval, shutdown.clone());
    let listener_metrics = Arc::new(InvalidationListenerMetrics::new());
    let listener = tokio::spawn(invalidation_listener_task(
        service.clone(),
        bus,
        config.listener.clone(),
        listener_metrics.clone(),
        shutdown.clone(),
    ));

    let app = create_router(AppState::new(service, listener_metrics, config.server.request_timeout));

    let addr = config.server.bind_addr;
    tracing::info!(
        %addr,
        etcd_endpoints = ?config.etcd.endpoints,
        pool_capacity = pool.capacity(),
        request_timeout_ms = config.server.request_timeout.as_millis() as u64,
        "Starting tandem API server"
    );

    let listener_socket = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener_socket, app);
    let served = tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    shutdown.cancel();
    if let Err(e) = listener.await {
        tracing::warn!(error = %e, "Invalidation listener task failed");
    }
    if let Err(e) = gc.await {
        tracing::warn!(error = %e, "Cache GC task failed");
    }
    pool.graceful_close();
    tracing::info!(pool = ?pool.stats(), "Shutdown complete");

    served
}
