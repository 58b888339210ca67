//! End-to-end behavior of the key/value service over the in-memory etcd
//! store, with the invalidation listener running.

use std::sync::Arc;
use std::time::Duration;

use tandem_api::{invalidation_listener_task, InvalidationListenerConfig, InvalidationListenerMetrics, KeyValueService};
use tandem_core::{ActionKind, KeyValue};
use tandem_storage::{Cache, InvalidationBus, MemoryCache};
use tandem_test_utils::{fixtures::MemoryEtcd, MockRepository};
use tokio_util::sync::CancellationToken;

/// One process: its own cache, service and listener, sharing the stores.
struct Instance {
    service: Arc<KeyValueService>,
    cache: Arc<MemoryCache>,
    metrics: Arc<InvalidationListenerMetrics>,
}

impl Instance {
    async fn start(etcd: &MemoryEtcd, postgres: Arc<MockRepository>, shutdown: &CancellationToken) -> Self {
        let cache = Arc::new(MemoryCache::default());
        let bus: Arc<dyn InvalidationBus> = Arc::new(etcd.bus());
        let service = Arc::new(KeyValueService::new(
            cache.clone(),
            Arc::new(etcd.repository()),
            postgres,
            bus.clone(),
            Duration::from_secs(60),
        ));
        let metrics = Arc::new(InvalidationListenerMetrics::new());
        tokio::spawn(invalidation_listener_task(
            service.clone(),
            bus,
            InvalidationListenerConfig::development(),
            metrics.clone(),
            shutdown.clone(),
        ));
        let instance = Self { service, cache, metrics };
        eventually(|| instance.metrics.snapshot().subscriptions == 1).await;
        instance
    }

    fn applied(&self) -> u64 {
        self.metrics.snapshot().events_applied
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_put_get_delete_scenario() {
    let etcd = MemoryEtcd::default();
    let postgres = Arc::new(MockRepository::postgres());
    let shutdown = CancellationToken::new();
    let node = Instance::start(&etcd, postgres.clone(), &shutdown).await;

    node.service.put(KeyValue::new("k1", "v1")).await.unwrap();
    eventually(|| node.applied() == 1).await;

    let first = node.service.get("k1").await.unwrap();
    assert_eq!((first.key.as_str(), first.value.as_str()), ("k1", "v1"));
    let selects = postgres.call_count(ActionKind::Select);

    let second = node.service.get("k1").await.unwrap();
    assert_eq!(second.value, "v1");
    assert_eq!(node.service.hit_count(), 1);
    assert_eq!(postgres.call_count(ActionKind::Select), selects);

    node.service.delete("k1").await.unwrap();
    eventually(|| node.applied() == 2).await;

    assert!(node.service.get("k1").await.unwrap_err().is_not_found());
    assert!(etcd.store.get("k1").is_none());

    shutdown.cancel();
}

#[tokio::test]
async fn test_write_on_one_instance_invalidates_the_other() {
    let etcd = MemoryEtcd::default();
    let postgres = Arc::new(MockRepository::postgres());
    let shutdown = CancellationToken::new();
    let reader = Instance::start(&etcd, postgres.clone(), &shutdown).await;
    let writer = Instance::start(&etcd, postgres.clone(), &shutdown).await;

    writer.service.put(KeyValue::new("shared", "old")).await.unwrap();
    eventually(|| reader.applied() == 1).await;
    assert_eq!(reader.service.get("shared").await.unwrap().value, "old");
    assert!(reader.cache.get("shared").await.is_some());

    writer.service.put(KeyValue::new("shared", "new")).await.unwrap();
    eventually(|| reader.applied() == 2).await;

    assert!(reader.cache.get("shared").await.is_none());
    assert_eq!(reader.service.get("shared").await.unwrap().value, "new");

    shutdown.cancel();
}

#[tokio::test]
async fn test_synthetic_invalidation_forces_cache_miss() {
    let etcd = MemoryEtcd::default();
    let postgres = Arc::new(MockRepository::postgres());
    let shutdown = CancellationToken::new();
    let node = Instance::start(&etcd, postgres.clone(), &shutdown).await;

    postgres.insert(tandem_test_utils::fixtures::key_value("k1", "v1"));
    node.service.get("k1").await.unwrap();
    assert!(node.cache.get("k1").await.is_some());

    // Announce the key directly on the bus, as another process would.
    etcd.bus().publish("k1").await.unwrap();
    eventually(|| node.applied() == 1).await;

    assert!(node.cache.get("k1").await.is_none());
    assert_eq!(node.service.hit_count(), 0);

    shutdown.cancel();
}

#[tokio::test]
async fn test_etcd_outage_fails_put_but_postgres_is_attempted() {
    let etcd = MemoryEtcd::default();
    let postgres = Arc::new(MockRepository::postgres());
    let shutdown = CancellationToken::new();
    let node = Instance::start(&etcd, postgres.clone(), &shutdown).await;

    etcd.store.set_fail_writes(true);
    let err = node.service.put(KeyValue::new("k1", "v1")).await.unwrap_err();
    assert!(matches!(err, tandem_api::ServiceError::Write { .. }));
    assert_eq!(postgres.call_count(ActionKind::Upsert), 1);

    assert!(etcd.store.get("k1").is_none());

    shutdown.cancel();
}
