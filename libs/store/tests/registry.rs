//! Service registry against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use corral_store::{CoordStore, MemoryStore, ServiceEvent, ServiceInfo, ServiceRegistry};
use tokio::time::timeout;

fn registry() -> ServiceRegistry {
    let store: Arc<dyn CoordStore> =
        Arc::new(MemoryStore::with_sweep_interval(Duration::from_millis(20)));
    ServiceRegistry::new(store)
}

#[tokio::test]
async fn test_register_list_and_watch() {
    let registry = registry();
    let mut watch = registry.watch("node-agent").await.unwrap();

    let info = ServiceInfo::new("node-agent", "10.0.0.1", 8000);
    let registration = registry
        .register(info.clone(), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(registry.list("node-agent").await.unwrap(), vec![info.clone()]);
    assert!(registry.list("other").await.unwrap().is_empty());

    let event = timeout(Duration::from_secs(2), watch.next()).await.unwrap();
    assert_eq!(event, Some(ServiceEvent::Added(info.clone())));

    registration.deregister().await.unwrap();
    let event = timeout(Duration::from_secs(2), watch.next()).await.unwrap();
    assert_eq!(event, Some(ServiceEvent::Removed(info)));
}

#[tokio::test]
async fn test_refresh_keeps_entry_alive_without_events() {
    let registry = registry();
    let info = ServiceInfo::new("node-agent", "10.0.0.2", 8000);
    let _registration = registry
        .register(info.clone(), Duration::from_millis(300))
        .await
        .unwrap();
    let mut watch = registry.watch("node-agent").await.unwrap();

    // Several lease periods pass; refreshes are not membership changes.
    let quiet = timeout(Duration::from_millis(900), watch.next()).await;
    assert!(quiet.is_err());
    assert_eq!(registry.list("node-agent").await.unwrap(), vec![info]);
}

#[tokio::test]
async fn test_dropped_registration_expires() {
    let registry = registry();
    let info = ServiceInfo::new("node-agent", "10.0.0.3", 8000);
    let registration = registry
        .register(info.clone(), Duration::from_millis(200))
        .await
        .unwrap();
    let mut watch = registry.watch("node-agent").await.unwrap();
    drop(registration);

    let event = timeout(Duration::from_secs(2), watch.next()).await.unwrap();
    assert_eq!(event, Some(ServiceEvent::Removed(info)));
}
