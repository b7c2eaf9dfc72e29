use std::sync::Arc;
use std::time::Duration;

use corral::document::EntityKind;
use corral::error::Error;
use corral::lock::{LockManager, LockOptions};
use corral::store::DocumentStore;
use corral::store::memory::MemoryStore;

fn manager() -> (Arc<MemoryStore>, LockManager) {
    let store = Arc::new(MemoryStore::new());
    let locks = LockManager::new(
        store.clone(),
        LockOptions {
            backoff: Duration::from_millis(30),
            ttl_grace: Duration::from_secs(5),
        },
    );
    (store, locks)
}

#[tokio::test]
async fn acquire_and_release_round_trip() {
    let (store, locks) = manager();

    let guard = locks
        .acquire("maintenance", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(guard.resource(), "maintenance");
    assert!(
        store
            .read(EntityKind::Lock, "lock:maintenance")
            .await
            .unwrap()
            .is_some()
    );

    guard.release().await;
    assert!(
        store
            .read(EntityKind::Lock, "lock:maintenance")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn held_resource_blocks_until_release() {
    let (_store, locks) = manager();

    let guard = locks.acquire("shared", Duration::from_secs(2)).await.unwrap();

    let contender = {
        let locks = locks.clone();
        tokio::spawn(async move { locks.acquire("shared", Duration::from_secs(2)).await })
    };

    // Give the contender time to hit contention at least once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!contender.is_finished());

    guard.release().await;
    let second = contender.await.unwrap().unwrap();
    second.release().await;
}

#[tokio::test]
async fn never_released_resource_times_out_with_resource_name() {
    let (_store, locks) = manager();

    let _held = locks.acquire("busy", Duration::from_secs(5)).await.unwrap();

    let started = std::time::Instant::now();
    let err = locks
        .acquire("busy", Duration::from_millis(200))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        Error::LockTimeout { resource, waited } => {
            assert_eq!(resource, "busy");
            assert!(waited >= Duration::from_millis(200));
        }
        other => panic!("expected LockTimeout, got {other:?}"),
    }
    // Approximately the timeout, within one backoff interval.
    assert!(elapsed < Duration::from_millis(500), "waited {elapsed:?}");
}

#[tokio::test]
async fn ttl_reclaims_crashed_holder() {
    let store = Arc::new(MemoryStore::new());
    let locks = LockManager::new(
        store.clone(),
        LockOptions {
            backoff: Duration::from_millis(30),
            ttl_grace: Duration::ZERO,
        },
    );

    // Hold with a sub-second timeout; TTL floors at one second.
    let guard = locks.acquire("crashy", Duration::from_millis(100)).await.unwrap();
    std::mem::forget(guard); // simulate a crash: no release, no drop hook

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let reclaimed = locks
        .acquire("crashy", Duration::from_millis(200))
        .await
        .unwrap();
    reclaimed.release().await;
}

#[tokio::test]
async fn with_lock_releases_after_failed_operation() {
    let (_store, locks) = manager();

    let result: corral::Result<()> = locks
        .with_lock("guarded", Duration::from_secs(1), || async {
            Err(Error::Other("operation failed".into()))
        })
        .await;
    assert!(result.is_err());

    // The lock must be free again despite the failure.
    let guard = locks
        .acquire("guarded", Duration::from_millis(300))
        .await
        .unwrap();
    guard.release().await;
}

#[tokio::test]
async fn empty_resource_is_rejected_eagerly() {
    let (_store, locks) = manager();
    let err = locks.acquire("", Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
