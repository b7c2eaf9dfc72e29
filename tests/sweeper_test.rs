use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use corral::document::{
    Body, CounterBody, CounterKind, Document, EntityKind, JobBody, ListBody, SetBody,
};
use corral::lock::{LockManager, LockOptions};
use corral::store::memory::MemoryStore;
use corral::store::DocumentStore;
use corral::sweeper::{ExpirationSweeper, SweeperOptions};

fn fixture() -> (Arc<MemoryStore>, LockManager, ExpirationSweeper) {
    let store = Arc::new(MemoryStore::new());
    let locks = LockManager::new(
        store.clone(),
        LockOptions {
            backoff: Duration::from_millis(30),
            ttl_grace: Duration::from_secs(5),
        },
    );
    let sweeper = ExpirationSweeper::new(
        store.clone(),
        locks.clone(),
        SweeperOptions {
            lock_timeout: Duration::from_millis(200),
            page_size: 10,
        },
    );
    (store, locks, sweeper)
}

fn job(expired: bool) -> Document {
    let mut doc = Document::new(Body::Job(JobBody {
        created_on: Utc::now(),
        parameters: Default::default(),
        payload: serde_json::json!({"type": "noop"}),
    }));
    doc.expire_on = Some(if expired {
        Utc::now() - Duration::from_secs(60)
    } else {
        Utc::now() + Duration::from_secs(3600)
    });
    doc
}

fn counter(kind: CounterKind, expired: bool) -> Document {
    let mut doc = Document::new(Body::Counter(CounterBody {
        key: "stats".into(),
        value: 1,
        counter_kind: kind,
    }));
    if expired {
        doc.expire_on = Some(Utc::now() - Duration::from_secs(60));
    }
    doc
}

#[tokio::test]
async fn sweeps_expired_and_spares_the_rest() {
    let (store, _locks, sweeper) = fixture();

    let expired_job = store.upsert(&job(true)).await.unwrap();
    let future_job = store.upsert(&job(false)).await.unwrap();

    // No expiry at all: never a candidate.
    let unset = store
        .upsert(&Document::new(Body::List(ListBody {
            key: "history".into(),
            value: "entry".into(),
            created_on: Utc::now(),
        })))
        .await
        .unwrap();

    let mut expired_set = Document::new(Body::Set(SetBody {
        key: "schedule".into(),
        value: "old".into(),
        score: 0.0,
        created_on: Utc::now(),
    }));
    expired_set.expire_on = Some(Utc::now() - Duration::from_secs(1));
    let expired_set = store.upsert(&expired_set).await.unwrap();

    let report = sweeper.execute(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.total(), 2);

    assert!(store.read(EntityKind::Job, &expired_job.id).await.unwrap().is_none());
    assert!(store.read(EntityKind::Set, &expired_set.id).await.unwrap().is_none());
    assert!(store.read(EntityKind::Job, &future_job.id).await.unwrap().is_some());
    assert!(store.read(EntityKind::List, &unset.id).await.unwrap().is_some());
}

#[tokio::test]
async fn raw_counters_survive_any_expiry() {
    let (store, _locks, sweeper) = fixture();

    let raw = store
        .upsert(&counter(CounterKind::Raw, true))
        .await
        .unwrap();
    let aggregate = store
        .upsert(&counter(CounterKind::Aggregate, true))
        .await
        .unwrap();

    let report = sweeper.execute(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.total(), 1);

    // The unaggregated delta must outlive the sweep; only the folded
    // aggregate may expire.
    assert!(store.read(EntityKind::Counter, &raw.id).await.unwrap().is_some());
    assert!(store.read(EntityKind::Counter, &aggregate.id).await.unwrap().is_none());
}

#[tokio::test]
async fn sweep_resumes_across_continuation_pages() {
    let (store, _locks, sweeper) = fixture();

    // Page size is 10; make sure multiple pages are walked to done.
    for _ in 0..35 {
        store.upsert(&job(true)).await.unwrap();
    }

    let report = sweeper.execute(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.total(), 35);
}

#[tokio::test]
async fn held_fleet_lock_skips_the_tick() {
    let (store, locks, sweeper) = fixture();

    let doomed = store.upsert(&job(true)).await.unwrap();
    let guard = locks
        .acquire("expiration-sweeper", Duration::from_secs(5))
        .await
        .unwrap();

    let report = sweeper.execute(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.total(), 0, "tick must be skipped, not fail");
    assert!(store.read(EntityKind::Job, &doomed.id).await.unwrap().is_some());

    guard.release().await;
    let report = sweeper.execute(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.total(), 1);
}

#[tokio::test]
async fn cancellation_surfaces_distinctly() {
    let (_store, _locks, sweeper) = fixture();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = sweeper.execute(&cancel).await.unwrap_err();
    assert!(matches!(err, corral::Error::Cancelled));
}
