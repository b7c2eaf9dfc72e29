use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use corral::config::Config;
use corral::document::{Body, EntityKind};
use corral::error::Error;
use corral::provider::StorageProvider;
use corral::store::{DocumentStore, Filter};

fn provider() -> StorageProvider {
    StorageProvider::in_memory(Config::default())
}

#[tokio::test]
async fn job_round_trip_with_parameters() {
    let provider = provider();
    let jobs = provider.jobs();

    jobs.create("job-1", json!({"type": "Send", "args": [42]}))
        .await
        .unwrap();
    jobs.set_parameter("job-1", "RetryCount", "3").await.unwrap();
    jobs.set_parameter("job-1", "CurrentCulture", "en-US")
        .await
        .unwrap();

    assert_eq!(
        jobs.get_parameter("job-1", "RetryCount").await.unwrap(),
        Some("3".to_string())
    );
    assert_eq!(jobs.get_parameter("job-1", "Missing").await.unwrap(), None);
}

#[tokio::test]
async fn duplicate_job_id_is_rejected() {
    let provider = provider();
    let jobs = provider.jobs();

    jobs.create("job-1", json!({})).await.unwrap();
    let err = jobs.create("job-1", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn job_expire_then_persist_clears_expiry() {
    let provider = provider();
    let jobs = provider.jobs();
    let store = provider.store();

    jobs.create("job-1", json!({})).await.unwrap();
    jobs.expire("job-1", Duration::from_secs(3600)).await.unwrap();

    let doc = store.read(EntityKind::Job, "job-1").await.unwrap().unwrap();
    assert!(doc.expire_on.is_some());

    jobs.persist("job-1").await.unwrap();
    let doc = store.read(EntityKind::Job, "job-1").await.unwrap().unwrap();
    assert!(doc.expire_on.is_none());
    assert!(doc.time_to_live.is_none());
}

#[tokio::test]
async fn parameter_updates_on_missing_job_report_not_found() {
    let provider = provider();
    let err = provider
        .jobs()
        .set_parameter("ghost", "a", "b")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn server_announce_heartbeat_and_timeout_reaping() {
    let provider = provider();
    let servers = provider.servers();
    let store = provider.store();

    servers.announce("worker-a", 20).await.unwrap();
    servers.announce("worker-b", 20).await.unwrap();

    // Age worker-b's heartbeat past the cutoff by hand.
    let id = "server:worker-b";
    let mut doc = store.read(EntityKind::Server, id).await.unwrap().unwrap();
    if let Body::Server(server) = &mut doc.body {
        server.last_heartbeat = Utc::now() - Duration::from_secs(600);
    }
    store.upsert(&doc).await.unwrap();

    servers.heartbeat("worker-a").await.unwrap();

    let removed = servers
        .remove_timed_out(Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.read(EntityKind::Server, id).await.unwrap().is_none());
    assert!(store
        .read(EntityKind::Server, "server:worker-a")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn heartbeat_for_unknown_server_is_benign() {
    let provider = provider();
    provider.servers().heartbeat("never-announced").await.unwrap();
}

#[tokio::test]
async fn server_remove_deletes_the_announcement() {
    let provider = provider();
    let servers = provider.servers();
    let store = provider.store();

    servers.announce("worker-a", 4).await.unwrap();
    servers.remove("worker-a").await.unwrap();
    assert!(store
        .read(EntityKind::Server, "server:worker-a")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn counters_flow_through_the_provider() {
    let provider = provider();
    let counters = provider.counters();

    counters.increment("stats:succeeded").await.unwrap();
    counters.increment("stats:succeeded").await.unwrap();
    counters.decrement("stats:succeeded").await.unwrap();

    assert_eq!(counters.get_value("stats:succeeded").await.unwrap(), 1);

    let raw = provider
        .store()
        .query(EntityKind::Counter, &Filter::RawCounters, None, 100)
        .await
        .unwrap();
    assert_eq!(raw.documents.len(), 3);
}
