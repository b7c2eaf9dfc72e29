use chrono::Utc;
use tokio_util::sync::CancellationToken;

use corral::bulk::{self, Mutation};
use corral::document::{Body, Document, EntityKind, ListBody};
use corral::error::Error;
use corral::store::memory::MemoryStore;
use corral::store::{DocumentStore, Filter};

fn list_doc(id: &str, key: &str) -> Document {
    Document::with_id(
        id,
        Body::List(ListBody {
            key: key.into(),
            value: "v".into(),
            created_on: Utc::now(),
        }),
    )
}

async fn seed(store: &MemoryStore, count: usize, key: &str) {
    for i in 0..count {
        store
            .upsert(&list_doc(&format!("{key}-{i:03}"), key))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn continuation_walks_every_row_exactly_once() {
    let store = MemoryStore::new();
    seed(&store, 23, "k").await;

    let filter = Filter::KeyEquals { key: "k".into() };
    let mut seen = Vec::new();
    let mut continuation = None;
    loop {
        let page = store
            .query(EntityKind::List, &filter, continuation.as_ref(), 10)
            .await
            .unwrap();
        seen.extend(page.documents.into_iter().map(|d| d.id));
        match page.continuation {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }

    assert_eq!(seen.len(), 23);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 23, "no row may be delivered twice");
}

#[tokio::test]
async fn continuation_survives_deletion_between_pages() {
    let store = MemoryStore::new();
    seed(&store, 15, "k").await;

    let filter = Filter::KeyEquals { key: "k".into() };
    let first = store
        .query(EntityKind::List, &filter, None, 5)
        .await
        .unwrap();
    assert_eq!(first.documents.len(), 5);
    let token = first.continuation.unwrap();

    // Delete every row from page one before resuming.
    for doc in &first.documents {
        assert!(store.delete(EntityKind::List, &doc.id).await.unwrap());
    }

    let second = store
        .query(EntityKind::List, &filter, Some(&token), 100)
        .await
        .unwrap();
    assert_eq!(second.documents.len(), 10, "remaining rows, none skipped");
}

#[tokio::test]
async fn bulk_delete_spans_pages() {
    let store = MemoryStore::new();
    seed(&store, 27, "doomed").await;
    seed(&store, 3, "spared").await;

    let affected = bulk::run(
        &store,
        EntityKind::List,
        &Filter::KeyEquals {
            key: "doomed".into(),
        },
        &Mutation::Delete,
        10,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(affected, 27);

    let rest = store
        .query(EntityKind::List, &Filter::All, None, 100)
        .await
        .unwrap();
    assert_eq!(rest.documents.len(), 3);
}

#[tokio::test]
async fn bulk_set_then_clear_expiry() {
    let store = MemoryStore::new();
    seed(&store, 4, "k").await;
    let filter = Filter::KeyEquals { key: "k".into() };
    let cancel = CancellationToken::new();

    let when = Utc::now();
    let set = bulk::run(
        &store,
        EntityKind::List,
        &filter,
        &Mutation::SetExpiry(when),
        10,
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(set, 4);

    let expired = store
        .query(
            EntityKind::List,
            &Filter::Expired { cutoff: Utc::now() },
            None,
            100,
        )
        .await
        .unwrap();
    assert_eq!(expired.documents.len(), 4);

    let cleared = bulk::run(
        &store,
        EntityKind::List,
        &filter,
        &Mutation::ClearExpiry,
        10,
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(cleared, 4);

    let expired = store
        .query(
            EntityKind::List,
            &Filter::Expired { cutoff: Utc::now() },
            None,
            100,
        )
        .await
        .unwrap();
    assert!(expired.documents.is_empty());
}

#[tokio::test]
async fn bulk_run_surfaces_cancellation() {
    let store = MemoryStore::new();
    seed(&store, 2, "k").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = bulk::run(
        &store,
        EntityKind::List,
        &Filter::All,
        &Mutation::Delete,
        10,
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn upsert_many_writes_the_whole_batch() {
    let store = MemoryStore::new();
    let docs: Vec<Document> = (0..5).map(|i| list_doc(&format!("b-{i}"), "batch")).collect();

    let written = bulk::upsert_many(&store, &docs).await.unwrap();
    assert_eq!(written, 5);

    let page = store
        .query(
            EntityKind::List,
            &Filter::KeyEquals {
                key: "batch".into(),
            },
            None,
            100,
        )
        .await
        .unwrap();
    assert_eq!(page.documents.len(), 5);
}
