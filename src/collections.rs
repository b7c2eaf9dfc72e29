//! Key-scoped set, hash, and list merges.
//!
//! Each merge must leave at most one document per (key, value) for sets
//! and (key, field) for hashes — including collapsing duplicates left by
//! earlier crashes, which is why every merge starts by collecting the
//! full match set and keeping only the oldest row. Hash merges run under
//! a named lock since the engine batch-writes whole hashes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bulk::{self, Mutation};
use crate::document::{Body, Document, EntityKind, HashBody, ListBody, SetBody};
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::store::{ContinuationToken, DocumentStore, Filter};

const MERGE_PAGE: usize = 100;

#[derive(Debug, Clone)]
pub struct CollectionOptions {
    /// Wait for the hash-merge lock.
    pub merge_lock_timeout: Duration,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            merge_lock_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Collections {
    store: Arc<dyn DocumentStore>,
    locks: LockManager,
    options: CollectionOptions,
}

impl Collections {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: LockManager,
        options: CollectionOptions,
    ) -> Self {
        Self {
            store,
            locks,
            options,
        }
    }

    /// Add `value` to the set at `key`, or update its score if already
    /// present. Collapses any pre-existing duplicate rows.
    pub async fn add_to_set(&self, key: &str, value: &str, score: f64) -> Result<()> {
        require_key(key)?;
        let filter = Filter::SetMember {
            key: key.to_string(),
            value: value.to_string(),
        };

        match self.collapse_to_oldest(EntityKind::Set, &filter).await? {
            Some(mut survivor) => {
                if let Body::Set(set) = &mut survivor.body {
                    set.score = score;
                }
                self.store.upsert(&survivor).await?;
            }
            None => {
                let doc = Document::new(Body::Set(SetBody {
                    key: key.to_string(),
                    value: value.to_string(),
                    score,
                    created_on: Utc::now(),
                }));
                self.store.upsert(&doc).await?;
            }
        }
        Ok(())
    }

    pub async fn remove_from_set(&self, key: &str, value: &str) -> Result<u64> {
        require_key(key)?;
        let filter = Filter::SetMember {
            key: key.to_string(),
            value: value.to_string(),
        };
        bulk::run(
            self.store.as_ref(),
            EntityKind::Set,
            &filter,
            &Mutation::Delete,
            MERGE_PAGE,
            &CancellationToken::new(),
        )
        .await
    }

    /// Merge `pairs` into the hash at `key`, one surviving row per
    /// field. Runs under the hash-merge lock because the engine writes
    /// whole hashes at once from several members.
    pub async fn set_range_in_hash(&self, key: &str, pairs: &[(String, String)]) -> Result<()> {
        require_key(key)?;
        let resource = format!("hash:{key}");

        self.locks
            .with_lock(&resource, self.options.merge_lock_timeout, || async {
                let mut writes = Vec::with_capacity(pairs.len());
                for (field, value) in pairs {
                    let filter = Filter::HashField {
                        key: key.to_string(),
                        field: field.clone(),
                    };
                    match self.collapse_to_oldest(EntityKind::Hash, &filter).await? {
                        Some(mut survivor) => {
                            if let Body::Hash(hash) = &mut survivor.body {
                                hash.value = value.clone();
                            }
                            writes.push(survivor);
                        }
                        None => {
                            writes.push(Document::new(Body::Hash(HashBody {
                                key: key.to_string(),
                                field: field.clone(),
                                value: value.clone(),
                                created_on: Utc::now(),
                            })));
                        }
                    }
                }
                bulk::upsert_many(self.store.as_ref(), &writes).await?;
                Ok(())
            })
            .await
    }

    /// Prepend-equivalent insert: lists allow duplicates, ordering is by
    /// `created_on`.
    pub async fn insert_to_list(&self, key: &str, value: &str) -> Result<()> {
        require_key(key)?;
        let doc = Document::new(Body::List(ListBody {
            key: key.to_string(),
            value: value.to_string(),
            created_on: Utc::now(),
        }));
        self.store.upsert(&doc).await?;
        Ok(())
    }

    pub async fn remove_from_list(&self, key: &str, value: &str) -> Result<u64> {
        require_key(key)?;
        let filter = Filter::ListValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        bulk::run(
            self.store.as_ref(),
            EntityKind::List,
            &filter,
            &Mutation::Delete,
            MERGE_PAGE,
            &CancellationToken::new(),
        )
        .await
    }

    /// Mark every row of the collection at `key` for expiry.
    pub async fn expire(&self, kind: EntityKind, key: &str, ttl: Duration) -> Result<u64> {
        require_key(key)?;
        self.mutate_key(kind, key, &Mutation::SetExpiry(Utc::now() + ttl))
            .await
    }

    /// Clear expiry on every row of the collection at `key`.
    pub async fn persist(&self, kind: EntityKind, key: &str) -> Result<u64> {
        require_key(key)?;
        self.mutate_key(kind, key, &Mutation::ClearExpiry).await
    }

    async fn mutate_key(&self, kind: EntityKind, key: &str, mutation: &Mutation) -> Result<u64> {
        let filter = Filter::KeyEquals {
            key: key.to_string(),
        };
        bulk::run(
            self.store.as_ref(),
            kind,
            &filter,
            mutation,
            MERGE_PAGE,
            &CancellationToken::new(),
        )
        .await
    }

    /// Collect every row matching `filter`, keep the oldest, delete the
    /// rest. Returns the survivor, if any.
    async fn collapse_to_oldest(
        &self,
        kind: EntityKind,
        filter: &Filter,
    ) -> Result<Option<Document>> {
        let mut matched: Vec<Document> = Vec::new();
        let mut continuation: Option<ContinuationToken> = None;
        loop {
            let page = self
                .store
                .query(kind, filter, continuation.as_ref(), MERGE_PAGE)
                .await?;
            matched.extend(page.documents);
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        if matched.is_empty() {
            return Ok(None);
        }

        matched.sort_by_key(|d| created_on(d));
        let mut iter = matched.into_iter();
        let survivor = iter.next();
        for duplicate in iter {
            debug!(kind = %kind, id = duplicate.id, "collapsing duplicate row");
            self.store.delete(kind, &duplicate.id).await?;
        }
        Ok(survivor)
    }
}

fn created_on(doc: &Document) -> chrono::DateTime<Utc> {
    match &doc.body {
        Body::Set(b) => b.created_on,
        Body::Hash(b) => b.created_on,
        Body::List(b) => b.created_on,
        Body::State(b) => b.created_on,
        Body::Queue(b) => b.created_on,
        Body::Job(b) => b.created_on,
        _ => Utc::now(),
    }
}

fn require_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("collection key is empty".into()));
    }
    Ok(())
}
