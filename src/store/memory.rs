//! In-memory document store.
//!
//! Single source of truth for tests and embedded single-process use.
//! Honors the full store contract: fresh version tokens on every write,
//! lazy TTL expiry, and keyset continuation over id order.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::document::{Body, CounterKind, Document, EntityKind, VersionToken};
use crate::error::{Error, Result};
use crate::store::{ContinuationToken, CreateOutcome, DocumentStore, Filter, Page};

#[derive(Clone)]
struct Stored {
    doc: Document,
    written_at: DateTime<Utc>,
}

impl Stored {
    /// TTL is a lazy safety net: a document past it is reported absent
    /// even though it is physically still in the map.
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.doc.time_to_live {
            Some(secs) => self.written_at + chrono::Duration::seconds(secs) > now,
            None => true,
        }
    }
}

/// In-memory [`DocumentStore`]. One `BTreeMap` per partition so keyset
/// continuation can walk ids in order.
pub struct MemoryStore {
    partitions: Mutex<HashMap<EntityKind, BTreeMap<String, Stored>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn persisted(doc: &Document) -> Document {
    let mut copy = doc.clone();
    copy.version = Some(VersionToken::fresh());
    copy
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_if_absent(&self, doc: &Document) -> Result<CreateOutcome> {
        let now = Utc::now();
        let mut partitions = self.partitions.lock().await;
        let partition = partitions.entry(doc.kind()).or_default();

        if let Some(existing) = partition.get(&doc.id)
            && existing.is_live(now)
        {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let copy = persisted(doc);
        partition.insert(
            doc.id.clone(),
            Stored {
                doc: copy.clone(),
                written_at: now,
            },
        );
        Ok(CreateOutcome::Created(copy))
    }

    async fn read(&self, kind: EntityKind, id: &str) -> Result<Option<Document>> {
        let now = Utc::now();
        let partitions = self.partitions.lock().await;
        Ok(partitions
            .get(&kind)
            .and_then(|p| p.get(id))
            .filter(|s| s.is_live(now))
            .map(|s| s.doc.clone()))
    }

    async fn conditional_replace(
        &self,
        doc: &Document,
        expected: &VersionToken,
    ) -> Result<Document> {
        let now = Utc::now();
        let mut partitions = self.partitions.lock().await;
        let partition = partitions.entry(doc.kind()).or_default();

        let Some(existing) = partition.get(&doc.id).filter(|s| s.is_live(now)) else {
            return Err(Error::NotFound(format!("{}/{}", doc.kind(), doc.id)));
        };
        if existing.doc.version.as_ref() != Some(expected) {
            return Err(Error::VersionConflict {
                id: doc.id.clone(),
            });
        }

        let copy = persisted(doc);
        partition.insert(
            doc.id.clone(),
            Stored {
                doc: copy.clone(),
                written_at: now,
            },
        );
        Ok(copy)
    }

    async fn upsert(&self, doc: &Document) -> Result<Document> {
        let now = Utc::now();
        let mut partitions = self.partitions.lock().await;
        let partition = partitions.entry(doc.kind()).or_default();

        let copy = persisted(doc);
        partition.insert(
            doc.id.clone(),
            Stored {
                doc: copy.clone(),
                written_at: now,
            },
        );
        Ok(copy)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut partitions = self.partitions.lock().await;
        let Some(partition) = partitions.get_mut(&kind) else {
            return Ok(false);
        };
        Ok(partition
            .remove(id)
            .is_some_and(|s| s.is_live(now)))
    }

    async fn query(
        &self,
        kind: EntityKind,
        filter: &Filter,
        continuation: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page> {
        let now = Utc::now();
        let partitions = self.partitions.lock().await;
        let Some(partition) = partitions.get(&kind) else {
            return Ok(Page {
                documents: Vec::new(),
                continuation: None,
            });
        };

        if let Filter::QueueCandidates { .. } = filter {
            // Oldest-first scan, no continuation; dequeuers rescan.
            let mut matched: Vec<&Document> = partition
                .values()
                .filter(|s| s.is_live(now) && matches(filter, &s.doc))
                .map(|s| &s.doc)
                .collect();
            matched.sort_by_key(|d| match &d.body {
                Body::Queue(q) => q.created_on,
                _ => now,
            });
            return Ok(Page {
                documents: matched.into_iter().take(limit).cloned().collect(),
                continuation: None,
            });
        }

        // Keyset continuation: resume strictly after the last id seen.
        use std::ops::Bound;
        let lower = match continuation {
            Some(c) => Bound::Excluded(c.0.clone()),
            None => Bound::Unbounded,
        };
        let mut documents = Vec::new();
        for (_, stored) in partition.range((lower, Bound::Unbounded)) {
            if !stored.is_live(now) || !matches(filter, &stored.doc) {
                continue;
            }
            documents.push(stored.doc.clone());
            if documents.len() == limit {
                break;
            }
        }

        let continuation = if documents.len() == limit {
            documents.last().map(|d| ContinuationToken(d.id.clone()))
        } else {
            None
        };
        Ok(Page {
            documents,
            continuation,
        })
    }
}

/// The one place mapping (kind, filter) to this store's matching logic.
fn matches(filter: &Filter, doc: &Document) -> bool {
    match filter {
        Filter::All => true,
        Filter::Expired { cutoff } => doc.expire_on.is_some_and(|e| e <= *cutoff),
        Filter::ExpiredAggregateCounters { cutoff } => {
            doc.expire_on.is_some_and(|e| e <= *cutoff)
                && matches!(
                    &doc.body,
                    Body::Counter(c) if c.counter_kind == CounterKind::Aggregate
                )
        }
        Filter::RawCounters => {
            matches!(&doc.body, Body::Counter(c) if c.counter_kind == CounterKind::Raw)
        }
        Filter::CounterKey { key } => {
            matches!(&doc.body, Body::Counter(c) if c.key == *key)
        }
        Filter::KeyEquals { key } => match &doc.body {
            Body::Set(b) => b.key == *key,
            Body::Hash(b) => b.key == *key,
            Body::List(b) => b.key == *key,
            _ => false,
        },
        Filter::QueueCandidates {
            queues,
            reclaim_before,
        } => match &doc.body {
            Body::Queue(q) => {
                queues.contains(&q.queue)
                    && q.fetched_at.is_none_or(|f| f < *reclaim_before)
            }
            _ => false,
        },
        Filter::SetMember { key, value } => {
            matches!(&doc.body, Body::Set(b) if b.key == *key && b.value == *value)
        }
        Filter::HashField { key, field } => {
            matches!(&doc.body, Body::Hash(b) if b.key == *key && b.field == *field)
        }
        Filter::ListValue { key, value } => {
            matches!(&doc.body, Body::List(b) if b.key == *key && b.value == *value)
        }
        Filter::ServerHeartbeatBefore { cutoff } => {
            matches!(&doc.body, Body::Server(s) if s.last_heartbeat < *cutoff)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::LockBody;

    fn lock_doc(id: &str) -> Document {
        Document::with_id(
            id,
            Body::Lock(LockBody {
                resource: id.to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn create_if_absent_detects_existing() {
        let store = MemoryStore::new();
        let doc = lock_doc("lock:a");

        assert!(store.create_if_absent(&doc).await.unwrap().is_created());
        assert!(matches!(
            store.create_if_absent(&doc).await.unwrap(),
            CreateOutcome::AlreadyExists
        ));
    }

    #[tokio::test]
    async fn ttl_expired_document_reads_as_absent() {
        let store = MemoryStore::new();
        let doc = lock_doc("lock:ttl").time_to_live(0);

        store.create_if_absent(&doc).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(store.read(EntityKind::Lock, "lock:ttl").await.unwrap().is_none());
        // And a second create succeeds over the corpse.
        assert!(store.create_if_absent(&doc).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn conditional_replace_requires_matching_version() {
        let store = MemoryStore::new();
        let created = match store.create_if_absent(&lock_doc("lock:v")).await.unwrap() {
            CreateOutcome::Created(d) => d,
            CreateOutcome::AlreadyExists => unreachable!(),
        };
        let current = created.version.clone().unwrap();

        let replaced = store.conditional_replace(&created, &current).await.unwrap();
        assert_ne!(replaced.version, Some(current.clone()));

        // Stale token now loses.
        let err = store.conditional_replace(&created, &current).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }
}
