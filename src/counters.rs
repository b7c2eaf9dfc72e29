//! Counter write/read API used by the hosting engine.
//!
//! Writes are append-only Raw delta rows — freshly created, exclusively
//! owned, so no conditional machinery is needed on this path. The value
//! of a key is always `sum(Raw) + Aggregate`, which holds before,
//! during, and after any number of aggregator runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::document::{Body, CounterBody, CounterKind, Document, EntityKind};
use crate::error::{Error, Result};
use crate::store::{ContinuationToken, DocumentStore, Filter};

const VALUE_PAGE: usize = 100;

pub struct Counters {
    store: Arc<dyn DocumentStore>,
}

impl Counters {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn increment(&self, key: &str) -> Result<()> {
        self.increment_by(key, 1, None).await
    }

    pub async fn decrement(&self, key: &str) -> Result<()> {
        self.increment_by(key, -1, None).await
    }

    /// Record one delta for `key`, optionally expiring so stale
    /// statistics eventually sweep away.
    pub async fn increment_by(
        &self,
        key: &str,
        delta: i64,
        expire_in: Option<Duration>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("counter key is empty".into()));
        }

        let mut doc = Document::new(Body::Counter(CounterBody {
            key: key.to_string(),
            value: delta,
            counter_kind: CounterKind::Raw,
        }));
        if let Some(ttl) = expire_in {
            doc.expire_on = Some(Utc::now() + ttl);
        }
        self.store.upsert(&doc).await?;
        Ok(())
    }

    /// Current value of `key`: the folded aggregate plus every Raw row
    /// not yet retired by the aggregator.
    pub async fn get_value(&self, key: &str) -> Result<i64> {
        let filter = Filter::CounterKey {
            key: key.to_string(),
        };
        let mut total: i64 = 0;
        let mut continuation: Option<ContinuationToken> = None;

        loop {
            let page = self
                .store
                .query(EntityKind::Counter, &filter, continuation.as_ref(), VALUE_PAGE)
                .await?;
            if page.documents.is_empty() {
                return Ok(total);
            }
            for doc in &page.documents {
                if let Body::Counter(counter) = &doc.body {
                    total += counter.value;
                }
            }
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => return Ok(total),
            }
        }
    }
}
