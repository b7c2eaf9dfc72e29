//! Document store abstraction.
//!
//! The coordination layer never talks to a database directly; it consumes
//! this trait. The contract is deliberately small — single-document
//! conditional writes plus bounded, continuation-token-driven queries —
//! because that is all a generic partitioned document store can promise.
//! There are no multi-document transactions; callers compose conditional
//! single-document writes and tolerate partial-progress retries.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::document::{Document, EntityKind, VersionToken};
use crate::error::{Error, Result};

/// Outcome of a conditional create.
#[derive(Debug)]
pub enum CreateOutcome {
    /// The document was created; carries the persisted copy with its
    /// assigned version token.
    Created(Document),
    /// A live document with that id already exists in the partition.
    AlreadyExists,
}

impl CreateOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Opaque cursor issued by a store when a query could not finish in one
/// bounded call. Resuming with it is safe under concurrent mutation of
/// the matched set; client-side offsets are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken(pub String);

/// One bounded page of query results.
#[derive(Debug)]
pub struct Page {
    pub documents: Vec<Document>,
    /// `None` means the store reports completion.
    pub continuation: Option<ContinuationToken>,
}

/// Closed set of predicates the coordination layer needs. Each store maps
/// a (kind, filter) pair to its native query form in exactly one place.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Everything in the partition.
    All,
    /// `expire_on` set and at or before the cutoff.
    Expired { cutoff: DateTime<Utc> },
    /// Expired counters of aggregate kind only. Raw rows are never
    /// eligible here; they are retired exclusively by the aggregator.
    ExpiredAggregateCounters { cutoff: DateTime<Utc> },
    /// All raw counter rows, any key.
    RawCounters,
    /// Counter rows (raw and aggregate) for one key.
    CounterKey { key: String },
    /// Set/Hash/List/State rows scoped to one key.
    KeyEquals { key: String },
    /// Queue entries in any of the named queues that are available or
    /// whose lease is stale: `fetched_at` is null or before
    /// `reclaim_before`. Pages come oldest-`created_on`-first and do not
    /// support continuation; callers rescan instead.
    QueueCandidates {
        queues: Vec<String>,
        reclaim_before: DateTime<Utc>,
    },
    /// Set members with an exact (key, value).
    SetMember { key: String, value: String },
    /// Hash rows with an exact (key, field).
    HashField { key: String, field: String },
    /// List elements with an exact (key, value).
    ListValue { key: String, value: String },
    /// Servers whose last heartbeat is before the cutoff.
    ServerHeartbeatBefore { cutoff: DateTime<Utc> },
}

/// The partitioned document store consumed by every coordination
/// component. Implementations must assign a fresh version token on every
/// write and honor `time_to_live` lazily: a document past its TTL is
/// reported absent even if physically present.
///
/// Ordering contract for [`query`](DocumentStore::query): the
/// `QueueCandidates` filter orders oldest-first by `created_on` and
/// ignores continuation; every other filter orders by id and issues
/// keyset continuation tokens.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create `doc` only if no live document with its id exists in the
    /// partition.
    async fn create_if_absent(&self, doc: &Document) -> Result<CreateOutcome>;

    /// Read one document by id within the kind's partition.
    async fn read(&self, kind: EntityKind, id: &str) -> Result<Option<Document>>;

    /// Replace `doc` only if the stored version still equals `expected`.
    /// Fails with [`Error::VersionConflict`] on a lost race and
    /// [`Error::NotFound`] if the document is gone.
    async fn conditional_replace(
        &self,
        doc: &Document,
        expected: &VersionToken,
    ) -> Result<Document>;

    /// Unconditional write. Only valid for documents the caller
    /// exclusively owns at this protocol step.
    async fn upsert(&self, doc: &Document) -> Result<Document>;

    /// Delete by id. Returns whether a live document was removed.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool>;

    /// Fetch one bounded page of documents matching `filter` within the
    /// kind's partition.
    async fn query(
        &self,
        kind: EntityKind,
        filter: &Filter,
        continuation: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page>;
}

/// Run an optimistic write up to `attempts` times, retrying only on
/// [`Error::VersionConflict`]. The last conflict surfaces unchanged.
pub async fn with_version_retry<T, F, Fut>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tried = 0;
    loop {
        match op().await {
            Err(Error::VersionConflict { id }) => {
                tried += 1;
                if tried >= attempts {
                    return Err(Error::VersionConflict { id });
                }
                tracing::debug!(document = %id, attempt = tried, "retrying after version conflict");
            }
            other => return other,
        }
    }
}
