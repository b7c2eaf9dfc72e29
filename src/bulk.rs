//! Continuation-driven bulk mutation.
//!
//! Document stores bound how much work one call may perform, so every
//! bulk operation here is an explicit loop: fetch one page of matches,
//! mutate each document, resume from the store-issued continuation
//! token. Tokens, not client offsets, keep the scan correct while the
//! matched set is being mutated underneath it. The loop runs
//! client-side; the store abstraction assumes no server-side scripting.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::document::{Document, EntityKind};
use crate::error::{Error, Result};
use crate::store::{ContinuationToken, DocumentStore, Filter};

/// Per-document mutation applied by [`run`].
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Remove the document.
    Delete,
    /// Drop both `expire_on` and the TTL safety net.
    ClearExpiry,
    /// Set `expire_on` to an absolute time.
    SetExpiry(DateTime<Utc>),
}

/// Apply `mutation` to every document matching `filter` in the kind's
/// partition, page by page, until the store reports completion. Returns
/// the affected count. Cancellation is checked between pages and
/// surfaces as [`Error::Cancelled`].
pub async fn run(
    store: &dyn DocumentStore,
    kind: EntityKind,
    filter: &Filter,
    mutation: &Mutation,
    page_size: usize,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut affected: u64 = 0;
    let mut continuation: Option<ContinuationToken> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let page = store
            .query(kind, filter, continuation.as_ref(), page_size)
            .await?;
        if page.documents.is_empty() {
            return Ok(affected);
        }

        for doc in &page.documents {
            match mutation {
                Mutation::Delete => {
                    if store.delete(kind, &doc.id).await? {
                        affected += 1;
                    }
                }
                Mutation::ClearExpiry => {
                    let mut copy = doc.clone();
                    copy.expire_on = None;
                    copy.time_to_live = None;
                    store.upsert(&copy).await?;
                    affected += 1;
                }
                Mutation::SetExpiry(when) => {
                    let mut copy = doc.clone();
                    copy.expire_on = Some(*when);
                    store.upsert(&copy).await?;
                    affected += 1;
                }
            }
        }

        debug!(kind = %kind, affected, "bulk page applied");
        match page.continuation {
            Some(token) => continuation = Some(token),
            None => return Ok(affected),
        }
    }
}

/// The upsert-many mutation used by collection merges: write a batch of
/// documents the caller exclusively owns.
pub async fn upsert_many(store: &dyn DocumentStore, docs: &[Document]) -> Result<u64> {
    for doc in docs {
        store.upsert(doc).await?;
    }
    Ok(docs.len() as u64)
}
