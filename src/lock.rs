//! Distributed locks over single lock documents.
//!
//! A lock is the existence of one document at a stable id derived from
//! the resource name. Acquisition is a conditional create; contention is
//! a fixed-backoff retry loop bounded by the caller's timeout. The
//! document's TTL always exceeds the requested hold, so a crashed holder
//! is reclaimed by the store itself — which also means holders must stay
//! correct if the lock silently expires mid-operation. Version-guarded
//! writes underneath, not the lock, carry correctness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::document::{Body, Document, EntityKind, LockBody, lock_id};
use crate::error::{Error, Result};
use crate::store::{CreateOutcome, DocumentStore};
use crate::telemetry::metrics;

/// Tuning knobs for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Sleep between contended acquisition attempts.
    pub backoff: Duration,
    /// Safety margin added to the hold timeout when setting the lock
    /// document's TTL. Must keep the TTL strictly above the hold.
    pub ttl_grace: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(2),
            ttl_grace: Duration::from_secs(15),
        }
    }
}

/// Acquires and releases named distributed locks.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn DocumentStore>,
    options: LockOptions,
}

impl LockManager {
    pub fn new(store: Arc<dyn DocumentStore>, options: LockOptions) -> Self {
        Self { store, options }
    }

    /// Block up to `timeout` for exclusive ownership of `resource`.
    ///
    /// Fails with [`Error::LockTimeout`] carrying the resource name once
    /// the wait is exhausted.
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockGuard> {
        if resource.is_empty() {
            return Err(Error::InvalidArgument("lock resource is empty".into()));
        }

        let id = lock_id(resource);
        let started = tokio::time::Instant::now();

        loop {
            let doc = Document::with_id(
                &id,
                Body::Lock(LockBody {
                    resource: resource.to_string(),
                }),
            )
            .expire_on(Utc::now() + timeout)
            .time_to_live((timeout + self.options.ttl_grace).as_secs().max(1) as i64);

            match self.store.create_if_absent(&doc).await? {
                CreateOutcome::Created(_) => {
                    debug!(resource, "lock acquired");
                    metrics::lock_acquisitions().add(
                        1,
                        &[
                            KeyValue::new("resource", resource.to_string()),
                            KeyValue::new("result", "acquired"),
                        ],
                    );
                    return Ok(LockGuard {
                        store: Arc::clone(&self.store),
                        resource: resource.to_string(),
                        id,
                        released: false,
                    });
                }
                CreateOutcome::AlreadyExists => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        metrics::lock_acquisitions().add(
                            1,
                            &[
                                KeyValue::new("resource", resource.to_string()),
                                KeyValue::new("result", "timeout"),
                            ],
                        );
                        return Err(Error::LockTimeout {
                            resource: resource.to_string(),
                            waited,
                        });
                    }
                    let remaining = timeout - waited;
                    tokio::time::sleep(self.options.backoff.min(remaining)).await;
                }
            }
        }
    }

    /// Run `op` while holding the named lock, releasing afterwards.
    ///
    /// The single helper behind every exclusively-run maintenance path
    /// (sweeper, aggregator, hash merges, parameter updates).
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        timeout: Duration,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(resource, timeout).await?;
        let result = op().await;
        guard.release().await;
        result
    }
}

/// A held lock. Explicit [`release`](LockGuard::release) is preferred;
/// dropping an unreleased guard spawns a best-effort release so the TTL
/// safety net is the worst case, not the common one.
pub struct LockGuard {
    store: Arc<dyn DocumentStore>,
    resource: String,
    id: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Delete the lock document. Failures are logged, never raised —
    /// the TTL reclaims the document eventually.
    pub async fn release(mut self) {
        self.released = true;
        delete_lock(&self.store, &self.resource, &self.id).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let resource = std::mem::take(&mut self.resource);
        let id = std::mem::take(&mut self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                delete_lock(&store, &resource, &id).await;
            });
        }
    }
}

async fn delete_lock(store: &Arc<dyn DocumentStore>, resource: &str, id: &str) {
    match store.delete(EntityKind::Lock, id).await {
        Ok(_) => debug!(resource, "lock released"),
        Err(e) => warn!(resource, error = %e, "failed to release lock; TTL will reclaim it"),
    }
}
