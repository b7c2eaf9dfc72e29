//! Competing-consumer work queue over queue-entry documents.
//!
//! An entry is available while `fetched_at` is unset, or once a lease
//! has gone unrenewed past the invisibility window (its holder is
//! presumed dead). Leasing is a version-guarded replace stamping
//! `fetched_at`; losing that race just means moving to the next
//! candidate. Together with auto-requeue on lease drop, this gives
//! at-least-once delivery across both clean shutdown and hard crash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::document::{Body, Document, EntityKind, QueueBody, VersionToken};
use crate::error::{Error, Result};
use crate::store::{DocumentStore, Filter};
use crate::telemetry::metrics;

/// How many candidates one visibility scan pulls before re-querying.
const CANDIDATE_PAGE: usize = 32;

/// Tuning knobs for dequeue polling and lease upkeep.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Sleep between visibility scans when nothing is available.
    pub poll_interval: Duration,
    /// Age after which an unrenewed lease is treated as abandoned and
    /// its entry becomes re-deliverable.
    pub invisibility_window: Duration,
    /// How often an open lease refreshes `fetched_at`.
    pub heartbeat_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            invisibility_window: Duration::from_secs(15 * 60),
            heartbeat_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// The queue provider: enqueue, lease, renew, complete, requeue.
pub struct JobQueue {
    store: Arc<dyn DocumentStore>,
    options: QueueOptions,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn DocumentStore>, options: QueueOptions) -> Self {
        Self { store, options }
    }

    /// Create an immediately visible entry for `job_id` in `queue`.
    pub async fn enqueue(&self, queue: &str, job_id: &str) -> Result<()> {
        if queue.is_empty() || job_id.is_empty() {
            return Err(Error::InvalidArgument(
                "queue and job id must be non-empty".into(),
            ));
        }

        let doc = Document::new(Body::Queue(QueueBody {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
            created_on: Utc::now(),
            fetched_at: None,
        }));
        // Freshly created and exclusively ours at this step.
        self.store.upsert(&doc).await?;

        debug!(queue, job_id, "enqueued");
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", "enqueue"),
            ],
        );
        Ok(())
    }

    /// Block until an entry in any of `queues` can be leased, or the
    /// token fires ([`Error::Cancelled`], observed at least once per
    /// poll interval).
    pub async fn dequeue(
        &self,
        queues: &[&str],
        cancel: &CancellationToken,
    ) -> Result<QueueLease> {
        if queues.is_empty() {
            return Err(Error::InvalidArgument("no queues to dequeue from".into()));
        }
        let names: Vec<String> = queues.iter().map(|q| q.to_string()).collect();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let filter = Filter::QueueCandidates {
                queues: names.clone(),
                reclaim_before: Utc::now() - self.options.invisibility_window,
            };
            let page = self
                .store
                .query(EntityKind::Queue, &filter, None, CANDIDATE_PAGE)
                .await?;

            for doc in page.documents {
                // Oldest first, best effort: whoever wins the version
                // race owns the lease; everyone else moves on.
                let Some(expected) = doc.version.clone() else {
                    continue;
                };
                let mut leased = doc;
                let fetched_at = Utc::now();
                match &mut leased.body {
                    Body::Queue(q) => q.fetched_at = Some(fetched_at),
                    _ => continue,
                }

                match self.store.conditional_replace(&leased, &expected).await {
                    Ok(persisted) => {
                        let lease = QueueLease::start(
                            Arc::clone(&self.store),
                            persisted,
                            fetched_at,
                            self.options.heartbeat_interval,
                        )?;
                        metrics::queue_operations().add(
                            1,
                            &[
                                KeyValue::new("queue", lease.queue().to_string()),
                                KeyValue::new("operation", "lease"),
                            ],
                        );
                        return Ok(lease);
                    }
                    Err(Error::VersionConflict { .. }) | Err(Error::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }
}

/// A leased queue entry. Call [`remove`](QueueLease::remove) on success
/// or [`requeue`](QueueLease::requeue) to hand it back; a lease dropped
/// without either auto-requeues so the job is never lost.
///
/// The lease carries its last persisted version token (refreshed on every
/// heartbeat). Once the invisibility window has passed, another dequeuer
/// may legitimately reclaim the entry, so the hand-back and heartbeat
/// writes are version-guarded: a conflict means the entry moved on
/// without us and must be left untouched.
pub struct QueueLease {
    store: Arc<dyn DocumentStore>,
    entry_id: String,
    queue: String,
    job_id: String,
    fetched_at: DateTime<Utc>,
    version: Arc<Mutex<VersionToken>>,
    heartbeat: tokio::task::JoinHandle<()>,
    settled: bool,
}

impl std::fmt::Debug for QueueLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueLease")
            .field("entry_id", &self.entry_id)
            .field("queue", &self.queue)
            .field("job_id", &self.job_id)
            .field("fetched_at", &self.fetched_at)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl QueueLease {
    fn start(
        store: Arc<dyn DocumentStore>,
        doc: Document,
        fetched_at: DateTime<Utc>,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let Body::Queue(body) = &doc.body else {
            return Err(Error::Other(format!(
                "leased document {} is not a queue entry",
                doc.id
            )));
        };
        let Some(version) = doc.version.clone() else {
            return Err(Error::Other(format!(
                "leased document {} has no version token",
                doc.id
            )));
        };
        let version = Arc::new(Mutex::new(version));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&store),
            doc.id.clone(),
            heartbeat_interval,
            Arc::clone(&version),
        ));
        Ok(Self {
            store,
            entry_id: doc.id.clone(),
            queue: body.queue.clone(),
            job_id: body.job_id.clone(),
            fetched_at,
            version,
            heartbeat,
            settled: false,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    /// When this lease was taken.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Complete the job: delete the entry so it is never redelivered.
    pub async fn remove(mut self) -> Result<()> {
        self.settled = true;
        self.heartbeat.abort();
        self.store.delete(EntityKind::Queue, &self.entry_id).await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("operation", "remove"),
            ],
        );
        Ok(())
    }

    /// Hand the entry back: clear the lease and bump `created_on` so it
    /// re-enters ordering as a fresh arrival.
    pub async fn requeue(mut self) -> Result<()> {
        self.settled = true;
        self.heartbeat.abort();
        release_entry(&self.store, &self.entry_id, &self.version).await;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("operation", "requeue"),
            ],
        );
        Ok(())
    }
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.heartbeat.abort();
        let store = Arc::clone(&self.store);
        let entry_id = std::mem::take(&mut self.entry_id);
        let version = Arc::clone(&self.version);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                release_entry(&store, &entry_id, &version).await;
            });
        }
    }
}

/// Clear `fetched_at` and bump `created_on`, guarded by the lease's own
/// version token. A conflict or a vanished entry means the entry was
/// reclaimed after the invisibility window; the rival's open lease must
/// stay untouched.
async fn release_entry(
    store: &Arc<dyn DocumentStore>,
    entry_id: &str,
    version: &Mutex<VersionToken>,
) {
    let expected = version.lock().await.clone();
    let result = async {
        let Some(mut doc) = store.read(EntityKind::Queue, entry_id).await? else {
            return Ok(()); // already removed elsewhere; nothing to hand back
        };
        if let Body::Queue(q) = &mut doc.body {
            q.fetched_at = None;
            q.created_on = Utc::now();
        }
        match store.conditional_replace(&doc, &expected).await {
            Ok(_) => Ok(()),
            Err(Error::VersionConflict { .. }) | Err(Error::NotFound(_)) => {
                debug!(entry_id, "entry reclaimed elsewhere; leaving it alone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
    .await;

    if let Err(e) = result {
        warn!(entry_id, error = %e, "failed to requeue entry; invisibility window will reclaim it");
    }
}

/// Refresh `fetched_at` periodically while the lease is open so
/// long-running work is not reclaimed mid-flight. Every renewal is
/// guarded by the token of the previous one; the loop stops the moment
/// that token no longer matches, because the lease belongs to someone
/// else now.
async fn heartbeat_loop(
    store: Arc<dyn DocumentStore>,
    entry_id: String,
    interval: Duration,
    version: Arc<Mutex<VersionToken>>,
) {
    loop {
        tokio::time::sleep(interval).await;

        let expected = version.lock().await.clone();
        let renewed = async {
            let Some(mut doc) = store.read(EntityKind::Queue, &entry_id).await? else {
                return Ok(None);
            };
            if let Body::Queue(q) = &mut doc.body {
                q.fetched_at = Some(Utc::now());
            }
            let persisted = store.conditional_replace(&doc, &expected).await?;
            Ok::<_, Error>(persisted.version)
        }
        .await;

        match renewed {
            Ok(Some(fresh)) => {
                *version.lock().await = fresh;
                debug!(entry_id, "lease renewed");
            }
            Ok(None) | Err(Error::NotFound(_)) | Err(Error::VersionConflict { .. }) => {
                debug!(entry_id, "lease lost; heartbeat stopping");
                return;
            }
            Err(e) => {
                warn!(entry_id, error = %e, "lease renewal failed; retrying next beat");
            }
        }
    }
}

/// Maps queues to their provider. All queue names in one dequeue must
/// resolve to the same provider; mixing providers is a configuration
/// error rejected eagerly.
pub struct QueueProviders {
    default: Arc<JobQueue>,
    by_queue: HashMap<String, Arc<JobQueue>>,
}

impl QueueProviders {
    pub fn new(default: Arc<JobQueue>) -> Self {
        Self {
            default,
            by_queue: HashMap::new(),
        }
    }

    /// Route `queue` to a dedicated provider instead of the default.
    pub fn register(&mut self, queue: impl Into<String>, provider: Arc<JobQueue>) {
        self.by_queue.insert(queue.into(), provider);
    }

    fn resolve(&self, queue: &str) -> &Arc<JobQueue> {
        self.by_queue.get(queue).unwrap_or(&self.default)
    }

    /// The single provider serving every name in `queues`.
    pub fn provider_for(&self, queues: &[&str]) -> Result<Arc<JobQueue>> {
        let mut iter = queues.iter();
        let first = iter
            .next()
            .ok_or_else(|| Error::InvalidArgument("no queues to dequeue from".into()))?;
        let provider = self.resolve(first);
        for queue in iter {
            if !Arc::ptr_eq(provider, self.resolve(queue)) {
                return Err(Error::InvalidArgument(format!(
                    "queues {queues:?} resolve to different providers"
                )));
            }
        }
        Ok(Arc::clone(provider))
    }
}
