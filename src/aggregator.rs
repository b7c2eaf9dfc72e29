//! Convergent counter aggregation.
//!
//! Counter writes land as cheap per-event Raw delta rows; this component
//! periodically folds them into one Aggregate row per key so reads stay
//! bounded. The fold order is the whole safety story: the aggregate
//! increment must be durable before any Raw row that fed it is deleted,
//! and the increment itself is version-guarded so two aggregator runs
//! can never both apply the same delta — the loser skips the key and
//! picks it up next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::document::{
    aggregate_counter_id, Body, CounterBody, CounterKind, Document, EntityKind,
};
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::store::{CreateOutcome, DocumentStore, Filter};
use crate::telemetry::metrics;

/// Lock key shared by every aggregator instance in the fleet.
const AGGREGATOR_LOCK: &str = "counter-aggregator";

#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub lock_timeout: Duration,
    /// Bounded page of Raw rows per fold pass.
    pub page_size: usize,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5 * 60),
            page_size: 100,
        }
    }
}

/// Per-key accumulation over one page of Raw rows.
struct PendingFold {
    delta: i64,
    max_expire: Option<DateTime<Utc>>,
    raw_ids: Vec<String>,
}

pub struct CounterAggregator {
    store: Arc<dyn DocumentStore>,
    locks: LockManager,
    options: AggregatorOptions,
}

impl CounterAggregator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: LockManager,
        options: AggregatorOptions,
    ) -> Self {
        Self {
            store,
            locks,
            options,
        }
    }

    /// Run one aggregation cycle: drain Raw rows until none remain or
    /// the token fires. Returns the number of Raw rows retired. A held
    /// lock elsewhere in the fleet skips the tick.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<u64> {
        let started = std::time::Instant::now();
        let drained = self
            .locks
            .with_lock(AGGREGATOR_LOCK, self.options.lock_timeout, || {
                self.drain(cancel)
            })
            .await;

        match drained {
            Ok(folded) => {
                info!(folded, "counter aggregation finished");
                metrics::operation_duration_ms().record(
                    started.elapsed().as_secs_f64() * 1000.0,
                    &[KeyValue::new("operation", "aggregator.execute")],
                );
                Ok(folded)
            }
            Err(Error::LockTimeout { resource, .. }) => {
                debug!(resource, "aggregator lock held elsewhere; skipping tick");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn drain(&self, cancel: &CancellationToken) -> Result<u64> {
        let mut folded: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let page = self
                .store
                .query(
                    EntityKind::Counter,
                    &Filter::RawCounters,
                    None,
                    self.options.page_size,
                )
                .await?;
            if page.documents.is_empty() {
                return Ok(folded);
            }

            let mut pending: HashMap<String, PendingFold> = HashMap::new();
            for doc in page.documents {
                let Body::Counter(counter) = &doc.body else {
                    continue;
                };
                let entry = pending.entry(counter.key.clone()).or_insert(PendingFold {
                    delta: 0,
                    max_expire: None,
                    raw_ids: Vec::new(),
                });
                entry.delta += counter.value;
                entry.max_expire = entry.max_expire.max(doc.expire_on);
                entry.raw_ids.push(doc.id);
            }

            let mut progressed = false;
            for (key, fold) in pending {
                if self.fold_key(&key, &fold).await? {
                    // Durable aggregate write done; only now retire
                    // exactly the rows that fed it.
                    for raw_id in &fold.raw_ids {
                        self.store.delete(EntityKind::Counter, raw_id).await?;
                    }
                    folded += fold.raw_ids.len() as u64;
                    metrics::counters_aggregated().add(fold.raw_ids.len() as u64, &[]);
                    progressed = true;
                    debug!(key, delta = fold.delta, rows = fold.raw_ids.len(), "folded counter");
                } else {
                    debug!(key, "aggregate write lost its race; deferring key to next tick");
                }
            }

            // Every key in this page lost its race; let the next tick
            // retry rather than spinning on the same page.
            if !progressed {
                return Ok(folded);
            }
        }
    }

    /// Apply one key's delta to its aggregate document. Returns whether
    /// the write was applied; a lost race (version conflict or create
    /// collision) is a deferral, never a partial application.
    async fn fold_key(&self, key: &str, fold: &PendingFold) -> Result<bool> {
        let id = aggregate_counter_id(key);

        match self.store.read(EntityKind::Counter, &id).await? {
            Some(mut doc) => {
                let Some(expected) = doc.version.clone() else {
                    return Ok(false);
                };
                if let Body::Counter(counter) = &mut doc.body {
                    counter.value += fold.delta;
                }
                doc.expire_on = doc.expire_on.max(fold.max_expire);

                match self.store.conditional_replace(&doc, &expected).await {
                    Ok(_) => Ok(true),
                    Err(Error::VersionConflict { .. }) | Err(Error::NotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            None => {
                let mut doc = Document::with_id(
                    id,
                    Body::Counter(CounterBody {
                        key: key.to_string(),
                        value: fold.delta,
                        counter_kind: CounterKind::Aggregate,
                    }),
                );
                doc.expire_on = fold.max_expire;

                match self.store.create_if_absent(&doc).await? {
                    CreateOutcome::Created(_) => Ok(true),
                    CreateOutcome::AlreadyExists => Ok(false),
                }
            }
        }
    }
}
