//! Periodic expiration sweeping.
//!
//! One fleet member at a time walks every expirable partition and bulk
//! deletes documents whose `expire_on` has passed. Exclusivity comes
//! from a dedicated named lock; losing that lock just skips the tick,
//! because another member is already sweeping. Raw counters are never
//! eligible — an unaggregated delta must not be lost to expiry, so only
//! the aggregator may retire them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bulk::{self, Mutation};
use crate::document::EntityKind;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::store::{DocumentStore, Filter};
use crate::telemetry::metrics;

/// Lock key shared by every sweeper instance in the fleet.
const SWEEPER_LOCK: &str = "expiration-sweeper";

#[derive(Debug, Clone)]
pub struct SweeperOptions {
    /// Generous wait for the sweeper lock; contention means another
    /// member is already on it.
    pub lock_timeout: Duration,
    /// Bounded page size per store call.
    pub page_size: usize,
}

impl Default for SweeperOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5 * 60),
            page_size: 100,
        }
    }
}

/// Affected-count per kind for one sweep cycle.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: Vec<(EntityKind, u64)>,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.removed.iter().map(|(_, n)| n).sum()
    }
}

pub struct ExpirationSweeper {
    store: Arc<dyn DocumentStore>,
    locks: LockManager,
    options: SweeperOptions,
}

impl ExpirationSweeper {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: LockManager,
        options: SweeperOptions,
    ) -> Self {
        Self {
            store,
            locks,
            options,
        }
    }

    /// Run one sweep cycle. Invoked by the host on its expiration-check
    /// interval; the host guarantees at most one concurrently executing
    /// tick per instance, while cross-fleet exclusivity comes from the
    /// lock.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let started = std::time::Instant::now();
        let swept = self
            .locks
            .with_lock(SWEEPER_LOCK, self.options.lock_timeout, || {
                self.sweep(cancel)
            })
            .await;

        match swept {
            Ok(report) => {
                info!(removed = report.total(), "expiration sweep finished");
                metrics::operation_duration_ms().record(
                    started.elapsed().as_secs_f64() * 1000.0,
                    &[KeyValue::new("operation", "sweeper.execute")],
                );
                Ok(report)
            }
            Err(Error::LockTimeout { resource, .. }) => {
                debug!(resource, "sweeper lock held elsewhere; skipping tick");
                Ok(SweepReport::default())
            }
            Err(e) => Err(e),
        }
    }

    async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for &kind in EntityKind::expirable() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let filter = match kind {
                // Raw rows are retired exclusively by the aggregator.
                EntityKind::Counter => Filter::ExpiredAggregateCounters { cutoff: now },
                _ => Filter::Expired { cutoff: now },
            };

            let removed = bulk::run(
                self.store.as_ref(),
                kind,
                &filter,
                &Mutation::Delete,
                self.options.page_size,
                cancel,
            )
            .await?;

            if removed > 0 {
                debug!(kind = %kind, removed, "swept expired documents");
            }
            metrics::documents_swept().add(removed, &[KeyValue::new("kind", kind.to_string())]);
            report.removed.push((kind, removed));
        }

        Ok(report)
    }
}
