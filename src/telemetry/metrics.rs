//! Metric instrument factories for corral.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"corral"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for corral instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("corral")
}

/// Counter: distributed lock acquisition attempts that resolved.
/// Labels: `resource`, `result` ("acquired" | "timeout").
pub fn lock_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("corral.lock.acquisitions")
        .with_description("Distributed lock acquisitions and timeouts")
        .build()
}

/// Counter: queue-level operations (enqueue, lease, remove, requeue).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("corral.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: expired documents removed by the sweeper.
/// Labels: `kind`.
pub fn documents_swept() -> Counter<u64> {
    meter()
        .u64_counter("corral.sweeper.documents_swept")
        .with_description("Expired documents removed per sweep cycle")
        .build()
}

/// Counter: raw counter rows folded into aggregates.
pub fn counters_aggregated() -> Counter<u64> {
    meter()
        .u64_counter("corral.aggregator.rows_folded")
        .with_description("Raw counter rows folded into aggregate totals")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("corral.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
