//! # corral
//!
//! Coordination layer for job fleets sharing one partitioned document
//! store: distributed locks, a competing-consumer work queue with crash
//! recovery, periodic expiration sweeping, and convergent counter
//! aggregation — all built from single-document conditional writes and
//! bounded continuation-token queries, because that is all a generic
//! document store guarantees.

pub mod aggregator;
pub mod bulk;
pub mod collections;
pub mod config;
pub mod counters;
pub mod document;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod provider;
pub mod queue;
pub mod servers;
pub mod store;
pub mod sweeper;
pub mod telemetry;

pub use error::{Error, Result};
