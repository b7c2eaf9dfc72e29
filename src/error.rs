//! Error types for corral.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing caller input. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Could not acquire a distributed lock within the allowed wait.
    /// Carries the resource name for fleet-wide contention diagnosis.
    #[error("could not acquire lock on {resource:?} within {waited:?}")]
    LockTimeout { resource: String, waited: Duration },

    /// An optimistic-concurrency write lost its race.
    #[error("version conflict on document {id}")]
    VersionConflict { id: String },

    /// A document the caller named does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's cancellation token fired during a blocking wait.
    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
