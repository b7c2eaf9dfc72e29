//! Core data model.
//!
//! Every stored record shares one envelope: an id unique within its
//! partition, a closed tagged body that doubles as the partition
//! discriminator, a store-assigned version token for conditional writes,
//! and two expiry fields — `expire_on` (the sweeper's cue) and
//! `time_to_live` (the store's own safety net, honored independently).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Entity Kind
// ---------------------------------------------------------------------------

/// Discriminator for the entity categories sharing the store.
/// Doubles as the partition key: one partition per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Job,
    State,
    Set,
    Counter,
    Server,
    Hash,
    List,
    Queue,
    Lock,
}

impl EntityKind {
    /// Partition key derived from the kind.
    pub fn partition_key(self) -> &'static str {
        match self {
            EntityKind::Job => "job",
            EntityKind::State => "state",
            EntityKind::Set => "set",
            EntityKind::Counter => "counter",
            EntityKind::Server => "server",
            EntityKind::Hash => "hash",
            EntityKind::List => "list",
            EntityKind::Queue => "queue",
            EntityKind::Lock => "lock",
        }
    }

    /// Kinds the expiration sweeper visits, in sweep order.
    pub fn expirable() -> &'static [EntityKind] {
        &[
            EntityKind::Lock,
            EntityKind::Job,
            EntityKind::List,
            EntityKind::Set,
            EntityKind::Hash,
            EntityKind::Counter,
            EntityKind::State,
        ]
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.partition_key())
    }
}

// ---------------------------------------------------------------------------
// Version Token
// ---------------------------------------------------------------------------

/// Opaque store-assigned token, replaced on every write. Conditional
/// replaces must present the token they last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionToken(pub String);

impl VersionToken {
    pub(crate) fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The shared document envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique within the kind's partition.
    pub id: String,

    /// Entity payload. The serialized tag is the kind discriminator.
    pub body: Body,

    /// Store-assigned version. `None` until first persisted.
    pub version: Option<VersionToken>,

    /// Absolute expiry; past means a sweep candidate.
    pub expire_on: Option<DateTime<Utc>>,

    /// Store-level seconds-to-live safety net, independent of the sweeper.
    pub time_to_live: Option<i64>,
}

impl Document {
    /// New unpersisted document with a random id and no expiry.
    pub fn new(body: Body) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), body)
    }

    /// New unpersisted document with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, body: Body) -> Self {
        Self {
            id: id.into(),
            body,
            version: None,
            expire_on: None,
            time_to_live: None,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.body.kind()
    }

    pub fn partition_key(&self) -> &'static str {
        self.kind().partition_key()
    }

    pub fn expire_on(mut self, when: DateTime<Utc>) -> Self {
        self.expire_on = Some(when);
        self
    }

    pub fn time_to_live(mut self, seconds: i64) -> Self {
        self.time_to_live = Some(seconds);
        self
    }
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Closed set of entity payloads. The serde tag carries the kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Body {
    Job(JobBody),
    State(StateBody),
    Set(SetBody),
    Counter(CounterBody),
    Server(ServerBody),
    Hash(HashBody),
    List(ListBody),
    Queue(QueueBody),
    Lock(LockBody),
}

impl Body {
    pub fn kind(&self) -> EntityKind {
        match self {
            Body::Job(_) => EntityKind::Job,
            Body::State(_) => EntityKind::State,
            Body::Set(_) => EntityKind::Set,
            Body::Counter(_) => EntityKind::Counter,
            Body::Server(_) => EntityKind::Server,
            Body::Hash(_) => EntityKind::Hash,
            Body::List(_) => EntityKind::List,
            Body::Queue(_) => EntityKind::Queue,
            Body::Lock(_) => EntityKind::Lock,
        }
    }
}

/// A job record. The hosting engine owns the payload; this layer only
/// touches `parameters` (under version-guarded replace) and expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobBody {
    pub created_on: DateTime<Utc>,
    /// Small named values the engine reads and writes concurrently.
    pub parameters: std::collections::HashMap<String, String>,
    /// Opaque serialized job. Never interpreted here.
    pub payload: serde_json::Value,
}

/// A job state-history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateBody {
    pub job_id: String,
    pub name: String,
    pub data: serde_json::Value,
    pub created_on: DateTime<Utc>,
}

/// A scored set member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetBody {
    pub key: String,
    pub value: String,
    pub score: f64,
    pub created_on: DateTime<Utc>,
}

/// Raw counters are unconsolidated per-event deltas; the aggregate is
/// the one folded running total per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    Raw,
    Aggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterBody {
    pub key: String,
    pub value: i64,
    pub counter_kind: CounterKind,
}

/// A worker-process registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerBody {
    pub server_id: String,
    pub workers: u32,
    pub last_heartbeat: DateTime<Utc>,
}

/// One field of a key-scoped hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashBody {
    pub key: String,
    pub field: String,
    pub value: String,
    pub created_on: DateTime<Utc>,
}

/// One element of a key-scoped list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListBody {
    pub key: String,
    pub value: String,
    pub created_on: DateTime<Utc>,
}

/// A queue entry. `fetched_at = None` means available; a set value marks
/// an open lease, stale once it falls outside the invisibility window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueBody {
    pub queue: String,
    pub job_id: String,
    pub created_on: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// A held distributed lock. Existence is the claim; `expire_on` and the
/// envelope TTL bound how long a crashed holder can pin it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockBody {
    pub resource: String,
}

/// Stable document id for the lock guarding `resource`.
pub fn lock_id(resource: &str) -> String {
    format!("lock:{resource}")
}

/// Stable document id for the folded aggregate counter of `key`.
pub fn aggregate_counter_id(key: &str) -> String {
    format!("counter:{key}:aggregate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_tag_matches_partition_key() {
        let doc = Document::new(Body::Counter(CounterBody {
            key: "stats:succeeded".into(),
            value: 1,
            counter_kind: CounterKind::Raw,
        }));

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["body"]["kind"], "counter");
        assert_eq!(doc.partition_key(), "counter");
    }

    #[test]
    fn envelope_round_trips() {
        let doc = Document::with_id(
            lock_id("maintenance"),
            Body::Lock(LockBody {
                resource: "maintenance".into(),
            }),
        )
        .expire_on(Utc::now())
        .time_to_live(75);

        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "lock:maintenance");
        assert_eq!(back.kind(), EntityKind::Lock);
        assert_eq!(back.time_to_live, Some(75));
    }
}
