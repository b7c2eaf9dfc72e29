//! Worker-process registry.
//!
//! Each fleet member announces itself and heartbeats while alive; stale
//! registrations are bulk-removed by whoever runs maintenance. A
//! heartbeat racing a removal is expected and benign, so that missing
//! document is swallowed with a debug log rather than raised.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bulk::{self, Mutation};
use crate::document::{Body, Document, EntityKind, ServerBody};
use crate::error::{Error, Result};
use crate::store::{DocumentStore, Filter};

const SWEEP_PAGE: usize = 100;

fn server_doc_id(server_id: &str) -> String {
    format!("server:{server_id}")
}

pub struct Servers {
    store: Arc<dyn DocumentStore>,
}

impl Servers {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Register (or re-register) this member. Unconditional: a member
    /// exclusively owns its own registration.
    pub async fn announce(&self, server_id: &str, workers: u32) -> Result<()> {
        if server_id.is_empty() {
            return Err(Error::InvalidArgument("server id is empty".into()));
        }
        let doc = Document::with_id(
            server_doc_id(server_id),
            Body::Server(ServerBody {
                server_id: server_id.to_string(),
                workers,
                last_heartbeat: Utc::now(),
            }),
        );
        self.store.upsert(&doc).await?;
        Ok(())
    }

    /// Refresh this member's heartbeat. An already-removed registration
    /// is benign here — never an error.
    pub async fn heartbeat(&self, server_id: &str) -> Result<()> {
        let id = server_doc_id(server_id);
        let Some(mut doc) = self.store.read(EntityKind::Server, &id).await? else {
            debug!(server_id, "heartbeat on removed server; ignoring");
            return Ok(());
        };
        if let Body::Server(server) = &mut doc.body {
            server.last_heartbeat = Utc::now();
        }
        self.store.upsert(&doc).await?;
        Ok(())
    }

    pub async fn remove(&self, server_id: &str) -> Result<()> {
        self.store
            .delete(EntityKind::Server, &server_doc_id(server_id))
            .await?;
        Ok(())
    }

    /// Bulk-remove members whose last heartbeat is older than
    /// `older_than`. Returns the removed count.
    pub async fn remove_timed_out(&self, older_than: Duration) -> Result<u64> {
        let filter = Filter::ServerHeartbeatBefore {
            cutoff: Utc::now() - older_than,
        };
        bulk::run(
            self.store.as_ref(),
            EntityKind::Server,
            &filter,
            &Mutation::Delete,
            SWEEP_PAGE,
            &CancellationToken::new(),
        )
        .await
    }
}
