//! Job-document operations owned by this layer.
//!
//! The hosting engine owns job scheduling and payload serialization;
//! what lives here is the racy part — several members updating one job
//! document's parameters or expiry concurrently. Those writes go through
//! version-guarded replace with bounded retries, per the shared-resource
//! rule for any document two components could race on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::document::{Body, Document, EntityKind, JobBody};
use crate::error::{Error, Result};
use crate::store::{with_version_retry, CreateOutcome, DocumentStore};

const UPDATE_ATTEMPTS: u32 = 4;

pub struct Jobs {
    store: Arc<dyn DocumentStore>,
}

impl Jobs {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Create the job document. The id is the engine's job id.
    pub async fn create(&self, job_id: &str, payload: serde_json::Value) -> Result<()> {
        if job_id.is_empty() {
            return Err(Error::InvalidArgument("job id is empty".into()));
        }
        let doc = Document::with_id(
            job_id,
            Body::Job(JobBody {
                created_on: Utc::now(),
                parameters: Default::default(),
                payload,
            }),
        );
        match self.store.create_if_absent(&doc).await? {
            CreateOutcome::Created(_) => Ok(()),
            CreateOutcome::AlreadyExists => Err(Error::InvalidArgument(format!(
                "job {job_id} already exists"
            ))),
        }
    }

    /// Set one named parameter, retrying bounded version-conflict
    /// losses against concurrent parameter/state updates.
    pub async fn set_parameter(&self, job_id: &str, name: &str, value: &str) -> Result<()> {
        with_version_retry(UPDATE_ATTEMPTS, || async {
            let mut doc = self.read_job(job_id).await?;
            let expected = expected_version(&doc)?;
            if let Body::Job(job) = &mut doc.body {
                job.parameters.insert(name.to_string(), value.to_string());
            }
            self.store.conditional_replace(&doc, &expected).await?;
            Ok(())
        })
        .await
    }

    pub async fn get_parameter(&self, job_id: &str, name: &str) -> Result<Option<String>> {
        let doc = self.read_job(job_id).await?;
        match &doc.body {
            Body::Job(job) => Ok(job.parameters.get(name).cloned()),
            _ => Ok(None),
        }
    }

    /// Schedule the job document (and nothing else) for the sweeper.
    pub async fn expire(&self, job_id: &str, ttl: Duration) -> Result<()> {
        with_version_retry(UPDATE_ATTEMPTS, || async {
            let mut doc = self.read_job(job_id).await?;
            let expected = expected_version(&doc)?;
            doc.expire_on = Some(Utc::now() + ttl);
            self.store.conditional_replace(&doc, &expected).await?;
            Ok(())
        })
        .await
    }

    pub async fn persist(&self, job_id: &str) -> Result<()> {
        with_version_retry(UPDATE_ATTEMPTS, || async {
            let mut doc = self.read_job(job_id).await?;
            let expected = expected_version(&doc)?;
            doc.expire_on = None;
            doc.time_to_live = None;
            self.store.conditional_replace(&doc, &expected).await?;
            Ok(())
        })
        .await
    }

    async fn read_job(&self, job_id: &str) -> Result<Document> {
        self.store
            .read(EntityKind::Job, job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }
}

fn expected_version(doc: &Document) -> Result<crate::document::VersionToken> {
    doc.version
        .clone()
        .ok_or_else(|| Error::Other(format!("document {} has no version token", doc.id)))
}
