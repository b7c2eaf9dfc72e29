//! The storage-provider facade handed to the hosting engine.
//!
//! Owns the store handle and configuration; everything else is built
//! from those two. The host calls locks and queues on its request path
//! and schedules `sweeper()`/`aggregator()` executions on the intervals
//! the config documents.

use std::sync::Arc;

use secrecy::ExposeSecret;

use crate::aggregator::CounterAggregator;
use crate::collections::Collections;
use crate::config::Config;
use crate::counters::Counters;
use crate::error::{Error, Result};
use crate::jobs::Jobs;
use crate::lock::LockManager;
use crate::queue::JobQueue;
use crate::servers::Servers;
use crate::store::memory::MemoryStore;
use crate::store::postgres::PostgresStore;
use crate::store::DocumentStore;
use crate::sweeper::ExpirationSweeper;

pub struct StorageProvider {
    store: Arc<dyn DocumentStore>,
    config: Config,
}

impl StorageProvider {
    pub fn new(store: Arc<dyn DocumentStore>, config: Config) -> Self {
        Self { store, config }
    }

    /// Provider over the in-memory store (tests, embedded use).
    pub fn in_memory(config: Config) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Provider over Postgres, using the configured connection string.
    pub async fn connect(config: Config) -> Result<Self> {
        let url = config
            .database_url
            .as_ref()
            .ok_or_else(|| Error::Config("DATABASE_URL is not set".into()))?;
        let store = PostgresStore::connect(url.expose_secret()).await?;
        store.migrate().await?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locks(&self) -> LockManager {
        LockManager::new(self.store(), self.config.lock_options())
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.store(), self.config.queue_options())
    }

    pub fn sweeper(&self) -> ExpirationSweeper {
        ExpirationSweeper::new(self.store(), self.locks(), self.config.sweeper_options())
    }

    pub fn aggregator(&self) -> CounterAggregator {
        CounterAggregator::new(self.store(), self.locks(), self.config.aggregator_options())
    }

    pub fn counters(&self) -> Counters {
        Counters::new(self.store())
    }

    pub fn collections(&self) -> Collections {
        Collections::new(self.store(), self.locks(), self.config.collection_options())
    }

    pub fn jobs(&self) -> Jobs {
        Jobs::new(self.store())
    }

    pub fn servers(&self) -> Servers {
        Servers::new(self.store())
    }
}
