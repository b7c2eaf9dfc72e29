//! Postgres-backed document store.
//!
//! One `documents` table, partitioned by the `kind` column, with the
//! entity body as JSONB. Conditional create uses `ON CONFLICT` the same
//! way the work-item dedup path does; conditional replace guards on the
//! stored version column. TTL is evaluated lazily in every predicate, so
//! a past-TTL row behaves exactly like a missing one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::document::{Body, Document, EntityKind, VersionToken};
use crate::error::{Error, Result};
use crate::store::{ContinuationToken, CreateOutcome, DocumentStore, Filter, Page};

/// A row is live while its TTL safety net has not fired.
const LIVE: &str =
    "(ttl_seconds IS NULL OR written_at + make_interval(secs => ttl_seconds::double precision) > now())";

/// Postgres [`DocumentStore`]. Owns the connection pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    version: String,
    body: serde_json::Value,
    expire_on: Option<DateTime<Utc>>,
    ttl_seconds: Option<i64>,
}

impl DocumentRow {
    fn try_into_document(self) -> Result<Document> {
        let body: Body = serde_json::from_value(self.body)?;
        Ok(Document {
            id: self.id,
            body,
            version: Some(VersionToken(self.version)),
            expire_on: self.expire_on,
            time_to_live: self.ttl_seconds,
        })
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn create_if_absent(&self, doc: &Document) -> Result<CreateOutcome> {
        let version = VersionToken::fresh();
        let body = serde_json::to_value(&doc.body)?;

        // A dead (past-TTL) row may still occupy the primary key; the
        // conditional update lets the create win over the corpse only.
        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO documents (kind, id, version, body, expire_on, ttl_seconds, written_at)
             VALUES ($1, $2, $3, $4, $5, $6, now())
             ON CONFLICT (kind, id) DO UPDATE
             SET version = EXCLUDED.version, body = EXCLUDED.body,
                 expire_on = EXCLUDED.expire_on, ttl_seconds = EXCLUDED.ttl_seconds,
                 written_at = EXCLUDED.written_at
             WHERE documents.ttl_seconds IS NOT NULL
               AND documents.written_at
                   + make_interval(secs => documents.ttl_seconds::double precision) <= now()
             RETURNING id",
        )
        .bind(doc.partition_key())
        .bind(&doc.id)
        .bind(&version.0)
        .bind(&body)
        .bind(doc.expire_on)
        .bind(doc.time_to_live)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut copy = doc.clone();
        copy.version = Some(version);
        Ok(CreateOutcome::Created(copy))
    }

    async fn read(&self, kind: EntityKind, id: &str) -> Result<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            "SELECT id, version, body, expire_on, ttl_seconds FROM documents
             WHERE kind = $1 AND id = $2 AND {LIVE}"
        ))
        .bind(kind.partition_key())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::try_into_document).transpose()
    }

    async fn conditional_replace(
        &self,
        doc: &Document,
        expected: &VersionToken,
    ) -> Result<Document> {
        let version = VersionToken::fresh();
        let body = serde_json::to_value(&doc.body)?;

        let rows_affected = sqlx::query(&format!(
            "UPDATE documents
             SET version = $1, body = $2, expire_on = $3, ttl_seconds = $4, written_at = now()
             WHERE kind = $5 AND id = $6 AND version = $7 AND {LIVE}"
        ))
        .bind(&version.0)
        .bind(&body)
        .bind(doc.expire_on)
        .bind(doc.time_to_live)
        .bind(doc.partition_key())
        .bind(&doc.id)
        .bind(&expected.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Distinguish a lost race from a vanished document.
            return match self.read(doc.kind(), &doc.id).await? {
                Some(_) => Err(Error::VersionConflict {
                    id: doc.id.clone(),
                }),
                None => Err(Error::NotFound(format!("{}/{}", doc.kind(), doc.id))),
            };
        }

        let mut copy = doc.clone();
        copy.version = Some(version);
        Ok(copy)
    }

    async fn upsert(&self, doc: &Document) -> Result<Document> {
        let version = VersionToken::fresh();
        let body = serde_json::to_value(&doc.body)?;

        sqlx::query(
            "INSERT INTO documents (kind, id, version, body, expire_on, ttl_seconds, written_at)
             VALUES ($1, $2, $3, $4, $5, $6, now())
             ON CONFLICT (kind, id) DO UPDATE
             SET version = EXCLUDED.version, body = EXCLUDED.body,
                 expire_on = EXCLUDED.expire_on, ttl_seconds = EXCLUDED.ttl_seconds,
                 written_at = EXCLUDED.written_at",
        )
        .bind(doc.partition_key())
        .bind(&doc.id)
        .bind(&version.0)
        .bind(&body)
        .bind(doc.expire_on)
        .bind(doc.time_to_live)
        .execute(&self.pool)
        .await?;

        let mut copy = doc.clone();
        copy.version = Some(version);
        Ok(copy)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let was_live: Option<(bool,)> = sqlx::query_as(&format!(
            "DELETE FROM documents WHERE kind = $1 AND id = $2 RETURNING {LIVE}"
        ))
        .bind(kind.partition_key())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(was_live.is_some_and(|(live,)| live))
    }

    async fn query(
        &self,
        kind: EntityKind,
        filter: &Filter,
        continuation: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, version, body, expire_on, ttl_seconds FROM documents WHERE kind = ",
        );
        qb.push_bind(kind.partition_key());
        qb.push(" AND ");
        qb.push(LIVE);
        qb.push(" AND (");
        push_filter(&mut qb, filter);
        qb.push(")");

        let paged = !matches!(filter, Filter::QueueCandidates { .. });
        if paged {
            if let Some(token) = continuation {
                qb.push(" AND id > ");
                qb.push_bind(token.0.clone());
            }
            qb.push(" ORDER BY id");
        } else {
            qb.push(" ORDER BY (body->>'created_on')::timestamptz ASC");
        }
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);

        let rows: Vec<DocumentRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let documents = rows
            .into_iter()
            .map(DocumentRow::try_into_document)
            .collect::<Result<Vec<_>>>()?;

        let continuation = if paged && documents.len() == limit {
            documents.last().map(|d| ContinuationToken(d.id.clone()))
        } else {
            None
        };
        Ok(Page {
            documents,
            continuation,
        })
    }
}

/// The one place mapping a [`Filter`] to this store's native query form.
fn push_filter(qb: &mut QueryBuilder<Postgres>, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Expired { cutoff } => {
            qb.push("expire_on IS NOT NULL AND expire_on <= ");
            qb.push_bind(*cutoff);
        }
        Filter::ExpiredAggregateCounters { cutoff } => {
            qb.push("expire_on IS NOT NULL AND expire_on <= ");
            qb.push_bind(*cutoff);
            qb.push(" AND body->>'counter_kind' = 'aggregate'");
        }
        Filter::RawCounters => {
            qb.push("body->>'counter_kind' = 'raw'");
        }
        Filter::CounterKey { key } => {
            qb.push("body->>'key' = ");
            qb.push_bind(key.clone());
        }
        Filter::KeyEquals { key } => {
            qb.push("body->>'key' = ");
            qb.push_bind(key.clone());
        }
        Filter::QueueCandidates {
            queues,
            reclaim_before,
        } => {
            qb.push("body->>'queue' = ANY(");
            qb.push_bind(queues.clone());
            qb.push(") AND (body->>'fetched_at' IS NULL OR (body->>'fetched_at')::timestamptz < ");
            qb.push_bind(*reclaim_before);
            qb.push(")");
        }
        Filter::SetMember { key, value } => {
            qb.push("body->>'key' = ");
            qb.push_bind(key.clone());
            qb.push(" AND body->>'value' = ");
            qb.push_bind(value.clone());
        }
        Filter::HashField { key, field } => {
            qb.push("body->>'key' = ");
            qb.push_bind(key.clone());
            qb.push(" AND body->>'field' = ");
            qb.push_bind(field.clone());
        }
        Filter::ListValue { key, value } => {
            qb.push("body->>'key' = ");
            qb.push_bind(key.clone());
            qb.push(" AND body->>'value' = ");
            qb.push_bind(value.clone());
        }
        Filter::ServerHeartbeatBefore { cutoff } => {
            qb.push("(body->>'last_heartbeat')::timestamptz < ");
            qb.push_bind(*cutoff);
        }
    }
}
