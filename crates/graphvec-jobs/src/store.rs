//! Entity store.

use crate::job::EntityKind;
use async_trait::async_trait;
use graphvec_config::StoreConfig;
use graphvec_core::{GraphvecError, GraphvecResult};
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// The fields of an entity that feed embedding generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl EntityRecord {
    /// Returns the text to embed: the non-blank name and description joined
    /// by a newline, or `None` if both are blank.
    #[must_use]
    pub fn embedding_text(&self) -> Option<String> {
        let parts: Vec<&str> = [self.name.as_deref(), self.description.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

/// Keyed record store holding graph entities and their embeddings.
///
/// Implementations tag failures at the source: a missing record is
/// [`GraphvecError::NotFound`], connectivity problems are
/// [`GraphvecError::Connection`] or [`GraphvecError::Timeout`].
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetches an entity.
    async fn fetch(&self, kind: EntityKind, id: &str) -> GraphvecResult<EntityRecord>;

    /// Stores an embedding on an entity. Writing the same vector twice is harmless.
    async fn write_embedding(&self, kind: EntityKind, id: &str, embedding: &[f32], model: &str) -> GraphvecResult<()>;

    /// Closes the underlying connections.
    async fn close(&self);
}

/// Postgres entity store with pgvector embedding columns.
///
/// Every collection is keyed by a `uuid` primary key, bound as such so
/// lookups use the index.
#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    /// Connects a pool using the store configuration.
    pub async fn connect(config: &StoreConfig) -> GraphvecResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await?;

        info!(max_connections = config.max_connections, "Connected to entity store");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Parses an entity id into its key. An id that is not a UUID cannot
    /// exist in the store.
    fn key(kind: EntityKind, id: &str) -> GraphvecResult<Uuid> {
        Uuid::parse_str(id).map_err(|_| GraphvecError::not_found(kind.as_str(), id))
    }

    fn select_sql(kind: EntityKind) -> String {
        format!(
            "SELECT id::text AS id, name, description FROM {} WHERE id = $1",
            kind.collection()
        )
    }

    fn update_sql(kind: EntityKind) -> String {
        format!(
            "UPDATE {} SET embedding = $1, embedding_model = $2, embedded_at = now() WHERE id = $3",
            kind.collection()
        )
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn fetch(&self, kind: EntityKind, id: &str) -> GraphvecResult<EntityRecord> {
        let key = Self::key(kind, id)?;
        let row = sqlx::query(&Self::select_sql(kind))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| GraphvecError::not_found(kind.as_str(), id))?;

        Ok(EntityRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
        })
    }

    async fn write_embedding(&self, kind: EntityKind, id: &str, embedding: &[f32], model: &str) -> GraphvecResult<()> {
        let key = Self::key(kind, id)?;
        let result = sqlx::query(&Self::update_sql(kind))
            .bind(Vector::from(embedding.to_vec()))
            .bind(model)
            .bind(key)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GraphvecError::not_found(kind.as_str(), id));
        }

        debug!(
            entity_type = %kind,
            entity_id = %id,
            dimension = embedding.len(),
            "Embedding stored"
        );
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Entity store connections closed");
    }
}
