//! SQLite-backed [`VectorStore`].
//!
//! Vectors live in one `embeddings` table keyed by `(collection, id)`, as
//! little-endian f32 BLOBs. Queries load the collection and rank it in
//! Rust. Each upsert is a single statement, so an aborted run leaves
//! earlier entries intact.

use std::path::Path;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::{
    blob_to_vec, check_upsert, rank, vec_to_blob, Metadata, QueryHit, StoredEmbedding,
    VectorStore,
};
use crate::db;
use crate::error::{Error, Result};
use crate::migrate;

pub struct SqliteVectorStore {
    pool: SqlitePool,
    collection: String,
}

impl SqliteVectorStore {
    /// Open the store in `dir`, creating the directory and schema if needed.
    pub async fn open(dir: &Path, collection: &str) -> Result<Self> {
        let pool = db::connect(dir).await?;
        migrate::run_migrations(&pool).await?;
        tracing::debug!(path = %dir.display(), collection, "opened vector store");
        Ok(Self {
            pool,
            collection: collection.to_string(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<StoredEmbedding> {
        let blob: Vec<u8> = row.try_get("vector")?;
        let metadata_json: String = row.try_get("metadata_json")?;
        let metadata: Metadata = serde_json::from_str(&metadata_json).map_err(|e| {
            Error::StoreUnavailable(format!("corrupt metadata in vector store: {}", e))
        })?;
        Ok(StoredEmbedding {
            id: row.try_get("id")?,
            vector: blob_to_vec(&blob),
            metadata,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, id: &str, vector: &[f32], metadata: &Metadata) -> Result<()> {
        check_upsert(id, vector)?;
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| Error::InvalidInput(format!("unserializable metadata: {}", e)))?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO embeddings (collection, id, vector, dims, metadata_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                vector = excluded.vector,
                dims = excluded.dims,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.collection)
        .bind(id)
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(metadata_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<QueryHit>> {
        let entries = self.list().await?;
        rank(
            vector,
            top_k,
            entries
                .iter()
                .map(|e| (e.id.as_str(), e.vector.as_slice(), &e.metadata)),
        )
    }

    async fn get(&self, id: &str) -> Result<Option<StoredEmbedding>> {
        let row = sqlx::query(
            "SELECT id, vector, metadata_json, updated_at FROM embeddings WHERE collection = ? AND id = ?",
        )
        .bind(&self.collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn list(&self) -> Result<Vec<StoredEmbedding>> {
        let rows = sqlx::query(
            "SELECT id, vector, metadata_json, updated_at FROM embeddings WHERE collection = ? ORDER BY id ASC",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn clear(&self) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM embeddings WHERE collection = ?")
            .bind(&self.collection)
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::info!(collection = %self.collection, deleted, "cleared collection");
        Ok(())
    }
}
