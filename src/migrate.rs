use sqlx::SqlitePool;

use crate::error::Result;

/// Create the embedding tables. Safe to run on every open.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            vector BLOB NOT NULL,
            dims INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embeddings_updated_at ON embeddings(collection, updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
