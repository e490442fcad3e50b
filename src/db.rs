use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

use crate::error::{Error, Result};

/// File name of the embedding database inside the store directory.
pub const DB_FILE: &str = "embeddings.sqlite";

/// Open (creating if needed) the SQLite database inside `dir`.
pub async fn connect(dir: &Path) -> Result<SqlitePool> {
    std::fs::create_dir_all(dir).map_err(|e| {
        Error::StoreUnavailable(format!("cannot create {}: {}", dir.display(), e))
    })?;

    let options = SqliteConnectOptions::new()
        .filename(dir.join(DB_FILE))
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
