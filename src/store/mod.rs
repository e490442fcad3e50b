//! Embedding store.
//!
//! The [`VectorStore`] trait is the access contract the pipeline relies on:
//! upsert by id, similarity query, and a few housekeeping calls. Two
//! backends implement it:
//!
//! - [`SqliteVectorStore`]: persistent, one SQLite file under the
//!   configured store directory.
//! - [`InMemoryVectorStore`]: for tests and throwaway runs.
//!
//! Both rank by cosine similarity over every stored vector, highest first,
//! with ties broken by id so results are deterministic.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub use memory::InMemoryVectorStore;
pub use sqlite::SqliteVectorStore;

/// Free-form metadata stored next to each vector.
pub type Metadata = Map<String, Value>;

/// One ranked result from [`VectorStore::query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    pub id: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
    pub metadata: Metadata,
}

/// A stored vector with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEmbedding {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    /// Unix seconds of the last upsert.
    pub updated_at: i64,
}

/// Access contract for the embedding store.
///
/// Entries are replaced wholesale on upsert; nothing is mutated in place.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the entry for `id`.
    async fn upsert(&self, id: &str, vector: &[f32], metadata: &Metadata) -> Result<()>;

    /// Up to `top_k` entries ordered by descending similarity to `vector`.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<QueryHit>>;

    async fn get(&self, id: &str) -> Result<Option<StoredEmbedding>>;

    /// All entries, ordered by id.
    async fn list(&self) -> Result<Vec<StoredEmbedding>>;

    async fn count(&self) -> Result<usize>;

    /// Remove every entry in the collection.
    async fn clear(&self) -> Result<()>;
}

pub(crate) fn check_upsert(id: &str, vector: &[f32]) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::InvalidInput("embedding id must not be empty".into()));
    }
    if vector.is_empty() {
        return Err(Error::InvalidInput(format!(
            "embedding vector for '{}' is empty",
            id
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::InvalidInput(format!(
            "embedding vector for '{}' contains non-finite values",
            id
        )));
    }
    Ok(())
}

/// Score and order candidates against `query`.
pub(crate) fn rank<'a, I>(query: &[f32], top_k: usize, entries: I) -> Result<Vec<QueryHit>>
where
    I: IntoIterator<Item = (&'a str, &'a [f32], &'a Metadata)>,
{
    if query.is_empty() {
        return Err(Error::InvalidInput("query vector is empty".into()));
    }
    if top_k == 0 {
        return Ok(Vec::new());
    }

    // Equal cosine scores (parallel vectors) fall back to distance, then id.
    let mut scored: Vec<(QueryHit, f32)> = entries
        .into_iter()
        .map(|(id, vector, metadata)| {
            let hit = QueryHit {
                id: id.to_string(),
                score: cosine_similarity(query, vector),
                metadata: metadata.clone(),
            };
            (hit, euclidean_distance(query, vector))
        })
        .collect();

    scored.sort_by(|(a, da), (b, db)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| da.partial_cmp(db).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(scored.into_iter().take(top_k).map(|(hit, _)| hit).collect())
}

/// Euclidean distance; `f32::INFINITY` when lengths differ.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-magnitude operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}
