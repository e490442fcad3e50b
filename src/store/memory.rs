//! In-memory [`VectorStore`] for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{check_upsert, rank, Metadata, QueryHit, StoredEmbedding, VectorStore};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<BTreeMap<String, StoredEmbedding>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, StoredEmbedding>>> {
        self.entries
            .read()
            .map_err(|_| Error::StoreUnavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, StoredEmbedding>>> {
        self.entries
            .write()
            .map_err(|_| Error::StoreUnavailable("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, id: &str, vector: &[f32], metadata: &Metadata) -> Result<()> {
        check_upsert(id, vector)?;
        self.write()?.insert(
            id.to_string(),
            StoredEmbedding {
                id: id.to_string(),
                vector: vector.to_vec(),
                metadata: metadata.clone(),
                updated_at: chrono::Utc::now().timestamp(),
            },
        );
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<QueryHit>> {
        let entries = self.read()?;
        rank(
            vector,
            top_k,
            entries
                .values()
                .map(|e| (e.id.as_str(), e.vector.as_slice(), &e.metadata)),
        )
    }

    async fn get(&self, id: &str) -> Result<Option<StoredEmbedding>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<StoredEmbedding>> {
        Ok(self.read()?.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    async fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }
}
