//! Content-addressed embedding cache: `(sha256(text), provider, model) →
//! vector`, backed by a `redb` table with a hot-path in-process `LruCache`
//! in front of it. Entries are encoded with `bincode` rather than JSON,
//! since vectors are the one payload here large enough for the size
//! difference to matter.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use redb::{Database, ReadableTable, TableDefinition};
use sha2::{Digest, Sha256};

use crate::error::{MemoryError, Result};
use crate::schema::{now_ms, EmbeddingCacheEntry};

const CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("embeddings");

const LRU_CAPACITY: usize = 512;

#[derive(Debug, Clone, Default)]
pub struct EmbeddingCacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct EmbeddingCache {
    db: Database,
    path: PathBuf,
    cache: LruCache<String, EmbeddingCacheEntry>,
    hits: u64,
    misses: u64,
}

impl EmbeddingCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryError::database("embedding cache dir", e))?;
        }
        let db = Database::create(&path).map_err(|e| MemoryError::database("embedding cache open", e))?;
        {
            let tx = db.begin_write().map_err(|e| MemoryError::database("embedding cache init", e))?;
            tx.open_table(CACHE_TABLE).map_err(|e| MemoryError::database("embedding cache init", e))?;
            tx.commit().map_err(|e| MemoryError::database("embedding cache init", e))?;
        }
        Ok(Self {
            db,
            path,
            cache: LruCache::new(NonZeroUsize::new(LRU_CAPACITY).unwrap()),
            hits: 0,
            misses: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cache key for `(text, provider, model)`: `sha256(text)/provider/model`.
    pub fn key_for(text: &str, provider: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("{digest}/{provider}/{model}")
    }

    pub fn get(&mut self, text: &str, provider: &str, model: &str) -> Result<Option<Vec<f32>>> {
        let key = Self::key_for(text, provider, model);

        if let Some(entry) = self.cache.get(&key) {
            self.hits += 1;
            return Ok(Some(entry.vector.clone()));
        }

        let tx = self.db.begin_read().map_err(|e| MemoryError::database("embedding cache read", e))?;
        let tbl = tx.open_table(CACHE_TABLE).map_err(|e| MemoryError::database("embedding cache read", e))?;
        match tbl.get(key.as_str()).map_err(|e| MemoryError::database("embedding cache read", e))? {
            None => {
                self.misses += 1;
                Ok(None)
            }
            Some(bytes) => {
                let (entry, _): (EmbeddingCacheEntry, usize) =
                    bincode::serde::decode_from_slice(bytes.value(), bincode::config::standard())
                        .map_err(|e| MemoryError::Invalid(format!("embedding cache decode: {e}")))?;
                self.hits += 1;
                let vector = entry.vector.clone();
                drop(tbl);
                self.cache.put(key, entry);
                Ok(Some(vector))
            }
        }
    }

    pub fn put(&mut self, text: &str, provider: &str, model: &str, vector: Vec<f32>) -> Result<()> {
        let key = Self::key_for(text, provider, model);
        let entry = EmbeddingCacheEntry { vector, created_at: now_ms() };
        let bytes = bincode::serde::encode_to_vec(&entry, bincode::config::standard())
            .map_err(|e| MemoryError::Invalid(format!("embedding cache encode: {e}")))?;

        let tx = self.db.begin_write().map_err(|e| MemoryError::database("embedding cache write", e))?;
        {
            let mut tbl = tx.open_table(CACHE_TABLE).map_err(|e| MemoryError::database("embedding cache write", e))?;
            tbl.insert(key.as_str(), bytes.as_slice()).map_err(|e| MemoryError::database("embedding cache write", e))?;
        }
        tx.commit().map_err(|e| MemoryError::database("embedding cache write", e))?;

        self.cache.put(key, entry);
        Ok(())
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        EmbeddingCacheStats {
            capacity: LRU_CAPACITY,
            len: self.cache.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cache() -> (tempfile::TempDir, EmbeddingCache) {
        let dir = tempdir().unwrap();
        let cache = EmbeddingCache::open(dir.path().join("embeddings.redb")).unwrap();
        (dir, cache)
    }

    #[test]
    fn miss_then_hit_after_put() {
        let (_dir, mut cache) = cache();
        assert!(cache.get("hello", "local", "default").unwrap().is_none());
        cache.put("hello", "local", "default", vec![0.1, 0.2, 0.3]).unwrap();
        let found = cache.get("hello", "local", "default").unwrap().unwrap();
        assert_eq!(found, vec![0.1, 0.2, 0.3]);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn different_provider_or_model_misses() {
        let (_dir, mut cache) = cache();
        cache.put("hello", "local", "v1", vec![1.0]).unwrap();
        assert!(cache.get("hello", "local", "v2").unwrap().is_none());
        assert!(cache.get("hello", "openai", "v1").unwrap().is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("embeddings.redb");
        {
            let mut cache = EmbeddingCache::open(&path).unwrap();
            cache.put("persisted", "local", "default", vec![9.0]).unwrap();
        }
        let mut reopened = EmbeddingCache::open(&path).unwrap();
        assert_eq!(reopened.get("persisted", "local", "default").unwrap(), Some(vec![9.0]));
    }
}
