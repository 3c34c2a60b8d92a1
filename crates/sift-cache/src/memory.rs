use crate::{CacheApi, CacheError, ScanPage};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// In-memory hash-of-hashes cache.
///
/// Fields are kept ordered so scan cursors stay stable across pages; the
/// cursor is the offset into the ordered field list. Intended for tests and
/// embedded use, the production client lives outside this workspace.
#[derive(Debug, Default)]
pub struct MemoryCache {
    // RwLock allows concurrent readers while writes take exclusive access.
    inner: RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheApi for MemoryCache {
    async fn hscan(&self, key: &str, cursor: u64, count: usize) -> Result<ScanPage, CacheError> {
        let guard = self.inner.read().await;
        let Some(hash) = guard.get(key) else {
            return Ok((0, Vec::new()));
        };
        let offset = cursor as usize;
        let page: Vec<(String, Bytes)> = hash
            .iter()
            .skip(offset)
            .take(count.max(1))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        let next = offset + page.len();
        let next_cursor = if next >= hash.len() { 0 } else { next as u64 };
        Ok((next_cursor, page))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Bytes>>, CacheError> {
        let guard = self.inner.read().await;
        let hash = guard.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|hash| hash.get(field).cloned()))
            .collect())
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), CacheError> {
        self.inner
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), CacheError> {
        if let Some(hash) = self.inner.write().await.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hlen(&self, key: &str) -> Result<usize, CacheError> {
        Ok(self
            .inner
            .read()
            .await
            .get(key)
            .map_or(0, BTreeMap::len))
    }
}
