//! Immutable template byte cache with an LRU byte budget.
//!
//! Template identifiers are assumed content-addressed: the platform never
//! reuses an identifier for different bytes, so entries have no TTL and are
//! only ever inserted or evicted, never updated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use docforge_core::{CorrelationId, GenerationError, TemplateId};

use crate::store::ContentStore;

/// Cache observability counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_bytes: u64,
    pub entries: usize,
}

struct CacheEntry {
    bytes: Arc<Vec<u8>>,
    size: u64,
    /// Monotonic access tick; smallest is least recently used.
    last_accessed: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<TemplateId, CacheEntry>,
    total_bytes: u64,
    tick: u64,
    stats: CacheStats,
}

/// Process-wide template cache.
///
/// The inner lock is held across a miss's fetch, so concurrent requests for
/// a missing template share one download instead of stampeding the platform.
pub struct TemplateCache {
    store: Arc<dyn ContentStore>,
    max_bytes: u64,
    inner: Mutex<CacheInner>,
}

impl TemplateCache {
    pub fn new(store: Arc<dyn ContentStore>, max_bytes: u64) -> Self {
        Self {
            store,
            max_bytes,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Get template bytes, fetching on miss and evicting LRU entries while
    /// the byte budget is exceeded.
    pub async fn get(
        &self,
        id: &TemplateId,
        cid: CorrelationId,
    ) -> Result<Arc<Vec<u8>>, GenerationError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.entries.get_mut(id) {
            entry.last_accessed = tick;
            let bytes = entry.bytes.clone();
            inner.stats.hits += 1;
            tracing::trace!(template_id = %id, "template cache hit");
            return Ok(bytes);
        }

        inner.stats.misses += 1;
        tracing::debug!(template_id = %id, correlation_id = %cid, "template cache miss, fetching");
        let bytes = Arc::new(self.store.fetch_template(id, cid).await?);
        let size = bytes.len() as u64;

        inner.entries.insert(
            id.clone(),
            CacheEntry {
                bytes: bytes.clone(),
                size,
                last_accessed: tick,
            },
        );
        inner.total_bytes += size;
        Self::evict_over_budget(inner, self.max_bytes);
        inner.stats.current_bytes = inner.total_bytes;
        inner.stats.entries = inner.entries.len();

        Ok(bytes)
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let mut stats = inner.stats.clone();
        stats.current_bytes = inner.total_bytes;
        stats.entries = inner.entries.len();
        stats
    }

    fn evict_over_budget(inner: &mut CacheInner, max_bytes: u64) {
        while inner.total_bytes > max_bytes && !inner.entries.is_empty() {
            let lru_id = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(id, _)| id.clone());
            let Some(id) = lru_id else { break };
            if let Some(entry) = inner.entries.remove(&id) {
                inner.total_bytes -= entry.size;
                inner.stats.evictions += 1;
                tracing::debug!(template_id = %id, size = entry.size, "evicted template from cache");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    fn cid() -> CorrelationId {
        CorrelationId::new()
    }

    #[tokio::test]
    async fn second_get_hits_without_a_fetch() {
        let store = InMemoryStore::arc();
        let id = TemplateId::from("tpl-1");
        store.add_template(id.clone(), b"template bytes".to_vec());

        let cache = TemplateCache::new(store.clone(), 1024);
        let a = cache.get(&id, cid()).await.unwrap();
        let b = cache.get(&id, cid()).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(store.template_fetches(&id), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn missing_template_is_classified() {
        let store = InMemoryStore::arc();
        let cache = TemplateCache::new(store, 1024);

        let err = cache
            .get(&TemplateId::from("tpl-ghost"), cid())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::TemplateNotFound(_)));
    }

    #[tokio::test]
    async fn evicts_least_recently_used_first() {
        let store = InMemoryStore::arc();
        for name in ["tpl-a", "tpl-b", "tpl-c"] {
            store.add_template(TemplateId::from(name), vec![0u8; 100]);
        }

        // Budget fits two 100-byte entries.
        let cache = TemplateCache::new(store.clone(), 200);
        let a = TemplateId::from("tpl-a");
        let b = TemplateId::from("tpl-b");
        let c = TemplateId::from("tpl-c");

        cache.get(&a, cid()).await.unwrap();
        cache.get(&b, cid()).await.unwrap();
        // Touch a so b becomes the LRU entry.
        cache.get(&a, cid()).await.unwrap();
        cache.get(&c, cid()).await.unwrap();

        // a (recently touched) survived; b was evicted and refetches.
        cache.get(&a, cid()).await.unwrap();
        assert_eq!(store.template_fetches(&a), 1);

        cache.get(&b, cid()).await.unwrap();
        assert_eq!(store.template_fetches(&b), 2);

        let stats = cache.stats().await;
        assert!(stats.evictions >= 1);
    }

    #[tokio::test]
    async fn cached_bytes_are_identical_to_source() {
        let store = InMemoryStore::arc();
        let id = TemplateId::from("tpl-1");
        let payload = b"exact payload".to_vec();
        store.add_template(id.clone(), payload.clone());

        let cache = TemplateCache::new(store, 1024);
        let bytes = cache.get(&id, cid()).await.unwrap();
        assert_eq!(*bytes, payload);
    }
}
