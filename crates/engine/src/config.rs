//! Engine configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use docforge_core::RetryPolicy;

use crate::convert::ConverterConfig;

/// Maps a parent object type to the platform relation field that holds it.
///
/// The platform's "which relation field holds this record type" indirection
/// is injected configuration: unknown keys fall back to the key itself.
pub type RelationMap = BTreeMap<String, String>;

/// Configuration for the whole processing engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Poll interval after a tick that found work.
    pub active_interval: Duration,
    /// Poll interval after an empty tick (adaptive backoff against an
    /// empty queue).
    pub idle_interval: Duration,
    /// Jobs leased per tick.
    pub batch_size: usize,
    /// Jobs processed in parallel; the rest of a leased batch queues
    /// in-process.
    pub max_concurrency: usize,
    /// Lease duration. A job that outlives this is assumed abandoned and
    /// becomes reclaimable by any scheduler instance.
    pub lock_ttl: Duration,
    /// Job-level retry policy (attempts + backoff schedule).
    pub retry: RetryPolicy,
    /// Template cache byte budget.
    pub cache_max_bytes: u64,
    /// External converter invocation.
    pub converter: ConverterConfig,
    /// Converter slots, shared by the batch and interactive paths.
    pub convert_concurrency: usize,
    /// Recency window for idempotent reuse of a succeeded twin job.
    pub gate_window: Duration,
    /// Parent object type -> relation field key.
    pub relation_map: RelationMap,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(15),
            idle_interval: Duration::from_secs(60),
            batch_size: 25,
            max_concurrency: 8,
            lock_ttl: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            cache_max_bytes: 500 * 1024 * 1024,
            converter: ConverterConfig::default(),
            convert_concurrency: 8,
            gate_window: Duration::from_secs(24 * 60 * 60),
            relation_map: RelationMap::new(),
        }
    }
}

impl EngineConfig {
    /// Relation field for a parent key, falling back to the key itself.
    pub fn relation_key<'a>(&'a self, parent_key: &'a str) -> &'a str {
        self.relation_map
            .get(parent_key)
            .map(String::as_str)
            .unwrap_or(parent_key)
    }
}
