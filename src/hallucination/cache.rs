//! Evaluation cache.
//!
//! Bounded, TTL-limited and safe to share between concurrent loops. Keys are
//! SHA-256 digests of either the whole request or the content alone.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::types::{EvaluationResult, VerificationRequest};

/// What a cache key is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyScope {
    /// Query, content, grounding text and sources together
    #[default]
    Request,
    /// Content text only; the same text evaluated for a different query or
    /// different sources shares an entry
    ContentOnly,
}

/// Cache key for an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Key over every field of the request.
    pub fn for_request(request: &VerificationRequest) -> Self {
        let mut hasher = Sha256::new();
        for field in [
            request.query.as_str(),
            request.content.as_str(),
            request.grounding_text.as_str(),
        ] {
            update_framed(&mut hasher, field);
        }
        hasher.update((request.sources.len() as u64).to_le_bytes());
        for source in &request.sources {
            update_framed(&mut hasher, source);
        }
        CacheKey(format!("{:x}", hasher.finalize()))
    }

    /// Key over the content text alone.
    pub fn from_content(content: &str) -> Self {
        CacheKey(content_hash(content))
    }

    pub fn scoped(scope: CacheKeyScope, request: &VerificationRequest) -> Self {
        match scope {
            CacheKeyScope::Request => Self::for_request(request),
            CacheKeyScope::ContentOnly => Self::from_content(&request.content),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16.min(self.0.len())])
    }
}

/// Length-prefixed so field boundaries cannot be shifted between fields.
fn update_framed(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

/// Hex SHA-256 digest of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries; 0 disables caching
    pub capacity: usize,
    /// Entry lifetime in seconds; `None` keeps entries until evicted
    pub ttl_secs: Option<u64>,
    pub scope: CacheKeyScope,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_secs: Some(3600),
            scope: CacheKeyScope::Request,
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: Option<u64>) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_scope(mut self, scope: CacheKeyScope) -> Self {
        self.scope = scope;
        self
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: EvaluationResult,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    fn new(result: EvaluationResult) -> Self {
        let now = Utc::now();
        Self {
            result,
            created_at: now,
            last_accessed: now,
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| Utc::now() - self.created_at >= ttl)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped to stay within capacity
    pub evictions: u64,
    pub entry_count: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared cache of evaluation results.
///
/// Cloning is cheap and clones share entries.
#[derive(Clone)]
pub struct EvaluationCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    stats: Arc<RwLock<CacheStats>>,
    config: CacheConfig,
}

impl Default for EvaluationCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl EvaluationCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key for `request` under the configured scope.
    pub fn key_for(&self, request: &VerificationRequest) -> CacheKey {
        CacheKey::scoped(self.config.scope, request)
    }

    fn ttl(&self) -> Option<Duration> {
        self.config
            .ttl_secs
            .map(|secs| {
                i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .unwrap_or(Duration::MAX)
            })
    }

    /// Look up a result; expired entries count as misses and are dropped.
    pub async fn get(&self, key: &CacheKey) -> Option<EvaluationResult> {
        let ttl = self.ttl();
        let mut entries = self.entries.write().await;
        let found = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(ttl) => {
                entry.last_accessed = Utc::now();
                Some(entry.result.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };

        let mut stats = self.stats.write().await;
        stats.entry_count = entries.len() as u64;
        if found.is_some() {
            stats.hits += 1;
            debug!(%key, "Evaluation cache hit");
        } else {
            stats.misses += 1;
            debug!(%key, "Evaluation cache miss");
        }
        found
    }

    /// Store a result. Expired entries are dropped first; if the cache is
    /// still full the least recently used entry is evicted.
    pub async fn insert(&self, key: CacheKey, result: EvaluationResult) {
        if self.config.capacity == 0 {
            return;
        }

        let mut entries = self.entries.write().await;
        self.purge_expired(&mut entries);
        let mut evicted = 0;
        if !entries.contains_key(&key) {
            while entries.len() >= self.config.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_accessed)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(oldest) => {
                        entries.remove(&oldest);
                        evicted += 1;
                    }
                    None => break,
                }
            }
        }
        entries.insert(key, CacheEntry::new(result));

        let mut stats = self.stats.write().await;
        stats.evictions += evicted;
        stats.entry_count = entries.len() as u64;
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop expired entries.
    pub async fn cleanup(&self) {
        let mut entries = self.entries.write().await;
        self.purge_expired(&mut entries);

        let mut stats = self.stats.write().await;
        stats.entry_count = entries.len() as u64;
    }

    fn purge_expired(&self, entries: &mut HashMap<CacheKey, CacheEntry>) {
        let ttl = self.ttl();
        if ttl.is_some() {
            entries.retain(|_, e| !e.is_expired(ttl));
        }
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();

        let mut stats = self.stats.write().await;
        *stats = CacheStats::default();
    }
}
