//! Result cache with TTL, LRU bounding, and tag-based cascade
//! invalidation.
//!
//! Entries carry tags; a side index additionally records which tags an
//! entry *produced*. Invalidating a tag removes every entry carrying it
//! and then recursively invalidates the tags those entries produced, so
//! stale derived artifacts fall out together with their source.

use crate::config::CacheSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: Instant,
    pub last_access: Instant,
    pub hit_count: u64,
    pub ttl: Duration,
    pub tags: Vec<String>,
    access_seq: u64,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// Counters surfaced in the health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub max_cascade_depth: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// tag -> keys carrying that tag.
    tag_index: HashMap<String, HashSet<String>>,
    /// key -> tags the entry produced; drives cascade recursion.
    produced: HashMap<String, HashSet<String>>,
    access_seq: u64,
}

pub struct IntelligentCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    max_cascade_depth: AtomicU64,
}

impl IntelligentCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tag_index: HashMap::new(),
                produced: HashMap::new(),
                access_seq: 0,
            }),
            max_entries: settings.max_entries,
            default_ttl: settings.default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            max_cascade_depth: AtomicU64::new(0),
        }
    }

    /// Store a value. A `ttl` of `None` uses the configured default.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>, tags: Vec<String>) {
        self.set_producing(key, value, ttl, tags, Vec::new()).await;
    }

    /// Store a value that also *produced* the given tags; entries
    /// carrying those tags are invalidated whenever this entry is.
    pub async fn set_producing(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: Vec<String>,
        produced_tags: Vec<String>,
    ) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        // Replacing an entry drops its old index footprint first.
        if inner.entries.contains_key(key) {
            Self::unindex(&mut inner, key);
        }

        inner.access_seq += 1;
        let access_seq = inner.access_seq;
        for tag in &tags {
            inner
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        if !produced_tags.is_empty() {
            inner
                .produced
                .insert(key.to_string(), produced_tags.into_iter().collect());
        }
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                last_access: now,
                hit_count: 0,
                ttl: ttl.unwrap_or(self.default_ttl),
                tags,
                access_seq,
            },
        );

        while inner.entries.len() > self.max_entries {
            let lru = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.access_seq)
                .map(|(k, _)| k.clone());
            match lru {
                Some(victim) => {
                    debug!("Evicting cache entry {}", victim);
                    Self::unindex(&mut inner, &victim);
                    inner.entries.remove(&victim);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expired(now),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            Self::unindex(&mut inner, key);
            inner.entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        inner.access_seq += 1;
        let access_seq = inner.access_seq;
        let entry = inner.entries.get_mut(key).expect("checked above");
        entry.last_access = now;
        entry.hit_count += 1;
        entry.access_seq = access_seq;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Remove one entry and cascade through the tags it produced.
    pub async fn invalidate(&self, key: &str) -> usize {
        let mut inner = self.inner.lock().await;
        self.cascade_remove(&mut inner, vec![key.to_string()], Vec::new())
    }

    /// Remove every entry carrying `tag`, then recursively every entry
    /// carrying a tag produced by a removed entry. Returns the number of
    /// entries removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut inner = self.inner.lock().await;
        self.cascade_remove(&mut inner, Vec::new(), vec![tag.to_string()])
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            entries: inner.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            max_cascade_depth: self.max_cascade_depth.load(Ordering::Relaxed),
        }
    }

    /// Drop expired entries. Called by the background sweeper.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            Self::unindex(&mut inner, key);
            inner.entries.remove(key);
        }
        let count = expired.len();
        if count > 0 {
            self.expirations.fetch_add(count as u64, Ordering::Relaxed);
            info!("Cache sweep removed {} expired entries", count);
        }
        count
    }

    /// Spawn the periodic TTL sweeper; it stops when `shutdown` fires.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep().await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweeper stopped");
                        break;
                    }
                }
            }
        });
    }

    /// BFS over seed keys and tag closures, tracking cascade depth.
    fn cascade_remove(
        &self,
        inner: &mut CacheInner,
        seed_keys: Vec<String>,
        seed_tags: Vec<String>,
    ) -> usize {
        let mut frontier: VecDeque<(String, u64)> = VecDeque::new();
        let mut visited_tags: HashSet<String> = HashSet::new();
        let mut removed = 0usize;
        let mut max_depth = 0u64;

        let mut keys: VecDeque<(String, u64)> = seed_keys.into_iter().map(|k| (k, 0)).collect();
        for tag in seed_tags {
            visited_tags.insert(tag.clone());
            frontier.push_back((tag, 0));
        }

        loop {
            while let Some((key, depth)) = keys.pop_front() {
                let Some(entry) = inner.entries.remove(&key) else {
                    continue;
                };
                for tag in &entry.tags {
                    if let Some(tagged) = inner.tag_index.get_mut(tag) {
                        tagged.remove(&key);
                        if tagged.is_empty() {
                            inner.tag_index.remove(tag);
                        }
                    }
                }
                removed += 1;
                max_depth = max_depth.max(depth);
                if let Some(produced) = inner.produced.remove(&key) {
                    for tag in produced {
                        if visited_tags.insert(tag.clone()) {
                            frontier.push_back((tag, depth + 1));
                        }
                    }
                }
            }
            match frontier.pop_front() {
                Some((tag, depth)) => {
                    if let Some(tagged) = inner.tag_index.remove(&tag) {
                        for key in tagged {
                            keys.push_back((key, depth));
                        }
                    }
                }
                None => break,
            }
        }

        if removed > 0 {
            debug!("Cache cascade removed {} entries", removed);
        }
        self.max_cascade_depth.fetch_max(max_depth, Ordering::Relaxed);
        removed
    }

    /// Remove `key`'s footprint from the tag and produced indexes. The
    /// entry itself must still be present.
    fn unindex(inner: &mut CacheInner, key: &str) {
        let tags: Vec<String> = inner
            .entries
            .get(key)
            .map(|e| e.tags.clone())
            .unwrap_or_default();
        for tag in tags {
            if let Some(keys) = inner.tag_index.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    inner.tag_index.remove(&tag);
                }
            }
        }
        inner.produced.remove(key);
    }
}
