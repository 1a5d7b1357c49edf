//! Content-addressed memoization of pipeline outputs.
//!
//! Three key families live in one store: parsed content keyed
//! `(content_hash, parser_version)`, feature vectors keyed
//! `(content_hash, feature_version)`, and classification results keyed
//! `(content_hash, feature_version, model_version)`. Values for a fixed
//! key are defined to be identical, so concurrent puts are safe and
//! last-writer-wins. Eviction is strictly least-recently-used per family
//! with a configurable capacity bound; an evicted entry only costs a
//! recomputation, never correctness. The result store stays authoritative.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::CacheConfig;
use crate::models::{ClassificationResult, FeatureVector, ParsedContent};

/// Bounded map with strict LRU eviction. `get` refreshes recency.
struct LruMap<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    /// recency tick → key; the smallest tick is the eviction victim.
    recency: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruMap<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        if let Some((value, old_tick)) = self.entries.get_mut(key) {
            let value = value.clone();
            self.recency.remove(old_tick);
            *old_tick = tick;
            self.recency.insert(tick, key.clone());
            Some(value)
        } else {
            None
        }
    }

    fn put(&mut self, key: K, value: V) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((old_value, old_tick)) = self.entries.get_mut(&key) {
            // Idempotent overwrite; refresh recency
            *old_value = value;
            self.recency.remove(old_tick);
            *old_tick = tick;
            self.recency.insert(tick, key);
            return;
        }
        if self.entries.len() >= self.capacity {
            if let Some((&oldest, _)) = self.recency.iter().next() {
                if let Some(victim) = self.recency.remove(&oldest) {
                    self.entries.remove(&victim);
                }
            }
        }
        self.entries.insert(key.clone(), (value, tick));
        self.recency.insert(tick, key);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedKey {
    pub content_hash: String,
    pub parser_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureKey {
    pub content_hash: String,
    pub feature_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassificationKey {
    pub content_hash: String,
    pub feature_version: String,
    pub model_version: String,
}

/// Observable hit/miss counters, one pair per family.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub parsed_hits: u64,
    pub parsed_misses: u64,
    pub feature_hits: u64,
    pub feature_misses: u64,
    pub classification_hits: u64,
    pub classification_misses: u64,
}

pub struct PredictionCache {
    parsed: Mutex<LruMap<ParsedKey, ParsedContent>>,
    features: Mutex<LruMap<FeatureKey, FeatureVector>>,
    classifications: Mutex<LruMap<ClassificationKey, ClassificationResult>>,
    parsed_hits: AtomicU64,
    parsed_misses: AtomicU64,
    feature_hits: AtomicU64,
    feature_misses: AtomicU64,
    classification_hits: AtomicU64,
    classification_misses: AtomicU64,
}

impl PredictionCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            parsed: Mutex::new(LruMap::new(config.parsed_capacity)),
            features: Mutex::new(LruMap::new(config.feature_capacity)),
            classifications: Mutex::new(LruMap::new(config.classification_capacity)),
            parsed_hits: AtomicU64::new(0),
            parsed_misses: AtomicU64::new(0),
            feature_hits: AtomicU64::new(0),
            feature_misses: AtomicU64::new(0),
            classification_hits: AtomicU64::new(0),
            classification_misses: AtomicU64::new(0),
        }
    }

    pub fn get_parsed(&self, key: &ParsedKey) -> Option<ParsedContent> {
        let hit = self.parsed.lock().expect("cache poisoned").get(key);
        self.count(&self.parsed_hits, &self.parsed_misses, hit.is_some());
        hit
    }

    pub fn put_parsed(&self, key: ParsedKey, value: ParsedContent) {
        self.parsed.lock().expect("cache poisoned").put(key, value);
    }

    pub fn get_features(&self, key: &FeatureKey) -> Option<FeatureVector> {
        let hit = self.features.lock().expect("cache poisoned").get(key);
        self.count(&self.feature_hits, &self.feature_misses, hit.is_some());
        hit
    }

    pub fn put_features(&self, key: FeatureKey, value: FeatureVector) {
        self.features.lock().expect("cache poisoned").put(key, value);
    }

    pub fn get_classification(&self, key: &ClassificationKey) -> Option<ClassificationResult> {
        let hit = self.classifications.lock().expect("cache poisoned").get(key);
        self.count(
            &self.classification_hits,
            &self.classification_misses,
            hit.is_some(),
        );
        hit
    }

    pub fn put_classification(&self, key: ClassificationKey, value: ClassificationResult) {
        self.classifications
            .lock()
            .expect("cache poisoned")
            .put(key, value);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            parsed_hits: self.parsed_hits.load(Ordering::Relaxed),
            parsed_misses: self.parsed_misses.load(Ordering::Relaxed),
            feature_hits: self.feature_hits.load(Ordering::Relaxed),
            feature_misses: self.feature_misses.load(Ordering::Relaxed),
            classification_hits: self.classification_hits.load(Ordering::Relaxed),
            classification_misses: self.classification_misses.load(Ordering::Relaxed),
        }
    }

    pub fn feature_len(&self) -> usize {
        self.features.lock().expect("cache poisoned").len()
    }

    fn count(&self, hits: &AtomicU64, misses: &AtomicU64, hit: bool) {
        if hit {
            hits.fetch_add(1, Ordering::Relaxed);
        } else {
            misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}
