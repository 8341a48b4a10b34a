use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tl_types::TrialIndex;

use crate::wrapper::MetricData;

/// Cache key for fetched metric data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    trial_index: TrialIndex,
    metric: String,
}

/// Process-lifetime cache of fetched metric data, keyed by trial and metric.
///
/// Entries are created on first fetch and never expire; a re-fetch for the
/// same cell short-circuits here instead of calling the wrapper again.
#[derive(Debug, Default)]
pub struct FetchCache {
    entries: DashMap<CacheKey, MetricData>,
    stats: RwLock<CacheStats>,
}

impl FetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, trial_index: TrialIndex, metric: &str) -> Option<MetricData> {
        let key = CacheKey {
            trial_index,
            metric: metric.to_string(),
        };

        let found = self.entries.get(&key).map(|entry| entry.value().clone());

        {
            let mut stats = self.stats.write();
            match found {
                Some(_) => stats.hits += 1,
                None => stats.misses += 1,
            }
        }

        found
    }

    pub fn store(&self, trial_index: TrialIndex, metric: &str, data: MetricData) {
        let key = CacheKey {
            trial_index,
            metric: metric.to_string(),
        };
        self.entries.insert(key, data);
        self.stats.write().stores += 1;
    }

    pub fn contains(&self, trial_index: TrialIndex, metric: &str) -> bool {
        self.entries.contains_key(&CacheKey {
            trial_index,
            metric: metric.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        *self.stats.write() = CacheStats::default();
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.entries = self.entries.len() as u64;
        stats
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub entries: u64,
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
