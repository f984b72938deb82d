//! Generic TTL memo-cache with bulk eviction

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

struct MemoEntry<T> {
    value: T,
    stored_at: DateTime<Utc>,
}

/// Memoizes the results of expensive async computations by key.
///
/// An entry is served while younger than the caller-supplied TTL; once the
/// cache grows past `max_size`, the oldest ~20% of entries are evicted in
/// one sweep.
pub struct MemoCache<T> {
    entries: Mutex<HashMap<String, MemoEntry<T>>>,
    max_size: usize,
}

impl<T: Clone> MemoCache<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size: max_size.max(1),
        }
    }

    /// Return the memoized value for `key` if still within `ttl`,
    /// otherwise run `compute`, store its result, and return it.
    pub async fn with_cache<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let now = Utc::now();
        let max_age = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero());

        if let Some(entry) = self.entries.lock().unwrap().get(key) {
            if now - entry.stored_at <= max_age {
                debug!("memo hit for {:?}", key);
                return Ok(entry.value.clone());
            }
        }

        let value = compute().await?;
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            MemoEntry {
                value: value.clone(),
                stored_at: now,
            },
        );
        if entries.len() > self.max_size {
            Self::evict_oldest(&mut entries);
        }
        Ok(value)
    }

    /// Drop the oldest ~20% of entries (at least one).
    fn evict_oldest(entries: &mut HashMap<String, MemoEntry<T>>) {
        let evict_count = (entries.len() / 5).max(1);
        let mut by_age: Vec<(String, DateTime<Utc>)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.stored_at))
            .collect();
        by_age.sort_by_key(|(_, stored_at)| *stored_at);
        for (key, _) in by_age.into_iter().take(evict_count) {
            entries.remove(&key);
        }
        debug!("memo cache evicted {} oldest entries", evict_count);
    }

    /// Forget a single key.
    pub fn invalidate(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
