use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::errors::AppResult;
use crate::model::{FilterCriteria, ListingSet, WeatherSnapshot};

/// Case- and whitespace-insensitive place identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PlaceKey(String);

impl PlaceKey {
    pub fn new(place: &str) -> Self {
        let normalized = place
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ListingsKey {
    pub place: PlaceKey,
    pub filters: FilterCriteria,
}

impl ListingsKey {
    pub fn new(place: &str, filters: &FilterCriteria) -> Self {
        Self {
            place: PlaceKey::new(place),
            filters: filters.normalized(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

/// Session-lifetime memo table. Entries are never evicted and failed fetches are
/// never stored.
pub struct KeyedCache<K, V> {
    entries: Arc<Mutex<HashMap<K, V>>>,
    hits: Arc<AtomicUsize>,
    misses: Arc<AtomicUsize>,
}

impl<K, V> Clone for KeyedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            hits: Arc::clone(&self.hits),
            misses: Arc::clone(&self.misses),
        }
    }
}

impl<K, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            hits: Arc::new(AtomicUsize::new(0)),
            misses: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.entries.lock().get(key).cloned();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(?key, "cache hit");
        }
        value
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.lock().insert(key, value);
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetcher: F) -> AppResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<V>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(?key, "cache miss");
        let value = fetcher().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Default)]
pub struct ResultCache {
    pub listings: KeyedCache<ListingsKey, ListingSet>,
    pub weather: KeyedCache<PlaceKey, WeatherSnapshot>,
    /// Keyed by listing id; images do not depend on filters.
    pub images: KeyedCache<String, String>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::errors::AppError;
    use crate::model::BathCount;

    #[tokio::test]
    async fn serves_second_lookup_from_memory() {
        let cache: KeyedCache<String, u32> = KeyedCache::default();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let value = cache
                .get_or_fetch("k".to_string(), move || async move {
                    Ok(calls.fetch_add(1, Ordering::SeqCst) + 10)
                })
                .await
                .unwrap();
            assert_eq!(value, 10);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache: KeyedCache<String, u32> = KeyedCache::default();

        let first = cache
            .get_or_fetch("k".to_string(), || async {
                Err(AppError::Remote("offline".into()))
            })
            .await;
        assert!(first.is_err());
        assert!(!cache.contains(&"k".to_string()));

        let second = cache
            .get_or_fetch("k".to_string(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(second, 7);
    }

    #[test]
    fn place_keys_ignore_case_and_spacing() {
        assert_eq!(PlaceKey::new("Nashville,  TN "), PlaceKey::new("nashville, tn"));
        assert_ne!(PlaceKey::new("Nashville, TN"), PlaceKey::new("Memphis, TN"));
    }

    #[test]
    fn any_filter_change_changes_listings_key() {
        let base = FilterCriteria::default();
        let key = ListingsKey::new("Nashville, TN", &base);
        assert_eq!(key, ListingsKey::new("nashville, tn", &base.clone()));

        let mut variants = Vec::new();
        let mut f = base.clone();
        f.price.min += 1;
        variants.push(f);
        let mut f = base.clone();
        f.price.max -= 1;
        variants.push(f);
        let mut f = base.clone();
        f.min_bedrooms = Some(3);
        variants.push(f);
        let mut f = base.clone();
        f.min_bathrooms = Some(BathCount::new(1.5));
        variants.push(f);
        let mut f = base.clone();
        f.property_type = Some(crate::model::PropertyType::House);
        variants.push(f);
        let mut f = base.clone();
        f.rent_to_own = true;
        variants.push(f);

        for variant in variants {
            assert_ne!(key, ListingsKey::new("Nashville, TN", &variant));
        }
    }
}
