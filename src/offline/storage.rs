// src/offline/storage.rs

use crate::fetch::HttpResponse;
use std::collections::HashMap;
use std::sync::RwLock;

/// Named buckets of cached responses, keyed by request URL.
///
/// Buckets keep their creation order; [`CacheStorage::match_any`] searches
/// them oldest first.
#[derive(Default)]
pub struct CacheStorage {
    buckets: RwLock<Vec<(String, HashMap<String, HttpResponse>)>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the bucket if it does not exist yet.
    pub fn open(&self, bucket: &str) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        if !buckets.iter().any(|(name, _)| name == bucket) {
            buckets.push((bucket.to_string(), HashMap::new()));
        }
    }

    pub fn put(&self, bucket: &str, key: &str, response: HttpResponse) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        match buckets.iter_mut().find(|(name, _)| name == bucket) {
            Some((_, entries)) => {
                entries.insert(key.to_string(), response);
            }
            None => {
                let mut entries = HashMap::new();
                entries.insert(key.to_string(), response);
                buckets.push((bucket.to_string(), entries));
            }
        }
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<HttpResponse> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets
            .iter()
            .find(|(name, _)| name == bucket)
            .and_then(|(_, entries)| entries.get(key).cloned())
    }

    /// First hit for `key` across every bucket.
    pub fn match_any(&self, key: &str) -> Option<HttpResponse> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets
            .iter()
            .find_map(|(_, entries)| entries.get(key).cloned())
    }

    pub fn keys(&self) -> Vec<String> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn delete(&self, bucket: &str) -> bool {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|(name, _)| name != bucket);
        buckets.len() != before
    }

    pub fn len(&self, bucket: &str) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets
            .iter()
            .find(|(name, _)| name == bucket)
            .map(|(_, entries)| entries.len())
            .unwrap_or(0)
    }
}
