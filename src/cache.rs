//! Process-wide resource cache shared by every discovery page
//!
//! Entries are keyed by the request URL without its fragment and live until
//! the cache is dropped. A disabled cache never returns or retains anything.

use crate::{normalize_url, Resource};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

pub fn cache_key(url: &str) -> String {
    normalize_url(url)
}

#[derive(Debug)]
pub struct ResourceCache {
    entries: DashMap<String, Arc<Resource>>,
    enabled: bool,
}

impl ResourceCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: DashMap::new(),
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn lookup(&self, url: &str) -> Option<Arc<Resource>> {
        if !self.enabled {
            return None;
        }

        self.entries
            .get(&cache_key(url))
            .map(|entry| entry.value().clone())
    }

    /// Store `resource` unless another writer got there first.
    ///
    /// Returns the entry that is cached for the key afterwards, which is the
    /// earlier winner on a race.
    pub fn store(&self, url: &str, resource: Resource) -> Arc<Resource> {
        if !self.enabled {
            return Arc::new(resource);
        }

        match self.entries.entry(cache_key(url)) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(vacant) => {
                debug!("Caching {} ({} bytes)", url, resource.size());
                vacant.insert(Arc::new(resource)).value().clone()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new(true)
    }
}
