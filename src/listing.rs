use std::collections::HashMap;
use std::io;
use std::time::SystemTime;

use tracing::debug;

use crate::handle::EntryMetadata;
use crate::path::FsPath;

/// One child of a remote directory as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl RemoteEntry {
    pub fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            is_dir: self.is_dir,
            size: self.size,
            modified: self.modified,
        }
    }
}

/// Last fetched listing per remote directory.
///
/// Entries stay valid until a mutation inside the directory evicts them;
/// changes made by other clients are not observed before that.
#[derive(Debug, Default)]
pub struct ListingCache {
    listings: HashMap<String, Vec<RemoteEntry>>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_fetch<F>(&mut self, dir: &str, fetch: F) -> io::Result<&[RemoteEntry]>
    where
        F: FnOnce(&str) -> io::Result<Vec<RemoteEntry>>,
    {
        if !self.listings.contains_key(dir) {
            let entries = fetch(dir)?
                .into_iter()
                .filter(|entry| entry.name != "." && entry.name != "..")
                .collect();
            debug!(dir, "listing fetched");
            self.listings.insert(dir.to_string(), entries);
        }
        Ok(self
            .listings
            .get(dir)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    pub fn evict(&mut self, dir: &str) {
        if self.listings.remove(dir).is_some() {
            debug!(dir, "listing evicted");
        }
    }

    /// Drops the listing of the directory that contains `path`.
    pub fn evict_parent_of(&mut self, path: &FsPath) {
        self.evict(path.parent_path().as_str());
    }

    pub fn contains(&self, dir: &str) -> bool {
        self.listings.contains_key(dir)
    }

    pub fn clear(&mut self) {
        self.listings.clear();
    }
}

pub fn find_entry<'a>(entries: &'a [RemoteEntry], name: &str) -> Option<&'a RemoteEntry> {
    entries.iter().find(|entry| entry.name == name)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io;

    use super::{ListingCache, RemoteEntry};
    use crate::path::FsPath;

    fn entry(name: &str, is_dir: bool) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            is_dir,
            size: 0,
            modified: None,
        }
    }

    #[test]
    fn second_lookup_is_served_from_cache() {
        let mut cache = ListingCache::new();
        let calls = Cell::new(0);
        let fetch = |_: &str| {
            calls.set(calls.get() + 1);
            Ok(vec![entry("a", true), entry("b", false)])
        };

        let first: Vec<RemoteEntry> = cache.get_or_fetch("/d", fetch).expect("fetch").to_vec();
        let second: Vec<RemoteEntry> = cache.get_or_fetch("/d", fetch).expect("cached").to_vec();
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn eviction_forces_refetch() {
        let mut cache = ListingCache::new();
        let calls = Cell::new(0);
        let fetch = |_: &str| {
            calls.set(calls.get() + 1);
            Ok(vec![entry("a", false)])
        };

        cache.get_or_fetch("/d", fetch).expect("fetch");
        cache.evict_parent_of(&FsPath::new("/d/a"));
        assert!(!cache.contains("/d"));
        cache.get_or_fetch("/d", fetch).expect("refetch");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn dot_entries_are_dropped() {
        let mut cache = ListingCache::new();
        let entries = cache
            .get_or_fetch("/", |_| Ok(vec![entry(".", true), entry("..", true), entry("x", false)]))
            .expect("fetch");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "x");
    }

    #[test]
    fn failed_fetch_is_not_cached() {
        let mut cache = ListingCache::new();
        let err = cache
            .get_or_fetch("/d", |_| Err(io::Error::other("boom")))
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(!cache.contains("/d"));
    }
}
