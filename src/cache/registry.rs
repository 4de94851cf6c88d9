//! Invalidation index.
//!
//! Tracks tag type → tag id (or the type-only bucket) → cache keys, plus the
//! reverse cache key → tags mapping so that removing an entry prunes every
//! reference to it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::keys::CacheKey;
use super::tags::{Tag, TagId};

/// Second-level bucket of the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagBucket {
    /// Keys that provided a type-only tag.
    Untyped,
    Id(TagId),
}

impl TagBucket {
    fn of(tag: &Tag) -> Self {
        match &tag.id {
            Some(id) => TagBucket::Id(id.clone()),
            None => TagBucket::Untyped,
        }
    }
}

/// Tag → cache key index with reverse mappings.
#[derive(Debug, Clone, Default)]
pub struct InvalidationIndex {
    by_tag: BTreeMap<String, BTreeMap<TagBucket, Vec<CacheKey>>>,
    by_key: HashMap<CacheKey, BTreeSet<Tag>>,
}

impl InvalidationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tags provided by `cache_key`.
    ///
    /// Previous references are dropped first; duplicate inserts are ignored.
    pub fn provide(&mut self, cache_key: &CacheKey, tags: &[Tag]) {
        self.unregister(cache_key);
        if tags.is_empty() {
            return;
        }

        let mut provided = BTreeSet::new();
        for tag in tags {
            let keys = self
                .by_tag
                .entry(tag.kind.clone())
                .or_default()
                .entry(TagBucket::of(tag))
                .or_default();
            if !keys.contains(cache_key) {
                keys.push(cache_key.clone());
            }
            provided.insert(tag.clone());
        }
        self.by_key.insert(cache_key.clone(), provided);
    }

    /// Remove every reference to `cache_key`.
    pub fn unregister(&mut self, cache_key: &CacheKey) {
        let Some(tags) = self.by_key.remove(cache_key) else {
            return;
        };

        for tag in tags {
            let Some(buckets) = self.by_tag.get_mut(&tag.kind) else {
                continue;
            };
            let bucket = TagBucket::of(&tag);
            if let Some(keys) = buckets.get_mut(&bucket) {
                keys.retain(|key| key != cache_key);
                if keys.is_empty() {
                    buckets.remove(&bucket);
                }
            }
            if buckets.is_empty() {
                self.by_tag.remove(&tag.kind);
            }
        }
    }

    /// Resolve tags to the ordered union of affected cache keys.
    ///
    /// `{type}` matches every bucket of that type, `{type, id}` only its own.
    pub fn resolve(&self, tags: &[Tag]) -> Vec<CacheKey> {
        let mut seen = BTreeSet::new();
        let mut resolved = Vec::new();
        for tag in tags {
            let Some(buckets) = self.by_tag.get(&tag.kind) else {
                continue;
            };
            let keys: Box<dyn Iterator<Item = &CacheKey>> = match &tag.id {
                None => Box::new(buckets.values().flatten()),
                Some(id) => Box::new(
                    buckets
                        .get(&TagBucket::Id(id.clone()))
                        .into_iter()
                        .flatten(),
                ),
            };
            for key in keys {
                if seen.insert(key.clone()) {
                    resolved.push(key.clone());
                }
            }
        }
        resolved
    }

    /// Tags currently provided by a cache key.
    pub fn tags_for_key(&self, cache_key: &CacheKey) -> Vec<Tag> {
        self.by_key
            .get(cache_key)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flat list of `(tag, key)` pairs, used for snapshots.
    pub fn entries(&self) -> Vec<(Tag, CacheKey)> {
        let mut entries = Vec::new();
        for (kind, buckets) in &self.by_tag {
            for (bucket, keys) in buckets {
                let tag = match bucket {
                    TagBucket::Untyped => Tag::of(kind.clone()),
                    TagBucket::Id(id) => Tag::with_id(kind.clone(), id.clone()),
                };
                for key in keys {
                    entries.push((tag.clone(), key.clone()));
                }
            }
        }
        entries
    }

    pub fn clear(&mut self) {
        self.by_tag.clear();
        self.by_key.clear();
    }

    /// Number of tracked tag types.
    pub fn type_count(&self) -> usize {
        self.by_tag.len()
    }

    /// Number of cache keys providing at least one tag.
    pub fn key_count(&self) -> usize {
        self.by_key.len()
    }
}
