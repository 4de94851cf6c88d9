//! Invalidation plan generation.
//!
//! Resolves a batch of tags against the invalidation index and splits the
//! affected entries into evictions and refetches.

use std::collections::BTreeSet;
use std::fmt;

use super::keys::CacheKey;
use super::payload::Payload;
use super::state::{ApiState, QueryStatus};
use super::tags::Tag;

/// An entry that must be refetched with its stored arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct RefetchTarget {
    pub cache_key: CacheKey,
    pub endpoint: String,
    pub args: Payload,
}

/// Actions produced by one invalidation run.
#[derive(Debug, Default, PartialEq)]
pub struct InvalidationPlan {
    /// Entries without subscribers, removed outright.
    pub evict: Vec<CacheKey>,
    /// Subscribed, initialized entries.
    pub refetch: Vec<RefetchTarget>,
    /// Resolved keys with no entry or an uninitialized one.
    pub skipped: usize,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ evict: {}, refetch: {}, skipped: {} }}",
            self.evict.len(),
            self.refetch.len(),
            self.skipped,
        )
    }
}

impl InvalidationPlan {
    /// Build a plan for `tags`.
    ///
    /// - Deduplicates tags
    /// - Resolves them to the ordered union of cache keys
    /// - Evicts unsubscribed entries, refetches the rest
    pub fn from_tags(state: &ApiState, tags: &[Tag]) -> Self {
        let mut plan = Self::default();
        let mut seen = BTreeSet::new();
        let tags: Vec<Tag> = tags
            .iter()
            .filter(|tag| seen.insert((*tag).clone()))
            .cloned()
            .collect();

        for cache_key in state.provided().resolve(&tags) {
            let Some(entry) = state.query(&cache_key) else {
                plan.skipped += 1;
                continue;
            };
            if state.subscriber_count(&cache_key) == 0 {
                plan.evict.push(cache_key);
            } else if entry.status == QueryStatus::Uninitialized {
                plan.skipped += 1;
            } else {
                plan.refetch.push(RefetchTarget {
                    cache_key,
                    endpoint: entry.endpoint.clone(),
                    args: entry.original_args.clone(),
                });
            }
        }

        plan
    }

    /// Number of affected keys.
    pub fn len(&self) -> usize {
        self.evict.len() + self.refetch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evict.is_empty() && self.refetch.is_empty()
    }
}
