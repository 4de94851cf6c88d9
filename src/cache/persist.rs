//! Serialized engine state used for rehydration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::keys::CacheKey;
use super::state::{ApiState, MutationEntry, QueryEntry};
use super::tags::Tag;

/// One `(tag, key)` pair of the invalidation index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidedTag {
    pub tag: Tag,
    pub cache_key: CacheKey,
}

/// Query, mutation and invalidation partitions of an engine.
///
/// Subscriptions and config are process-local and never persisted. Only
/// settled entries survive a [`rehydrate`](super::EngineBuilder::rehydrate).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub queries: BTreeMap<CacheKey, QueryEntry>,
    #[serde(default)]
    pub mutations: BTreeMap<CacheKey, MutationEntry>,
    #[serde(default)]
    pub provided: Vec<ProvidedTag>,
}

impl Snapshot {
    pub fn capture(state: &ApiState) -> Self {
        Self {
            queries: state
                .queries()
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect(),
            mutations: state
                .mutations()
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect(),
            provided: state
                .provided()
                .entries()
                .into_iter()
                .map(|(tag, cache_key)| ProvidedTag { tag, cache_key })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.mutations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::cache::keys::RequestId;
    use crate::cache::payload::Payload;
    use crate::cache::state::QueryStatus;

    #[test]
    fn snapshot_survives_json() {
        let key = CacheKey::from("getPost(1)");
        let mut snapshot = Snapshot::default();
        snapshot.queries.insert(
            key.clone(),
            QueryEntry {
                status: QueryStatus::Fulfilled,
                endpoint: "getPost".to_string(),
                original_args: Payload::from(1),
                request_id: RequestId::new(),
                data: Some(Payload::from("hello")),
                error: None,
                meta: None,
                started_at: OffsetDateTime::now_utc(),
                fulfilled_at: Some(OffsetDateTime::now_utc()),
                received_at: None,
            },
        );
        snapshot.provided.push(ProvidedTag {
            tag: Tag::with_id("Post", 1),
            cache_key: key.clone(),
        });

        let raw = snapshot.to_json().expect("serialize");
        let back = Snapshot::from_json(&raw).expect("deserialize");
        assert_eq!(back, snapshot);
        assert!(!back.is_empty());
    }
}
