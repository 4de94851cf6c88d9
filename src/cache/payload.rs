//! Dynamic payload tree.
//!
//! Arguments, results, errors and meta all travel through the engine as a
//! [`Payload`]. Arrays and objects are reference counted so that a refetch
//! returning unchanged sub-trees can hand consumers the exact same allocation
//! they already hold (see [`Payload::share_with`]).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Object representation used by [`Payload::Object`].
pub type PayloadMap = BTreeMap<String, Payload>;

/// A tagged value tree with shared interior nodes.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(Arc<str>),
    Array(Arc<Vec<Payload>>),
    Object(Arc<PayloadMap>),
}

impl Payload {
    /// Build an object payload from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Payload)>,
    {
        Self::Object(Arc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Build an array payload.
    pub fn array(items: impl IntoIterator<Item = Payload>) -> Self {
        Self::Array(Arc::new(items.into_iter().collect()))
    }

    /// Serialize any value into a payload.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::from)
    }

    /// Deserialize the payload into a concrete type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json())
    }

    pub fn to_json(&self) -> Value {
        match self {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(*b),
            Payload::Number(n) => Value::Number(n.clone()),
            Payload::String(s) => Value::String(s.to_string()),
            Payload::Array(items) => Value::Array(items.iter().map(Payload::to_json).collect()),
            Payload::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Payload::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Payload]> {
        match self {
            Payload::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&PayloadMap> {
        match self {
            Payload::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a field of an object payload.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Identity comparison: shared nodes compare by pointer, scalars by value.
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::Array(a), Payload::Array(b)) => Arc::ptr_eq(a, b),
            (Payload::Object(a), Payload::Object(b)) => Arc::ptr_eq(a, b),
            (Payload::String(a), Payload::String(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => self == other,
        }
    }

    /// Merge `new` into `old`, reusing every sub-tree of `old` whose content
    /// is unchanged.
    ///
    /// When nothing changed at all the returned payload is pointer-identical
    /// to `old`.
    pub fn share_with(old: &Payload, new: Payload) -> Payload {
        match (old, new) {
            (Payload::Object(old_map), Payload::Object(new_map)) => {
                let mut unchanged = old_map.len() == new_map.len();
                let mut merged = PayloadMap::new();
                for (key, new_child) in Arc::unwrap_or_clone(new_map) {
                    let child = match old_map.get(&key) {
                        Some(old_child) => {
                            let shared = Payload::share_with(old_child, new_child);
                            unchanged &= shared.ptr_eq(old_child);
                            shared
                        }
                        None => {
                            unchanged = false;
                            new_child
                        }
                    };
                    merged.insert(key, child);
                }
                if unchanged {
                    old.clone()
                } else {
                    Payload::Object(Arc::new(merged))
                }
            }
            (Payload::Array(old_items), Payload::Array(new_items)) => {
                let mut unchanged = old_items.len() == new_items.len();
                let merged: Vec<Payload> = Arc::unwrap_or_clone(new_items)
                    .into_iter()
                    .enumerate()
                    .map(|(idx, new_child)| match old_items.get(idx) {
                        Some(old_child) => {
                            let shared = Payload::share_with(old_child, new_child);
                            unchanged &= shared.ptr_eq(old_child);
                            shared
                        }
                        None => {
                            unchanged = false;
                            new_child
                        }
                    })
                    .collect();
                if unchanged {
                    old.clone()
                } else {
                    Payload::Array(Arc::new(merged))
                }
            }
            (old, new) if *old == new => old.clone(),
            (_, new) => new,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::String(s.into()),
            Value::Array(items) => Payload::array(items.into_iter().map(Payload::from)),
            Value::Object(map) => Payload::object(map.into_iter().map(|(k, v)| (k, v.into()))),
        }
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        payload.to_json()
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::String(value.into())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::String(value.into())
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Number(value.into())
    }
}

impl From<u64> for Payload {
    fn from(value: u64) -> Self {
        Payload::Number(value.into())
    }
}

impl From<i32> for Payload {
    fn from(value: i32) -> Self {
        Payload::Number(value.into())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_conversion_preserves_content() {
        let value = json!({"id": 1, "tags": ["a", "b"], "nested": {"ok": true}});
        let payload = Payload::from(value.clone());
        assert_eq!(payload.to_json(), value);
        assert_eq!(payload.get("id").and_then(Payload::as_i64), Some(1));
    }

    #[test]
    fn unchanged_tree_keeps_old_allocation() {
        let old = Payload::from(json!({"posts": [{"id": 1}, {"id": 2}], "total": 2}));
        let new = Payload::from(json!({"posts": [{"id": 1}, {"id": 2}], "total": 2}));
        assert!(!old.ptr_eq(&new));

        let shared = Payload::share_with(&old, new);
        assert!(shared.ptr_eq(&old));
    }

    #[test]
    fn changed_leaf_only_replaces_its_ancestors() {
        let old = Payload::from(json!({"posts": [{"id": 1}, {"id": 2}], "meta": {"page": 1}}));
        let new = Payload::from(json!({"posts": [{"id": 1}, {"id": 3}], "meta": {"page": 1}}));

        let shared = Payload::share_with(&old, new);
        assert!(!shared.ptr_eq(&old));

        let old_meta = old.get("meta").expect("meta");
        let new_meta = shared.get("meta").expect("meta");
        assert!(new_meta.ptr_eq(old_meta));

        let old_first = &old.get("posts").and_then(Payload::as_array).expect("posts")[0];
        let new_first = &shared.get("posts").and_then(Payload::as_array).expect("posts")[0];
        assert!(new_first.ptr_eq(old_first));
        assert_eq!(
            shared.to_json(),
            json!({"posts": [{"id": 1}, {"id": 3}], "meta": {"page": 1}})
        );
    }

    #[test]
    fn removed_key_produces_new_object() {
        let old = Payload::from(json!({"a": 1, "b": 2}));
        let new = Payload::from(json!({"a": 1}));
        let shared = Payload::share_with(&old, new);
        assert!(!shared.ptr_eq(&old));
        assert_eq!(shared.to_json(), json!({"a": 1}));
    }

    #[test]
    fn serde_round_trip_through_value() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Post {
            id: u32,
            title: String,
        }

        let post = Post {
            id: 7,
            title: "hello".to_string(),
        };
        let payload = Payload::from_serializable(&post).expect("serializable");
        let back: Post = payload.deserialize().expect("deserializable");
        assert_eq!(back, post);
    }
}
