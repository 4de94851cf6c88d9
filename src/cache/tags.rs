//! Invalidation tags.
//!
//! A tag is either `{type}` (matches every id of that type) or `{type, id}`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::payload::Payload;

/// Tag identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagId {
    Int(i64),
    Str(String),
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagId::Int(id) => write!(f, "{id}"),
            TagId::Str(id) => f.write_str(id),
        }
    }
}

impl From<i64> for TagId {
    fn from(value: i64) -> Self {
        TagId::Int(value)
    }
}

impl From<i32> for TagId {
    fn from(value: i32) -> Self {
        TagId::Int(value.into())
    }
}

impl From<&str> for TagId {
    fn from(value: &str) -> Self {
        TagId::Str(value.to_string())
    }
}

impl From<String> for TagId {
    fn from(value: String) -> Self {
        TagId::Str(value)
    }
}

/// Declarative label attached to cached data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TagId>,
}

impl Tag {
    /// A type-only tag.
    pub fn of(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }

    pub fn with_id(kind: impl Into<String>, id: impl Into<TagId>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.into()),
        }
    }
}

impl From<&str> for Tag {
    fn from(kind: &str) -> Self {
        Tag::of(kind)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{id}", self.kind),
            None => f.write_str(&self.kind),
        }
    }
}

/// Inputs handed to a tag callback.
#[derive(Debug, Clone, Copy)]
pub struct TagInput<'a> {
    pub result: Option<&'a Payload>,
    pub error: Option<&'a Payload>,
    pub args: &'a Payload,
}

pub type TagsFn = Arc<dyn Fn(TagInput<'_>) -> Vec<Tag> + Send + Sync>;

/// Tags declared by an endpoint, either fixed or computed from the outcome.
#[derive(Clone, Default)]
pub enum TagSource {
    #[default]
    None,
    Fixed(Vec<Tag>),
    Derived(TagsFn),
}

impl TagSource {
    pub fn resolve(&self, input: TagInput<'_>) -> Vec<Tag> {
        let mut tags = match self {
            TagSource::None => Vec::new(),
            TagSource::Fixed(tags) => tags.clone(),
            TagSource::Derived(f) => f(input),
        };
        tags.sort();
        tags.dedup();
        tags
    }

    pub fn is_none(&self) -> bool {
        matches!(self, TagSource::None)
    }
}

impl fmt::Debug for TagSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagSource::None => f.write_str("None"),
            TagSource::Fixed(tags) => f.debug_tuple("Fixed").field(tags).finish(),
            TagSource::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}
