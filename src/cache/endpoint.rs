//! Endpoint definitions and the immutable endpoint registry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::infra::error::EngineError;

use super::fetch::BaseQuery;
use super::keys::{CacheKey, KeyStrategy};
use super::lifecycle::{CacheEntryContext, QueryStartedContext};
use super::payload::Payload;
use super::tags::{Tag, TagInput, TagSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Query,
    Mutation,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::Query => "query",
            EndpointKind::Mutation => "mutation",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(cached, incoming, args) -> merged`
pub type MergeFn = Arc<dyn Fn(&Payload, Payload, &Payload) -> Payload + Send + Sync>;
/// `(args, previous_args) -> force`
pub type ForceRefetchFn = Arc<dyn Fn(&Payload, Option<&Payload>) -> bool + Send + Sync>;
pub type QueryStartedHook = Arc<dyn Fn(QueryStartedContext) -> BoxFuture<'static, ()> + Send + Sync>;
pub type CacheEntryHook = Arc<dyn Fn(CacheEntryContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Declaration of one query or mutation endpoint.
pub struct EndpointDefinition {
    kind: EndpointKind,
    fetcher: Arc<dyn BaseQuery>,
    provides: TagSource,
    invalidates: TagSource,
    keep_unused_data_for: Option<Duration>,
    structural_sharing: bool,
    key_strategy: KeyStrategy,
    merge: Option<MergeFn>,
    force_refetch: Option<ForceRefetchFn>,
    on_query_started: Option<QueryStartedHook>,
    on_cache_entry_added: Option<CacheEntryHook>,
}

impl EndpointDefinition {
    pub fn query(fetcher: impl BaseQuery + 'static) -> Self {
        Self::new(EndpointKind::Query, Arc::new(fetcher))
    }

    pub fn mutation(fetcher: impl BaseQuery + 'static) -> Self {
        Self::new(EndpointKind::Mutation, Arc::new(fetcher))
    }

    fn new(kind: EndpointKind, fetcher: Arc<dyn BaseQuery>) -> Self {
        Self {
            kind,
            fetcher,
            provides: TagSource::None,
            invalidates: TagSource::None,
            keep_unused_data_for: None,
            structural_sharing: true,
            key_strategy: KeyStrategy::Structural,
            merge: None,
            force_refetch: None,
            on_query_started: None,
            on_cache_entry_added: None,
        }
    }

    /// Fixed tags provided by every successful result.
    pub fn provides(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.provides = TagSource::Fixed(tags.into_iter().collect());
        self
    }

    pub fn provides_with<F>(mut self, f: F) -> Self
    where
        F: Fn(TagInput<'_>) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.provides = TagSource::Derived(Arc::new(f));
        self
    }

    pub fn invalidates(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.invalidates = TagSource::Fixed(tags.into_iter().collect());
        self
    }

    pub fn invalidates_with<F>(mut self, f: F) -> Self
    where
        F: Fn(TagInput<'_>) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.invalidates = TagSource::Derived(Arc::new(f));
        self
    }

    /// Overrides the engine-wide retention of unsubscribed entries.
    pub fn keep_unused_data_for(mut self, ttl: Duration) -> Self {
        self.keep_unused_data_for = Some(ttl);
        self
    }

    pub fn structural_sharing(mut self, enabled: bool) -> Self {
        self.structural_sharing = enabled;
        self
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    pub fn serialize_args_with<F>(self, f: F) -> Self
    where
        F: Fn(&str, &Payload) -> CacheKey + Send + Sync + 'static,
    {
        self.key_strategy(KeyStrategy::Custom(Arc::new(f)))
    }

    /// Merge incoming data into the cached value instead of replacing it.
    pub fn merge_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Payload, Payload, &Payload) -> Payload + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(f));
        self
    }

    pub fn force_refetch_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Payload, Option<&Payload>) -> bool + Send + Sync + 'static,
    {
        self.force_refetch = Some(Arc::new(f));
        self
    }

    pub fn on_query_started<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(QueryStartedContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_query_started = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    pub fn on_cache_entry_added<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(CacheEntryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_cache_entry_added = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub(crate) fn fetcher(&self) -> Arc<dyn BaseQuery> {
        Arc::clone(&self.fetcher)
    }

    pub(crate) fn cache_key(&self, endpoint: &str, args: &Payload) -> CacheKey {
        self.key_strategy.derive(endpoint, args)
    }

    pub(crate) fn provided_tags(&self, input: TagInput<'_>) -> Vec<Tag> {
        self.provides.resolve(input)
    }

    pub(crate) fn invalidated_tags(&self, input: TagInput<'_>) -> Vec<Tag> {
        self.invalidates.resolve(input)
    }

    pub(crate) fn keep_unused_override(&self) -> Option<Duration> {
        self.keep_unused_data_for
    }

    /// Combine cached and incoming data per the endpoint's merge policy.
    pub(crate) fn merge_data(&self, cached: Option<&Payload>, incoming: Payload, args: &Payload) -> Payload {
        match (cached, &self.merge) {
            (Some(cached), Some(merge)) => merge(cached, incoming, args),
            (Some(cached), None) if self.structural_sharing => Payload::share_with(cached, incoming),
            _ => incoming,
        }
    }

    pub(crate) fn forces_refetch(&self, args: &Payload, previous: Option<&Payload>) -> bool {
        self.force_refetch
            .as_ref()
            .is_some_and(|predicate| predicate(args, previous))
    }

    pub(crate) fn query_started_hook(&self) -> Option<&QueryStartedHook> {
        self.on_query_started.as_ref()
    }

    pub(crate) fn cache_entry_hook(&self) -> Option<&CacheEntryHook> {
        self.on_cache_entry_added.as_ref()
    }
}

impl fmt::Debug for EndpointDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDefinition")
            .field("kind", &self.kind)
            .field("provides", &self.provides)
            .field("invalidates", &self.invalidates)
            .field("keep_unused_data_for", &self.keep_unused_data_for)
            .field("structural_sharing", &self.structural_sharing)
            .field("key_strategy", &self.key_strategy)
            .finish_non_exhaustive()
    }
}

/// Immutable registry of named endpoints.
#[derive(Debug, Clone, Default)]
pub struct Api {
    endpoints: Arc<HashMap<String, Arc<EndpointDefinition>>>,
}

impl Api {
    pub fn builder() -> ApiBuilder {
        ApiBuilder::default()
    }

    pub fn endpoint(&self, name: &str) -> Result<&Arc<EndpointDefinition>, EngineError> {
        self.endpoints
            .get(name)
            .ok_or_else(|| EngineError::UnknownEndpoint {
                endpoint: name.to_string(),
            })
    }

    /// Look up an endpoint and check that it has the expected kind.
    pub fn expect(
        &self,
        name: &str,
        kind: EndpointKind,
    ) -> Result<&Arc<EndpointDefinition>, EngineError> {
        let definition = self.endpoint(name)?;
        if definition.kind != kind {
            return Err(EngineError::WrongEndpointKind {
                endpoint: name.to_string(),
                expected: kind,
                actual: definition.kind,
            });
        }
        Ok(definition)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ApiBuilder {
    endpoints: HashMap<String, Arc<EndpointDefinition>>,
}

impl ApiBuilder {
    /// Register an endpoint; a later registration under the same name wins.
    pub fn endpoint(mut self, name: impl Into<String>, definition: EndpointDefinition) -> Self {
        self.endpoints.insert(name.into(), Arc::new(definition));
        self
    }

    pub fn build(self) -> Api {
        Api {
            endpoints: Arc::new(self.endpoints),
        }
    }
}
