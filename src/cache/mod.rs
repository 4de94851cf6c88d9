//! Keyed async query and mutation cache.
//!
//! - **Queries** are cached per [`CacheKey`], deduplicated while in flight,
//!   shared between subscribers and collected once unused.
//! - **Mutations** always execute and invalidate cached queries through
//!   [`Tag`]s.
//!
//! ## Usage
//!
//! ```no_run
//! use quarry::cache::{Api, EndpointDefinition, FetchContext, FetchResult, Payload, QueryEngine, StartQueryOptions, Tag};
//!
//! # async fn run() -> Result<(), quarry::EngineError> {
//! let api = Api::builder()
//!     .endpoint(
//!         "getPost",
//!         EndpointDefinition::query(|args: Payload, _ctx: FetchContext| async move {
//!             FetchResult::ok(args)
//!         })
//!         .provides([Tag::of("Post")]),
//!     )
//!     .build();
//!
//! let engine = QueryEngine::builder(api).build()?;
//! let post = engine.start_query("getPost", 1, StartQueryOptions::default())?.await;
//! assert!(post.is_success());
//! # Ok(())
//! # }
//! ```

mod collector;
mod endpoint;
mod engine;
mod environment;
mod events;
mod fetch;
mod initiate;
mod invalidation;
mod keys;
mod lifecycle;
mod lock;
mod orchestrator;
mod payload;
mod persist;
mod planner;
mod polling;
mod registry;
mod scheduler;
mod state;
mod tags;

pub use endpoint::{Api, ApiBuilder, EndpointDefinition, EndpointKind};
pub use engine::{EngineBuilder, QueryEngine, WeakEngine};
pub use environment::{EnvironmentSignal, ListenerHandle, setup_listeners};
pub use events::{Action, Epoch};
pub use fetch::{BaseQuery, ContractViolation, FetchContext, FetchResult, Fetched, SerializedError};
pub use initiate::{
    MutationHandle, MutationOptions, PrefetchOptions, QueryHandle, RunningOperation,
    StartQueryOptions,
};
pub use keys::{CacheKey, KeyStrategy, RequestId, derive_key, digest_key};
pub use lifecycle::{CacheEntryContext, EntryRemoved, QueryStartedContext, Settlement};
pub use payload::{Payload, PayloadMap};
pub use persist::{ProvidedTag, Snapshot};
pub use planner::{InvalidationPlan, RefetchTarget};
pub use registry::InvalidationIndex;
pub use state::{
    ApiState, Applied, ConfigState, DEFAULT_KEEP_UNUSED_DATA_FOR, InvalidationBehavior,
    MAX_TIMER_DELAY, MutationEntry, MutationResult, QueryEntry, QueryResult, QueryStatus,
    RefetchPolicy, SubscriptionOptions, Subscribers,
};
pub use tags::{Tag, TagId, TagInput};
