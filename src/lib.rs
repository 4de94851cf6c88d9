//! Quarry: a keyed async query and mutation cache.
//!
//! See [`cache`] for the engine, [`config`] for layered settings and
//! [`infra::telemetry`] for logging setup.

pub mod cache;
pub mod config;
pub mod infra;

pub use cache::{
    Api, EndpointDefinition, FetchContext, FetchResult, MutationOptions, Payload, QueryEngine,
    StartQueryOptions, Tag,
};
pub use infra::error::{EngineError, LifecycleError};
