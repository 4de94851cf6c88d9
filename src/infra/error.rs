use thiserror::Error;

use crate::cache::{EndpointKind, Payload};
use crate::config::LoadError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("query engine requires a running Tokio runtime")]
    NoRuntime,
    #[error("unknown endpoint `{endpoint}`")]
    UnknownEndpoint { endpoint: String },
    #[error("endpoint `{endpoint}` is a {actual} endpoint, expected a {expected} endpoint")]
    WrongEndpointKind {
        endpoint: String,
        expected: EndpointKind,
        actual: EndpointKind,
    },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {0}")]
    Configuration(#[from] LoadError),
}

impl EngineError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

/// Outcome errors of the lifecycle bridges.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    /// The entry was removed before it ever received a value.
    #[error("cache entry was removed before it resolved")]
    NeverResolved,
    #[error("request rejected: {error}")]
    Rejected { error: Payload },
}
