//! Fetch collaborator boundary.
//!
//! The engine never talks to a transport directly. Each endpoint owns a
//! [`BaseQuery`] that turns arguments into a [`FetchResult`] carrying exactly
//! one of `data` or `error`.

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::endpoint::EndpointKind;
use super::keys::RequestId;
use super::payload::Payload;

/// Per-call context handed to the fetch collaborator.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub endpoint: String,
    pub kind: EndpointKind,
    pub request_id: RequestId,
    /// Whether the call bypassed cached data.
    pub forced: bool,
    /// Cancelled when the consumer aborts the request.
    pub signal: CancellationToken,
}

/// Raw outcome reported by a fetch collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    pub data: Option<Payload>,
    pub error: Option<Payload>,
    pub meta: Option<Payload>,
}

/// Outcome after contract validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Data {
        data: Payload,
        meta: Option<Payload>,
    },
    Error {
        error: Payload,
        meta: Option<Payload>,
    },
}

/// A fetch result that does not honour the `{data} | {error}` contract.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("fetch result carries both `data` and `error`")]
    BothDataAndError,
    #[error("fetch result carries neither `data` nor `error`")]
    NeitherDataNorError,
    #[error("fetch result carries unknown field `{0}`")]
    UnknownField(String),
    #[error("fetch result is not an object")]
    NotAnObject,
}

impl FetchResult {
    pub fn ok(data: impl Into<Payload>) -> Self {
        Self {
            data: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn err(error: impl Into<Payload>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_meta(mut self, meta: impl Into<Payload>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    /// Read a result from a dynamic `{data?, error?, meta?}` object.
    pub fn from_payload(payload: &Payload) -> Result<Self, ContractViolation> {
        let map = payload.as_object().ok_or(ContractViolation::NotAnObject)?;
        if let Some(field) = map
            .keys()
            .find(|key| !matches!(key.as_str(), "data" | "error" | "meta"))
        {
            return Err(ContractViolation::UnknownField(field.clone()));
        }
        Ok(Self {
            data: map.get("data").cloned(),
            error: map.get("error").cloned(),
            meta: map.get("meta").cloned(),
        })
    }

    pub fn validate(self) -> Result<Fetched, ContractViolation> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(Fetched::Data {
                data,
                meta: self.meta,
            }),
            (None, Some(error)) => Ok(Fetched::Error {
                error,
                meta: self.meta,
            }),
            (Some(_), Some(_)) => Err(ContractViolation::BothDataAndError),
            (None, None) => Err(ContractViolation::NeitherDataNorError),
        }
    }
}

/// Shape used for errors the engine raises itself (aborts, contract
/// violations, panics).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::new("AbortError", "Aborted")
    }

    pub fn into_payload(self) -> Payload {
        Payload::object([
            ("name", Payload::from(self.name)),
            ("message", Payload::from(self.message)),
        ])
    }
}

impl From<&ContractViolation> for SerializedError {
    fn from(violation: &ContractViolation) -> Self {
        Self::new("ContractViolation", violation.to_string())
    }
}

/// The fetch collaborator.
#[async_trait]
pub trait BaseQuery: Send + Sync {
    async fn execute(&self, args: Payload, ctx: FetchContext) -> FetchResult;
}

#[async_trait]
impl<F, Fut> BaseQuery for F
where
    F: Fn(Payload, FetchContext) -> Fut + Send + Sync,
    Fut: Future<Output = FetchResult> + Send + 'static,
{
    async fn execute(&self, args: Payload, ctx: FetchContext) -> FetchResult {
        (self)(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn data_only_is_valid() {
        let fetched = FetchResult::ok("x").validate().expect("valid");
        assert!(matches!(fetched, Fetched::Data { .. }));
    }

    #[test]
    fn error_with_meta_is_valid() {
        let fetched = FetchResult::err("boom")
            .with_meta(Payload::from(json!({"status": 500})))
            .validate()
            .expect("valid");
        match fetched {
            Fetched::Error { error, meta } => {
                assert_eq!(error.as_str(), Some("boom"));
                assert!(meta.is_some());
            }
            Fetched::Data { .. } => panic!("expected error outcome"),
        }
    }

    #[test]
    fn both_or_neither_is_a_violation() {
        let both = FetchResult {
            data: Some("x".into()),
            error: Some("y".into()),
            meta: None,
        };
        assert_eq!(both.validate(), Err(ContractViolation::BothDataAndError));
        assert_eq!(
            FetchResult::default().validate(),
            Err(ContractViolation::NeitherDataNorError)
        );
    }

    #[test]
    fn dynamic_result_rejects_unknown_fields() {
        let payload = Payload::from(json!({"data": 1, "status": 200}));
        assert_eq!(
            FetchResult::from_payload(&payload),
            Err(ContractViolation::UnknownField("status".to_string()))
        );
        assert_eq!(
            FetchResult::from_payload(&Payload::from(json!([1]))),
            Err(ContractViolation::NotAnObject)
        );

        let payload = Payload::from(json!({"data": 1, "meta": {"etag": "x"}}));
        let result = FetchResult::from_payload(&payload).expect("known fields");
        assert_eq!(result.data, Some(Payload::from(json!(1))));
    }

    #[tokio::test]
    async fn closures_are_base_queries() {
        let fetcher = |args: Payload, _ctx: FetchContext| async move { FetchResult::ok(args) };
        let ctx = FetchContext {
            endpoint: "echo".to_string(),
            kind: EndpointKind::Query,
            request_id: RequestId::new(),
            forced: false,
            signal: CancellationToken::new(),
        };
        let result = fetcher.execute(Payload::from("hi"), ctx).await;
        assert_eq!(result.data.as_ref().and_then(Payload::as_str), Some("hi"));
    }
}
