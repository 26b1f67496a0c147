//! Composable transforms executed against a job's payload.
//!
//! A pipeline is a chain of [`Runnable`]s. Each runnable maps a JSON value to
//! the next, with read access to the job's dispatch metadata through
//! [`Context`]. Chains are built with `|`:
//!
//! ```
//! use aimq::pipeline::{Context, Runnable, assign, constant, select};
//!
//! # tokio_test::block_on(async {
//! let pipeline = select(["a"]) | assign([("b", constant(serde_json::json!(2)))]);
//! let out = pipeline
//!     .invoke(serde_json::json!({"a": 1, "c": 3}), &Context::default())
//!     .await
//!     .unwrap();
//! assert_eq!(out, serde_json::json!({"a": 1, "b": 2}));
//! # });
//! ```

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::ops::BitOr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod transform;

pub use transform::{assign, constant, echo, from_fn, original, select};
pub use transform::{AssignSource, SelectKeys};

/// The mapping type pipelines operate on.
pub type Object = Map<String, Value>;

/// Deterministic failure during pipeline execution, tagged with the failing
/// transform. The queue processor archives the job when it sees one.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
#[error("transform `{transform}` failed: {kind}")]
pub struct PipelineError {
    pub transform: String,
    pub kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PipelineErrorKind {
    #[error("expected a mapping, got {0}")]
    TypeMismatch(String),

    #[error("original context has no key `{0}`")]
    MissingOriginal(String),

    #[error("{0}")]
    Failed(String),
}

impl PipelineError {
    pub fn new(transform: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            transform: transform.into(),
            kind,
        }
    }

    /// A failure raised by user code inside a transform.
    pub fn failed(transform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(transform, PipelineErrorKind::Failed(message.into()))
    }

    pub(crate) fn type_mismatch(transform: impl Into<String>, value: &Value) -> Self {
        Self::new(
            transform,
            PipelineErrorKind::TypeMismatch(crate::job::json_type_name(value).to_owned()),
        )
    }
}

/// Side-channel data available to every transform during a job's execution.
///
/// `original` carries the job's dispatch metadata (`queue`, `message_id`,
/// `read_count`, `enqueued_at`, `tags`). The cancellation token is observed
/// by cooperative runnables at their suspension points; it fires when the
/// job's deadline passes or the worker shuts down.
#[derive(Debug, Clone, Default)]
pub struct Context {
    original: Object,
    cancellation: CancellationToken,
}

impl Context {
    pub fn new(original: Object) -> Self {
        Self {
            original,
            cancellation: CancellationToken::new(),
        }
    }

    pub(crate) fn with_cancellation(original: Object, cancellation: CancellationToken) -> Self {
        Self {
            original,
            cancellation,
        }
    }

    pub fn original(&self) -> &Object {
        &self.original
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// The unit of pipeline composition: anything that can transform one value
/// into the next. Implementations must be deterministic given the same value
/// and context.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn invoke(&self, value: Value, context: &Context) -> Result<Value, PipelineError>;

    /// Name used in logs and error envelopes.
    fn name(&self) -> &str;
}

/// Cloneable handle to a [`Runnable`], composable with `|`.
#[derive(Clone)]
pub struct Transform {
    inner: Arc<dyn Runnable>,
}

impl Transform {
    pub fn new(runnable: impl Runnable + 'static) -> Self {
        Self {
            inner: Arc::new(runnable),
        }
    }

    /// Sequence `self` before `next`.
    pub fn pipe(self, next: Transform) -> Transform {
        Transform::new(Chain::new(self, next))
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform")
            .field("name", &self.inner.name())
            .finish()
    }
}

#[async_trait]
impl Runnable for Transform {
    async fn invoke(&self, value: Value, context: &Context) -> Result<Value, PipelineError> {
        self.inner.invoke(value, context).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl BitOr for Transform {
    type Output = Transform;

    fn bitor(self, rhs: Transform) -> Transform {
        self.pipe(rhs)
    }
}

struct Chain {
    first: Transform,
    second: Transform,
    name: String,
}

impl Chain {
    fn new(first: Transform, second: Transform) -> Self {
        let name = format!("{} | {}", first.name(), second.name());
        Self {
            first,
            second,
            name,
        }
    }
}

#[async_trait]
impl Runnable for Chain {
    async fn invoke(&self, value: Value, context: &Context) -> Result<Value, PipelineError> {
        let value = self.first.invoke(value, context).await?;
        self.second.invoke(value, context).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn composition_feeds_left_output_to_right() {
        let pipeline = select(["a", "b"]) | select(["a"]);
        let out = pipeline
            .invoke(
                serde_json::json!({"a": 1, "b": 2, "c": 3}),
                &Context::default(),
            )
            .await
            .unwrap();

        assert_eq!(out, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn composition_is_associative() {
        let a = || select(["a", "b", "c"]);
        let b = || select(["a", "b"]);
        let c = || select(["a"]);
        let input = serde_json::json!({"a": 1, "b": 2, "c": 3, "d": 4});

        let left = ((a() | b()) | c())
            .invoke(input.clone(), &Context::default())
            .await
            .unwrap();
        let right = (a() | (b() | c()))
            .invoke(input, &Context::default())
            .await
            .unwrap();

        assert_eq!(left, right);
    }

    #[tokio::test]
    async fn chain_surfaces_the_failing_transform() {
        let pipeline = select(["a"]) | original("missing");
        let err = pipeline
            .invoke(serde_json::json!({"a": 1}), &Context::default())
            .await
            .unwrap_err();

        assert_eq!(err.transform, "original");
        assert!(matches!(err.kind, PipelineErrorKind::MissingOriginal(_)));
    }

    #[test]
    fn chain_name_reflects_its_stages() {
        let pipeline = echo() | select(["a"]);
        assert_eq!(pipeline.name(), "echo | select");
    }
}
