//! The standard transforms and lifting for plain async functions.

use super::{Context, PipelineError, PipelineErrorKind, Runnable, Transform};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use tracing::info;

/// Log the current value at INFO and pass it through unchanged.
pub fn echo() -> Transform {
    Transform::new(Echo)
}

/// Restrict a mapping to the given keys. Missing keys are omitted.
pub fn select(keys: impl Into<SelectKeys>) -> Transform {
    Transform::new(Select {
        keys: keys.into().0,
    })
}

/// Merge new fields into the mapping. Each source is either a constant value
/// or a runnable evaluated against the incoming value; evaluation across
/// entries is independent. Scalar outputs land under the assigned field name.
pub fn assign<K, S, I>(fields: I) -> Transform
where
    K: Into<String>,
    S: Into<AssignSource>,
    I: IntoIterator<Item = (K, S)>,
{
    Transform::new(Assign {
        fields: fields
            .into_iter()
            .map(|(name, source)| (name.into(), source.into()))
            .collect(),
    })
}

/// A runnable that ignores its input and returns `value`.
pub fn constant(value: Value) -> Transform {
    Transform::new(Constant { value })
}

/// Read a field of the job's original metadata (`queue`, `message_id`,
/// `read_count`, `enqueued_at`, `tags`).
pub fn original(key: impl Into<String>) -> Transform {
    Transform::new(Original { key: key.into() })
}

/// Lift a plain async function into a [`Runnable`]. Errors raised by the
/// function are re-tagged with `name`.
pub fn from_fn<F, Fut>(name: impl Into<String>, func: F) -> Transform
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, PipelineError>> + Send + 'static,
{
    Transform::new(FnRunnable {
        name: name.into(),
        func,
    })
}

struct Echo;

#[async_trait]
impl Runnable for Echo {
    async fn invoke(&self, value: Value, _context: &Context) -> Result<Value, PipelineError> {
        info!(pipeline.value = %value, "echo");
        Ok(value)
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Key list accepted by [`select`]: a single key or any collection of keys.
pub struct SelectKeys(Vec<String>);

impl From<&str> for SelectKeys {
    fn from(key: &str) -> Self {
        Self(vec![key.to_owned()])
    }
}

impl From<String> for SelectKeys {
    fn from(key: String) -> Self {
        Self(vec![key])
    }
}

impl From<Vec<String>> for SelectKeys {
    fn from(keys: Vec<String>) -> Self {
        Self(keys)
    }
}

impl From<Vec<&str>> for SelectKeys {
    fn from(keys: Vec<&str>) -> Self {
        Self(keys.into_iter().map(str::to_owned).collect())
    }
}

impl<const N: usize> From<[&str; N]> for SelectKeys {
    fn from(keys: [&str; N]) -> Self {
        Self(keys.into_iter().map(str::to_owned).collect())
    }
}

struct Select {
    keys: Vec<String>,
}

#[async_trait]
impl Runnable for Select {
    async fn invoke(&self, value: Value, _context: &Context) -> Result<Value, PipelineError> {
        let Value::Object(input) = value else {
            return Err(PipelineError::type_mismatch(self.name(), &value));
        };

        let mut output = Map::new();
        for key in &self.keys {
            if let Some(field) = input.get(key) {
                output.insert(key.clone(), field.clone());
            }
        }
        Ok(Value::Object(output))
    }

    fn name(&self) -> &str {
        "select"
    }
}

/// A field source for [`assign`]: a constant or a nested runnable.
pub enum AssignSource {
    Constant(Value),
    Runnable(Transform),
}

impl From<Value> for AssignSource {
    fn from(value: Value) -> Self {
        Self::Constant(value)
    }
}

impl From<Transform> for AssignSource {
    fn from(transform: Transform) -> Self {
        Self::Runnable(transform)
    }
}

struct Assign {
    fields: Vec<(String, AssignSource)>,
}

#[async_trait]
impl Runnable for Assign {
    async fn invoke(&self, value: Value, context: &Context) -> Result<Value, PipelineError> {
        let Value::Object(input) = value else {
            return Err(PipelineError::type_mismatch(self.name(), &value));
        };

        let mut output = input.clone();
        for (name, source) in &self.fields {
            let field = match source {
                AssignSource::Constant(constant) => constant.clone(),
                AssignSource::Runnable(runnable) => {
                    runnable
                        .invoke(Value::Object(input.clone()), context)
                        .await?
                }
            };
            output.insert(name.clone(), field);
        }
        Ok(Value::Object(output))
    }

    fn name(&self) -> &str {
        "assign"
    }
}

struct Constant {
    value: Value,
}

#[async_trait]
impl Runnable for Constant {
    async fn invoke(&self, _value: Value, _context: &Context) -> Result<Value, PipelineError> {
        Ok(self.value.clone())
    }

    fn name(&self) -> &str {
        "const"
    }
}

struct Original {
    key: String,
}

#[async_trait]
impl Runnable for Original {
    async fn invoke(&self, _value: Value, context: &Context) -> Result<Value, PipelineError> {
        context.original().get(&self.key).cloned().ok_or_else(|| {
            PipelineError::new(
                self.name(),
                PipelineErrorKind::MissingOriginal(self.key.clone()),
            )
        })
    }

    fn name(&self) -> &str {
        "original"
    }
}

struct FnRunnable<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> Runnable for FnRunnable<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, PipelineError>> + Send,
{
    async fn invoke(&self, value: Value, _context: &Context) -> Result<Value, PipelineError> {
        (self.func)(value)
            .await
            .map_err(|err| PipelineError::new(&self.name, err.kind))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Object;

    fn input() -> Value {
        serde_json::json!({"a": 1, "b": "two", "c": [3]})
    }

    #[tokio::test]
    async fn echo_returns_the_value_unchanged() {
        let out = echo().invoke(input(), &Context::default()).await.unwrap();
        assert_eq!(out, input());
    }

    #[tokio::test]
    async fn select_keeps_the_intersection() {
        let out = select(["a", "missing"])
            .invoke(input(), &Context::default())
            .await
            .unwrap();

        assert_eq!(out, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn select_accepts_a_single_key() {
        let out = select("b")
            .invoke(input(), &Context::default())
            .await
            .unwrap();

        assert_eq!(out, serde_json::json!({"b": "two"}));
    }

    #[tokio::test]
    async fn select_rejects_non_mappings() {
        let err = select(["a"])
            .invoke(serde_json::json!([1, 2]), &Context::default())
            .await
            .unwrap_err();

        assert_eq!(err.transform, "select");
        assert!(matches!(err.kind, PipelineErrorKind::TypeMismatch(_)));
    }

    #[tokio::test]
    async fn assign_merges_and_preserves_existing_keys() {
        let out = assign([("d", serde_json::json!(4))])
            .invoke(input(), &Context::default())
            .await
            .unwrap();

        assert_eq!(out, serde_json::json!({"a": 1, "b": "two", "c": [3], "d": 4}));
    }

    #[tokio::test]
    async fn assign_evaluates_runnable_sources_against_the_input() {
        let out = assign([("picked", select(["a"]))])
            .invoke(input(), &Context::default())
            .await
            .unwrap();

        assert_eq!(out["picked"], serde_json::json!({"a": 1}));
        assert_eq!(out["a"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn assign_lifts_scalar_outputs_under_the_field_name() {
        let scalar = from_fn("answer", |_value| async { Ok(serde_json::json!(42)) });
        let out = assign([("answer", scalar)])
            .invoke(input(), &Context::default())
            .await
            .unwrap();

        assert_eq!(out["answer"], serde_json::json!(42));
    }

    #[tokio::test]
    async fn assign_rejects_non_mappings() {
        let err = assign([("d", serde_json::json!(4))])
            .invoke(serde_json::json!("scalar"), &Context::default())
            .await
            .unwrap_err();

        assert_eq!(err.transform, "assign");
    }

    #[tokio::test]
    async fn constant_ignores_its_input() {
        let out = constant(serde_json::json!({"fixed": true}))
            .invoke(input(), &Context::default())
            .await
            .unwrap();

        assert_eq!(out, serde_json::json!({"fixed": true}));
    }

    #[tokio::test]
    async fn original_reads_the_job_metadata() {
        let mut metadata = Object::new();
        metadata.insert("queue".to_owned(), serde_json::json!("inbox"));
        let context = Context::new(metadata);

        let out = original("queue").invoke(input(), &context).await.unwrap();
        assert_eq!(out, serde_json::json!("inbox"));
    }

    #[tokio::test]
    async fn original_fails_on_missing_keys() {
        let err = original("nope")
            .invoke(input(), &Context::default())
            .await
            .unwrap_err();

        assert!(matches!(err.kind, PipelineErrorKind::MissingOriginal(_)));
    }

    #[tokio::test]
    async fn from_fn_retags_errors_with_the_transform_name() {
        let failing = from_fn("flaky", |_value| async {
            Err(PipelineError::failed("inner", "boom"))
        });

        let err = failing.invoke(input(), &Context::default()).await.unwrap_err();
        assert_eq!(err.transform, "flaky");
        assert!(matches!(err.kind, PipelineErrorKind::Failed(_)));
    }
}
