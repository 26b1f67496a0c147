//! Typed wrapper over the PGMQ RPC surface.
//!
//! Every queue operation is a PostgREST-style call to
//! `{SUPABASE_URL}/rest/v1/rpc/<fn>` against the `pgmq_public` schema,
//! authenticated with the service credential. Transient transport failures
//! are retried with bounded exponential backoff before they surface.

use crate::config::{AimqConfig, ConfigError};
use crate::job::{Job, MessageRow, QueueInfo, json_type_name};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Response, StatusCode};
use serde_derive::Deserialize;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;
use url::Url;

mod retry;

pub(crate) use retry::RetryPolicy;

/// Broadcast channel the queue triggers publish on unless overridden.
pub const DEFAULT_CHANNEL: &str = "aimq:jobs";
/// Broadcast event name emitted for every enqueued message.
pub const DEFAULT_EVENT: &str = "job_enqueued";

const RPC_SCHEMA: &str = "pgmq_public";
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueueErrorKind {
    Transport,
    NotFound,
    Validation,
    Conflict,
    Unknown,
}

impl fmt::Display for QueueErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueErrorKind::Transport => "transport",
            QueueErrorKind::NotFound => "not_found",
            QueueErrorKind::Validation => "validation",
            QueueErrorKind::Conflict => "conflict",
            QueueErrorKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Structured error envelope for queue operations.
#[derive(Debug, Error)]
#[non_exhaustive]
#[error("queue operation failed ({kind}): {cause}")]
pub struct QueueError {
    pub kind: QueueErrorKind,
    pub queue: Option<String>,
    pub message_id: Option<i64>,
    #[source]
    pub cause: QueueErrorCause,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueErrorCause {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("rpc returned {status}: {code} {message}")]
    Rpc {
        status: u16,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

impl QueueError {
    pub(crate) fn new(kind: QueueErrorKind, cause: QueueErrorCause) -> Self {
        Self {
            kind,
            queue: None,
            message_id: None,
            cause,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::new(
            QueueErrorKind::Validation,
            QueueErrorCause::Invalid(message.into()),
        )
    }

    pub(crate) fn for_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue.get_or_insert_with(|| queue.into());
        self
    }

    pub(crate) fn for_message(mut self, message_id: i64) -> Self {
        self.message_id.get_or_insert(message_id);
        self
    }
}

/// Shared, connection-pooled client for the PGMQ RPC surface.
#[derive(Debug, Clone)]
pub struct QueueClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    http: reqwest::Client,
    base: Url,
    retry: RetryPolicy,
}

impl QueueClient {
    pub fn new(config: &AimqConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        let mut api_key = HeaderValue::from_str(&config.supabase_key)
            .map_err(|err| ConfigError::RpcClient(err.to_string()))?;
        api_key.set_sensitive(true);
        headers.insert("apikey", api_key);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.supabase_key))
            .map_err(|err| ConfigError::RpcClient(err.to_string()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(RPC_TIMEOUT)
            .user_agent(concat!("aimq/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ConfigError::RpcClient(err.to_string()))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base: config.supabase_url.clone(),
                retry: RetryPolicy::default(),
            }),
        })
    }

    /// Enqueue one message. Returns the new message id. The message becomes
    /// visible after `delay` seconds.
    pub async fn send(&self, queue: &str, payload: &Value, delay: u64) -> Result<i64, QueueError> {
        ensure_object(queue, payload)?;
        let value = self
            .rpc(
                "send",
                Some(queue),
                json!({
                    "queue_name": queue,
                    "message": payload,
                    "sleep_seconds": delay,
                }),
            )
            .await?;
        scalar(value)
    }

    /// Enqueue a batch atomically. Returned ids align positionally with the
    /// input payloads.
    pub async fn send_batch(
        &self,
        queue: &str,
        payloads: &[Value],
        delay: u64,
    ) -> Result<Vec<i64>, QueueError> {
        for payload in payloads {
            ensure_object(queue, payload)?;
        }
        let value = self
            .rpc(
                "send_batch",
                Some(queue),
                json!({
                    "queue_name": queue,
                    "messages": payloads,
                    "sleep_seconds": delay,
                }),
            )
            .await?;
        scalar(value)
    }

    /// Read up to `n` messages, hiding each from other readers for
    /// `visibility_timeout` seconds. An empty queue yields an empty vec.
    pub async fn read(
        &self,
        queue: &str,
        visibility_timeout: u32,
        n: u32,
    ) -> Result<Vec<Job>, QueueError> {
        let value = self
            .rpc(
                "read",
                Some(queue),
                json!({
                    "queue_name": queue,
                    "sleep_seconds": visibility_timeout,
                    "n": n,
                }),
            )
            .await?;
        jobs_from_rows(queue, value)
    }

    /// Atomically read and delete one message.
    pub async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let value = self
            .rpc("pop", Some(queue), json!({ "queue_name": queue }))
            .await?;
        Ok(jobs_from_rows(queue, value)?.into_iter().next())
    }

    /// Move a message to the queue's archive table. True if a row moved.
    pub async fn archive(&self, queue: &str, message_id: i64) -> Result<bool, QueueError> {
        let value = self
            .rpc(
                "archive",
                Some(queue),
                json!({ "queue_name": queue, "message_id": message_id }),
            )
            .await
            .map_err(|err| err.for_message(message_id))?;
        scalar::<bool>(value).map_err(|err| err.for_queue(queue).for_message(message_id))
    }

    /// Permanently delete a message. True if a row was deleted.
    pub async fn delete(&self, queue: &str, message_id: i64) -> Result<bool, QueueError> {
        let value = self
            .rpc(
                "delete",
                Some(queue),
                json!({ "queue_name": queue, "message_id": message_id }),
            )
            .await
            .map_err(|err| err.for_message(message_id))?;
        scalar::<bool>(value).map_err(|err| err.for_queue(queue).for_message(message_id))
    }

    /// Create a queue, attaching the realtime notify trigger unless
    /// `realtime` is false. Idempotent; false means the queue already existed.
    pub async fn create_queue(
        &self,
        queue: &str,
        realtime: bool,
        channel: &str,
        event: &str,
    ) -> Result<bool, QueueError> {
        let value = self
            .rpc(
                "create_queue",
                Some(queue),
                json!({
                    "queue_name": queue,
                    "with_realtime": realtime,
                    "channel": channel,
                    "event": event,
                }),
            )
            .await?;
        Ok(value
            .get("created")
            .and_then(Value::as_bool)
            .unwrap_or(true))
    }

    /// List all queues with their metrics and realtime flag.
    pub async fn list_queues(&self) -> Result<Vec<QueueInfo>, QueueError> {
        let value = self.rpc("list_queues", None, json!({})).await?;
        scalar(value)
    }

    /// Attach the realtime notify trigger to an existing queue. Idempotent.
    pub async fn enable_queue_realtime(
        &self,
        queue: &str,
        channel: &str,
        event: &str,
    ) -> Result<bool, QueueError> {
        let value = self
            .rpc(
                "enable_queue_realtime",
                Some(queue),
                json!({
                    "queue_name": queue,
                    "channel": channel,
                    "event": event,
                }),
            )
            .await?;
        Ok(value
            .get("realtime_enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true))
    }

    async fn rpc(
        &self,
        function: &str,
        queue: Option<&str>,
        args: Value,
    ) -> Result<Value, QueueError> {
        let mut attempt = 0;
        loop {
            match self.rpc_once(function, &args).await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.kind == QueueErrorKind::Transport
                        && attempt < self.inner.retry.max_retries() =>
                {
                    let delay = self.inner.retry.delay(attempt);
                    attempt += 1;
                    warn!(
                        rpc.function = function,
                        rpc.attempt = attempt,
                        rpc.delay_ms = delay.as_millis() as u64,
                        "Transient transport failure, retrying: {err}"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    return Err(match queue {
                        Some(queue) => err.for_queue(queue),
                        None => err,
                    });
                }
            }
        }
    }

    async fn rpc_once(&self, function: &str, args: &Value) -> Result<Value, QueueError> {
        let response = self
            .inner
            .http
            .post(rpc_url(&self.inner.base, function))
            .header("Content-Profile", RPC_SCHEMA)
            .json(args)
            .send()
            .await
            .map_err(|err| {
                QueueError::new(QueueErrorKind::Transport, QueueErrorCause::Http(err))
            })?;
        decode_response(response).await
    }
}

async fn decode_response(response: Response) -> Result<Value, QueueError> {
    let status = response.status();
    if status.is_success() {
        let text = response.text().await.map_err(|err| {
            QueueError::new(QueueErrorKind::Transport, QueueErrorCause::Http(err))
        })?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|err| QueueError::new(QueueErrorKind::Unknown, QueueErrorCause::Decode(err)))
    } else {
        let body = response.text().await.unwrap_or_default();
        let error: RpcErrorBody = serde_json::from_str(&body).unwrap_or_default();
        Err(QueueError::new(
            classify_error(status, &error.code),
            QueueErrorCause::Rpc {
                status: status.as_u16(),
                code: error.code,
                message: error.message,
            },
        ))
    }
}

/// PostgREST error body; Postgres SQLSTATE codes surface in `code`.
#[derive(Debug, Default, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn classify_error(status: StatusCode, code: &str) -> QueueErrorKind {
    // 42P01 (undefined_table) is how PGMQ reports a missing queue.
    if code == "42P01" {
        return QueueErrorKind::NotFound;
    }
    match status {
        StatusCode::NOT_FOUND => QueueErrorKind::NotFound,
        StatusCode::CONFLICT => QueueErrorKind::Conflict,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => QueueErrorKind::Validation,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => QueueErrorKind::Transport,
        status if status.is_server_error() => QueueErrorKind::Transport,
        _ => QueueErrorKind::Unknown,
    }
}

fn rpc_url(base: &Url, function: &str) -> String {
    format!(
        "{}/rest/v1/rpc/{function}",
        base.as_str().trim_end_matches('/')
    )
}

fn ensure_object(queue: &str, payload: &Value) -> Result<(), QueueError> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(QueueError::validation(format!(
            "payload must be a JSON object, got {}",
            json_type_name(payload)
        ))
        .for_queue(queue))
    }
}

fn jobs_from_rows(queue: &str, value: Value) -> Result<Vec<Job>, QueueError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let rows: Vec<MessageRow> = serde_json::from_value(value)
        .map_err(|err| {
            QueueError::new(QueueErrorKind::Unknown, QueueErrorCause::Decode(err))
                .for_queue(queue)
        })?;
    rows.into_iter()
        .map(|row| Job::from_row(queue, row))
        .collect()
}

fn scalar<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, QueueError> {
    serde_json::from_value(value)
        .map_err(|err| QueueError::new(QueueErrorKind::Unknown, QueueErrorCause::Decode(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusCode::NOT_FOUND, "", QueueErrorKind::NotFound)]
    #[case(StatusCode::BAD_REQUEST, "42P01", QueueErrorKind::NotFound)]
    #[case(StatusCode::BAD_REQUEST, "22023", QueueErrorKind::Validation)]
    #[case(StatusCode::UNPROCESSABLE_ENTITY, "", QueueErrorKind::Validation)]
    #[case(StatusCode::CONFLICT, "23505", QueueErrorKind::Conflict)]
    #[case(StatusCode::REQUEST_TIMEOUT, "", QueueErrorKind::Transport)]
    #[case(StatusCode::TOO_MANY_REQUESTS, "", QueueErrorKind::Transport)]
    #[case(StatusCode::BAD_GATEWAY, "", QueueErrorKind::Transport)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, "", QueueErrorKind::Transport)]
    #[case(StatusCode::UNAUTHORIZED, "", QueueErrorKind::Unknown)]
    fn error_classification(
        #[case] status: StatusCode,
        #[case] code: &str,
        #[case] expected: QueueErrorKind,
    ) {
        assert_eq!(classify_error(status, code), expected);
    }

    #[rstest]
    #[case("https://example.supabase.co", "send")]
    #[case("https://example.supabase.co/", "send")]
    fn rpc_url_ignores_trailing_slash(#[case] base: &str, #[case] function: &str) {
        let base = Url::parse(base).unwrap();
        assert_eq!(
            rpc_url(&base, function),
            "https://example.supabase.co/rest/v1/rpc/send"
        );
    }

    #[test]
    fn ensure_object_rejects_scalars() {
        let err = ensure_object("q", &serde_json::json!([1])).unwrap_err();
        assert_eq!(err.kind, QueueErrorKind::Validation);
        assert_eq!(err.queue.as_deref(), Some("q"));

        assert!(ensure_object("q", &serde_json::json!({"a": 1})).is_ok());
    }

    #[test]
    fn jobs_from_rows_maps_each_row() {
        let rows = serde_json::json!([
            {
                "msg_id": 1,
                "read_ct": 1,
                "enqueued_at": "2025-05-01T12:00:00Z",
                "vt": "2025-05-01T12:05:00Z",
                "message": {"a": 1},
            },
            {
                "msg_id": 2,
                "read_ct": 1,
                "enqueued_at": "2025-05-01T12:00:01Z",
                "vt": "2025-05-01T12:05:01Z",
                "message": {"b": 2},
            },
        ]);

        let jobs = jobs_from_rows("inbox", rows).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].message_id, 1);
        assert_eq!(jobs[1].message_id, 2);
        assert!(jobs.iter().all(|job| job.queue_name == "inbox"));
    }

    #[test]
    fn jobs_from_rows_treats_null_as_empty() {
        assert!(jobs_from_rows("inbox", Value::Null).unwrap().is_empty());
    }

    #[test]
    fn scalar_decodes_ids() {
        assert_eq!(scalar::<i64>(serde_json::json!(42)).unwrap(), 42);
        assert_eq!(
            scalar::<Vec<i64>>(serde_json::json!([1, 2, 3])).unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn queue_error_context_is_sticky() {
        let err = QueueError::validation("nope")
            .for_queue("a")
            .for_queue("b")
            .for_message(1)
            .for_message(2);

        assert_eq!(err.queue.as_deref(), Some("a"));
        assert_eq!(err.message_id, Some(1));
    }
}
