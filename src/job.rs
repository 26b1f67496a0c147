//! The materialized in-worker view of a PGMQ message.

use crate::client::QueueError;
use chrono::{DateTime, Utc};
use serde_derive::Deserialize;
use serde_json::{Map, Value};

/// A single queue message, owned by the queue processor for the duration of
/// its execution and destroyed when archived or deleted.
#[derive(Debug, Clone, PartialEq, bon::Builder)]
#[non_exhaustive]
pub struct Job {
    /// Unique within a queue, assigned by PGMQ on send.
    pub message_id: i64,
    /// The originating queue.
    #[builder(into)]
    pub queue_name: String,
    /// Times PGMQ has delivered this message.
    pub read_count: i32,
    /// When the message was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When PGMQ may redeliver the message if it has not been finalized.
    pub visible_at: DateTime<Utc>,
    /// The message body. Always a mapping at the top level.
    pub payload: Map<String, Value>,
    /// Tags attached by the queue processor at read time.
    #[builder(default)]
    pub tags: Vec<String>,
}

impl Job {
    /// True iff the visibility deadline has passed and PGMQ may have
    /// redelivered the message to another reader.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.visible_at
    }

    /// The job metadata exposed to pipelines as the `original` context.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut original = Map::new();
        original.insert("queue".to_owned(), Value::from(self.queue_name.clone()));
        original.insert("message_id".to_owned(), Value::from(self.message_id));
        original.insert("read_count".to_owned(), Value::from(self.read_count));
        original.insert(
            "enqueued_at".to_owned(),
            Value::from(self.enqueued_at.to_rfc3339()),
        );
        original.insert("tags".to_owned(), Value::from(self.tags.clone()));
        original
    }

    /// Materialize a job from an RPC message row.
    pub(crate) fn from_row(queue: &str, row: MessageRow) -> Result<Self, QueueError> {
        let message_id = match row.msg_id {
            Some(id) if id > 0 => id,
            _ => {
                return Err(
                    QueueError::validation("message row has no usable msg_id").for_queue(queue)
                );
            }
        };

        let payload = match row.message {
            Value::Object(payload) => payload,
            other => {
                return Err(QueueError::validation(format!(
                    "message body must be a JSON object, got {}",
                    json_type_name(&other)
                ))
                .for_queue(queue)
                .for_message(message_id));
            }
        };

        Ok(Job::builder()
            .message_id(message_id)
            .queue_name(queue)
            .read_count(row.read_ct)
            .enqueued_at(row.enqueued_at)
            .visible_at(row.vt)
            .payload(payload)
            .build())
    }
}

/// Raw message row returned by the `read` and `pop` RPCs.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MessageRow {
    #[serde(default)]
    pub(crate) msg_id: Option<i64>,
    #[serde(default)]
    pub(crate) read_ct: i32,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) vt: DateTime<Utc>,
    #[serde(default)]
    pub(crate) message: Value,
}

/// One row of `list_queues` output.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct QueueInfo {
    pub queue_name: String,
    #[serde(default)]
    pub realtime_enabled: bool,
    #[serde(default)]
    pub queue_length: i64,
    #[serde(default)]
    pub newest_msg_age_sec: Option<i64>,
    #[serde(default)]
    pub oldest_msg_age_sec: Option<i64>,
    #[serde(default)]
    pub total_messages: i64,
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QueueErrorKind;
    use chrono::TimeDelta;

    fn row(message: Value) -> MessageRow {
        MessageRow {
            msg_id: Some(7),
            read_ct: 2,
            enqueued_at: Utc::now(),
            vt: Utc::now() + TimeDelta::seconds(30),
            message,
        }
    }

    #[test]
    fn from_row_materializes_the_job() {
        let job = Job::from_row("inbox", row(serde_json::json!({"a": 1}))).unwrap();

        assert_eq!(job.message_id, 7);
        assert_eq!(job.queue_name, "inbox");
        assert_eq!(job.read_count, 2);
        assert_eq!(job.payload.get("a"), Some(&Value::from(1)));
        assert!(job.tags.is_empty());
    }

    #[test]
    fn from_row_rejects_missing_msg_id() {
        let mut row = row(serde_json::json!({}));
        row.msg_id = None;

        let err = Job::from_row("inbox", row).unwrap_err();
        assert_eq!(err.kind, QueueErrorKind::Validation);
        assert_eq!(err.queue.as_deref(), Some("inbox"));
    }

    #[test]
    fn from_row_rejects_scalar_payloads() {
        let err = Job::from_row("inbox", row(serde_json::json!([1, 2]))).unwrap_err();

        assert_eq!(err.kind, QueueErrorKind::Validation);
        assert_eq!(err.message_id, Some(7));
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let job = Job::from_row("inbox", row(serde_json::json!({}))).unwrap();

        assert!(!job.is_expired(job.visible_at - TimeDelta::seconds(1)));
        assert!(job.is_expired(job.visible_at));
        assert!(job.is_expired(job.visible_at + TimeDelta::seconds(1)));
    }

    #[test]
    fn metadata_carries_dispatch_fields() {
        let mut job = Job::from_row("inbox", row(serde_json::json!({}))).unwrap();
        job.tags = vec!["ocr".to_owned()];

        let original = job.metadata();
        assert_eq!(original.get("queue"), Some(&Value::from("inbox")));
        assert_eq!(original.get("message_id"), Some(&Value::from(7)));
        assert_eq!(original.get("read_count"), Some(&Value::from(2)));
        assert_eq!(original.get("tags"), Some(&Value::from(vec!["ocr"])));
        assert!(original.get("enqueued_at").is_some_and(Value::is_string));
    }

    #[test]
    fn message_row_parses_wire_shape() {
        let row: MessageRow = serde_json::from_value(serde_json::json!({
            "msg_id": 42,
            "read_ct": 1,
            "enqueued_at": "2025-05-01T12:00:00Z",
            "vt": "2025-05-01T12:05:00Z",
            "message": {"name": "Alice"},
        }))
        .unwrap();

        assert_eq!(row.msg_id, Some(42));
        assert_eq!(row.read_ct, 1);
        assert_eq!(row.message, serde_json::json!({"name": "Alice"}));
    }
}
