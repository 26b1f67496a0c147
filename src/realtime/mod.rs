//! Realtime wake-ups.
//!
//! One long-lived websocket subscription per worker joins the broadcast
//! channel the queue triggers publish on. Every `job_enqueued` event is
//! converted into a wake-up signal for the matching queue fiber; signals
//! coalesce, so a burst of events while a fiber is busy results in at most
//! one pending wake-up. On subscription loss the listener reconnects with
//! exponential backoff while fibers fall back to their idle timers.

use crate::client::RetryPolicy;
use crate::config::AimqConfig;
use futures::{SinkExt, StreamExt};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{interval, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RealtimeError {
    #[error("invalid realtime endpoint: {0}")]
    Endpoint(String),

    #[error(transparent)]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("realtime socket closed by the server")]
    Closed,
}

/// Phoenix-framed message on the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SocketMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

/// Broadcast payload emitted by the queue triggers.
#[derive(Debug, Clone, Deserialize)]
struct BroadcastEnvelope {
    #[serde(rename = "type", default = "default_broadcast_kind")]
    kind: String,
    event: String,
    payload: JobEnqueued,
}

fn default_broadcast_kind() -> String {
    "broadcast".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
struct JobEnqueued {
    queue: String,
    #[serde(default)]
    job_id: Option<i64>,
}

/// The worker's single realtime subscription.
pub(crate) struct RealtimeListener {
    endpoint: Url,
    channel: String,
    event: String,
    wakeups: BTreeMap<String, Arc<Notify>>,
    backoff: RetryPolicy,
}

impl RealtimeListener {
    pub(crate) fn new(
        config: &AimqConfig,
        channel: String,
        event: String,
        wakeups: BTreeMap<String, Arc<Notify>>,
    ) -> Result<Self, RealtimeError> {
        Ok(Self {
            endpoint: websocket_endpoint(&config.supabase_url, &config.supabase_key)?,
            channel,
            event,
            wakeups,
            backoff: RetryPolicy::default(),
        })
    }

    pub(crate) async fn run(self, cancellation: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if cancellation.is_cancelled() {
                break;
            }

            match self.connect_and_listen(&cancellation, &mut attempt).await {
                Ok(()) => break,
                Err(err) => {
                    let delay = self.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        realtime.channel = %self.channel,
                        realtime.delay_ms = delay.as_millis() as u64,
                        "Realtime subscription lost, reconnecting: {err}"
                    );
                    tokio::select! {
                        biased;

                        _ = cancellation.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        debug!(realtime.channel = %self.channel, "Realtime listener exiting");
    }

    /// Returns `Ok` only when cancelled; any connection loss is an error so
    /// the caller can back off and reconnect.
    async fn connect_and_listen(
        &self,
        cancellation: &CancellationToken,
        attempt: &mut u32,
    ) -> Result<(), RealtimeError> {
        let (socket, _response) = connect_async(self.endpoint.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(join_message(&self.channel).to_string()))
            .await?;
        info!(realtime.channel = %self.channel, "Realtime subscription established");

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        let mut heartbeat_ref: u64 = 0;
        loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    heartbeat_ref += 1;
                    sink.send(Message::Text(heartbeat_message(heartbeat_ref).to_string()))
                        .await?;
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            *attempt = 0;
                            self.handle_frame(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(RealtimeError::Closed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let message: SocketMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                debug!("Ignoring undecodable realtime frame: {err}");
                return;
            }
        };

        match message.event.as_str() {
            "broadcast" => {
                let envelope: BroadcastEnvelope = match serde_json::from_value(message.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        debug!("Ignoring malformed broadcast payload: {err}");
                        return;
                    }
                };
                if envelope.kind != "broadcast" {
                    debug!(realtime.kind = %envelope.kind, "Ignoring non-broadcast payload");
                    return;
                }
                if envelope.event != self.event {
                    debug!(
                        realtime.event = %envelope.event,
                        "Ignoring broadcast for a different event"
                    );
                    return;
                }
                self.wake(&envelope.payload);
            }
            "phx_reply" => {
                debug!(
                    realtime.topic = %message.topic,
                    realtime.reference = ?message.reference,
                    "Channel reply"
                );
            }
            "phx_error" => {
                warn!(realtime.topic = %message.topic, "Channel error reported by the server");
            }
            _ => {}
        }
    }

    fn wake(&self, event: &JobEnqueued) {
        if event.queue == "*" {
            for wakeup in self.wakeups.values() {
                wakeup.notify_one();
            }
            return;
        }

        match self.wakeups.get(&event.queue) {
            Some(wakeup) => {
                debug!(
                    worker.queue.name = %event.queue,
                    job.msg_id = event.job_id,
                    "Realtime wake-up"
                );
                wakeup.notify_one();
            }
            None => {
                debug!(
                    worker.queue.name = %event.queue,
                    "Dropping realtime event for an unknown queue"
                );
            }
        }
    }
}

fn topic(channel: &str) -> String {
    format!("realtime:{channel}")
}

fn join_message(channel: &str) -> Value {
    json!({
        "topic": topic(channel),
        "event": "phx_join",
        "ref": "1",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "private": false,
            },
        },
    })
}

fn heartbeat_message(reference: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "ref": reference.to_string(),
        "payload": {},
    })
}

fn websocket_endpoint(base: &Url, key: &str) -> Result<Url, RealtimeError> {
    let mut endpoint = base.clone();
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RealtimeError::Endpoint(format!(
                "unsupported scheme `{other}`"
            )));
        }
    };
    endpoint
        .set_scheme(scheme)
        .map_err(|()| RealtimeError::Endpoint("unable to set the websocket scheme".to_owned()))?;
    endpoint.set_path("/realtime/v1/websocket");
    endpoint.set_query(None);
    endpoint
        .query_pairs_mut()
        .append_pair("apikey", key)
        .append_pair("vsn", "1.0.0");
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn test_config() -> AimqConfig {
        serde_json::from_value(serde_json::json!({
            "supabase_url": "https://example.supabase.co",
            "supabase_key": "service-key",
        }))
        .unwrap()
    }

    fn listener(queues: &[&str]) -> RealtimeListener {
        let wakeups = queues
            .iter()
            .map(|queue| ((*queue).to_owned(), Arc::new(Notify::new())))
            .collect();
        RealtimeListener::new(
            &test_config(),
            "aimq:jobs".to_owned(),
            "job_enqueued".to_owned(),
            wakeups,
        )
        .unwrap()
    }

    #[test]
    fn endpoint_swaps_scheme_and_appends_credentials() {
        let endpoint =
            websocket_endpoint(&Url::parse("https://example.supabase.co").unwrap(), "key")
                .unwrap();

        assert_eq!(endpoint.scheme(), "wss");
        assert_eq!(endpoint.path(), "/realtime/v1/websocket");
        assert_eq!(endpoint.query(), Some("apikey=key&vsn=1.0.0"));
    }

    #[test]
    fn endpoint_maps_plain_http_to_ws() {
        let endpoint =
            websocket_endpoint(&Url::parse("http://localhost:54321").unwrap(), "key").unwrap();
        assert_eq!(endpoint.scheme(), "ws");
    }

    #[test]
    fn join_message_targets_the_channel_topic() {
        let message = join_message("aimq:jobs");
        assert_eq!(message["topic"], "realtime:aimq:jobs");
        assert_eq!(message["event"], "phx_join");
        assert_eq!(message["payload"]["config"]["broadcast"]["self"], false);
    }

    #[test]
    fn heartbeat_message_counts_references() {
        let message = heartbeat_message(7);
        assert_eq!(message["topic"], "phoenix");
        assert_eq!(message["event"], "heartbeat");
        assert_eq!(message["ref"], "7");
    }

    #[test]
    fn broadcast_frames_parse() {
        let frame = serde_json::json!({
            "topic": "realtime:aimq:jobs",
            "event": "broadcast",
            "payload": {
                "type": "broadcast",
                "event": "job_enqueued",
                "payload": { "queue": "hello", "job_id": 42 },
            },
            "ref": null,
        });

        let message: SocketMessage = serde_json::from_value(frame).unwrap();
        assert_eq!(message.event, "broadcast");

        let envelope: BroadcastEnvelope = serde_json::from_value(message.payload).unwrap();
        assert_eq!(envelope.kind, "broadcast");
        assert_eq!(envelope.event, "job_enqueued");
        assert_eq!(envelope.payload.queue, "hello");
        assert_eq!(envelope.payload.job_id, Some(42));
    }

    #[tokio::test]
    async fn matching_events_wake_the_queue_fiber() {
        let listener = listener(&["hello", "other"]);
        listener.handle_frame(
            &serde_json::json!({
                "topic": "realtime:aimq:jobs",
                "event": "broadcast",
                "payload": {
                    "type": "broadcast",
                    "event": "job_enqueued",
                    "payload": { "queue": "hello", "job_id": 1 },
                },
            })
            .to_string(),
        );

        let woken = listener.wakeups["hello"].notified().now_or_never();
        assert!(woken.is_some());
        let idle = listener.wakeups["other"].notified().now_or_never();
        assert!(idle.is_none());
    }

    #[tokio::test]
    async fn wildcard_events_wake_every_fiber() {
        let listener = listener(&["a", "b"]);
        listener.wake(&JobEnqueued {
            queue: "*".to_owned(),
            job_id: None,
        });

        assert!(listener.wakeups["a"].notified().now_or_never().is_some());
        assert!(listener.wakeups["b"].notified().now_or_never().is_some());
    }

    #[tokio::test]
    async fn unknown_queues_are_dropped() {
        let listener = listener(&["hello"]);
        listener.wake(&JobEnqueued {
            queue: "nope".to_owned(),
            job_id: Some(1),
        });

        assert!(listener.wakeups["hello"].notified().now_or_never().is_none());
    }

    #[tokio::test]
    async fn wakeups_coalesce() {
        let listener = listener(&["hello"]);
        for _ in 0..5 {
            listener.wake(&JobEnqueued {
                queue: "hello".to_owned(),
                job_id: None,
            });
        }

        let wakeup = &listener.wakeups["hello"];
        assert!(wakeup.notified().now_or_never().is_some());
        assert!(wakeup.notified().now_or_never().is_none());
    }

    #[test]
    fn mismatched_events_are_ignored() {
        let listener = listener(&["hello"]);
        listener.handle_frame(
            &serde_json::json!({
                "topic": "realtime:aimq:jobs",
                "event": "broadcast",
                "payload": {
                    "type": "broadcast",
                    "event": "queue_purged",
                    "payload": { "queue": "hello" },
                },
            })
            .to_string(),
        );

        assert!(listener.wakeups["hello"].notified().now_or_never().is_none());
    }
}
