//! Command-line surface for ad-hoc sends and queue management.
//!
//! Exit codes: `0` on success, `2` when a payload is not a JSON object,
//! `3` on transport failure.

use crate::client::{DEFAULT_CHANNEL, DEFAULT_EVENT, QueueClient, QueueError, QueueErrorKind};
use crate::config::AimqConfig;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_INVALID_PAYLOAD: u8 = 2;
pub const EXIT_TRANSPORT: u8 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "aimq",
    version,
    about = "Worker runtime and tooling for PGMQ-backed queues"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enqueue one JSON object on a queue.
    Send {
        queue: String,
        /// The payload as a JSON object literal.
        payload: String,
        /// Seconds before the message becomes visible.
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },
    /// Enqueue every object from a JSON array file.
    SendBatch {
        queue: String,
        /// Path to a file containing a JSON array of objects.
        file: PathBuf,
        /// Seconds before the messages become visible.
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },
    /// Inspect and manage queues.
    #[command(subcommand)]
    Queues(QueuesCommand),
}

#[derive(Debug, Subcommand)]
pub enum QueuesCommand {
    /// Tabulate every queue with its metrics and realtime flag.
    List,
    /// Create a queue with realtime notifications enabled.
    Create { name: String },
}

impl Cli {
    pub async fn run(self, config: &AimqConfig) -> u8 {
        let client = match QueueClient::new(config) {
            Ok(client) => client,
            Err(err) => {
                eprintln!("error: {err}");
                return EXIT_TRANSPORT;
            }
        };

        match self.command {
            Command::Send {
                queue,
                payload,
                delay,
            } => send(&client, &queue, &payload, delay).await,
            Command::SendBatch { queue, file, delay } => {
                send_batch(&client, &queue, &file, delay).await
            }
            Command::Queues(QueuesCommand::List) => list_queues(&client).await,
            Command::Queues(QueuesCommand::Create { name }) => create_queue(&client, &name).await,
        }
    }
}

async fn send(client: &QueueClient, queue: &str, raw: &str, delay: u64) -> u8 {
    let payload: Value = match serde_json::from_str(raw) {
        Ok(payload) => payload,
        Err(err) => {
            eprintln!("error: payload is not valid JSON: {err}");
            return EXIT_INVALID_PAYLOAD;
        }
    };
    if !payload.is_object() {
        eprintln!("error: payload must be a JSON object");
        return EXIT_INVALID_PAYLOAD;
    }

    match client.send(queue, &payload, delay).await {
        Ok(id) => {
            println!("{id}");
            EXIT_SUCCESS
        }
        Err(err) => report(&err),
    }
}

async fn send_batch(client: &QueueClient, queue: &str, file: &Path, delay: u64) -> u8 {
    let contents = match std::fs::read_to_string(file) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("error: unable to read {}: {err}", file.display());
            return EXIT_INVALID_PAYLOAD;
        }
    };
    let payloads: Vec<Value> = match serde_json::from_str(&contents) {
        Ok(payloads) => payloads,
        Err(err) => {
            eprintln!("error: file must contain a JSON array: {err}");
            return EXIT_INVALID_PAYLOAD;
        }
    };
    if payloads.iter().any(|payload| !payload.is_object()) {
        eprintln!("error: every element of the array must be a JSON object");
        return EXIT_INVALID_PAYLOAD;
    }

    match client.send_batch(queue, &payloads, delay).await {
        Ok(ids) => {
            for id in ids {
                println!("{id}");
            }
            EXIT_SUCCESS
        }
        Err(err) => report(&err),
    }
}

async fn list_queues(client: &QueueClient) -> u8 {
    let queues = match client.list_queues().await {
        Ok(queues) => queues,
        Err(err) => return report(&err),
    };

    println!(
        "{:<32} {:>8} {:>10} {:>12} {:>12} {:>9}",
        "QUEUE", "LENGTH", "TOTAL", "NEWEST(S)", "OLDEST(S)", "REALTIME"
    );
    for info in queues {
        println!(
            "{:<32} {:>8} {:>10} {:>12} {:>12} {:>9}",
            info.queue_name,
            info.queue_length,
            info.total_messages,
            age(info.newest_msg_age_sec),
            age(info.oldest_msg_age_sec),
            if info.realtime_enabled { "yes" } else { "no" },
        );
    }
    EXIT_SUCCESS
}

async fn create_queue(client: &QueueClient, name: &str) -> u8 {
    match client
        .create_queue(name, true, DEFAULT_CHANNEL, DEFAULT_EVENT)
        .await
    {
        Ok(true) => {
            println!("created {name}");
            EXIT_SUCCESS
        }
        Ok(false) => {
            println!("queue {name} already exists");
            EXIT_SUCCESS
        }
        Err(err) => report(&err),
    }
}

fn age(seconds: Option<i64>) -> String {
    seconds.map_or_else(|| "-".to_owned(), |seconds| seconds.to_string())
}

fn report(err: &QueueError) -> u8 {
    eprintln!("error: {err}");
    exit_code(err)
}

fn exit_code(err: &QueueError) -> u8 {
    match err.kind {
        QueueErrorKind::Validation => EXIT_INVALID_PAYLOAD,
        _ => EXIT_TRANSPORT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_send_with_delay() {
        let cli = Cli::try_parse_from(["aimq", "send", "inbox", r#"{"a":1}"#, "--delay", "5"])
            .unwrap();

        match cli.command {
            Command::Send {
                queue,
                payload,
                delay,
            } => {
                assert_eq!(queue, "inbox");
                assert_eq!(payload, r#"{"a":1}"#);
                assert_eq!(delay, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_send_batch() {
        let cli = Cli::try_parse_from(["aimq", "send-batch", "inbox", "payloads.json"]).unwrap();

        assert!(matches!(cli.command, Command::SendBatch { delay: 0, .. }));
    }

    #[test]
    fn parses_queue_subcommands() {
        let list = Cli::try_parse_from(["aimq", "queues", "list"]).unwrap();
        assert!(matches!(list.command, Command::Queues(QueuesCommand::List)));

        let create = Cli::try_parse_from(["aimq", "queues", "create", "inbox"]).unwrap();
        assert!(matches!(
            create.command,
            Command::Queues(QueuesCommand::Create { name }) if name == "inbox"
        ));
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["aimq"]).is_err());
    }

    #[rstest]
    #[case(QueueErrorKind::Validation, EXIT_INVALID_PAYLOAD)]
    #[case(QueueErrorKind::Transport, EXIT_TRANSPORT)]
    #[case(QueueErrorKind::NotFound, EXIT_TRANSPORT)]
    #[case(QueueErrorKind::Unknown, EXIT_TRANSPORT)]
    fn exit_codes_follow_the_error_kind(#[case] kind: QueueErrorKind, #[case] expected: u8) {
        let mut err = QueueError::validation("boom");
        err.kind = kind;
        assert_eq!(exit_code(&err), expected);
    }
}
