#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod realtime;
pub mod tracing;
pub mod worker;
