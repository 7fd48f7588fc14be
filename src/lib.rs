//! # BigFan
//!
//! `bigfan` is a fan-out message gateway. Events posted over HTTP are
//! published to a single topic, routed by attribute filter policies into
//! durable, lease-based queues, and consumed by at-least-once workers.
//! Entries that keep failing are moved to a dead-letter store.
//!
//! ## Core Modules
//!
//! - `broker`: queues, dead letters, filter policies and the fan-out topic.
//! - `client`: `RemoteQueue`, a queue reached over the consumer WebSocket.
//! - `config`: layered configuration (file, environment, defaults).
//! - `persistence`: the sled store every queue and dead letter lives in.
//! - `transport`: the HTTP ingestion gateway and the consumer WebSocket server.
//! - `utils`: error types and logging setup.
//! - `worker`: the receive → handle → ack loop.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
pub mod worker;
