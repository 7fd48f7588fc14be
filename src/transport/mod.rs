//! The `transport` module holds the network edges of the gateway.
//!
//! - `http`: the `POST /SendEvent` ingestion endpoint and `GET /health`.
//! - `websocket`: the consumer protocol used by remote workers.
//! - `message`: the JSON types both sides exchange.

pub mod http;
pub mod message;
pub mod websocket;

#[cfg(test)]
mod tests;
