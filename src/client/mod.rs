//! The `client` module is the consumer side of the WebSocket protocol.
//!
//! `RemoteQueue` speaks to a running gateway's consumer server and implements
//! `QueueSource`, so a `Worker` in another process runs the exact same loop
//! it would run against a local `DurableQueue`.

pub mod remote_queue;
pub use remote_queue::RemoteQueue;
