//! The `persistence` module provides the durable storage every queue and the
//! dead-letter sink are built on.
//!
//! It uses `sled` as an embedded key-value store, so queue contents survive
//! process restarts.

pub mod sled_store;

pub use sled_store::Store;
