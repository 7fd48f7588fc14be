//! Storage substrate backed by `sled`
//!
//! Every durable queue lives in its own tree named `queue:<name>`; dead
//! letters share the `dead_letters` tree. Keys are timestamp-prefixed
//! (`{millis:020}_{uuid}`) so a tree scan yields records in the order they
//! were written, and retention can compare the prefix without decoding the
//! value. Values are JSON.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sled::{Db, Tree};
use uuid::Uuid;

use crate::utils::error::Result;

const QUEUE_TREE_PREFIX: &str = "queue:";
const DEAD_LETTER_TREE: &str = "dead_letters";
const QUARANTINE_TREE: &str = "quarantine";

#[derive(Clone)]
pub struct Store {
    db: Db,
}

impl Store {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A throwaway database that is deleted on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn queue_tree(&self, queue: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("{QUEUE_TREE_PREFIX}{queue}"))?)
    }

    pub fn dead_letter_tree(&self) -> Result<Tree> {
        Ok(self.db.open_tree(DEAD_LETTER_TREE)?)
    }

    /// Raw queue entries that no longer decode, keyed `{queue}/{key}`.
    pub fn quarantine_tree(&self) -> Result<Tree> {
        Ok(self.db.open_tree(QUARANTINE_TREE)?)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("db", &"sled::Db").finish()
    }
}

/// A fresh key that sorts after every key written at an earlier millisecond.
pub fn timestamped_key(millis: i64) -> String {
    format!("{:020}_{}", millis, Uuid::new_v4())
}

/// Lower bound for keys written at or after `millis`.
pub fn key_floor(millis: i64) -> String {
    format!("{millis:020}")
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
