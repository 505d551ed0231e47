//! The pluggable record store behind kontrol.
//!
//! Keys are canonical kite paths; records must expire after
//! [`KEY_TTL`](kite_protocol::KEY_TTL) without a refresh. `watch`
//! returns an index-stamped change stream over a path prefix: when a
//! backend drops a slow stream, the consumer reopens it from the last
//! index it saw. Relational and etcd drivers live out of tree; the
//! in-memory store ships here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use kite_protocol::{Kite, KiteQuery};

/// A registered kite: identity, reachable URL, and the id of the key
/// pair that signed its kite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KiteRecord {
    pub kite: Kite,
    pub url: String,
    #[serde(rename = "key_id")]
    pub key_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("kite not found")]
    NotFound,
    #[error("storage backend: {0}")]
    Backend(String),
}

/// One change observed by a watch stream.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub action: WatchAction,
    /// Canonical path of the affected record.
    pub key: String,
    /// The record, absent on delete/expire.
    pub record: Option<KiteRecord>,
    /// Monotonically increasing modification index.
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    /// A record was written. `refresh` is true when the write replaced
    /// an existing record (TTL refreshes and re-registrations).
    Set { refresh: bool },
    Delete,
    Expire,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Upsert a record and arm its TTL.
    async fn add(&self, record: &KiteRecord) -> Result<(), StorageError>;

    /// Refresh the TTL of an existing record.
    async fn update(&self, record: &KiteRecord) -> Result<(), StorageError>;

    async fn delete(&self, kite: &Kite) -> Result<(), StorageError>;

    /// All records under the query's canonical-path prefix.
    async fn get(&self, query: &KiteQuery) -> Result<Vec<KiteRecord>, StorageError>;

    /// A change stream over `prefix`, replaying history after
    /// `from_index`. The channel closes when the backend drops the
    /// stream; reopen from the last seen index.
    async fn watch(
        &self,
        prefix: &str,
        from_index: u64,
    ) -> Result<mpsc::Receiver<WatchEvent>, StorageError>;

    /// The current modification index.
    async fn index(&self) -> u64;
}
