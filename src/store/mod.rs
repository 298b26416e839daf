//! Key-value store contract used as the coordination medium between nodes.
//!
//! Everything the transaction engine knows about other nodes arrives through
//! this interface: reads, atomic compare-and-set batches, leased keys and
//! ordered watch streams.

pub mod liveness;
pub mod memory;
pub mod session;

pub use liveness::LivenessRegistry;
pub use memory::MemoryStore;
pub use session::Session;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

pub type Revision = u64;
pub type LeaseId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

impl KeyValue {
    pub fn value_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.value)
            .map_err(|e| Error::Serialization(format!("UTF-8 conversion error: {}", e)))
    }
}

/// Result of a point or range read, with the store revision it was served at
#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: Revision,
}

impl GetResponse {
    pub fn first(&self) -> Option<&KeyValue> {
        self.kvs.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    KeyMissing(String),
    KeyExists(String),
    ValueEquals(String, Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
    DeletePrefix {
        prefix: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: LeaseId) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        TxnOp::DeletePrefix {
            prefix: prefix.into(),
        }
    }
}

/// An atomic If/Then/Else batch.
#[derive(Debug, Clone, Default)]
pub struct StoreTxn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl StoreTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn and_then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventType,
    /// For deletes only `key` and `mod_revision` are meaningful.
    pub kv: KeyValue,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub prefix: bool,
    pub filter_delete: bool,
    /// First revision to deliver; `None` means changes after the call.
    pub start_revision: Option<Revision>,
}

impl WatchOptions {
    pub fn key() -> Self {
        Self::default()
    }

    pub fn prefix() -> Self {
        Self {
            prefix: true,
            ..Self::default()
        }
    }

    pub fn filter_delete(mut self) -> Self {
        self.filter_delete = true;
        self
    }

    pub fn from_revision(mut self, revision: Revision) -> Self {
        self.start_revision = Some(revision);
        self
    }
}

/// Ordered stream of changes. Ends when the store drops the watch.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<GetResponse>;

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision>;

    /// Returns the number of keys removed.
    async fn delete(&self, key: &str) -> Result<u64>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    async fn txn(&self, txn: StoreTxn) -> Result<TxnResponse>;

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revoking a lease deletes every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
}

/// Bound a store call by `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::StoreTimeout(format!("{} exceeded {:?}", op, timeout))),
    }
}
