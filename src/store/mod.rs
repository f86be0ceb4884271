//! Abstract contract over the reactive document store.
//!
//! The store is a JSON tree addressed by `/`-separated paths. The daemon
//! needs a small capability set: point reads and writes, list-append with
//! server-assigned keys, atomic numeric increments, and two subscription
//! shapes (per-child and whole-value). Every operation is asynchronous and
//! may fail; callers treat failures as transient and non-fatal.
//!
//! Engine choice is deliberately outside this crate's core: sessions and
//! the janitor only ever see [`Store`].

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

pub use memory::MemoryStore;

/// Shared handle to a signed-in store session.
pub type StoreHandle = Arc<dyn Store>;

/// Error produced by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// The backend could not service the request right now.
    Unavailable(String),
    /// The request was understood and refused (bad path, type clash).
    Rejected(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::Rejected(msg) => write!(f, "store rejected request: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A change to one child of a subscribed node.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    /// A child appeared (or was replaced with a new value).
    Added {
        /// Key of the child under the subscribed node.
        key: String,
        /// The child's value.
        value: Value,
    },
    /// A child was removed.
    Removed {
        /// Key of the removed child.
        key: String,
    },
}

/// Stream of [`ChildEvent`]s for one subscribed node.
///
/// Subscribing replays the node's existing children as `Added` events, then
/// streams live changes. Dropping the stream unsubscribes.
#[derive(Debug)]
pub struct ChildStream {
    pub(crate) rx: mpsc::UnboundedReceiver<ChildEvent>,
}

impl ChildStream {
    /// Next event, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<ChildEvent> {
        self.rx.recv().await
    }
}

/// Stream of value snapshots for one subscribed leaf.
///
/// Subscribing fires the current value (JSON `null` when absent), then
/// streams changes. Dropping the stream unsubscribes.
#[derive(Debug)]
pub struct ValueStream {
    pub(crate) rx: mpsc::UnboundedReceiver<Value>,
}

impl ValueStream {
    /// Next snapshot, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Capabilities the daemon requires from the document store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read the value at `path`. `None` when the path is empty.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value at `path`, creating intermediate nodes.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Append `value` under `path` with a server-assigned key.
    ///
    /// Assigned keys are unique and roughly time-ordered: iterating a node's
    /// children in key order visits pushes in insertion order.
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Delete the value at `path`. Deleting an absent path succeeds.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Atomically add `delta` to the numeric leaf at `path`, treating an
    /// absent leaf as zero.
    async fn atomic_add(&self, path: &str, delta: i64) -> Result<(), StoreError>;

    /// Subscribe to child additions/removals under `path`.
    async fn subscribe_children(&self, path: &str) -> Result<ChildStream, StoreError>;

    /// Subscribe to the value at `path`.
    async fn subscribe_value(&self, path: &str) -> Result<ValueStream, StoreError>;
}

/// Path of one client's hourly-ledger subtree.
pub fn bph_path(client: &crate::client_id::ClientId) -> String {
    format!("{}/{}", crate::constants::BPH_ROOT, client.as_str())
}

/// Path of one entry inside a client's hourly-ledger subtree.
pub fn bph_entry_path(client: &crate::client_id::ClientId, key: &str) -> String {
    format!("{}/{}/{}", crate::constants::BPH_ROOT, client.as_str(), key)
}
