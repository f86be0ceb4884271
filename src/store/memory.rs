//! In-process reactive store.
//!
//! Backs the test suite and the `memory` engine of `serve`. The whole tree
//! lives in one mutex-guarded JSON value; subscriptions are notified by
//! diffing their node against the snapshot taken at the previous write.
//! Not a production engine: no durability, single process only.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{ChildEvent, ChildStream, Store, StoreError, ValueStream};

/// In-memory implementation of [`Store`].
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    root: Value,
    push_seq: u64,
    child_subs: Vec<ChildSub>,
    value_subs: Vec<ValueSub>,
    fail_writes: u32,
}

#[derive(Debug)]
struct ChildSub {
    path: String,
    tx: mpsc::UnboundedSender<ChildEvent>,
    snapshot: BTreeMap<String, Value>,
}

#[derive(Debug)]
struct ValueSub {
    path: String,
    tx: mpsc::UnboundedSender<Value>,
    last: Value,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                root: Value::Object(Map::new()),
                push_seq: 0,
                child_subs: Vec::new(),
                value_subs: Vec::new(),
                fail_writes: 0,
            }),
        }
    }

    /// Make the next `n` write operations (set, push, remove, atomic add)
    /// fail with [`StoreError::Unavailable`]. Test hook for the
    /// restore-on-failure paths.
    pub fn fail_next_writes(&self, n: u32) {
        self.inner.lock().expect("store lock poisoned").fail_writes = n;
    }

    fn write_gate(inner: &mut Inner) -> Result<(), StoreError> {
        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    /// Diff every subscription against the new tree and deliver events.
    /// Subscriptions whose receiver is gone are dropped.
    fn notify(inner: &mut Inner) {
        let root = inner.root.clone();
        inner.child_subs.retain_mut(|sub| {
            let current = children_of(&root, &sub.path);
            let mut alive = true;
            for key in sub.snapshot.keys() {
                if !current.contains_key(key) {
                    alive &= sub
                        .tx
                        .send(ChildEvent::Removed { key: key.clone() })
                        .is_ok();
                }
            }
            for (key, value) in &current {
                if sub.snapshot.get(key) != Some(value) {
                    alive &= sub
                        .tx
                        .send(ChildEvent::Added {
                            key: key.clone(),
                            value: value.clone(),
                        })
                        .is_ok();
                }
            }
            sub.snapshot = current;
            alive
        });
        inner.value_subs.retain_mut(|sub| {
            let value = lookup(&root, &sub.path).cloned().unwrap_or(Value::Null);
            if value != sub.last {
                let alive = sub.tx.send(value.clone()).is_ok();
                sub.last = value;
                alive
            } else {
                true
            }
        });
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for seg in segments(path) {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

fn children_of(root: &Value, path: &str) -> BTreeMap<String, Value> {
    lookup(root, path)
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// Navigate to `path`, materializing objects along the way. Non-object
/// intermediates are overwritten, matching document-store set semantics.
fn lookup_mut_or_create<'a>(root: &'a mut Value, path: &str) -> &'a mut Value {
    let mut node = root;
    for seg in segments(path) {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = node
            .as_object_mut()
            .expect("just materialized an object")
            .entry(seg.to_string())
            .or_insert(Value::Null);
    }
    node
}

fn remove_at(root: &mut Value, path: &str) {
    let parts: Vec<&str> = segments(path).collect();
    let Some((leaf, parents)) = parts.split_last() else {
        *root = Value::Object(Map::new());
        return;
    };
    let mut node = root;
    for seg in parents {
        match node.as_object_mut().and_then(|m| m.get_mut(*seg)) {
            Some(next) => node = next,
            None => return,
        }
    }
    if let Some(map) = node.as_object_mut() {
        map.remove(*leaf);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(lookup(&inner.root, path).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        Self::write_gate(&mut inner)?;
        *lookup_mut_or_create(&mut inner.root, path) = value;
        Self::notify(&mut inner);
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        Self::write_gate(&mut inner)?;
        // Fixed-width hex of a monotonic counter: unique, and key order is
        // insertion order.
        inner.push_seq += 1;
        let key = format!("k{:016x}", inner.push_seq);
        let node = lookup_mut_or_create(&mut inner.root, path);
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node.as_object_mut()
            .expect("just materialized an object")
            .insert(key.clone(), value);
        Self::notify(&mut inner);
        Ok(key)
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        Self::write_gate(&mut inner)?;
        remove_at(&mut inner.root, path);
        Self::notify(&mut inner);
        Ok(())
    }

    async fn atomic_add(&self, path: &str, delta: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        Self::write_gate(&mut inner)?;
        let node = lookup_mut_or_create(&mut inner.root, path);
        let current = match node {
            Value::Null => 0,
            ref other => other.as_i64().ok_or_else(|| {
                StoreError::Rejected(format!("non-numeric leaf at {path}"))
            })?,
        };
        *node = Value::from(current + delta);
        Self::notify(&mut inner);
        Ok(())
    }

    async fn subscribe_children(&self, path: &str) -> Result<ChildStream, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = children_of(&inner.root, path);
        for (key, value) in &snapshot {
            let _ = tx.send(ChildEvent::Added {
                key: key.clone(),
                value: value.clone(),
            });
        }
        inner.child_subs.push(ChildSub {
            path: path.to_string(),
            tx,
            snapshot,
        });
        Ok(ChildStream { rx })
    }

    async fn subscribe_value(&self, path: &str) -> Result<ValueStream, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let (tx, rx) = mpsc::unbounded_channel();
        let last = lookup(&inner.root, path).cloned().unwrap_or(Value::Null);
        let _ = tx.send(last.clone());
        inner.value_subs.push(ValueSub {
            path: path.to_string(),
            tx,
            last,
        });
        Ok(ValueStream { rx })
    }
}
