//! NodeStore trait abstraction for persisting federation nodes.
//!
//! Implementations:
//! - `InMemoryNodeStore` - For testing and embedding
//! - `JsonNodeStore` (in harvest-daemon) - `nodes.json` on disk
//!
//! Callers never hold a `Node` across an await and write it back whole.
//! Changes go through `update`, which applies an edit to the current stored
//! value, so a discovery probe and a replication pass touching different
//! fields of the same node cannot clobber each other.

use crate::endpoint::Endpoint;
use crate::node::Node;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// An in-place edit of one stored node.
pub type NodeEdit = Box<dyn FnOnce(&mut Node) + Send>;

/// Durable set of known nodes, keyed by endpoint.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Snapshot of one node.
    async fn get(&self, endpoint: &Endpoint) -> Result<Option<Node>>;

    /// Snapshot of every node.
    async fn list(&self) -> Result<Vec<Node>>;

    /// Add a node. Returns false (and changes nothing) if the endpoint is known.
    async fn insert(&self, node: Node) -> Result<bool>;

    /// Apply `edit` to the stored node atomically. Returns the updated
    /// snapshot, or `None` if the endpoint is unknown.
    async fn update(&self, endpoint: &Endpoint, edit: NodeEdit) -> Result<Option<Node>>;
}

/// In-memory node store.
#[derive(Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<BTreeMap<Endpoint, Node>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `nodes`.
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let store = Self::new();
        {
            let mut map = store.nodes.write().unwrap_or_else(|e| e.into_inner());
            for node in nodes {
                map.insert(node.endpoint.clone(), node);
            }
        }
        store
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn get(&self, endpoint: &Endpoint) -> Result<Option<Node>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Ok(nodes.get(endpoint).cloned())
    }

    async fn list(&self) -> Result<Vec<Node>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Ok(nodes.values().cloned().collect())
    }

    async fn insert(&self, node: Node) -> Result<bool> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if nodes.contains_key(&node.endpoint) {
            return Ok(false);
        }
        nodes.insert(node.endpoint.clone(), node);
        Ok(true)
    }

    async fn update(&self, endpoint: &Endpoint, edit: NodeEdit) -> Result<Option<Node>> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        Ok(nodes.get_mut(endpoint).map(|node| {
            edit(node);
            node.clone()
        }))
    }
}

/// Per-node exclusive leases.
///
/// At most one replication pass may run against a node at a time; two
/// passes would race on `failed_imports` and `last_harvested`.
#[derive(Default)]
pub struct NodeLeases {
    locks: Mutex<HashMap<Endpoint, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of a pass; released on drop.
pub struct NodeLease {
    _guard: OwnedMutexGuard<()>,
}

impl NodeLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `endpoint` if nobody holds it.
    pub fn try_acquire(&self, endpoint: &Endpoint) -> Option<NodeLease> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(endpoint.clone()).or_default())
        };
        lock.try_lock_owned().ok().map(|guard| NodeLease { _guard: guard })
    }
}
