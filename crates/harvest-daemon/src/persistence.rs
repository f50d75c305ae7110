//! Persistence for known nodes.
//!
//! Stores the node set to disk for recovery after restarts.
//! Nodes are stored in `nodes.json` within the data directory, rewritten
//! through a temp file and a rename so a crash never leaves half a file.

use async_trait::async_trait;
use harvest_core::store::{NodeEdit, NodeStore, Result, StoreError};
use harvest_core::{Endpoint, Node};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// On-disk layout of `nodes.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedNodes {
    /// All known nodes.
    pub nodes: Vec<Node>,
}

/// NodeStore backed by a JSON file.
pub struct JsonNodeStore {
    /// Path to the storage file.
    path: PathBuf,
    /// In-memory copy, written through on every change.
    nodes: Mutex<BTreeMap<Endpoint, Node>>,
}

impl JsonNodeStore {
    /// Open `nodes.json` in `data_dir`, starting empty if it does not exist.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("nodes.json");
        let loaded = Self::load(&path)?;
        debug!("Loaded {} nodes from {:?}", loaded.nodes.len(), path);

        Ok(Self {
            path,
            nodes: Mutex::new(loaded.nodes.into_iter().map(|n| (n.endpoint.clone(), n)).collect()),
        })
    }

    fn load(path: &Path) -> Result<PersistedNodes> {
        if !path.exists() {
            return Ok(PersistedNodes::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| StoreError::Serialization(format!("{:?}: {}", path, e)))
    }

    fn save(&self, nodes: &BTreeMap<Endpoint, Node>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let persisted = PersistedNodes {
            nodes: nodes.values().cloned().collect(),
        };
        let contents =
            serde_json::to_string_pretty(&persisted).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NodeStore for JsonNodeStore {
    async fn get(&self, endpoint: &Endpoint) -> Result<Option<Node>> {
        Ok(self.nodes.lock().await.get(endpoint).cloned())
    }

    async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().await.values().cloned().collect())
    }

    async fn insert(&self, node: Node) -> Result<bool> {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(&node.endpoint) {
            return Ok(false);
        }
        nodes.insert(node.endpoint.clone(), node);
        self.save(&nodes)?;
        Ok(true)
    }

    async fn update(&self, endpoint: &Endpoint, edit: NodeEdit) -> Result<Option<Node>> {
        let mut nodes = self.nodes.lock().await;
        let Some(node) = nodes.get_mut(endpoint) else {
            return Ok(None);
        };
        let before = node.clone();
        edit(node);
        let updated = node.clone();

        if let Err(e) = self.save(&nodes) {
            // Keep memory and disk in step.
            nodes.insert(endpoint.clone(), before);
            return Err(e);
        }
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn endpoint(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let temp_dir = TempDir::new().unwrap();

        // First session: add nodes
        {
            let store = JsonNodeStore::open(temp_dir.path()).unwrap();
            let mut a = Node::new(endpoint("http://a.example.org/oai"), Utc::now());
            a.failed_imports.insert("oai:a:1".into());
            assert!(store.insert(a).await.unwrap());
            assert!(store
                .insert(Node::at_distance(endpoint("http://b.example.org/oai"), 2, Utc::now()))
                .await
                .unwrap());
        }

        let file = temp_dir.path().join("nodes.json");
        assert!(file.exists());
        assert!(!temp_dir.path().join("nodes.json.tmp").exists());

        // Second session: everything is back
        {
            let store = JsonNodeStore::open(temp_dir.path()).unwrap();
            let nodes = store.list().await.unwrap();
            assert_eq!(nodes.len(), 2);

            let a = store.get(&endpoint("http://a.example.org/oai")).await.unwrap().unwrap();
            assert!(a.failed_imports.contains("oai:a:1"));
            let b = store.get(&endpoint("http://b.example.org/oai")).await.unwrap().unwrap();
            assert_eq!(b.distance, 2);
        }
    }

    #[tokio::test]
    async fn test_update_is_written_through() {
        let temp_dir = TempDir::new().unwrap();
        let ep = endpoint("http://a.example.org/oai");
        let store = JsonNodeStore::open(temp_dir.path()).unwrap();
        store.insert(Node::new(ep.clone(), Utc::now())).await.unwrap();

        store.update(&ep, Box::new(|n| n.active = true)).await.unwrap();

        let reopened = JsonNodeStore::open(temp_dir.path()).unwrap();
        assert!(reopened.get(&ep).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_insert_never_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let ep = endpoint("http://a.example.org/oai");
        let store = JsonNodeStore::open(temp_dir.path()).unwrap();

        store.insert(Node::at_distance(ep.clone(), 1, Utc::now())).await.unwrap();
        assert!(!store.insert(Node::at_distance(ep.clone(), 4, Utc::now())).await.unwrap());

        assert_eq!(store.get(&ep).await.unwrap().unwrap().distance, 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("nodes.json"), "[[[").unwrap();
        assert!(matches!(
            JsonNodeStore::open(temp_dir.path()),
            Err(StoreError::Serialization(_))
        ));
    }
}
