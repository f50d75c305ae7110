//! On-disk content store.
//!
//! Each object is a JSON file under `objects/`, named by the SHA-256 of the
//! record identity, so finding an object never needs the index. `index.json`
//! lists every object by identity and is rewritten on `commit()`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::ingest::Result;
use harvest_core::{CollaboratorError, ContentStore, ObjectId, RecordMetadata};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// A harvested object as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub identity: String,
    pub container: String,
    pub metadata: RecordMetadata,
    pub updated_at: DateTime<Utc>,
}

/// One line of `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub object: String,
    pub container: String,
}

fn storage_err(e: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::Storage(e.to_string())
}

/// Content-addressed object key for an identity.
pub fn object_key(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.as_bytes()))
}

pub struct DirectoryContentStore {
    root: PathBuf,
    index: Mutex<BTreeMap<String, IndexEntry>>,
}

impl DirectoryContentStore {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("objects")).await.map_err(storage_err)?;

        let index_path = root.join("index.json");
        let index = match fs::read_to_string(&index_path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(storage_err)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(storage_err(e)),
        };

        Ok(Self {
            root: root.to_path_buf(),
            index: Mutex::new(index),
        })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join("objects").join(format!("{}.json", key))
    }

    /// Read one object back by identity.
    pub async fn load(&self, identity: &str) -> Result<Option<StoredRecord>> {
        let path = self.object_path(&object_key(identity));
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents).map_err(storage_err)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Identities listed in the last committed index.
    pub async fn indexed(&self) -> Result<Vec<String>> {
        let contents = match fs::read_to_string(self.root.join("index.json")).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err(e)),
        };
        let index: BTreeMap<String, IndexEntry> = serde_json::from_str(&contents).map_err(storage_err)?;
        Ok(index.into_keys().collect())
    }

    async fn write_atomic(path: &Path, contents: String) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).await.map_err(storage_err)?;
        fs::rename(&tmp, path).await.map_err(storage_err)
    }

    async fn write_record(&self, key: &str, record: &StoredRecord) -> Result<()> {
        let contents = serde_json::to_string_pretty(record).map_err(storage_err)?;
        Self::write_atomic(&self.object_path(key), contents).await
    }
}

#[async_trait]
impl ContentStore for DirectoryContentStore {
    async fn find(&self, identity: &str) -> Result<Option<ObjectId>> {
        let key = object_key(identity);
        let exists = fs::try_exists(self.object_path(&key)).await.map_err(storage_err)?;
        Ok(exists.then_some(ObjectId(key)))
    }

    async fn replace_metadata(&self, object: &ObjectId, metadata: &RecordMetadata) -> Result<()> {
        let path = self.object_path(&object.0);
        let contents = fs::read_to_string(&path)
            .await
            .map_err(|e| CollaboratorError::Storage(format!("{}: {}", object, e)))?;
        let mut record: StoredRecord = serde_json::from_str(&contents).map_err(storage_err)?;

        record.metadata = metadata.clone();
        record.updated_at = Utc::now();
        self.write_record(&object.0, &record).await
    }

    async fn create(&self, container: &str, identity: &str, metadata: &RecordMetadata) -> Result<ObjectId> {
        let key = object_key(identity);
        let record = StoredRecord {
            identity: identity.to_string(),
            container: container.to_string(),
            metadata: metadata.clone(),
            updated_at: Utc::now(),
        };
        self.write_record(&key, &record).await?;

        self.index.lock().await.insert(
            identity.to_string(),
            IndexEntry {
                object: key.clone(),
                container: container.to_string(),
            },
        );
        Ok(ObjectId(key))
    }

    async fn commit(&self) -> Result<()> {
        let index = self.index.lock().await;
        let contents = serde_json::to_string_pretty(&*index).map_err(storage_err)?;
        Self::write_atomic(&self.root.join("index.json"), contents).await?;
        debug!("Committed content index ({} objects)", index.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::ingest::ingest_record;
    use harvest_core::{Crosswalk, IngestOutcome};
    use tempfile::TempDir;

    struct TitleOnly;

    impl Crosswalk for TitleOnly {
        fn parse(&self, blob: &[u8]) -> Result<RecordMetadata> {
            let mut metadata = RecordMetadata::default();
            metadata.push("title", String::from_utf8_lossy(blob));
            Ok(metadata)
        }
    }

    fn titled(title: &str) -> RecordMetadata {
        let mut metadata = RecordMetadata::default();
        metadata.push("title", title);
        metadata
    }

    #[tokio::test]
    async fn test_create_find_replace() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryContentStore::open(dir.path()).await.unwrap();

        assert!(store.find("hdl:1").await.unwrap().is_none());
        let id = store.create("harvested", "hdl:1", &titled("First")).await.unwrap();
        assert_eq!(store.find("hdl:1").await.unwrap(), Some(id.clone()));

        store.replace_metadata(&id, &titled("Second")).await.unwrap();
        let record = store.load("hdl:1").await.unwrap().unwrap();
        assert_eq!(record.container, "harvested");
        assert_eq!(record.metadata.first("title"), Some("Second"));
    }

    #[tokio::test]
    async fn test_index_written_on_commit_only() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryContentStore::open(dir.path()).await.unwrap();

        store.create("harvested", "hdl:1", &titled("A")).await.unwrap();
        assert!(store.indexed().await.unwrap().is_empty());

        store.commit().await.unwrap();
        assert_eq!(store.indexed().await.unwrap(), vec!["hdl:1".to_string()]);

        // Index survives reopening and keeps accumulating.
        let reopened = DirectoryContentStore::open(dir.path()).await.unwrap();
        reopened.create("harvested", "hdl:2", &titled("B")).await.unwrap();
        reopened.commit().await.unwrap();
        assert_eq!(reopened.indexed().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_twice_converges() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryContentStore::open(dir.path()).await.unwrap();

        let first = ingest_record(&TitleOnly, &store, "harvested", "oai:x:1", b"Same").await.unwrap();
        let second = ingest_record(&TitleOnly, &store, "harvested", "oai:x:1", b"Same").await.unwrap();

        assert_eq!(first, IngestOutcome::Created);
        assert_eq!(second, IngestOutcome::Replaced);
        let objects = std::fs::read_dir(dir.path().join("objects")).unwrap().count();
        assert_eq!(objects, 1);
    }

    #[tokio::test]
    async fn test_replace_missing_object_fails() {
        let dir = TempDir::new().unwrap();
        let store = DirectoryContentStore::open(dir.path()).await.unwrap();

        let err = store
            .replace_metadata(&ObjectId(object_key("nope")), &titled("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Storage(_)));
    }
}
