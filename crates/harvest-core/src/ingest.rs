//! Ingestion of one harvested record through the external collaborators.
//!
//! The crosswalk turns a staged payload into metadata; the content store
//! owns local objects. Ingestion is an upsert keyed by the record's identity
//! claim, so delivering the same record twice converges to one object.
//!
//! Implementations shipped here (`InMemoryContentStore`, `RecordingNotifier`)
//! are for tests and embedding; the daemon supplies on-disk ones.

use crate::endpoint::Endpoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

/// Failure reported by a crosswalk or content-store collaborator.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("Crosswalk failed: {0}")]
    Crosswalk(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Storage failed: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, CollaboratorError>;

/// One metadata field produced by a crosswalk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub element: String,
    pub value: String,
}

/// Domain metadata for one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub fields: Vec<MetadataField>,
    /// Canonical identifier embedded in the metadata, used to find an
    /// existing local object for this record
    pub identity: Option<String>,
}

impl RecordMetadata {
    pub fn push(&mut self, element: impl Into<String>, value: impl Into<String>) {
        self.fields.push(MetadataField {
            element: element.into(),
            value: value.into(),
        });
    }

    /// First value of `element`, if any.
    pub fn first(&self, element: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.element == element)
            .map(|f| f.value.as_str())
    }
}

/// Handle to a local object owned by the content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns a staged payload into domain metadata.
pub trait Crosswalk: Send + Sync {
    fn parse(&self, blob: &[u8]) -> Result<RecordMetadata>;
}

/// Local object storage.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Find the object holding `identity`.
    async fn find(&self, identity: &str) -> Result<Option<ObjectId>>;

    /// Overwrite an object's metadata in place.
    async fn replace_metadata(&self, object: &ObjectId, metadata: &RecordMetadata) -> Result<()>;

    /// Create and install a new object in `container`.
    async fn create(&self, container: &str, identity: &str, metadata: &RecordMetadata) -> Result<ObjectId>;

    /// Make everything written since the last commit durable.
    async fn commit(&self) -> Result<()>;
}

/// Operator-facing report about a pass that needs attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassNotice {
    pub endpoint: Endpoint,
    /// Why the pass stopped early, if it did
    pub aborted: Option<String>,
    /// Records still failing, with the reason where known
    pub bad_records: Vec<BadRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BadRecord {
    pub external_id: String,
    pub reason: Option<String>,
}

/// Delivers operator notices.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &PassNotice);
}

/// What ingesting one record did locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    Replaced,
}

/// Ingest one `(external_id, blob)` pair.
///
/// Every failure is scoped to this record; the caller records it as bad and
/// carries on with the batch.
pub async fn ingest_record(
    crosswalk: &dyn Crosswalk,
    content: &dyn ContentStore,
    destination: &str,
    external_id: &str,
    blob: &[u8],
) -> Result<IngestOutcome> {
    let metadata = crosswalk.parse(blob)?;
    let identity = metadata.identity.as_deref().unwrap_or(external_id);

    match content.find(identity).await? {
        Some(object) => {
            content.replace_metadata(&object, &metadata).await?;
            debug!("Replaced {} ({})", object, external_id);
            Ok(IngestOutcome::Replaced)
        }
        None => {
            let object = content.create(destination, identity, &metadata).await?;
            debug!("Created {} in {} ({})", object, destination, external_id);
            Ok(IngestOutcome::Created)
        }
    }
}

/// A stored object in `InMemoryContentStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub container: String,
    pub identity: String,
    pub metadata: RecordMetadata,
}

/// In-memory content store for testing.
#[derive(Default)]
pub struct InMemoryContentStore {
    objects: RwLock<HashMap<ObjectId, StoredObject>>,
    by_identity: RwLock<HashMap<String, ObjectId>>,
    commits: Mutex<usize>,
    /// Identities whose writes are rejected, to simulate authorization failures
    denied: RwLock<Vec<String>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes for `identity`.
    pub fn deny(&self, identity: &str) {
        self.denied
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(identity.to_string());
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, identity: &str) -> Option<StoredObject> {
        let id = self
            .by_identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()?;
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn commit_count(&self) -> usize {
        *self.commits.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_allowed(&self, identity: &str) -> Result<()> {
        let denied = self.denied.read().unwrap_or_else(|e| e.into_inner());
        if denied.iter().any(|d| d == identity) {
            return Err(CollaboratorError::Unauthorized(identity.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn find(&self, identity: &str) -> Result<Option<ObjectId>> {
        Ok(self
            .by_identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned())
    }

    async fn replace_metadata(&self, object: &ObjectId, metadata: &RecordMetadata) -> Result<()> {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let stored = objects
            .get_mut(object)
            .ok_or_else(|| CollaboratorError::Storage(format!("no such object {}", object)))?;
        self.check_allowed(&stored.identity)?;
        stored.metadata = metadata.clone();
        Ok(())
    }

    async fn create(&self, container: &str, identity: &str, metadata: &RecordMetadata) -> Result<ObjectId> {
        self.check_allowed(identity)?;
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let id = ObjectId(format!("obj-{}", objects.len() + 1));
        objects.insert(
            id.clone(),
            StoredObject {
                container: container.to_string(),
                identity: identity.to_string(),
                metadata: metadata.clone(),
            },
        );
        self.by_identity
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.to_string(), id.clone());
        Ok(id)
    }

    async fn commit(&self) -> Result<()> {
        *self.commits.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}

/// Notifier that keeps every notice, for tests.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<PassNotice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<PassNotice> {
        self.notices.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &PassNotice) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice.clone());
    }
}
