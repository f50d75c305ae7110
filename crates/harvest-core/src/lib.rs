//! harvest-core: metadata harvesting and replication for a federation of
//! repositories.
//!
//! This crate provides:
//! - Protocol requests over HTTP with streamed response bodies
//! - A streaming splitter that cuts record pages into standalone payloads
//! - Per-node replication passes with watermark and failure bookkeeping
//! - Peer discovery through exchanged friends lists
//! - NodeStore, ContentStore, Crosswalk and Notifier trait abstractions

pub mod batch;
pub mod coordinator;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod ingest;
pub mod node;
pub mod probe;
pub mod protocol;
pub mod runner;
pub mod splitter;
pub mod store;

pub use batch::{HarvestBatch, HarvestedRecord, StagedBlob, Staging};
pub use coordinator::{Collaborators, PassPhase, PassReport, ReplicationConfig, ReplicationCoordinator, ReplicationRun};
pub use discovery::{DiscoveryReport, FederationDiscovery};
pub use endpoint::{Endpoint, EndpointError};
pub use error::{HarvestError, Result};
pub use events::{EventBus, HarvestEvent, Subscription};
pub use ingest::{
    BadRecord, CollaboratorError, ContentStore, Crosswalk, InMemoryContentStore, IngestOutcome, MetadataField, Notifier,
    ObjectId, PassNotice, RecordMetadata, RecordingNotifier,
};
pub use node::{FormatDescriptor, Node, NodeDescriptor};
pub use probe::{FriendsDescription, NodeProbe};
pub use protocol::{ClientConfig, Granularity, HttpProtocolClient, OaiRequest, ProtocolClient, ScriptedClient};
pub use runner::{AsyncRunner, NodeOutcome, RunHandle, RunProgress, RunSummary, select_nodes};
pub use splitter::{ResponseSplitter, SplitState};
pub use store::{InMemoryNodeStore, NodeEdit, NodeLeases, NodeStore, StoreError};
