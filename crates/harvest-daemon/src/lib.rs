//! harvest-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod content_store;
pub mod crosswalk;
pub mod daemon;
pub mod notifier;
pub mod persistence;

// Re-export key types for convenience
pub use config::Config;
pub use content_store::{DirectoryContentStore, StoredRecord};
pub use crosswalk::{DC_NS, DublinCoreCrosswalk};
pub use daemon::Daemon;
pub use notifier::TracingNotifier;
pub use persistence::JsonNodeStore;
