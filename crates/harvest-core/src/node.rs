//! Node: durable record of a peer repository in the federation.
//!
//! A node is identified by its endpoint alone. Everything else (name,
//! contact, formats, health) may change between probes; `distance` is fixed
//! at first discovery and never revised.

use crate::endpoint::Endpoint;
use crate::protocol::request::Granularity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A metadata format advertised by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    /// Prefix used in requests (e.g. `oai_dc`)
    pub metadata_prefix: String,
    /// Schema URL, if given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Payload namespace, if given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl FormatDescriptor {
    pub fn new(metadata_prefix: impl Into<String>) -> Self {
        Self {
            metadata_prefix: metadata_prefix.into(),
            schema: None,
            namespace: None,
        }
    }
}

/// What a successful probe learned about a node.
#[derive(Debug, Clone, Default)]
pub struct NodeDescriptor {
    pub name: Option<String>,
    pub admin_email: Option<String>,
    pub granularity: Granularity,
    pub earliest_datestamp: Option<DateTime<Utc>>,
    /// Peer endpoints advertised in the node's friends list
    pub friends: Vec<Endpoint>,
    pub formats: Vec<FormatDescriptor>,
}

/// A remote repository participating in the federation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub admin_email: Option<String>,
    /// Last probe (or pass) reached the node
    pub alive: bool,
    /// Operator has enabled harvesting
    pub active: bool,
    /// Advertise this node in our own friends list
    pub public: bool,
    /// Hop count from the local node, assigned once
    pub distance: u32,
    pub date_added: DateTime<Utc>,
    /// Upper bound of the most recent complete sync
    #[serde(default)]
    pub last_harvested: Option<DateTime<Utc>>,
    /// Last successful probe
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub supported_formats: Vec<FormatDescriptor>,
    /// External identifiers that failed to import on the last attempt
    #[serde(default)]
    pub failed_imports: BTreeSet<String>,
}

impl Node {
    /// Create a node registered directly by an operator (one hop away).
    pub fn new(endpoint: Endpoint, now: DateTime<Utc>) -> Self {
        Self::at_distance(endpoint, 1, now)
    }

    /// Create a node at a given hop distance. New nodes start inactive.
    pub fn at_distance(endpoint: Endpoint, distance: u32, now: DateTime<Utc>) -> Self {
        Self {
            endpoint,
            name: None,
            admin_email: None,
            alive: false,
            active: false,
            public: false,
            distance,
            date_added: now,
            last_harvested: None,
            last_seen: None,
            granularity: Granularity::default(),
            supported_formats: Vec::new(),
            failed_imports: BTreeSet::new(),
        }
    }

    /// Create a node first learned from `via`'s friends list.
    pub fn discovered(endpoint: Endpoint, via: &Node, now: DateTime<Utc>) -> Self {
        let mut node = Self::at_distance(endpoint, via.distance + 1, now);
        node.alive = true;
        node
    }

    /// Refresh the mutable capability fields from a successful probe.
    ///
    /// `distance` is never touched.
    pub fn apply_descriptor(&mut self, descriptor: &NodeDescriptor, now: DateTime<Utc>) {
        if descriptor.name.is_some() {
            self.name = descriptor.name.clone();
        }
        if descriptor.admin_email.is_some() {
            self.admin_email = descriptor.admin_email.clone();
        }
        self.granularity = descriptor.granularity;
        if !descriptor.formats.is_empty() {
            self.supported_formats = descriptor.formats.clone();
        }
        self.alive = true;
        self.last_seen = Some(now);
    }

    /// Downgrade after a failed probe or pass. The record is kept.
    pub fn mark_unreachable(&mut self) {
        self.alive = false;
    }

    /// Whether the node can serve `prefix`.
    ///
    /// A node that has not advertised any formats yet is given the benefit
    /// of the doubt.
    pub fn supports(&self, prefix: &str) -> bool {
        self.supported_formats.is_empty()
            || self
                .supported_formats
                .iter()
                .any(|f| f.metadata_prefix == prefix)
    }

    /// Display name, falling back to the endpoint.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.endpoint.as_str())
    }
}
