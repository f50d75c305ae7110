//! Daemon state: every harvesting component wired over one data directory.
//!
//! Layout of the data directory:
//!
//! ```text
//! config.json     settings (written with defaults on first start)
//! nodes.json      known nodes
//! content/        harvested objects and their index
//! staging/        record payloads, when `stage_to_disk` is set
//! ```

use anyhow::{Context, Result, bail};
use chrono::Utc;
use harvest_core::{
    AsyncRunner, Collaborators, DiscoveryReport, Endpoint, EventBus, FederationDiscovery, FriendsDescription,
    HttpProtocolClient, Node, NodeLeases, NodeProbe, NodeStore, ProtocolClient, ReplicationCoordinator, RunHandle,
    Staging, select_nodes,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::content_store::DirectoryContentStore;
use crate::crosswalk::DublinCoreCrosswalk;
use crate::notifier::TracingNotifier;
use crate::persistence::JsonNodeStore;

pub struct Daemon {
    config: Config,
    local: Option<Endpoint>,
    store: Arc<JsonNodeStore>,
    events: Arc<EventBus>,
    coordinator: Arc<ReplicationCoordinator>,
    discovery: FederationDiscovery,
}

impl Daemon {
    /// Open the data directory and talk to nodes over HTTP.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let config = Config::load(data_dir)?;
        let client = HttpProtocolClient::new(&config.client()).context("Failed to build HTTP client")?;
        Self::with_client(data_dir, config, Arc::new(client)).await
    }

    /// Open the data directory with a given protocol client.
    pub async fn with_client(data_dir: &Path, config: Config, client: Arc<dyn ProtocolClient>) -> Result<Self> {
        let local = config.local_endpoint()?;
        let store = Arc::new(JsonNodeStore::open(data_dir).context("Failed to load nodes")?);
        let content = DirectoryContentStore::open(&data_dir.join("content"))
            .await
            .context("Failed to open content store")?;

        let staging = if config.stage_to_disk {
            let dir = data_dir.join("staging");
            std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create staging dir: {:?}", dir))?;
            Staging::Directory(dir)
        } else {
            Staging::Memory
        };

        let events = Arc::new(EventBus::new());
        let coordinator = ReplicationCoordinator::new(
            client.clone(),
            store.clone(),
            Collaborators {
                crosswalk: Arc::new(DublinCoreCrosswalk),
                content: Arc::new(content),
                notifier: Arc::new(TracingNotifier),
            },
            config.replication(),
        )
        .with_staging(staging)
        .with_leases(Arc::new(NodeLeases::new()))
        .with_events(events.clone());

        let mut discovery = FederationDiscovery::new(NodeProbe::new(client), store.clone())
            .with_events(events.clone())
            .with_max_rounds(config.discovery_max_rounds);
        if let Some(local) = &local {
            discovery = discovery.with_local_endpoint(local.clone());
        }

        Ok(Self {
            config,
            local,
            store,
            events,
            coordinator: Arc::new(coordinator),
            discovery,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<JsonNodeStore> {
        &self.store
    }

    /// Register a node by hand. Returns false if it was already known.
    pub async fn add_node(&self, raw: &str, active: bool, public: bool) -> Result<bool> {
        let endpoint = Endpoint::parse(raw).with_context(|| format!("Invalid endpoint: {}", raw))?;
        if self.local.as_ref() == Some(&endpoint) {
            bail!("{} is this node's own endpoint", endpoint);
        }

        let mut node = Node::new(endpoint.clone(), Utc::now());
        node.active = active;
        node.public = public;
        let added = self.store.insert(node).await?;
        if added {
            info!("Added node {}", endpoint);
        }
        Ok(added)
    }

    /// Turn harvesting of a known node on or off.
    pub async fn set_active(&self, raw: &str, active: bool) -> Result<Node> {
        let endpoint = Endpoint::parse(raw).with_context(|| format!("Invalid endpoint: {}", raw))?;
        let updated = self
            .store
            .update(&endpoint, Box::new(move |node| node.active = active))
            .await?;
        updated.with_context(|| format!("Unknown node: {}", endpoint))
    }

    /// All known nodes, nearest first.
    pub async fn nodes(&self) -> Result<Vec<Node>> {
        let mut nodes = self.store.list().await?;
        nodes.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.endpoint.cmp(&b.endpoint)));
        Ok(nodes)
    }

    /// Our own friends description, listing public live nodes.
    pub async fn friends(&self) -> Result<String> {
        let nodes = self.store.list().await?;
        Ok(FriendsDescription::from_nodes(&nodes).render()?)
    }

    /// Probe every known node and add newly advertised peers.
    pub async fn discover(&self) -> Result<DiscoveryReport> {
        Ok(self.discovery.discover_all().await?)
    }

    /// Start a harvest of every active node in the background.
    pub async fn start_harvest(&self) -> Result<RunHandle> {
        let nodes = select_nodes(self.store.as_ref()).await?;
        info!("Harvesting {} active node(s)", nodes.len());
        Ok(AsyncRunner::new(self.coordinator.clone()).spawn(nodes))
    }
}
