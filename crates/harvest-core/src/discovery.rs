//! FederationDiscovery: grow the known node set from friends lists.
//!
//! Probing a seed refreshes the seed's own record and walks its friends:
//! unknown peers are added one hop further out than the seed, inactive, and
//! known peers get their capability fields refreshed. A peer's `distance`
//! is set when it is first added and never changed afterwards, even if a
//! shorter path turns up later.

use crate::endpoint::Endpoint;
use crate::error::{HarvestError, Result};
use crate::events::{EventBus, HarvestEvent};
use crate::node::{Node, NodeDescriptor};
use crate::probe::NodeProbe;
use crate::store::NodeStore;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default bound on `discover_all` rounds.
pub const DEFAULT_MAX_ROUNDS: usize = 8;

/// Summary of a `discover_all` sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub rounds: usize,
    /// Nodes added, in the order they were found
    pub added: Vec<Endpoint>,
    /// Seeds whose probe failed
    pub unreachable: Vec<Endpoint>,
    /// Stopped at `max_rounds` with new nodes still unprobed
    pub truncated: bool,
}

/// Successful probes made during one sweep, so no node is probed twice.
#[derive(Default)]
struct Sweep {
    described: HashMap<Endpoint, NodeDescriptor>,
}

pub struct FederationDiscovery {
    probe: NodeProbe,
    store: Arc<dyn NodeStore>,
    local: Option<Endpoint>,
    events: Arc<EventBus>,
    max_rounds: usize,
}

impl FederationDiscovery {
    pub fn new(probe: NodeProbe, store: Arc<dyn NodeStore>) -> Self {
        Self {
            probe,
            store,
            local: None,
            events: Arc::new(EventBus::new()),
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    /// Our own endpoint, which is never added as a peer.
    pub fn with_local_endpoint(mut self, local: Endpoint) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Probe one known node and add its unknown friends.
    ///
    /// Returns the endpoints that were added. On probe failure the seed is
    /// marked not alive and the error returned.
    pub async fn discover_from(&self, seed: &Endpoint) -> Result<Vec<Endpoint>> {
        self.discover_in(seed, &mut Sweep::default()).await
    }

    /// Probe every known node, then keep probing newly added nodes until a
    /// round adds nothing or `max_rounds` is reached.
    pub async fn discover_all(&self) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        let mut sweep = Sweep::default();
        let mut frontier: Vec<Endpoint> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|n| n.endpoint)
            .filter(|ep| Some(ep) != self.local.as_ref())
            .collect();

        while !frontier.is_empty() {
            if report.rounds == self.max_rounds {
                report.truncated = true;
                break;
            }
            report.rounds += 1;
            debug!("Discovery round {}: {} seeds", report.rounds, frontier.len());

            let mut next = Vec::new();
            for seed in &frontier {
                match self.discover_in(seed, &mut sweep).await {
                    Ok(added) => next.extend(added),
                    Err(HarvestError::Store(e)) => return Err(HarvestError::Store(e)),
                    Err(e) => {
                        warn!("Discovery skipped {}: {}", seed, e);
                        report.unreachable.push(seed.clone());
                    }
                }
            }

            report.added.extend(next.iter().cloned());
            frontier = next;
        }

        info!(
            "Discovery finished after {} rounds: {} added, {} unreachable",
            report.rounds,
            report.added.len(),
            report.unreachable.len()
        );
        Ok(report)
    }

    async fn discover_in(&self, seed: &Endpoint, sweep: &mut Sweep) -> Result<Vec<Endpoint>> {
        let seed_node = self
            .store
            .get(seed)
            .await?
            .ok_or_else(|| HarvestError::UnknownNode(seed.to_string()))?;

        let descriptor = match self.describe(seed, sweep).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.store
                    .update(seed, Box::new(|node| node.mark_unreachable()))
                    .await?;
                return Err(e);
            }
        };
        self.refresh(seed, &descriptor).await?;

        let mut added = Vec::new();
        let mut seen = HashSet::new();
        for friend in &descriptor.friends {
            if friend == seed || Some(friend) == self.local.as_ref() || !seen.insert(friend.clone()) {
                continue;
            }

            if self.store.get(friend).await?.is_some() {
                // Known peer: capability refresh only. A failed probe here
                // leaves its record alone.
                match self.describe(friend, sweep).await {
                    Ok(descriptor) => self.refresh(friend, &descriptor).await?,
                    Err(e) => debug!("Could not refresh {}: {}", friend, e),
                }
                continue;
            }

            let node = Node::discovered(friend.clone(), &seed_node, Utc::now());
            let distance = node.distance;
            if self.store.insert(node).await? {
                info!("Discovered {} via {} (distance {})", friend, seed, distance);
                self.events.emit(HarvestEvent::NodeDiscovered {
                    endpoint: friend.clone(),
                    via: seed.clone(),
                    distance,
                });
                added.push(friend.clone());
            }
        }

        Ok(added)
    }

    async fn describe(&self, endpoint: &Endpoint, sweep: &mut Sweep) -> Result<NodeDescriptor> {
        if let Some(descriptor) = sweep.described.get(endpoint) {
            return Ok(descriptor.clone());
        }
        let descriptor = self.probe.describe(endpoint).await?;
        sweep.described.insert(endpoint.clone(), descriptor.clone());
        Ok(descriptor)
    }

    async fn refresh(&self, endpoint: &Endpoint, descriptor: &NodeDescriptor) -> Result<()> {
        let descriptor = descriptor.clone();
        let now = Utc::now();
        self.store
            .update(endpoint, Box::new(move |node| node.apply_descriptor(&descriptor, now)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::scripted::{RouteKey, ScriptedClient};
    use crate::store::InMemoryNodeStore;

    fn endpoint(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn identify(name: &str, friends: &[&str]) -> String {
        let friends: String = friends
            .iter()
            .map(|f| format!("<baseURL>{}</baseURL>", f))
            .collect();
        format!(
            r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><Identify>
<repositoryName>{name}</repositoryName><granularity>YYYY-MM-DDThh:mm:ssZ</granularity>
<description><friends xmlns="http://www.openarchives.org/OAI/2.0/friends/">{friends}</friends></description>
</Identify></OAI-PMH>"#
        )
    }

    const FORMATS: &str = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><ListMetadataFormats>
<metadataFormat><metadataPrefix>oai_dc</metadataPrefix></metadataFormat>
</ListMetadataFormats></OAI-PMH>"#;

    fn serve(client: &ScriptedClient, ep: &str, name: &str, friends: &[&str]) {
        let ep = endpoint(ep);
        client.respond(&ep, RouteKey::Identify, identify(name, friends));
        client.respond(&ep, RouteKey::ListMetadataFormats, FORMATS);
    }

    fn discovery(client: ScriptedClient, nodes: Vec<Node>) -> (FederationDiscovery, Arc<InMemoryNodeStore>) {
        let store = Arc::new(InMemoryNodeStore::with_nodes(nodes));
        let discovery = FederationDiscovery::new(NodeProbe::new(Arc::new(client)), store.clone());
        (discovery, store)
    }

    #[tokio::test]
    async fn test_discover_from_adds_friends_one_hop_out() {
        let client = ScriptedClient::new();
        serve(&client, "http://a.example.org/oai", "A", &["http://b.example.org/oai", "http://local.example.org/oai"]);
        let seed = Node::at_distance(endpoint("http://a.example.org/oai"), 2, Utc::now());
        let (discovery, store) = discovery(client, vec![seed]);
        let discovery = discovery.with_local_endpoint(endpoint("http://local.example.org/oai"));

        let added = discovery.discover_from(&endpoint("http://a.example.org/oai")).await.unwrap();

        assert_eq!(added, vec![endpoint("http://b.example.org/oai")]);
        let b = store.get(&added[0]).await.unwrap().unwrap();
        assert_eq!(b.distance, 3);
        assert!(b.alive);
        assert!(!b.active);

        let a = store.get(&endpoint("http://a.example.org/oai")).await.unwrap().unwrap();
        assert_eq!(a.name.as_deref(), Some("A"));
        assert!(a.last_seen.is_some());
        assert_eq!(a.supported_formats.len(), 1);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_known_friend_keeps_distance() {
        let client = ScriptedClient::new();
        serve(&client, "http://a.example.org/oai", "A", &["http://b.example.org/oai"]);
        serve(&client, "http://b.example.org/oai", "B renamed", &[]);
        let a = Node::at_distance(endpoint("http://a.example.org/oai"), 1, Utc::now());
        let mut b = Node::at_distance(endpoint("http://b.example.org/oai"), 5, Utc::now());
        b.name = Some("B".into());
        let (discovery, store) = discovery(client, vec![a, b]);

        let added = discovery.discover_from(&endpoint("http://a.example.org/oai")).await.unwrap();

        assert!(added.is_empty());
        let b = store.get(&endpoint("http://b.example.org/oai")).await.unwrap().unwrap();
        assert_eq!(b.distance, 5);
        assert_eq!(b.name.as_deref(), Some("B renamed"));
    }

    #[tokio::test]
    async fn test_failed_seed_is_downgraded_not_removed() {
        let client = ScriptedClient::new();
        let mut a = Node::new(endpoint("http://a.example.org/oai"), Utc::now());
        a.alive = true;
        let (discovery, store) = discovery(client, vec![a]);

        let err = discovery
            .discover_from(&endpoint("http://a.example.org/oai"))
            .await
            .unwrap_err();

        assert!(err.is_transport());
        let a = store.get(&endpoint("http://a.example.org/oai")).await.unwrap().unwrap();
        assert!(!a.alive);
    }

    #[tokio::test]
    async fn test_discover_all_reaches_fixed_point() {
        let client = ScriptedClient::new();
        serve(&client, "http://a.example.org/oai", "A", &["http://b.example.org/oai"]);
        serve(&client, "http://b.example.org/oai", "B", &["http://c.example.org/oai", "http://a.example.org/oai"]);
        serve(&client, "http://c.example.org/oai", "C", &["http://a.example.org/oai"]);
        let (discovery, store) = discovery(client, vec![Node::new(endpoint("http://a.example.org/oai"), Utc::now())]);

        let report = discovery.discover_all().await.unwrap();

        assert_eq!(
            report.added,
            vec![endpoint("http://b.example.org/oai"), endpoint("http://c.example.org/oai")]
        );
        assert_eq!(report.rounds, 3);
        assert!(!report.truncated);
        let c = store.get(&endpoint("http://c.example.org/oai")).await.unwrap().unwrap();
        assert_eq!(c.distance, 3);
    }

    #[tokio::test]
    async fn test_discover_all_respects_max_rounds() {
        let client = ScriptedClient::new();
        serve(&client, "http://a.example.org/oai", "A", &["http://b.example.org/oai"]);
        serve(&client, "http://b.example.org/oai", "B", &["http://c.example.org/oai"]);
        let (discovery, store) = discovery(client, vec![Node::new(endpoint("http://a.example.org/oai"), Utc::now())]);
        let discovery = discovery.with_max_rounds(1);

        let report = discovery.discover_all().await.unwrap();

        assert_eq!(report.rounds, 1);
        assert!(report.truncated);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_skipped() {
        let client = ScriptedClient::new();
        serve(&client, "http://a.example.org/oai", "A", &[]);
        let (discovery, _store) = discovery(
            client,
            vec![
                Node::new(endpoint("http://a.example.org/oai"), Utc::now()),
                Node::new(endpoint("http://down.example.org/oai"), Utc::now()),
            ],
        );

        let report = discovery.discover_all().await.unwrap();
        assert_eq!(report.unreachable, vec![endpoint("http://down.example.org/oai")]);
    }
}
