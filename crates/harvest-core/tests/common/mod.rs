//! Shared fixtures for harvest-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use harvest_core::{
    CollaboratorError, Collaborators, Crosswalk, Endpoint, InMemoryContentStore, InMemoryNodeStore, Node,
    RecordMetadata, RecordingNotifier, ReplicationConfig, ReplicationCoordinator, ScriptedClient,
};

/// Payloads look like `<doc xmlns="urn:doc"><id>hdl:1</id><title>T</title></doc>`.
/// Anything containing `BAD` fails to parse.
pub struct DocCrosswalk;

impl Crosswalk for DocCrosswalk {
    fn parse(&self, blob: &[u8]) -> harvest_core::ingest::Result<RecordMetadata> {
        let text = std::str::from_utf8(blob).map_err(|e| CollaboratorError::Crosswalk(e.to_string()))?;
        if text.contains("BAD") {
            return Err(CollaboratorError::Crosswalk("payload rejected".into()));
        }
        let mut metadata = RecordMetadata::default();
        if let Some(title) = between(text, "<title>", "</title>") {
            metadata.push("title", title);
        }
        metadata.identity = between(text, "<id>", "</id>").map(str::to_string);
        Ok(metadata)
    }
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

pub fn t(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
}

pub fn endpoint(s: &str) -> Endpoint {
    s.parse().unwrap()
}

pub fn ok(title: &str) -> String {
    format!("<title>{title}</title>")
}

pub const BAD: &str = "BAD";

pub fn page(records: &[(&str, String)], token: Option<&str>) -> String {
    let mut body = String::new();
    for (id, payload) in records {
        body.push_str(&format!(
            "<record><header><identifier>{id}</identifier><datestamp>2024-03-01</datestamp></header>\
             <metadata><doc xmlns=\"urn:doc\">{payload}</doc></metadata></record>"
        ));
    }
    if let Some(token) = token {
        body.push_str(&format!("<resumptionToken>{token}</resumptionToken>"));
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <OAI-PMH xmlns=\"http://www.openarchives.org/OAI/2.0/\"><ListRecords>{body}</ListRecords></OAI-PMH>"
    )
}

pub fn get_record(id: &str, payload: &str) -> String {
    format!(
        "<OAI-PMH xmlns=\"http://www.openarchives.org/OAI/2.0/\"><GetRecord><record>\
         <header><identifier>{id}</identifier></header>\
         <metadata><doc xmlns=\"urn:doc\">{payload}</doc></metadata>\
         </record></GetRecord></OAI-PMH>"
    )
}

pub struct Harness {
    pub endpoint: Endpoint,
    pub client: Arc<ScriptedClient>,
    pub store: Arc<InMemoryNodeStore>,
    pub content: Arc<InMemoryContentStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub coordinator: Arc<ReplicationCoordinator>,
}

impl Harness {
    pub fn new(nodes: Vec<Node>) -> Self {
        let endpoint = nodes
            .first()
            .map(|n| n.endpoint.clone())
            .unwrap_or_else(|| endpoint("http://a.example.org/oai"));
        let client = Arc::new(ScriptedClient::new());
        let store = Arc::new(InMemoryNodeStore::with_nodes(nodes));
        let content = Arc::new(InMemoryContentStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let coordinator = Arc::new(ReplicationCoordinator::new(
            client.clone(),
            store.clone(),
            Collaborators {
                crosswalk: Arc::new(DocCrosswalk),
                content: content.clone(),
                notifier: notifier.clone(),
            },
            ReplicationConfig::default(),
        ));
        Self {
            endpoint,
            client,
            store,
            content,
            notifier,
            coordinator,
        }
    }

    /// One active node at `http://a.example.org/oai`.
    pub fn single(edit: impl FnOnce(&mut Node)) -> Self {
        let mut node = Node::new(endpoint("http://a.example.org/oai"), t(0));
        node.active = true;
        edit(&mut node);
        Self::new(vec![node])
    }

    pub async fn node(&self) -> Node {
        use harvest_core::NodeStore;
        self.store.get(&self.endpoint).await.unwrap().unwrap()
    }
}
