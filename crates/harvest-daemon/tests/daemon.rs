//! End-to-end daemon behavior over a real data directory and a scripted node.

use std::sync::Arc;

use harvest_core::protocol::RouteKey;
use harvest_core::{Endpoint, NodeOutcome, NodeStore, ScriptedClient};
use harvest_daemon::{Config, Daemon, DirectoryContentStore, JsonNodeStore};
use tempfile::TempDir;

const A: &str = "http://a.example.org/oai";
const B: &str = "http://b.example.org/oai";

fn endpoint(s: &str) -> Endpoint {
    s.parse().unwrap()
}

fn identify(name: &str, friends: &[&str]) -> String {
    let friends: String = friends.iter().map(|f| format!("<baseURL>{}</baseURL>", f)).collect();
    format!(
        "<OAI-PMH xmlns=\"http://www.openarchives.org/OAI/2.0/\"><Identify>\
         <repositoryName>{name}</repositoryName>\
         <adminEmail>admin@example.org</adminEmail>\
         <granularity>YYYY-MM-DDThh:mm:ssZ</granularity>\
         <description><friends xmlns=\"http://www.openarchives.org/OAI/2.0/friends/\">{friends}</friends></description>\
         </Identify></OAI-PMH>"
    )
}

const FORMATS: &str = "<OAI-PMH xmlns=\"http://www.openarchives.org/OAI/2.0/\"><ListMetadataFormats>\
    <metadataFormat><metadataPrefix>oai_dc</metadataPrefix></metadataFormat>\
    </ListMetadataFormats></OAI-PMH>";

fn dc_record(id: &str, title: &str) -> String {
    format!(
        "<record><header><identifier>{id}</identifier><datestamp>2024-03-01T00:00:00Z</datestamp></header>\
         <metadata><oai_dc:dc xmlns:oai_dc=\"http://www.openarchives.org/OAI/2.0/oai_dc/\" \
         xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\
         <dc:title>{title}</dc:title><dc:identifier>hdl:{id}</dc:identifier>\
         </oai_dc:dc></metadata></record>"
    )
}

fn list_records(records: &[String]) -> String {
    format!(
        "<OAI-PMH xmlns=\"http://www.openarchives.org/OAI/2.0/\"><ListRecords>{}</ListRecords></OAI-PMH>",
        records.concat()
    )
}

fn scripted() -> Arc<ScriptedClient> {
    let client = Arc::new(ScriptedClient::new());
    client.respond(&endpoint(A), RouteKey::Identify, identify("Repo A", &[B]));
    client.respond(&endpoint(A), RouteKey::ListMetadataFormats, FORMATS);
    client.respond(&endpoint(B), RouteKey::Identify, identify("Repo B", &[A]));
    client.respond(&endpoint(B), RouteKey::ListMetadataFormats, FORMATS);
    client.respond(
        &endpoint(A),
        RouteKey::ListRecords,
        list_records(&[
            dc_record("1", "First"),
            "<record><header><identifier>2</identifier></header><metadata><junk/></metadata></record>".to_string(),
        ]),
    );
    client
}

#[tokio::test]
async fn add_discover_harvest_and_reopen() {
    let dir = TempDir::new().unwrap();
    let client = scripted();
    let daemon = Daemon::with_client(dir.path(), Config::load(dir.path()).unwrap(), client.clone())
        .await
        .unwrap();

    assert!(daemon.add_node(A, true, true).await.unwrap());
    assert!(!daemon.add_node("http://A.example.org/oai/", true, true).await.unwrap());

    let report = daemon.discover().await.unwrap();
    assert_eq!(report.added, vec![endpoint(B)]);

    let nodes = daemon.nodes().await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].name.as_deref(), Some("Repo A"));
    assert_eq!(nodes[1].distance, 2);
    assert!(!nodes[1].active);

    let summary = daemon.start_harvest().await.unwrap().join().await.unwrap();
    assert_eq!(summary.outcomes.len(), 1);
    let NodeOutcome::Completed { report } = &summary.outcomes[0].1 else {
        panic!("harvest of A failed: {:?}", summary.outcomes[0].1);
    };
    assert_eq!(report.imported, 1);
    assert!(report.remaining_failures.contains("2"));

    let content = DirectoryContentStore::open(&dir.path().join("content")).await.unwrap();
    let stored = content.load("hdl:1").await.unwrap().unwrap();
    assert_eq!(stored.container, "harvested");
    assert_eq!(stored.metadata.first("title"), Some("First"));
    assert_eq!(content.indexed().await.unwrap(), vec!["hdl:1".to_string()]);

    // Everything the daemon learned is on disk.
    drop(daemon);
    let store = JsonNodeStore::open(dir.path()).unwrap();
    let a = store.get(&endpoint(A)).await.unwrap().unwrap();
    assert!(a.alive);
    assert!(a.last_harvested.is_some());
    assert_eq!(a.failed_imports.iter().collect::<Vec<_>>(), vec!["2"]);
}

#[tokio::test]
async fn local_endpoint_is_never_a_peer() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        local_endpoint: Some(B.to_string()),
        ..Config::default()
    };
    let daemon = Daemon::with_client(dir.path(), config, scripted()).await.unwrap();

    assert!(daemon.add_node(B, true, false).await.is_err());

    daemon.add_node(A, false, false).await.unwrap();
    let report = daemon.discover().await.unwrap();
    assert!(report.added.is_empty());
    assert_eq!(daemon.nodes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn activation_and_friends() {
    let dir = TempDir::new().unwrap();
    let daemon = Daemon::with_client(dir.path(), Config::default(), scripted())
        .await
        .unwrap();

    daemon.add_node(A, false, true).await.unwrap();
    assert!(daemon.set_active(B, true).await.is_err());
    assert!(daemon.set_active(A, true).await.unwrap().active);

    // Not yet probed, so not alive and not advertised.
    assert!(!daemon.friends().await.unwrap().contains(A));

    daemon.discover().await.unwrap();
    let friends = daemon.friends().await.unwrap();
    assert!(friends.contains("<baseURL>http://a.example.org/oai</baseURL>"));
    // B was discovered but is not public.
    assert!(!friends.contains("b.example.org"));
}

#[tokio::test]
async fn staged_to_disk_harvest() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        stage_to_disk: true,
        ..Config::default()
    };
    let daemon = Daemon::with_client(dir.path(), config, scripted()).await.unwrap();
    daemon.add_node(A, true, false).await.unwrap();

    let summary = daemon.start_harvest().await.unwrap().join().await.unwrap();

    assert_eq!(summary.failures(), 0);
    assert!(dir.path().join("staging").is_dir());
    // Staged payloads are gone once the batch is dropped.
    assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
}
