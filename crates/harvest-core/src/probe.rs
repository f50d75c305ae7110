//! NodeProbe: ask a node who it is, what it serves, and who its friends are.
//!
//! Identify and ListMetadataFormats responses are small, so unlike record
//! pages they are walked into a flat list of leaf elements and then read.
//!
//! A probe failure means "unreachable right now". Callers downgrade the node
//! (`alive = false`); they never remove it.

use crate::endpoint::Endpoint;
use crate::error::{HarvestError, Result};
use crate::node::{FormatDescriptor, Node, NodeDescriptor};
use crate::protocol::client::ProtocolClient;
use crate::protocol::request::{Granularity, OaiRequest, parse_datestamp};
use crate::protocol::xml::{FRIENDS_NS, NamespaceScopes, OAI_NS, attribute, utf8};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tracing::{debug, warn};

const FRIENDS_SCHEMA: &str = "http://www.openarchives.org/OAI/2.0/friends/ http://www.openarchives.org/OAI/2.0/friends.xsd";

/// Queries a node's identity and capabilities.
#[derive(Clone)]
pub struct NodeProbe {
    client: Arc<dyn ProtocolClient>,
}

impl NodeProbe {
    pub fn new(client: Arc<dyn ProtocolClient>) -> Self {
        Self { client }
    }

    /// Identify: name, contact, granularity and the friends list.
    pub async fn identify(&self, endpoint: &Endpoint) -> Result<NodeDescriptor> {
        let body = self.client.fetch(endpoint, &OaiRequest::Identify).await?;
        let leaves = walk(body).await?;

        let mut descriptor = NodeDescriptor::default();
        for leaf in &leaves {
            match (leaf.ns.as_deref(), leaf.name.as_str()) {
                (Some(OAI_NS), "repositoryName") if leaf.parent == "Identify" => {
                    descriptor.name = non_empty(&leaf.text);
                }
                (Some(OAI_NS), "adminEmail") if leaf.parent == "Identify" => {
                    if descriptor.admin_email.is_none() {
                        descriptor.admin_email = non_empty(&leaf.text);
                    }
                }
                (Some(OAI_NS), "granularity") if leaf.parent == "Identify" => match Granularity::parse(&leaf.text) {
                    Some(granularity) => descriptor.granularity = granularity,
                    None => warn!("{}: unknown granularity {:?}", endpoint, leaf.text.trim()),
                },
                (Some(OAI_NS), "earliestDatestamp") if leaf.parent == "Identify" => {
                    descriptor.earliest_datestamp = parse_datestamp(&leaf.text);
                }
                (Some(FRIENDS_NS), "baseURL") if leaf.in_description => match Endpoint::parse(leaf.text.trim()) {
                    Ok(friend) => {
                        if !descriptor.friends.contains(&friend) {
                            descriptor.friends.push(friend);
                        }
                    }
                    Err(e) => warn!("{}: skipping friend {:?}: {}", endpoint, leaf.text.trim(), e),
                },
                _ => {}
            }
        }

        debug!(
            "Identified {} ({:?}, {} friends)",
            endpoint,
            descriptor.name,
            descriptor.friends.len()
        );
        Ok(descriptor)
    }

    /// ListMetadataFormats.
    pub async fn list_formats(&self, endpoint: &Endpoint) -> Result<Vec<FormatDescriptor>> {
        let body = self.client.fetch(endpoint, &OaiRequest::ListMetadataFormats).await?;
        let leaves = walk(body).await?;

        let mut formats: Vec<(usize, FormatDescriptor)> = Vec::new();
        for leaf in leaves {
            if leaf.ns.as_deref() != Some(OAI_NS) || leaf.parent != "metadataFormat" {
                continue;
            }
            let index = match formats.iter().position(|(seq, _)| *seq == leaf.parent_seq) {
                Some(index) => index,
                None => {
                    formats.push((leaf.parent_seq, FormatDescriptor::new(String::new())));
                    formats.len() - 1
                }
            };
            let format = &mut formats[index].1;
            let value = leaf.text.trim().to_string();
            match leaf.name.as_str() {
                "metadataPrefix" => format.metadata_prefix = value,
                "schema" => format.schema = Some(value).filter(|v| !v.is_empty()),
                "metadataNamespace" => format.namespace = Some(value).filter(|v| !v.is_empty()),
                _ => {}
            }
        }

        Ok(formats
            .into_iter()
            .map(|(_, f)| f)
            .filter(|f| !f.metadata_prefix.is_empty())
            .collect())
    }

    /// Identify plus ListMetadataFormats.
    pub async fn describe(&self, endpoint: &Endpoint) -> Result<NodeDescriptor> {
        let mut descriptor = self.identify(endpoint).await?;
        descriptor.formats = self.list_formats(endpoint).await?;
        Ok(descriptor)
    }
}

fn render_err(e: impl std::fmt::Display) -> HarvestError {
    HarvestError::Staging(e.to_string())
}

fn non_empty(text: &str) -> Option<String> {
    Some(text.trim().to_string()).filter(|t| !t.is_empty())
}

/// A closed element and the text directly inside it.
#[derive(Debug)]
struct Leaf {
    ns: Option<String>,
    name: String,
    /// Local name of the enclosing element ("" at the root)
    parent: String,
    /// Position of the enclosing element in document order
    parent_seq: usize,
    /// Somewhere below an OAI `description` element
    in_description: bool,
    text: String,
}

struct Frame {
    ns: Option<String>,
    name: String,
    seq: usize,
    text: String,
    error_code: Option<String>,
}

/// Walk a whole response into leaves, checking the envelope on the way.
async fn walk<R>(reader: R) -> Result<Vec<Leaf>>
where
    R: AsyncBufRead + Unpin,
{
    let mut xml = Reader::from_reader(reader);
    let mut buf = Vec::new();
    let mut scopes = NamespaceScopes::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut leaves = Vec::new();
    let mut seq = 0;
    let mut saw_root = false;
    let mut root_closed = false;
    let mut error: Option<(String, String)> = None;

    loop {
        let event = xml.read_event_into_async(&mut buf).await?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                scopes.push(e)?;
                let (ns, name) = scopes.resolve(e)?;
                let ns = ns.map(str::to_string);

                if !saw_root {
                    if ns.as_deref() != Some(OAI_NS) || name != "OAI-PMH" {
                        return Err(HarvestError::MalformedResponse(format!(
                            "expected OAI-PMH root element, found <{}>",
                            name
                        )));
                    }
                    saw_root = true;
                }
                if root_closed {
                    return Err(HarvestError::MalformedResponse("content after </OAI-PMH>".into()));
                }

                let error_code = if ns.as_deref() == Some(OAI_NS) && name == "error" {
                    Some(attribute(e, "code")?.unwrap_or_default())
                } else {
                    None
                };
                seq += 1;
                stack.push(Frame {
                    ns,
                    name,
                    seq,
                    text: String::new(),
                    error_code,
                });
                if empty {
                    close(&mut stack, &mut leaves, &mut error, &mut root_closed);
                    scopes.pop();
                }
            }
            Event::End(_) => {
                close(&mut stack, &mut leaves, &mut error, &mut root_closed);
                scopes.pop();
            }
            Event::Text(t) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(utf8(&c)?);
                }
            }
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(HarvestError::MalformedResponse("empty response".into()));
    }
    if !root_closed {
        return Err(HarvestError::MalformedResponse("response truncated before </OAI-PMH>".into()));
    }
    if let Some((code, message)) = error {
        return Err(HarvestError::OaiError { code, message });
    }
    Ok(leaves)
}

fn close(stack: &mut Vec<Frame>, leaves: &mut Vec<Leaf>, error: &mut Option<(String, String)>, root_closed: &mut bool) {
    let Some(frame) = stack.pop() else {
        return;
    };
    if stack.is_empty() {
        *root_closed = true;
    }
    if let Some(code) = frame.error_code {
        if error.is_none() {
            *error = Some((code, frame.text.trim().to_string()));
        }
    }
    let (parent, parent_seq) = stack
        .last()
        .map(|p| (p.name.clone(), p.seq))
        .unwrap_or_default();
    let in_description = stack
        .iter()
        .any(|p| p.ns.as_deref() == Some(OAI_NS) && p.name == "description");
    leaves.push(Leaf {
        ns: frame.ns,
        name: frame.name,
        parent,
        parent_seq,
        in_description,
        text: frame.text,
    });
}

/// The local node's own `<description>` block advertising its peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FriendsDescription {
    pub endpoints: Vec<Endpoint>,
}

impl FriendsDescription {
    /// Peers that are both public and alive, in endpoint order.
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Self {
        let mut endpoints: Vec<Endpoint> = nodes
            .into_iter()
            .filter(|n| n.public && n.alive)
            .map(|n| n.endpoint.clone())
            .collect();
        endpoints.sort();
        endpoints.dedup();
        Self { endpoints }
    }

    /// Render as an Identify `<description>` element.
    pub fn render(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer
            .write_event(Event::Start(BytesStart::new("description")))
            .map_err(render_err)?;
        let mut friends = BytesStart::new("friends");
        friends.push_attribute(("xmlns", FRIENDS_NS));
        friends.push_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"));
        friends.push_attribute(("xsi:schemaLocation", FRIENDS_SCHEMA));
        writer.write_event(Event::Start(friends)).map_err(render_err)?;

        for endpoint in &self.endpoints {
            writer
                .write_event(Event::Start(BytesStart::new("baseURL")))
                .map_err(render_err)?;
            writer
                .write_event(Event::Text(BytesText::new(endpoint.as_str())))
                .map_err(render_err)?;
            writer
                .write_event(Event::End(BytesEnd::new("baseURL")))
                .map_err(render_err)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("friends")))
            .map_err(render_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("description")))
            .map_err(render_err)?;

        String::from_utf8(writer.into_inner()).map_err(|e| HarvestError::Staging(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::scripted::{RouteKey, ScriptedClient};
    use chrono::Utc;

    fn endpoint(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn identify_xml(description: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-03-05T07:08:09Z</responseDate>
  <request verb="Identify">http://a.example.org/oai</request>
  <Identify>
    <repositoryName>Repository A</repositoryName>
    <baseURL>http://a.example.org/oai</baseURL>
    <protocolVersion>2.0</protocolVersion>
    <adminEmail>first@a.example.org</adminEmail>
    <adminEmail>second@a.example.org</adminEmail>
    <earliestDatestamp>2001-01-01</earliestDatestamp>
    <deletedRecord>transient</deletedRecord>
    <granularity>YYYY-MM-DD</granularity>
    {description}
  </Identify>
</OAI-PMH>"#
        )
    }

    const FRIENDS: &str = r#"<description>
      <friends xmlns="http://www.openarchives.org/OAI/2.0/friends/">
        <baseURL>http://b.example.org/oai</baseURL>
        <baseURL>https://c.example.org/oai/</baseURL>
        <baseURL>not a url</baseURL>
      </friends>
    </description>"#;

    const FORMATS: &str = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListMetadataFormats>
    <metadataFormat>
      <metadataPrefix>oai_dc</metadataPrefix>
      <schema>http://www.openarchives.org/OAI/2.0/oai_dc.xsd</schema>
      <metadataNamespace>http://www.openarchives.org/OAI/2.0/oai_dc/</metadataNamespace>
    </metadataFormat>
    <metadataFormat>
      <metadataPrefix>mods</metadataPrefix>
    </metadataFormat>
  </ListMetadataFormats>
</OAI-PMH>"#;

    fn probe_with(ep: &Endpoint, key: RouteKey, body: &str) -> NodeProbe {
        let client = ScriptedClient::new();
        client.respond(ep, key, body);
        NodeProbe::new(Arc::new(client))
    }

    #[tokio::test]
    async fn test_identify() {
        let ep = endpoint("http://a.example.org/oai");
        let probe = probe_with(&ep, RouteKey::Identify, &identify_xml(FRIENDS));

        let descriptor = probe.identify(&ep).await.unwrap();

        assert_eq!(descriptor.name.as_deref(), Some("Repository A"));
        assert_eq!(descriptor.admin_email.as_deref(), Some("first@a.example.org"));
        assert_eq!(descriptor.granularity, Granularity::Day);
        assert!(descriptor.earliest_datestamp.is_some());
        assert_eq!(
            descriptor.friends,
            vec![endpoint("http://b.example.org/oai"), endpoint("https://c.example.org/oai")]
        );
    }

    #[tokio::test]
    async fn test_identify_ignores_other_descriptions() {
        let ep = endpoint("http://a.example.org/oai");
        let other = r#"<description>
      <oai-identifier xmlns="http://www.openarchives.org/OAI/2.0/oai-identifier">
        <baseURL>http://ignored.example.org/oai</baseURL>
      </oai-identifier>
    </description>"#;
        let probe = probe_with(&ep, RouteKey::Identify, &identify_xml(other));

        let descriptor = probe.identify(&ep).await.unwrap();
        assert!(descriptor.friends.is_empty());
    }

    #[tokio::test]
    async fn test_friends_outside_description_are_ignored() {
        let ep = endpoint("http://a.example.org/oai");
        let stray = r#"<friends xmlns="http://www.openarchives.org/OAI/2.0/friends/">
      <baseURL>http://stray.example.org/oai</baseURL>
    </friends>
    <description>
      <friends xmlns="http://www.openarchives.org/OAI/2.0/friends/">
        <baseURL>http://b.example.org/oai</baseURL>
      </friends>
    </description>"#;
        let probe = probe_with(&ep, RouteKey::Identify, &identify_xml(stray));

        let descriptor = probe.identify(&ep).await.unwrap();
        assert_eq!(descriptor.friends, vec![endpoint("http://b.example.org/oai")]);
    }

    #[tokio::test]
    async fn test_list_formats() {
        let ep = endpoint("http://a.example.org/oai");
        let probe = probe_with(&ep, RouteKey::ListMetadataFormats, FORMATS);

        let formats = probe.list_formats(&ep).await.unwrap();

        assert_eq!(formats.len(), 2);
        assert_eq!(formats[0].metadata_prefix, "oai_dc");
        assert_eq!(
            formats[0].namespace.as_deref(),
            Some("http://www.openarchives.org/OAI/2.0/oai_dc/")
        );
        assert_eq!(formats[1].metadata_prefix, "mods");
        assert!(formats[1].schema.is_none());
    }

    #[tokio::test]
    async fn test_describe_combines_both() {
        let ep = endpoint("http://a.example.org/oai");
        let client = ScriptedClient::new();
        client.respond(&ep, RouteKey::Identify, identify_xml(""));
        client.respond(&ep, RouteKey::ListMetadataFormats, FORMATS);
        let probe = NodeProbe::new(Arc::new(client));

        let descriptor = probe.describe(&ep).await.unwrap();
        assert_eq!(descriptor.name.as_deref(), Some("Repository A"));
        assert_eq!(descriptor.formats.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let ep = endpoint("http://down.example.org/oai");
        let probe = NodeProbe::new(Arc::new(ScriptedClient::new()));
        assert!(probe.identify(&ep).await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_garbage_is_malformed() {
        let ep = endpoint("http://a.example.org/oai");
        let probe = probe_with(&ep, RouteKey::Identify, "<html>Maintenance</html>");
        let err = probe.identify(&ep).await.unwrap_err();
        assert!(matches!(err, HarvestError::MalformedResponse(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_oai_error() {
        let ep = endpoint("http://a.example.org/oai");
        let xml = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><error code="badVerb">no</error></OAI-PMH>"#;
        let probe = probe_with(&ep, RouteKey::Identify, xml);
        let err = probe.identify(&ep).await.unwrap_err();
        assert_eq!(err.oai_code(), Some("badVerb"));
    }

    #[tokio::test]
    async fn test_friends_description_roundtrip() {
        let now = Utc::now();
        let mut b = Node::new(endpoint("http://b.example.org/oai"), now);
        b.public = true;
        b.alive = true;
        let mut hidden = Node::new(endpoint("http://hidden.example.org/oai"), now);
        hidden.alive = true;
        let mut dead = Node::new(endpoint("http://dead.example.org/oai"), now);
        dead.public = true;

        let description = FriendsDescription::from_nodes([&b, &hidden, &dead]);
        assert_eq!(description.endpoints, vec![b.endpoint.clone()]);

        let rendered = description.render().unwrap();
        let ep = endpoint("http://a.example.org/oai");
        let probe = probe_with(&ep, RouteKey::Identify, &identify_xml(&rendered));
        let descriptor = probe.identify(&ep).await.unwrap();
        assert_eq!(descriptor.friends, vec![b.endpoint]);
    }
}
