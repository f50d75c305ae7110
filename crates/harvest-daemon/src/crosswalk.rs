//! Dublin Core crosswalk.
//!
//! Turns an `oai_dc` payload into flat metadata fields: every element in the
//! DC elements namespace becomes one field named by its local name. The first
//! `identifier` is taken as the record's identity.

use harvest_core::ingest::Result;
use harvest_core::protocol::xml::{NamespaceScopes, utf8};
use harvest_core::{CollaboratorError, Crosswalk, RecordMetadata};
use quick_xml::Reader;
use quick_xml::events::Event;

/// Dublin Core element set 1.1.
pub const DC_NS: &str = "http://purl.org/dc/elements/1.1/";

#[derive(Debug, Default, Clone, Copy)]
pub struct DublinCoreCrosswalk;

impl DublinCoreCrosswalk {
    pub fn new() -> Self {
        Self
    }
}

fn crosswalk_err(e: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::Crosswalk(e.to_string())
}

impl Crosswalk for DublinCoreCrosswalk {
    fn parse(&self, blob: &[u8]) -> Result<RecordMetadata> {
        let mut xml = Reader::from_reader(blob);
        let mut buf = Vec::new();
        let mut scopes = NamespaceScopes::new();
        let mut metadata = RecordMetadata::default();
        // Local name and text of the DC element currently open, if any
        let mut current: Option<(String, String)> = None;

        loop {
            match xml.read_event_into(&mut buf).map_err(crosswalk_err)? {
                Event::Eof => break,
                Event::Start(ref e) => {
                    scopes.push(e).map_err(crosswalk_err)?;
                    let (ns, name) = scopes.resolve(e).map_err(crosswalk_err)?;
                    // Innermost DC element wins
                    if ns == Some(DC_NS) {
                        current = Some((name, String::new()));
                    }
                }
                Event::Empty(ref e) => {
                    scopes.push(e).map_err(crosswalk_err)?;
                    scopes.pop();
                }
                Event::End(ref e) => {
                    let (ns, name) = scopes.resolve_raw(e.name().as_ref()).map_err(crosswalk_err)?;
                    if ns == Some(DC_NS) && current.as_ref().is_some_and(|(open, _)| *open == name) {
                        if let Some((element, text)) = current.take() {
                            let value = text.trim();
                            if !value.is_empty() {
                                metadata.push(element, value);
                            }
                        }
                    }
                    scopes.pop();
                }
                Event::Text(t) => {
                    if let Some((_, text)) = current.as_mut() {
                        text.push_str(&t.unescape().map_err(crosswalk_err)?);
                    }
                }
                Event::CData(c) => {
                    if let Some((_, text)) = current.as_mut() {
                        text.push_str(utf8(&c).map_err(crosswalk_err)?);
                    }
                }
                _ => {}
            }
            buf.clear();
        }

        if metadata.fields.is_empty() {
            return Err(CollaboratorError::Crosswalk("no Dublin Core elements found".into()));
        }
        metadata.identity = metadata.first("identifier").map(str::to_string);
        Ok(metadata)
    }
}
