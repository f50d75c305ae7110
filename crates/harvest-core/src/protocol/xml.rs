//! Namespace bookkeeping for streaming XML.
//!
//! quick-xml hands us raw prefixed names. The splitter and the probe both
//! need to know which namespace an element belongs to, and the splitter
//! additionally needs to re-declare prefixes when it cuts a subtree out of
//! its surrounding document, so we keep our own scope stack instead of
//! relying on the reader's resolver.

use crate::error::{HarvestError, Result};
use quick_xml::events::BytesStart;
use quick_xml::events::attributes::Attribute;

/// OAI-PMH 2.0 response namespace.
pub const OAI_NS: &str = "http://www.openarchives.org/OAI/2.0/";
/// Namespace of the `friends` description block listing peer endpoints.
pub const FRIENDS_NS: &str = "http://www.openarchives.org/OAI/2.0/friends/";

/// A namespace declaration: `None` prefix is the default namespace.
pub type Binding = (Option<String>, String);

/// Stack of namespace declarations, one frame per open element.
#[derive(Debug, Default)]
pub struct NamespaceScopes {
    frames: Vec<Vec<Binding>>,
}

impl NamespaceScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a frame for `element`, recording any `xmlns` attributes on it.
    pub fn push(&mut self, element: &BytesStart<'_>) -> Result<()> {
        let frame = declarations(element)?;
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Resolve a prefix to its namespace URI, innermost declaration first.
    pub fn lookup(&self, prefix: Option<&str>) -> Option<&str> {
        self.frames
            .iter()
            .rev()
            .flat_map(|frame| frame.iter())
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
            .filter(|uri| !uri.is_empty())
    }

    /// Resolve an element to `(namespace, local name)`.
    pub fn resolve<'a>(&'a self, element: &BytesStart<'_>) -> Result<(Option<&'a str>, String)> {
        let (prefix, local) = split_name(element.name().as_ref())?;
        Ok((self.lookup(prefix.as_deref()), local))
    }

    /// Resolve an end tag by its raw name.
    pub fn resolve_raw<'a>(&'a self, raw: &[u8]) -> Result<(Option<&'a str>, String)> {
        let (prefix, local) = split_name(raw)?;
        Ok((self.lookup(prefix.as_deref()), local))
    }
}

/// Split a raw `prefix:local` name.
pub fn split_name(raw: &[u8]) -> Result<(Option<String>, String)> {
    let name = utf8(raw)?;
    Ok(match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name.to_string()),
    })
}

/// Namespace declarations carried by an element's own attributes.
pub fn declarations(element: &BytesStart<'_>) -> Result<Vec<Binding>> {
    let mut bindings = Vec::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| HarvestError::MalformedResponse(e.to_string()))?;
        let key = attr.key.as_ref();
        if key == b"xmlns" {
            bindings.push((None, utf8(&attr.value)?.to_string()));
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            bindings.push((Some(utf8(prefix)?.to_string()), utf8(&attr.value)?.to_string()));
        }
    }
    Ok(bindings)
}

/// Prefixes an element needs bound: its own, plus those of its attributes.
///
/// `xmlns` declarations and the implicitly bound `xml` prefix are skipped.
pub fn used_prefixes(element: &BytesStart<'_>) -> Result<Vec<Option<String>>> {
    let (own, _) = split_name(element.name().as_ref())?;
    let mut used = vec![own];
    for attr in element.attributes() {
        let attr = attr.map_err(|e| HarvestError::MalformedResponse(e.to_string()))?;
        let key = attr.key.as_ref();
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }
        if let (Some(prefix), _) = split_name(key)? {
            if prefix != "xml" && !used.contains(&Some(prefix.clone())) {
                used.push(Some(prefix));
            }
        }
    }
    Ok(used)
}

/// Unescaped value of a named attribute, if present.
pub fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr: Attribute<'_> = attr.map_err(|e| HarvestError::MalformedResponse(e.to_string()))?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| HarvestError::MalformedResponse(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

pub fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| HarvestError::MalformedResponse(e.to_string()))
}
