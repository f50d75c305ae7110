//! ResponseSplitter: streaming parser that cuts a ListRecords/GetRecord
//! response into per-record payloads.
//!
//! The response is consumed event by event and never held whole. Each
//! record's `<metadata>` subtree is re-emitted verbatim into its own staged
//! document with an XML declaration, re-declaring any namespace prefixes the
//! subtree inherited from the envelope so the payload parses on its own.
//!
//! States:
//! - `Nominal`: walking the envelope
//! - `InIdentifier`: collecting a record header's identifier text
//! - `InMetadata`: copying a payload subtree to the stage
//! - `InContinuation`: collecting the resumption token
//! - `InError`: collecting the message of an OAI `<error>`

use crate::batch::{HarvestBatch, StageWriter, Staging};
use crate::error::{HarvestError, Result};
use crate::protocol::xml::{NamespaceScopes, OAI_NS, attribute, declarations, used_prefixes, utf8};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tokio::io::AsyncBufRead;
use tracing::{debug, trace};

/// OAI error code meaning "nothing in the requested window".
pub const NO_RECORDS_MATCH: &str = "noRecordsMatch";
/// OAI error code for a GetRecord on an unknown identifier.
pub const ID_DOES_NOT_EXIST: &str = "idDoesNotExist";

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitState {
    Nominal,
    InIdentifier,
    InMetadata,
    InContinuation,
    InError,
}

impl SplitState {
    fn element(&self) -> &'static str {
        match self {
            SplitState::Nominal => "envelope",
            SplitState::InIdentifier => "identifier",
            SplitState::InMetadata => "metadata",
            SplitState::InContinuation => "resumptionToken",
            SplitState::InError => "error",
        }
    }
}

/// Splits protocol responses into `HarvestBatch`es.
#[derive(Debug, Clone, Default)]
pub struct ResponseSplitter {
    staging: Staging,
}

impl ResponseSplitter {
    pub fn new(staging: Staging) -> Self {
        Self { staging }
    }

    /// Consume one response and return its batch.
    ///
    /// An OAI `noRecordsMatch` error yields an empty batch; any other OAI
    /// error is returned as `HarvestError::OaiError`.
    pub async fn split<R>(&self, reader: R) -> Result<HarvestBatch>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut xml = Reader::from_reader(reader);
        let mut buf = Vec::new();
        let mut scopes = NamespaceScopes::new();
        let mut machine = Machine::new(&self.staging);

        loop {
            let event = xml.read_event_into_async(&mut buf).await?;
            if matches!(event, Event::Eof) {
                break;
            }
            machine.handle(event, &mut scopes)?;
            buf.clear();
        }

        machine.finish()
    }
}

/// Copy of one payload subtree in progress.
struct Capture {
    writer: Writer<StageWriter>,
    /// Open elements inside the payload (0 = directly under `<metadata>`)
    depth: usize,
    /// Prefixes declared (or re-declared) by each open payload element
    declared: Vec<Vec<Option<String>>>,
}

impl Capture {
    fn open(staging: &Staging) -> Result<Self> {
        let mut writer = Writer::new(staging.open()?);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(stage_err)?;
        Ok(Self {
            writer,
            depth: 0,
            declared: Vec::new(),
        })
    }

    fn start(&mut self, element: &BytesStart<'_>, scopes: &NamespaceScopes, empty: bool) -> Result<()> {
        let mut frame: Vec<Option<String>> = declarations(element)?.into_iter().map(|(p, _)| p).collect();
        let mut out = element.clone().into_owned();

        for prefix in used_prefixes(element)? {
            if frame.contains(&prefix) || self.declared.iter().any(|f| f.contains(&prefix)) {
                continue;
            }
            if let Some(uri) = scopes.lookup(prefix.as_deref()) {
                let key = match &prefix {
                    Some(p) => format!("xmlns:{}", p),
                    None => "xmlns".to_string(),
                };
                out.push_attribute((key.as_str(), uri));
                frame.push(prefix);
            }
        }

        if empty {
            self.writer.write_event(Event::Empty(out)).map_err(stage_err)
        } else {
            self.declared.push(frame);
            self.depth += 1;
            self.writer.write_event(Event::Start(out)).map_err(stage_err)
        }
    }

    fn end(&mut self, element: BytesEnd<'_>) -> Result<()> {
        self.declared.pop();
        self.depth -= 1;
        self.writer.write_event(Event::End(element)).map_err(stage_err)
    }

    fn text(&mut self, text: BytesText<'_>) -> Result<()> {
        // Whitespace between <metadata> and the payload root is envelope formatting.
        if self.depth == 0 && text.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        self.writer.write_event(Event::Text(text)).map_err(stage_err)
    }

    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.writer.write_event(event).map_err(stage_err)
    }
}

fn stage_err(e: impl std::fmt::Display) -> HarvestError {
    HarvestError::Staging(e.to_string())
}

/// The state machine proper, fed one event at a time.
struct Machine<'s> {
    staging: &'s Staging,
    state: SplitState,
    batch: HarvestBatch,
    capture: Option<Capture>,
    /// Identifier of the record currently being read
    current_id: Option<String>,
    text: String,
    in_header: bool,
    header_deleted: bool,
    error_code: String,
    error: Option<(String, String)>,
    saw_root: bool,
    root_closed: bool,
}

impl<'s> Machine<'s> {
    fn new(staging: &'s Staging) -> Self {
        Self {
            staging,
            state: SplitState::Nominal,
            batch: HarvestBatch::new(),
            capture: None,
            current_id: None,
            text: String::new(),
            in_header: false,
            header_deleted: false,
            error_code: String::new(),
            error: None,
            saw_root: false,
            root_closed: false,
        }
    }

    fn handle(&mut self, event: Event<'_>, scopes: &mut NamespaceScopes) -> Result<()> {
        match event {
            Event::Start(e) => {
                scopes.push(&e)?;
                self.on_start(&e, scopes, false)
            }
            Event::Empty(e) => {
                scopes.push(&e)?;
                let result = self.on_start(&e, scopes, true);
                scopes.pop();
                result
            }
            Event::End(e) => {
                let result = self.on_end(e, scopes);
                scopes.pop();
                result
            }
            Event::Text(t) => self.on_text(t),
            Event::CData(c) => self.on_cdata(c),
            event @ (Event::Comment(_) | Event::PI(_)) => match self.capture.as_mut() {
                Some(capture) if self.state == SplitState::InMetadata => capture.write(event),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn violation(&self, what: &str) -> HarvestError {
        HarvestError::MalformedResponse(format!("unexpected {} inside <{}>", what, self.state.element()))
    }

    fn on_start(&mut self, element: &BytesStart<'_>, scopes: &NamespaceScopes, empty: bool) -> Result<()> {
        match self.state {
            SplitState::InMetadata => match self.capture.as_mut() {
                Some(capture) => capture.start(element, scopes, empty),
                None => Err(self.violation("element")),
            },
            SplitState::InIdentifier | SplitState::InContinuation | SplitState::InError => {
                let (_, local) = scopes.resolve(element)?;
                Err(self.violation(&format!("element <{}>", local)))
            }
            SplitState::Nominal => self.on_envelope_start(element, scopes, empty),
        }
    }

    fn on_envelope_start(&mut self, element: &BytesStart<'_>, scopes: &NamespaceScopes, empty: bool) -> Result<()> {
        let (ns, local) = scopes.resolve(element)?;
        let in_oai = ns == Some(OAI_NS);

        if !self.saw_root {
            if in_oai && local == "OAI-PMH" {
                self.saw_root = true;
                self.root_closed = empty;
                return Ok(());
            }
            return Err(HarvestError::MalformedResponse(format!(
                "expected OAI-PMH root element, found <{}> in {:?}",
                local, ns
            )));
        }
        if !in_oai {
            return Ok(());
        }

        match local.as_str() {
            "header" => {
                self.in_header = !empty;
                self.current_id = None;
                self.header_deleted = attribute(element, "status")?.as_deref() == Some("deleted");
            }
            "identifier" if self.in_header && !empty => {
                self.state = SplitState::InIdentifier;
                self.text.clear();
            }
            "metadata" if !empty => {
                self.state = SplitState::InMetadata;
                self.capture = Some(Capture::open(self.staging)?);
            }
            "resumptionToken" => {
                if empty {
                    self.batch.continuation_token = None;
                } else {
                    self.state = SplitState::InContinuation;
                    self.text.clear();
                }
            }
            "error" => {
                self.error_code = attribute(element, "code")?.unwrap_or_default();
                if empty {
                    self.record_error(String::new());
                } else {
                    self.state = SplitState::InError;
                    self.text.clear();
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_end(&mut self, element: BytesEnd<'_>, scopes: &NamespaceScopes) -> Result<()> {
        let (ns, local) = scopes.resolve_raw(element.name().as_ref())?;
        let closes = |name: &str| ns == Some(OAI_NS) && local == name;

        match self.state {
            SplitState::InMetadata => {
                let at_payload_boundary = self.capture.as_ref().is_some_and(|c| c.depth == 0);
                if !at_payload_boundary {
                    return match self.capture.as_mut() {
                        Some(capture) => capture.end(element),
                        None => Err(self.violation("end tag")),
                    };
                }
                let capture = self.capture.take().ok_or_else(|| self.violation("end tag"))?;
                let blob = capture.writer.into_inner().finish()?;
                let id = self.current_id.take().ok_or_else(|| {
                    HarvestError::MalformedResponse("record metadata without a header identifier".into())
                })?;
                trace!("Staged record {}", id);
                self.batch.push(id, blob);
                self.state = SplitState::Nominal;
            }
            SplitState::InIdentifier => {
                if !closes("identifier") {
                    return Err(self.violation(&format!("</{}>", local)));
                }
                self.current_id = Some(self.text.trim().to_string()).filter(|id| !id.is_empty());
                self.state = SplitState::Nominal;
            }
            SplitState::InContinuation => {
                if !closes("resumptionToken") {
                    return Err(self.violation(&format!("</{}>", local)));
                }
                let token = self.text.trim();
                self.batch.continuation_token = (!token.is_empty()).then(|| token.to_string());
                self.state = SplitState::Nominal;
            }
            SplitState::InError => {
                if !closes("error") {
                    return Err(self.violation(&format!("</{}>", local)));
                }
                let message = self.text.trim().to_string();
                self.record_error(message);
                self.state = SplitState::Nominal;
            }
            SplitState::Nominal => {
                if closes("header") {
                    if self.header_deleted {
                        if let Some(id) = self.current_id.take() {
                            self.batch.deleted.push(id);
                        }
                    }
                    self.in_header = false;
                } else if closes("OAI-PMH") && scopes.depth() == 1 {
                    self.root_closed = true;
                }
            }
        }
        Ok(())
    }

    fn on_text(&mut self, text: BytesText<'_>) -> Result<()> {
        match self.state {
            SplitState::InIdentifier | SplitState::InContinuation | SplitState::InError => {
                self.text.push_str(&text.unescape()?);
                Ok(())
            }
            SplitState::InMetadata => match self.capture.as_mut() {
                Some(capture) => capture.text(text),
                None => Err(self.violation("text")),
            },
            SplitState::Nominal => Ok(()),
        }
    }

    fn on_cdata(&mut self, cdata: BytesCData<'_>) -> Result<()> {
        match self.state {
            SplitState::InIdentifier | SplitState::InContinuation | SplitState::InError => {
                self.text.push_str(utf8(&cdata)?);
                Ok(())
            }
            SplitState::InMetadata => match self.capture.as_mut() {
                Some(capture) => capture.write(Event::CData(cdata)),
                None => Err(self.violation("CDATA")),
            },
            SplitState::Nominal => Ok(()),
        }
    }

    fn record_error(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some((std::mem::take(&mut self.error_code), message));
        }
    }

    fn finish(self) -> Result<HarvestBatch> {
        if self.state != SplitState::Nominal {
            return Err(HarvestError::MalformedResponse(format!(
                "response ended inside <{}>",
                self.state.element()
            )));
        }
        if !self.saw_root {
            return Err(HarvestError::MalformedResponse("empty response".into()));
        }
        if !self.root_closed {
            return Err(HarvestError::MalformedResponse("response truncated before </OAI-PMH>".into()));
        }

        if let Some((code, message)) = self.error {
            if code == NO_RECORDS_MATCH {
                debug!("No records match: {}", message);
                return Ok(HarvestBatch::new());
            }
            return Err(HarvestError::OaiError { code, message });
        }

        Ok(self.batch)
    }
}
