//! Error type shared by the protocol, splitter, probe and coordinator layers.
//!
//! The split between `Transport` and `MalformedResponse` matters to callers:
//! transport failures mean the node is probably down, malformed responses
//! mean the node answered with something we cannot read. Both abort a
//! replication pass, but they are reported differently.

use crate::endpoint::EndpointError;
use crate::ingest::CollaboratorError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Protocol error {code}: {message}")]
    OaiError { code: String, message: String },

    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Node store error: {0}")]
    Store(#[from] StoreError),

    #[error("Content store error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Node is busy: another pass holds {0}")]
    NodeBusy(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node {endpoint} does not advertise metadata format {prefix}")]
    UnsupportedFormat { endpoint: String, prefix: String },
}

impl HarvestError {
    /// OAI error code if this is a protocol-level error response.
    pub fn oai_code(&self) -> Option<&str> {
        match self {
            HarvestError::OaiError { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the error means the node could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, HarvestError::Transport(_))
    }
}

impl From<quick_xml::Error> for HarvestError {
    fn from(err: quick_xml::Error) -> Self {
        match err {
            // Body reads go through the XML reader, so a dropped connection
            // mid-response shows up here as an I/O error.
            quick_xml::Error::Io(io) => HarvestError::Transport(io.to_string()),
            other => HarvestError::MalformedResponse(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: HarvestError = quick_xml::Error::Io(io.into()).into();
        assert!(err.is_transport());
    }

    #[test]
    fn test_oai_code() {
        let err = HarvestError::OaiError {
            code: "badVerb".into(),
            message: "nope".into(),
        };
        assert_eq!(err.oai_code(), Some("badVerb"));
        assert!(HarvestError::Transport("x".into()).oai_code().is_none());
    }
}
