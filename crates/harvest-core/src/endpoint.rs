//! Endpoint: the stable identity of a node in the federation.
//!
//! Wraps a normalized base URL. Two spellings of the same base URL
//! (`HTTP://Repo.Example.org/oai/` and `http://repo.example.org/oai`)
//! compare equal, so a node is never registered twice.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (expected http or https)")]
    UnsupportedScheme(String),
    #[error("Endpoint has no host: {0}")]
    MissingHost(String),
}

/// Normalized base URL of a harvestable repository.
///
/// # Examples
/// ```
/// use harvest_core::Endpoint;
///
/// let a: Endpoint = "HTTP://Repo.Example.org/oai/".parse().unwrap();
/// let b: Endpoint = "http://repo.example.org/oai".parse().unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "http://repo.example.org/oai");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint(Url);

impl Endpoint {
    /// Parse and normalize a base URL.
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let mut url = Url::parse(raw.trim())?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(EndpointError::MissingHost(raw.to_string()));
        }

        url.set_query(None);
        url.set_fragment(None);

        let path = url.path();
        if path.len() > 1 && path.ends_with('/') {
            let trimmed = path.trim_end_matches('/').to_string();
            url.set_path(if trimmed.is_empty() { "/" } else { &trimmed });
        }
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Base URL for building requests.
    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0.into()
    }
}
