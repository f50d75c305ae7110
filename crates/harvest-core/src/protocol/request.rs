//! Protocol requests and the date convention they use.

use crate::endpoint::Endpoint;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use url::Url;

/// Protocol verbs used by the harvester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Identify,
    ListMetadataFormats,
    ListRecords,
    GetRecord,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Identify => "Identify",
            Verb::ListMetadataFormats => "ListMetadataFormats",
            Verb::ListRecords => "ListRecords",
            Verb::GetRecord => "GetRecord",
        }
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Datestamp granularity a node supports for `from`/`until`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Granularity {
    /// `YYYY-MM-DD`
    Day,
    /// `YYYY-MM-DDThh:mm:ssZ`
    #[default]
    Second,
}

impl Granularity {
    /// Parse the value of an Identify `granularity` element.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "YYYY-MM-DD" => Some(Granularity::Day),
            "YYYY-MM-DDThh:mm:ssZ" => Some(Granularity::Second),
            _ => None,
        }
    }

    /// Format a timestamp for use as a `from`/`until` argument.
    pub fn format(&self, at: &DateTime<Utc>) -> String {
        match self {
            Granularity::Day => at.format("%Y-%m-%d").to_string(),
            Granularity::Second => at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Parse a protocol datestamp in either granularity.
pub fn parse_datestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// One protocol request against a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OaiRequest {
    Identify,
    ListMetadataFormats,
    ListRecords {
        metadata_prefix: String,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        granularity: Granularity,
    },
    ResumeListRecords {
        token: String,
    },
    GetRecord {
        metadata_prefix: String,
        identifier: String,
    },
}

impl OaiRequest {
    pub fn verb(&self) -> Verb {
        match self {
            OaiRequest::Identify => Verb::Identify,
            OaiRequest::ListMetadataFormats => Verb::ListMetadataFormats,
            OaiRequest::ListRecords { .. } | OaiRequest::ResumeListRecords { .. } => Verb::ListRecords,
            OaiRequest::GetRecord { .. } => Verb::GetRecord,
        }
    }

    /// Query parameters, `verb` first.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("verb", self.verb().as_str().to_string())];
        match self {
            OaiRequest::Identify | OaiRequest::ListMetadataFormats => {}
            OaiRequest::ListRecords {
                metadata_prefix,
                from,
                until,
                granularity,
            } => {
                pairs.push(("metadataPrefix", metadata_prefix.clone()));
                if let Some(from) = from {
                    pairs.push(("from", granularity.format(from)));
                }
                if let Some(until) = until {
                    pairs.push(("until", granularity.format(until)));
                }
            }
            OaiRequest::ResumeListRecords { token } => {
                // A resumption request carries nothing but the token.
                pairs.push(("resumptionToken", token.clone()));
            }
            OaiRequest::GetRecord {
                metadata_prefix,
                identifier,
            } => {
                pairs.push(("metadataPrefix", metadata_prefix.clone()));
                pairs.push(("identifier", identifier.clone()));
            }
        }
        pairs
    }

    /// Full GET URL for this request against `endpoint`.
    pub fn url(&self, endpoint: &Endpoint) -> Url {
        let mut url = endpoint.url().clone();
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in self.query_pairs() {
                query.append_pair(key, &value);
            }
        }
        url
    }
}

impl Display for OaiRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OaiRequest::ResumeListRecords { token } => write!(f, "ListRecords(resume {})", token),
            OaiRequest::GetRecord { identifier, .. } => write!(f, "GetRecord({})", identifier),
            other => f.write_str(other.verb().as_str()),
        }
    }
}
