//! Scripted protocol client for testing.
//!
//! Responses are registered per endpoint and request shape. Unregistered
//! requests fail as transport errors, which is what an unreachable node
//! looks like to the coordinator.

use crate::endpoint::Endpoint;
use crate::error::{HarvestError, Result};
use crate::protocol::client::{ProtocolClient, ResponseBody};
use crate::protocol::request::OaiRequest;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

/// Request shape a scripted response answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Identify,
    ListMetadataFormats,
    /// First page of ListRecords, whatever the window
    ListRecords,
    /// A resumption request carrying this token
    Resume(String),
    /// GetRecord for this identifier
    GetRecord(String),
}

impl RouteKey {
    pub fn of(request: &OaiRequest) -> Self {
        match request {
            OaiRequest::Identify => RouteKey::Identify,
            OaiRequest::ListMetadataFormats => RouteKey::ListMetadataFormats,
            OaiRequest::ListRecords { .. } => RouteKey::ListRecords,
            OaiRequest::ResumeListRecords { token } => RouteKey::Resume(token.clone()),
            OaiRequest::GetRecord { identifier, .. } => RouteKey::GetRecord(identifier.clone()),
        }
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Body(Vec<u8>),
    Transport(String),
}

/// In-memory protocol client with canned responses.
#[derive(Default)]
pub struct ScriptedClient {
    routes: Mutex<HashMap<(Endpoint, RouteKey), Scripted>>,
    log: Mutex<Vec<(Endpoint, OaiRequest)>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `key` on `endpoint` with `body`.
    pub fn respond(&self, endpoint: &Endpoint, key: RouteKey, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((endpoint.clone(), key), Scripted::Body(body.into()));
    }

    /// Fail `key` on `endpoint` with a transport error.
    pub fn fail(&self, endpoint: &Endpoint, key: RouteKey, reason: &str) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((endpoint.clone(), key), Scripted::Transport(reason.to_string()));
    }

    /// Every request made so far, in order.
    pub fn requests(&self) -> Vec<(Endpoint, OaiRequest)> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Requests made against one endpoint.
    pub fn requests_to(&self, endpoint: &Endpoint) -> Vec<OaiRequest> {
        self.requests()
            .into_iter()
            .filter(|(ep, _)| ep == endpoint)
            .map(|(_, r)| r)
            .collect()
    }
}

#[async_trait]
impl ProtocolClient for ScriptedClient {
    async fn fetch(&self, endpoint: &Endpoint, request: &OaiRequest) -> Result<ResponseBody> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((endpoint.clone(), request.clone()));

        let scripted = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(endpoint.clone(), RouteKey::of(request)))
            .cloned();

        match scripted {
            Some(Scripted::Body(body)) => Ok(Box::new(Cursor::new(body))),
            Some(Scripted::Transport(reason)) => Err(HarvestError::Transport(reason)),
            None => Err(HarvestError::Transport(format!("connection refused: {} {}", endpoint, request))),
        }
    }
}
