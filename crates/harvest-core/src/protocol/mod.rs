//! The harvesting protocol: requests, transport, and XML helpers.

pub mod client;
pub mod request;
pub mod scripted;
pub mod xml;

pub use client::{ClientConfig, HttpProtocolClient, ProtocolClient, ResponseBody};
pub use request::{Granularity, OaiRequest, Verb};
pub use scripted::{RouteKey, ScriptedClient};
