//! Message handler requests: inbound work queued in the durable store
//! until a worker leases and processes it.
//!
//! Delivery is at-least-once: a worker that dies between processing and
//! acknowledgment leaves the request to be leased again once its lease
//! expires. Handlers must tolerate seeing the same request twice.

use serde::{Deserialize, Serialize};

use crate::flow::FlowResponse;
use crate::ids::ClientId;

/// Handler kinds known to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HandlerKind {
    ClientStartup,
    Foreman,
    FlowResponses,
}

impl HandlerKind {
    pub fn name(self) -> &'static str {
        match self {
            HandlerKind::ClientStartup => "ClientStartupHandler",
            HandlerKind::Foreman => "ForemanHandler",
            HandlerKind::FlowResponses => "FlowResponsesHandler",
        }
    }
}

/// Typed request body; the variant selects the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "handler", content = "request")]
pub enum HandlerPayload {
    /// Agent (re)started and reported its metadata.
    #[serde(rename = "ClientStartupHandler")]
    ClientStartup(StartupInfo),
    /// Agent contacted the server; evaluate fleet rules for it.
    #[serde(rename = "ForemanHandler")]
    Foreman,
    /// Replies to flow requests, all from the request's client.
    #[serde(rename = "FlowResponsesHandler")]
    FlowResponses(Vec<FlowResponse>),
}

impl HandlerPayload {
    pub fn kind(&self) -> HandlerKind {
        match self {
            HandlerPayload::ClientStartup(_) => HandlerKind::ClientStartup,
            HandlerPayload::Foreman => HandlerKind::Foreman,
            HandlerPayload::FlowResponses(_) => HandlerKind::FlowResponses,
        }
    }
}

/// Queue key: unique per client, handler, and request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageHandlerKey {
    pub client_id: ClientId,
    pub handler: HandlerKind,
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHandlerRequest {
    pub client_id: ClientId,
    pub request_id: u64,
    pub payload: HandlerPayload,
    /// Set by the store on write.
    #[serde(default)]
    pub enqueued_at: u64,
    /// Worker currently holding the lease.
    #[serde(default)]
    pub leased_by: Option<String>,
    #[serde(default)]
    pub leased_until: Option<u64>,
}

impl MessageHandlerRequest {
    pub fn new(client_id: ClientId, request_id: u64, payload: HandlerPayload) -> Self {
        Self {
            client_id,
            request_id,
            payload,
            enqueued_at: 0,
            leased_by: None,
            leased_until: None,
        }
    }

    pub fn handler_name(&self) -> &'static str {
        self.payload.kind().name()
    }

    pub fn key(&self) -> MessageHandlerKey {
        MessageHandlerKey {
            client_id: self.client_id.clone(),
            handler: self.payload.kind(),
            request_id: self.request_id,
        }
    }

    /// True when no live lease covers the request at `now`.
    pub fn leasable(&self, now: u64) -> bool {
        self.leased_until.map_or(true, |until| until <= now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_name: String,
    pub client_version: u32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub timeline_btime_support: bool,
}

/// Metadata an agent reports when it starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupInfo {
    pub client_info: ClientInfo,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub boot_time: u64,
}
