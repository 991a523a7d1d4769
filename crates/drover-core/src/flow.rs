//! Flow records, requests, and responses.
//!
//! A flow talks to exactly one agent. Every outbound request gets a
//! per-flow request id; the agent answers with zero or more message
//! responses followed by exactly one status response.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flow_args::FlowArgs;
use crate::ids::{ClientId, FlowId, HuntId, RequestId, ResponseId};

/// Lifecycle of a flow. COMPLETED and ERROR are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Running,
    Completed,
    Error,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FlowStatus::Running)
    }
}

/// (client, flow) pair identifying a flow record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub client_id: ClientId,
    pub flow_id: FlowId,
}

impl FlowKey {
    pub fn new(client_id: ClientId, flow_id: FlowId) -> Self {
        Self { client_id, flow_id }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.client_id, self.flow_id)
    }
}

/// Per-agent command budget. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub cpu_seconds: Option<f64>,
    pub network_bytes: Option<u64>,
}

/// Resources consumed by the agent on behalf of one flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_seconds: f64,
    pub network_bytes: u64,
}

impl ResourceUsage {
    pub fn add(&mut self, status: &ResponseStatus) {
        self.cpu_seconds += status.cpu_seconds_used;
        self.network_bytes += status.network_bytes_sent;
    }
}

/// Actions an agent can be asked to run. The action implementations live
/// on the agent; the server only names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    Timeline,
    TransferFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Error,
    /// The agent process died while executing the action.
    ClientCrashed,
}

/// Terminal response for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: StatusCode,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cpu_seconds_used: f64,
    #[serde(default)]
    pub network_bytes_sent: u64,
}

impl ResponseStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
            cpu_seconds_used: 0.0,
            network_bytes_sent: 0,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: message.into(),
            ..Self::ok()
        }
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::ClientCrashed,
            message: message.into(),
            ..Self::ok()
        }
    }

    pub fn with_usage(mut self, cpu_seconds: f64, network_bytes: u64) -> Self {
        self.cpu_seconds_used = cpu_seconds;
        self.network_bytes_sent = network_bytes;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResponsePayload {
    Message(serde_json::Value),
    Status(ResponseStatus),
}

/// One agent response. Streamed results share a request id and are
/// ordered by `response_id`; the status response carries the highest id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResponse {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: RequestId,
    pub response_id: ResponseId,
    pub payload: ResponsePayload,
}

impl FlowResponse {
    pub fn message(
        key: &FlowKey,
        request_id: RequestId,
        response_id: ResponseId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            client_id: key.client_id.clone(),
            flow_id: key.flow_id.clone(),
            request_id,
            response_id,
            payload: ResponsePayload::Message(payload),
        }
    }

    pub fn status(
        key: &FlowKey,
        request_id: RequestId,
        response_id: ResponseId,
        status: ResponseStatus,
    ) -> Self {
        Self {
            client_id: key.client_id.clone(),
            flow_id: key.flow_id.clone(),
            request_id,
            response_id,
            payload: ResponsePayload::Status(status),
        }
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.client_id.clone(), self.flow_id.clone())
    }
}

/// A request the flow is waiting on, with the continuation it resumes into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: RequestId,
    /// Serialized continuation, typed by the flow kind.
    pub next_state: serde_json::Value,
    /// `None` for self-addressed requests created by `call_state`.
    pub action: Option<ClientAction>,
    pub issued_at: u64,
}

/// Outbound copy of a request, queued for delivery to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientActionRequest {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub request_id: RequestId,
    pub action: ClientAction,
    pub payload: serde_json::Value,
    /// Remaining CPU budget at issue time.
    pub cpu_limit: Option<f64>,
    /// Remaining network budget at issue time.
    pub network_bytes_limit: Option<u64>,
    pub issued_at: u64,
}

/// Flow state persisted between suspensions, tagged with the schema
/// version of the flow kind that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedState {
    pub version: u32,
    pub data: serde_json::Value,
}

impl Default for VersionedState {
    fn default() -> Self {
        Self {
            version: 0,
            data: serde_json::Value::Null,
        }
    }
}

/// Durable flow record. Rewritten atomically after every processing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub args: FlowArgs,
    pub state: VersionedState,
    pub status: FlowStatus,
    /// Human readable failure, set when status is ERROR.
    pub error: Option<String>,
    /// Set when the agent crashed while serving this flow.
    pub crashed: bool,
    pub pending: BTreeMap<RequestId, PendingRequest>,
    pub next_request_id: RequestId,
    pub next_request_to_process: RequestId,
    pub budget: ResourceBudget,
    pub usage: ResourceUsage,
    pub num_replies_sent: u64,
    pub parent_hunt_id: Option<HuntId>,
    pub create_time: u64,
    pub last_update_time: u64,
    /// Bumped by the store on every committed write.
    pub revision: u64,
}

impl FlowRecord {
    pub fn new(
        client_id: ClientId,
        flow_id: FlowId,
        args: FlowArgs,
        budget: ResourceBudget,
        parent_hunt_id: Option<HuntId>,
        now: u64,
    ) -> Self {
        Self {
            client_id,
            flow_id,
            args,
            state: VersionedState::default(),
            status: FlowStatus::Running,
            error: None,
            crashed: false,
            pending: BTreeMap::new(),
            next_request_id: 1,
            next_request_to_process: 1,
            budget,
            usage: ResourceUsage::default(),
            num_replies_sent: 0,
            parent_hunt_id,
            create_time: now,
            last_update_time: now,
            revision: 0,
        }
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.client_id.clone(), self.flow_id.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One entry of a flow's externally visible result stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub hunt_id: Option<HuntId>,
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowLogEntry {
    pub client_id: ClientId,
    pub flow_id: FlowId,
    pub timestamp: u64,
    pub message: String,
}
