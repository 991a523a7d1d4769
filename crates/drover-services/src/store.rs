//! Durable store contract.
//!
//! Everything the engine persists goes through [`Datastore`]: the message
//! handler queue, client metadata, flow records with their responses and
//! results, the agent-bound request queue, hunts and foreman rules. The
//! engine only relies on per-record atomicity; flow and hunt records carry a
//! `revision` that writers compare-and-swap on.

use std::time::Duration;

use drover_core::flow::{
    ClientActionRequest, FlowKey, FlowLogEntry, FlowRecord, FlowResponse, FlowResult,
};
use drover_core::hunt::{ForemanRule, HuntCounters, HuntRecord};
use drover_core::message::{MessageHandlerKey, MessageHandlerRequest, StartupInfo};
use drover_core::{ClientId, HuntId, RequestId, StoreError};

/// Everything produced by one flow step, applied as a single transaction.
///
/// The store rejects the commit with [`StoreError::Conflict`] if the stored
/// record's revision no longer equals `expected_revision`; nothing is written
/// in that case.
#[derive(Debug, Clone)]
pub struct FlowStepCommit {
    pub record: FlowRecord,
    pub expected_revision: u64,
    /// Requests whose stored responses are dropped with this commit.
    pub processed_requests: Vec<RequestId>,
    pub results: Vec<FlowResult>,
    pub client_requests: Vec<ClientActionRequest>,
    /// Responses the engine produces for itself (state calls).
    pub synthetic_responses: Vec<FlowResponse>,
    pub logs: Vec<FlowLogEntry>,
}

impl FlowStepCommit {
    pub fn new(record: FlowRecord, expected_revision: u64) -> Self {
        Self {
            record,
            expected_revision,
            processed_requests: Vec::new(),
            results: Vec::new(),
            client_requests: Vec::new(),
            synthetic_responses: Vec::new(),
            logs: Vec::new(),
        }
    }
}

pub trait Datastore: Send + Sync {
    // ── message handler queue ───────────────────────────────────────────

    /// Enqueue requests. A request with an existing key replaces the old one
    /// and clears its lease.
    fn write_message_handler_requests(
        &self,
        requests: Vec<MessageHandlerRequest>,
    ) -> Result<(), StoreError>;

    fn read_message_handler_requests(&self) -> Result<Vec<MessageHandlerRequest>, StoreError>;

    /// Lease up to `limit` requests whose lease is absent or expired at
    /// `now`, oldest enqueued first, marking them owned by `owner` until
    /// `now + lease`.
    fn lease_message_handler_requests(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
        now: u64,
    ) -> Result<Vec<MessageHandlerRequest>, StoreError>;

    /// Returns how many of `keys` were present.
    fn delete_message_handler_requests(
        &self,
        keys: &[MessageHandlerKey],
    ) -> Result<usize, StoreError>;

    // ── clients ─────────────────────────────────────────────────────────

    fn write_client_startup_info(
        &self,
        client_id: &ClientId,
        info: StartupInfo,
    ) -> Result<(), StoreError>;

    fn read_client_startup_info(
        &self,
        client_id: &ClientId,
    ) -> Result<Option<StartupInfo>, StoreError>;

    fn count_clients(&self) -> Result<u64, StoreError>;

    // ── flows ───────────────────────────────────────────────────────────

    /// Create a flow record. Fails with `AlreadyExists` if the key is taken.
    fn write_flow(&self, record: FlowRecord) -> Result<(), StoreError>;

    fn read_flow(&self, key: &FlowKey) -> Result<Option<FlowRecord>, StoreError>;

    fn read_flows_for_hunt(&self, hunt_id: &HuntId) -> Result<Vec<FlowRecord>, StoreError>;

    /// Terminal flows last updated before `cutoff`.
    fn read_terminal_flows_before(&self, cutoff: u64) -> Result<Vec<FlowRecord>, StoreError>;

    /// Apply a step atomically. Returns the stored record (revision bumped).
    fn commit_flow_step(&self, commit: FlowStepCommit) -> Result<FlowRecord, StoreError>;

    /// Store agent responses. Responses for unknown flows, terminal flows or
    /// requests that are not pending are discarded; the discarded count is
    /// returned. Re-delivered responses overwrite by response id.
    fn write_flow_responses(&self, responses: Vec<FlowResponse>) -> Result<usize, StoreError>;

    /// Responses stored for one request, ordered by response id.
    fn read_flow_responses(
        &self,
        key: &FlowKey,
        request_id: RequestId,
    ) -> Result<Vec<FlowResponse>, StoreError>;

    fn read_flow_results(
        &self,
        key: &FlowKey,
        offset: usize,
        count: usize,
    ) -> Result<Vec<FlowResult>, StoreError>;

    fn read_flow_logs(&self, key: &FlowKey) -> Result<Vec<FlowLogEntry>, StoreError>;

    /// Remove a flow with its responses, results, logs and queued agent
    /// requests. Returns whether it existed.
    fn delete_flow(&self, key: &FlowKey) -> Result<bool, StoreError>;

    // ── agent boundary ──────────────────────────────────────────────────

    fn read_client_action_requests(
        &self,
        client_id: &ClientId,
    ) -> Result<Vec<ClientActionRequest>, StoreError>;

    fn delete_client_action_requests(
        &self,
        requests: &[ClientActionRequest],
    ) -> Result<(), StoreError>;

    // ── hunts ───────────────────────────────────────────────────────────

    /// Create a hunt. Fails with `AlreadyExists` if the id is taken.
    fn write_hunt(&self, hunt: HuntRecord) -> Result<(), StoreError>;

    fn read_hunt(&self, hunt_id: &HuntId) -> Result<Option<HuntRecord>, StoreError>;

    fn read_hunts(&self) -> Result<Vec<HuntRecord>, StoreError>;

    /// Replace a hunt if its stored revision equals `hunt.revision`.
    /// Returns the stored record with the revision bumped.
    fn update_hunt(&self, hunt: HuntRecord) -> Result<HuntRecord, StoreError>;

    fn read_hunt_counters(&self, hunt_id: &HuntId) -> Result<HuntCounters, StoreError>;

    // ── foreman rules ───────────────────────────────────────────────────

    fn write_foreman_rule(&self, rule: ForemanRule) -> Result<(), StoreError>;

    fn read_foreman_rules(&self) -> Result<Vec<ForemanRule>, StoreError>;

    fn remove_foreman_rule(&self, hunt_id: &HuntId) -> Result<(), StoreError>;

    /// Returns how many rules were removed.
    fn remove_expired_foreman_rules(&self, now: u64) -> Result<usize, StoreError>;
}
