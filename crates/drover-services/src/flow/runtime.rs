//! Flow runtime: starts flows, feeds agent responses into them, and
//! persists every step as one atomic commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use drover_core::flow::{
    ClientActionRequest, FlowKey, FlowLogEntry, FlowRecord, FlowResponse, FlowResult, FlowStatus,
    PendingRequest, ResourceBudget, ResponseStatus, StatusCode,
};
use drover_core::flow_args::FlowArgs;
use drover_core::message::StartupInfo;
use drover_core::{now_ms, ClientId, FlowError, FlowId, HuntId, RequestId, StoreError};

use super::{
    decode_state, drive, CollectFilesFlow, Flow, FlowProgress, Responses, Step, StepEnv,
    StepOutput, TimelineFlow, Transition,
};
use crate::context::ServerContext;
use crate::store::FlowStepCommit;

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub parent_hunt_id: Option<HuntId>,
    pub budget: ResourceBudget,
    /// Fixed id for the new flow; random when unset.
    pub flow_id: Option<FlowId>,
}

#[derive(Clone)]
pub struct FlowRuntime {
    ctx: Arc<ServerContext>,
}

impl FlowRuntime {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    /// Create a flow and run its first step. A step that fails marks the
    /// flow ERROR but still returns its id; only store failures are errors
    /// here, and a flow whose first commit fails is left ERROR (or removed)
    /// rather than RUNNING. Fails with `StoreError::AlreadyExists` if
    /// `flow_id` is taken.
    pub fn start_flow(
        &self,
        client_id: &ClientId,
        args: FlowArgs,
        options: StartOptions,
    ) -> Result<FlowId, FlowError> {
        let now = now_ms();
        let flow_id = options.flow_id.unwrap_or_else(FlowId::random);
        let record = FlowRecord::new(
            client_id.clone(),
            flow_id.clone(),
            args,
            options.budget,
            options.parent_hunt_id,
            now,
        );
        self.ctx.store.write_flow(record.clone())?;

        let stored = match self.commit_start(&record, now) {
            Ok(stored) => stored,
            Err(e) => {
                self.abandon_start(record, &e);
                return Err(e);
            }
        };

        tracing::info!(
            client_id = %client_id,
            flow_id = %flow_id,
            flow = stored.args.name(),
            status = ?stored.status,
            "flow started"
        );

        if !stored.is_terminal() {
            self.process_flow(&stored.key())?;
        }
        Ok(flow_id)
    }

    fn commit_start(&self, record: &FlowRecord, now: u64) -> Result<FlowRecord, FlowError> {
        let client = self.ctx.store.read_client_startup_info(&record.client_id)?;
        let output = self.step(record, client.as_ref(), Step::Start, 0);
        let commit = self.build_commit(record.clone(), output, None, now);
        Ok(self.ctx.store.commit_flow_step(commit)?)
    }

    /// The record was created but its first step never landed. Mark it
    /// failed so nothing waits on it, or drop it if even that write fails.
    fn abandon_start(&self, mut record: FlowRecord, cause: &FlowError) {
        let key = record.key();
        let expected_revision = record.revision;
        record.status = FlowStatus::Error;
        record.error = Some(format!("flow start failed: {cause}"));
        record.pending.clear();
        record.last_update_time = now_ms();
        if let Err(e) = self
            .ctx
            .store
            .commit_flow_step(FlowStepCommit::new(record, expected_revision))
        {
            tracing::warn!(flow = %key, error = %e, "could not mark unstarted flow failed, deleting");
            if let Err(e) = self.ctx.store.delete_flow(&key) {
                tracing::error!(flow = %key, error = %e, "unstarted flow left behind");
            }
        }
    }

    /// Store responses from one agent and advance every flow they touch.
    /// Returns the flows that became terminal during this call.
    pub fn receive_responses(
        &self,
        client_id: &ClientId,
        responses: Vec<FlowResponse>,
    ) -> Result<Vec<FlowRecord>, FlowError> {
        assert!(
            responses.iter().all(|r| &r.client_id == client_id),
            "responses delivered for {client_id} include other clients"
        );

        let keys: BTreeSet<FlowKey> = responses.iter().map(FlowResponse::key).collect();
        let received = responses.len();
        let discarded = self.ctx.store.write_flow_responses(responses)?;
        if discarded > 0 {
            tracing::debug!(
                client_id = %client_id,
                received,
                discarded,
                "dropped responses for unknown or finished requests"
            );
        }

        let mut finished = Vec::new();
        for key in keys {
            let was_running = self
                .ctx
                .store
                .read_flow(&key)?
                .is_some_and(|f| !f.is_terminal());
            if let Some(record) = self.process_flow(&key)? {
                if was_running && record.is_terminal() {
                    finished.push(record);
                }
            }
        }
        Ok(finished)
    }

    /// Process requests in order while the next one has all its responses.
    /// Returns the flow as last stored, or `None` if it doesn't exist.
    pub fn process_flow(&self, key: &FlowKey) -> Result<Option<FlowRecord>, FlowError> {
        let client = self.ctx.store.read_client_startup_info(&key.client_id)?;

        loop {
            let Some(record) = self.ctx.store.read_flow(key)? else {
                return Ok(None);
            };
            if record.is_terminal() {
                return Ok(Some(record));
            }

            let request_id = record.next_request_to_process;
            let Some(pending) = record.pending.get(&request_id).cloned() else {
                return Ok(Some(record));
            };
            let stored = self.ctx.store.read_flow_responses(key, request_id)?;
            let Some(responses) = Responses::assemble(request_id, stored) else {
                return Ok(Some(record));
            };

            let mut next = record.clone();
            next.pending.remove(&request_id);
            next.next_request_to_process += 1;
            next.usage.add(responses.status());

            let output = if responses.status().code == StatusCode::ClientCrashed {
                next.crashed = true;
                StepOutput::failed(
                    format!("client crashed: {}", responses.status().message),
                    next.next_request_id,
                )
            } else if let Some(exceeded) = budget_exceeded(&next) {
                StepOutput::failed(exceeded.to_string(), next.next_request_id)
            } else {
                let outstanding = next.pending.len();
                self.step(
                    &next,
                    client.as_ref(),
                    Step::Resume {
                        next_state: pending.next_state,
                        responses,
                    },
                    outstanding,
                )
            };

            let commit = self.build_commit(next, output, Some(request_id), now_ms());
            match self.ctx.store.commit_flow_step(commit) {
                Ok(stored) => {
                    tracing::debug!(
                        flow = %key,
                        request_id,
                        status = ?stored.status,
                        "flow step committed"
                    );
                }
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!(flow = %key, request_id, "flow advanced concurrently, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn get_progress(&self, key: &FlowKey) -> Result<Option<FlowProgress>, FlowError> {
        let Some(record) = self.ctx.store.read_flow(key)? else {
            return Ok(None);
        };
        let progress = match &record.args {
            FlowArgs::Timeline(_) => FlowProgress::Timeline(TimelineFlow::progress(
                &decode_state::<TimelineFlow>(&record.state)?,
            )),
            FlowArgs::CollectFiles(_) => FlowProgress::CollectFiles(CollectFilesFlow::progress(
                &decode_state::<CollectFilesFlow>(&record.state)?,
            )),
        };
        Ok(Some(progress))
    }

    /// Delete terminal flows that don't belong to a hunt and haven't changed
    /// for `retention_ms`. Hunt flows are kept for the hunt's counters.
    pub fn archive_terminal_flows(&self, retention_ms: u64, now: u64) -> Result<usize, StoreError> {
        let cutoff = now.saturating_sub(retention_ms);
        let mut archived = 0;
        for record in self.ctx.store.read_terminal_flows_before(cutoff)? {
            if record.parent_hunt_id.is_some() {
                continue;
            }
            if self.ctx.store.delete_flow(&record.key())? {
                archived += 1;
            }
        }
        if archived > 0 {
            tracing::info!(archived, "archived terminal flows");
        }
        Ok(archived)
    }

    fn step(
        &self,
        record: &FlowRecord,
        client: Option<&StartupInfo>,
        step: Step,
        outstanding: usize,
    ) -> StepOutput {
        let key = record.key();
        let env = StepEnv {
            key: &key,
            client,
            blobs: &self.ctx.blobs,
            blob_timeout: self.ctx.config.blobs.wait_timeout(),
            next_request_id: record.next_request_id,
            outstanding,
        };
        match &record.args {
            FlowArgs::Timeline(args) => drive::<TimelineFlow>(args, record, step, env),
            FlowArgs::CollectFiles(args) => drive::<CollectFilesFlow>(args, record, step, env),
        }
    }

    fn build_commit(
        &self,
        mut record: FlowRecord,
        output: StepOutput,
        processed: Option<RequestId>,
        now: u64,
    ) -> FlowStepCommit {
        let key = record.key();
        let expected_revision = record.revision;
        let mut results = Vec::new();
        let mut client_requests = Vec::new();
        let mut synthetic_responses = Vec::new();

        record.last_update_time = now;
        match output.transition {
            Transition::Continue { state, requests } => {
                record.state = state;
                record.next_request_id = output.next_request_id;
                let (cpu_limit, network_bytes_limit) = remaining_budget(&record);
                for request in requests {
                    record.pending.insert(
                        request.request_id,
                        PendingRequest {
                            request_id: request.request_id,
                            next_state: request.next_state,
                            action: request.action,
                            issued_at: now,
                        },
                    );
                    match request.action {
                        Some(action) => client_requests.push(ClientActionRequest {
                            client_id: key.client_id.clone(),
                            flow_id: key.flow_id.clone(),
                            request_id: request.request_id,
                            action,
                            payload: request.payload,
                            cpu_limit,
                            network_bytes_limit,
                            issued_at: now,
                        }),
                        None => synthetic_responses.push(FlowResponse::status(
                            &key,
                            request.request_id,
                            1,
                            ResponseStatus::ok(),
                        )),
                    }
                }
                results = output.replies;
            }
            Transition::Complete { state } => {
                record.state = state;
                record.status = FlowStatus::Completed;
                results = output.replies;
                tracing::info!(flow = %key, replies = record.num_replies_sent + results.len() as u64, "flow completed");
            }
            Transition::Fail { reason } => {
                tracing::warn!(flow = %key, flow_name = record.args.name(), %reason, "flow failed");
                record.status = FlowStatus::Error;
                record.error = Some(reason);
                record.pending.clear();
            }
        }

        record.num_replies_sent += results.len() as u64;
        let hunt_id = record.parent_hunt_id.clone();
        let results = results
            .into_iter()
            .map(|payload| FlowResult {
                client_id: key.client_id.clone(),
                flow_id: key.flow_id.clone(),
                hunt_id: hunt_id.clone(),
                timestamp: now,
                payload,
            })
            .collect();
        let logs = output
            .logs
            .into_iter()
            .map(|message| FlowLogEntry {
                client_id: key.client_id.clone(),
                flow_id: key.flow_id.clone(),
                timestamp: now,
                message,
            })
            .collect();

        FlowStepCommit {
            record,
            expected_revision,
            processed_requests: processed.into_iter().collect(),
            results,
            client_requests,
            synthetic_responses,
            logs,
        }
    }
}

fn budget_exceeded(record: &FlowRecord) -> Option<FlowError> {
    if let Some(limit) = record.budget.cpu_seconds {
        if record.usage.cpu_seconds > limit {
            return Some(FlowError::BudgetExceeded {
                resource: "cpu",
                used: record.usage.cpu_seconds,
                limit,
            });
        }
    }
    if let Some(limit) = record.budget.network_bytes {
        if record.usage.network_bytes > limit {
            return Some(FlowError::BudgetExceeded {
                resource: "network",
                used: record.usage.network_bytes as f64,
                limit: limit as f64,
            });
        }
    }
    None
}

fn remaining_budget(record: &FlowRecord) -> (Option<f64>, Option<u64>) {
    (
        record
            .budget
            .cpu_seconds
            .map(|limit| (limit - record.usage.cpu_seconds).max(0.0)),
        record
            .budget
            .network_bytes
            .map(|limit| limit.saturating_sub(record.usage.network_bytes)),
    )
}
