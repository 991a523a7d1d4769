//! Message handler dispatch: routes each leased request to the handler for
//! its kind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;

use drover_core::flow::FlowResponse;
use drover_core::message::{HandlerKind, HandlerPayload, MessageHandlerRequest, StartupInfo};
use drover_core::{now_ms, ClientId, HuntId};

use crate::context::ServerContext;
use crate::flow::FlowRuntime;
use crate::foreman::Foreman;
use crate::hunt::HuntScheduler;
use crate::worker::MessageHandler;

#[derive(Clone)]
pub struct HandlerDispatcher {
    ctx: Arc<ServerContext>,
    flows: FlowRuntime,
    hunts: HuntScheduler,
    foreman: Foreman,
}

impl HandlerDispatcher {
    pub fn new(
        ctx: Arc<ServerContext>,
        flows: FlowRuntime,
        hunts: HuntScheduler,
        foreman: Foreman,
    ) -> Self {
        Self {
            ctx,
            flows,
            hunts,
            foreman,
        }
    }

    /// Process a leased batch. Any error fails the whole batch, which is
    /// then redelivered after its lease expires; every handler is
    /// idempotent under redelivery.
    pub fn process(&self, batch: &[MessageHandlerRequest]) -> anyhow::Result<()> {
        let mut by_kind: BTreeMap<HandlerKind, Vec<&MessageHandlerRequest>> = BTreeMap::new();
        for request in batch {
            by_kind.entry(request.payload.kind()).or_default().push(request);
        }

        for (kind, requests) in by_kind {
            tracing::debug!(handler = kind.name(), count = requests.len(), "dispatching");
            for request in requests {
                let outcome = match &request.payload {
                    HandlerPayload::ClientStartup(info) => {
                        self.client_startup(&request.client_id, info)
                    }
                    HandlerPayload::Foreman => self.foreman(&request.client_id),
                    HandlerPayload::FlowResponses(responses) => {
                        self.flow_responses(&request.client_id, responses)
                    }
                };
                outcome.with_context(|| {
                    format!(
                        "{} failed for client {} (request {})",
                        kind.name(),
                        request.client_id,
                        request.request_id
                    )
                })?;
            }
        }
        Ok(())
    }

    fn client_startup(&self, client_id: &ClientId, info: &StartupInfo) -> anyhow::Result<()> {
        self.ctx
            .store
            .write_client_startup_info(client_id, info.clone())?;
        tracing::info!(
            client_id = %client_id,
            os = %info.os,
            version = info.client_info.client_version,
            "client startup recorded"
        );
        Ok(())
    }

    fn foreman(&self, client_id: &ClientId) -> anyhow::Result<()> {
        let outcomes = self.foreman.assign_tasks_to_client(client_id, now_ms())?;
        for (hunt_id, admission) in outcomes {
            tracing::debug!(client_id = %client_id, hunt_id = %hunt_id, ?admission, "foreman admission");
        }
        Ok(())
    }

    fn flow_responses(&self, client_id: &ClientId, responses: &[FlowResponse]) -> anyhow::Result<()> {
        let finished = self
            .flows
            .receive_responses(client_id, responses.to_vec())?;

        let hunts: BTreeSet<HuntId> = finished
            .into_iter()
            .filter_map(|record| record.parent_hunt_id)
            .collect();
        let now = now_ms();
        for hunt_id in hunts {
            self.hunts.refresh_hunt(&hunt_id, now)?;
        }
        Ok(())
    }
}

impl MessageHandler for HandlerDispatcher {
    fn handle(&self, batch: &[MessageHandlerRequest]) -> anyhow::Result<()> {
        self.process(batch)
    }
}
