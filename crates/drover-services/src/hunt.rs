//! Hunt scheduler: lifecycle, admission control and completion tracking
//! for fleet-wide flow fan-out.
//!
//! Every hunt mutation is a compare-and-swap on the hunt record's
//! revision. Admission reserves its slot in the same swap that checks the
//! limit, so concurrent workers can never admit more than `client_limit`
//! clients.

use std::sync::Arc;

use drover_core::flow::{FlowKey, ResourceBudget};
use drover_core::hunt::{
    ForemanRule, HuntArguments, HuntCounters, HuntRecord, HuntSpec, HuntState, StopReason,
};
use drover_core::{now_ms, ClientId, FlowError, FlowId, HuntError, HuntId, StoreError};

use crate::context::ServerContext;
use crate::flow::{FlowRuntime, StartOptions};
use crate::qos::AdmissionPacer;

/// Outcome of offering a client to a hunt.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(FlowId),
    /// The hunt is not STARTED.
    NotRunning(HuntState),
    Expired,
    AlreadyAdmitted,
    /// Variable hunt with no group for this client.
    NotTargeted,
    ClientLimitReached,
    /// An average per-client cap is exceeded; in-flight flows continue.
    SoftCapExceeded(&'static str),
    /// Paced out; the client is offered again on its next foreman contact.
    RateLimited,
}

impl Admission {
    pub fn admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

#[derive(Clone)]
pub struct HuntScheduler {
    ctx: Arc<ServerContext>,
    flows: FlowRuntime,
}

impl HuntScheduler {
    pub fn new(ctx: Arc<ServerContext>, flows: FlowRuntime) -> Self {
        Self { ctx, flows }
    }

    /// Create a PAUSED hunt, filling unset limits from config.
    pub fn create_hunt(&self, spec: HuntSpec) -> Result<HuntId, HuntError> {
        validate(&spec)?;
        let hunt_id = HuntId::random();
        let hunt = HuntRecord::from_spec(hunt_id.clone(), spec, &self.ctx.config.hunts, now_ms());
        self.ctx.store.write_hunt(hunt)?;
        tracing::info!(hunt_id = %hunt_id, "hunt created");
        Ok(hunt_id)
    }

    pub fn read_hunt(&self, hunt_id: &HuntId) -> Result<HuntRecord, HuntError> {
        self.ctx
            .store
            .read_hunt(hunt_id)?
            .ok_or_else(|| HuntError::NotFound(hunt_id.clone()))
    }

    pub fn hunt_counters(&self, hunt_id: &HuntId) -> Result<HuntCounters, HuntError> {
        Ok(self.ctx.store.read_hunt_counters(hunt_id)?)
    }

    /// PAUSED → STARTED. The first start fixes `init_start_time`, which
    /// anchors expiry and rate pacing for the hunt's lifetime.
    pub fn start_hunt(&self, hunt_id: &HuntId, now: u64) -> Result<HuntRecord, HuntError> {
        let num_clients = self.ctx.store.count_clients()?;
        let hunt = self.update(hunt_id, |hunt| {
            expect_state(hunt, HuntState::Paused, HuntState::Started)?;
            hunt.hunt_state = HuntState::Started;
            hunt.init_start_time.get_or_insert(now);
            hunt.last_start_time = Some(now);
            hunt.num_clients_at_start_time = num_clients;
            Ok(())
        })?;

        self.ctx.store.write_foreman_rule(ForemanRule {
            hunt_id: hunt_id.clone(),
            rule_set: hunt.client_rule_set.clone(),
            expiry_time: hunt.expiry_time(),
        })?;
        tracing::info!(
            hunt_id = %hunt_id,
            num_clients,
            expiry_time = ?hunt.expiry_time(),
            "hunt started"
        );
        Ok(hunt)
    }

    /// STARTED → PAUSED. Admitted flows keep running.
    pub fn pause_hunt(&self, hunt_id: &HuntId) -> Result<HuntRecord, HuntError> {
        let hunt = self.update(hunt_id, |hunt| {
            expect_state(hunt, HuntState::Started, HuntState::Paused)?;
            hunt.hunt_state = HuntState::Paused;
            Ok(())
        })?;
        self.ctx.store.remove_foreman_rule(hunt_id)?;
        tracing::info!(hunt_id = %hunt_id, "hunt paused");
        Ok(hunt)
    }

    /// Stop a PAUSED or STARTED hunt. Admitted flows keep running.
    pub fn stop_hunt(&self, hunt_id: &HuntId, reason: StopReason) -> Result<HuntRecord, HuntError> {
        let hunt = self.update(hunt_id, |hunt| {
            if hunt.hunt_state.is_terminal() {
                return Err(HuntError::InvalidTransition {
                    id: hunt.hunt_id.clone(),
                    from: hunt.hunt_state,
                    to: HuntState::Stopped,
                });
            }
            hunt.hunt_state = HuntState::Stopped;
            hunt.stop_reason = Some(reason);
            Ok(())
        })?;
        self.ctx.store.remove_foreman_rule(hunt_id)?;
        tracing::info!(hunt_id = %hunt_id, ?reason, "hunt stopped");
        Ok(hunt)
    }

    /// Offer `client_id` to the hunt.
    ///
    /// Checks run in order: state, expiry, duplicate, targeting, client
    /// limit, soft caps, pacing. On success the client's flow is started
    /// with the hunt id as flow id. Reaching `client_limit` stops the hunt.
    pub fn admit_client(
        &self,
        hunt_id: &HuntId,
        client_id: &ClientId,
        now: u64,
    ) -> Result<Admission, HuntError> {
        let flow_key = FlowKey::new(client_id.clone(), hunt_id.flow_id());

        let (hunt, args) = loop {
            let mut hunt = self.read_hunt(hunt_id)?;
            if hunt.hunt_state != HuntState::Started {
                return Ok(Admission::NotRunning(hunt.hunt_state));
            }
            if hunt.expired(now) {
                self.stop_if_active(hunt_id, StopReason::Expired)?;
                return Ok(Admission::Expired);
            }
            if self.ctx.store.read_flow(&flow_key)?.is_some() {
                return Ok(Admission::AlreadyAdmitted);
            }
            let Some(args) = hunt.args.flow_for(client_id).cloned() else {
                return Ok(Admission::NotTargeted);
            };
            if hunt.client_limit > 0 && hunt.num_clients_admitted >= hunt.client_limit {
                self.stop_if_active(hunt_id, StopReason::ClientLimitReached)?;
                return Ok(Admission::ClientLimitReached);
            }
            let counters = self.ctx.store.read_hunt_counters(hunt_id)?;
            if let Some(cap) = soft_cap_exceeded(&hunt, &counters) {
                tracing::debug!(hunt_id = %hunt_id, cap, "soft cap reached, not admitting");
                return Ok(Admission::SoftCapExceeded(cap));
            }
            let started_at = hunt.init_start_time.unwrap_or(now);
            let pacer = AdmissionPacer::new(hunt.client_rate);
            if !pacer.allow(started_at, hunt.num_clients_admitted, now) {
                tracing::debug!(
                    hunt_id = %hunt_id,
                    client_id = %client_id,
                    next_slot = ?pacer.next_slot(started_at, hunt.num_clients_admitted),
                    "admission paced out"
                );
                return Ok(Admission::RateLimited);
            }

            hunt.num_clients_admitted += 1;
            if hunt.client_limit > 0 && hunt.num_clients_admitted >= hunt.client_limit {
                hunt.hunt_state = HuntState::Stopped;
                hunt.stop_reason = Some(StopReason::ClientLimitReached);
            }
            match self.ctx.store.update_hunt(hunt) {
                Ok(stored) => break (stored, args),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if hunt.hunt_state == HuntState::Stopped {
            self.ctx.store.remove_foreman_rule(hunt_id)?;
            tracing::info!(
                hunt_id = %hunt_id,
                client_limit = hunt.client_limit,
                "client limit reached, hunt stopped"
            );
        }

        let options = StartOptions {
            parent_hunt_id: Some(hunt_id.clone()),
            budget: ResourceBudget {
                cpu_seconds: hunt.per_client_cpu_limit,
                network_bytes: hunt.per_client_network_bytes_limit,
            },
            flow_id: Some(hunt_id.flow_id()),
        };
        match self.flows.start_flow(client_id, args, options) {
            Ok(flow_id) => {
                tracing::info!(
                    hunt_id = %hunt_id,
                    client_id = %client_id,
                    admitted = hunt.num_clients_admitted,
                    "client admitted to hunt"
                );
                Ok(Admission::Admitted(flow_id))
            }
            Err(FlowError::Store(StoreError::AlreadyExists(_))) => {
                // Lost a race with another worker admitting the same client.
                self.release_slot(hunt_id)?;
                Ok(Admission::AlreadyAdmitted)
            }
            Err(source) => {
                self.release_slot(hunt_id)?;
                Err(HuntError::FlowStart {
                    client_id: client_id.clone(),
                    flow_id: hunt_id.flow_id(),
                    source,
                })
            }
        }
    }

    /// Re-evaluate a hunt against its counters: hard caps and expiry stop
    /// it, a closed hunt whose flows are all terminal completes.
    pub fn refresh_hunt(&self, hunt_id: &HuntId, now: u64) -> Result<HuntRecord, HuntError> {
        let hunt = self.read_hunt(hunt_id)?;
        if hunt.hunt_state.is_terminal() {
            return Ok(hunt);
        }
        let counters = self.ctx.store.read_hunt_counters(hunt_id)?;

        if hunt.crash_limit > 0 && counters.num_crashed > hunt.crash_limit {
            tracing::warn!(
                hunt_id = %hunt_id,
                crashes = counters.num_crashed,
                crash_limit = hunt.crash_limit,
                "crash limit exceeded"
            );
            return self.stop_if_active(hunt_id, StopReason::CrashLimitExceeded);
        }
        if hunt.hunt_state == HuntState::Started && hunt.expired(now) {
            return self.stop_if_active(hunt_id, StopReason::Expired);
        }
        if hunt.hunt_state == HuntState::Started
            && admission_closed(&hunt, &counters)
            && counters.num_clients > 0
            && counters.all_terminal()
        {
            let hunt = self.update(hunt_id, |hunt| {
                if hunt.hunt_state == HuntState::Started {
                    hunt.hunt_state = HuntState::Completed;
                }
                Ok(())
            })?;
            self.ctx.store.remove_foreman_rule(hunt_id)?;
            tracing::info!(
                hunt_id = %hunt_id,
                clients = counters.num_clients,
                successful = counters.num_successful,
                failed = counters.num_failed,
                "hunt completed"
            );
            return Ok(hunt);
        }
        Ok(hunt)
    }

    /// Refresh every non-terminal hunt. Returns how many changed state.
    pub fn refresh_all(&self, now: u64) -> Result<usize, HuntError> {
        let mut changed = 0;
        for hunt in self.ctx.store.read_hunts()? {
            if hunt.hunt_state.is_terminal() {
                continue;
            }
            let refreshed = self.refresh_hunt(&hunt.hunt_id, now)?;
            if refreshed.hunt_state != hunt.hunt_state {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Read-modify-write with retry on revision conflict.
    fn update<F>(&self, hunt_id: &HuntId, mut apply: F) -> Result<HuntRecord, HuntError>
    where
        F: FnMut(&mut HuntRecord) -> Result<(), HuntError>,
    {
        loop {
            let mut hunt = self.read_hunt(hunt_id)?;
            apply(&mut hunt)?;
            match self.ctx.store.update_hunt(hunt) {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!(hunt_id = %hunt_id, "hunt changed concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stop unless already terminal; a hunt that already finished keeps its
    /// state and reason.
    fn stop_if_active(&self, hunt_id: &HuntId, reason: StopReason) -> Result<HuntRecord, HuntError> {
        let mut stopped = false;
        let hunt = self.update(hunt_id, |hunt| {
            stopped = false;
            if !hunt.hunt_state.is_terminal() {
                hunt.hunt_state = HuntState::Stopped;
                hunt.stop_reason = Some(reason);
                stopped = true;
            }
            Ok(())
        })?;
        if stopped {
            self.ctx.store.remove_foreman_rule(hunt_id)?;
            tracing::info!(hunt_id = %hunt_id, ?reason, "hunt stopped");
        }
        Ok(hunt)
    }

    fn release_slot(&self, hunt_id: &HuntId) -> Result<(), HuntError> {
        self.update(hunt_id, |hunt| {
            hunt.num_clients_admitted = hunt.num_clients_admitted.saturating_sub(1);
            Ok(())
        })?;
        Ok(())
    }
}

fn validate(spec: &HuntSpec) -> Result<(), HuntError> {
    if let HuntArguments::Variable { groups } = &spec.args {
        if groups.is_empty() {
            return Err(HuntError::InvalidArgs("variable hunt has no flow groups".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for client in groups.iter().flat_map(|g| &g.client_ids) {
            if !seen.insert(client) {
                return Err(HuntError::InvalidArgs(format!(
                    "client {client} appears in more than one flow group"
                )));
            }
        }
    }
    if spec.client_rate.is_some_and(|r| r < 0.0 || !r.is_finite()) {
        return Err(HuntError::InvalidArgs("client rate must be a non-negative number".into()));
    }
    Ok(())
}

fn expect_state(hunt: &HuntRecord, from: HuntState, to: HuntState) -> Result<(), HuntError> {
    if hunt.hunt_state != from {
        return Err(HuntError::InvalidTransition {
            id: hunt.hunt_id.clone(),
            from: hunt.hunt_state,
            to,
        });
    }
    Ok(())
}

fn soft_cap_exceeded(hunt: &HuntRecord, counters: &HuntCounters) -> Option<&'static str> {
    if hunt.avg_results_per_client_limit > 0
        && counters.avg_results_per_client() > hunt.avg_results_per_client_limit as f64
    {
        return Some("avg_results_per_client");
    }
    if hunt.avg_cpu_seconds_per_client_limit > 0.0
        && counters.avg_cpu_seconds_per_client() > hunt.avg_cpu_seconds_per_client_limit
    {
        return Some("avg_cpu_seconds_per_client");
    }
    if hunt.avg_network_bytes_per_client_limit > 0
        && counters.avg_network_bytes_per_client() > hunt.avg_network_bytes_per_client_limit as f64
    {
        return Some("avg_network_bytes_per_client");
    }
    None
}

/// No further client can ever be admitted while the hunt stays STARTED.
fn admission_closed(hunt: &HuntRecord, counters: &HuntCounters) -> bool {
    if soft_cap_exceeded(hunt, counters).is_some() {
        return true;
    }
    hunt.args
        .variable_client_count()
        .is_some_and(|total| hunt.num_clients_admitted >= total as u64)
}
