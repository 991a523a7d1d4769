//! In-memory [`Datastore`].
//!
//! Clients, hunts and foreman rules live in `DashMap`s. The handler queue and
//! the flow tables each sit behind a single mutex so that leasing and step
//! commits are atomic with respect to each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use drover_core::flow::{
    ClientActionRequest, FlowKey, FlowLogEntry, FlowRecord, FlowResponse, FlowResult, FlowStatus,
};
use drover_core::hunt::{ForemanRule, HuntCounters, HuntRecord};
use drover_core::message::{MessageHandlerKey, MessageHandlerRequest, StartupInfo};
use drover_core::{now_ms, ClientId, HuntId, RequestId, ResponseId, StoreError};

use crate::store::{Datastore, FlowStepCommit};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct HandlerQueue {
    next_seq: u64,
    /// key → (insertion sequence, request)
    requests: HashMap<MessageHandlerKey, (u64, MessageHandlerRequest)>,
}

#[derive(Default)]
struct FlowTables {
    flows: BTreeMap<FlowKey, FlowRecord>,
    responses: HashMap<(FlowKey, RequestId), BTreeMap<ResponseId, FlowResponse>>,
    results: HashMap<FlowKey, Vec<FlowResult>>,
    logs: HashMap<FlowKey, Vec<FlowLogEntry>>,
    client_requests: HashMap<ClientId, Vec<ClientActionRequest>>,
}

impl FlowTables {
    fn accepts(&self, response: &FlowResponse) -> bool {
        self.flows
            .get(&response.key())
            .is_some_and(|f| !f.is_terminal() && f.pending.contains_key(&response.request_id))
    }

    fn store_response(&mut self, response: FlowResponse) {
        self.responses
            .entry((response.key(), response.request_id))
            .or_default()
            .insert(response.response_id, response);
    }

    fn drop_flow_traffic(&mut self, key: &FlowKey) {
        self.responses.retain(|(k, _), _| k != key);
        if let Some(queue) = self.client_requests.get_mut(&key.client_id) {
            queue.retain(|r| r.flow_id != key.flow_id);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryDatastore {
    handler_requests: Arc<Mutex<HandlerQueue>>,
    clients: Arc<DashMap<ClientId, StartupInfo>>,
    flows: Arc<Mutex<FlowTables>>,
    hunts: Arc<DashMap<HuntId, HuntRecord>>,
    foreman_rules: Arc<DashMap<HuntId, ForemanRule>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued message handler requests, leased or not.
    pub fn pending_message_handler_requests(&self) -> usize {
        lock(&self.handler_requests).requests.len()
    }
}

impl Datastore for MemoryDatastore {
    fn write_message_handler_requests(
        &self,
        requests: Vec<MessageHandlerRequest>,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        let mut queue = lock(&self.handler_requests);
        for mut request in requests {
            if request.enqueued_at == 0 {
                request.enqueued_at = now;
            }
            request.leased_by = None;
            request.leased_until = None;
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.requests.insert(request.key(), (seq, request));
        }
        Ok(())
    }

    fn read_message_handler_requests(&self) -> Result<Vec<MessageHandlerRequest>, StoreError> {
        let queue = lock(&self.handler_requests);
        let mut all: Vec<_> = queue.requests.values().cloned().collect();
        all.sort_by_key(|(seq, r)| (r.enqueued_at, *seq));
        Ok(all.into_iter().map(|(_, r)| r).collect())
    }

    fn lease_message_handler_requests(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
        now: u64,
    ) -> Result<Vec<MessageHandlerRequest>, StoreError> {
        let leased_until = now.saturating_add(lease.as_millis() as u64);
        let mut queue = lock(&self.handler_requests);

        let mut candidates: Vec<(u64, u64, MessageHandlerKey)> = queue
            .requests
            .iter()
            .filter(|(_, (_, r))| r.leasable(now))
            .map(|(key, (seq, r))| (r.enqueued_at, *seq, key.clone()))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut leased = Vec::with_capacity(candidates.len());
        for (_, _, key) in candidates {
            if let Some((_, request)) = queue.requests.get_mut(&key) {
                request.leased_by = Some(owner.to_string());
                request.leased_until = Some(leased_until);
                leased.push(request.clone());
            }
        }
        Ok(leased)
    }

    fn delete_message_handler_requests(
        &self,
        keys: &[MessageHandlerKey],
    ) -> Result<usize, StoreError> {
        let mut queue = lock(&self.handler_requests);
        Ok(keys
            .iter()
            .filter(|key| queue.requests.remove(*key).is_some())
            .count())
    }

    fn write_client_startup_info(
        &self,
        client_id: &ClientId,
        info: StartupInfo,
    ) -> Result<(), StoreError> {
        self.clients.insert(client_id.clone(), info);
        Ok(())
    }

    fn read_client_startup_info(
        &self,
        client_id: &ClientId,
    ) -> Result<Option<StartupInfo>, StoreError> {
        Ok(self.clients.get(client_id).map(|info| info.clone()))
    }

    fn count_clients(&self) -> Result<u64, StoreError> {
        Ok(self.clients.len() as u64)
    }

    fn write_flow(&self, record: FlowRecord) -> Result<(), StoreError> {
        let mut tables = lock(&self.flows);
        let key = record.key();
        if tables.flows.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("flow {key}")));
        }
        tables.flows.insert(key, record);
        Ok(())
    }

    fn read_flow(&self, key: &FlowKey) -> Result<Option<FlowRecord>, StoreError> {
        Ok(lock(&self.flows).flows.get(key).cloned())
    }

    fn read_flows_for_hunt(&self, hunt_id: &HuntId) -> Result<Vec<FlowRecord>, StoreError> {
        Ok(lock(&self.flows)
            .flows
            .values()
            .filter(|f| f.parent_hunt_id.as_ref() == Some(hunt_id))
            .cloned()
            .collect())
    }

    fn read_terminal_flows_before(&self, cutoff: u64) -> Result<Vec<FlowRecord>, StoreError> {
        Ok(lock(&self.flows)
            .flows
            .values()
            .filter(|f| f.is_terminal() && f.last_update_time < cutoff)
            .cloned()
            .collect())
    }

    fn commit_flow_step(&self, commit: FlowStepCommit) -> Result<FlowRecord, StoreError> {
        let FlowStepCommit {
            mut record,
            expected_revision,
            processed_requests,
            results,
            client_requests,
            synthetic_responses,
            logs,
        } = commit;

        let key = record.key();
        let mut tables = lock(&self.flows);
        let found = tables
            .flows
            .get(&key)
            .map(|stored| stored.revision)
            .ok_or_else(|| StoreError::NotFound(format!("flow {key}")))?;
        if found != expected_revision {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: expected_revision,
                found,
            });
        }

        record.revision = expected_revision + 1;
        let terminal = record.is_terminal();
        tables.flows.insert(key.clone(), record.clone());

        for request_id in processed_requests {
            tables.responses.remove(&(key.clone(), request_id));
        }
        if !results.is_empty() {
            tables.results.entry(key.clone()).or_default().extend(results);
        }
        if !logs.is_empty() {
            tables.logs.entry(key.clone()).or_default().extend(logs);
        }

        if terminal {
            tables.drop_flow_traffic(&key);
        } else {
            for request in client_requests {
                tables
                    .client_requests
                    .entry(request.client_id.clone())
                    .or_default()
                    .push(request);
            }
            for response in synthetic_responses {
                if tables.accepts(&response) {
                    tables.store_response(response);
                }
            }
        }
        Ok(record)
    }

    fn write_flow_responses(&self, responses: Vec<FlowResponse>) -> Result<usize, StoreError> {
        let mut tables = lock(&self.flows);
        let mut discarded = 0;
        for response in responses {
            if tables.accepts(&response) {
                tables.store_response(response);
            } else {
                discarded += 1;
            }
        }
        Ok(discarded)
    }

    fn read_flow_responses(
        &self,
        key: &FlowKey,
        request_id: RequestId,
    ) -> Result<Vec<FlowResponse>, StoreError> {
        Ok(lock(&self.flows)
            .responses
            .get(&(key.clone(), request_id))
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default())
    }

    fn read_flow_results(
        &self,
        key: &FlowKey,
        offset: usize,
        count: usize,
    ) -> Result<Vec<FlowResult>, StoreError> {
        Ok(lock(&self.flows)
            .results
            .get(key)
            .map(|all| all.iter().skip(offset).take(count).cloned().collect())
            .unwrap_or_default())
    }

    fn read_flow_logs(&self, key: &FlowKey) -> Result<Vec<FlowLogEntry>, StoreError> {
        Ok(lock(&self.flows).logs.get(key).cloned().unwrap_or_default())
    }

    fn delete_flow(&self, key: &FlowKey) -> Result<bool, StoreError> {
        let mut tables = lock(&self.flows);
        let existed = tables.flows.remove(key).is_some();
        tables.results.remove(key);
        tables.logs.remove(key);
        tables.drop_flow_traffic(key);
        Ok(existed)
    }

    fn read_client_action_requests(
        &self,
        client_id: &ClientId,
    ) -> Result<Vec<ClientActionRequest>, StoreError> {
        Ok(lock(&self.flows)
            .client_requests
            .get(client_id)
            .cloned()
            .unwrap_or_default())
    }

    fn delete_client_action_requests(
        &self,
        requests: &[ClientActionRequest],
    ) -> Result<(), StoreError> {
        let mut tables = lock(&self.flows);
        for request in requests {
            if let Some(queue) = tables.client_requests.get_mut(&request.client_id) {
                queue.retain(|r| {
                    !(r.flow_id == request.flow_id && r.request_id == request.request_id)
                });
            }
        }
        Ok(())
    }

    fn write_hunt(&self, hunt: HuntRecord) -> Result<(), StoreError> {
        match self.hunts.entry(hunt.hunt_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::AlreadyExists(format!("hunt {}", hunt.hunt_id)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(hunt);
                Ok(())
            }
        }
    }

    fn read_hunt(&self, hunt_id: &HuntId) -> Result<Option<HuntRecord>, StoreError> {
        Ok(self.hunts.get(hunt_id).map(|h| h.clone()))
    }

    fn read_hunts(&self) -> Result<Vec<HuntRecord>, StoreError> {
        let mut hunts: Vec<HuntRecord> = self.hunts.iter().map(|h| h.clone()).collect();
        hunts.sort_by_key(|h| h.create_time);
        Ok(hunts)
    }

    fn update_hunt(&self, mut hunt: HuntRecord) -> Result<HuntRecord, StoreError> {
        let mut stored = self
            .hunts
            .get_mut(&hunt.hunt_id)
            .ok_or_else(|| StoreError::NotFound(format!("hunt {}", hunt.hunt_id)))?;
        if stored.revision != hunt.revision {
            return Err(StoreError::Conflict {
                key: format!("hunt {}", hunt.hunt_id),
                expected: hunt.revision,
                found: stored.revision,
            });
        }
        hunt.revision += 1;
        *stored = hunt.clone();
        Ok(hunt)
    }

    fn read_hunt_counters(&self, hunt_id: &HuntId) -> Result<HuntCounters, StoreError> {
        let tables = lock(&self.flows);
        let mut counters = HuntCounters::default();
        for flow in tables
            .flows
            .values()
            .filter(|f| f.parent_hunt_id.as_ref() == Some(hunt_id))
        {
            counters.num_clients += 1;
            match flow.status {
                FlowStatus::Running => counters.num_running += 1,
                FlowStatus::Completed => counters.num_successful += 1,
                FlowStatus::Error => counters.num_failed += 1,
            }
            if flow.crashed {
                counters.num_crashed += 1;
            }
            counters.total_results += tables.results.get(&flow.key()).map_or(0, |r| r.len()) as u64;
            counters.total_cpu_seconds += flow.usage.cpu_seconds;
            counters.total_network_bytes += flow.usage.network_bytes;
        }
        Ok(counters)
    }

    fn write_foreman_rule(&self, rule: ForemanRule) -> Result<(), StoreError> {
        self.foreman_rules.insert(rule.hunt_id.clone(), rule);
        Ok(())
    }

    fn read_foreman_rules(&self) -> Result<Vec<ForemanRule>, StoreError> {
        Ok(self.foreman_rules.iter().map(|r| r.clone()).collect())
    }

    fn remove_foreman_rule(&self, hunt_id: &HuntId) -> Result<(), StoreError> {
        self.foreman_rules.remove(hunt_id);
        Ok(())
    }

    fn remove_expired_foreman_rules(&self, now: u64) -> Result<usize, StoreError> {
        let before = self.foreman_rules.len();
        self.foreman_rules.retain(|_, rule| !rule.expired(now));
        Ok(before - self.foreman_rules.len())
    }
}
