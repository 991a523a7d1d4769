//! Foreman: matches a contacting client against the rules of running hunts
//! and offers it to each hunt whose rules it satisfies.

use std::sync::Arc;

use drover_core::{ClientId, HuntError, HuntId, StoreError};

use crate::context::ServerContext;
use crate::hunt::{Admission, HuntScheduler};

#[derive(Clone)]
pub struct Foreman {
    ctx: Arc<ServerContext>,
    hunts: HuntScheduler,
}

impl Foreman {
    pub fn new(ctx: Arc<ServerContext>, hunts: HuntScheduler) -> Self {
        Self { ctx, hunts }
    }

    /// Offer `client_id` to every hunt whose live rule matches its startup
    /// info. Clients that never reported startup info match nothing.
    pub fn assign_tasks_to_client(
        &self,
        client_id: &ClientId,
        now: u64,
    ) -> Result<Vec<(HuntId, Admission)>, HuntError> {
        let Some(info) = self.ctx.store.read_client_startup_info(client_id)? else {
            tracing::debug!(client_id = %client_id, "no startup info yet, skipping foreman rules");
            return Ok(Vec::new());
        };

        let mut outcomes = Vec::new();
        for rule in self.ctx.store.read_foreman_rules()? {
            if rule.expired(now) || !rule.rule_set.matches(&info) {
                continue;
            }
            match self.hunts.admit_client(&rule.hunt_id, client_id, now) {
                Ok(admission) => outcomes.push((rule.hunt_id, admission)),
                Err(HuntError::NotFound(hunt_id)) => {
                    tracing::warn!(hunt_id = %hunt_id, "dropping foreman rule for missing hunt");
                    self.ctx.store.remove_foreman_rule(&hunt_id)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    pub fn expire_rules(&self, now: u64) -> Result<usize, StoreError> {
        let removed = self.ctx.store.remove_expired_foreman_rules(now)?;
        if removed > 0 {
            tracing::info!(removed, "expired foreman rules removed");
        }
        Ok(removed)
    }
}
