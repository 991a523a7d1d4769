//! Hunts driven through the queue: foreman admission and client limits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use drover_core::flow::{ClientAction, FlowKey, FlowStatus};
use drover_core::flow_args::{FlowArgs, TimelineArgs};
use drover_core::hunt::{HuntSpec, HuntState, StopReason};
use drover_core::{now_ms, ClientId};
use drover_services::{Admission, FlowRuntime, HuntScheduler, ServerContext};

use crate::*;

fn timeline_hunt(client_limit: u64) -> HuntSpec {
    HuntSpec {
        description: "integration timeline".into(),
        client_limit: Some(client_limit),
        client_rate: Some(0.0),
        ..HuntSpec::standard(FlowArgs::Timeline(TimelineArgs { root: "/etc".into() }))
    }
}

/// A client checking in with a started hunt gets a hunt flow and an action
/// request for its agent.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_foreman_admits_client() -> Result<()> {
    with_engine(test_config(), |engine| async move {
        let hunt_id = engine.hunts.create_hunt(timeline_hunt(10))?;
        engine.hunts.start_hunt(&hunt_id, now_ms())?;

        let client_id = ClientId::from_index(1);
        engine.check_in(&client_id)?;
        wait_until(Duration::from_secs(5), "queue to drain", || Ok(engine.queue_drained())).await?;

        let key = FlowKey::new(client_id.clone(), hunt_id.flow_id());
        let flow = engine.flow(&key)?.expect("hunt flow created");
        assert_eq!(flow.status, FlowStatus::Running);
        assert_eq!(flow.parent_hunt_id.as_ref(), Some(&hunt_id));

        let requests = engine.agent_requests(&client_id)?;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].action, ClientAction::Timeline);
        assert_eq!(requests[0].flow_id, hunt_id.flow_id());

        // Checking in again does not start a second flow.
        engine.enqueue(vec![(client_id.clone(), drover_core::message::HandlerPayload::Foreman)])?;
        wait_until(Duration::from_secs(5), "queue to drain", || Ok(engine.queue_drained())).await?;
        assert_eq!(engine.hunts.hunt_counters(&hunt_id)?.num_clients, 1);
        Ok(())
    })
    .await
}

/// However many clients check in, no more than `client_limit` are admitted,
/// and reaching the limit stops the hunt.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_limit_never_exceeded() -> Result<()> {
    with_engine(test_config(), |engine| async move {
        let hunt_id = engine.hunts.create_hunt(timeline_hunt(2))?;
        engine.hunts.start_hunt(&hunt_id, now_ms())?;

        for i in 1..=5 {
            engine.check_in(&ClientId::from_index(i))?;
        }
        wait_until(Duration::from_secs(5), "queue to drain", || Ok(engine.queue_drained())).await?;

        let hunt = engine.hunts.read_hunt(&hunt_id)?;
        assert_eq!(hunt.hunt_state, HuntState::Stopped);
        assert_eq!(hunt.stop_reason, Some(StopReason::ClientLimitReached));
        assert_eq!(hunt.num_clients_admitted, 2);
        assert_eq!(engine.hunts.hunt_counters(&hunt_id)?.num_clients, 2);
        assert!(engine.store().read_foreman_rules()?.is_empty());

        let admitted = (1..=5)
            .filter(|&i| {
                let key = FlowKey::new(ClientId::from_index(i), hunt_id.flow_id());
                engine.flow(&key).ok().flatten().is_some()
            })
            .count();
        assert_eq!(admitted, 2);
        Ok(())
    })
    .await
}

/// Clients that check in before the hunt starts are not admitted.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_paused_hunt_admits_nobody() -> Result<()> {
    with_engine(test_config(), |engine| async move {
        let hunt_id = engine.hunts.create_hunt(timeline_hunt(10))?;

        let client_id = ClientId::from_index(7);
        engine.check_in(&client_id)?;
        wait_until(Duration::from_secs(5), "queue to drain", || Ok(engine.queue_drained())).await?;

        assert_eq!(engine.hunts.read_hunt(&hunt_id)?.hunt_state, HuntState::Paused);
        assert!(engine
            .flow(&FlowKey::new(client_id.clone(), hunt_id.flow_id()))?
            .is_none());
        assert!(engine.agent_requests(&client_id)?.is_empty());
        Ok(())
    })
    .await
}

/// Pausing, resuming and rebuilding the scheduler over the same store keeps
/// both the client limit and the pacing: both are derived from the stored
/// hunt record, not from scheduler memory.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_limit_and_pacing_survive_scheduler_restart() -> Result<()> {
    with_engine(test_config(), |engine| async move {
        let t0 = now_ms();
        let hunt_id = engine.hunts.create_hunt(HuntSpec {
            client_limit: Some(3),
            client_rate: Some(1.0),
            ..timeline_hunt(3)
        })?;
        engine.hunts.start_hunt(&hunt_id, t0)?;

        let client = ClientId::from_index;
        assert!(engine.hunts.admit_client(&hunt_id, &client(1), t0)?.admitted());
        assert_eq!(
            engine.hunts.admit_client(&hunt_id, &client(2), t0 + 1)?,
            Admission::RateLimited
        );

        engine.hunts.pause_hunt(&hunt_id)?;
        assert_eq!(
            engine.hunts.admit_client(&hunt_id, &client(2), t0 + 60_000)?,
            Admission::NotRunning(HuntState::Paused)
        );

        // A fresh scheduler over the same datastore, as after a process
        // restart.
        let ctx = ServerContext::new(
            Arc::new(engine.datastore.clone()),
            Arc::new(engine.blobs.clone()),
            test_config(),
        );
        let restarted = HuntScheduler::new(ctx.clone(), FlowRuntime::new(ctx.clone()));

        let resumed = restarted.start_hunt(&hunt_id, t0 + 30_000)?;
        assert_eq!(resumed.init_start_time, Some(t0));
        assert_eq!(resumed.last_start_time, Some(t0 + 30_000));
        assert_eq!(resumed.num_clients_admitted, 1);

        // Resuming does not refill the bucket: one token per minute since t0.
        assert_eq!(
            restarted.admit_client(&hunt_id, &client(2), t0 + 59_999)?,
            Admission::RateLimited
        );
        assert!(restarted.admit_client(&hunt_id, &client(2), t0 + 60_000)?.admitted());
        assert_eq!(
            restarted.admit_client(&hunt_id, &client(3), t0 + 60_001)?,
            Admission::RateLimited
        );
        assert!(restarted.admit_client(&hunt_id, &client(3), t0 + 120_000)?.admitted());

        let hunt = restarted.read_hunt(&hunt_id)?;
        assert_eq!(hunt.hunt_state, HuntState::Stopped);
        assert_eq!(hunt.stop_reason, Some(StopReason::ClientLimitReached));

        // Neither scheduler admits past the limit afterwards.
        for scheduler in [&engine.hunts, &restarted] {
            assert_eq!(
                scheduler.admit_client(&hunt_id, &client(4), t0 + 600_000)?,
                Admission::NotRunning(HuntState::Stopped)
            );
        }
        assert_eq!(restarted.hunt_counters(&hunt_id)?.num_clients, 3);
        assert_eq!(engine.hunts.read_hunt(&hunt_id)?.num_clients_admitted, 3);
        Ok(())
    })
    .await
}
