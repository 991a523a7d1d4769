//! Timeline collection with blobs that arrive after the agent's reply.

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

use drover_core::flow::{FlowKey, FlowResponse, FlowStatus, ResponseStatus};
use drover_core::flow_args::{FlowArgs, TimelineArgs, TimelineResult};
use drover_core::hunt::HuntSpec;
use drover_core::message::HandlerPayload;
use drover_core::{now_ms, BlobId, ClientId};
use drover_services::flow::timeline::{timeline_blobs, timeline_filesystem_type};
use drover_services::BlobStore;

use crate::*;

/// The agent replies before its entry blobs are uploaded. The flow holds the
/// result back until the blobs exist, then emits exactly one result.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeline_waits_for_late_blobs() -> Result<()> {
    let mut config = test_config();
    config.blobs.wait_timeout_secs = 30;

    with_engine(config, |engine| async move {
        let hunt_id = engine.hunts.create_hunt(HuntSpec {
            client_limit: Some(10),
            client_rate: Some(0.0),
            ..HuntSpec::standard(FlowArgs::Timeline(TimelineArgs { root: "/var".into() }))
        })?;
        engine.hunts.start_hunt(&hunt_id, now_ms())?;

        let client_id = ClientId::from_index(3);
        engine.check_in(&client_id)?;
        wait_until(Duration::from_secs(5), "timeline request", || {
            Ok(!engine.agent_requests(&client_id)?.is_empty())
        })
        .await?;

        let request = engine.agent_requests(&client_id)?.remove(0);
        let key = FlowKey::new(client_id.clone(), request.flow_id.clone());

        let batch = Bytes::from_static(b"/var/log/syslog\x00/var/log/auth.log\x00");
        let reply = TimelineResult {
            entry_batch_blob_ids: vec![BlobId::of(&batch)],
            entry_count: 2,
            filesystem_type: Some("ext4".into()),
        };
        engine.enqueue(vec![(
            client_id.clone(),
            HandlerPayload::FlowResponses(vec![
                FlowResponse::message(&key, request.request_id, 1, serde_json::to_value(&reply)?),
                FlowResponse::status(&key, request.request_id, 2, ResponseStatus::ok()),
            ]),
        )])?;

        let uploader = {
            let blobs = engine.blobs.clone();
            std::thread::spawn(move || -> Result<u64> {
                std::thread::sleep(Duration::from_secs(2));
                let written_at = now_ms();
                blobs.write_blob_with_unknown_hash(batch)?;
                Ok(written_at)
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(engine.store().read_flow_results(&key, 0, 10)?.is_empty());
        assert_eq!(engine.flow(&key)?.unwrap().status, FlowStatus::Running);

        wait_until(Duration::from_secs(40), "timeline to complete", || {
            Ok(engine.flow(&key)?.is_some_and(|f| f.is_terminal()))
        })
        .await?;
        let written_at = uploader.join().expect("uploader thread panicked")?;

        let flow = engine.flow(&key)?.unwrap();
        assert_eq!(flow.status, FlowStatus::Completed, "{:?}", flow.error);

        let results = engine.store().read_flow_results(&key, 0, 10)?;
        assert_eq!(results.len(), 1);
        assert!(results[0].timestamp >= written_at);
        assert_eq!(results[0].hunt_id.as_ref(), Some(&hunt_id));

        let blobs = timeline_blobs(engine.store(), &engine.blobs, &key)?;
        assert_eq!(blobs, vec![Bytes::from_static(b"/var/log/syslog\x00/var/log/auth.log\x00")]);
        assert_eq!(timeline_filesystem_type(engine.store(), &key)?.as_deref(), Some("ext4"));

        let progress = engine.flows.get_progress(&key)?.expect("progress");
        let progress = serde_json::to_value(progress)?;
        assert_eq!(progress["progress"]["total_entry_count"], 2);
        Ok(())
    })
    .await
}

/// Blobs that never arrive fail the flow with no results.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeline_fails_when_blobs_never_arrive() -> Result<()> {
    let mut config = test_config();
    config.blobs.wait_timeout_secs = 1;

    with_engine(config, |engine| async move {
        let client_id = ClientId::from_index(4);
        engine.enqueue(vec![(
            client_id.clone(),
            HandlerPayload::ClientStartup(startup_info()),
        )])?;
        wait_until(Duration::from_secs(5), "startup info", || {
            Ok(engine.store().read_client_startup_info(&client_id)?.is_some())
        })
        .await?;

        let flow_id = engine.flows.start_flow(
            &client_id,
            FlowArgs::Timeline(TimelineArgs { root: "/".into() }),
            Default::default(),
        )?;
        let key = FlowKey::new(client_id.clone(), flow_id);
        let request = engine.agent_requests(&client_id)?.remove(0);

        let reply = TimelineResult {
            entry_batch_blob_ids: vec![BlobId::of(b"never uploaded")],
            entry_count: 1,
            filesystem_type: None,
        };
        engine.enqueue(vec![(
            client_id.clone(),
            HandlerPayload::FlowResponses(vec![
                FlowResponse::message(&key, request.request_id, 1, serde_json::to_value(&reply)?),
                FlowResponse::status(&key, request.request_id, 2, ResponseStatus::ok()),
            ]),
        )])?;

        wait_until(Duration::from_secs(10), "timeline to fail", || {
            Ok(engine.flow(&key)?.is_some_and(|f| f.is_terminal()))
        })
        .await?;
        let flow = engine.flow(&key)?.unwrap();
        assert_eq!(flow.status, FlowStatus::Error);
        assert!(engine.store().read_flow_results(&key, 0, 10)?.is_empty());
        Ok(())
    })
    .await
}
