//! Timeline flow: recursively stat everything under a root directory.
//!
//! The agent streams stat entries into blobs and replies with the blob ids
//! and entry counts. A result is only emitted once every referenced blob is
//! readable, so consumers never see a dangling reference.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use drover_core::flow::{ClientAction, FlowKey};
use drover_core::flow_args::{TimelineArgs, TimelineProgress, TimelineResult};
use drover_core::{BlobId, FlowError};

use super::{Flow, FlowContext, Responses};
use crate::blob_store::BlobStore;
use crate::store::Datastore;

/// Results beyond this count indicate a misbehaving agent.
pub const MAX_TIMELINE_RESULTS: usize = 1024;

pub struct TimelineFlow;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TimelineState {
    pub progress: TimelineProgress,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineStep {
    Process,
}

impl Flow for TimelineFlow {
    const NAME: &'static str = "Timeline";
    const STATE_VERSION: u32 = 1;

    type Args = TimelineArgs;
    type State = TimelineState;
    type Continuation = TimelineStep;
    type Progress = TimelineProgress;

    fn start(
        args: &TimelineArgs,
        state: &mut TimelineState,
        ctx: &mut FlowContext<'_, TimelineStep>,
    ) -> Result<(), FlowError> {
        if args.root.is_empty() {
            return Err(FlowError::InvalidArgs(
                "the timeline root directory not specified".into(),
            ));
        }

        if !ctx.client_info().is_some_and(|c| c.timeline_btime_support) {
            ctx.log("Collecting file birth time is not supported on this client.");
        }

        *state = TimelineState::default();
        ctx.call_client(ClientAction::Timeline, args, TimelineStep::Process)?;
        Ok(())
    }

    fn resume(
        _args: &TimelineArgs,
        state: &mut TimelineState,
        next: TimelineStep,
        responses: Responses,
        ctx: &mut FlowContext<'_, TimelineStep>,
    ) -> Result<(), FlowError> {
        match next {
            TimelineStep::Process => process(state, responses, ctx),
        }
    }

    fn progress(state: &TimelineState) -> TimelineProgress {
        state.progress.clone()
    }
}

fn process(
    state: &mut TimelineState,
    responses: Responses,
    ctx: &mut FlowContext<'_, TimelineStep>,
) -> Result<(), FlowError> {
    if !responses.success() {
        return Err(FlowError::ClientFailure(format!(
            "timeline collection failure: {}",
            responses.status()
        )));
    }

    let results: Vec<TimelineResult> = responses.parse()?;
    let blob_ids: Vec<BlobId> = results
        .iter()
        .flat_map(|r| r.entry_batch_blob_ids.iter().copied())
        .collect();

    ctx.wait_for_blobs(&blob_ids)?;
    tracing::debug!(flow = %ctx.key(), blobs = blob_ids.len(), "timeline entry blobs present");

    for result in &results {
        ctx.send_reply(result)?;
        state.progress.total_entry_count += result.entry_count;
    }
    Ok(())
}

fn read_results(store: &dyn Datastore, key: &FlowKey) -> Result<Vec<TimelineResult>, FlowError> {
    let results = store.read_flow_results(key, 0, MAX_TIMELINE_RESULTS)?;
    if results.len() >= MAX_TIMELINE_RESULTS {
        return Err(FlowError::TooManyResults(results.len()));
    }
    results
        .into_iter()
        .map(|r| serde_json::from_value(r.payload).map_err(FlowError::from))
        .collect()
}

/// Entry blobs of a finished timeline, in result order.
pub fn timeline_blobs(
    store: &dyn Datastore,
    blobs: &dyn BlobStore,
    key: &FlowKey,
) -> Result<Vec<Bytes>, FlowError> {
    let mut out = Vec::new();
    for result in read_results(store, key)? {
        let mut fetched = blobs.read_blobs(&result.entry_batch_blob_ids)?;
        for id in &result.entry_batch_blob_ids {
            match fetched.get_mut(id).and_then(Option::take) {
                Some(blob) => out.push(blob),
                // Duplicate ids within a result share one read.
                None => match blobs.read_blob(*id)? {
                    Some(blob) => out.push(blob),
                    None => return Err(FlowError::DanglingBlob(*id)),
                },
            }
        }
    }
    Ok(out)
}

/// Filesystem type reported by the first result, if any.
pub fn timeline_filesystem_type(
    store: &dyn Datastore,
    key: &FlowKey,
) -> Result<Option<String>, FlowError> {
    Ok(read_results(store, key)?
        .into_iter()
        .next()
        .and_then(|r| r.filesystem_type))
}
