//! File collection flow: one transfer request per path, each handled as its
//! responses arrive.

use serde::{Deserialize, Serialize};

use drover_core::flow::ClientAction;
use drover_core::flow_args::{CollectFilesArgs, CollectFilesProgress, CollectedFile, FileTransferReply};
use drover_core::FlowError;

use super::{Flow, FlowContext, Responses};

pub struct CollectFilesFlow;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CollectFilesState {
    pub progress: CollectFilesProgress,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum CollectFilesStep {
    ReceiveFile { path: String },
    /// Runs after every transfer has been handled.
    Summarize { requested: usize },
}

#[derive(Debug, Serialize)]
struct TransferFileRequest<'a> {
    path: &'a str,
}

impl Flow for CollectFilesFlow {
    const NAME: &'static str = "CollectFiles";
    const STATE_VERSION: u32 = 1;

    type Args = CollectFilesArgs;
    type State = CollectFilesState;
    type Continuation = CollectFilesStep;
    type Progress = CollectFilesProgress;

    fn start(
        args: &CollectFilesArgs,
        _state: &mut CollectFilesState,
        ctx: &mut FlowContext<'_, CollectFilesStep>,
    ) -> Result<(), FlowError> {
        if args.paths.is_empty() {
            return Err(FlowError::InvalidArgs("no paths to collect".into()));
        }
        for path in &args.paths {
            ctx.call_client(
                ClientAction::TransferFile,
                &TransferFileRequest { path },
                CollectFilesStep::ReceiveFile { path: path.clone() },
            )?;
        }
        ctx.call_state(CollectFilesStep::Summarize {
            requested: args.paths.len(),
        })?;
        Ok(())
    }

    fn resume(
        _args: &CollectFilesArgs,
        state: &mut CollectFilesState,
        next: CollectFilesStep,
        responses: Responses,
        ctx: &mut FlowContext<'_, CollectFilesStep>,
    ) -> Result<(), FlowError> {
        match next {
            CollectFilesStep::ReceiveFile { path } => receive_file(state, &path, responses, ctx),
            CollectFilesStep::Summarize { requested } => {
                ctx.log(format!(
                    "collected {} of {requested} files, {} incomplete",
                    state.progress.collected + state.progress.incomplete,
                    state.progress.incomplete
                ));
                Ok(())
            }
        }
    }

    fn progress(state: &CollectFilesState) -> CollectFilesProgress {
        state.progress.clone()
    }
}

/// A failed transfer fails the whole flow. Chunks that never arrive only
/// mark the file incomplete.
fn receive_file(
    state: &mut CollectFilesState,
    path: &str,
    responses: Responses,
    ctx: &mut FlowContext<'_, CollectFilesStep>,
) -> Result<(), FlowError> {
    if !responses.success() {
        return Err(FlowError::ClientFailure(format!(
            "failed to collect {path}: {}",
            responses.status()
        )));
    }

    let Some(reply) = responses.parse::<FileTransferReply>()?.into_iter().next() else {
        return Err(FlowError::UnexpectedResponse(format!(
            "no transfer reply for {path}"
        )));
    };

    let chunks = ctx.read_and_wait_for_blobs(&reply.chunk_ids)?;
    let complete = reply
        .chunk_ids
        .iter()
        .all(|id| chunks.get(id).is_some_and(Option::is_some));
    if complete {
        state.progress.collected += 1;
    } else {
        state.progress.incomplete += 1;
        ctx.log(format!("{path}: some chunks never reached the blob store"));
    }

    ctx.send_reply(&CollectedFile {
        path: reply.path,
        size: reply.size,
        blob_ids: reply.chunk_ids,
        complete,
    })
}
