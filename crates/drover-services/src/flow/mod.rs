//! Flow state machine.
//!
//! A flow is a resumable, multi-step conversation with one agent. Each step
//! runs to completion without blocking on the agent: it issues requests,
//! each naming the continuation that will handle its responses, and then
//! the whole flow suspends into its [`FlowRecord`]. When every response for
//! the next request in order has arrived, the runtime rehydrates the state
//! and runs the continuation.
//!
//! Flow kinds implement [`Flow`]. Continuations are a typed enum per kind and
//! flow state is a versioned serde value, so a suspended flow survives a
//! worker restart.

pub mod collect_files;
pub mod runtime;
pub mod timeline;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use drover_core::flow::{
    ClientAction, FlowKey, FlowRecord, FlowResponse, ResponsePayload, ResponseStatus,
    VersionedState,
};
use drover_core::flow_args::{CollectFilesProgress, TimelineProgress};
use drover_core::message::{ClientInfo, StartupInfo};
use drover_core::{BlobId, FlowError, RequestId};

use crate::blob_sync::BlobSynchronizer;

pub use collect_files::CollectFilesFlow;
pub use runtime::{FlowRuntime, StartOptions};
pub use timeline::TimelineFlow;

/// A flow kind.
///
/// Implementations are stateless: everything that must outlive a step goes
/// into `State`, which is serialized at every suspension.
pub trait Flow {
    const NAME: &'static str;
    /// Bumped whenever `State` changes incompatibly.
    const STATE_VERSION: u32;

    type Args;
    type State: Serialize + DeserializeOwned + Default;
    type Continuation: Serialize + DeserializeOwned;
    type Progress: Serialize;

    fn start(
        args: &Self::Args,
        state: &mut Self::State,
        ctx: &mut FlowContext<'_, Self::Continuation>,
    ) -> Result<(), FlowError>;

    fn resume(
        args: &Self::Args,
        state: &mut Self::State,
        next: Self::Continuation,
        responses: Responses,
        ctx: &mut FlowContext<'_, Self::Continuation>,
    ) -> Result<(), FlowError>;

    fn progress(state: &Self::State) -> Self::Progress;
}

/// Progress of any flow kind, readable while the flow runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flow", content = "progress", rename_all = "snake_case")]
pub enum FlowProgress {
    Timeline(TimelineProgress),
    CollectFiles(CollectFilesProgress),
}

/// All responses to one request, reassembled in response-id order.
#[derive(Debug, Clone)]
pub struct Responses {
    request_id: RequestId,
    status: ResponseStatus,
    messages: Vec<serde_json::Value>,
}

impl Responses {
    /// Reassemble stored responses. Returns `None` until the status has
    /// arrived and every response id before it is present. Duplicate ids
    /// collapse to one.
    pub(crate) fn assemble(request_id: RequestId, mut stored: Vec<FlowResponse>) -> Option<Self> {
        stored.sort_by_key(|r| r.response_id);
        stored.dedup_by_key(|r| r.response_id);

        let status_id = stored.iter().find_map(|r| match r.payload {
            ResponsePayload::Status(_) => Some(r.response_id),
            ResponsePayload::Message(_) => None,
        })?;
        let n = usize::try_from(status_id).ok()?;
        if n == 0 || stored.len() < n {
            return None;
        }
        let contiguous = stored[..n]
            .iter()
            .zip(1u64..)
            .all(|(r, expected)| r.response_id == expected);
        if !contiguous {
            return None;
        }

        let mut status = None;
        let mut messages = Vec::with_capacity(n - 1);
        for response in stored.into_iter().take(n) {
            match response.payload {
                ResponsePayload::Message(value) => messages.push(value),
                ResponsePayload::Status(s) => status = Some(s),
            }
        }
        Some(Self {
            request_id,
            status: status?,
            messages,
        })
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn success(&self) -> bool {
        self.status.is_ok()
    }

    pub fn status(&self) -> &ResponseStatus {
        &self.status
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &serde_json::Value> {
        self.messages.iter()
    }

    /// Decode every message as `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<Vec<T>, FlowError> {
        self.messages
            .iter()
            .map(|m| {
                serde_json::from_value(m.clone())
                    .map_err(|e| FlowError::UnexpectedResponse(format!("request {}: {e}", self.request_id)))
            })
            .collect()
    }
}

/// A request issued during a step, with its continuation already encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRequest {
    pub request_id: RequestId,
    /// `None` for state calls, which never reach the agent.
    pub action: Option<ClientAction>,
    pub payload: serde_json::Value,
    pub next_state: serde_json::Value,
}

/// What a step did to its flow.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Continue {
        state: VersionedState,
        requests: Vec<NewRequest>,
    },
    Complete {
        state: VersionedState,
    },
    Fail {
        reason: String,
    },
}

/// Capabilities available to a running step.
pub struct FlowContext<'a, C> {
    key: &'a FlowKey,
    client: Option<&'a StartupInfo>,
    blobs: &'a BlobSynchronizer,
    blob_timeout: Duration,
    next_request_id: RequestId,
    requests: Vec<NewRequest>,
    replies: Vec<serde_json::Value>,
    logs: Vec<String>,
    _continuation: PhantomData<C>,
}

impl<'a, C: Serialize> FlowContext<'a, C> {
    pub(crate) fn new(env: &StepEnv<'a>) -> Self {
        Self {
            key: env.key,
            client: env.client,
            blobs: env.blobs,
            blob_timeout: env.blob_timeout,
            next_request_id: env.next_request_id,
            requests: Vec::new(),
            replies: Vec::new(),
            logs: Vec::new(),
            _continuation: PhantomData,
        }
    }

    pub fn key(&self) -> &FlowKey {
        self.key
    }

    pub fn client_info(&self) -> Option<&ClientInfo> {
        self.client.map(|s| &s.client_info)
    }

    /// Ask the agent to run `action`; its responses resume at `next`.
    pub fn call_client<P: Serialize>(
        &mut self,
        action: ClientAction,
        payload: &P,
        next: C,
    ) -> Result<RequestId, FlowError> {
        let payload = serde_json::to_value(payload)?;
        self.push_request(Some(action), payload, next)
    }

    /// Schedule `next` as a later step of this flow without involving the
    /// agent. It resumes with an empty, successful response set.
    pub fn call_state(&mut self, next: C) -> Result<RequestId, FlowError> {
        self.push_request(None, serde_json::Value::Null, next)
    }

    fn push_request(
        &mut self,
        action: Option<ClientAction>,
        payload: serde_json::Value,
        next: C,
    ) -> Result<RequestId, FlowError> {
        let request_id = self.next_request_id;
        self.requests.push(NewRequest {
            request_id,
            action,
            payload,
            next_state: serde_json::to_value(&next)?,
        });
        self.next_request_id += 1;
        Ok(request_id)
    }

    /// Emit a flow result. Results are persisted only if the step succeeds.
    pub fn send_reply<R: Serialize>(&mut self, reply: &R) -> Result<(), FlowError> {
        self.replies.push(serde_json::to_value(reply)?);
        Ok(())
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.logs.push(message.into());
    }

    /// Block until all `ids` are in the blob store.
    pub fn wait_for_blobs(&self, ids: &[BlobId]) -> Result<(), FlowError> {
        self.blobs.wait_for_blobs(ids, self.blob_timeout)?;
        Ok(())
    }

    /// Read `ids`, waiting for late arrivals. Blobs that never showed up map
    /// to `None`.
    pub fn read_and_wait_for_blobs(
        &self,
        ids: &[BlobId],
    ) -> Result<HashMap<BlobId, Option<Bytes>>, FlowError> {
        Ok(self.blobs.read_and_wait_for_blobs(ids, self.blob_timeout)?)
    }
}

pub(crate) enum Step {
    Start,
    Resume {
        next_state: serde_json::Value,
        responses: Responses,
    },
}

pub(crate) struct StepEnv<'a> {
    pub key: &'a FlowKey,
    pub client: Option<&'a StartupInfo>,
    pub blobs: &'a BlobSynchronizer,
    pub blob_timeout: Duration,
    pub next_request_id: RequestId,
    /// Requests still pending apart from the one being processed.
    pub outstanding: usize,
}

pub(crate) struct StepOutput {
    pub transition: Transition,
    pub replies: Vec<serde_json::Value>,
    pub logs: Vec<String>,
    pub next_request_id: RequestId,
}

impl StepOutput {
    /// Fail the flow without running any flow code.
    pub fn failed(reason: String, next_request_id: RequestId) -> Self {
        Self {
            transition: Transition::Fail { reason },
            replies: Vec::new(),
            logs: Vec::new(),
            next_request_id,
        }
    }
}

pub(crate) fn decode_state<F: Flow>(stored: &VersionedState) -> Result<F::State, FlowError> {
    if stored.version == 0 && stored.data.is_null() {
        return Ok(F::State::default());
    }
    if stored.version != F::STATE_VERSION {
        return Err(FlowError::StateVersion {
            found: stored.version,
            expected: F::STATE_VERSION,
        });
    }
    Ok(serde_json::from_value(stored.data.clone())?)
}

/// Run one step of `F` and turn its effects into a [`Transition`].
pub(crate) fn drive<F: Flow>(
    args: &F::Args,
    record: &FlowRecord,
    step: Step,
    env: StepEnv<'_>,
) -> StepOutput {
    let mut ctx = FlowContext::<F::Continuation>::new(&env);
    let transition = match run::<F>(args, record, step, &mut ctx, env.outstanding) {
        Ok(transition) => transition,
        Err(e) => {
            tracing::debug!(flow = F::NAME, key = %env.key, error = %e, "flow step raised");
            Transition::Fail {
                reason: e.to_string(),
            }
        }
    };
    StepOutput {
        transition,
        replies: ctx.replies,
        logs: ctx.logs,
        next_request_id: ctx.next_request_id,
    }
}

fn run<F: Flow>(
    args: &F::Args,
    record: &FlowRecord,
    step: Step,
    ctx: &mut FlowContext<'_, F::Continuation>,
    outstanding: usize,
) -> Result<Transition, FlowError> {
    let mut state = decode_state::<F>(&record.state)?;
    match step {
        Step::Start => F::start(args, &mut state, ctx)?,
        Step::Resume {
            next_state,
            responses,
        } => {
            let next: F::Continuation = serde_json::from_value(next_state)?;
            F::resume(args, &mut state, next, responses, ctx)?;
        }
    }

    let state = VersionedState {
        version: F::STATE_VERSION,
        data: serde_json::to_value(&state)?,
    };
    let requests = std::mem::take(&mut ctx.requests);
    if requests.is_empty() && outstanding == 0 {
        Ok(Transition::Complete { state })
    } else {
        Ok(Transition::Continue { state, requests })
    }
}
