//! Error taxonomy shared across the engine.

use std::time::Duration;

use crate::blob::BlobId;
use crate::hunt::HuntState;
use crate::ids::{ClientId, FlowId, HuntId};

/// Durable store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    /// Optimistic concurrency check failed: someone else wrote the record
    /// since it was read.
    #[error("revision conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Blob store failures.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// Some blobs were still missing when the wait deadline passed.
    #[error("timed out after {waited:?} waiting for {missing} blob(s)")]
    Timeout { missing: usize, waited: Duration },
    #[error("blob content does not hash to {0}")]
    HashMismatch(BlobId),
    #[error("blob store io failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Flow-fatal errors. Raised by flow logic or the runtime; the flow moves to
/// ERROR carrying the message.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// The agent reported a failure status for a request.
    #[error("{0}")]
    ClientFailure(String),
    #[error("invalid flow arguments: {0}")]
    InvalidArgs(String),
    /// Unexpected payload type, result count, or other invariant violation.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("{resource} budget exceeded: used {used}, limit {limit}")]
    BudgetExceeded {
        resource: &'static str,
        used: f64,
        limit: f64,
    },
    #[error(transparent)]
    Blobs(#[from] BlobStoreError),
    #[error("flow state could not be decoded: {0}")]
    State(#[from] serde_json::Error),
    #[error("flow state version {found} is not readable (expected {expected})")]
    StateVersion { found: u32, expected: u32 },
    #[error("result references blob {0} which is not in the blob store")]
    DanglingBlob(BlobId),
    #[error("unexpected number of results: {0}")]
    TooManyResults(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hunt lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum HuntError {
    #[error("hunt {0} not found")]
    NotFound(HuntId),
    #[error("hunt {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: HuntId,
        from: HuntState,
        to: HuntState,
    },
    #[error("invalid hunt arguments: {0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("flow {flow_id} for client {client_id} failed to start: {source}")]
    FlowStart {
        client_id: ClientId,
        flow_id: FlowId,
        #[source]
        source: FlowError,
    },
}

/// Message handler registration errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("a message handler is already registered")]
    AlreadyRegistered,
    #[error("message handler limit must be at least 1")]
    ZeroLimit,
    #[error("no tokio runtime available to drive the message handler loop")]
    NoRuntime,
}
