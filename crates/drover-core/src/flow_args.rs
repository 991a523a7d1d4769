//! Arguments, results, and progress types for each flow kind.

use serde::{Deserialize, Serialize};

use crate::blob::BlobId;

/// Declared arguments of a flow; the variant selects the flow kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flow", content = "args", rename_all = "snake_case")]
pub enum FlowArgs {
    Timeline(TimelineArgs),
    CollectFiles(CollectFilesArgs),
}

impl FlowArgs {
    pub fn name(&self) -> &'static str {
        match self {
            FlowArgs::Timeline(_) => "Timeline",
            FlowArgs::CollectFiles(_) => "CollectFiles",
        }
    }
}

/// Recursively collect stat entries under `root`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimelineArgs {
    pub root: String,
}

/// Agent reply to a timeline action and the result the flow emits.
///
/// The entries themselves are streamed as gzchunked blobs; the reply only
/// references them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimelineResult {
    #[serde(default)]
    pub entry_batch_blob_ids: Vec<BlobId>,
    #[serde(default)]
    pub entry_count: u64,
    #[serde(default)]
    pub filesystem_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimelineProgress {
    pub total_entry_count: u64,
}

/// Fetch the given files from the agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectFilesArgs {
    pub paths: Vec<String>,
}

/// Agent reply to a file transfer: the file's chunks were uploaded to the
/// blob store separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferReply {
    pub path: String,
    pub size: u64,
    pub chunk_ids: Vec<BlobId>,
}

/// Result emitted per transferred file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedFile {
    pub path: String,
    pub size: u64,
    pub blob_ids: Vec<BlobId>,
    /// False when some chunks never reached the blob store.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectFilesProgress {
    pub collected: u64,
    pub incomplete: u64,
}
