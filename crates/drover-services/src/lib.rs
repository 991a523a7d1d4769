//! drover-services — the orchestration engine: stores, blob synchronization,
//! message handler dispatch, the flow state machine and the hunt scheduler.

pub mod blob_store;
pub mod blob_sync;
pub mod context;
pub mod flow;
pub mod foreman;
pub mod fs_blob_store;
pub mod handlers;
pub mod hunt;
pub mod memory_store;
pub mod qos;
pub mod store;
pub mod worker;

pub use blob_store::{BlobStore, MemoryBlobStore};
pub use blob_sync::{BlobSynchronizer, PollStats};
pub use context::ServerContext;
pub use flow::{FlowProgress, FlowRuntime, StartOptions};
pub use foreman::Foreman;
pub use fs_blob_store::FsBlobStore;
pub use handlers::HandlerDispatcher;
pub use hunt::{Admission, HuntScheduler};
pub use memory_store::MemoryDatastore;
pub use store::{Datastore, FlowStepCommit};
pub use worker::{MessageHandler, MessageHandlerWorker};
