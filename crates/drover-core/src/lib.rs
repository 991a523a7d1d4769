//! drover-core — shared types, configuration, and error taxonomy.
//! All other drover crates depend on this one.

pub mod blob;
pub mod config;
pub mod error;
pub mod flow;
pub mod flow_args;
pub mod hunt;
pub mod ids;
pub mod message;

pub use blob::BlobId;
pub use error::{BlobStoreError, DispatchError, FlowError, HuntError, StoreError};
pub use ids::{now_ms, ClientId, FlowId, HuntId, RequestId, ResponseId};
