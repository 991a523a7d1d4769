//! Process-wide collaborators, built once at startup and shared by `Arc`.

use std::sync::Arc;

use drover_core::config::DroverConfig;

use crate::blob_store::BlobStore;
use crate::blob_sync::BlobSynchronizer;
use crate::store::Datastore;

pub struct ServerContext {
    pub store: Arc<dyn Datastore>,
    pub blobs: BlobSynchronizer,
    pub config: Arc<DroverConfig>,
}

impl ServerContext {
    pub fn new(
        store: Arc<dyn Datastore>,
        blob_store: Arc<dyn BlobStore>,
        config: DroverConfig,
    ) -> Arc<Self> {
        let blobs = BlobSynchronizer::new(blob_store, config.blobs.poll_interval());
        Arc::new(Self {
            store,
            blobs,
            config: Arc::new(config),
        })
    }
}
