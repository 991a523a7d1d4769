//! drover integration test harness.
//!
//! Each test wires a complete in-process engine: memory datastore, memory
//! blob store, flow runtime, hunt scheduler, foreman and a message handler
//! worker leasing from the shared queue. Clients are simulated by writing
//! handler requests and reading the agent-bound action requests back out.
//!
//!   cargo test --test integration
//!
//! Tests need the multi-threaded runtime: handler batches run on the
//! blocking pool and may sleep while waiting for blobs.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use drover_core::config::DroverConfig;
use drover_core::flow::{ClientActionRequest, FlowKey, FlowRecord};
use drover_core::message::{ClientInfo, HandlerPayload, MessageHandlerRequest, StartupInfo};
use drover_core::ClientId;
use drover_services::{
    Datastore, Foreman, FlowRuntime, HandlerDispatcher, HuntScheduler, MemoryBlobStore,
    MemoryDatastore, MessageHandler, MessageHandlerWorker, ServerContext,
};

mod dispatch;
mod hunts;
mod timeline;

// ── Harness ───────────────────────────────────────────────────────────────────

/// A running engine with its worker registered.
pub struct Engine {
    pub datastore: MemoryDatastore,
    pub blobs: MemoryBlobStore,
    pub ctx: Arc<ServerContext>,
    pub flows: FlowRuntime,
    pub hunts: HuntScheduler,
    pub worker: MessageHandlerWorker,
    next_request: AtomicU64,
}

/// Config tuned for tests: short polls, short leases.
pub fn test_config() -> DroverConfig {
    let mut config = DroverConfig::default();
    config.worker.poll_interval_ms = 10;
    config.worker.message_handler_lease_secs = 5;
    config.blobs.poll_interval_ms = 50;
    config
}

impl Engine {
    /// Build the engine and register the dispatcher. Must be called from
    /// inside a tokio runtime.
    pub fn start(config: DroverConfig) -> Result<Self> {
        let datastore = MemoryDatastore::new();
        let blobs = MemoryBlobStore::new();
        let lease_time = config.worker.lease_time();
        let batch_limit = config.worker.message_handler_batch_limit;
        let poll_interval = config.worker.poll_interval();

        let ctx = ServerContext::new(Arc::new(datastore.clone()), Arc::new(blobs.clone()), config);
        let flows = FlowRuntime::new(ctx.clone());
        let hunts = HuntScheduler::new(ctx.clone(), flows.clone());
        let foreman = Foreman::new(ctx.clone(), hunts.clone());
        let dispatcher = HandlerDispatcher::new(ctx.clone(), flows.clone(), hunts.clone(), foreman);

        let worker = MessageHandlerWorker::new(ctx.store.clone(), poll_interval);
        worker.register_message_handler(
            Arc::new(dispatcher) as Arc<dyn MessageHandler>,
            lease_time,
            batch_limit,
        )?;

        Ok(Self {
            datastore,
            blobs,
            ctx,
            flows,
            hunts,
            worker,
            next_request: AtomicU64::new(1),
        })
    }

    pub fn store(&self) -> &dyn Datastore {
        self.ctx.store.as_ref()
    }

    /// Queue handler requests as one write, in order.
    pub fn enqueue(&self, requests: Vec<(ClientId, HandlerPayload)>) -> Result<()> {
        let requests = requests
            .into_iter()
            .map(|(client_id, payload)| {
                let id = self.next_request.fetch_add(1, Ordering::Relaxed);
                MessageHandlerRequest::new(client_id, id, payload)
            })
            .collect();
        self.store().write_message_handler_requests(requests)?;
        Ok(())
    }

    /// Announce a client and ask the foreman for work.
    pub fn check_in(&self, client_id: &ClientId) -> Result<()> {
        self.enqueue(vec![
            (client_id.clone(), HandlerPayload::ClientStartup(startup_info())),
            (client_id.clone(), HandlerPayload::Foreman),
        ])
    }

    pub fn flow(&self, key: &FlowKey) -> Result<Option<FlowRecord>> {
        Ok(self.store().read_flow(key)?)
    }

    /// Action requests the agent would receive on its next poll.
    pub fn agent_requests(&self, client_id: &ClientId) -> Result<Vec<ClientActionRequest>> {
        Ok(self.store().read_client_action_requests(client_id)?)
    }

    pub fn queue_drained(&self) -> bool {
        self.datastore.pending_message_handler_requests() == 0
    }

    pub async fn shutdown(self) {
        self.worker
            .unregister_message_handler(Duration::from_secs(10))
            .await;
    }
}

pub fn startup_info() -> StartupInfo {
    StartupInfo {
        client_info: ClientInfo {
            client_name: "drover-agent".into(),
            client_version: 3400,
            labels: vec!["integration".into()],
            timeline_btime_support: true,
        },
        os: "Linux".into(),
        boot_time: 1,
    }
}

/// Poll `check` every 20ms until it returns true or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Run a scenario against a fresh engine, shutting the worker down even
/// when the scenario fails.
pub async fn with_engine<F, Fut>(config: DroverConfig, scenario: F) -> Result<()>
where
    F: FnOnce(Arc<Engine>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let engine = Arc::new(Engine::start(config)?);
    let result = scenario(engine.clone()).await;
    if let Ok(engine) = Arc::try_unwrap(engine) {
        engine.shutdown().await;
    }
    result
}
