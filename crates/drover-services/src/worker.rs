//! Message handler worker: leases batches from the durable queue and hands
//! them to the registered handler.
//!
//! Delivery is at-least-once. A batch is acknowledged (deleted) only after
//! the handler returns `Ok`; on error or panic it stays leased until the
//! lease expires and is then handed out again, possibly to another worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use drover_core::message::MessageHandlerRequest;
use drover_core::{now_ms, DispatchError};

use crate::store::Datastore;

/// Processes one leased batch. Runs on the blocking pool.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, batch: &[MessageHandlerRequest]) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&[MessageHandlerRequest]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, batch: &[MessageHandlerRequest]) -> anyhow::Result<()> {
        self(batch)
    }
}

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

struct ActiveHandler {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

pub struct MessageHandlerWorker {
    store: Arc<dyn Datastore>,
    owner: String,
    poll_interval: Duration,
    active: Mutex<Option<ActiveHandler>>,
}

impl MessageHandlerWorker {
    pub fn new(store: Arc<dyn Datastore>, poll_interval: Duration) -> Self {
        let owner = format!(
            "worker-{}-{}",
            std::process::id(),
            NEXT_WORKER.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            store,
            owner,
            poll_interval,
            active: Mutex::new(None),
        }
    }

    /// Lease owner name written into every lease this worker takes.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_registered(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Install `handler` and start the lease loop on the current tokio
    /// runtime. Only one handler may be registered at a time.
    pub fn register_message_handler(
        &self,
        handler: Arc<dyn MessageHandler>,
        lease_time: Duration,
        limit: usize,
    ) -> Result<(), DispatchError> {
        if limit == 0 {
            return Err(DispatchError::ZeroLimit);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return Err(DispatchError::AlreadyRegistered);
        }

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = runtime.spawn(handler_loop(
            self.store.clone(),
            handler,
            self.owner.clone(),
            lease_time,
            limit,
            self.poll_interval,
            shutdown_rx,
        ));
        *active = Some(ActiveHandler { shutdown, task });
        tracing::info!(owner = %self.owner, ?lease_time, limit, "message handler registered");
        Ok(())
    }

    /// Stop delivering batches. Waits up to `timeout` for an in-flight batch
    /// to finish, then aborts the loop. Returns true if the loop drained
    /// before the timeout.
    pub async fn unregister_message_handler(&self, timeout: Duration) -> bool {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(ActiveHandler { shutdown, mut task }) = active else {
            return true;
        };

        let _ = shutdown.send(());
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => {
                tracing::info!(owner = %self.owner, "message handler unregistered");
                true
            }
            Err(_) => {
                task.abort();
                tracing::warn!(
                    owner = %self.owner,
                    ?timeout,
                    "message handler did not drain in time, aborted"
                );
                false
            }
        }
    }
}

fn shutdown_requested(rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

async fn handler_loop(
    store: Arc<dyn Datastore>,
    handler: Arc<dyn MessageHandler>,
    owner: String,
    lease_time: Duration,
    limit: usize,
    poll_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        if shutdown_requested(&mut shutdown) {
            break;
        }

        let batch = match store.lease_message_handler_requests(&owner, lease_time, limit, now_ms()) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "leasing message handler requests failed");
                Vec::new()
            }
        };

        if batch.is_empty() {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(poll_interval) => continue,
            }
        }

        let keys: Vec<_> = batch.iter().map(MessageHandlerRequest::key).collect();
        let size = batch.len();
        let h = handler.clone();
        match tokio::task::spawn_blocking(move || h.handle(&batch)).await {
            Ok(Ok(())) => match store.delete_message_handler_requests(&keys) {
                Ok(deleted) => tracing::debug!(size, deleted, "message handler batch acknowledged"),
                Err(e) => tracing::error!(error = %e, size, "acknowledging batch failed"),
            },
            Ok(Err(e)) => {
                tracing::warn!(error = %e, size, "message handler failed, batch left for re-lease");
            }
            Err(e) => {
                tracing::error!(error = %e, size, "message handler panicked, batch left for re-lease");
            }
        }
    }
    tracing::debug!(%owner, "message handler loop stopped");
}
