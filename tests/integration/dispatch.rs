//! Message handler worker end-to-end: delivery, batching, unregistration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use drover_core::message::{HandlerPayload, MessageHandlerRequest};
use drover_core::ClientId;
use drover_services::{Datastore, MemoryDatastore, MessageHandler, MessageHandlerWorker};

use crate::*;

fn foreman_requests(count: u64) -> Vec<MessageHandlerRequest> {
    (1..=count)
        .map(|i| MessageHandlerRequest::new(ClientId::from_index(i), i, HandlerPayload::Foreman))
        .collect()
}

/// Startup info written through the queue lands in the client table and the
/// request is acknowledged.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_startup_info_recorded() -> Result<()> {
    with_engine(test_config(), |engine| async move {
        let client_id = ClientId::from_index(42);
        engine.enqueue(vec![(
            client_id.clone(),
            HandlerPayload::ClientStartup(startup_info()),
        )])?;

        wait_until(Duration::from_secs(5), "startup info", || {
            Ok(engine.store().read_client_startup_info(&client_id)?.is_some())
        })
        .await?;
        wait_until(Duration::from_secs(5), "queue to drain", || Ok(engine.queue_drained())).await?;

        let info = engine.store().read_client_startup_info(&client_id)?.unwrap();
        assert_eq!(info.client_info.client_name, "drover-agent");
        assert_eq!(engine.store().count_clients()?, 1);
        Ok(())
    })
    .await
}

/// No batch handed to the handler is larger than the registered limit.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batches_respect_limit() -> Result<()> {
    let store = MemoryDatastore::new();
    store.write_message_handler_requests(foreman_requests(7))?;

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let worker = MessageHandlerWorker::new(Arc::new(store.clone()), Duration::from_millis(10));
    {
        let sizes = sizes.clone();
        let handler = move |batch: &[MessageHandlerRequest]| -> anyhow::Result<()> {
            sizes.lock().unwrap().push(batch.len());
            Ok(())
        };
        worker.register_message_handler(
            Arc::new(handler) as Arc<dyn MessageHandler>,
            Duration::from_secs(5),
            3,
        )?;
    }

    wait_until(Duration::from_secs(5), "all requests handled", || {
        Ok(sizes.lock().unwrap().iter().sum::<usize>() == 7)
    })
    .await?;
    assert!(worker.unregister_message_handler(Duration::from_secs(5)).await);

    let sizes = sizes.lock().unwrap().clone();
    assert_eq!(sizes[0], 3, "first lease takes a full batch: {sizes:?}");
    assert!(sizes.iter().all(|&n| (1..=3).contains(&n)), "{sizes:?}");
    assert_eq!(store.pending_message_handler_requests(), 0);
    Ok(())
}

/// After unregistration nothing more is delivered and new requests stay
/// queued for the next worker.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregister_stops_delivery() -> Result<()> {
    let store = MemoryDatastore::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let worker = MessageHandlerWorker::new(Arc::new(store.clone()), Duration::from_millis(10));
    {
        let seen = seen.clone();
        let handler = move |batch: &[MessageHandlerRequest]| -> anyhow::Result<()> {
            seen.lock()
                .unwrap()
                .extend(batch.iter().map(|r| r.request_id));
            Ok(())
        };
        worker.register_message_handler(
            Arc::new(handler) as Arc<dyn MessageHandler>,
            Duration::from_secs(5),
            10,
        )?;
    }

    store.write_message_handler_requests(foreman_requests(1))?;
    wait_until(Duration::from_secs(5), "first delivery", || {
        Ok(seen.lock().unwrap().len() == 1)
    })
    .await?;

    assert!(worker.unregister_message_handler(Duration::from_secs(5)).await);
    assert!(!worker.is_registered());

    store.write_message_handler_requests(vec![MessageHandlerRequest::new(
        ClientId::from_index(2),
        2,
        HandlerPayload::Foreman,
    )])?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(*seen.lock().unwrap(), vec![1]);
    assert_eq!(store.pending_message_handler_requests(), 1);

    // A second worker picks the leftover up.
    let next = MessageHandlerWorker::new(Arc::new(store.clone()), Duration::from_millis(10));
    next.register_message_handler(
        Arc::new(|_: &[MessageHandlerRequest]| -> anyhow::Result<()> { Ok(()) })
            as Arc<dyn MessageHandler>,
        Duration::from_secs(5),
        10,
    )?;
    wait_until(Duration::from_secs(5), "leftover drained", || {
        Ok(store.pending_message_handler_requests() == 0)
    })
    .await?;
    next.unregister_message_handler(Duration::from_secs(5)).await;
    Ok(())
}

/// A failing handler leaves the batch queued; it is redelivered once the
/// lease runs out.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_batch_redelivered_after_lease() -> Result<()> {
    let store = MemoryDatastore::new();
    store.write_message_handler_requests(foreman_requests(1))?;

    let attempts = Arc::new(Mutex::new(0u32));
    let worker = MessageHandlerWorker::new(Arc::new(store.clone()), Duration::from_millis(10));
    {
        let attempts = attempts.clone();
        let handler = move |_: &[MessageHandlerRequest]| -> anyhow::Result<()> {
            let mut n = attempts.lock().unwrap();
            *n += 1;
            if *n == 1 {
                anyhow::bail!("transient failure");
            }
            Ok(())
        };
        worker.register_message_handler(
            Arc::new(handler) as Arc<dyn MessageHandler>,
            Duration::from_millis(200),
            10,
        )?;
    }

    wait_until(Duration::from_secs(5), "redelivery", || {
        Ok(store.pending_message_handler_requests() == 0)
    })
    .await?;
    worker.unregister_message_handler(Duration::from_secs(5)).await;
    assert_eq!(*attempts.lock().unwrap(), 2);
    Ok(())
}
