//! Worker loop.
//!
//! Each worker pulls the best pending item, resolves it (durable tier first,
//! then provider and codec) and hands the outcome back to the service, which
//! decides whether it is still wanted.

use super::queue::QueueItem;
use super::service::Shared;
use crate::error::ThumbnailError;
use crate::state::EditFingerprint;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// A dequeued item plus what it was captured against.
#[derive(Debug)]
pub(crate) struct Job {
    pub item: QueueItem,
    /// Service epoch at dequeue time
    pub epoch: u64,
    pub edit: Option<EditFingerprint>,
}

/// Derivative bytes and where they came from.
#[derive(Debug)]
pub(crate) enum Derived {
    /// Fresh codec output; written through to the durable tier
    Rendered(Vec<u8>),
    /// Read back from the durable tier
    Stored(Vec<u8>),
}

pub(crate) async fn run_worker(id: usize, shared: Arc<Shared>, shutdown: CancellationToken) {
    debug!(worker = id, "thumbnail worker started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if let Some(job) = shared.next_job() {
            trace!(
                worker = id,
                asset = %job.item.asset,
                priority = ?job.item.priority,
                generation = job.item.generation,
                "processing"
            );
            run_job(&shared, job).await;
            continue;
        }

        // Notify keeps a permit when nobody is waiting, so a request that
        // lands between the empty dequeue and here is not lost.
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = shared.work_available().notified() => {}
        }
    }

    debug!(worker = id, "thumbnail worker stopped");
}

async fn run_job(shared: &Shared, job: Job) {
    let outcome = AssertUnwindSafe(resolve(shared, &job)).catch_unwind().await;

    match outcome {
        Ok(Ok(Some(derived))) => shared.commit(&job, derived),
        Ok(Ok(None)) => shared.discard(&job),
        Ok(Err(e)) => shared.fail(&job, e),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(asset = %job.item.asset, panic = %message, "thumbnail worker caught a panic");
            shared.fail(&job, ThumbnailError::Internal(message));
        }
    }
}

/// `Ok(None)` when the job went stale before the expensive part started.
async fn resolve(shared: &Shared, job: &Job) -> Result<Option<Derived>, ThumbnailError> {
    let asset = &job.item.asset;

    if let Some(bytes) = shared.cache().load_durable(asset, job.edit).await {
        trace!(asset = %asset, "durable hit");
        return Ok(Some(Derived::Stored(bytes)));
    }

    if !shared.is_current(job) {
        return Ok(None);
    }

    let source = job.item.provider.read().await?;
    let bytes = shared
        .codec()
        .generate(source, job.item.edit, shared.kind())
        .await?;
    Ok(Some(Derived::Rendered(bytes)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_from_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bad frame"));
        assert_eq!(panic_message(payload.as_ref()), "bad frame");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "worker panicked");
    }
}
