//! The five job kinds behind the pipeline's task pools.

pub(crate) mod fetch_original_data;
pub(crate) mod fetch_original_image;
pub(crate) mod fetch_with_producer;
pub(crate) mod load_data;
pub(crate) mod load_image;

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use pictor_model::UrlResponse;

use crate::runtime::job::Job;
use crate::runtime::queue::WorkQueue;

/// What fetch jobs produce: accumulated bytes plus the transport
/// response, if one exists.
pub(crate) type DataValue = (Bytes, Option<UrlResponse>);

/// Run a closure as this job's current work-queue operation and await
/// its result.
///
/// Returns `None` when the operation was cancelled underneath us, which
/// happens exactly when the job was disposed; callers treat it as "stop
/// quietly".
pub(crate) async fn run_on_queue<T, R, F>(
    job: &Arc<Job<T>>,
    queue: &WorkQueue,
    bypass: bool,
    work: F,
) -> Option<R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    run_async_on_queue(job, queue, bypass, async move { work() }).await
}

/// Async-body variant of [`run_on_queue`].
pub(crate) async fn run_async_on_queue<T, R, Fut>(
    job: &Arc<Job<T>>,
    queue: &WorkQueue,
    bypass: bool,
    work: Fut,
) -> Option<R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let body: BoxFuture<'static, ()> = Box::pin(async move {
        let _ = tx.send(work.await);
    });
    let operation = if bypass {
        queue.enqueue_bypassing(job.priority(), body)
    } else {
        queue.enqueue(job.priority(), body)
    };
    job.set_operation(operation);
    rx.await.ok()
}
