//! Fetch job for caller-supplied byte producers.

use std::sync::Arc;

use pictor_model::ImageRequestOptions;

use super::{DataValue, run_async_on_queue};
use crate::error::ImagePipelineError;
use crate::pipeline::PipelineInner;
use crate::request::{ImageRequest, ImageResource};
use crate::runtime::job::{Job, Starter};

pub(crate) fn starter(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
) -> Starter<DataValue> {
    Box::new(move |job| {
        tokio::spawn(run(pipeline, request, job));
    })
}

async fn run(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    job: Arc<Job<DataValue>>,
) {
    if job.is_disposed() {
        return;
    }
    let ImageResource::Producer(producer) = request.resource() else {
        job.send_error(ImagePipelineError::ImageRequestMissing);
        return;
    };
    let producer = producer.clone();
    let bypass = request
        .options()
        .contains(ImageRequestOptions::SKIP_DATA_LOADING_QUEUE);
    let produced = run_async_on_queue(
        &job,
        &pipeline.data_loading_queue,
        bypass,
        async move { producer.produce().await },
    )
    .await;
    match produced {
        None => {}
        Some(Ok(data)) => job.send_value((data, None), true),
        Some(Err(error)) => {
            job.send_error(ImagePipelineError::data_loading(error))
        }
    }
}
