//! Load-data job: bytes-only responses, thin shell over the fetch job.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use pictor_model::{ImageRequestOptions, ImageType, UrlResponse};

use super::run_on_queue;
use crate::container::{CacheType, Image, ImageContainer, ImageResponse};
use crate::error::ImagePipelineError;
use crate::pipeline::PipelineInner;
use crate::request::ImageRequest;
use crate::runtime::job::{Job, JobEvent, Starter, SubscriberMeta};

pub(crate) fn starter(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
) -> Starter<ImageResponse> {
    Box::new(move |job| {
        tokio::spawn(run(pipeline, request, job));
    })
}

async fn run(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    job: Arc<Job<ImageResponse>>,
) {
    if job.is_disposed() {
        return;
    }
    let options = request.options();

    if !options.contains(ImageRequestOptions::DISABLE_DISK_CACHE_READS)
        && let Some(cache) = pipeline.resolve_data_cache(&request)
    {
        let key = pipeline.data_cache_key(&request, true);
        let lookup = run_on_queue(
            &job,
            &pipeline.data_caching_queue,
            false,
            move || cache.get(&key),
        )
        .await;
        match lookup {
            None => return,
            Some(Some(data)) => {
                debug!(image_id = %request.image_id(), "data served from disk cache");
                job.send_value(
                    bytes_response(&request, data, None, Some(CacheType::Disk)),
                    true,
                );
                return;
            }
            Some(None) => {}
        }
    }

    if options.contains(ImageRequestOptions::RETURN_CACHE_DATA_DONT_LOAD) {
        job.send_error(ImagePipelineError::DataMissingInCache);
        return;
    }

    // Processors are irrelevant to a bytes-only load; strip them so the
    // fetch coalesces with image loads of the same resource.
    let stripped = request.clone().with_processors(Vec::new());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let subscription = pipeline.subscribe_original_data(
        &stripped,
        job.priority(),
        SubscriberMeta::Job(job.descriptor_provider()),
        events_tx,
    );
    job.set_dependency(Box::new(subscription));

    while let Some(event) = events_rx.recv().await {
        match event {
            JobEvent::Progress(progress) => job.send_progress(progress),
            JobEvent::Error(error) => {
                job.send_error(error);
                break;
            }
            JobEvent::Value { value: (data, url_response), is_completed }
                if is_completed =>
            {
                job.send_value(
                    bytes_response(&request, data, url_response, None),
                    true,
                );
                break;
            }
            // Progressive chunks mean nothing to a bytes-only consumer.
            JobEvent::Value { .. } => {}
        }
    }
}

fn bytes_response(
    request: &ImageRequest,
    data: Bytes,
    url_response: Option<UrlResponse>,
    cache_type: Option<CacheType>,
) -> ImageResponse {
    let image_type = ImageType::from_bytes(&data);
    let mut container = ImageContainer::new(Image::empty());
    container.image_type = image_type;
    container.data = Some(data);
    ImageResponse {
        container,
        request: request.clone(),
        url_response,
        cache_type,
    }
}
