//! Load-image job: cache lookups, recursive processor peel,
//! decompression, and cache population.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use pictor_model::ImageRequestOptions;

use super::run_on_queue;
use crate::codec::{ImageDecodingContext, ImageEncodingContext};
use crate::container::{CacheType, ImageResponse};
use crate::error::ImagePipelineError;
use crate::keys::MemoryCacheKey;
use crate::pipeline::{DataCachePolicy, PipelineInner};
use crate::processing::{ImageProcessing, ProcessingContext};
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

enum StageResult {
    Emit(ImageResponse, bool),
    Fail(ImagePipelineError),
    /// Cancelled mid-stage or a swallowed progressive failure.
    Skip,
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

    // 1. Memory cache. A preview hit is delivered but does not finish
    //    the job.
    if !options.contains(ImageRequestOptions::DISABLE_MEMORY_CACHE_READS)
        && let Some(container) = pipeline.cached_image(&request)
    {
        let is_preview = container.is_preview;
        trace!(image_id = %request.image_id(), is_preview, "memory cache hit");
        let response = ImageResponse {
            container,
            request: request.clone(),
            url_response: None,
            cache_type: Some(CacheType::Memory),
        };
        job.send_value(response, !is_preview);
        if !is_preview {
            return;
        }
    }

    // 2. Data cache, for requests whose processed bytes may have been
    //    stored. Unprocessed requests are served by the fetch job's
    //    original-data lookup instead.
    let is_processed_request = !request.processors().is_empty()
        || request.thumbnail().is_some();
    let policy = pipeline.configuration.data_cache_policy;
    let policy_stores_encoded = matches!(
        policy,
        DataCachePolicy::Automatic
            | DataCachePolicy::StoreEncodedImages
            | DataCachePolicy::StoreAll
    );
    if is_processed_request
        && policy_stores_encoded
        && !options.contains(ImageRequestOptions::DISABLE_DISK_CACHE_READS)
        && request.cache_policy()
            != pictor_model::CachePolicy::ReloadIgnoringCacheData
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
        let Some(lookup) = lookup else { return };
        if let Some(data) = lookup {
            debug!(image_id = %request.image_id(), "processed image bytes found on disk");
            let context = ImageDecodingContext {
                request: request.clone(),
                data,
                is_completed: true,
                url_response: None,
                cache_type: Some(CacheType::Disk),
            };
            let decoded = match pipeline.decoder_for(&context) {
                Some(decoder) if decoder.is_asynchronous() => {
                    let queued_context = context.clone();
                    match run_on_queue(
                        &job,
                        &pipeline.image_decoding_queue,
                        false,
                        move || decoder.decode(&queued_context),
                    )
                    .await
                    {
                        None => return,
                        Some(result) => result.ok(),
                    }
                }
                Some(decoder) => decoder.decode(&context).ok(),
                None => None,
            };
            // A failed decode of cached bytes falls through to a fresh
            // load rather than failing the request.
            if let Some(container) = decoded {
                let response = ImageResponse {
                    container,
                    request: request.clone(),
                    url_response: None,
                    cache_type: Some(CacheType::Disk),
                };
                match finalize_response(
                    pipeline.clone(),
                    request.clone(),
                    job.clone(),
                    response,
                    true,
                )
                .await
                {
                    StageResult::Emit(response, _) => {
                        job.send_value(response, true)
                    }
                    StageResult::Fail(error) => job.send_error(error),
                    StageResult::Skip => {}
                }
                return;
            }
        }
    }

    // 3. Cache-only requests stop here.
    if options.contains(ImageRequestOptions::RETURN_CACHE_DATA_DONT_LOAD) {
        job.send_error(ImagePipelineError::DataMissingInCache);
        return;
    }

    // 4. Peel the last processor off and subscribe to the job one level
    //    down, so partially processed intermediates coalesce and hit
    //    caches mid-chain.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let meta = SubscriberMeta::Job(job.descriptor_provider());
    let processor: Option<Arc<dyn ImageProcessing>> =
        match request.processors().split_last() {
            Some((last, rest)) => {
                let sub_request =
                    request.clone().with_processors(rest.to_vec());
                let subscription = pipeline.subscribe_load_image(
                    &sub_request,
                    job.priority(),
                    meta,
                    events_tx,
                );
                job.set_dependency(Box::new(subscription));
                Some(last.clone())
            }
            None => {
                let subscription = pipeline.subscribe_fetch_image(
                    &request,
                    job.priority(),
                    meta,
                    events_tx,
                );
                job.set_dependency(Box::new(subscription));
                None
            }
        };

    drive(pipeline, request, job, processor, events_rx).await;
}

async fn drive(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    job: Arc<Job<ImageResponse>>,
    processor: Option<Arc<dyn ImageProcessing>>,
    mut events: mpsc::UnboundedReceiver<JobEvent<ImageResponse>>,
) {
    let mut in_flight: Option<BoxFuture<'static, StageResult>> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    JobEvent::Progress(progress) => {
                        job.send_progress(progress)
                    }
                    JobEvent::Error(error) => {
                        job.send_error(error);
                        break;
                    }
                    JobEvent::Value { value: response, is_completed } => {
                        if !is_completed && in_flight.is_some() {
                            // Same back-pressure rule as decoding: at
                            // most one stage in flight, drop the rest.
                            trace!("dropping progressive value, stage busy");
                            continue;
                        }
                        if is_completed && in_flight.take().is_some() {
                            job.cancel_current_operation();
                        }
                        in_flight = Some(Box::pin(process_response(
                            pipeline.clone(),
                            request.clone(),
                            job.clone(),
                            processor.clone(),
                            response,
                            is_completed,
                        )));
                    }
                }
            }
            stage = async {
                in_flight
                    .as_mut()
                    .expect("polled only while a stage is in flight")
                    .await
            }, if in_flight.is_some() => {
                in_flight = None;
                match stage {
                    StageResult::Emit(response, is_completed) => {
                        job.send_value(response, is_completed);
                        if is_completed {
                            break;
                        }
                    }
                    StageResult::Fail(error) => {
                        job.send_error(error);
                        break;
                    }
                    StageResult::Skip => {}
                }
            }
        }
    }
}

/// The per-value stage: apply the peeled processor, then decompress and
/// populate caches via [`finalize_response`].
async fn process_response(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    job: Arc<Job<ImageResponse>>,
    processor: Option<Arc<dyn ImageProcessing>>,
    mut response: ImageResponse,
    is_completed: bool,
) -> StageResult {
    if let Some(processor) = processor {
        let context = ProcessingContext {
            request: request.clone(),
            is_final: is_completed,
        };
        let container = response.container.clone();
        let queued_processor = processor.clone();
        let processed = run_on_queue(
            &job,
            &pipeline.image_processing_queue,
            false,
            move || queued_processor.process(container, &context),
        )
        .await;
        match processed {
            None => return StageResult::Skip,
            Some(Ok(container)) => response.container = container,
            Some(Err(error)) => {
                if is_completed {
                    return StageResult::Fail(
                        ImagePipelineError::processing(
                            processor.identifier(),
                            error,
                        ),
                    );
                }
                // Processor failures on previews are swallowed.
                return StageResult::Skip;
            }
        }
    }
    finalize_response(pipeline, request, job, response, is_completed).await
}

/// Decompression and cache population for a response about to be
/// emitted. Shared by the network path and the disk-cache hit path.
async fn finalize_response(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    job: Arc<Job<ImageResponse>>,
    mut response: ImageResponse,
    is_completed: bool,
) -> StageResult {
    response.request = request.clone();
    let has_direct_subscriber = job.has_direct_task_subscriber();

    let wants_decompression = pipeline.configuration.is_decompression_enabled
        && response.container.is_decompression_needed
        && !request
            .options()
            .contains(ImageRequestOptions::SKIP_DECOMPRESSION)
        && has_direct_subscriber
        && pipeline.delegate.should_decompress(&response);
    if wants_decompression {
        let delegate = pipeline.delegate.clone();
        let image = response.container.image.clone();
        let delegate_request = request.clone();
        let decompressed = run_on_queue(
            &job,
            &pipeline.image_decompressing_queue,
            false,
            move || delegate.decompress(image, &delegate_request),
        )
        .await;
        match decompressed {
            None => return StageResult::Skip,
            Some(image) => {
                response.container.image = image;
                response.container.is_decompression_needed = false;
            }
        }
    }

    if has_direct_subscriber {
        store_in_memory_cache(&pipeline, &request, &response);
        if is_completed {
            store_encoded_in_data_cache(&pipeline, &request, &job, &response)
                .await;
        }
    }

    StageResult::Emit(response, is_completed)
}

fn store_in_memory_cache(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    response: &ImageResponse,
) {
    if request
        .options()
        .contains(ImageRequestOptions::DISABLE_MEMORY_CACHE_WRITES)
    {
        return;
    }
    if response.cache_type == Some(CacheType::Memory) {
        return;
    }
    if response.container.is_preview
        && !pipeline.configuration.is_storing_previews_in_memory_cache
    {
        return;
    }
    let Some(cache) = pipeline.resolve_image_cache(request) else {
        return;
    };
    cache.set(
        MemoryCacheKey::for_request(request),
        response.container.clone(),
    );
}

/// The load-side half of the data-cache policy table. Previews and
/// responses that already came from disk never go back to disk.
async fn store_encoded_in_data_cache(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    job: &Arc<Job<ImageResponse>>,
    response: &ImageResponse,
) {
    if response.container.is_preview
        || response.cache_type == Some(CacheType::Disk)
    {
        return;
    }
    if request
        .options()
        .contains(ImageRequestOptions::DISABLE_DISK_CACHE_WRITES)
        || request.is_local_resource()
    {
        return;
    }
    let is_processed_request = !request.processors().is_empty()
        || request.thumbnail().is_some();
    let should_store = match pipeline.configuration.data_cache_policy {
        DataCachePolicy::StoreEncodedImages => true,
        DataCachePolicy::Automatic | DataCachePolicy::StoreAll => {
            is_processed_request
        }
        DataCachePolicy::StoreOriginalData => false,
    };
    if !should_store {
        return;
    }
    let Some(cache) = pipeline.resolve_data_cache(request) else {
        return;
    };

    let context = ImageEncodingContext {
        request: request.clone(),
        container: response.container.clone(),
    };
    let encoder = pipeline.encoder_for(&context);
    let encoded = run_on_queue(
        job,
        &pipeline.image_encoding_queue,
        false,
        move || encoder.encode(&context),
    )
    .await;
    let Some(Ok(data)) = encoded else {
        // Cancelled, or the encoder declined; either way nothing to
        // write.
        return;
    };
    let Some(payload) =
        pipeline
            .delegate
            .will_cache(data, Some(&response.container), request)
    else {
        return;
    };
    let key = pipeline.data_cache_key(request, true);
    debug!(image_id = %request.image_id(), bytes = payload.len(), "storing encoded image");
    let _ = run_on_queue(job, &pipeline.data_caching_queue, false, move || {
        cache.set(key, payload)
    })
    .await;
}
