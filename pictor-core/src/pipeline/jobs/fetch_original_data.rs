//! Fetch-original-data job: disk-cache consultation, rate limiting,
//! transport streaming with progress and resumption.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use pictor_model::{ImageRequestOptions, TaskProgress};

use super::{DataValue, run_async_on_queue, run_on_queue};
use crate::error::ImagePipelineError;
use crate::loader::load_local_resource;
use crate::pipeline::{DataCachePolicy, PipelineInner};
use crate::request::ImageRequest;
use crate::resumable::ResumableData;
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

    if pipeline.configuration.is_local_resources_support_enabled
        && request.is_local_resource()
        && let Some(url) = request.url().cloned()
    {
        let loaded = run_async_on_queue(
            &job,
            &pipeline.data_loading_queue,
            request
                .options()
                .contains(ImageRequestOptions::SKIP_DATA_LOADING_QUEUE),
            async move { load_local_resource(&url).await },
        )
        .await;
        match loaded {
            None => {}
            Some(Ok(data)) if data.is_empty() => {
                job.send_error(ImagePipelineError::DataIsEmpty)
            }
            Some(Ok(data)) => job.send_value((data, None), true),
            Some(Err(error)) => {
                job.send_error(ImagePipelineError::data_loading(error))
            }
        }
        return;
    }

    // Original bytes may already sit in the data cache.
    let policy = pipeline.configuration.data_cache_policy;
    let may_read_original = !request
        .options()
        .contains(ImageRequestOptions::DISABLE_DISK_CACHE_READS)
        && request.cache_policy()
            != pictor_model::CachePolicy::ReloadIgnoringCacheData
        && policy != DataCachePolicy::StoreEncodedImages;
    if may_read_original
        && let Some(cache) = pipeline.resolve_data_cache(&request)
    {
        let key = pipeline.data_cache_key(&request, false);
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
                debug!(image_id = %request.image_id(), "original data served from disk cache");
                job.send_value((data, None), true);
                return;
            }
            Some(None) => {}
        }
    }

    if pipeline.configuration.is_rate_limiter_enabled {
        let (admitted_tx, admitted_rx) = oneshot::channel();
        let gate_job = job.clone();
        pipeline.rate_limiter.execute(Box::new(move || {
            if gate_job.is_disposed() {
                return false;
            }
            admitted_tx.send(()).is_ok()
        }));
        if admitted_rx.await.is_err() {
            return;
        }
    }

    let bypass = request
        .options()
        .contains(ImageRequestOptions::SKIP_DATA_LOADING_QUEUE);
    let body = load_body(pipeline.clone(), request, job.clone());
    let operation = if bypass {
        pipeline
            .data_loading_queue
            .enqueue_bypassing(job.priority(), Box::pin(body))
    } else {
        pipeline.data_loading_queue.enqueue(job.priority(), Box::pin(body))
    };
    job.set_operation(operation);
}

struct DownloadState {
    buffer: BytesMut,
    response: Option<pictor_model::UrlResponse>,
    expected_total: u64,
}

/// Parks the partial download in the resumable store when the body ends
/// without completing, including by cancellation (the drop path).
struct ResumableSaveGuard {
    pipeline: Arc<PipelineInner>,
    image_id: String,
    download: Arc<Mutex<DownloadState>>,
    armed: bool,
}

impl ResumableSaveGuard {
    fn save(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let state = self.download.lock();
        let Some(response) = &state.response else {
            return;
        };
        let data = Bytes::copy_from_slice(&state.buffer);
        if let Some(record) = ResumableData::from_response(response, &data) {
            debug!(
                image_id = %self.image_id,
                bytes = data.len(),
                "parking partial download for resumption"
            );
            self.pipeline.resumable_store().store(
                self.pipeline.id,
                &self.image_id,
                record,
            );
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ResumableSaveGuard {
    fn drop(&mut self) {
        self.save();
    }
}

async fn load_body(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    job: Arc<Job<DataValue>>,
) {
    let Some(mut url_request) = request.url_request() else {
        job.send_error(ImagePipelineError::ImageRequestMissing);
        return;
    };
    let image_id = request.image_id();

    let mut resumable = if pipeline.configuration.is_resumable_data_enabled {
        pipeline.resumable_store().take(pipeline.id, &image_id)
    } else {
        None
    };
    if let Some(record) = &resumable {
        record.resume_request(&mut url_request);
    }

    let loader = pipeline.resolve_data_loader(&request);
    let mut stream = loader.load(&url_request);

    let download = Arc::new(Mutex::new(DownloadState {
        buffer: BytesMut::new(),
        response: None,
        expected_total: 0,
    }));
    let mut guard = ResumableSaveGuard {
        pipeline: pipeline.clone(),
        image_id: image_id.clone(),
        download: download.clone(),
        armed: pipeline.configuration.is_resumable_data_enabled,
    };

    let mut is_first_chunk = true;
    while let Some(item) = stream.next().await {
        match item {
            Err(error) => {
                guard.save();
                job.send_error(ImagePipelineError::data_loading(error));
                return;
            }
            Ok((chunk, response)) => {
                let (completed, total, partial) = {
                    let mut state = download.lock();
                    if is_first_chunk {
                        is_first_chunk = false;
                        if let Some(record) = resumable.take()
                            && ResumableData::is_resumed_response(&response)
                        {
                            debug!(
                                image_id = %image_id,
                                resumed_bytes = record.data.len(),
                                "server confirmed resumption"
                            );
                            state.buffer.extend_from_slice(&record.data);
                        }
                        let prefix = state.buffer.len() as u64;
                        state.expected_total = response
                            .expected_content_length
                            .map(|length| length + prefix)
                            .unwrap_or(0);
                        state.response = Some(response.clone());
                    }
                    state.buffer.extend_from_slice(&chunk);
                    let completed = state.buffer.len() as u64;
                    let total = state.expected_total;
                    let partial = (total > 0 && completed < total)
                        .then(|| Bytes::copy_from_slice(&state.buffer));
                    (completed, total, partial)
                };
                job.send_progress(TaskProgress::new(completed, total));
                if let Some(snapshot) = partial {
                    // Progressive consumers drop ticks they cannot keep
                    // up with; emitting every one is intentional.
                    job.send_value((snapshot, Some(response)), false);
                }
            }
        }
    }

    guard.disarm();
    let (data, response) = {
        let mut state = download.lock();
        let data = state.buffer.split().freeze();
        (data, state.response.take())
    };
    if data.is_empty() {
        job.send_error(ImagePipelineError::DataIsEmpty);
        return;
    }
    store_original_data_if_needed(&pipeline, &request, &job, &data).await;
    job.send_value((data, response), true);
}

/// The fetch-side half of the data-cache policy table: wire bytes are
/// stored here, encoded images by the load-image job.
async fn store_original_data_if_needed(
    pipeline: &Arc<PipelineInner>,
    request: &ImageRequest,
    job: &Arc<Job<DataValue>>,
    data: &Bytes,
) {
    if request
        .options()
        .contains(ImageRequestOptions::DISABLE_DISK_CACHE_WRITES)
        || request.is_local_resource()
    {
        return;
    }
    let Some(cache) = pipeline.resolve_data_cache(request) else {
        return;
    };
    let should_store = match pipeline.configuration.data_cache_policy {
        DataCachePolicy::StoreOriginalData | DataCachePolicy::StoreAll => {
            true
        }
        DataCachePolicy::StoreEncodedImages => false,
        DataCachePolicy::Automatic => job
            .task_descriptors()
            .iter()
            .any(|task| !task.has_processors && !task.has_thumbnail),
    };
    if !should_store {
        return;
    }
    let Some(payload) =
        pipeline.delegate.will_cache(data.clone(), None, request)
    else {
        return;
    };
    let key = pipeline.data_cache_key(request, false);
    debug!(image_id = %request.image_id(), bytes = payload.len(), "storing original data");
    let _ = run_on_queue(job, &pipeline.data_caching_queue, false, move || {
        cache.set(key, payload)
    })
    .await;
}
