//! The pipeline orchestrator: owns the queues, pools, caches, rate
//! limiter, and live tasks; hands out coalesced jobs per key.

mod cache;
mod config;
mod delegate;
pub(crate) mod jobs;

pub use cache::PipelineCache;
pub use config::{
    DataCachePolicy, ImageDecoderFactory, ImageEncoderFactory,
    ImagePipelineConfiguration,
};
pub use delegate::ImagePipelineDelegate;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use pictor_model::{Priority, UrlResponse};

use crate::cache::{DataCaching, ImageCaching};
use crate::codec::{
    ImageDecoding, ImageDecodingContext, ImageEncoding, ImageEncodingContext,
};
use crate::container::{ImageContainer, ImageResponse};
use crate::error::{ImagePipelineError, Result};
use crate::keys::{
    FetchOriginalDataKey, FetchOriginalImageKey, LoadImageKey,
    MemoryCacheKey,
};
use crate::loader::DataLoading;
use crate::request::{ImageRequest, ImageResource};
use crate::resumable::ResumableDataStore;
use crate::runtime::job::{
    EventSink, Job, JobSubscription, SubscriberMeta,
};
use crate::runtime::pool::TaskPool;
use crate::runtime::queue::WorkQueue;
use crate::runtime::rate_limiter::RateLimiter;
use crate::task::{ImageTask, TaskKind, TaskShared};
use delegate::DefaultPipelineDelegate;
use jobs::DataValue;

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// The image loading pipeline.
///
/// Cheap to clone via `Arc` internally; one instance is meant to serve
/// an entire application. See [`ImagePipelineConfiguration`] for the
/// knobs and [`ImagePipelineDelegate`] for per-request strategy.
pub struct ImagePipeline {
    inner: Arc<PipelineInner>,
}

pub(crate) struct PipelineInner {
    pub(crate) id: u64,
    pub(crate) configuration: ImagePipelineConfiguration,
    pub(crate) delegate: Arc<dyn ImagePipelineDelegate>,
    pub(crate) data_loading_queue: WorkQueue,
    pub(crate) data_caching_queue: WorkQueue,
    pub(crate) image_decoding_queue: WorkQueue,
    pub(crate) image_encoding_queue: WorkQueue,
    pub(crate) image_processing_queue: WorkQueue,
    pub(crate) image_decompressing_queue: WorkQueue,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    fetch_data_jobs: TaskPool<FetchOriginalDataKey, DataValue>,
    producer_jobs: TaskPool<String, DataValue>,
    fetch_image_jobs: TaskPool<FetchOriginalImageKey, ImageResponse>,
    load_image_jobs: TaskPool<LoadImageKey, ImageResponse>,
    load_data_jobs: TaskPool<LoadImageKey, ImageResponse>,
    pub(crate) tasks: DashMap<u64, Arc<TaskShared>>,
    invalidated: AtomicBool,
}

impl ImagePipeline {
    pub fn new(configuration: ImagePipelineConfiguration) -> Self {
        Self::with_delegate(configuration, Arc::new(DefaultPipelineDelegate))
    }

    pub fn with_delegate(
        configuration: ImagePipelineConfiguration,
        delegate: Arc<dyn ImagePipelineDelegate>,
    ) -> Self {
        let coalescing = configuration.is_task_coalescing_enabled;
        let inner = Arc::new(PipelineInner {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            data_loading_queue: WorkQueue::new(
                configuration.data_loading_concurrency,
            ),
            data_caching_queue: WorkQueue::new(
                configuration.data_caching_concurrency,
            ),
            image_decoding_queue: WorkQueue::new(
                configuration.image_decoding_concurrency,
            ),
            image_encoding_queue: WorkQueue::new(
                configuration.image_encoding_concurrency,
            ),
            image_processing_queue: WorkQueue::new(
                configuration.image_processing_concurrency,
            ),
            image_decompressing_queue: WorkQueue::new(
                configuration.image_decompressing_concurrency,
            ),
            rate_limiter: RateLimiter::with_defaults(),
            fetch_data_jobs: TaskPool::new(coalescing),
            producer_jobs: TaskPool::new(coalescing),
            fetch_image_jobs: TaskPool::new(coalescing),
            load_image_jobs: TaskPool::new(coalescing),
            load_data_jobs: TaskPool::new(coalescing),
            tasks: DashMap::new(),
            invalidated: AtomicBool::new(false),
            configuration,
            delegate,
        });
        ResumableDataStore::shared().register_pipeline();
        debug!(pipeline_id = inner.id, "image pipeline created");
        Self { inner }
    }

    pub fn configuration(&self) -> &ImagePipelineConfiguration {
        &self.inner.configuration
    }

    /// Start loading an image. The returned task is already running.
    pub fn image_task(&self, request: impl Into<ImageRequest>) -> ImageTask {
        self.inner.spawn_task(request.into(), TaskKind::Image)
    }

    /// Start loading raw bytes (no decoding, no processing).
    pub fn data_task(&self, request: impl Into<ImageRequest>) -> ImageTask {
        self.inner.spawn_task(request.into(), TaskKind::Data)
    }

    /// Load an image and wait for the final response.
    pub async fn image(
        &self,
        request: impl Into<ImageRequest>,
    ) -> Result<ImageResponse> {
        let mut task = self.image_task(request);
        task.response().await
    }

    /// Load an image from a URL string; parse failures surface as
    /// [`ImagePipelineError::ImageRequestMissing`].
    pub async fn image_from_url(&self, url: &str) -> Result<ImageResponse> {
        match ImageRequest::parse(url) {
            Ok(request) => self.image(request).await,
            Err(_) => Err(ImagePipelineError::ImageRequestMissing),
        }
    }

    /// Load raw bytes and wait for them.
    pub async fn data(
        &self,
        request: impl Into<ImageRequest>,
    ) -> Result<(Bytes, Option<UrlResponse>)> {
        let mut task = self.data_task(request);
        let response = task.response().await?;
        let data = response.container.data.clone().unwrap_or_default();
        Ok((data, response.url_response))
    }

    /// Direct access to the pipeline's caches, keyed per request.
    pub fn cache(&self) -> PipelineCache<'_> {
        PipelineCache { pipeline: &self.inner }
    }

    /// Tear the pipeline down: every outstanding task is cancelled and
    /// every subsequent subscription fails with `PipelineInvalidated`.
    pub fn invalidate(&self) {
        if self.inner.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pipeline_id = self.inner.id, "pipeline invalidated");
        let tasks: Vec<Arc<TaskShared>> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.tasks.clear();
        for task in tasks {
            task.cancel();
        }
    }
}

impl PipelineInner {
    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe_load_image(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: Priority,
        meta: SubscriberMeta,
        sink: EventSink<ImageResponse>,
    ) -> JobSubscription<ImageResponse> {
        if self.is_invalidated() {
            return invalidated_subscription(priority, meta, sink);
        }
        let pipeline = self.clone();
        let request_for_job = request.clone();
        self.load_image_jobs.subscribe(
            LoadImageKey::for_request(request),
            priority,
            meta,
            sink,
            move || jobs::load_image::starter(pipeline, request_for_job),
        )
    }

    pub(crate) fn subscribe_load_data(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: Priority,
        meta: SubscriberMeta,
        sink: EventSink<ImageResponse>,
    ) -> JobSubscription<ImageResponse> {
        if self.is_invalidated() {
            return invalidated_subscription(priority, meta, sink);
        }
        let pipeline = self.clone();
        let request_for_job = request.clone();
        self.load_data_jobs.subscribe(
            LoadImageKey::for_request(request),
            priority,
            meta,
            sink,
            move || jobs::load_data::starter(pipeline, request_for_job),
        )
    }

    pub(crate) fn subscribe_fetch_image(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: Priority,
        meta: SubscriberMeta,
        sink: EventSink<ImageResponse>,
    ) -> JobSubscription<ImageResponse> {
        if self.is_invalidated() {
            return invalidated_subscription(priority, meta, sink);
        }
        let pipeline = self.clone();
        let request_for_job = request.clone();
        self.fetch_image_jobs.subscribe(
            FetchOriginalImageKey::for_request(request),
            priority,
            meta,
            sink,
            move || {
                jobs::fetch_original_image::starter(pipeline, request_for_job)
            },
        )
    }

    /// Route a byte fetch to the transport job or the producer job.
    pub(crate) fn subscribe_original_data(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: Priority,
        meta: SubscriberMeta,
        sink: EventSink<DataValue>,
    ) -> JobSubscription<DataValue> {
        if self.is_invalidated() {
            return invalidated_subscription(priority, meta, sink);
        }
        let pipeline = self.clone();
        let request_for_job = request.clone();
        match request.resource() {
            ImageResource::Producer(producer) => {
                self.producer_jobs.subscribe(
                    producer.id().to_owned(),
                    priority,
                    meta,
                    sink,
                    move || {
                        jobs::fetch_with_producer::starter(
                            pipeline,
                            request_for_job,
                        )
                    },
                )
            }
            _ => self.fetch_data_jobs.subscribe(
                FetchOriginalDataKey::for_request(request),
                priority,
                meta,
                sink,
                move || {
                    jobs::fetch_original_data::starter(
                        pipeline,
                        request_for_job,
                    )
                },
            ),
        }
    }

    // Delegate-aware collaborator resolution.

    pub(crate) fn resolve_data_loader(
        &self,
        request: &ImageRequest,
    ) -> Arc<dyn DataLoading> {
        self.delegate
            .data_loader(request)
            .unwrap_or_else(|| self.configuration.data_loader.clone())
    }

    pub(crate) fn resolve_image_cache(
        &self,
        request: &ImageRequest,
    ) -> Option<Arc<dyn ImageCaching>> {
        self.delegate
            .image_cache(request)
            .or_else(|| self.configuration.image_cache.clone())
    }

    pub(crate) fn resolve_data_cache(
        &self,
        request: &ImageRequest,
    ) -> Option<Arc<dyn DataCaching>> {
        self.delegate
            .data_cache(request)
            .or_else(|| self.configuration.data_cache.clone())
    }

    pub(crate) fn decoder_for(
        &self,
        context: &ImageDecodingContext,
    ) -> Option<Arc<dyn ImageDecoding>> {
        self.delegate
            .image_decoder(context)
            .or_else(|| (self.configuration.make_image_decoder)(context))
    }

    pub(crate) fn encoder_for(
        &self,
        context: &ImageEncodingContext,
    ) -> Arc<dyn ImageEncoding> {
        self.delegate
            .image_encoder(context)
            .unwrap_or_else(|| (self.configuration.make_image_encoder)(context))
    }

    /// The data-cache key: delegate-resolved identity, thumbnail id, and
    /// (optionally) the processor identifiers.
    pub(crate) fn data_cache_key(
        &self,
        request: &ImageRequest,
        include_processors: bool,
    ) -> String {
        let base = self
            .delegate
            .cache_key(request)
            .unwrap_or_else(|| request.image_id());
        crate::keys::data_cache_key_with_base(
            base,
            request,
            include_processors,
        )
    }

    pub(crate) fn cached_image(
        &self,
        request: &ImageRequest,
    ) -> Option<ImageContainer> {
        let cache = self.resolve_image_cache(request)?;
        cache.get(&MemoryCacheKey::for_request(request))
    }

    pub(crate) fn resumable_store(&self) -> &'static ResumableDataStore {
        ResumableDataStore::shared()
    }
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        ResumableDataStore::shared().unregister_pipeline();
    }
}

/// A job that refuses work because the pipeline is gone.
fn invalidated_subscription<T: Clone + Send + 'static>(
    priority: Priority,
    meta: SubscriberMeta,
    sink: EventSink<T>,
) -> JobSubscription<T> {
    let job: Arc<Job<T>> = Job::new(Box::new(|job: Arc<Job<T>>| {
        job.send_error(ImagePipelineError::PipelineInvalidated);
    }));
    job.subscribe(priority, meta, sink)
        .expect("a fresh job accepts its first subscriber")
}
