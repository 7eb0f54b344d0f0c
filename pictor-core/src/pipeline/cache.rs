use std::sync::Arc;

use bytes::Bytes;

use super::PipelineInner;
use crate::container::ImageContainer;
use crate::keys::MemoryCacheKey;
use crate::request::ImageRequest;

/// Direct, request-keyed access to the pipeline's cache tiers.
///
/// Data-cache calls run on the caller's context rather than the
/// data-caching queue; they exist for warm-up, eviction, and tests, not
/// for the hot path the pipeline itself takes.
pub struct PipelineCache<'a> {
    pub(crate) pipeline: &'a Arc<PipelineInner>,
}

impl PipelineCache<'_> {
    pub fn cached_image(
        &self,
        request: &ImageRequest,
    ) -> Option<ImageContainer> {
        self.pipeline.cached_image(request)
    }

    pub fn store_cached_image(
        &self,
        request: &ImageRequest,
        container: ImageContainer,
    ) {
        if let Some(cache) = self.pipeline.resolve_image_cache(request) {
            cache.set(MemoryCacheKey::for_request(request), container);
        }
    }

    pub fn remove_cached_image(&self, request: &ImageRequest) {
        if let Some(cache) = self.pipeline.resolve_image_cache(request) {
            cache.remove(&MemoryCacheKey::for_request(request));
        }
    }

    pub fn contains_cached_image(&self, request: &ImageRequest) -> bool {
        self.pipeline
            .resolve_image_cache(request)
            .is_some_and(|cache| {
                cache.contains(&MemoryCacheKey::for_request(request))
            })
    }

    pub fn cached_data(&self, request: &ImageRequest) -> Option<Bytes> {
        let cache = self.pipeline.resolve_data_cache(request)?;
        cache.get(&self.data_cache_key(request))
    }

    pub fn store_cached_data(&self, request: &ImageRequest, data: Bytes) {
        if let Some(cache) = self.pipeline.resolve_data_cache(request) {
            cache.set(self.data_cache_key(request), data);
        }
    }

    pub fn remove_cached_data(&self, request: &ImageRequest) {
        if let Some(cache) = self.pipeline.resolve_data_cache(request) {
            cache.remove(&self.data_cache_key(request));
        }
    }

    pub fn contains_cached_data(&self, request: &ImageRequest) -> bool {
        self.pipeline
            .resolve_data_cache(request)
            .is_some_and(|cache| cache.contains(&self.data_cache_key(request)))
    }

    /// The memory-cache key the pipeline derives for this request.
    pub fn memory_cache_key(&self, request: &ImageRequest) -> MemoryCacheKey {
        MemoryCacheKey::for_request(request)
    }

    /// The data-cache key (full processor chain) for this request.
    pub fn data_cache_key(&self, request: &ImageRequest) -> String {
        self.pipeline.data_cache_key(request, true)
    }

    /// Drop any parked partial download for this request.
    pub fn remove_resumable_data(&self, request: &ImageRequest) {
        let image_id = request.image_id();
        self.pipeline
            .resumable_store()
            .remove_matching(self.pipeline.id, |candidate| {
                candidate == image_id
            });
    }

    /// Empty both tiers and this pipeline's parked partial downloads.
    pub fn remove_all(&self) {
        if let Some(cache) = &self.pipeline.configuration.image_cache {
            cache.remove_all();
        }
        if let Some(cache) = &self.pipeline.configuration.data_cache {
            cache.remove_all();
        }
        self.pipeline
            .resumable_store()
            .remove_matching(self.pipeline.id, |_| true);
    }
}
