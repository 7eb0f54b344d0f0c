use std::fmt;
use std::sync::Arc;

use crate::cache::{DataCaching, ImageCaching, MemoryCache};
use crate::codec::{
    DefaultImageDecoder, DefaultImageEncoder, ImageDecoding,
    ImageDecodingContext, ImageEncoding, ImageEncodingContext,
};
use crate::loader::{DataLoading, ReqwestDataLoader};

/// Which bytes the pipeline persists into the data cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataCachePolicy {
    /// Processed requests store the final encoded image; unprocessed
    /// requests store the wire bytes.
    Automatic,
    /// Store the wire bytes only.
    #[default]
    StoreOriginalData,
    /// Store the final encoded image only.
    StoreEncodedImages,
    /// Store the wire bytes, plus the encoded image when the request has
    /// processors or a thumbnail.
    StoreAll,
}

/// Selects a decoder for a byte stream, or declines it.
pub type ImageDecoderFactory = Arc<
    dyn Fn(&ImageDecodingContext) -> Option<Arc<dyn ImageDecoding>>
        + Send
        + Sync,
>;

/// Selects an encoder for a container.
pub type ImageEncoderFactory =
    Arc<dyn Fn(&ImageEncodingContext) -> Arc<dyn ImageEncoding> + Send + Sync>;

/// Everything an [`crate::ImagePipeline`] is built from.
///
/// Plain fields plus `Default`: construct one, override what you need,
/// hand it to the pipeline. The configuration is immutable once the
/// pipeline exists.
#[derive(Clone)]
pub struct ImagePipelineConfiguration {
    pub data_loader: Arc<dyn DataLoading>,
    pub data_cache: Option<Arc<dyn DataCaching>>,
    pub image_cache: Option<Arc<dyn ImageCaching>>,
    pub make_image_decoder: ImageDecoderFactory,
    pub make_image_encoder: ImageEncoderFactory,
    pub data_cache_policy: DataCachePolicy,
    /// Decompress decoded bitmaps off the UI path. Defaults to on, except
    /// on desktop where the renderer tolerates lazy bitmaps.
    pub is_decompression_enabled: bool,
    pub is_task_coalescing_enabled: bool,
    pub is_rate_limiter_enabled: bool,
    pub is_progressive_decoding_enabled: bool,
    pub is_storing_previews_in_memory_cache: bool,
    pub is_resumable_data_enabled: bool,
    /// Serve `file://` and `data:` URLs without a transport.
    pub is_local_resources_support_enabled: bool,
    pub data_loading_concurrency: usize,
    pub data_caching_concurrency: usize,
    pub image_decoding_concurrency: usize,
    pub image_encoding_concurrency: usize,
    pub image_processing_concurrency: usize,
    pub image_decompressing_concurrency: usize,
}

impl Default for ImagePipelineConfiguration {
    fn default() -> Self {
        Self {
            data_loader: Arc::new(ReqwestDataLoader::new()),
            data_cache: None,
            image_cache: Some(Arc::new(MemoryCache::default())),
            make_image_decoder: Arc::new(|context| {
                DefaultImageDecoder::for_context(context)
                    .map(|decoder| Arc::new(decoder) as Arc<dyn ImageDecoding>)
            }),
            make_image_encoder: Arc::new(|_context| {
                Arc::new(DefaultImageEncoder::new()) as Arc<dyn ImageEncoding>
            }),
            data_cache_policy: DataCachePolicy::default(),
            is_decompression_enabled: !cfg!(target_os = "macos"),
            is_task_coalescing_enabled: true,
            is_rate_limiter_enabled: true,
            is_progressive_decoding_enabled: false,
            is_storing_previews_in_memory_cache: true,
            is_resumable_data_enabled: true,
            is_local_resources_support_enabled: false,
            data_loading_concurrency: 6,
            data_caching_concurrency: 2,
            image_decoding_concurrency: 1,
            image_encoding_concurrency: 1,
            image_processing_concurrency: 2,
            image_decompressing_concurrency: 2,
        }
    }
}

impl fmt::Debug for ImagePipelineConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePipelineConfiguration")
            .field("data_cache_policy", &self.data_cache_policy)
            .field("has_data_cache", &self.data_cache.is_some())
            .field("has_image_cache", &self.image_cache.is_some())
            .field(
                "is_decompression_enabled",
                &self.is_decompression_enabled,
            )
            .field(
                "is_task_coalescing_enabled",
                &self.is_task_coalescing_enabled,
            )
            .field("is_rate_limiter_enabled", &self.is_rate_limiter_enabled)
            .field(
                "is_progressive_decoding_enabled",
                &self.is_progressive_decoding_enabled,
            )
            .field(
                "is_resumable_data_enabled",
                &self.is_resumable_data_enabled,
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{DataCachePolicy, ImagePipelineConfiguration};

    #[test]
    fn defaults_match_the_documented_profile() {
        let config = ImagePipelineConfiguration::default();
        assert_eq!(config.data_cache_policy, DataCachePolicy::StoreOriginalData);
        assert!(config.is_task_coalescing_enabled);
        assert!(config.is_rate_limiter_enabled);
        assert!(!config.is_progressive_decoding_enabled);
        assert!(config.is_storing_previews_in_memory_cache);
        assert!(config.is_resumable_data_enabled);
        assert_eq!(config.data_loading_concurrency, 6);
        assert_eq!(config.data_caching_concurrency, 2);
        assert_eq!(config.image_decoding_concurrency, 1);
        assert_eq!(config.image_encoding_concurrency, 1);
        assert_eq!(config.image_processing_concurrency, 2);
        assert_eq!(config.image_decompressing_concurrency, 2);
    }
}
