use std::sync::Arc;

use bytes::Bytes;

use pictor_model::TaskProgress;

use crate::cache::{DataCaching, ImageCaching};
use crate::codec::{
    ImageDecoding, ImageDecodingContext, ImageEncoding, ImageEncodingContext,
};
use crate::container::{Image, ImageContainer, ImageResponse};
use crate::error::Result;
use crate::loader::DataLoading;
use crate::request::ImageRequest;

/// Per-request strategy hooks.
///
/// Every method has a default: returning `None` from a resolver falls
/// back to the pipeline configuration. Hooks are invoked from job
/// drivers and must not block.
pub trait ImagePipelineDelegate: Send + Sync {
    /// Override the transport for this request.
    fn data_loader(
        &self,
        _request: &ImageRequest,
    ) -> Option<Arc<dyn DataLoading>> {
        None
    }

    /// Override the memory cache for this request.
    fn image_cache(
        &self,
        _request: &ImageRequest,
    ) -> Option<Arc<dyn ImageCaching>> {
        None
    }

    /// Override the data cache for this request.
    fn data_cache(
        &self,
        _request: &ImageRequest,
    ) -> Option<Arc<dyn DataCaching>> {
        None
    }

    /// Override decoder selection for this byte stream.
    fn image_decoder(
        &self,
        _context: &ImageDecodingContext,
    ) -> Option<Arc<dyn ImageDecoding>> {
        None
    }

    /// Override encoder selection for this container.
    fn image_encoder(
        &self,
        _context: &ImageEncodingContext,
    ) -> Option<Arc<dyn ImageEncoding>> {
        None
    }

    /// Replace the identity portion of the derived data-cache key, e.g.
    /// to strip volatile query parameters.
    fn cache_key(&self, _request: &ImageRequest) -> Option<String> {
        None
    }

    /// Filter or substitute bytes before a data-cache write. Returning
    /// `None` suppresses the write.
    fn will_cache(
        &self,
        data: Bytes,
        _image: Option<&ImageContainer>,
        _request: &ImageRequest,
    ) -> Option<Bytes> {
        Some(data)
    }

    /// Veto the decompression pass for a response.
    fn should_decompress(&self, _response: &ImageResponse) -> bool {
        true
    }

    /// Perform the decompression pass. Runs on the image-decompressing
    /// queue.
    fn decompress(&self, image: Image, _request: &ImageRequest) -> Image {
        image.decompressed()
    }

    fn image_task_did_start(&self, _request: &ImageRequest) {}

    fn image_task_did_update_progress(
        &self,
        _request: &ImageRequest,
        _progress: TaskProgress,
    ) {
    }

    fn image_task_did_complete(
        &self,
        _request: &ImageRequest,
        _result: &Result<ImageResponse>,
    ) {
    }

    fn image_task_did_cancel(&self, _request: &ImageRequest) {}
}

/// The delegate used when the caller does not provide one.
pub(crate) struct DefaultPipelineDelegate;

impl ImagePipelineDelegate for DefaultPipelineDelegate {}
