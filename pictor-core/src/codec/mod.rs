//! Decoder and encoder seams plus the default `image`-backed codec.

mod default;
mod jpeg;

pub use default::{DefaultImageDecoder, DefaultImageEncoder};

use bytes::Bytes;

use pictor_model::UrlResponse;

use crate::container::{CacheType, ImageContainer};
use crate::request::ImageRequest;

/// Everything a decoder gets to look at.
#[derive(Debug, Clone)]
pub struct ImageDecodingContext {
    pub request: ImageRequest,
    pub data: Bytes,
    /// `false` while more bytes are expected (progressive decoding).
    pub is_completed: bool,
    pub url_response: Option<UrlResponse>,
    /// Set when the bytes came out of the data cache.
    pub cache_type: Option<CacheType>,
}

/// Turns encoded bytes into an [`ImageContainer`].
///
/// One decoder instance serves one job, so implementations may keep
/// per-stream state (scan counters, emitted-preview flags) internally.
pub trait ImageDecoding: Send + Sync {
    /// Decode the final data. Failures surface as `DecodingFailed`.
    fn decode(
        &self,
        context: &ImageDecodingContext,
    ) -> anyhow::Result<ImageContainer>;

    /// Decode a partial prefix into a preview, or `None` to wait for
    /// more data. Errors on partial data are swallowed by the caller.
    fn decode_partially(
        &self,
        _context: &ImageDecodingContext,
    ) -> Option<ImageContainer> {
        None
    }

    /// Asynchronous decoders run on the image-decoding queue; synchronous
    /// ones run inline in the job driver.
    fn is_asynchronous(&self) -> bool {
        false
    }
}

/// Everything an encoder gets to look at.
#[derive(Debug, Clone)]
pub struct ImageEncodingContext {
    pub request: ImageRequest,
    pub container: ImageContainer,
}

/// Turns an [`ImageContainer`] back into bytes for the data cache.
pub trait ImageEncoding: Send + Sync {
    fn encode(
        &self,
        context: &ImageEncodingContext,
    ) -> anyhow::Result<Bytes>;
}
