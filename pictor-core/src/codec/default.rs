use bytes::Bytes;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::DynamicImage;
use parking_lot::Mutex;
use tracing::trace;

use pictor_model::ImageType;

use super::jpeg::ProgressiveJpegScanner;
use super::{
    ImageDecoding, ImageDecodingContext, ImageEncoding, ImageEncodingContext,
};
use crate::container::{Image, ImageContainer};

const JPEG_QUALITY: u8 = 80;

/// Decoder for the formats the `image` crate handles natively.
///
/// Progressive behavior per format: JPEG previews are decoded from the
/// prefix ending at the last complete start-of-scan marker; GIFs emit a
/// single first-frame preview as soon as one decodes; everything else
/// waits for the final pass.
pub struct DefaultImageDecoder {
    progressive: Mutex<ProgressiveState>,
}

#[derive(Default)]
struct ProgressiveState {
    scanner: ProgressiveJpegScanner,
    decoded_scan_count: usize,
    gif_preview_emitted: bool,
}

impl DefaultImageDecoder {
    pub fn new() -> Self {
        Self { progressive: Mutex::new(ProgressiveState::default()) }
    }

    /// Claim the context, or decline when the byte prefix matches no
    /// known format.
    pub fn for_context(
        context: &ImageDecodingContext,
    ) -> Option<DefaultImageDecoder> {
        ImageType::from_bytes(&context.data).map(|_| DefaultImageDecoder::new())
    }

    fn decode_data(
        &self,
        data: &[u8],
        context: &ImageDecodingContext,
        is_preview: bool,
    ) -> anyhow::Result<ImageContainer> {
        let image_type = ImageType::from_bytes(data);
        let decoded = image::load_from_memory(data)?;
        let decoded = match context.request.thumbnail() {
            Some(thumbnail) => decoded
                .thumbnail(thumbnail.max_pixel_size, thumbnail.max_pixel_size),
            None => decoded,
        };
        let mut container = ImageContainer::new(Image::from_dynamic(decoded));
        container.image_type = image_type;
        container.is_preview = is_preview;
        container.is_decompression_needed = true;
        if image_type == Some(ImageType::Gif) && !is_preview {
            // Keep the wire bytes so consumers can replay the animation.
            container.data = Some(Bytes::copy_from_slice(data));
        }
        Ok(container)
    }
}

impl Default for DefaultImageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageDecoding for DefaultImageDecoder {
    fn decode(
        &self,
        context: &ImageDecodingContext,
    ) -> anyhow::Result<ImageContainer> {
        self.decode_data(&context.data, context, false)
    }

    fn decode_partially(
        &self,
        context: &ImageDecodingContext,
    ) -> Option<ImageContainer> {
        match ImageType::from_bytes(&context.data)? {
            ImageType::Jpeg => {
                let (offset, scans) = {
                    let mut state = self.progressive.lock();
                    let offset = state.scanner.scan(&context.data)?;
                    let scans = state.scanner.number_of_scans();
                    if scans <= state.decoded_scan_count {
                        return None;
                    }
                    state.decoded_scan_count = scans;
                    (offset, scans)
                };
                trace!(scans, offset, "decoding progressive jpeg preview");
                self.decode_data(&context.data[..offset], context, true).ok()
            }
            ImageType::Gif => {
                if self.progressive.lock().gif_preview_emitted {
                    return None;
                }
                let preview =
                    self.decode_data(&context.data, context, true).ok()?;
                self.progressive.lock().gif_preview_emitted = true;
                Some(preview)
            }
            _ => None,
        }
    }

    fn is_asynchronous(&self) -> bool {
        true
    }
}

/// Encoder for data-cache writes: PNG stays PNG, everything else is
/// re-encoded as RGB JPEG.
pub struct DefaultImageEncoder;

impl DefaultImageEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefaultImageEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageEncoding for DefaultImageEncoder {
    fn encode(
        &self,
        context: &ImageEncodingContext,
    ) -> anyhow::Result<Bytes> {
        let container = &context.container;
        let mut buffer = Vec::new();
        match container.image_type {
            Some(ImageType::Png) => {
                container
                    .image
                    .as_dynamic()
                    .write_with_encoder(PngEncoder::new(&mut buffer))?;
            }
            _ => {
                let rgb = DynamicImage::ImageRgb8(
                    container.image.as_dynamic().to_rgb8(),
                );
                rgb.write_with_encoder(JpegEncoder::new_with_quality(
                    &mut buffer,
                    JPEG_QUALITY,
                ))?;
            }
        }
        Ok(Bytes::from(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultImageDecoder, DefaultImageEncoder};
    use crate::codec::{
        ImageDecoding, ImageDecodingContext, ImageEncoding,
        ImageEncodingContext,
    };
    use crate::request::{ImageRequest, ThumbnailOptions};
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use pictor_model::ImageType;
    use url::Url;

    fn png_bytes(width: u32, height: u32) -> bytes::Bytes {
        let image = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut cursor = std::io::Cursor::new(Vec::new());
        image.write_to(&mut cursor, ImageFormat::Png).unwrap();
        bytes::Bytes::from(cursor.into_inner())
    }

    fn context(data: bytes::Bytes, is_completed: bool) -> ImageDecodingContext {
        ImageDecodingContext {
            request: ImageRequest::new(
                Url::parse("https://a/x.png").unwrap(),
            ),
            data,
            is_completed,
            url_response: None,
            cache_type: None,
        }
    }

    #[test]
    fn decodes_png_bytes() {
        let decoder = DefaultImageDecoder::new();
        let container =
            decoder.decode(&context(png_bytes(6, 3), true)).unwrap();
        assert_eq!(container.image.width(), 6);
        assert_eq!(container.image_type, Some(ImageType::Png));
        assert!(container.is_decompression_needed);
        assert!(!container.is_preview);
    }

    #[test]
    fn thumbnail_request_downscales_at_decode() {
        let decoder = DefaultImageDecoder::new();
        let mut ctx = context(png_bytes(64, 32), true);
        ctx.request = ctx.request.clone().with_thumbnail(
            ThumbnailOptions::new(16),
        );
        let container = decoder.decode(&ctx).unwrap();
        assert_eq!(container.image.width(), 16);
        assert_eq!(container.image.height(), 8);
    }

    #[test]
    fn declines_unknown_prefixes() {
        let ctx = context(bytes::Bytes::from_static(b"not an image"), true);
        assert!(DefaultImageDecoder::for_context(&ctx).is_none());
    }

    #[test]
    fn partial_png_yields_no_preview() {
        let decoder = DefaultImageDecoder::new();
        let data = png_bytes(6, 3);
        let prefix = data.slice(..data.len() / 2);
        assert!(decoder.decode_partially(&context(prefix, false)).is_none());
    }

    #[test]
    fn encoder_round_trips_png() {
        let decoder = DefaultImageDecoder::new();
        let container =
            decoder.decode(&context(png_bytes(5, 5), true)).unwrap();
        let encoder = DefaultImageEncoder::new();
        let encoded = encoder
            .encode(&ImageEncodingContext {
                request: ImageRequest::new(
                    Url::parse("https://a/x.png").unwrap(),
                ),
                container,
            })
            .unwrap();
        assert_eq!(ImageType::from_bytes(&encoded), Some(ImageType::Png));
    }

    #[test]
    fn encoder_converts_other_formats_to_jpeg() {
        let decoder = DefaultImageDecoder::new();
        let mut container =
            decoder.decode(&context(png_bytes(5, 5), true)).unwrap();
        container.image_type = Some(ImageType::Webp);
        let encoder = DefaultImageEncoder::new();
        let encoded = encoder
            .encode(&ImageEncodingContext {
                request: ImageRequest::new(
                    Url::parse("https://a/x.webp").unwrap(),
                ),
                container,
            })
            .unwrap();
        assert_eq!(ImageType::from_bytes(&encoded), Some(ImageType::Jpeg));
    }
}
