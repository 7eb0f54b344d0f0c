use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, RgbaImage};

use pictor_model::{ImageType, UrlResponse};

use crate::request::ImageRequest;

/// A decoded bitmap, cheap to clone and share across subscribers.
#[derive(Clone)]
pub struct Image {
    pixels: Arc<DynamicImage>,
}

impl Image {
    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self { pixels: Arc::new(image) }
    }

    /// Zero-sized placeholder used by bytes-only responses.
    pub fn empty() -> Self {
        Self::from_dynamic(DynamicImage::ImageRgba8(RgbaImage::new(0, 0)))
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.pixels
    }

    /// Materialize the bitmap into a flat RGBA8 buffer.
    ///
    /// This is the default decompression step: it forces any lazily
    /// represented pixel layout into the form renderers consume directly,
    /// off the UI path.
    pub fn decompressed(&self) -> Image {
        match self.pixels.as_ref() {
            DynamicImage::ImageRgba8(_) => self.clone(),
            other => Image::from_dynamic(DynamicImage::ImageRgba8(
                other.to_rgba8(),
            )),
        }
    }

    /// Approximate in-memory footprint, used as the cache cost.
    pub fn cost(&self) -> usize {
        (self.width() as usize * self.height() as usize * 4).max(1)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// A decoded image plus everything the pipeline knows about it.
#[derive(Debug, Clone)]
pub struct ImageContainer {
    pub image: Image,
    pub image_type: Option<ImageType>,
    /// Whether this is a partial result (progressive scan, GIF first
    /// frame) rather than the final image.
    pub is_preview: bool,
    /// Set by decoders whose output still needs the decompression pass.
    pub is_decompression_needed: bool,
    /// The original encoded bytes, kept when re-encoding would lose
    /// information (animated GIFs and the like).
    pub data: Option<Bytes>,
    pub user_info: HashMap<String, serde_json::Value>,
}

impl ImageContainer {
    pub fn new(image: Image) -> Self {
        Self {
            image,
            image_type: None,
            is_preview: false,
            is_decompression_needed: false,
            data: None,
            user_info: HashMap::new(),
        }
    }

    /// Replace the bitmap, keeping the metadata.
    pub fn map(&self, image: Image) -> Self {
        let mut container = self.clone();
        container.image = image;
        container
    }
}

/// Where a response was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Memory,
    Disk,
}

/// The final product of an image task.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub container: ImageContainer,
    /// The request that produced this response.
    pub request: ImageRequest,
    pub url_response: Option<UrlResponse>,
    /// `None` when the image came from the network.
    pub cache_type: Option<CacheType>,
}

impl ImageResponse {
    pub fn image(&self) -> &Image {
        &self.container.image
    }
}

#[cfg(test)]
mod tests {
    use super::{Image, ImageContainer};
    use image::DynamicImage;

    #[test]
    fn empty_placeholder_has_no_pixels() {
        let image = Image::empty();
        assert!(image.is_empty());
        assert_eq!(image.cost(), 1);
    }

    #[test]
    fn decompression_materializes_rgba() {
        let source = DynamicImage::ImageLuma8(image::GrayImage::new(4, 2));
        let image = Image::from_dynamic(source);
        let flat = image.decompressed();
        assert!(matches!(
            flat.as_dynamic(),
            DynamicImage::ImageRgba8(_)
        ));
        assert_eq!(flat.width(), 4);
        assert_eq!(flat.height(), 2);
    }

    #[test]
    fn map_replaces_bitmap_only() {
        let mut container = ImageContainer::new(Image::empty());
        container.is_preview = true;
        let mapped = container.map(Image::from_dynamic(
            DynamicImage::ImageRgba8(image::RgbaImage::new(1, 1)),
        ));
        assert!(mapped.is_preview);
        assert_eq!(mapped.image.width(), 1);
    }
}
