//! Named image transformations applied after decoding.

use std::fmt;
use std::sync::Arc;

use image::imageops::FilterType;

use crate::container::{Image, ImageContainer};
use crate::request::ImageRequest;

/// Context handed to a processor alongside the container.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub request: ImageRequest,
    /// `false` while the container is a progressive preview.
    pub is_final: bool,
}

/// A named transformation from container to container.
///
/// The identifier must be stable and must change whenever the output
/// would: it participates in every processed-image cache key.
pub trait ImageProcessing: Send + Sync {
    fn identifier(&self) -> String;

    fn process(
        &self,
        container: ImageContainer,
        context: &ProcessingContext,
    ) -> anyhow::Result<ImageContainer>;
}

impl fmt::Debug for dyn ImageProcessing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageProcessing({})", self.identifier())
    }
}

/// Scale the image down to fit within a bounding box, preserving aspect
/// ratio. Images already inside the box pass through untouched.
#[derive(Debug, Clone, Copy)]
pub struct Resize {
    width: u32,
    height: u32,
}

impl Resize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl ImageProcessing for Resize {
    fn identifier(&self) -> String {
        format!("resize?w={}&h={}", self.width, self.height)
    }

    fn process(
        &self,
        container: ImageContainer,
        _context: &ProcessingContext,
    ) -> anyhow::Result<ImageContainer> {
        let image = container.image.as_dynamic();
        if image.width() <= self.width && image.height() <= self.height {
            return Ok(container);
        }
        let resized =
            image.resize(self.width, self.height, FilterType::Triangle);
        Ok(container.map(Image::from_dynamic(resized)))
    }
}

/// A processor built from a closure, for one-off transformations.
#[derive(Clone)]
pub struct Custom {
    id: String,
    apply: Arc<
        dyn Fn(ImageContainer) -> anyhow::Result<ImageContainer>
            + Send
            + Sync,
    >,
}

impl Custom {
    pub fn new<F>(id: impl Into<String>, apply: F) -> Self
    where
        F: Fn(ImageContainer) -> anyhow::Result<ImageContainer>
            + Send
            + Sync
            + 'static,
    {
        Self { id: id.into(), apply: Arc::new(apply) }
    }
}

impl ImageProcessing for Custom {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    fn process(
        &self,
        container: ImageContainer,
        _context: &ProcessingContext,
    ) -> anyhow::Result<ImageContainer> {
        (self.apply)(container)
    }
}
