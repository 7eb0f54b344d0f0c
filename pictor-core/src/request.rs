use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use url::Url;

use pictor_model::{ImageRequestOptions, Priority, UrlRequest};

use crate::processing::ImageProcessing;

/// What to load and how.
///
/// `ImageRequest` is an immutable value; the `with_*` helpers clone and
/// mutate. Requests for the same image that differ only in priority or
/// options still coalesce at the data-fetch level, while the processed
/// image is keyed on the full request (see `keys`).
#[derive(Clone)]
pub struct ImageRequest {
    resource: ImageResource,
    processors: Vec<Arc<dyn ImageProcessing>>,
    priority: Priority,
    options: ImageRequestOptions,
    thumbnail: Option<ThumbnailOptions>,
    scale: Option<f32>,
    image_id_override: Option<String>,
    user_info: HashMap<String, serde_json::Value>,
}

/// The byte source of a request.
#[derive(Clone)]
pub enum ImageResource {
    Url(Url),
    UrlRequest(UrlRequest),
    Producer(DataProducer),
}

/// A caller-supplied asynchronous byte source.
///
/// The identifier stands in for the URL in every derived cache key, so it
/// must be stable across invocations for caching to work.
#[derive(Clone)]
pub struct DataProducer {
    id: String,
    produce: Arc<
        dyn Fn() -> BoxFuture<'static, anyhow::Result<Bytes>> + Send + Sync,
    >,
}

impl DataProducer {
    pub fn new<F, Fut>(id: impl Into<String>, produce: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        Self {
            id: id.into(),
            produce: Arc::new(
                move || -> BoxFuture<'static, anyhow::Result<Bytes>> {
                    Box::pin(produce())
                },
            ),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn produce(&self) -> BoxFuture<'static, anyhow::Result<Bytes>> {
        (self.produce)()
    }
}

impl fmt::Debug for DataProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataProducer").field("id", &self.id).finish()
    }
}

impl fmt::Debug for ImageResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageResource::Url(url) => {
                f.debug_tuple("Url").field(url).finish()
            }
            ImageResource::UrlRequest(request) => {
                f.debug_tuple("UrlRequest").field(&request.url).finish()
            }
            ImageResource::Producer(producer) => {
                f.debug_tuple("Producer").field(&producer.id).finish()
            }
        }
    }
}

/// Instruction to decode a downscaled thumbnail instead of the full image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThumbnailOptions {
    /// The longest side of the produced thumbnail, in pixels.
    pub max_pixel_size: u32,
}

impl ThumbnailOptions {
    pub fn new(max_pixel_size: u32) -> Self {
        Self { max_pixel_size }
    }

    /// Stable identifier mixed into cache keys.
    pub fn identifier(&self) -> String {
        format!("thumbnail?max_pixel_size={}", self.max_pixel_size)
    }
}

impl ImageRequest {
    pub fn new(url: Url) -> Self {
        Self::with_resource(ImageResource::Url(url))
    }

    pub fn with_url_request(request: UrlRequest) -> Self {
        Self::with_resource(ImageResource::UrlRequest(request))
    }

    pub fn with_producer(producer: DataProducer) -> Self {
        Self::with_resource(ImageResource::Producer(producer))
    }

    fn with_resource(resource: ImageResource) -> Self {
        Self {
            resource,
            processors: Vec::new(),
            priority: Priority::default(),
            options: ImageRequestOptions::default(),
            thumbnail: None,
            scale: None,
            image_id_override: None,
            user_info: HashMap::new(),
        }
    }

    /// Parse a URL string into a request.
    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn resource(&self) -> &ImageResource {
        &self.resource
    }

    pub fn url(&self) -> Option<&Url> {
        match &self.resource {
            ImageResource::Url(url) => Some(url),
            ImageResource::UrlRequest(request) => Some(&request.url),
            ImageResource::Producer(_) => None,
        }
    }

    /// The identifier all cache and coalescing keys derive from.
    pub fn image_id(&self) -> String {
        if let Some(id) = &self.image_id_override {
            return id.clone();
        }
        match &self.resource {
            ImageResource::Url(url) => url.as_str().to_owned(),
            ImageResource::UrlRequest(request) => {
                request.url.as_str().to_owned()
            }
            ImageResource::Producer(producer) => producer.id.clone(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn options(&self) -> ImageRequestOptions {
        self.options
    }

    pub fn processors(&self) -> &[Arc<dyn ImageProcessing>] {
        &self.processors
    }

    pub fn thumbnail(&self) -> Option<ThumbnailOptions> {
        self.thumbnail
    }

    pub fn scale(&self) -> Option<f32> {
        self.scale
    }

    pub fn user_info(&self) -> &HashMap<String, serde_json::Value> {
        &self.user_info
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: ImageRequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_processors(
        mut self,
        processors: Vec<Arc<dyn ImageProcessing>>,
    ) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: ThumbnailOptions) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Override the identifier used for caching and coalescing, e.g. to
    /// strip volatile query parameters from a signed URL.
    pub fn with_image_id(mut self, id: impl Into<String>) -> Self {
        self.image_id_override = Some(id.into());
        self
    }

    pub fn with_user_info(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.user_info.insert(key.into(), value);
        self
    }

    /// The outgoing transport request, `None` for producer resources.
    pub(crate) fn url_request(&self) -> Option<UrlRequest> {
        match &self.resource {
            ImageResource::Url(url) => Some(UrlRequest::new(url.clone())),
            ImageResource::UrlRequest(request) => Some(request.clone()),
            ImageResource::Producer(_) => None,
        }
    }

    /// The transport cache policy carried by the resource.
    pub(crate) fn cache_policy(&self) -> pictor_model::CachePolicy {
        match &self.resource {
            ImageResource::UrlRequest(request) => request.cache_policy,
            _ => pictor_model::CachePolicy::default(),
        }
    }

    /// Whether the resource resolves without a network round trip.
    pub(crate) fn is_local_resource(&self) -> bool {
        match self.url() {
            Some(url) => matches!(url.scheme(), "file" | "data"),
            None => false,
        }
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("resource", &self.resource)
            .field(
                "processors",
                &self
                    .processors
                    .iter()
                    .map(|processor| processor.identifier())
                    .collect::<Vec<_>>(),
            )
            .field("priority", &self.priority)
            .field("options", &self.options)
            .field("thumbnail", &self.thumbnail)
            .field("scale", &self.scale)
            .finish_non_exhaustive()
    }
}

impl From<Url> for ImageRequest {
    fn from(url: Url) -> Self {
        ImageRequest::new(url)
    }
}

impl From<UrlRequest> for ImageRequest {
    fn from(request: UrlRequest) -> Self {
        ImageRequest::with_url_request(request)
    }
}
