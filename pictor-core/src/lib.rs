//! A coalescing, priority-aware image loading pipeline.
//!
//! A request travels `ImageTask → load-image → (processor peel) →
//! fetch-original-image → fetch-original-data → transport`, with every
//! hop coalesced by key, prioritized by subscriber maximum, and backed
//! by a memory cache for decoded images plus an opaque data cache for
//! bytes. See [`ImagePipeline`] for the entry points.

pub mod cache;
pub mod codec;
mod container;
mod error;
mod keys;
mod loader;
mod pipeline;
pub mod processing;
mod request;
mod resumable;
mod runtime;
mod task;

// Intentionally curated re-exports for downstream consumers.
pub use cache::{DataCaching, ImageCaching, MemoryCache};
pub use codec::{
    DefaultImageDecoder, DefaultImageEncoder, ImageDecoding,
    ImageDecodingContext, ImageEncoding, ImageEncodingContext,
};
pub use container::{CacheType, Image, ImageContainer, ImageResponse};
pub use error::{ImagePipelineError, Result};
pub use keys::MemoryCacheKey;
pub use loader::{DataLoading, DataStream, ReqwestDataLoader};
pub use pipeline::{
    DataCachePolicy, ImageDecoderFactory, ImageEncoderFactory,
    ImagePipeline, ImagePipelineConfiguration, ImagePipelineDelegate,
    PipelineCache,
};
pub use processing::{ImageProcessing, ProcessingContext};
pub use request::{
    DataProducer, ImageRequest, ImageResource, ThumbnailOptions,
};
pub use task::{
    ImageTask, ImageTaskEvent, ImageTaskEvents, ImageTaskState,
};

// The model crate is part of the public surface.
pub use pictor_model::{
    CachePolicy, ImageRequestOptions, ImageType, Priority, TaskProgress,
    UrlRequest, UrlResponse,
};
