use std::sync::Arc;

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, ImagePipelineError>;

/// Errors surfaced by pipeline tasks.
///
/// A job emits at most one error and that error is terminal for every
/// subscriber. Underlying failures ride as `Arc<anyhow::Error>` so events
/// stay cheap to fan out.
#[derive(Debug, Clone, Error)]
pub enum ImagePipelineError {
    /// `RETURN_CACHE_DATA_DONT_LOAD` was set and no cached bytes exist.
    #[error("cached data required by the request is missing")]
    DataMissingInCache,

    /// The transport or a local read failed.
    #[error("data loading failed: {0}")]
    DataLoadingFailed(Arc<anyhow::Error>),

    /// The transport completed with zero bytes.
    #[error("data loader returned an empty response")]
    DataIsEmpty,

    /// Final data arrived and no decoder claimed it.
    #[error("no decoder is registered for the received data")]
    DecoderNotRegistered,

    /// The decoder failed on the final data pass.
    #[error("image decoding failed: {0}")]
    DecodingFailed(Arc<anyhow::Error>),

    /// A processor failed on the final image.
    #[error("image processor {processor:?} failed: {underlying}")]
    ProcessingFailed {
        processor: String,
        underlying: Arc<anyhow::Error>,
    },

    /// The request was malformed, e.g. an unparsable URL string.
    #[error("image request is missing or malformed")]
    ImageRequestMissing,

    /// The request arrived after `ImagePipeline::invalidate`.
    #[error("the image pipeline is invalidated")]
    PipelineInvalidated,

    /// The task was cancelled before a result was produced.
    #[error("the image task was cancelled")]
    Cancelled,
}

impl ImagePipelineError {
    pub(crate) fn data_loading(error: anyhow::Error) -> Self {
        ImagePipelineError::DataLoadingFailed(Arc::new(error))
    }

    pub(crate) fn decoding(error: anyhow::Error) -> Self {
        ImagePipelineError::DecodingFailed(Arc::new(error))
    }

    pub(crate) fn processing(
        processor: impl Into<String>,
        error: anyhow::Error,
    ) -> Self {
        ImagePipelineError::ProcessingFailed {
            processor: processor.into(),
            underlying: Arc::new(error),
        }
    }

    /// Whether this error means the pipeline refused the work outright.
    pub fn is_invalidation(&self) -> bool {
        matches!(self, ImagePipelineError::PipelineInvalidated)
    }
}

#[cfg(test)]
mod tests {
    use super::ImagePipelineError;

    #[test]
    fn errors_are_cloneable_events() {
        let error =
            ImagePipelineError::data_loading(anyhow::anyhow!("timed out"));
        let clone = error.clone();
        assert!(clone.to_string().contains("timed out"));
    }
}
