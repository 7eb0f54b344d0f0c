//! Cache and coalescing keys derived from requests.
//!
//! Every key is a stable value: deriving it twice from clones of the same
//! request yields equal, equal-hashing keys. Scale is folded in through
//! its bit pattern so the keys stay `Eq + Hash`.

use pictor_model::{CachePolicy, ImageRequestOptions};

use crate::request::{ImageRequest, ImageResource, ThumbnailOptions};

/// Key for the in-memory image cache: identity plus everything that
/// changes the decoded pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryCacheKey {
    image_id: String,
    scale_bits: Option<u32>,
    thumbnail: Option<ThumbnailOptions>,
    processors: Vec<String>,
}

impl MemoryCacheKey {
    pub(crate) fn for_request(request: &ImageRequest) -> Self {
        Self {
            image_id: request.image_id(),
            scale_bits: request.scale().map(f32::to_bits),
            thumbnail: request.thumbnail(),
            processors: processor_identifiers(request),
        }
    }
}

/// String key for the data cache: the identity (image id, unless a
/// delegate overrides it), then the thumbnail identifier, then every
/// processor identifier in order.
pub(crate) fn data_cache_key_with_base(
    base: String,
    request: &ImageRequest,
    include_processors: bool,
) -> String {
    let mut key = base;
    if let Some(thumbnail) = request.thumbnail() {
        key.push_str(&thumbnail.identifier());
    }
    if include_processors {
        for identifier in processor_identifiers(request) {
            key.push_str(&identifier);
        }
    }
    key
}

/// Coalescing key for fetch-original-data jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FetchOriginalDataKey {
    image_id: String,
    cache_policy: CachePolicy,
    allows_cellular_access: bool,
}

impl FetchOriginalDataKey {
    pub(crate) fn for_request(request: &ImageRequest) -> Self {
        let (cache_policy, allows_cellular_access) = match request.resource()
        {
            ImageResource::UrlRequest(url_request) => (
                url_request.cache_policy,
                url_request.allows_cellular_access,
            ),
            _ => (CachePolicy::default(), true),
        };
        Self {
            image_id: request.image_id(),
            cache_policy,
            allows_cellular_access,
        }
    }
}

/// Coalescing key for fetch-original-image jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FetchOriginalImageKey {
    data: FetchOriginalDataKey,
    scale_bits: Option<u32>,
    thumbnail: Option<ThumbnailOptions>,
}

impl FetchOriginalImageKey {
    pub(crate) fn for_request(request: &ImageRequest) -> Self {
        Self {
            data: FetchOriginalDataKey::for_request(request),
            scale_bits: request.scale().map(f32::to_bits),
            thumbnail: request.thumbnail(),
        }
    }
}

/// Coalescing key for load-image (and load-data) jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LoadImageKey {
    data: FetchOriginalDataKey,
    options: ImageRequestOptions,
    processors: Vec<String>,
}

impl LoadImageKey {
    pub(crate) fn for_request(request: &ImageRequest) -> Self {
        Self {
            data: FetchOriginalDataKey::for_request(request),
            options: request.options(),
            processors: processor_identifiers(request),
        }
    }
}

fn processor_identifiers(request: &ImageRequest) -> Vec<String> {
    request
        .processors()
        .iter()
        .map(|processor| processor.identifier())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::sync::Arc;

    use url::Url;

    use super::{
        FetchOriginalDataKey, LoadImageKey, MemoryCacheKey,
        data_cache_key_with_base,
    };
    use crate::processing::{Custom, ImageProcessing};
    use crate::request::{ImageRequest, ThumbnailOptions};

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn processor(id: &str) -> Arc<dyn ImageProcessing> {
        Arc::new(Custom::new(id, |container| Ok(container)))
    }

    fn request() -> ImageRequest {
        ImageRequest::new(Url::parse("https://a/x.jpg").unwrap())
    }

    #[test]
    fn equal_requests_share_memory_keys() {
        let first = request()
            .with_scale(2.0)
            .with_thumbnail(ThumbnailOptions::new(128))
            .with_processors(vec![processor("p1")]);
        let second = first.clone();
        let lhs = MemoryCacheKey::for_request(&first);
        let rhs = MemoryCacheKey::for_request(&second);
        assert_eq!(lhs, rhs);
        assert_eq!(hash_of(&lhs), hash_of(&rhs));
    }

    #[test]
    fn processor_lists_split_memory_keys() {
        let plain = MemoryCacheKey::for_request(&request());
        let processed = MemoryCacheKey::for_request(
            &request().with_processors(vec![processor("p1")]),
        );
        assert_ne!(plain, processed);
    }

    #[test]
    fn data_cache_key_concatenates_identifiers() {
        let req = request()
            .with_thumbnail(ThumbnailOptions::new(64))
            .with_processors(vec![processor("p1"), processor("p2")]);
        assert_eq!(
            data_cache_key_with_base(req.image_id(), &req, true),
            "https://a/x.jpgthumbnail?max_pixel_size=64p1p2"
        );
        assert_eq!(
            data_cache_key_with_base(req.image_id(), &req, false),
            "https://a/x.jpgthumbnail?max_pixel_size=64"
        );
    }

    #[test]
    fn fetch_key_ignores_processors_and_options() {
        let plain = FetchOriginalDataKey::for_request(&request());
        let processed = FetchOriginalDataKey::for_request(
            &request().with_processors(vec![processor("p1")]),
        );
        assert_eq!(plain, processed);
    }

    #[test]
    fn load_key_tracks_options() {
        use pictor_model::ImageRequestOptions;
        let plain = LoadImageKey::for_request(&request());
        let no_writes = LoadImageKey::for_request(&request().with_options(
            ImageRequestOptions::DISABLE_MEMORY_CACHE_WRITES,
        ));
        assert_ne!(plain, no_writes);
    }
}
