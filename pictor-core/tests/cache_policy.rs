//! Exhaustive check of the data-cache store policy: which bytes land in
//! the data cache for every policy, processing profile, and resource
//! locality.

mod support;

use std::collections::BTreeSet;
use std::sync::Arc;

use pictor_core::{
    DataCachePolicy, ImagePipeline, ImageRequest,
    processing::{Custom, ImageProcessing},
};
use support::{
    Attempt, RecordingDataCache, ScriptedLoader, StubDecoder, body_bytes,
    http_response, request_for, scripted_configuration,
};

const URL: &str = "https://a/policy.jpg";
// Three bytes of zeros, base64-encoded.
const LOCAL_URL: &str = "data:application/octet-stream;base64,AAAA";

const POLICIES: [DataCachePolicy; 4] = [
    DataCachePolicy::Automatic,
    DataCachePolicy::StoreOriginalData,
    DataCachePolicy::StoreEncodedImages,
    DataCachePolicy::StoreAll,
];

fn identity_processor(id: &str) -> Arc<dyn ImageProcessing> {
    Arc::new(Custom::new(id, Ok))
}

fn expected_stores(
    policy: DataCachePolicy,
    processed: bool,
    local: bool,
) -> (bool, bool) {
    if local {
        return (false, false);
    }
    let original = match policy {
        DataCachePolicy::StoreOriginalData | DataCachePolicy::StoreAll => {
            true
        }
        DataCachePolicy::StoreEncodedImages => false,
        DataCachePolicy::Automatic => !processed,
    };
    let encoded = match policy {
        DataCachePolicy::StoreEncodedImages => true,
        DataCachePolicy::Automatic | DataCachePolicy::StoreAll => processed,
        DataCachePolicy::StoreOriginalData => false,
    };
    (original, encoded)
}

#[tokio::test]
async fn store_side_effects_follow_the_policy_table() {
    for policy in POLICIES {
        for processed in [false, true] {
            for local in [false, true] {
                check_policy_case(policy, processed, local).await;
            }
        }
    }
}

async fn check_policy_case(
    policy: DataCachePolicy,
    processed: bool,
    local: bool,
) {
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    let data_cache = RecordingDataCache::new();
    loader.script(
        URL,
        Attempt::new(http_response(200, 16), vec![body_bytes(16, 9)]),
    );

    let mut configuration = scripted_configuration(&loader, &decoder);
    configuration.data_cache = Some(data_cache.clone());
    configuration.data_cache_policy = policy;
    configuration.is_local_resources_support_enabled = true;
    let pipeline = ImagePipeline::new(configuration);

    let mut request =
        request_for(if local { LOCAL_URL } else { URL });
    if processed {
        request = request
            .with_processors(vec![identity_processor("noop")]);
    }

    pipeline.image(request.clone()).await.unwrap_or_else(|error| {
        panic!(
            "load failed for {policy:?}/processed={processed}/local={local}: {error}"
        )
    });

    let (want_original, want_encoded) =
        expected_stores(policy, processed, local);
    let original_key = pipeline
        .cache()
        .data_cache_key(&unprocessed(&request));
    let encoded_key = pipeline.cache().data_cache_key(&request);

    let mut expected = BTreeSet::new();
    if want_original {
        expected.insert(original_key);
    }
    if want_encoded {
        expected.insert(encoded_key);
    }
    let written: BTreeSet<String> =
        data_cache.write_keys().into_iter().collect();
    assert_eq!(
        written, expected,
        "policy {policy:?}, processed={processed}, local={local}"
    );

    if local {
        assert_eq!(loader.started_count(), 0, "local loads skip transport");
    }
}

fn unprocessed(request: &ImageRequest) -> ImageRequest {
    request.clone().with_processors(Vec::new())
}
