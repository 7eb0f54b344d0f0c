//! Progressive decoding back-pressure: at most one decode in flight,
//! stale chunks dropped.

mod support;

use std::time::Duration;

use futures::StreamExt;

use pictor_core::{ImagePipeline, ImageTaskEvent};
use support::{
    Attempt, ScriptedLoader, StubDecoder, body_bytes, http_response,
    request_for, scripted_configuration,
};

const URL: &str = "https://a/progressive.jpg";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progressive_chunks_are_dropped_while_a_decode_runs() {
    // Six chunks arrive every 5ms; each partial decode stalls for 100ms.
    // The first partial decode is still running when the remaining
    // progressive chunks arrive, so they must be dropped rather than
    // queued.
    let chunks: Vec<_> = (0..6).map(|fill| body_bytes(50, fill)).collect();
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::stalling(Duration::from_millis(100));
    loader.script(
        URL,
        Attempt::new(http_response(200, 300), chunks)
            .with_chunk_delay(Duration::from_millis(5)),
    );

    let mut configuration = scripted_configuration(&loader, &decoder);
    configuration.is_progressive_decoding_enabled = true;
    let pipeline = ImagePipeline::new(configuration);

    let mut task = pipeline.image_task(request_for(URL));
    let events: Vec<_> = task.events().collect().await;

    assert!(matches!(
        events.last(),
        Some(ImageTaskEvent::Finished(Ok(_)))
    ));
    // Five chunks were progressive (the sixth completes the body), but
    // at most two decodes can have started: the first chunk's, plus at
    // most one for a chunk that arrived after it finished.
    assert!(
        decoder.partial_calls() <= 2,
        "expected dropped chunks, got {} partial decodes",
        decoder.partial_calls()
    );
    assert!(decoder.partial_calls() >= 1);
    assert_eq!(decoder.final_calls(), 1);
    assert_eq!(decoder.max_concurrent(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disabled_progressive_decoding_ignores_partial_chunks() {
    let chunks: Vec<_> = (0..4).map(|fill| body_bytes(25, fill)).collect();
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    loader.script(
        URL,
        Attempt::new(http_response(200, 100), chunks)
            .with_chunk_delay(Duration::from_millis(5)),
    );
    let pipeline =
        ImagePipeline::new(scripted_configuration(&loader, &decoder));

    let mut task = pipeline.image_task(request_for(URL));
    let events: Vec<_> = task.events().collect().await;

    assert_eq!(decoder.partial_calls(), 0);
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, ImageTaskEvent::Preview(_)))
    );
    assert!(matches!(
        events.last(),
        Some(ImageTaskEvent::Finished(Ok(_)))
    ));
}
