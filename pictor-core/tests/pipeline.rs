//! End-to-end pipeline behavior against scripted collaborators.

mod support;

use std::time::Duration;

use futures::StreamExt;

use pictor_core::{
    CacheType, ImagePipeline, ImagePipelineError, ImageTaskEvent,
    ImageTaskState, Priority, TaskProgress,
};
use support::{
    Attempt, ScriptedLoader, StubDecoder, body_bytes, http_response,
    request_for, scripted_configuration,
};

const URL: &str = "https://a/x.jpg";

fn pipeline_with(
    loader: &std::sync::Arc<ScriptedLoader>,
    decoder: &std::sync::Arc<StubDecoder>,
) -> ImagePipeline {
    ImagePipeline::new(scripted_configuration(loader, decoder))
}

#[tokio::test]
async fn single_fetch_reports_progress_then_finishes() {
    support::init_tracing();
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    loader.script(
        URL,
        Attempt::new(
            http_response(200, 10_000),
            vec![body_bytes(5_000, 1), body_bytes(5_000, 2)],
        ),
    );
    let pipeline = pipeline_with(&loader, &decoder);

    let request = request_for(URL);
    let mut task = pipeline.image_task(request.clone());
    let mut events = Vec::new();
    let mut stream = task.events();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert!(matches!(
        events[0],
        ImageTaskEvent::Progress(TaskProgress { completed: 5_000, total: 10_000 })
    ));
    assert!(matches!(
        events[1],
        ImageTaskEvent::Progress(TaskProgress { completed: 10_000, total: 10_000 })
    ));
    let ImageTaskEvent::Finished(Ok(response)) = events.last().unwrap()
    else {
        panic!("expected a successful terminal event, got {events:?}");
    };
    assert_eq!(response.cache_type, None);
    assert_eq!(loader.started_count(), 1);
    assert_eq!(decoder.final_calls(), 1);

    // The decoded container landed in the memory cache.
    assert!(pipeline.cache().contains_cached_image(&request));
}

#[tokio::test]
async fn second_fetch_is_served_from_memory() {
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    loader.script(
        URL,
        Attempt::new(http_response(200, 4), vec![body_bytes(4, 7)]),
    );
    let pipeline = pipeline_with(&loader, &decoder);

    pipeline.image(request_for(URL)).await.expect("first load");
    let response =
        pipeline.image(request_for(URL)).await.expect("second load");

    assert_eq!(response.cache_type, Some(CacheType::Memory));
    assert_eq!(loader.started_count(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_before_start_never_touches_the_transport() {
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    loader.script(
        URL,
        Attempt::new(http_response(200, 4), vec![body_bytes(4, 7)]),
    );
    let pipeline = pipeline_with(&loader, &decoder);

    let mut task = pipeline.image_task(request_for(URL));
    task.cancel();
    let result = task.response().await;

    assert!(matches!(result, Err(ImagePipelineError::Cancelled)));
    assert_eq!(task.state(), ImageTaskState::Cancelled);
    assert_eq!(loader.started_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_subscriber_stops_observing_while_others_finish() {
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    loader.script(
        URL,
        Attempt::new(
            http_response(200, 300),
            vec![body_bytes(100, 1), body_bytes(100, 2), body_bytes(100, 3)],
        )
        .with_chunk_delay(Duration::from_millis(20)),
    );
    let pipeline = pipeline_with(&loader, &decoder);

    let mut doomed = pipeline.image_task(request_for(URL));
    let mut survivor = pipeline.image_task(request_for(URL));

    let mut doomed_events = doomed.events();
    // Wait until the download demonstrably started, then cancel.
    let first = doomed_events.next().await.expect("one event");
    assert!(matches!(first, ImageTaskEvent::Progress(_)));
    doomed.cancel();

    let remaining: Vec<_> = doomed_events.collect().await;
    let terminal_count = remaining
        .iter()
        .filter(|event| {
            matches!(
                event,
                ImageTaskEvent::Cancelled | ImageTaskEvent::Finished(_)
            )
        })
        .count();
    assert_eq!(terminal_count, 1);
    assert!(matches!(remaining.last(), Some(ImageTaskEvent::Cancelled)));

    let response = survivor.response().await.expect("survivor completes");
    assert_eq!(response.cache_type, None);
    assert_eq!(loader.started_count(), 1);
}

#[tokio::test]
async fn invalidation_cancels_everything_and_rejects_new_work() {
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    loader.script(
        URL,
        Attempt::new(
            http_response(200, 200),
            vec![body_bytes(100, 1), body_bytes(100, 2)],
        )
        .with_chunk_delay(Duration::from_millis(50)),
    );
    let pipeline = pipeline_with(&loader, &decoder);

    let mut outstanding = pipeline.image_task(request_for(URL));
    pipeline.invalidate();

    let result = outstanding.response().await;
    assert!(matches!(result, Err(ImagePipelineError::Cancelled)));

    let started_before = loader.started_count();
    let result = pipeline.image(request_for(URL)).await;
    assert!(matches!(
        result,
        Err(ImagePipelineError::PipelineInvalidated)
    ));
    assert_eq!(loader.started_count(), started_before);
}

#[tokio::test]
async fn unparsable_url_is_reported_as_request_misuse() {
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    let pipeline = pipeline_with(&loader, &decoder);

    let result = pipeline.image_from_url("not a url").await;
    assert!(matches!(
        result,
        Err(ImagePipelineError::ImageRequestMissing)
    ));
}

#[tokio::test]
async fn progressive_decoding_emits_previews_before_the_final_image() {
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    loader.script(
        URL,
        Attempt::new(
            http_response(200, 300),
            vec![body_bytes(100, 1), body_bytes(100, 2), body_bytes(100, 3)],
        )
        .with_chunk_delay(Duration::from_millis(10)),
    );
    let mut configuration = scripted_configuration(&loader, &decoder);
    configuration.is_progressive_decoding_enabled = true;
    let pipeline = ImagePipeline::new(configuration);

    let mut task = pipeline.image_task(request_for(URL));
    let events: Vec<_> = task.events().collect().await;

    let previews = events
        .iter()
        .filter(|event| matches!(event, ImageTaskEvent::Preview(_)))
        .count();
    assert!(previews >= 1, "expected at least one preview in {events:?}");
    assert!(matches!(
        events.last(),
        Some(ImageTaskEvent::Finished(Ok(_)))
    ));
    assert!(decoder.partial_calls() >= 1);
}

#[tokio::test]
async fn data_task_returns_raw_bytes() {
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    loader.script(
        URL,
        Attempt::new(
            http_response(200, 8),
            vec![body_bytes(4, 1), body_bytes(4, 2)],
        ),
    );
    let pipeline = pipeline_with(&loader, &decoder);

    let (data, response) =
        pipeline.data(request_for(URL)).await.expect("data load");
    assert_eq!(data.len(), 8);
    assert_eq!(response.unwrap().status, 200);
    // Bytes-only loads never decode.
    assert_eq!(decoder.final_calls(), 0);
}

#[tokio::test]
async fn priorities_are_accepted_on_running_tasks() {
    let loader = ScriptedLoader::new();
    let decoder = StubDecoder::new();
    loader.script(
        URL,
        Attempt::new(http_response(200, 4), vec![body_bytes(4, 3)])
            .with_chunk_delay(Duration::from_millis(20)),
    );
    let pipeline = pipeline_with(&loader, &decoder);

    let mut task = pipeline
        .image_task(request_for(URL).with_priority(Priority::Low));
    assert_eq!(task.priority(), Priority::Low);
    task.set_priority(Priority::VeryHigh);
    assert_eq!(task.priority(), Priority::VeryHigh);

    task.response().await.expect("completes");
    // Terminal tasks ignore further priority changes.
    task.set_priority(Priority::Low);
    assert_eq!(task.state(), ImageTaskState::Completed);
}
