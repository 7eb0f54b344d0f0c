//! Fetch-original-image job: decodes the dependency's byte stream,
//! final and progressive, with one-in-flight back-pressure.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use pictor_model::UrlResponse;

use super::DataValue;
use crate::codec::{ImageDecoding, ImageDecodingContext};
use crate::container::{ImageContainer, ImageResponse};
use crate::error::ImagePipelineError;
use crate::pipeline::PipelineInner;
use crate::request::ImageRequest;
use crate::runtime::job::{Job, JobEvent, Starter, SubscriberMeta};

pub(crate) fn starter(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
) -> Starter<ImageResponse> {
    Box::new(move |job| {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subscription = pipeline.subscribe_original_data(
            &request,
            job.priority(),
            SubscriberMeta::Job(job.descriptor_provider()),
            events_tx,
        );
        job.set_dependency(Box::new(subscription));
        tokio::spawn(run(pipeline, request, job, events_rx));
    })
}

struct DecodeOutput {
    container: Option<ImageContainer>,
    error: Option<anyhow::Error>,
    is_completed: bool,
    url_response: Option<UrlResponse>,
}

async fn run(
    pipeline: Arc<PipelineInner>,
    request: ImageRequest,
    job: Arc<Job<ImageResponse>>,
    mut events: mpsc::UnboundedReceiver<JobEvent<DataValue>>,
) {
    let mut decoder: Option<Arc<dyn ImageDecoding>> = None;
    let mut in_flight: Option<oneshot::Receiver<DecodeOutput>> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    JobEvent::Progress(progress) => {
                        job.send_progress(progress)
                    }
                    JobEvent::Error(error) => {
                        job.send_error(error);
                        break;
                    }
                    JobEvent::Value {
                        value: (data, url_response),
                        is_completed,
                    } => {
                        if !is_completed
                            && !pipeline
                                .configuration
                                .is_progressive_decoding_enabled
                        {
                            continue;
                        }
                        if !is_completed && in_flight.is_some() {
                            // One progressive decode at a time; stale
                            // ticks are dropped, not queued.
                            trace!("dropping progressive chunk, decode busy");
                            continue;
                        }
                        if is_completed && in_flight.take().is_some() {
                            job.cancel_current_operation();
                        }

                        let context = ImageDecodingContext {
                            request: request.clone(),
                            data,
                            is_completed,
                            url_response,
                            cache_type: None,
                        };
                        if decoder.is_none() {
                            decoder = pipeline.decoder_for(&context);
                        }
                        let Some(active) = decoder.clone() else {
                            if is_completed {
                                job.send_error(
                                    ImagePipelineError::DecoderNotRegistered,
                                );
                                break;
                            }
                            // No decoder claims the prefix yet; wait.
                            continue;
                        };

                        if active.is_asynchronous() {
                            let (done_tx, done_rx) = oneshot::channel();
                            let operation =
                                pipeline.image_decoding_queue.enqueue(
                                    job.priority(),
                                    Box::pin(async move {
                                        let _ = done_tx.send(
                                            perform_decode(active, context),
                                        );
                                    }),
                                );
                            job.set_operation(operation);
                            in_flight = Some(done_rx);
                        } else if emit_decode_output(
                            &job,
                            &request,
                            perform_decode(active, context),
                        ) {
                            break;
                        }
                    }
                }
            }
            output = async {
                in_flight
                    .as_mut()
                    .expect("polled only while a decode is in flight")
                    .await
            }, if in_flight.is_some() => {
                in_flight = None;
                match output {
                    // Cancelled underneath us; the job is on its way out.
                    Err(_) => {}
                    Ok(output) => {
                        if emit_decode_output(&job, &request, output) {
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn perform_decode(
    decoder: Arc<dyn ImageDecoding>,
    context: ImageDecodingContext,
) -> DecodeOutput {
    if context.is_completed {
        let decoded = decoder.decode(&context);
        let (container, error) = match decoded {
            Ok(container) => (Some(container), None),
            Err(error) => (None, Some(error)),
        };
        DecodeOutput {
            container,
            error,
            is_completed: true,
            url_response: context.url_response,
        }
    } else {
        DecodeOutput {
            container: decoder.decode_partially(&context),
            error: None,
            is_completed: false,
            url_response: context.url_response,
        }
    }
}

/// Deliver a decode result; returns `true` when the job is finished.
fn emit_decode_output(
    job: &Arc<Job<ImageResponse>>,
    request: &ImageRequest,
    output: DecodeOutput,
) -> bool {
    if output.is_completed {
        match (output.container, output.error) {
            (Some(container), _) => {
                job.send_value(
                    ImageResponse {
                        container,
                        request: request.clone(),
                        url_response: output.url_response,
                        cache_type: None,
                    },
                    true,
                );
            }
            (None, error) => {
                let error = error.unwrap_or_else(|| {
                    anyhow::anyhow!("decoder produced no image")
                });
                job.send_error(ImagePipelineError::decoding(error));
            }
        }
        true
    } else {
        if let Some(container) = output.container {
            job.send_value(
                ImageResponse {
                    container,
                    request: request.clone(),
                    url_response: output.url_response,
                    cache_type: None,
                },
                false,
            );
        }
        // Progressive decode failures are swallowed; more data is coming.
        false
    }
}
