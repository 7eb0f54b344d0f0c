//! The caller-visible handle for one in-flight request.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use pictor_model::{Priority, TaskProgress};

use crate::container::{Image, ImageResponse};
use crate::error::{ImagePipelineError, Result};
use crate::pipeline::PipelineInner;
use crate::request::ImageRequest;
use crate::runtime::job::{
    JobEvent, JobSubscription, SubscriberMeta, TaskDescriptor,
};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Task state: `Running` until exactly one terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageTaskState {
    Running,
    Completed,
    Cancelled,
}

/// Events observed through [`ImageTask::events`].
///
/// Zero or more `Progress`/`Preview` events, then exactly one terminal
/// event (`Finished` or `Cancelled`), after which the stream ends.
#[derive(Debug, Clone)]
pub enum ImageTaskEvent {
    Progress(TaskProgress),
    Preview(ImageResponse),
    Cancelled,
    Finished(Result<ImageResponse>),
}

/// A handle to one running image (or data) load.
///
/// Dropping the handle does not cancel the work; call
/// [`ImageTask::cancel`] for that.
pub struct ImageTask {
    shared: Arc<TaskShared>,
    events: Option<mpsc::UnboundedReceiver<ImageTaskEvent>>,
}

pub(crate) struct TaskShared {
    id: u64,
    request: ImageRequest,
    pipeline: Weak<PipelineInner>,
    state: Mutex<TaskState>,
}

struct TaskState {
    phase: ImageTaskState,
    priority: Priority,
    progress: TaskProgress,
    subscription: Option<JobSubscription<ImageResponse>>,
    events_tx: Option<mpsc::UnboundedSender<ImageTaskEvent>>,
}

pub(crate) enum TaskKind {
    Image,
    Data,
}

impl PipelineInner {
    pub(crate) fn spawn_task(
        self: &Arc<Self>,
        request: ImageRequest,
        kind: TaskKind,
    ) -> ImageTask {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(TaskShared {
            id,
            request: request.clone(),
            pipeline: Arc::downgrade(self),
            state: Mutex::new(TaskState {
                phase: ImageTaskState::Running,
                priority: request.priority(),
                progress: TaskProgress::default(),
                subscription: None,
                events_tx: Some(events_tx),
            }),
        });

        if self.is_invalidated() {
            shared.finalize(Err(ImagePipelineError::PipelineInvalidated));
            return ImageTask { shared, events: Some(events_rx) };
        }

        let descriptor = TaskDescriptor {
            has_processors: !request.processors().is_empty(),
            has_thumbnail: request.thumbnail().is_some(),
        };
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let subscription = match kind {
            TaskKind::Image => self.subscribe_load_image(
                &request,
                request.priority(),
                SubscriberMeta::Task(descriptor),
                job_tx,
            ),
            TaskKind::Data => self.subscribe_load_data(
                &request,
                request.priority(),
                SubscriberMeta::Task(descriptor),
                job_tx,
            ),
        };
        shared.state.lock().subscription = Some(subscription);
        self.tasks.insert(id, shared.clone());
        self.delegate.image_task_did_start(&request);
        debug!(task_id = id, image_id = %request.image_id(), "image task started");

        tokio::spawn(task_event_loop(shared.clone(), job_rx));
        ImageTask { shared, events: Some(events_rx) }
    }
}

async fn task_event_loop(
    shared: Arc<TaskShared>,
    mut events: mpsc::UnboundedReceiver<JobEvent<ImageResponse>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            JobEvent::Progress(progress) => shared.emit_progress(progress),
            JobEvent::Value { value, is_completed: false } => {
                shared.emit_preview(value)
            }
            JobEvent::Value { value, is_completed: true } => {
                shared.finalize(Ok(value));
                break;
            }
            JobEvent::Error(error) => {
                shared.finalize(Err(error));
                break;
            }
        }
    }
}

impl TaskShared {
    fn emit_progress(&self, progress: TaskProgress) {
        {
            let mut state = self.state.lock();
            if state.phase != ImageTaskState::Running {
                return;
            }
            state.progress = progress;
            if let Some(tx) = &state.events_tx {
                let _ = tx.send(ImageTaskEvent::Progress(progress));
            }
        }
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline
                .delegate
                .image_task_did_update_progress(&self.request, progress);
        }
    }

    fn emit_preview(&self, response: ImageResponse) {
        let state = self.state.lock();
        if state.phase != ImageTaskState::Running {
            return;
        }
        if let Some(tx) = &state.events_tx {
            let _ = tx.send(ImageTaskEvent::Preview(response));
        }
    }

    pub(crate) fn finalize(&self, result: Result<ImageResponse>) {
        let subscription = {
            let mut state = self.state.lock();
            if state.phase != ImageTaskState::Running {
                return;
            }
            state.phase = ImageTaskState::Completed;
            if let Some(tx) = state.events_tx.take() {
                let _ = tx.send(ImageTaskEvent::Finished(result.clone()));
            }
            state.subscription.take()
        };
        drop(subscription);
        self.detach_from_pipeline();
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline
                .delegate
                .image_task_did_complete(&self.request, &result);
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        let subscription = {
            let mut state = self.state.lock();
            if state.phase != ImageTaskState::Running {
                return false;
            }
            state.phase = ImageTaskState::Cancelled;
            if let Some(tx) = state.events_tx.take() {
                let _ = tx.send(ImageTaskEvent::Cancelled);
            }
            state.subscription.take()
        };
        // Unsubscribing outside the state lock keeps the cancellation
        // cascade single-lock at every step.
        drop(subscription);
        self.detach_from_pipeline();
        if let Some(pipeline) = self.pipeline.upgrade() {
            debug!(task_id = self.id, "image task cancelled");
            pipeline.delegate.image_task_did_cancel(&self.request);
        }
        true
    }

    fn detach_from_pipeline(&self) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.tasks.remove(&self.id);
        }
    }
}

impl ImageTask {
    /// Monotonic identifier, unique across pipelines for the lifetime of
    /// the process.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn request(&self) -> &ImageRequest {
        &self.shared.request
    }

    pub fn state(&self) -> ImageTaskState {
        self.shared.state.lock().phase
    }

    pub fn progress(&self) -> TaskProgress {
        self.shared.state.lock().progress
    }

    pub fn priority(&self) -> Priority {
        self.shared.state.lock().priority
    }

    /// Re-prioritize the underlying job chain. No-op once terminal.
    pub fn set_priority(&self, priority: Priority) {
        let state = &mut *self.shared.state.lock();
        if state.phase != ImageTaskState::Running {
            return;
        }
        state.priority = priority;
        if let Some(subscription) = &state.subscription {
            subscription.set_priority(priority);
        }
    }

    /// Cancel the task. Idempotent; emits `Cancelled` exactly once, and
    /// no further events are observed afterwards.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// The task's event stream. Single-shot: later calls yield an
    /// already-finished stream.
    pub fn events(&mut self) -> ImageTaskEvents {
        ImageTaskEvents { receiver: self.events.take() }
    }

    /// Drive the task to completion and return the final response.
    pub async fn response(&mut self) -> Result<ImageResponse> {
        use futures::StreamExt;
        let mut events = self.events();
        while let Some(event) = events.next().await {
            match event {
                ImageTaskEvent::Finished(result) => return result,
                ImageTaskEvent::Cancelled => {
                    return Err(ImagePipelineError::Cancelled);
                }
                ImageTaskEvent::Progress(_)
                | ImageTaskEvent::Preview(_) => {}
            }
        }
        Err(ImagePipelineError::Cancelled)
    }

    /// Drive the task to completion and return the final image.
    pub async fn image(&mut self) -> Result<Image> {
        self.response()
            .await
            .map(|response| response.container.image)
    }
}

/// Finite stream of [`ImageTaskEvent`]s; completes after the terminal
/// event.
pub struct ImageTaskEvents {
    receiver: Option<mpsc::UnboundedReceiver<ImageTaskEvent>>,
}

impl Stream for ImageTaskEvents {
    type Item = ImageTaskEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<ImageTaskEvent>> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}
