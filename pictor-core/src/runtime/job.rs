//! Multi-subscriber unit of work with priority propagation, a single
//! dependency edge, and dispose-once semantics.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use pictor_model::{Priority, TaskProgress};

use super::queue::Operation;
use crate::error::ImagePipelineError;

/// One event delivered to every subscriber of a job.
#[derive(Debug, Clone)]
pub(crate) enum JobEvent<T> {
    Value { value: T, is_completed: bool },
    Progress(TaskProgress),
    Error(ImagePipelineError),
}

pub(crate) type EventSink<T> = UnboundedSender<JobEvent<T>>;

/// Runs once, on the first subscription.
pub(crate) type Starter<T> = Box<dyn FnOnce(Arc<Job<T>>) + Send>;

/// What a direct image-task subscriber asked for. Jobs use the
/// transitive set of these to decide store policy and whether they are
/// an internal intermediate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskDescriptor {
    pub has_processors: bool,
    pub has_thumbnail: bool,
}

pub(crate) type DescriptorProvider =
    Arc<dyn Fn() -> Vec<TaskDescriptor> + Send + Sync>;

/// Identity a subscriber attaches to its subscription: either a direct
/// image task, or another job able to enumerate its own tasks.
#[derive(Clone)]
pub(crate) enum SubscriberMeta {
    Task(TaskDescriptor),
    Job(DescriptorProvider),
}

/// A coalesced unit of work.
///
/// Lifecycle: created lazily, started by the first subscription,
/// disposed on completion, error, or last unsubscribe. A disposed job
/// never re-enters any other state and never delivers another event.
pub(crate) struct Job<T> {
    inner: Mutex<JobInner<T>>,
}

struct JobInner<T> {
    disposed: bool,
    started: bool,
    starter: Option<Starter<T>>,
    subscribers: SubscriberTable<T>,
    priority: Priority,
    dependency: Option<Box<dyn DependencySubscription>>,
    operation: Option<Operation>,
    on_dispose: Option<Box<dyn FnOnce() + Send>>,
}

struct Subscriber<T> {
    priority: Priority,
    meta: SubscriberMeta,
    sink: EventSink<T>,
}

/// Inline fast path for the common single-subscriber case, overflow map
/// for fan-out. Keys are monotonic and never reused.
struct SubscriberTable<T> {
    inline: Option<(u64, Subscriber<T>)>,
    overflow: HashMap<u64, Subscriber<T>>,
    next_key: u64,
}

impl<T> SubscriberTable<T> {
    fn new() -> Self {
        Self { inline: None, overflow: HashMap::new(), next_key: 0 }
    }

    fn insert(&mut self, subscriber: Subscriber<T>) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        if self.inline.is_none() && self.overflow.is_empty() {
            self.inline = Some((key, subscriber));
        } else {
            self.overflow.insert(key, subscriber);
        }
        key
    }

    fn remove(&mut self, key: u64) -> Option<Subscriber<T>> {
        if let Some((inline_key, _)) = &self.inline
            && *inline_key == key
        {
            return self.inline.take().map(|(_, subscriber)| subscriber);
        }
        self.overflow.remove(&key)
    }

    fn get_mut(&mut self, key: u64) -> Option<&mut Subscriber<T>> {
        if let Some((inline_key, subscriber)) = &mut self.inline
            && *inline_key == key
        {
            return Some(subscriber);
        }
        self.overflow.get_mut(&key)
    }

    fn is_empty(&self) -> bool {
        self.inline.is_none() && self.overflow.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &Subscriber<T>> {
        self.inline
            .iter()
            .map(|(_, subscriber)| subscriber)
            .chain(self.overflow.values())
    }

    fn max_priority(&self) -> Priority {
        self.iter()
            .map(|subscriber| subscriber.priority)
            .max()
            .unwrap_or(Priority::VeryLow)
    }
}

/// Deferred side effects of disposal, executed after the job lock is
/// released so cascade cancellation never nests job locks the wrong way.
struct Disposal {
    dependency: Option<Box<dyn DependencySubscription>>,
    operation: Option<Operation>,
    on_dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposal {
    fn run(self) {
        if let Some(operation) = self.operation {
            operation.cancel();
        }
        drop(self.dependency);
        if let Some(on_dispose) = self.on_dispose {
            on_dispose();
        }
    }
}

impl<T: Clone + Send + 'static> Job<T> {
    pub(crate) fn new(starter: Starter<T>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(JobInner {
                disposed: false,
                started: false,
                starter: Some(starter),
                subscribers: SubscriberTable::new(),
                priority: Priority::VeryLow,
                dependency: None,
                operation: None,
                on_dispose: None,
            }),
        })
    }

    /// Subscribe and run the starter inline if this is the first
    /// subscription. Returns `None` when the job is already disposed.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        priority: Priority,
        meta: SubscriberMeta,
        sink: EventSink<T>,
    ) -> Option<JobSubscription<T>> {
        let (subscription, starter) =
            self.subscribe_deferred(priority, meta, sink)?;
        if let Some(starter) = starter {
            starter(self.clone());
        }
        Some(subscription)
    }

    /// Two-phase subscribe: the caller runs the returned starter after
    /// releasing whatever lock guards the job lookup.
    pub(crate) fn subscribe_deferred(
        self: &Arc<Self>,
        priority: Priority,
        meta: SubscriberMeta,
        sink: EventSink<T>,
    ) -> Option<(JobSubscription<T>, Option<Starter<T>>)> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        let key =
            inner.subscribers.insert(Subscriber { priority, meta, sink });
        if priority > inner.priority {
            set_priority_locked(&mut inner, priority);
        }
        let starter = if inner.started {
            None
        } else {
            inner.started = true;
            inner.starter.take()
        };
        drop(inner);
        Some((JobSubscription { job: self.clone(), key }, starter))
    }

    /// Deliver a value; a completed value disposes the job.
    pub(crate) fn send_value(&self, value: T, is_completed: bool) {
        let disposal = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            for subscriber in inner.subscribers.iter() {
                let _ = subscriber.sink.send(JobEvent::Value {
                    value: value.clone(),
                    is_completed,
                });
            }
            if is_completed { Some(dispose_locked(&mut inner)) } else { None }
        };
        if let Some(disposal) = disposal {
            disposal.run();
        }
    }

    pub(crate) fn send_progress(&self, progress: TaskProgress) {
        let inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        for subscriber in inner.subscribers.iter() {
            let _ = subscriber.sink.send(JobEvent::Progress(progress));
        }
    }

    /// Deliver an error and dispose. A job emits at most one error.
    pub(crate) fn send_error(&self, error: ImagePipelineError) {
        let disposal = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            for subscriber in inner.subscribers.iter() {
                let _ =
                    subscriber.sink.send(JobEvent::Error(error.clone()));
            }
            dispose_locked(&mut inner)
        };
        disposal.run();
    }

    /// Attach the single dependency subscription, propagating the
    /// current priority to it immediately.
    pub(crate) fn set_dependency(
        &self,
        dependency: Box<dyn DependencySubscription>,
    ) {
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                Some(dependency)
            } else {
                dependency.set_priority(inner.priority);
                inner.dependency = Some(dependency);
                None
            }
        };
        // Dropping outside the lock lets the cascade cancel cleanly.
        drop(rejected);
    }

    /// Hand the job its current queue operation. An operation set after
    /// disposal is cancelled on the spot.
    pub(crate) fn set_operation(&self, operation: Operation) {
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                Some(operation)
            } else {
                operation.set_priority(inner.priority);
                inner.operation = Some(operation);
                None
            }
        };
        if let Some(operation) = rejected {
            operation.cancel();
        }
    }

    /// Take and cancel the in-flight operation (progressive
    /// back-pressure: a completed pass supersedes a running partial one).
    pub(crate) fn cancel_current_operation(&self) {
        let operation = self.inner.lock().operation.take();
        if let Some(operation) = operation {
            operation.cancel();
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        self.inner.lock().priority
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    pub(crate) fn set_on_dispose(
        &self,
        on_dispose: Box<dyn FnOnce() + Send>,
    ) {
        let run_now = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                Some(on_dispose)
            } else {
                inner.on_dispose = Some(on_dispose);
                None
            }
        };
        if let Some(on_dispose) = run_now {
            on_dispose();
        }
    }

    /// Descriptors of every image task transitively subscribed here.
    pub(crate) fn task_descriptors(&self) -> Vec<TaskDescriptor> {
        let metas: Vec<SubscriberMeta> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .iter()
                .map(|subscriber| subscriber.meta.clone())
                .collect()
        };
        // Providers walk other jobs; keep our own lock released.
        let mut descriptors = Vec::new();
        for meta in metas {
            match meta {
                SubscriberMeta::Task(descriptor) => {
                    descriptors.push(descriptor)
                }
                SubscriberMeta::Job(provider) => {
                    descriptors.extend(provider())
                }
            }
        }
        descriptors
    }

    /// Whether any subscriber is an image task rather than another job.
    pub(crate) fn has_direct_task_subscriber(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .subscribers
            .iter()
            .any(|subscriber| {
                matches!(subscriber.meta, SubscriberMeta::Task(_))
            })
    }

    /// Provider enumerating this job's transitive task descriptors, for
    /// subscriptions this job makes to its dependency.
    pub(crate) fn descriptor_provider(
        self: &Arc<Self>,
    ) -> DescriptorProvider {
        let weak: Weak<Job<T>> = Arc::downgrade(self);
        Arc::new(move || {
            weak.upgrade()
                .map(|job| job.task_descriptors())
                .unwrap_or_default()
        })
    }

    fn update_subscriber_priority(&self, key: u64, priority: Priority) {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        let Some(subscriber) = inner.subscribers.get_mut(key) else {
            return;
        };
        subscriber.priority = priority;
        if priority >= inner.priority {
            // The maximum can only have grown; skip the full scan.
            if priority > inner.priority {
                set_priority_locked(&mut inner, priority);
            }
        } else {
            let recomputed = inner.subscribers.max_priority();
            if recomputed != inner.priority {
                set_priority_locked(&mut inner, recomputed);
            }
        }
    }
}

fn set_priority_locked<T>(inner: &mut JobInner<T>, priority: Priority) {
    inner.priority = priority;
    if let Some(operation) = &inner.operation {
        operation.set_priority(priority);
    }
    if let Some(dependency) = &inner.dependency {
        dependency.set_priority(priority);
    }
}

fn dispose_locked<T>(inner: &mut JobInner<T>) -> Disposal {
    inner.disposed = true;
    Disposal {
        dependency: inner.dependency.take(),
        operation: inner.operation.take(),
        on_dispose: inner.on_dispose.take(),
    }
}

/// Token a subscriber holds against a job. Dropping it unsubscribes;
/// the last drop disposes the job and cascades cancellation.
pub(crate) struct JobSubscription<T> {
    pub(crate) job: Arc<Job<T>>,
    key: u64,
}

impl<T: Clone + Send + 'static> JobSubscription<T> {
    pub(crate) fn set_priority(&self, priority: Priority) {
        self.job.update_subscriber_priority(self.key, priority);
    }
}

impl<T> Drop for JobSubscription<T> {
    fn drop(&mut self) {
        // `unsubscribe` only needs the lock, not the `T` bounds.
        let disposal = {
            let mut inner = self.job.inner.lock();
            if inner.disposed {
                None
            } else if inner.subscribers.remove(self.key).is_none() {
                None
            } else if inner.subscribers.is_empty() {
                trace!("last subscriber left, disposing job");
                Some(dispose_locked(&mut inner))
            } else {
                let recomputed = inner.subscribers.max_priority();
                if recomputed != inner.priority {
                    set_priority_locked(&mut inner, recomputed);
                }
                None
            }
        };
        if let Some(disposal) = disposal {
            disposal.run();
        }
    }
}

/// Type-erased handle a job keeps to the subscription it holds against
/// its parent. Dropping the box is the cancellation primitive.
pub(crate) trait DependencySubscription: Send {
    fn set_priority(&self, priority: Priority);
}

impl<T: Clone + Send + 'static> DependencySubscription
    for JobSubscription<T>
{
    fn set_priority(&self, priority: Priority) {
        JobSubscription::set_priority(self, priority);
    }
}
