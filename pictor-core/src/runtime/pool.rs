//! Job coalescing: at most one in-flight job per key while subscribers
//! exist.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use pictor_model::Priority;

use super::job::{
    EventSink, Job, JobSubscription, Starter, SubscriberMeta,
};

/// Map from key to a weakly held live job.
///
/// Lookups expire dead entries; disposal hooks evict eagerly. With
/// coalescing disabled every subscription gets a fresh job and the map
/// is bypassed entirely.
pub(crate) struct TaskPool<K, T> {
    coalescing_enabled: bool,
    jobs: Arc<Mutex<HashMap<K, Weak<Job<T>>>>>,
}

impl<K, T> TaskPool<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub(crate) fn new(coalescing_enabled: bool) -> Self {
        Self {
            coalescing_enabled,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach to the live job for `key`, or construct one via `make`.
    ///
    /// The starter of a newly constructed job runs after the pool lock is
    /// released, so it may re-enter this pool (the processor peel
    /// subscribes to the same pool under the sub-request's key).
    pub(crate) fn subscribe(
        &self,
        key: K,
        priority: Priority,
        meta: SubscriberMeta,
        sink: EventSink<T>,
        make: impl FnOnce() -> Starter<T>,
    ) -> JobSubscription<T> {
        if !self.coalescing_enabled {
            let job = Job::new(make());
            return job
                .subscribe(priority, meta, sink)
                .expect("a fresh job accepts its first subscriber");
        }

        let (subscription, starter, job) = {
            let mut jobs = self.jobs.lock();
            let existing = jobs.get(&key).and_then(Weak::upgrade).and_then(
                |job| {
                    job.subscribe_deferred(
                        priority,
                        meta.clone(),
                        sink.clone(),
                    )
                    .map(|(subscription, starter)| {
                        (subscription, starter, job.clone())
                    })
                },
            );
            match existing {
                Some(attached) => {
                    trace!("coalesced onto an existing job");
                    attached
                }
                None => {
                    let job = Job::new(make());
                    let weak = Arc::downgrade(&job);
                    let map = self.jobs.clone();
                    let evict_key = key.clone();
                    job.set_on_dispose(Box::new(move || {
                        let mut map = map.lock();
                        let matches_entry = map
                            .get(&evict_key)
                            .is_some_and(|entry| entry.ptr_eq(&weak));
                        if matches_entry {
                            map.remove(&evict_key);
                        }
                    }));
                    jobs.insert(key, Arc::downgrade(&job));
                    let (subscription, starter) = job
                        .subscribe_deferred(priority, meta, sink)
                        .expect("a fresh job accepts its first subscriber");
                    (subscription, starter, job)
                }
            }
        };
        if let Some(starter) = starter {
            starter(job);
        }
        subscription
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}
