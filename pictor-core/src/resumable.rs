//! Partial-download storage: byte prefixes plus validators, replayed as
//! HTTP range requests.

use std::num::NonZeroUsize;
use std::sync::OnceLock;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use pictor_model::{UrlRequest, UrlResponse};

pub(crate) const DEFAULT_COST_LIMIT: usize = 32 * 1024 * 1024;
pub(crate) const DEFAULT_COUNT_LIMIT: usize = 100;

/// A byte prefix of an interrupted download plus the validator that
/// proves it still matches the remote object.
#[derive(Debug, Clone)]
pub(crate) struct ResumableData {
    pub data: Bytes,
    validator: String,
}

impl ResumableData {
    /// Qualify a failed download for resumption.
    ///
    /// Requires: status 200 or 206, `Accept-Ranges: bytes`, a non-empty
    /// body strictly shorter than `Content-Length`, and an `ETag`
    /// (preferred) or `Last-Modified` validator.
    pub(crate) fn from_response(
        response: &UrlResponse,
        data: &Bytes,
    ) -> Option<ResumableData> {
        if !(response.status == 200 || response.status == 206) {
            return None;
        }
        let accepts_ranges = response
            .header("Accept-Ranges")
            .is_some_and(|value| value.eq_ignore_ascii_case("bytes"));
        if !accepts_ranges || data.is_empty() {
            return None;
        }
        let content_length: u64 =
            response.header("Content-Length")?.trim().parse().ok()?;
        if data.len() as u64 >= content_length {
            return None;
        }
        let validator = response
            .header("ETag")
            .or_else(|| response.header("Last-Modified"))?
            .to_owned();
        Some(ResumableData { data: data.clone(), validator })
    }

    /// Rewrite an outgoing request to continue from the stored prefix.
    pub(crate) fn resume_request(&self, request: &mut UrlRequest) {
        request.set_header("Range", format!("bytes={}-", self.data.len()));
        request.set_header("If-Range", self.validator.clone());
    }

    /// Whether the server acknowledged the range request.
    pub(crate) fn is_resumed_response(response: &UrlResponse) -> bool {
        response.status == 206
    }
}

type StoreKey = (u64, String);

/// Process-shared LRU of resumable records, keyed by
/// `(pipeline id, image id)`.
///
/// Storage exists only while at least one pipeline namespace is
/// registered; the last unregister deallocates everything.
pub(crate) struct ResumableDataStore {
    cost_limit: usize,
    count_limit: usize,
    inner: Mutex<Option<StoreInner>>,
}

struct StoreInner {
    registered: usize,
    entries: LruCache<StoreKey, ResumableData>,
    total_cost: usize,
}

impl ResumableDataStore {
    pub(crate) fn new(cost_limit: usize, count_limit: usize) -> Self {
        Self { cost_limit, count_limit, inner: Mutex::new(None) }
    }

    /// The store every pipeline shares by default.
    pub(crate) fn shared() -> &'static ResumableDataStore {
        static SHARED: OnceLock<ResumableDataStore> = OnceLock::new();
        SHARED.get_or_init(|| {
            ResumableDataStore::new(DEFAULT_COST_LIMIT, DEFAULT_COUNT_LIMIT)
        })
    }

    pub(crate) fn register_pipeline(&self) {
        let mut inner = self.inner.lock();
        let state = inner.get_or_insert_with(|| StoreInner {
            registered: 0,
            entries: LruCache::new(
                NonZeroUsize::new(self.count_limit.max(1))
                    .unwrap_or(NonZeroUsize::MIN),
            ),
            total_cost: 0,
        });
        state.registered += 1;
    }

    pub(crate) fn unregister_pipeline(&self) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.as_mut() {
            state.registered = state.registered.saturating_sub(1);
            if state.registered == 0 {
                *inner = None;
            }
        }
    }

    pub(crate) fn store(
        &self,
        pipeline_id: u64,
        image_id: &str,
        record: ResumableData,
    ) {
        let mut inner = self.inner.lock();
        let Some(state) = inner.as_mut() else {
            return;
        };
        let cost = record.data.len();
        debug!(image_id, bytes = cost, "stored resumable prefix");
        if let Some((_, displaced)) = state
            .entries
            .push((pipeline_id, image_id.to_owned()), record)
        {
            state.total_cost = state.total_cost.saturating_sub(
                displaced.data.len(),
            );
        }
        state.total_cost += cost;
        while state.total_cost > self.cost_limit {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.total_cost = state
                        .total_cost
                        .saturating_sub(evicted.data.len());
                }
                None => break,
            }
        }
    }

    /// Remove and return the record for this image, if any.
    pub(crate) fn take(
        &self,
        pipeline_id: u64,
        image_id: &str,
    ) -> Option<ResumableData> {
        let mut inner = self.inner.lock();
        let state = inner.as_mut()?;
        let record =
            state.entries.pop(&(pipeline_id, image_id.to_owned()))?;
        state.total_cost =
            state.total_cost.saturating_sub(record.data.len());
        Some(record)
    }

    /// Drop every record of one pipeline whose image id matches.
    pub(crate) fn remove_matching(
        &self,
        pipeline_id: u64,
        predicate: impl Fn(&str) -> bool,
    ) {
        let mut inner = self.inner.lock();
        let Some(state) = inner.as_mut() else {
            return;
        };
        let doomed: Vec<StoreKey> = state
            .entries
            .iter()
            .filter(|((owner, image_id), _)| {
                *owner == pipeline_id && predicate(image_id)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            if let Some(record) = state.entries.pop(&key) {
                state.total_cost =
                    state.total_cost.saturating_sub(record.data.len());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .as_ref()
            .map(|state| state.entries.len())
            .unwrap_or(0)
    }
}
