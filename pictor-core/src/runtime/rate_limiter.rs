//! Token-bucket gate for data-loading job starts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Work admitted by the limiter. Returning `false` means the work did
/// not actually start (its job died waiting) and the token is refunded.
pub(crate) type RateLimitedWork = Box<dyn FnOnce() -> bool + Send>;

pub(crate) const DEFAULT_RATE_PER_SECOND: f64 = 80.0;
pub(crate) const DEFAULT_BURST: f64 = 25.0;

/// Classic token bucket: capacity `burst`, refilled at `rate` tokens per
/// second, starting full. Eligible work runs inline; the rest queues
/// FIFO behind a scheduled drain, so submission order is preserved
/// across rate-limited starts.
pub(crate) struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    bucket: f64,
    last_refill: Instant,
    pending: VecDeque<RateLimitedWork>,
    drain_scheduled: bool,
}

impl RateLimiter {
    pub(crate) fn new(rate: f64, burst: f64) -> Arc<Self> {
        Arc::new(Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(LimiterState {
                bucket: burst,
                last_refill: Instant::now(),
                pending: VecDeque::new(),
                drain_scheduled: false,
            }),
        })
    }

    pub(crate) fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_RATE_PER_SECOND, DEFAULT_BURST)
    }

    /// Run `work` now if a token is available and nothing is already
    /// waiting; otherwise queue it for the next refill.
    pub(crate) fn execute(self: &Arc<Self>, work: RateLimitedWork) {
        let run_inline = {
            let mut state = self.state.lock();
            if state.pending.is_empty() && self.try_consume(&mut state) {
                true
            } else {
                state.pending.push_back(work);
                self.schedule_drain(&mut state);
                return;
            }
        };
        debug_assert!(run_inline);
        if !work() {
            self.refund();
        }
    }

    fn try_consume(&self, state: &mut LimiterState) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.bucket = (state.bucket + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
        if state.bucket >= 1.0 {
            state.bucket -= 1.0;
            true
        } else {
            false
        }
    }

    fn refund(&self) {
        let mut state = self.state.lock();
        state.bucket = (state.bucket + 1.0).min(self.burst);
    }

    fn schedule_drain(self: &Arc<Self>, state: &mut LimiterState) {
        if state.drain_scheduled {
            return;
        }
        state.drain_scheduled = true;
        let deficit = (1.0 - state.bucket).max(0.0);
        let wait = Duration::from_secs_f64(deficit / self.rate);
        trace!(?wait, pending = state.pending.len(), "rate limited");
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            this.drain();
        });
    }

    /// Walk the FIFO in order, stopping at the first item no token can
    /// cover; refunds from dead work keep later items eligible.
    fn drain(self: &Arc<Self>) {
        self.state.lock().drain_scheduled = false;
        loop {
            let work = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    return;
                }
                if !self.try_consume(&mut state) {
                    self.schedule_drain(&mut state);
                    return;
                }
                match state.pending.pop_front() {
                    Some(work) => work,
                    None => {
                        state.bucket =
                            (state.bucket + 1.0).min(self.burst);
                        return;
                    }
                }
            };
            if !work() {
                self.refund();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}
