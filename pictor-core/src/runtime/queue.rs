//! Priority-ordered, bounded-concurrency scheduler for pipeline side
//! effects (network, decode, encode, process, decompress).

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

use pictor_model::Priority;

/// A bounded scheduler. Queued items wait in per-priority buckets of an
/// arena-backed intrusive doubly-linked list: enqueue prepends at the
/// bucket head, dispatch pops the tail of the highest non-empty bucket,
/// so dispatch is strict-priority across buckets and FIFO within one.
#[derive(Clone)]
pub(crate) struct WorkQueue {
    inner: Arc<QueueInner>,
}

/// Handle to one scheduled item. Cancellation and priority changes stay
/// valid (and become no-ops) after the item finishes; generation counters
/// guard against arena slot reuse.
pub(crate) struct Operation {
    queue: Weak<QueueInner>,
    index: usize,
    generation: u64,
}

struct QueueInner {
    state: Mutex<QueueState>,
}

struct QueueState {
    max_concurrent: usize,
    suspended: bool,
    active: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
    buckets: [Bucket; Priority::COUNT],
}

#[derive(Clone, Copy, Default)]
struct Bucket {
    head: Option<usize>,
    tail: Option<usize>,
}

struct Slot {
    generation: u64,
    node: Option<Node>,
}

struct Node {
    priority: Priority,
    prev: Option<usize>,
    next: Option<usize>,
    /// Present while the item is queued.
    body: Option<BoxFuture<'static, ()>>,
    /// Present while the item is running.
    join: Option<JoinHandle<()>>,
    /// Whether the item occupies a concurrency slot (bypassed items
    /// do not).
    counted: bool,
}

impl WorkQueue {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    max_concurrent: max_concurrent.max(1),
                    suspended: false,
                    active: 0,
                    slots: Vec::new(),
                    free: Vec::new(),
                    buckets: [Bucket::default(); Priority::COUNT],
                }),
            }),
        }
    }

    /// Schedule an item; it runs now if capacity allows, later otherwise.
    pub(crate) fn enqueue(
        &self,
        priority: Priority,
        body: BoxFuture<'static, ()>,
    ) -> Operation {
        self.inner.enqueue(priority, body, false)
    }

    /// Run an item immediately, ignoring the concurrency limit and the
    /// suspension flag. Used by the skip-queue request option.
    pub(crate) fn enqueue_bypassing(
        &self,
        priority: Priority,
        body: BoxFuture<'static, ()>,
    ) -> Operation {
        self.inner.enqueue(priority, body, true)
    }

    pub(crate) fn suspend(&self) {
        self.inner.state.lock().suspended = true;
    }

    pub(crate) fn resume(&self) {
        let mut state = self.inner.state.lock();
        state.suspended = false;
        self.inner.dispatch_locked(&mut state);
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    #[cfg(test)]
    pub(crate) fn queued_count(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .filter(|slot| {
                slot.node.as_ref().is_some_and(|node| node.body.is_some())
            })
            .count()
    }
}

impl Operation {
    /// Move the item between buckets; no-op once it is running.
    pub(crate) fn set_priority(&self, priority: Priority) {
        if let Some(queue) = self.queue.upgrade() {
            queue.set_priority(self.index, self.generation, priority);
        }
    }

    /// Remove the item if still queued, abort it if running.
    pub(crate) fn cancel(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.cancel(self.index, self.generation);
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_priority(&self) -> Option<Priority> {
        let queue = self.queue.upgrade()?;
        let state = queue.state.lock();
        let slot = state.slots.get(self.index)?;
        if slot.generation != self.generation {
            return None;
        }
        slot.node
            .as_ref()
            .filter(|node| node.body.is_some())
            .map(|node| node.priority)
    }
}

impl QueueInner {
    fn enqueue(
        self: &Arc<Self>,
        priority: Priority,
        body: BoxFuture<'static, ()>,
        bypass: bool,
    ) -> Operation {
        let mut state = self.state.lock();
        let index = state.alloc(priority);
        let generation = state.slots[index].generation;

        if bypass {
            let handle = spawn_body(self.clone(), index, generation, body);
            state.node_mut(index).join = Some(handle);
        } else if !state.suspended && state.active < state.max_concurrent {
            state.active += 1;
            let handle = spawn_body(self.clone(), index, generation, body);
            let node = state.node_mut(index);
            node.counted = true;
            node.join = Some(handle);
        } else {
            state.node_mut(index).body = Some(body);
            state.link_front(index);
            trace!(priority = ?priority, "work item queued");
        }

        Operation { queue: Arc::downgrade(self), index, generation }
    }

    fn finish(self: &Arc<Self>, index: usize, generation: u64) {
        let mut state = self.state.lock();
        if state.slots[index].generation != generation {
            return;
        }
        let Some(node) = state.slots[index].node.take() else {
            return;
        };
        if node.counted {
            state.active -= 1;
        }
        state.release(index);
        self.dispatch_locked(&mut state);
    }

    fn dispatch_locked(self: &Arc<Self>, state: &mut QueueState) {
        while !state.suspended && state.active < state.max_concurrent {
            let Some(index) = state.pop_tail() else {
                break;
            };
            let generation = state.slots[index].generation;
            state.active += 1;
            let node = state.node_mut(index);
            node.counted = true;
            let body = node
                .body
                .take()
                .expect("queued node always carries its body");
            let handle = spawn_body(self.clone(), index, generation, body);
            state.node_mut(index).join = Some(handle);
        }
    }

    fn cancel(self: &Arc<Self>, index: usize, generation: u64) {
        let mut state = self.state.lock();
        if state.slots.get(index).map(|slot| slot.generation)
            != Some(generation)
        {
            return;
        }
        let is_queued = state.slots[index]
            .node
            .as_ref()
            .is_some_and(|node| node.body.is_some());
        if is_queued {
            state.unlink(index);
            state.release(index);
        } else {
            let join = state.slots[index]
                .node
                .as_mut()
                .and_then(|node| node.join.take());
            if let Some(join) = join {
                // The finish guard inside the spawned task releases the
                // slot and frees the concurrency credit once the abort
                // lands.
                join.abort();
            }
        }
    }

    fn set_priority(&self, index: usize, generation: u64, priority: Priority) {
        let mut state = self.state.lock();
        if state.slots.get(index).map(|slot| slot.generation)
            != Some(generation)
        {
            return;
        }
        let Some(node) = state.slots[index].node.as_ref() else {
            return;
        };
        if node.body.is_none() || node.priority == priority {
            // Already running, or nothing to move.
            return;
        }
        state.unlink(index);
        state.node_mut(index).priority = priority;
        state.link_front(index);
    }
}

fn spawn_body(
    queue: Arc<QueueInner>,
    index: usize,
    generation: u64,
    body: BoxFuture<'static, ()>,
) -> JoinHandle<()> {
    // The guard is created before the spawn so an abort that lands before
    // the first poll still releases the slot when the future is dropped.
    let guard = FinishGuard { queue, index, generation };
    tokio::spawn(async move {
        let _guard = guard;
        body.await;
    })
}

struct FinishGuard {
    queue: Arc<QueueInner>,
    index: usize,
    generation: u64,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.queue.finish(self.index, self.generation);
    }
}

impl QueueState {
    fn alloc(&mut self, priority: Priority) -> usize {
        let node = Node {
            priority,
            prev: None,
            next: None,
            body: None,
            join: None,
            counted: false,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot { generation: 0, node: Some(node) });
                self.slots.len() - 1
            }
        }
    }

    /// Invalidate outstanding handles and return the slot to the arena.
    fn release(&mut self, index: usize) {
        self.slots[index].node = None;
        self.slots[index].generation += 1;
        self.free.push(index);
    }

    fn node_mut(&mut self, index: usize) -> &mut Node {
        self.slots[index]
            .node
            .as_mut()
            .expect("arena slot holds a live node")
    }

    fn link_front(&mut self, index: usize) {
        let priority = self
            .slots[index]
            .node
            .as_ref()
            .expect("arena slot holds a live node")
            .priority;
        let bucket = priority.index();
        let old_head = self.buckets[bucket].head;
        {
            let node = self.node_mut(index);
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(head) => self.node_mut(head).prev = Some(index),
            None => self.buckets[bucket].tail = Some(index),
        }
        self.buckets[bucket].head = Some(index);
    }

    fn unlink(&mut self, index: usize) {
        let (priority, prev, next) = {
            let node = self.slots[index]
                .node
                .as_ref()
                .expect("arena slot holds a live node");
            (node.priority, node.prev, node.next)
        };
        let bucket = priority.index();
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.buckets[bucket].head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.buckets[bucket].tail = prev,
        }
        let node = self.node_mut(index);
        node.prev = None;
        node.next = None;
    }

    fn pop_tail(&mut self) -> Option<usize> {
        for bucket in (0..Priority::COUNT).rev() {
            if let Some(tail) = self.buckets[bucket].tail {
                self.unlink(tail);
                return Some(tail);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::WorkQueue;
    use pictor_model::Priority;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};

    fn tagged_body(
        tag: &'static str,
        done: mpsc::UnboundedSender<&'static str>,
    ) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(async move {
            let _ = done.send(tag);
        })
    }

    fn blocker(
        gate: Arc<Notify>,
    ) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(async move {
            gate.notified().await;
        })
    }

    #[tokio::test]
    async fn dispatches_strictly_by_priority() {
        let queue = WorkQueue::new(1);
        let gate = Arc::new(Notify::new());
        let _running = queue.enqueue(Priority::Normal, blocker(gate.clone()));
        tokio::task::yield_now().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _low = queue.enqueue(Priority::Low, tagged_body("low", tx.clone()));
        let _high =
            queue.enqueue(Priority::High, tagged_body("high", tx.clone()));
        let _normal = queue
            .enqueue(Priority::Normal, tagged_body("normal", tx.clone()));

        gate.notify_one();
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, ["high", "normal", "low"]);
    }

    #[tokio::test]
    async fn fifo_within_a_priority_bucket() {
        let queue = WorkQueue::new(1);
        let gate = Arc::new(Notify::new());
        let _running = queue.enqueue(Priority::Normal, blocker(gate.clone()));
        tokio::task::yield_now().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _a = queue.enqueue(Priority::Normal, tagged_body("a", tx.clone()));
        let _b = queue.enqueue(Priority::Normal, tagged_body("b", tx.clone()));

        gate.notify_one();
        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, Some("b"));
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let queue = WorkQueue::new(2);
        let gate = Arc::new(Notify::new());
        for _ in 0..4 {
            let _ = queue.enqueue(Priority::Normal, blocker(gate.clone()));
        }
        tokio::task::yield_now().await;
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.queued_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_queued_items_never_run() {
        let queue = WorkQueue::new(1);
        let gate = Arc::new(Notify::new());
        let _running = queue.enqueue(Priority::Normal, blocker(gate.clone()));
        tokio::task::yield_now().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancelled =
            queue.enqueue(Priority::High, tagged_body("dead", tx.clone()));
        let _live = queue.enqueue(Priority::Low, tagged_body("live", tx));
        cancelled.cancel();

        gate.notify_one();
        assert_eq!(rx.recv().await, Some("live"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn priority_update_moves_between_buckets() {
        let queue = WorkQueue::new(1);
        let gate = Arc::new(Notify::new());
        let _running = queue.enqueue(Priority::Normal, blocker(gate.clone()));
        tokio::task::yield_now().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let promoted =
            queue.enqueue(Priority::VeryLow, tagged_body("promoted", tx.clone()));
        let _other =
            queue.enqueue(Priority::Normal, tagged_body("other", tx));
        assert_eq!(promoted.queued_priority(), Some(Priority::VeryLow));
        promoted.set_priority(Priority::VeryHigh);
        assert_eq!(promoted.queued_priority(), Some(Priority::VeryHigh));

        gate.notify_one();
        assert_eq!(rx.recv().await, Some("promoted"));
        assert_eq!(rx.recv().await, Some("other"));
    }

    #[tokio::test]
    async fn suspension_holds_work_until_resume() {
        let queue = WorkQueue::new(2);
        queue.suspend();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _item = queue.enqueue(Priority::High, tagged_body("ran", tx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        queue.resume();
        assert_eq!(rx.recv().await, Some("ran"));
    }

    #[tokio::test]
    async fn bypass_ignores_suspension_and_limits() {
        let queue = WorkQueue::new(1);
        queue.suspend();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _item =
            queue.enqueue_bypassing(Priority::Low, tagged_body("ran", tx));
        assert_eq!(rx.recv().await, Some("ran"));
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn aborting_running_item_frees_capacity() {
        let queue = WorkQueue::new(1);
        let gate = Arc::new(Notify::new());
        let running = queue.enqueue(Priority::Normal, blocker(gate));
        tokio::task::yield_now().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _next = queue.enqueue(Priority::Normal, tagged_body("next", tx));
        running.cancel();
        assert_eq!(rx.recv().await, Some("next"));
    }
}
