//! Rate-limited query queue.
//!
//! Gates how many aggregated relay queries may be in flight at once for each
//! source group. Tasks that cannot start immediately wait in one of three FIFO
//! buckets; a freed slot goes to the oldest high-priority waiter, then medium,
//! then low. A running task is never preempted and the queue never retries.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use metrics::{gauge, histogram};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cache::lock::mutex_lock;

const SOURCE: &str = "queue";
const DEFAULT_CONCURRENCY: usize = 3;
const METRIC_QUEUE_WAIT_MS: &str = "relaycache_queue_wait_ms";
const METRIC_QUEUE_DEPTH: &str = "relaycache_queue_depth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    fn bucket(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Slots per source group unless overridden.
    pub default_concurrency: NonZeroUsize,
    /// Per-group overrides.
    pub group_concurrency: HashMap<String, NonZeroUsize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_concurrency: NonZeroUsize::new(DEFAULT_CONCURRENCY)
                .unwrap_or(NonZeroUsize::MIN),
            group_concurrency: HashMap::new(),
        }
    }
}

impl QueueConfig {
    pub fn with_group_limit(mut self, group: impl Into<String>, limit: NonZeroUsize) -> Self {
        self.group_concurrency.insert(group.into(), limit);
        self
    }

    pub fn limit_for(&self, group: &str) -> usize {
        self.group_concurrency
            .get(group)
            .copied()
            .unwrap_or(self.default_concurrency)
            .get()
    }
}

/// Snapshot of one source group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub group: String,
    pub limit: usize,
    pub in_flight: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub groups: Vec<GroupStats>,
}

impl QueueStats {
    pub fn in_flight(&self) -> usize {
        self.groups.iter().map(|group| group.in_flight).sum()
    }

    pub fn queued(&self) -> usize {
        self.groups.iter().map(|group| group.queued).sum()
    }
}

pub struct QueryQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    groups: Mutex<HashMap<String, GroupState>>,
}

#[derive(Default)]
struct GroupState {
    in_flight: usize,
    waiting: [VecDeque<oneshot::Sender<Slot>>; 3],
}

impl GroupState {
    fn queued(&self) -> usize {
        self.waiting.iter().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<oneshot::Sender<Slot>> {
        self.waiting.iter_mut().find_map(VecDeque::pop_front)
    }
}

/// An occupied concurrency slot. Dropping it hands the slot to the next
/// waiter of the same group, or frees it.
struct Slot {
    inner: Arc<QueueInner>,
    group: String,
    armed: bool,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(&self.group);
        }
    }
}

impl QueryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                groups: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Run `task` once a slot in `source_group` is free and return its output.
    ///
    /// The slot is released when the task settles, whether it succeeded,
    /// failed, or the returned future was dropped.
    pub async fn enqueue<F, T>(&self, source_group: &str, priority: Priority, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let queued_at = Instant::now();
        let _slot = self.acquire(source_group, priority).await;
        histogram!(METRIC_QUEUE_WAIT_MS, "priority" => priority.as_str())
            .record(queued_at.elapsed().as_secs_f64() * 1000.0);
        trace!(source_group, priority = priority.as_str(), "Queue task started");
        task.await
    }

    async fn acquire(&self, group: &str, priority: Priority) -> Slot {
        loop {
            let receiver = {
                let mut groups = mutex_lock(&self.inner.groups, SOURCE, "acquire");
                let limit = self.inner.config.limit_for(group);
                let state = groups.entry(group.to_string()).or_default();

                if state.in_flight < limit && state.queued() == 0 {
                    state.in_flight += 1;
                    return Slot {
                        inner: Arc::clone(&self.inner),
                        group: group.to_string(),
                        armed: true,
                    };
                }

                let (sender, receiver) = oneshot::channel();
                state.waiting[priority.bucket()].push_back(sender);
                let queued = state.queued();
                gauge!(METRIC_QUEUE_DEPTH, "source_group" => group.to_string()).set(queued as f64);
                debug!(
                    source_group = group,
                    priority = priority.as_str(),
                    queued,
                    in_flight = state.in_flight,
                    "Queue task waiting for slot"
                );
                receiver
            };

            // A closed channel means the waiter was discarded without a slot;
            // queue up again rather than run unthrottled.
            if let Ok(slot) = receiver.await {
                return slot;
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let groups = mutex_lock(&self.inner.groups, SOURCE, "stats");
        let mut stats: Vec<GroupStats> = groups
            .iter()
            .map(|(group, state)| GroupStats {
                group: group.clone(),
                limit: self.inner.config.limit_for(group),
                in_flight: state.in_flight,
                queued: state.queued(),
            })
            .collect();
        stats.sort_by(|a, b| a.group.cmp(&b.group));
        QueueStats { groups: stats }
    }

    pub fn group_stats(&self, group: &str) -> GroupStats {
        let groups = mutex_lock(&self.inner.groups, SOURCE, "group_stats");
        let (in_flight, queued) = groups
            .get(group)
            .map(|state| (state.in_flight, state.queued()))
            .unwrap_or_default();
        GroupStats {
            group: group.to_string(),
            limit: self.inner.config.limit_for(group),
            in_flight,
            queued,
        }
    }
}

impl QueueInner {
    fn release(self: &Arc<Self>, group: &str) {
        let mut groups = mutex_lock(&self.groups, SOURCE, "release");
        let Some(state) = groups.get_mut(group) else {
            return;
        };

        while let Some(waiter) = state.pop_next() {
            let slot = Slot {
                inner: Arc::clone(self),
                group: group.to_string(),
                armed: true,
            };
            match waiter.send(slot) {
                Ok(()) => {
                    gauge!(METRIC_QUEUE_DEPTH, "source_group" => group.to_string())
                        .set(state.queued() as f64);
                    return;
                }
                // Waiter went away; the returned slot must not release again
                // while this lock is held.
                Err(mut slot) => slot.armed = false,
            }
        }

        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            groups.remove(group);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn queue_with_limit(group: &str, limit: usize) -> Arc<QueryQueue> {
        let limit = NonZeroUsize::new(limit).expect("non-zero limit");
        Arc::new(QueryQueue::new(
            QueueConfig::default().with_group_limit(group, limit),
        ))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn runs_immediately_when_slot_free() {
        let queue = QueryQueue::new(QueueConfig::default());
        let value = queue.enqueue("relays-a", Priority::Low, async { 41 + 1 }).await;
        assert_eq!(value, 42);
        assert_eq!(queue.stats().in_flight(), 0);
    }

    #[tokio::test]
    async fn high_then_medium_then_low_under_single_slot() {
        let queue = queue_with_limit("x", 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (open_gate, gate) = oneshot::channel::<()>();

        let first = {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                queue
                    .enqueue("x", Priority::High, async move {
                        order.lock().expect("order lock").push("high");
                        let _ = gate.await;
                    })
                    .await
            })
        };
        wait_until(|| queue.group_stats("x").in_flight == 1).await;

        let mut waiters = Vec::new();
        for (expected_queued, priority) in [(1, Priority::Low), (2, Priority::Medium)] {
            let queue_for_task = Arc::clone(&queue);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                queue_for_task
                    .enqueue("x", priority, async move {
                        order.lock().expect("order lock").push(priority.as_str());
                    })
                    .await
            }));
            wait_until(|| queue.group_stats("x").queued == expected_queued).await;
        }

        open_gate.send(()).expect("gate receiver alive");
        first.await.expect("first task");
        for waiter in waiters {
            waiter.await.expect("queued task");
        }

        assert_eq!(
            *order.lock().expect("order lock"),
            vec!["high", "medium", "low"]
        );
        assert_eq!(queue.group_stats("x").in_flight, 0);
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected_per_group() {
        let queue = queue_with_limit("busy", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    queue
                        .enqueue("busy", Priority::Medium, async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn groups_do_not_share_slots() {
        let queue = queue_with_limit("a", 1);
        let (open_gate, gate) = oneshot::channel::<()>();

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .enqueue("a", Priority::High, async move {
                        let _ = gate.await;
                    })
                    .await
            })
        };
        wait_until(|| queue.group_stats("a").in_flight == 1).await;

        let other = queue.enqueue("b", Priority::Low, async { "ran" }).await;
        assert_eq!(other, "ran");

        open_gate.send(()).expect("gate receiver alive");
        blocked.await.expect("blocked task");
    }

    #[tokio::test]
    async fn failed_task_frees_its_slot() {
        let queue = queue_with_limit("x", 1);
        let failed: Result<(), &str> = queue
            .enqueue("x", Priority::High, async { Err("relay closed") })
            .await;
        assert!(failed.is_err());

        let next = queue.enqueue("x", Priority::Low, async { 7 }).await;
        assert_eq!(next, 7);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_slot() {
        let queue = queue_with_limit("x", 1);
        let (open_gate, gate) = oneshot::channel::<()>();

        let holder = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .enqueue("x", Priority::High, async move {
                        let _ = gate.await;
                    })
                    .await
            })
        };
        wait_until(|| queue.group_stats("x").in_flight == 1).await;

        let abandoned = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue("x", Priority::High, async {}).await })
        };
        wait_until(|| queue.group_stats("x").queued == 1).await;
        abandoned.abort();
        let _ = abandoned.await;

        open_gate.send(()).expect("gate receiver alive");
        holder.await.expect("holder");

        let value = queue.enqueue("x", Priority::Low, async { 1 }).await;
        assert_eq!(value, 1);
        assert_eq!(queue.group_stats("x").in_flight, 0);
    }
}
