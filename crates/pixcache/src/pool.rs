//! # Priority worker pool
//!
//! A counting pool with a fixed number of permits. Unlike `tokio::sync::Semaphore`
//! admission is ordered by [`Priority`] first and arrival order second, so a
//! high-priority image request jumps ahead of queued background work.
//!
//! Permits are handed directly from a releasing task to the next waiter. A waiter
//! that gave up (its future was dropped) is skipped, and a permit that lands in an
//! abandoned channel is returned to the pool when the channel is dropped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::trace;

use crate::sync::GuardedState;

/// Scheduling hint for pool admission. Higher variants are admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

struct Waiter {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<PoolPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: highest priority wins, then the lowest sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct PoolState {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

struct PoolInner {
    name: &'static str,
    capacity: usize,
    state: GuardedState<PoolState>,
}

impl PoolInner {
    fn release(self: &Arc<Self>) {
        self.state.write(|state| {
            while let Some(waiter) = state.waiters.pop() {
                let permit = PoolPermit {
                    pool: Some(Arc::clone(self)),
                };
                match waiter.tx.send(permit) {
                    Ok(()) => return,
                    // Waiter went away; disarm the returned permit and try the next one.
                    Err(mut returned) => returned.pool = None,
                }
            }
            state.available += 1;
        });
    }
}

/// Admission ticket; the slot is released when the permit is dropped.
pub struct PoolPermit {
    pool: Option<Arc<PoolInner>>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            trace!(pool = pool.name, "Releasing pool permit");
            pool.release();
        }
    }
}

enum Admission {
    Granted,
    Queued(oneshot::Receiver<PoolPermit>),
}

/// Bounded worker pool with priority admission.
#[derive(Clone)]
pub struct PriorityPool {
    inner: Arc<PoolInner>,
}

impl PriorityPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                state: GuardedState::new(PoolState {
                    available: capacity,
                    ..Default::default()
                }),
            }),
        }
    }

    /// Wait for a slot. Dropping the returned future before it resolves gives up
    /// the place in the queue without leaking a slot.
    pub async fn acquire(&self, priority: Priority) -> PoolPermit {
        let admission = self.inner.state.write(|state| {
            if state.available > 0 {
                state.available -= 1;
                return Admission::Granted;
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { priority, seq, tx });
            Admission::Queued(rx)
        });

        match admission {
            Admission::Granted => PoolPermit {
                pool: Some(Arc::clone(&self.inner)),
            },
            Admission::Queued(rx) => {
                trace!(pool = self.inner.name, ?priority, "Queued for pool permit");
                // The sender lives inside the pool we hold a reference to, so the
                // channel can only close after a send.
                rx.await.unwrap_or(PoolPermit { pool: None })
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently held.
    pub fn active(&self) -> usize {
        self.inner.capacity - self.inner.state.read(|s| s.available)
    }

    pub fn available(&self) -> usize {
        self.inner.state.read(|s| s.available)
    }

    /// Tasks waiting for admission.
    pub fn queued(&self) -> usize {
        self.inner.state.read(|s| s.waiters.len())
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

impl fmt::Debug for PriorityPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("active", &self.active())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_queued(pool: &PriorityPool, n: usize) {
        while pool.queued() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let pool = PriorityPool::new("test", 2);
        let a = pool.acquire(Priority::Normal).await;
        let _b = pool.acquire(Priority::Normal).await;
        assert_eq!(pool.active(), 2);
        assert_eq!(pool.available(), 0);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _p = pool.acquire(Priority::Normal).await;
            })
        };
        wait_queued(&pool, 1).await;
        assert!(!waiter.is_finished());

        drop(a);
        waiter.await.unwrap();
        assert_eq!(pool.active(), 1);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_admission() {
        let pool = PriorityPool::new("test", 1);
        let holder = pool.acquire(Priority::Normal).await;
        let order = Arc::new(GuardedState::new(Vec::new()));

        let priorities = [
            Priority::Low,
            Priority::High,
            Priority::Normal,
            Priority::High,
        ];
        let mut tasks = Vec::new();
        for (i, priority) in priorities.into_iter().enumerate() {
            let pool_clone = pool.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = pool_clone.acquire(priority).await;
                order.write(|o| o.push(i));
            }));
            wait_queued(&pool, i + 1).await;
        }

        drop(holder);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(order.read(|o| o.clone()), vec![1, 3, 2, 0]);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_leak_permit() {
        let pool = PriorityPool::new("test", 1);
        let holder = pool.acquire(Priority::Normal).await;

        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _p = pool.acquire(Priority::VeryHigh).await;
            })
        };
        wait_queued(&pool, 1).await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(holder);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.queued(), 0);
    }
}
