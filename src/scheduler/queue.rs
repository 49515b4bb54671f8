//! Bounded concurrency queue: admits at most `N` concurrent supervisors.
//!
//! A supervisor **holds** a slot from claim until the earlier of: first
//! transition to `awaiting_input`, or process exit. Without this early
//! release, long awaiting-input sessions would drain the pool — a
//! supervisor waiting on the next user message is not doing active work.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub struct SlotQueue {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held scheduling slot. Dropping it releases the slot back to the
/// queue; `release()` is an explicit early-release for the "reached
/// awaiting_input" case so the caller doesn't need to juggle lifetimes.
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
}

impl Slot {
    pub fn release(&mut self) {
        if self.permit.take().is_some() {
            debug!("slot released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

impl SlotQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquire a slot, waiting if the queue is at capacity. The returned
    /// `Slot` must be held by the supervisor's task; drop or call
    /// `release()` at the earlier of awaiting-input or exit (§4.8).
    pub async fn acquire(self: &Arc<Self>) -> Slot {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        Slot {
            permit: Some(permit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_at_most_capacity_concurrent_slots() {
        let queue = SlotQueue::new(2);
        let s1 = queue.acquire().await;
        let s2 = queue.acquire().await;
        assert_eq!(queue.available(), 0);

        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move {
            let _s3 = queue2.acquire().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(s1);
        waiter.await.unwrap();
        drop(s2);
    }

    #[tokio::test]
    async fn early_release_frees_the_slot_before_drop() {
        let queue = SlotQueue::new(1);
        let mut slot = queue.acquire().await;
        assert_eq!(queue.available(), 0);
        slot.release();
        assert_eq!(queue.available(), 1);
        assert!(!slot.is_held());
    }
}
