// ABOUTME: Pool-wide request queue bounding concurrency and waiting requests
//
// A fair (FIFO) tokio semaphore holds one permit per concurrent request. When
// every permit is taken a request may wait, but only while fewer than
// `max_waiting` others are already waiting; beyond that it is rejected at once.
// Dropping a waiting acquire (timeout) removes it from the queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::error::{ResilienceError, Result};

/// Occupancy of the request queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub in_flight: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
    pub max_waiting: usize,
}

/// Held while a request executes; releases its slot on drop
#[derive(Debug)]
pub struct RequestPermit {
    _permit: OwnedSemaphorePermit,
}

/// Decrements the waiting count when a queued request leaves the queue
struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// FIFO request queue with a concurrency cap and a bounded wait list
#[derive(Debug)]
pub struct RequestQueue {
    slots: Arc<Semaphore>,
    max_concurrent: AtomicUsize,
    max_waiting: AtomicUsize,
    waiting: AtomicUsize,
}

impl RequestQueue {
    pub fn new(max_concurrent: usize, max_waiting: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent: AtomicUsize::new(max_concurrent),
            max_waiting: AtomicUsize::new(max_waiting),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Take a slot, waiting in line if the pool is busy
    ///
    /// Rejects with [`ResilienceError::QueueFull`] when the wait list is full
    /// and [`ResilienceError::ShuttingDown`] once the queue is closed.
    pub async fn acquire(&self) -> Result<RequestPermit> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => return Ok(RequestPermit { _permit: permit }),
            Err(TryAcquireError::Closed) => return Err(ResilienceError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {}
        }

        let max_waiting = self.max_waiting.load(Ordering::SeqCst);
        if self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |waiting| {
                (waiting < max_waiting).then_some(waiting + 1)
            })
            .is_err()
        {
            debug!(capacity = max_waiting, "Request queue full, rejecting");
            return Err(ResilienceError::QueueFull {
                capacity: max_waiting,
            });
        }

        let _waiting = Waiting(&self.waiting);
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map(|permit| RequestPermit { _permit: permit })
            .map_err(|_| ResilienceError::ShuttingDown)
    }

    /// Change both limits; shrinking takes effect as running requests finish
    pub fn resize(&self, max_concurrent: usize, max_waiting: usize) {
        self.max_waiting.store(max_waiting, Ordering::SeqCst);

        let previous = self.max_concurrent.swap(max_concurrent, Ordering::SeqCst);
        if max_concurrent > previous {
            self.slots.add_permits(max_concurrent - previous);
        } else if max_concurrent < previous {
            let surplus = u32::try_from(previous - max_concurrent).unwrap_or(u32::MAX);
            match Arc::clone(&self.slots).try_acquire_many_owned(surplus) {
                Ok(permits) => permits.forget(),
                Err(_) => {
                    // Retire the surplus as in-flight requests release their slots
                    let slots = Arc::clone(&self.slots);
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            if let Ok(permits) = slots.acquire_many_owned(surplus).await {
                                permits.forget();
                            }
                        });
                    }
                }
            }
        }
    }

    /// Stop admitting requests; waiters are released with `ShuttingDown`
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn status(&self) -> QueueStatus {
        let max_concurrent = self.max_concurrent.load(Ordering::SeqCst);
        QueueStatus {
            in_flight: max_concurrent.saturating_sub(self.slots.available_permits()),
            waiting: self.waiting.load(Ordering::SeqCst),
            max_concurrent,
            max_waiting: self.max_waiting.load(Ordering::SeqCst),
        }
    }
}
