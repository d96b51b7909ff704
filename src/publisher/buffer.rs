//! Bounded outbound queue between publishers and the drain task
//!
//! Capacity is enforced with a semaphore. A slot is taken when a message is
//! submitted and only returned once the drain task has finished with that
//! message (sent it or given up on it), so a message being sent still counts
//! against capacity.

use crate::message::OutboundMessage;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, TryAcquireError};

const PREALLOCATED_SLOTS: usize = 64;

/// What a full buffer does to a new submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackPressurePolicy {
    /// Reject immediately
    Reject,
    /// Wait up to the given time for a free slot, then reject
    Block(Duration),
}

/// Why a message did not reach the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishFailureCause {
    BufferFull,
    NotConnected,
    Terminated,
    TransportRejected,
}

impl fmt::Display for PublishFailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PublishFailureCause::BufferFull => "buffer full",
            PublishFailureCause::NotConnected => "not connected",
            PublishFailureCause::Terminated => "publisher terminated",
            PublishFailureCause::TransportRejected => "transport rejected the message",
        };
        f.write_str(text)
    }
}

/// Synchronous result of a publish call; says nothing about broker delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    Rejected { reason: PublishFailureCause },
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PublishOutcome::Accepted)
    }
}

/// A submission the buffer refused, handed back to the caller
#[derive(Debug)]
pub struct Rejected {
    pub cause: PublishFailureCause,
    pub message: OutboundMessage,
}

pub struct BackpressureBuffer {
    queue: Mutex<VecDeque<OutboundMessage>>,
    slots: Semaphore,
    occupied: AtomicUsize,
    available: Notify,
    idle: Notify,
    closed: AtomicBool,
    capacity: usize,
    policy: BackPressurePolicy,
}

impl fmt::Debug for BackpressureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureBuffer")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("occupied", &self.occupied())
            .finish()
    }
}

impl BackpressureBuffer {
    /// # Panics
    ///
    /// If `capacity` exceeds [`Semaphore::MAX_PERMITS`]. Publisher configs
    /// are validated against a much lower bound before a buffer is built.
    pub fn new(capacity: usize, policy: BackPressurePolicy) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(PREALLOCATED_SLOTS))),
            slots: Semaphore::new(capacity),
            occupied: AtomicUsize::new(0),
            available: Notify::new(),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackPressurePolicy {
        self.policy
    }

    /// Messages queued or being sent
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    /// Messages queued and not yet picked up by the drain task
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take a slot according to the policy and enqueue the message
    pub async fn submit(&self, message: OutboundMessage) -> Result<(), Rejected> {
        let permit = match self.policy {
            BackPressurePolicy::Reject => match self.slots.try_acquire() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    return Err(Rejected {
                        cause: PublishFailureCause::BufferFull,
                        message,
                    })
                }
                Err(TryAcquireError::Closed) => {
                    return Err(Rejected {
                        cause: PublishFailureCause::Terminated,
                        message,
                    })
                }
            },
            BackPressurePolicy::Block(wait) => {
                match tokio::time::timeout(wait, self.slots.acquire()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(Rejected {
                            cause: PublishFailureCause::Terminated,
                            message,
                        })
                    }
                    Err(_) => {
                        return Err(Rejected {
                            cause: PublishFailureCause::BufferFull,
                            message,
                        })
                    }
                }
            }
        };

        // Returned through `complete` once the drain task is done with it
        permit.forget();
        self.occupied.fetch_add(1, Ordering::AcqRel);
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
        self.available.notify_one();
        Ok(())
    }

    /// Wait for the next message; `None` once closed and empty
    pub async fn next(&self) -> Option<OutboundMessage> {
        loop {
            if let Some(message) = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            self.available.notified().await;
        }
    }

    /// Put a message that was taken but not finished back at the front
    pub fn requeue_front(&self, message: OutboundMessage) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(message);
        self.available.notify_one();
    }

    /// Release the slot held by a message the drain task finished with
    pub fn complete(&self) {
        self.release(1);
    }

    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.slots.add_permits(count);
        let before = self.occupied.fetch_sub(count, Ordering::AcqRel);
        if before == count {
            self.idle.notify_waiters();
        }
    }

    /// Resolve once nothing is queued or in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.occupied() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new submissions; blocked submitters fail with `Terminated`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        self.available.notify_one();
    }

    /// Remove everything still queued, releasing the slots
    pub fn drain_remaining(&self) -> Vec<OutboundMessage> {
        let remaining: Vec<_> = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        self.release(remaining.len());
        remaining
    }
}
