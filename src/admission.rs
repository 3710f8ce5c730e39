//! Admission control: the concurrent session budget and the live session count.
//!
//! Slots and session guards are released by `Drop`, so a session task
//! gives them back on every exit path, including a panic.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// Fixed-capacity pool of session slots
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// One held slot; dropping it returns the slot to the pool
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot if one is free. Never waits.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionSlot { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }
}

/// Counts running sessions and lets shutdown wait for them to finish
#[derive(Clone)]
pub struct SessionTracker {
    active: Arc<watch::Sender<usize>>,
}

/// Marks one running session; dropping it ends the session
#[derive(Debug)]
pub struct SessionGuard {
    active: Arc<watch::Sender<usize>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            active: Arc::new(active),
        }
    }

    /// Register a new session. Returns the guard and the count including it.
    pub fn enter(&self) -> (SessionGuard, usize) {
        let mut count = 0;
        self.active.send_modify(|n| {
            *n += 1;
            count = *n;
        });
        (
            SessionGuard {
                active: Arc::clone(&self.active),
            },
            count,
        )
    }

    /// Sessions currently running
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until no sessions are running, for at most `grace`.
    /// Returns `true` if the count reached zero in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let mut rx = self.active.subscribe();
        tokio::time::timeout(grace, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|changed| changed.is_ok())
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGuard {
    /// Sessions still running once this one finishes
    pub fn remaining(&self) -> usize {
        self.active.borrow().saturating_sub(1)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}
