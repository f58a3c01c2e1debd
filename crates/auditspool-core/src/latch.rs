//! Wake-up latch for the rotation scheduler.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A boolean that one side sets and another side waits on.
///
/// Setting an already-set latch is a no-op; the waiter resets it after
/// waking, so any number of `set` calls between two waits collapse into
/// one wake-up.
#[derive(Debug, Default)]
pub struct Latch {
    is_set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut is_set = self.is_set.lock().unwrap_or_else(PoisonError::into_inner);
        *is_set = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.is_set.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_set(&self) -> bool {
        *self.is_set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the latch is set or `timeout` elapses.
    ///
    /// Returns true if the latch was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut is_set = self.is_set.lock().unwrap_or_else(PoisonError::into_inner);
        while !*is_set {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            is_set = self
                .cond
                .wait_timeout(is_set, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *is_set
    }
}
