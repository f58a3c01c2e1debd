//! Closes a process's spool file after a period without writes.
//!
//! At most one closer thread runs per writer. It is started lazily after a
//! successful write, closes the file once the writer has been idle long
//! enough, and then exits, freeing its slot for the next write.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

/// How often the closer re-checks the activity timestamp.
pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// Millisecond timestamp of the last successful write.
#[derive(Debug, Default)]
pub struct ActivityClock {
    last_ms: AtomicI64,
}

impl ActivityClock {
    pub fn new() -> Self {
        let clock = Self::default();
        clock.touch();
        clock
    }

    pub fn touch(&self) {
        self.touch_at(Utc::now().timestamp_millis());
    }

    pub fn touch_at(&self, now_ms: i64) {
        self.last_ms.store(now_ms, Ordering::Release);
    }

    pub fn last_ms(&self) -> i64 {
        self.last_ms.load(Ordering::Acquire)
    }
}

/// True when at least `idle` has passed between `last_ms` and `now_ms`.
pub fn idle_elapsed(last_ms: i64, now_ms: i64, idle: Duration) -> bool {
    let idle_ms = i64::try_from(idle.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(last_ms) >= idle_ms
}

/// Single-slot spawner for the closer thread.
#[derive(Debug, Clone)]
pub struct AutoCloser {
    active: Arc<AtomicBool>,
    tick: Duration,
}

impl Default for AutoCloser {
    fn default() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }
}

/// Clears the slot when the closer thread exits, however it exits.
struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AutoCloser {
    pub fn with_tick(tick: Duration) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            tick,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Starts a closer for `file` unless one is already running.
    ///
    /// The closer takes the value out of `file` (dropping it) once
    /// `activity` is older than `idle`. Returns true if a thread was
    /// started.
    pub fn ensure_running<T: Send + 'static>(
        &self,
        file: Arc<Mutex<Option<T>>>,
        activity: Arc<ActivityClock>,
        idle: Duration,
    ) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let guard = SlotGuard(self.active.clone());
        let tick = self.tick;
        let spawned = thread::Builder::new()
            .name("audit-autoclose".to_string())
            .spawn(move || {
                let _guard = guard;
                close_when_idle(&file, &activity, idle, tick);
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                // The guard moved into the failed closure was dropped with it.
                warn!(error = %e, "failed to start idle spool file closer");
                false
            }
        }
    }
}

fn close_when_idle<T>(
    file: &Mutex<Option<T>>,
    activity: &ActivityClock,
    idle: Duration,
    tick: Duration,
) {
    loop {
        thread::sleep(tick);

        // Writers touch the clock while holding the file lock, so the
        // check and the close see the same activity.
        let mut slot = file.lock().unwrap_or_else(PoisonError::into_inner);
        if idle_elapsed(activity.last_ms(), Utc::now().timestamp_millis(), idle) {
            if slot.take().is_some() {
                debug!(idle_ms = idle.as_millis() as u64, "closed idle spool file");
            }
            return;
        }
    }
}
