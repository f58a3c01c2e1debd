//! Background rotation loop, one per process group.
//!
//! The loop sleeps on the shared wake-up latch. Writers set the latch when
//! the size threshold trips; the handle sets it for reload and shutdown
//! requests. A missed wake-up heals within one poll interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, warn};

use crate::config::{ConfigProvider, SpoolConfig};
use crate::shared::SharedRotationState;

/// Poll interval for hourly or slower rotation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Poll interval when rotating more often than hourly.
pub const SHORT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Picks the poll interval for `config`.
pub fn poll_interval(config: &SpoolConfig) -> Duration {
    if config.rotation_age_minutes < 60 {
        SHORT_POLL_INTERVAL
    } else {
        DEFAULT_POLL_INTERVAL
    }
}

#[derive(Debug, Default)]
struct Control {
    reload: AtomicBool,
    shutdown: AtomicBool,
}

pub struct RotationScheduler {
    shared: Arc<SharedRotationState>,
    config: Arc<dyn ConfigProvider>,
    control: Arc<Control>,
    interval_override: Option<Duration>,
}

impl RotationScheduler {
    /// Starts the loop on a dedicated thread.
    pub fn spawn(
        shared: Arc<SharedRotationState>,
        config: Arc<dyn ConfigProvider>,
    ) -> std::io::Result<SchedulerHandle> {
        Self::spawn_with_interval(shared, config, None)
    }

    /// Like [`spawn`](Self::spawn) with a fixed poll interval.
    pub fn spawn_with_interval(
        shared: Arc<SharedRotationState>,
        config: Arc<dyn ConfigProvider>,
        interval: Option<Duration>,
    ) -> std::io::Result<SchedulerHandle> {
        let control = Arc::new(Control::default());

        // Option changes force a new file.
        let listener_control = Arc::downgrade(&control);
        let listener_wakeup = Arc::downgrade(shared.wakeup());
        config.subscribe(Box::new(move || {
            if let (Some(control), Some(wakeup)) =
                (listener_control.upgrade(), listener_wakeup.upgrade())
            {
                control.reload.store(true, Ordering::Release);
                wakeup.set();
            }
        }));

        let scheduler = RotationScheduler {
            shared: shared.clone(),
            config,
            control: control.clone(),
            interval_override: interval,
        };
        let thread = thread::Builder::new()
            .name("audit-rotation".to_string())
            .spawn(move || scheduler.run())?;

        Ok(SchedulerHandle {
            shared,
            control,
            thread: Some(thread),
        })
    }

    fn run(self) {
        info!("rotation scheduler started");
        let wakeup = self.shared.wakeup().clone();

        loop {
            let config = self.config.current();

            if self.control.reload.swap(false, Ordering::AcqRel) {
                self.reload();
            } else if config.is_enabled() && self.shared.needs_rotation(&config) {
                self.rotate(&config, "rotation due");
            }

            if self.control.shutdown.load(Ordering::Acquire) {
                break;
            }

            let interval = self.interval_override.unwrap_or_else(|| poll_interval(&config));
            wakeup.wait_timeout(interval);
            wakeup.reset();
        }

        info!("rotation scheduler shutting down");
    }

    /// Re-reads the options and moves to a new file unconditionally.
    fn reload(&self) {
        if let Err(e) = self.config.reload() {
            warn!(error = %e, "configuration reload failed, keeping previous values");
        }
        let config = self.config.current();
        if config.is_enabled() {
            self.rotate(&config, "configuration changed");
        }
    }

    fn rotate(&self, config: &SpoolConfig, reason: &str) {
        match self.shared.rotate_at(config, Local::now()) {
            Ok(()) => debug!(
                reason,
                filename = %self.shared.current_filename(),
                "spool file rotated"
            ),
            Err(e) => warn!(error = %e, reason, "rotation failed, keeping current file"),
        }
    }
}

/// Controls a running [`RotationScheduler`].
pub struct SchedulerHandle {
    shared: Arc<SharedRotationState>,
    control: Arc<Control>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Asks the loop to reload configuration and rotate on its next wake.
    pub fn request_reload(&self) {
        self.control.reload.store(true, Ordering::Release);
        self.shared.wakeup().set();
    }

    /// Stops the loop and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.control.shutdown.store(true, Ordering::Release);
        self.shared.wakeup().set();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("rotation scheduler thread panicked");
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn size_config(directory: &str) -> SpoolConfig {
        SpoolConfig {
            directory: directory.to_string(),
            filename: "audit-%Y%m%d_%H%M.log".to_string(),
            rotation_age_minutes: 0,
            rotation_size_kb: 1,
            ..SpoolConfig::default()
        }
    }

    #[test]
    fn test_poll_interval() {
        let mut config = SpoolConfig::default();
        assert_eq!(poll_interval(&config), DEFAULT_POLL_INTERVAL);
        config.rotation_age_minutes = 5;
        assert_eq!(poll_interval(&config), SHORT_POLL_INTERVAL);
    }

    #[test]
    fn test_size_request_rotates_promptly() {
        let config = size_config("/tmp/audit");
        let shared = Arc::new(SharedRotationState::new(&config));
        let provider = Arc::new(SharedConfig::new(config.clone()));
        let before = shared.current_filename();

        // Long poll interval: only the latch can wake the loop in time.
        let handle = RotationScheduler::spawn_with_interval(
            shared.clone(),
            provider,
            Some(Duration::from_secs(3600)),
        )
        .unwrap();

        shared.account_bytes(2048);
        assert!(shared.check_size_threshold(&config));
        assert!(wait_until(Duration::from_secs(5), || {
            !shared.size_rotation_requested()
        }));
        assert_ne!(shared.current_filename(), before);

        handle.shutdown();
    }

    #[test]
    fn test_config_update_forces_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        let config = SpoolConfig {
            directory: first.display().to_string(),
            ..size_config("")
        };
        let shared = Arc::new(SharedRotationState::new(&config));
        let provider = Arc::new(SharedConfig::new(config.clone()));

        let handle = RotationScheduler::spawn_with_interval(
            shared.clone(),
            provider.clone(),
            Some(Duration::from_secs(3600)),
        )
        .unwrap();

        provider.update(SpoolConfig {
            directory: second.display().to_string(),
            ..config
        });
        let expected = second.display().to_string();
        assert!(wait_until(Duration::from_secs(5), || {
            shared.current_filename().starts_with(&expected)
        }));

        handle.shutdown();
    }

    #[test]
    fn test_request_reload_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("postgresql.conf");
        std::fs::write(&conf, "pgaudit.log_directory = '/tmp/a'\n").unwrap();

        let provider = Arc::new(SharedConfig::with_file(SpoolConfig::default(), &conf).unwrap());
        let shared = Arc::new(SharedRotationState::new(&provider.current()));
        assert!(shared.current_filename().starts_with("/tmp/a/"));

        let handle = RotationScheduler::spawn_with_interval(
            shared.clone(),
            provider,
            Some(Duration::from_secs(3600)),
        )
        .unwrap();

        std::fs::write(&conf, "pgaudit.log_directory = '/tmp/b'\n").unwrap();
        handle.request_reload();
        assert!(wait_until(Duration::from_secs(5), || {
            shared.current_filename().starts_with("/tmp/b/")
        }));

        handle.shutdown();
    }

    #[test]
    fn test_shutdown_joins_promptly() {
        let config = size_config("/tmp/audit");
        let shared = Arc::new(SharedRotationState::new(&config));
        let provider = Arc::new(SharedConfig::new(config));
        let handle = RotationScheduler::spawn(shared, provider).unwrap();

        let start = Instant::now();
        handle.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
