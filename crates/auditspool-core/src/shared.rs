//! Rotation state shared by every writer of a process group.
//!
//! One instance exists per group. Writers read the current target
//! filename and feed the byte counter; only the scheduler recomputes the
//! filename and the next rotation instant. Every mutation happens inside
//! one short critical section, so a reader sees either the previous or
//! the next filename, never a mix.
//!
//! The registry is local to one OS process; `GroupLock` keeps a second
//! process from owning the same group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, warn};

use crate::config::SpoolConfig;
use crate::filename::{self, FilenameError};
use crate::latch::Latch;
use crate::prefix::PrefixCatalogue;

/// Groups attached in this OS process, by name.
static REGISTRY: LazyLock<Mutex<HashMap<String, Weak<SharedRotationState>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Default)]
struct RotationSlot {
    /// Empty until first computed.
    current_filename: String,
    /// `None` when time-based rotation is disabled.
    next_rotation_instant: Option<DateTime<Local>>,
    force_size_rotation: bool,
}

#[derive(Debug)]
pub struct SharedRotationState {
    slot: Mutex<RotationSlot>,
    bytes_written: AtomicU64,
    prefixes: PrefixCatalogue,
    wakeup: Arc<Latch>,
    shutting_down: AtomicBool,
}

impl SharedRotationState {
    /// Builds the state for `config`: prefix catalogue, first rotation
    /// instant and first filename.
    ///
    /// Filename errors are logged and leave the filename empty, which
    /// keeps writers from opening anything until the scheduler succeeds.
    pub fn new(config: &SpoolConfig) -> Self {
        Self::new_at(config, Local::now())
    }

    pub fn new_at(config: &SpoolConfig, now: DateTime<Local>) -> Self {
        let state = Self {
            slot: Mutex::new(RotationSlot::default()),
            bytes_written: AtomicU64::new(0),
            prefixes: PrefixCatalogue::new(),
            wakeup: Arc::new(Latch::new()),
            shutting_down: AtomicBool::new(false),
        };
        if config.is_enabled() {
            if let Err(e) = state.recompute_next_rotation_instant_at(config, now) {
                warn!(error = %e, "failed to compute next rotation time");
            }
            if let Err(e) = state.recompute_filename_at(config, now) {
                warn!(error = %e, "failed to compute spool filename");
            }
        }
        state
    }

    /// Finds the state of `group`, creating it on first use.
    ///
    /// Returns the state and whether it already existed.
    pub fn attach(group: &str, config: &SpoolConfig) -> (Arc<Self>, bool) {
        let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = registry.get(group).and_then(Weak::upgrade) {
            return (existing, true);
        }

        let state = Arc::new(Self::new(config));
        registry.insert(group.to_string(), Arc::downgrade(&state));
        info!(
            group,
            filename = %state.current_filename(),
            "audit spool state initialized"
        );
        (state, false)
    }

    fn lock(&self) -> MutexGuard<'_, RotationSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn prefixes(&self) -> &PrefixCatalogue {
        &self.prefixes
    }

    /// Handle the scheduler sleeps on.
    pub fn wakeup(&self) -> &Arc<Latch> {
        &self.wakeup
    }

    /// Target filename writers should append to; empty if not computed yet.
    pub fn current_filename(&self) -> String {
        self.lock().current_filename.clone()
    }

    pub fn next_rotation_instant(&self) -> Option<DateTime<Local>> {
        self.lock().next_rotation_instant
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub fn size_rotation_requested(&self) -> bool {
        self.lock().force_size_rotation
    }

    pub fn recompute_filename(&self, config: &SpoolConfig) -> Result<(), FilenameError> {
        self.recompute_filename_at(config, Local::now())
    }

    /// Publishes the filename for `now`, truncated to the rotation
    /// granularity.
    ///
    /// With size rotation on, a name that falls in the same time bucket as
    /// the current one gets a sub-second suffix so each size rotation
    /// opens a distinct file. On error the previous filename is kept.
    pub fn recompute_filename_at(
        &self,
        config: &SpoolConfig,
        now: DateTime<Local>,
    ) -> Result<(), FilenameError> {
        let bucket = filename::truncate_to_granularity(now, config.rotation_age_minutes)?;
        let candidate = filename::expand_filename(&config.directory, &config.filename, bucket)?;

        let mut slot = self.lock();
        let name = if config.rotation_size_bytes().is_some()
            && filename::same_time_bucket(&slot.current_filename, &candidate)
        {
            let disambiguator = Utc::now().timestamp_nanos_opt().unwrap_or(0);
            let suffixed = filename::with_size_suffix(&candidate, disambiguator);
            if suffixed.len() > filename::MAX_PATH_LEN {
                return Err(FilenameError::TooLong(suffixed.len()));
            }
            suffixed
        } else {
            candidate
        };
        slot.current_filename = name;
        debug!(filename = %slot.current_filename, "spool filename computed");
        Ok(())
    }

    pub fn recompute_next_rotation_instant(
        &self,
        config: &SpoolConfig,
    ) -> Result<(), FilenameError> {
        self.recompute_next_rotation_instant_at(config, Local::now())
    }

    pub fn recompute_next_rotation_instant_at(
        &self,
        config: &SpoolConfig,
        now: DateTime<Local>,
    ) -> Result<(), FilenameError> {
        let next = filename::next_rotation_instant(now, config.rotation_age_minutes)?;
        self.lock().next_rotation_instant = next;
        if let Some(next) = next {
            debug!(next = %next, "next rotation scheduled");
        }
        Ok(())
    }

    pub fn needs_rotation(&self, config: &SpoolConfig) -> bool {
        self.needs_rotation_at(config, Local::now())
    }

    /// True when a size rotation was requested or the rotation instant
    /// has been reached.
    pub fn needs_rotation_at(&self, config: &SpoolConfig, now: DateTime<Local>) -> bool {
        let slot = self.lock();
        if config.rotation_size_bytes().is_some() && slot.force_size_rotation {
            return true;
        }
        if !config.time_rotation_enabled() {
            return false;
        }
        let truncated =
            filename::truncate_to_granularity(now, config.rotation_age_minutes).unwrap_or(now);
        slot.next_rotation_instant.is_some_and(|next| truncated >= next)
    }

    /// Moves to a new file: recomputes the filename and next rotation
    /// instant, then clears the size request and byte counter.
    pub fn rotate_at(
        &self,
        config: &SpoolConfig,
        now: DateTime<Local>,
    ) -> Result<(), FilenameError> {
        self.recompute_filename_at(config, now)?;
        self.recompute_next_rotation_instant_at(config, now)?;

        let mut slot = self.lock();
        slot.force_size_rotation = false;
        self.bytes_written.store(0, Ordering::Release);
        Ok(())
    }

    /// Requests a size rotation if the byte counter plus the safety
    /// margin reached the configured threshold.
    ///
    /// On trip the counter is reset, the request flag set and the
    /// scheduler woken. Returns whether it tripped.
    pub fn check_size_threshold(&self, config: &SpoolConfig) -> bool {
        let Some(threshold) = config.rotation_size_bytes() else {
            return false;
        };
        let margin = config.rotation_size_margin_bytes();

        {
            let mut slot = self.lock();
            if self.bytes_written.load(Ordering::Acquire) + margin < threshold {
                return false;
            }
            self.bytes_written.store(0, Ordering::Release);
            slot.force_size_rotation = true;
        }
        debug!(threshold, "size limit reached, requesting rotation");
        self.wakeup.set();
        true
    }

    /// Adds `bytes` to the counter under the lock.
    pub fn account_bytes(&self, bytes: u64) {
        let _slot = self.lock();
        self.bytes_written.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Adds `bytes` without taking the lock; used before any sibling
    /// writer can exist.
    pub fn account_bytes_unlocked(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Marks the group as going down; interception stops.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.wakeup.set();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}
