//! Per-process spool file writer.
//!
//! Each writer owns one private file handle. It never decides about
//! rotation itself: it compares the filename it has open with the one
//! published in [`SharedRotationState`] and reopens when they differ.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;
use tracing::{debug, error};

use crate::autoclose::{ActivityClock, AutoCloser};
use crate::config::ConfigProvider;
use crate::event::{SessionInfo, SourceEvent};
use crate::format::{self, FormatContext};
use crate::shared::SharedRotationState;

/// Write buffer size; one record normally becomes one system call.
const BUFFER_CAPACITY: usize = 128 * 1024;

/// Owner write permission, always added to the configured file mode.
const OWNER_WRITE: u32 = 0o200;

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("audit spooling is disabled")]
    Disabled,

    #[error("could not open audit log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write audit log file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("partial write to audit log file {path}: {written} of {expected} bytes")]
    PartialWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    #[error("could not format audit record: {0}")]
    Format(#[from] serde_json::Error),
}

/// An open spool file and the name it was opened under.
#[derive(Debug)]
pub struct SpoolFile {
    path: String,
    out: BufWriter<File>,
}

impl SpoolFile {
    /// Opens `path` for appending, creating it (and, best effort, its
    /// directory) when missing.
    pub fn open(path: &str, mode: u32) -> Result<Self, SpoolError> {
        if let Some(parent) = Path::new(path).parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            debug!(error = %e, dir = %parent.display(), "could not create spool directory");
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode | OWNER_WRITE);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = options.open(path).map_err(|source| SpoolError::Open {
            path: PathBuf::from(path),
            source,
        })?;
        debug!(path, "spool file opened");

        Ok(Self {
            path: path.to_string(),
            out: BufWriter::with_capacity(BUFFER_CAPACITY, file),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Appends one record at end of file and flushes it.
    pub fn append(&mut self, record: &[u8]) -> Result<(), SpoolError> {
        let write_error = |source| SpoolError::Write {
            path: PathBuf::from(&self.path),
            source,
        };

        self.out.seek(SeekFrom::End(0)).map_err(write_error)?;
        let written = self.out.write(record).map_err(write_error)?;
        if written != record.len() {
            return Err(SpoolError::PartialWrite {
                path: PathBuf::from(&self.path),
                written,
                expected: record.len(),
            });
        }
        self.out.flush().map_err(write_error)
    }

    /// Closes the file without flushing what is still buffered.
    pub fn discard(self) {
        let (_file, _unflushed) = self.out.into_parts();
    }
}

type FileSlot = Arc<Mutex<Option<SpoolFile>>>;

/// Writes intercepted events of one process to the current spool file.
pub struct SpoolWriter {
    shared: Arc<SharedRotationState>,
    config: Arc<dyn ConfigProvider>,
    session: SessionInfo,
    file: FileSlot,
    activity: Arc<ActivityClock>,
    line_number: u64,
    autocloser: AutoCloser,
    /// Overrides the configured idle period (tests).
    idle_override: Option<Duration>,
    /// No sibling writer exists yet: skip the size check and update the
    /// byte counter without locking.
    early_startup: bool,
}

impl SpoolWriter {
    pub fn new(
        shared: Arc<SharedRotationState>,
        config: Arc<dyn ConfigProvider>,
        session: SessionInfo,
    ) -> Self {
        Self {
            shared,
            config,
            session,
            file: Arc::new(Mutex::new(None)),
            activity: Arc::new(ActivityClock::new()),
            line_number: 0,
            autocloser: AutoCloser::default(),
            idle_override: None,
            early_startup: false,
        }
    }

    pub fn early_startup(mut self, early: bool) -> Self {
        self.early_startup = early;
        self
    }

    /// Sets the closer's check interval and, optionally, a fixed idle
    /// period instead of the configured minutes.
    pub fn autoclose_timing(mut self, tick: Duration, idle: Option<Duration>) -> Self {
        self.autocloser = AutoCloser::with_tick(tick);
        self.idle_override = idle;
        self
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Name of the file currently open, if any.
    pub fn filename_in_use(&self) -> Option<String> {
        self.lock_file().as_ref().map(|f| f.path.clone())
    }

    pub fn is_open(&self) -> bool {
        self.lock_file().is_some()
    }

    pub fn autoclose_active(&self) -> bool {
        self.autocloser.is_active()
    }

    /// Closes the private handle; the next record reopens.
    pub fn close(&self) {
        self.lock_file().take();
    }

    fn lock_file(&self) -> std::sync::MutexGuard<'_, Option<SpoolFile>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `event` to the current spool file, stripping `strip`
    /// leading message bytes. Returns the number of bytes written.
    ///
    /// After an open or write error the private handle is left closed so
    /// the next call starts from a fresh open.
    pub fn record(&mut self, event: &SourceEvent, strip: usize) -> Result<usize, SpoolError> {
        let config = self.config.current();
        if !config.is_enabled() {
            return Err(SpoolError::Disabled);
        }

        if !self.early_startup {
            self.shared.check_size_threshold(&config);
        }

        let target = self.shared.current_filename();
        if target.is_empty() {
            return Err(SpoolError::Disabled);
        }

        self.line_number += 1;
        let ctx = FormatContext {
            log_time: Local::now(),
            line_number: self.line_number,
        };
        let line = format::render(config.format, event, &self.session, &ctx, strip)?;

        let mut slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = match slot.take() {
            Some(file) if file.path == target => file,
            Some(stale) => {
                debug!(old = %stale.path, new = %target, "spool file rotated, reopening");
                drop(stale);
                SpoolFile::open(&target, config.file_mode)?
            }
            None => SpoolFile::open(&target, config.file_mode)?,
        };
        if let Err(e) = file.append(line.as_bytes()) {
            error!(error = %e, path = %target, "spool write failed, closing file");
            file.discard();
            return Err(e);
        }
        *slot = Some(file);
        self.activity.touch();
        drop(slot);

        if let Some(configured) = config.autoclose_after() {
            let idle = self.idle_override.unwrap_or(configured);
            self.autocloser
                .ensure_running(self.file.clone(), self.activity.clone(), idle);
        }

        let written = line.len() as u64;
        if self.early_startup {
            self.shared.account_bytes_unlocked(written);
        } else {
            self.shared.account_bytes(written);
        }
        Ok(line.len())
    }
}
