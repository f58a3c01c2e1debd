//! Exclusive lock that makes one OS process the owner of a group.
//!
//! Shared rotation state lives in memory of the process that attached
//! it, so two processes spooling the same group into one directory would
//! each run a scheduler and count bytes on their own. The owner holds an
//! advisory lock on `.auditspool-<group>.lock` in the spool directory; a
//! second process fails to take it and must not start.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum GroupLockError {
    #[error("audit spool group is owned by another process (lock file {0})")]
    Held(PathBuf),

    #[error("could not lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held for as long as the value lives; released when the file closes.
#[derive(Debug)]
pub struct GroupLock {
    path: PathBuf,
    _file: File,
}

impl GroupLock {
    /// Lock file of `group` inside `directory`. Characters outside
    /// `[A-Za-z0-9_-]` in the group name become `_`.
    pub fn lock_path(directory: &str, group: &str) -> PathBuf {
        let name: String = group
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Path::new(directory).join(format!(".auditspool-{name}.lock"))
    }

    /// Takes the lock without blocking. The directory is created when
    /// missing; the owner's pid is written into the file.
    pub fn acquire(directory: &str, group: &str) -> Result<Self, GroupLockError> {
        let path = Self::lock_path(directory, group);
        if let Err(e) = fs::create_dir_all(directory) {
            debug!(error = %e, dir = directory, "could not create spool directory");
        }

        let io_error = |source| GroupLockError::Io {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_error)?;

        if !file.try_lock_exclusive().map_err(io_error)? {
            return Err(GroupLockError::Held(path));
        }

        let pid = std::process::id();
        if let Err(e) = file.set_len(0).and_then(|()| writeln!(&file, "{pid}")) {
            debug!(error = %e, path = %path.display(), "could not record lock owner");
        }
        info!(group, path = %path.display(), pid, "audit spool group lock acquired");

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GroupLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "audit spool group lock released");
    }
}
