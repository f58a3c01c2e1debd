//! auditspool-core — audit record spooling engine.
//!
//! Intercepts audit log events raised inside a host database process and
//! redirects them to rotating spool files, leaving every other event on the
//! host's default logging path.
//!
//! Provides:
//! - `config` — spool options, validation, change notification
//! - `prefix` — connection/disconnection message prefix catalogue
//! - `event` — the source event and per-process session data
//! - `format` — CSV and JSON record rendering
//! - `filename` — time truncation, rotation instants, filename expansion
//! - `shared` — rotation state shared by every writer of a process group
//! - `group_lock` — exclusive owner lock of a group across processes
//! - `latch` — resettable wake-up signal
//! - `scheduler` — background rotation loop
//! - `writer` — per-process spool file writer
//! - `autoclose` — idle file handle closer
//! - `interceptor` — emit-log hook entry point

pub mod autoclose;
pub mod config;
pub mod event;
pub mod filename;
pub mod format;
pub mod group_lock;
pub mod interceptor;
pub mod latch;
pub mod prefix;
pub mod scheduler;
pub mod shared;
pub mod writer;

pub use config::{ConfigError, ConfigProvider, OutputFormat, SharedConfig, SpoolConfig};
pub use event::{SessionInfo, Severity, SourceEvent, SourceLocation};
pub use group_lock::{GroupLock, GroupLockError};
pub use interceptor::{AuditInterceptor, DefaultLogPath};
pub use scheduler::{RotationScheduler, SchedulerHandle};
pub use shared::SharedRotationState;
pub use writer::{SpoolError, SpoolWriter};
