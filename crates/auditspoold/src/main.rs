//! auditspoold - audit record spooling daemon.
//!
//! Follows a PostgreSQL stderr log, offers every event to the audit
//! interceptor and writes audit records to rotating spool files. Events
//! that are not spooled are echoed to stdout.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod stderr;
mod tailer;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use auditspool_core::config::{
    DEFAULT_DIRECTORY, DEFAULT_FILENAME, DEFAULT_ROTATION_AGE_MINUTES, DEFAULT_SIZE_MARGIN,
};
use auditspool_core::{
    AuditInterceptor, ConfigError, ConfigProvider, DefaultLogPath, GroupLock, GroupLockError,
    RotationScheduler, SessionInfo, SharedConfig, SharedRotationState, SourceEvent, SpoolConfig,
};
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use stderr::{EventAssembler, render_server_lines};
use tailer::LogTailer;

/// Audit record spooling daemon.
#[derive(Parser, Debug)]
#[command(name = "auditspoold", about = "Audit record spooling daemon", version)]
struct Args {
    /// PostgreSQL stderr log file to follow.
    #[arg(short, long, env = "AUDITSPOOL_SOURCE")]
    source: PathBuf,

    /// Read the source from the beginning instead of its current end.
    #[arg(long)]
    from_start: bool,

    /// postgresql.conf-style file with pgaudit.* settings.
    /// Re-read when its modification time changes.
    #[arg(short, long, env = "AUDITSPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for spool files.
    #[arg(long, env = "AUDITSPOOL_LOG_DIRECTORY", default_value = DEFAULT_DIRECTORY)]
    log_directory: String,

    /// Spool filename pattern (strftime escapes).
    #[arg(long, env = "AUDITSPOOL_LOG_FILENAME", default_value = DEFAULT_FILENAME)]
    log_filename: String,

    /// Rotate after this many minutes, aligned to the interval. 0 disables.
    #[arg(
        long,
        env = "AUDITSPOOL_LOG_ROTATION_AGE",
        default_value_t = DEFAULT_ROTATION_AGE_MINUTES
    )]
    log_rotation_age: u32,

    /// Rotate after this many KB written. 0 disables.
    #[arg(long, env = "AUDITSPOOL_LOG_ROTATION_SIZE", default_value_t = 0)]
    log_rotation_size: u32,

    /// Fraction of the size threshold kept free for concurrent writers.
    #[arg(
        long,
        env = "AUDITSPOOL_LOG_ROTATION_SIZE_MARGIN",
        default_value_t = DEFAULT_SIZE_MARGIN
    )]
    log_rotation_size_margin: f64,

    /// Spool connection messages.
    #[arg(
        long,
        env = "AUDITSPOOL_LOG_CONNECTIONS",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    log_connections: bool,

    /// Spool disconnection messages.
    #[arg(
        long,
        env = "AUDITSPOOL_LOG_DISCONNECTIONS",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    log_disconnections: bool,

    /// Close an idle spool file after this many minutes. 0 disables.
    #[arg(long, env = "AUDITSPOOL_LOG_AUTOCLOSE_MINUTES", default_value_t = 0)]
    log_autoclose_minutes: u32,

    /// Record format: csv or json.
    #[arg(long, env = "AUDITSPOOL_LOG_FORMAT", default_value = "csv")]
    log_format: String,

    /// Octal permission bits for new spool files.
    #[arg(long, env = "AUDITSPOOL_LOG_FILE_MODE", default_value = "0600")]
    log_file_mode: String,

    /// Name of the shared rotation state.
    #[arg(long, default_value = "default")]
    group: String,

    /// Source poll interval in milliseconds.
    #[arg(long, default_value = "200")]
    poll_ms: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Builds the command-line layer of the configuration.
fn base_config(args: &Args) -> Result<SpoolConfig, ConfigError> {
    let mut config = SpoolConfig::default();
    let options = [
        ("log_directory", args.log_directory.clone()),
        ("log_filename", args.log_filename.clone()),
        ("log_rotation_age", args.log_rotation_age.to_string()),
        ("log_rotation_size", args.log_rotation_size.to_string()),
        ("log_rotation_size_margin", args.log_rotation_size_margin.to_string()),
        ("log_connections", args.log_connections.to_string()),
        ("log_disconnections", args.log_disconnections.to_string()),
        ("log_autoclose_minutes", args.log_autoclose_minutes.to_string()),
        ("log_format", args.log_format.clone()),
        ("log_file_mode", args.log_file_mode.clone()),
    ];
    for (name, value) in &options {
        config.apply(name, value)?;
    }
    Ok(config)
}

/// Command-line values, overlaid by the configuration file when given.
fn load_config(args: &Args) -> Result<SharedConfig, ConfigError> {
    let base = base_config(args)?;
    match &args.config {
        Some(path) => SharedConfig::with_file(base, path),
        None => Ok(SharedConfig::new(base)),
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let directives = format!("auditspoold={level},auditspool_core={level}");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Detects modifications of the configuration file by mtime.
struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    fn new(path: PathBuf) -> Self {
        let modified = modified_time(&path);
        Self { path, modified }
    }

    /// True once per change of the file's modification time.
    fn changed(&mut self) -> bool {
        let modified = modified_time(&self.path);
        if modified == self.modified {
            return false;
        }
        self.modified = modified;
        true
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Quiet polls after which the event being assembled is complete.
const IDLE_POLLS_BEFORE_FLUSH: u32 = 2;

/// Groups tailed lines into events across poll batches.
///
/// The last event of a batch is held back: its `DETAIL:` or `STATEMENT:`
/// lines may arrive with the next poll. It is released when the next
/// message line starts or once the source stays quiet.
struct EventPump {
    assembler: EventAssembler,
    idle_polls: u32,
}

impl EventPump {
    fn new() -> Self {
        Self {
            assembler: EventAssembler::new(),
            idle_polls: 0,
        }
    }

    /// Feeds one poll's lines and returns the events they completed.
    fn feed(&mut self, lines: &[String]) -> Vec<SourceEvent> {
        if lines.is_empty() {
            self.idle_polls = self.idle_polls.saturating_add(1);
            if self.idle_polls >= IDLE_POLLS_BEFORE_FLUSH {
                return self.assembler.flush().into_iter().collect();
            }
            return Vec::new();
        }
        self.idle_polls = 0;
        lines
            .iter()
            .filter_map(|line| self.assembler.push_line(line))
            .collect()
    }

    /// Releases the event still being assembled.
    fn finish(&mut self) -> Option<SourceEvent> {
        self.assembler.flush()
    }
}

/// The daemon's default log path: events not spooled go to stdout.
struct ServerLog<W: Write> {
    out: W,
    failed: bool,
}

impl<W: Write> ServerLog<W> {
    fn new(out: W) -> Self {
        Self { out, failed: false }
    }
}

impl<W: Write> DefaultLogPath for ServerLog<W> {
    fn emit(&mut self, event: &SourceEvent) {
        if !event.output_to_server {
            return;
        }
        let result = self
            .out
            .write_all(render_server_lines(event).as_bytes())
            .and_then(|()| self.out.flush());
        if let Err(e) = result
            && !self.failed
        {
            warn!(error = %e, "failed to write server log output");
            self.failed = true;
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("auditspoold {} starting", env!("CARGO_PKG_VERSION"));

    let provider = match load_config(&args) {
        Ok(provider) => Arc::new(provider),
        Err(e) => {
            error!(error = %e, "invalid configuration, audit spooling disabled");
            Arc::new(SharedConfig::new(SpoolConfig::disabled()))
        }
    };
    let config = provider.current();
    info!(
        "Config: directory={}, filename={}, rotation_age={}m, rotation_size={}KB, format={}",
        config.directory,
        config.filename,
        config.rotation_age_minutes,
        config.rotation_size_kb,
        config.format
    );

    let tailer = if args.from_start {
        LogTailer::from_start(args.source.clone())
    } else {
        LogTailer::from_end(args.source.clone())
    };
    let mut tailer = match tailer {
        Ok(tailer) => tailer,
        Err(e) => {
            error!(error = %e, path = %args.source.display(), "cannot open source log");
            std::process::exit(1);
        }
    };
    info!("Following {}", tailer.path().display());

    let group_lock = if config.is_enabled() {
        match GroupLock::acquire(&config.directory, &args.group) {
            Ok(lock) => Some(lock),
            Err(GroupLockError::Held(path)) => {
                error!(
                    group = %args.group,
                    path = %path.display(),
                    "group is owned by another process"
                );
                std::process::exit(1);
            }
            Err(e) => {
                warn!(error = %e, "could not lock group, continuing unlocked");
                None
            }
        }
    } else {
        None
    };

    let (shared, found) = SharedRotationState::attach(&args.group, &config);
    debug!(group = %args.group, found, "attached to rotation state");

    let config_provider: Arc<dyn ConfigProvider> = provider.clone();
    let scheduler = match RotationScheduler::spawn(shared.clone(), config_provider.clone()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(error = %e, "failed to start rotation scheduler, rotation disabled");
            None
        }
    };

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut watcher = provider.source().map(|path| ConfigWatcher::new(path.to_path_buf()));
    let mut interceptor =
        AuditInterceptor::new(shared.clone(), config_provider, SessionInfo::current_process());
    let mut pump = EventPump::new();
    let mut server_log = ServerLog::new(io::stdout().lock());
    let poll = Duration::from_millis(args.poll_ms.max(10));

    info!("Starting intercept loop");
    while running.load(Ordering::SeqCst) {
        match tailer.read_lines() {
            Ok(lines) => {
                for mut event in pump.feed(&lines) {
                    interceptor.on_log_event(&mut event, &mut server_log);
                }
            }
            Err(e) => {
                warn!(error = %e, path = %tailer.path().display(), "failed to read source log")
            }
        }

        if let Some(watcher) = watcher.as_mut()
            && watcher.changed()
        {
            info!("Configuration file changed, reloading");
            if let Some(scheduler) = &scheduler {
                scheduler.request_reload();
            }
        }

        std::thread::sleep(poll);
    }

    info!("Shutting down...");
    if let Some(mut event) = pump.finish() {
        interceptor.on_log_event(&mut event, &mut server_log);
    }
    shared.begin_shutdown();
    if let Some(scheduler) = scheduler {
        scheduler.shutdown();
    }
    drop(group_lock);
    info!("Shutdown complete");
}
