//! Spool configuration.
//!
//! Options mirror the `pgaudit.log_*` settings a host reads from its
//! configuration file. [`SpoolConfig`] is an immutable snapshot; a
//! [`ConfigProvider`] hands out snapshots and tells interested parties
//! (the rotation scheduler) when the values changed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

/// Default spool directory, relative to the host's working directory.
pub const DEFAULT_DIRECTORY: &str = "log";
/// Default filename pattern (strftime escapes, minute granularity).
pub const DEFAULT_FILENAME: &str = "audit-%Y%m%d_%H%M.log";
/// Default rotation age: one day.
pub const DEFAULT_ROTATION_AGE_MINUTES: u32 = 24 * 60;
/// Share of the size threshold reserved for concurrent-writer overshoot.
pub const DEFAULT_SIZE_MARGIN: f64 = 0.0009;
/// Default permission bits for newly created spool files.
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// Prefix of every option name in a configuration file.
const OPTION_NAMESPACE: &str = "pgaudit.";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid log format \"{0}\": expected \"csv\" or \"json\"")]
    InvalidFormat(String),

    #[error("invalid value for {name}: \"{value}\"")]
    InvalidValue { name: String, value: String },

    #[error("unrecognized configuration option \"{0}\"")]
    UnknownOption(String),

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Serialization used for spooled records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            other => Err(ConfigError::InvalidFormat(other.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Csv => f.write_str("csv"),
            OutputFormat::Json => f.write_str("json"),
        }
    }
}

/// Snapshot of every spool option.
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolConfig {
    /// Base directory for spool files (canonicalized).
    pub directory: String,
    /// strftime-style filename pattern.
    pub filename: String,
    /// Time-based rotation interval in minutes. 0 disables it.
    pub rotation_age_minutes: u32,
    /// Size-based rotation threshold in KB. 0 disables it.
    pub rotation_size_kb: u32,
    /// Intercept connection messages.
    pub log_connections: bool,
    /// Intercept disconnection messages.
    pub log_disconnections: bool,
    /// Close an idle per-process handle after N minutes. 0 disables it.
    pub autoclose_minutes: u32,
    /// Record serialization.
    pub format: OutputFormat,
    /// Fraction of the size threshold subtracted before comparing.
    pub rotation_size_margin: f64,
    /// Permission bits for created files. Owner write is always added.
    pub file_mode: u32,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: DEFAULT_DIRECTORY.to_string(),
            filename: DEFAULT_FILENAME.to_string(),
            rotation_age_minutes: DEFAULT_ROTATION_AGE_MINUTES,
            rotation_size_kb: 0,
            log_connections: false,
            log_disconnections: false,
            autoclose_minutes: 0,
            format: OutputFormat::Csv,
            rotation_size_margin: DEFAULT_SIZE_MARGIN,
            file_mode: DEFAULT_FILE_MODE,
        }
    }
}

impl SpoolConfig {
    /// A configuration with no directory: the engine stays disabled.
    pub fn disabled() -> Self {
        Self {
            directory: String::new(),
            ..Self::default()
        }
    }

    /// True when both the directory and the filename pattern are set.
    pub fn is_enabled(&self) -> bool {
        !self.directory.is_empty() && !self.filename.is_empty()
    }

    pub fn time_rotation_enabled(&self) -> bool {
        self.rotation_age_minutes > 0
    }

    /// Size threshold in bytes, `None` when size rotation is off.
    pub fn rotation_size_bytes(&self) -> Option<u64> {
        (self.rotation_size_kb > 0).then(|| u64::from(self.rotation_size_kb) * 1024)
    }

    /// Safety margin in bytes subtracted from the size threshold.
    pub fn rotation_size_margin_bytes(&self) -> u64 {
        match self.rotation_size_bytes() {
            Some(bytes) => (bytes as f64 * self.rotation_size_margin.max(0.0)) as u64,
            None => 0,
        }
    }

    /// Idle period after which a process closes its spool file.
    pub fn autoclose_after(&self) -> Option<Duration> {
        (self.autoclose_minutes > 0)
            .then(|| Duration::from_secs(u64::from(self.autoclose_minutes) * 60))
    }

    /// Validates and applies a single option.
    ///
    /// `name` may be given with or without the `pgaudit.` namespace.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let key = name.strip_prefix(OPTION_NAMESPACE).unwrap_or(name);
        let invalid = || ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };

        match key {
            "log_directory" => self.directory = canonicalize_directory(value),
            "log_filename" => self.filename = value.to_string(),
            "log_rotation_age" => {
                self.rotation_age_minutes = value.trim().parse().map_err(|_| invalid())?
            }
            "log_rotation_size" => {
                self.rotation_size_kb = value.trim().parse().map_err(|_| invalid())?
            }
            "log_connections" => self.log_connections = parse_bool(value).ok_or_else(invalid)?,
            "log_disconnections" => {
                self.log_disconnections = parse_bool(value).ok_or_else(invalid)?
            }
            "log_autoclose_minutes" => {
                self.autoclose_minutes = value.trim().parse().map_err(|_| invalid())?
            }
            "log_format" => self.format = value.trim().parse()?,
            "log_rotation_size_margin" => {
                let margin: f64 = value.trim().parse().map_err(|_| invalid())?;
                if !(0.0..1.0).contains(&margin) {
                    return Err(invalid());
                }
                self.rotation_size_margin = margin;
            }
            "log_file_mode" => {
                let digits = value.trim();
                let digits = digits.strip_prefix("0o").unwrap_or(digits);
                self.file_mode = u32::from_str_radix(digits, 8).map_err(|_| invalid())?;
                if self.file_mode > 0o777 {
                    return Err(invalid());
                }
            }
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        Ok(())
    }

    /// Returns a copy of `self` with every `pgaudit.*` setting of a
    /// configuration file applied on top.
    ///
    /// Settings outside the namespace are ignored; unknown names inside
    /// it are reported and skipped.
    pub fn merged_with_conf(&self, text: &str) -> Result<SpoolConfig, ConfigError> {
        let mut config = self.clone();
        for (name, value) in parse_conf(text) {
            if !name.starts_with(OPTION_NAMESPACE) {
                continue;
            }
            match config.apply(&name, &value) {
                Ok(()) => {}
                Err(ConfigError::UnknownOption(name)) => {
                    warn!(option = %name, "ignoring unrecognized configuration option");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(config)
    }
}

/// Parses a boolean the way the host does: on/off, true/false, yes/no, 1/0.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" | "t" | "y" => Some(true),
        "off" | "false" | "no" | "0" | "f" | "n" => Some(false),
        _ => None,
    }
}

/// Splits a `postgresql.conf`-style file into `(name, value)` pairs.
///
/// Accepts `name = value` and `name value`, single-quoted values with
/// `''` escapes, and `#` comments outside quotes.
pub fn parse_conf(text: &str) -> Vec<(String, String)> {
    let mut settings = Vec::new();

    for line in text.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let name_end = line
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(line.len());
        let name = &line[..name_end];
        if name.is_empty() {
            continue;
        }

        let rest = line[name_end..].trim_start();
        let rest = rest.strip_prefix('=').unwrap_or(rest).trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('\'') {
            let mut value = String::new();
            let mut chars = quoted.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        value.push('\'');
                    } else {
                        break;
                    }
                } else {
                    value.push(c);
                }
            }
            value
        } else {
            let end = rest.find('#').unwrap_or(rest.len());
            rest[..end].trim().to_string()
        };

        settings.push((name.to_ascii_lowercase(), value));
    }

    settings
}

/// Removes redundant separators, `.` segments and trailing separators,
/// and folds `..` into a preceding normal segment.
pub fn canonicalize_directory(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        return String::new();
    }

    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Callback invoked after the configuration changed.
pub type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// Source of spool options.
pub trait ConfigProvider: Send + Sync {
    /// Current snapshot. Cheap; called on every intercepted event.
    fn current(&self) -> Arc<SpoolConfig>;

    /// Re-reads the backing source, if any.
    fn reload(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Registers a callback fired whenever the options change.
    fn subscribe(&self, _listener: ChangeListener) {}
}

/// In-memory configuration, optionally backed by a configuration file.
pub struct SharedConfig {
    current: RwLock<Arc<SpoolConfig>>,
    /// Values used for options the file does not set.
    base: SpoolConfig,
    source: Option<PathBuf>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl SharedConfig {
    pub fn new(config: SpoolConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config.clone())),
            base: config,
            source: None,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Creates a provider whose values come from `path` layered over `base`.
    pub fn with_file(base: SpoolConfig, path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let loaded = load_file(&base, &path)?;
        Ok(Self {
            current: RwLock::new(Arc::new(loaded)),
            base,
            source: Some(path),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Path of the backing configuration file, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Replaces the configuration and notifies subscribers.
    pub fn update(&self, config: SpoolConfig) {
        self.store(config);
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener();
        }
    }

    fn store(&self, config: SpoolConfig) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(config);
    }
}

impl ConfigProvider for SharedConfig {
    fn current(&self) -> Arc<SpoolConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.source else {
            return Ok(());
        };
        let loaded = load_file(&self.base, path)?;
        debug!(path = %path.display(), "configuration reloaded");
        self.store(loaded);
        Ok(())
    }

    fn subscribe(&self, listener: ChangeListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

fn load_file(base: &SpoolConfig, path: &Path) -> Result<SpoolConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    base.merged_with_conf(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_defaults_match_host_option_definitions() {
        let config = SpoolConfig::default();
        assert_eq!(config.directory, "log");
        assert_eq!(config.filename, "audit-%Y%m%d_%H%M.log");
        assert_eq!(config.rotation_age_minutes, 1440);
        assert_eq!(config.rotation_size_bytes(), None);
        assert_eq!(config.autoclose_after(), None);
        assert_eq!(config.format, OutputFormat::Csv);
        assert!(config.is_enabled());
    }

    #[test]
    fn test_format_accepts_only_csv_and_json() {
        assert_eq!("csv".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!(matches!(
            "xml".parse::<OutputFormat>(),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert!("CSV".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_apply_validates_values() {
        let mut config = SpoolConfig::default();
        config.apply("pgaudit.log_rotation_size", "1024").unwrap();
        assert_eq!(config.rotation_size_bytes(), Some(1024 * 1024));

        config.apply("log_connections", "on").unwrap();
        assert!(config.log_connections);

        assert!(config.apply("pgaudit.log_rotation_age", "-5").is_err());
        assert!(config.apply("pgaudit.log_disconnections", "maybe").is_err());
        assert!(config.apply("pgaudit.log_format", "yaml").is_err());
        assert!(matches!(
            config.apply("pgaudit.nope", "1"),
            Err(ConfigError::UnknownOption(_))
        ));

        config.apply("pgaudit.log_file_mode", "0640").unwrap();
        assert_eq!(config.file_mode, 0o640);
    }

    #[test]
    fn test_size_margin_bytes() {
        let config = SpoolConfig {
            rotation_size_kb: 1000,
            ..SpoolConfig::default()
        };
        // 1_024_000 * 0.0009 = 921.6
        assert_eq!(config.rotation_size_margin_bytes(), 921);

        let disabled = SpoolConfig::default();
        assert_eq!(disabled.rotation_size_margin_bytes(), 0);
    }

    #[test]
    fn test_canonicalize_directory() {
        assert_eq!(canonicalize_directory("/var//log/./audit/"), "/var/log/audit");
        assert_eq!(canonicalize_directory("log"), "log");
        assert_eq!(canonicalize_directory("./log/"), "log");
        assert_eq!(canonicalize_directory("/var/log/../audit"), "/var/audit");
        assert_eq!(canonicalize_directory("../audit"), "../audit");
        assert_eq!(canonicalize_directory("/.."), "/");
        assert_eq!(canonicalize_directory("."), ".");
        assert_eq!(canonicalize_directory(""), "");
    }

    #[test]
    fn test_parse_conf() {
        let text = "\
# audit settings
pgaudit.log_directory = '/tmp/audit'   # spool here
pgaudit.log_filename='it''s-%H.log'
pgaudit.log_rotation_age 60
shared_buffers = 128MB
";
        let settings = parse_conf(text);
        assert_eq!(
            settings,
            vec![
                ("pgaudit.log_directory".to_string(), "/tmp/audit".to_string()),
                ("pgaudit.log_filename".to_string(), "it's-%H.log".to_string()),
                ("pgaudit.log_rotation_age".to_string(), "60".to_string()),
                ("shared_buffers".to_string(), "128MB".to_string()),
            ]
        );
    }

    #[test]
    fn test_merged_with_conf_skips_foreign_and_unknown_options() {
        let text = "pgaudit.log_rotation_age = 60\npgaudit.log_level = 'log'\nwork_mem = 4MB\n";
        let config = SpoolConfig::default().merged_with_conf(text).unwrap();
        assert_eq!(config.rotation_age_minutes, 60);
        assert_eq!(config.directory, DEFAULT_DIRECTORY);
    }

    #[test]
    fn test_merged_with_conf_rejects_invalid_format() {
        let text = "pgaudit.log_format = 'xml'\n";
        assert!(SpoolConfig::default().merged_with_conf(text).is_err());
    }

    #[test]
    fn test_shared_config_update_notifies_listeners() {
        let provider = SharedConfig::new(SpoolConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        provider.subscribe(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        provider.update(SpoolConfig {
            rotation_age_minutes: 60,
            ..SpoolConfig::default()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.current().rotation_age_minutes, 60);
    }

    #[test]
    fn test_shared_config_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postgresql.conf");
        std::fs::write(&path, "pgaudit.log_rotation_age = 30\n").unwrap();

        let provider = SharedConfig::with_file(SpoolConfig::default(), &path).unwrap();
        assert_eq!(provider.current().rotation_age_minutes, 30);

        std::fs::write(&path, "pgaudit.log_format = 'json'\n").unwrap();
        provider.reload().unwrap();
        let current = provider.current();
        assert_eq!(current.format, OutputFormat::Json);
        // Options removed from the file fall back to the base values.
        assert_eq!(current.rotation_age_minutes, DEFAULT_ROTATION_AGE_MINUTES);
    }

    #[test]
    fn test_shared_config_reload_keeps_previous_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postgresql.conf");
        std::fs::write(&path, "pgaudit.log_rotation_age = 30\n").unwrap();
        let provider = SharedConfig::with_file(SpoolConfig::default(), &path).unwrap();

        std::fs::write(&path, "pgaudit.log_format = 'xml'\n").unwrap();
        assert!(provider.reload().is_err());
        assert_eq!(provider.current().rotation_age_minutes, 30);
    }
}
