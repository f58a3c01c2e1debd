//! Entry point offered every log event of a process.
//!
//! Audit-relevant events go to the spool file instead of the host's
//! default log. The default path is suppressed before the write is
//! attempted and restored only if the write fails, so an event is never
//! lost and never logged twice.

use std::sync::Arc;

use tracing::error;

use crate::config::{ConfigProvider, SpoolConfig};
use crate::event::{SessionInfo, SourceEvent};
use crate::prefix::PrefixCatalogue;
use crate::shared::SharedRotationState;
use crate::writer::SpoolWriter;

/// Marker pgaudit puts in front of every audit message.
pub const AUDIT_MARKER: &str = "AUDIT: ";

/// The host's own logging path, invoked for every event after
/// interception.
pub trait DefaultLogPath {
    fn emit(&mut self, event: &SourceEvent);
}

impl<F: FnMut(&SourceEvent)> DefaultLogPath for F {
    fn emit(&mut self, event: &SourceEvent) {
        self(event)
    }
}

/// Decides whether `message` is audit-relevant.
///
/// Returns the number of leading bytes to strip, or `None` when the
/// message should stay on the default path.
pub fn classify(message: &str, config: &SpoolConfig, prefixes: &PrefixCatalogue) -> Option<usize> {
    let marker = AUDIT_MARKER.as_bytes();
    if message
        .as_bytes()
        .get(..marker.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(marker))
    {
        return Some(marker.len());
    }
    if config.log_connections && prefixes.is_connection(message) {
        return Some(0);
    }
    if config.log_disconnections && prefixes.is_disconnection(message) {
        return Some(0);
    }
    None
}

/// Per-process interceptor; creates its writer on the first audit event.
pub struct AuditInterceptor {
    shared: Arc<SharedRotationState>,
    config: Arc<dyn ConfigProvider>,
    session: SessionInfo,
    writer: Option<SpoolWriter>,
}

impl AuditInterceptor {
    pub fn new(
        shared: Arc<SharedRotationState>,
        config: Arc<dyn ConfigProvider>,
        session: SessionInfo,
    ) -> Self {
        Self {
            shared,
            config,
            session,
            writer: None,
        }
    }

    /// Uses `writer` instead of creating one lazily.
    pub fn with_writer(mut self, writer: SpoolWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn writer(&self) -> Option<&SpoolWriter> {
        self.writer.as_ref()
    }

    /// Spools `event` when it is audit-relevant, then hands it to
    /// `default`.
    ///
    /// Only `event.output_to_server` is modified: it is cleared when the
    /// event went to a spool file, and set when the spool write failed so
    /// the record still reaches the default path.
    pub fn on_log_event(&mut self, event: &mut SourceEvent, default: &mut dyn DefaultLogPath) {
        let config = self.config.current();
        if config.is_enabled()
            && !self.shared.is_shutting_down()
            && let Some(strip) = classify(&event.message, &config, self.shared.prefixes())
        {
            event.output_to_server = false;

            let writer = self.writer.get_or_insert_with(|| {
                SpoolWriter::new(
                    self.shared.clone(),
                    self.config.clone(),
                    self.session.clone(),
                )
            });
            if let Err(e) = writer.record(event, strip) {
                error!(error = %e, "could not spool audit record, sending it to the server log");
                event.output_to_server = true;
            }
        }

        default.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;
    use crate::format::split_csv_line;
    use chrono::{Local, TimeZone};
    use std::fs;
    use std::path::Path;

    /// Collects what reached the default path.
    #[derive(Default)]
    struct Recorder {
        events: Vec<SourceEvent>,
    }

    impl DefaultLogPath for Recorder {
        fn emit(&mut self, event: &SourceEvent) {
            self.events.push(event.clone());
        }
    }

    fn config_in(dir: &Path) -> SpoolConfig {
        SpoolConfig {
            directory: dir.display().to_string(),
            filename: "audit-%Y%m%d_%H%M.log".to_string(),
            rotation_age_minutes: 60,
            ..SpoolConfig::default()
        }
    }

    fn interceptor(config: SpoolConfig) -> (AuditInterceptor, Arc<SharedRotationState>) {
        let now = Local.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let shared = Arc::new(SharedRotationState::new_at(&config, now));
        let provider = Arc::new(SharedConfig::new(config));
        let interceptor =
            AuditInterceptor::new(shared.clone(), provider, SessionInfo::current_process());
        (interceptor, shared)
    }

    #[test]
    fn test_classify() {
        let prefixes = PrefixCatalogue::new();
        let mut config = SpoolConfig::default();

        assert_eq!(classify("AUDIT: SESSION,1,1,READ", &config, &prefixes), Some(7));
        assert_eq!(classify("audit: session,1,1,read", &config, &prefixes), Some(7));
        assert_eq!(classify("AUDIT:", &config, &prefixes), None);
        assert_eq!(
            classify("connection authorized: user=alice", &config, &prefixes),
            None
        );

        config.log_connections = true;
        assert_eq!(
            classify("connection authorized: user=alice", &config, &prefixes),
            Some(0)
        );
        let disconnect =
            "disconnection: session time: 0:00:01.000 user=alice database=app host=[local]";
        assert_eq!(classify(disconnect, &config, &prefixes), None);

        config.log_disconnections = true;
        assert_eq!(classify(disconnect, &config, &prefixes), Some(0));
    }

    #[test]
    fn test_audit_event_is_spooled_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (mut interceptor, shared) = interceptor(config_in(dir.path()));
        let mut default = Recorder::default();

        let mut event = SourceEvent::new("AUDIT: SESSION,1,1,READ,SELECT,,,SELECT 1,<none>");
        interceptor.on_log_event(&mut event, &mut default);

        assert!(!event.output_to_server);
        assert_eq!(default.events.len(), 1);
        assert!(!default.events[0].output_to_server);

        let path = dir.path().join("audit-20240101_1000.log");
        assert_eq!(shared.current_filename(), path.display().to_string());
        let content = fs::read_to_string(&path).unwrap();
        let fields = split_csv_line(content.trim_end_matches('\n'));
        assert_eq!(fields[12], "SESSION,1,1,READ,SELECT,,,SELECT 1,<none>");
    }

    #[test]
    fn test_connection_message_passes_through_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let (mut interceptor, shared) = interceptor(config_in(dir.path()));
        let mut default = Recorder::default();

        let mut event = SourceEvent::new("connection authorized: user=alice");
        let before = event.clone();
        interceptor.on_log_event(&mut event, &mut default);

        assert_eq!(event, before);
        assert!(default.events[0].output_to_server);
        assert!(interceptor.writer().is_none());
        assert!(!Path::new(&shared.current_filename()).exists());
    }

    #[test]
    fn test_connection_message_spooled_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = SpoolConfig {
            log_connections: true,
            ..config_in(dir.path())
        };
        let (mut interceptor, shared) = interceptor(config);
        let mut default = Recorder::default();

        let mut event = SourceEvent::new("connection authorized: user=alice database=app");
        interceptor.on_log_event(&mut event, &mut default);

        assert!(!event.output_to_server);
        let content = fs::read_to_string(shared.current_filename()).unwrap();
        let fields = split_csv_line(content.trim_end_matches('\n'));
        assert_eq!(fields[12], "connection authorized: user=alice database=app");
    }

    #[test]
    fn test_write_failure_falls_back_to_default_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"").unwrap();
        let (mut interceptor, _shared) = interceptor(config_in(&blocker));
        let mut default = Recorder::default();

        let mut event = SourceEvent::new("AUDIT: SESSION,1,1,READ,SELECT,,,SELECT 1,<none>");
        interceptor.on_log_event(&mut event, &mut default);

        assert!(event.output_to_server);
        assert_eq!(default.events.len(), 1);
        assert!(default.events[0].output_to_server);
    }

    #[test]
    fn test_disabled_engine_passes_everything_through() {
        let (mut interceptor, _shared) = interceptor(SpoolConfig::disabled());
        let mut seen = 0;
        let mut default = |event: &SourceEvent| {
            assert!(event.output_to_server);
            seen += 1;
        };

        let mut event = SourceEvent::new("AUDIT: SESSION,1,1,READ,SELECT,,,SELECT 1,<none>");
        interceptor.on_log_event(&mut event, &mut default);
        assert!(event.output_to_server);
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_shutting_down_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let (mut interceptor, shared) = interceptor(config_in(dir.path()));
        shared.begin_shutdown();
        let mut default = Recorder::default();

        let mut event = SourceEvent::new("AUDIT: SESSION,1,1,READ,SELECT,,,SELECT 1,<none>");
        interceptor.on_log_event(&mut event, &mut default);
        assert!(event.output_to_server);
        assert!(interceptor.writer().is_none());
    }

    #[test]
    fn test_failed_write_reenables_default_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"").unwrap();
        let (mut interceptor, _shared) = interceptor(config_in(&blocker));
        let mut default = Recorder::default();

        let mut event = SourceEvent::new("AUDIT: SESSION,1,1,READ,SELECT,,,SELECT 1,<none>");
        event.output_to_server = false;
        interceptor.on_log_event(&mut event, &mut default);

        assert!(event.output_to_server);
        assert_eq!(default.events.len(), 1);
        assert!(default.events[0].output_to_server);
    }
}
