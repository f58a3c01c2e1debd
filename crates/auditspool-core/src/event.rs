//! Log events offered by the host and the session they belong to.

use chrono::{DateTime, Local};

/// Severity of a host log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Severity {
    Debug,
    #[default]
    Log,
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
    Panic,
}

impl Severity {
    /// Keyword the host prints before the message (`LOG`, `ERROR`, ...).
    pub fn keyword(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Log => "LOG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Panic => "PANIC",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "DEBUG" | "DEBUG1" | "DEBUG2" | "DEBUG3" | "DEBUG4" | "DEBUG5" => Some(Severity::Debug),
            "LOG" => Some(Severity::Log),
            "INFO" => Some(Severity::Info),
            "NOTICE" => Some(Severity::Notice),
            "WARNING" => Some(Severity::Warning),
            "ERROR" => Some(Severity::Error),
            "FATAL" => Some(Severity::Fatal),
            "PANIC" => Some(Severity::Panic),
            _ => None,
        }
    }
}

/// Code location that raised the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub filename: String,
    pub lineno: u32,
    pub funcname: Option<String>,
}

/// One log occurrence.
///
/// Everything except `output_to_server` is read-only for the spooling
/// engine. The interceptor clears `output_to_server` when the event went
/// to a spool file instead of the default log.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    pub message: String,
    pub severity: Severity,
    /// Five-character SQLSTATE.
    pub sql_state: String,
    pub detail: Option<String>,
    /// Detail meant only for the server log; preferred over `detail`.
    pub detail_log: Option<String>,
    pub hint: Option<String>,
    pub context: Option<String>,
    pub internal_query: Option<String>,
    /// 1-based position in `internal_query`, 0 when unknown.
    pub internal_pos: u32,
    /// Statement being executed when the event was raised.
    pub statement: Option<String>,
    /// 1-based position in `statement`, 0 when unknown.
    pub cursor_pos: u32,
    /// Set when the statement must not be printed with this event.
    pub hide_statement: bool,
    pub location: Option<SourceLocation>,
    /// Text of the process-status display (command tag).
    pub process_status: String,
    /// Virtual transaction id, e.g. `3/17`.
    pub virtual_xid: Option<String>,
    /// Top-level transaction id, 0 when none is assigned.
    pub xid: u32,
    pub output_to_server: bool,
}

impl SourceEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Log,
            sql_state: "00000".to_string(),
            detail: None,
            detail_log: None,
            hint: None,
            context: None,
            internal_query: None,
            internal_pos: 0,
            statement: None,
            cursor_pos: 0,
            hide_statement: false,
            location: None,
            process_status: String::new(),
            virtual_xid: None,
            xid: 0,
            output_to_server: true,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    /// Message with the first `strip` bytes removed.
    ///
    /// Falls back to the whole message if `strip` does not land on a
    /// character boundary.
    pub fn stripped_message(&self, strip: usize) -> &str {
        self.message.get(strip..).unwrap_or(&self.message)
    }

    /// Detail text to print: the log-only variant wins.
    pub fn effective_detail(&self) -> Option<&str> {
        self.detail_log.as_deref().or(self.detail.as_deref())
    }

    /// Statement text unless the event hides it.
    pub fn printable_statement(&self) -> Option<&str> {
        if self.hide_statement {
            None
        } else {
            self.statement.as_deref()
        }
    }
}

/// Connection-level data of the process that emits events.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub user: Option<String>,
    pub database: Option<String>,
    pub pid: u32,
    pub remote_host: Option<String>,
    pub remote_port: Option<String>,
    pub session_start: DateTime<Local>,
    pub application_name: Option<String>,
    /// Print source locations (host error verbosity is `verbose`).
    pub verbose_errors: bool,
}

impl SessionInfo {
    /// Session info for the calling OS process with no client attached.
    pub fn current_process() -> Self {
        Self {
            user: None,
            database: None,
            pid: std::process::id(),
            remote_host: None,
            remote_port: None,
            session_start: Local::now(),
            application_name: None,
            verbose_errors: false,
        }
    }

    /// `<hex session start>.<hex pid>`, the host's session identifier.
    pub fn session_id(&self) -> String {
        format!("{:x}.{:x}", self.session_start.timestamp(), self.pid)
    }

    /// `host` or `host:port`.
    pub fn remote_endpoint(&self) -> Option<String> {
        let host = self.remote_host.as_deref()?;
        match self.remote_port.as_deref() {
            Some(port) if !port.is_empty() => Some(format!("{host}:{port}")),
            _ => Some(host.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session() -> SessionInfo {
        SessionInfo {
            user: Some("alice".to_string()),
            database: Some("app".to_string()),
            pid: 4242,
            remote_host: Some("10.0.0.7".to_string()),
            remote_port: Some("51234".to_string()),
            session_start: Local.timestamp_opt(1_700_000_000, 0).unwrap(),
            application_name: Some("psql".to_string()),
            verbose_errors: false,
        }
    }

    #[test]
    fn test_session_id_is_hex_start_and_pid() {
        assert_eq!(session().session_id(), "6553f100.1092");
    }

    #[test]
    fn test_remote_endpoint() {
        let mut s = session();
        assert_eq!(s.remote_endpoint().as_deref(), Some("10.0.0.7:51234"));
        s.remote_port = Some(String::new());
        assert_eq!(s.remote_endpoint().as_deref(), Some("10.0.0.7"));
        s.remote_host = None;
        assert_eq!(s.remote_endpoint(), None);
    }

    #[test]
    fn test_stripped_message() {
        let event = SourceEvent::new("AUDIT: SESSION,1,1,READ");
        assert_eq!(event.stripped_message(7), "SESSION,1,1,READ");
        assert_eq!(event.stripped_message(0), "AUDIT: SESSION,1,1,READ");
        assert_eq!(event.stripped_message(500), "AUDIT: SESSION,1,1,READ");
    }

    #[test]
    fn test_detail_log_preferred() {
        let mut event = SourceEvent::new("x");
        event.detail = Some("client detail".to_string());
        assert_eq!(event.effective_detail(), Some("client detail"));
        event.detail_log = Some("server detail".to_string());
        assert_eq!(event.effective_detail(), Some("server detail"));
    }

    #[test]
    fn test_hidden_statement_not_printed() {
        let mut event = SourceEvent::new("x").with_statement("SELECT 1");
        assert_eq!(event.printable_statement(), Some("SELECT 1"));
        event.hide_statement = true;
        assert_eq!(event.printable_statement(), None);
    }

    #[test]
    fn test_severity_keywords() {
        assert_eq!(Severity::from_keyword("WARNING"), Some(Severity::Warning));
        assert_eq!(Severity::from_keyword("DEBUG3"), Some(Severity::Debug));
        assert_eq!(Severity::from_keyword("STATEMENT"), None);
        assert_eq!(Severity::Fatal.keyword(), "FATAL");
    }
}
