//! Serialization of one spooled record.
//!
//! Both formats produce exactly one newline-terminated line per event.

mod csv;
mod json;

use chrono::{DateTime, Local};

use crate::config::OutputFormat;
use crate::event::{SessionInfo, SourceEvent};

pub use csv::{render_csv, split_csv_line};
pub use json::render_json;

/// Record time with milliseconds and zone, e.g. `2024-01-01 10:30:00.123 +01:00`.
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %Z";
/// Session start time, second precision.
const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

/// Per-record values supplied by the writer.
#[derive(Debug, Clone, Copy)]
pub struct FormatContext {
    pub log_time: DateTime<Local>,
    /// Sequence number of this record within the process, starting at 1.
    pub line_number: u64,
}

/// Renders `event` in the requested format.
///
/// `strip` is the number of leading message bytes to drop (the audit
/// marker), 0 for connection and disconnection messages.
pub fn render(
    format: OutputFormat,
    event: &SourceEvent,
    session: &SessionInfo,
    ctx: &FormatContext,
    strip: usize,
) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Csv => Ok(render_csv(event, session, ctx, strip)),
        OutputFormat::Json => render_json(event, session, ctx, strip),
    }
}

fn format_log_time(time: &DateTime<Local>) -> String {
    time.format(LOG_TIME_FORMAT).to_string()
}

fn format_start_time(time: &DateTime<Local>) -> String {
    time.format(START_TIME_FORMAT).to_string()
}

/// `func, file:line` or `file:line`; only printed in verbose mode.
fn format_location(event: &SourceEvent, session: &SessionInfo) -> Option<String> {
    if !session.verbose_errors {
        return None;
    }
    let location = event.location.as_ref()?;
    Some(match &location.funcname {
        Some(func) => format!("{}, {}:{}", func, location.filename, location.lineno),
        None => format!("{}:{}", location.filename, location.lineno),
    })
}
