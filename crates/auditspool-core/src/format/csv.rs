//! CSV record rendering.
//!
//! Column order follows the host's csvlog layout so existing loaders can
//! ingest spool files unchanged.

use super::{FormatContext, format_location, format_log_time, format_start_time};
use crate::event::{SessionInfo, SourceEvent};

/// Renders one newline-terminated CSV line.
pub fn render_csv(
    event: &SourceEvent,
    session: &SessionInfo,
    ctx: &FormatContext,
    strip: usize,
) -> String {
    let mut line = String::with_capacity(256 + event.message.len());
    let mut row = Row { line: &mut line };

    row.text(&format_log_time(&ctx.log_time));
    row.text(session.user.as_deref().unwrap_or(""));
    row.text(session.database.as_deref().unwrap_or(""));
    row.text(&session.pid.to_string());
    row.text(session.remote_endpoint().as_deref().unwrap_or(""));
    row.text(&session.session_id());
    row.text(&ctx.line_number.to_string());
    row.text(&event.process_status);
    row.text(&format_start_time(&session.session_start));
    row.text(event.virtual_xid.as_deref().unwrap_or(""));
    row.text(&event.xid.to_string());
    row.text(&event.sql_state);
    row.text(event.stripped_message(strip));
    row.text(event.effective_detail().unwrap_or(""));
    row.text(event.hint.as_deref().unwrap_or(""));
    row.text(event.internal_query.as_deref().unwrap_or(""));
    row.position(event.internal_query.is_some(), event.internal_pos);
    row.text(event.context.as_deref().unwrap_or(""));
    let statement = event.printable_statement();
    row.text(statement.unwrap_or(""));
    row.position(statement.is_some(), event.cursor_pos);
    row.text(format_location(event, session).as_deref().unwrap_or(""));
    row.last(session.application_name.as_deref().unwrap_or(""));

    line
}

struct Row<'a> {
    line: &'a mut String,
}

impl Row<'_> {
    fn text(&mut self, value: &str) {
        push_field(self.line, value);
        self.line.push(',');
    }

    /// A 1-based position, printed only when its text was printed.
    fn position(&mut self, printed: bool, pos: u32) {
        if printed && pos > 0 {
            self.line.push_str(&pos.to_string());
        }
        self.line.push(',');
    }

    fn last(&mut self, value: &str) {
        push_field(self.line, value);
        self.line.push('\n');
    }
}

/// Appends `value`, quoting it when it contains a separator, quote or newline.
fn push_field(line: &mut String, value: &str) {
    if value.contains([',', '"', '\n', '\r']) {
        line.push('"');
        for c in value.chars() {
            if c == '"' {
                line.push('"');
            }
            line.push(c);
        }
        line.push('"');
    } else {
        line.push_str(value);
    }
}

/// Splits a CSV line respecting double-quote escaping.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == ',' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);

    fields
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, session};
    use super::*;

    const COLUMNS: usize = 22;

    fn fields_of(line: &str) -> Vec<String> {
        split_csv_line(line.strip_suffix('\n').unwrap())
    }

    #[test]
    fn test_csv_strips_audit_marker_and_keeps_fields() {
        let mut event = SourceEvent::new("AUDIT: SESSION,1,1,READ,SELECT,,,SELECT 1,<none>")
            .with_statement("SELECT 1");
        event.process_status = "SELECT".to_string();
        event.virtual_xid = Some("3/17".to_string());

        let line = render_csv(&event, &session(), &context(), 7);
        let fields = fields_of(&line);

        assert_eq!(fields.len(), COLUMNS);
        assert!(fields[0].starts_with("2024-01-01 10:30:00.000"));
        assert_eq!(fields[1], "alice");
        assert_eq!(fields[2], "app");
        assert_eq!(fields[3], "4242");
        assert_eq!(fields[4], "10.0.0.7:51234");
        assert_eq!(fields[5], session().session_id());
        assert_eq!(fields[6], "3");
        assert_eq!(fields[7], "SELECT");
        assert!(fields[8].starts_with("2024-01-01 10:00:00"));
        assert_eq!(fields[9], "3/17");
        assert_eq!(fields[10], "0");
        assert_eq!(fields[11], "00000");
        assert_eq!(fields[12], "SESSION,1,1,READ,SELECT,,,SELECT 1,<none>");
        assert_eq!(fields[18], "SELECT 1");
        assert_eq!(fields[21], "psql");
    }

    #[test]
    fn test_csv_round_trip_of_awkward_text() {
        let mut event = SourceEvent::new("connection authorized: user=\"bob\", db=x");
        event.detail = Some("line one\nline two".to_string());
        event.hint = Some("say \"hi\"".to_string());
        event.context = Some("PL/pgSQL function f(), line 3".to_string());

        let line = render_csv(&event, &session(), &context(), 0);
        assert_eq!(line.matches('\n').count(), 2, "embedded newline stays quoted");

        let fields = fields_of(&line);
        assert_eq!(fields.len(), COLUMNS);
        assert_eq!(fields[12], event.message);
        assert_eq!(fields[13], "line one\nline two");
        assert_eq!(fields[14], "say \"hi\"");
        assert_eq!(fields[17], "PL/pgSQL function f(), line 3");
    }

    #[test]
    fn test_csv_positions_require_their_text() {
        let mut event = SourceEvent::new("x");
        event.internal_pos = 5;
        event.cursor_pos = 9;
        let fields = fields_of(&render_csv(&event, &session(), &context(), 0));
        assert_eq!(fields[16], "");
        assert_eq!(fields[19], "");

        event.internal_query = Some("SELECT f()".to_string());
        event.statement = Some("SELECT g()".to_string());
        let fields = fields_of(&render_csv(&event, &session(), &context(), 0));
        assert_eq!(fields[16], "5");
        assert_eq!(fields[19], "9");

        event.hide_statement = true;
        let fields = fields_of(&render_csv(&event, &session(), &context(), 0));
        assert_eq!(fields[18], "");
        assert_eq!(fields[19], "");
    }

    #[test]
    fn test_csv_missing_session_values_are_empty() {
        let mut s = session();
        s.user = None;
        s.database = None;
        s.remote_host = None;
        s.application_name = None;
        let fields = fields_of(&render_csv(&SourceEvent::new("x"), &s, &context(), 0));
        assert_eq!(fields[1], "");
        assert_eq!(fields[2], "");
        assert_eq!(fields[4], "");
        assert_eq!(fields[21], "");
    }

    #[test]
    fn test_split_csv_line() {
        let fields = split_csv_line(r#"hello,"world, ""quoted""",123"#);
        assert_eq!(fields, vec!["hello", "world, \"quoted\"", "123"]);
    }
}
