//! Turns server stderr log lines back into log events.
//!
//! A message line looks like `<log_line_prefix>LOG:  <message>`. The
//! prefix is not parsed: the line is scanned for the first severity
//! keyword followed by `:  `. Lines such as `DETAIL:  ...` or
//! `STATEMENT:  ...` that follow a message belong to it, as do
//! tab-indented lines continuing a multi-line field.

use auditspool_core::{Severity, SourceEvent, SourceLocation};

/// Severity keywords of message lines.
const SEVERITIES: &[&str] = &[
    "PANIC", "FATAL", "ERROR", "WARNING", "NOTICE", "INFO", "LOG", "DEBUG1", "DEBUG2", "DEBUG3",
    "DEBUG4", "DEBUG5",
];

/// Separator the server prints after every keyword.
const KEYWORD_SEPARATOR: &str = ":  ";

/// Field a continuation line fills in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Message,
    Detail,
    Hint,
    Query,
    Context,
    Location,
    Statement,
}

const CONTINUATIONS: &[(&str, Field)] = &[
    ("DETAIL", Field::Detail),
    ("HINT", Field::Hint),
    ("QUERY", Field::Query),
    ("CONTEXT", Field::Context),
    ("LOCATION", Field::Location),
    ("STATEMENT", Field::Statement),
];

#[derive(Debug, PartialEq)]
enum Line<'a> {
    Message {
        severity: Severity,
        sql_state: Option<&'a str>,
        text: &'a str,
    },
    Continuation(Field, &'a str),
    Indented(&'a str),
    Other(&'a str),
}

/// Finds the earliest `KEYWORD:  ` in `line` among `keywords`.
fn find_keyword<'a>(
    line: &'a str,
    keywords: impl Iterator<Item = &'a str>,
) -> Option<(usize, &'a str)> {
    keywords
        .filter_map(|keyword| {
            let mut from = 0;
            while let Some(found) = line[from..].find(keyword) {
                let pos = from + found;
                if line[pos + keyword.len()..].starts_with(KEYWORD_SEPARATOR) {
                    return Some((pos, keyword));
                }
                from = pos + keyword.len();
            }
            None
        })
        .min_by_key(|&(pos, _)| pos)
}

fn classify(line: &str) -> Line<'_> {
    if let Some(rest) = line.strip_prefix('\t') {
        return Line::Indented(rest);
    }

    let message = find_keyword(line, SEVERITIES.iter().copied());
    let continuation = find_keyword(line, CONTINUATIONS.iter().map(|(k, _)| *k));

    match (message, continuation) {
        (Some((pos, keyword)), other) if other.is_none_or(|(cpos, _)| pos <= cpos) => {
            let text = &line[pos + keyword.len() + KEYWORD_SEPARATOR.len()..];
            let (sql_state, text) = split_sql_state(text);
            Line::Message {
                severity: Severity::from_keyword(keyword).unwrap_or_default(),
                sql_state,
                text,
            }
        }
        (_, Some((pos, keyword))) => {
            let field = CONTINUATIONS
                .iter()
                .find(|(k, _)| *k == keyword)
                .map_or(Field::Detail, |(_, f)| *f);
            Line::Continuation(field, &line[pos + keyword.len() + KEYWORD_SEPARATOR.len()..])
        }
        _ => Line::Other(line),
    }
}

/// Splits a leading `XXXXX: ` SQLSTATE (printed in verbose mode). Every
/// SQLSTATE has at least one digit, which keeps `AUDIT: ` out.
fn split_sql_state(text: &str) -> (Option<&str>, &str) {
    let bytes = text.as_bytes();
    if bytes.len() > 7
        && bytes[..5]
            .iter()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        && bytes[..5].iter().any(u8::is_ascii_digit)
        && text[5..].starts_with(": ")
    {
        return (Some(&text[..5]), text[7..].trim_start());
    }
    (None, text)
}

/// Parses `func, file:line` or `file:line`.
fn parse_location(text: &str) -> Option<SourceLocation> {
    let (funcname, place) = match text.split_once(", ") {
        Some((func, place)) => (Some(func.to_string()), place),
        None => (None, text),
    };
    let (filename, lineno) = place.rsplit_once(':')?;
    Some(SourceLocation {
        filename: filename.to_string(),
        lineno: lineno.trim().parse().ok()?,
        funcname,
    })
}

/// Groups lines into events.
#[derive(Debug, Default)]
pub struct EventAssembler {
    pending: Option<SourceEvent>,
    last_field: Option<Field>,
}

impl EventAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line. Returns the previous event once a new one starts.
    pub fn push_line(&mut self, line: &str) -> Option<SourceEvent> {
        match classify(line) {
            Line::Message {
                severity,
                sql_state,
                text,
            } => {
                let mut event = SourceEvent::new(text).with_severity(severity);
                if let Some(state) = sql_state {
                    event.sql_state = state.to_string();
                }
                self.last_field = Some(Field::Message);
                self.pending.replace(event)
            }
            Line::Continuation(field, text) => match self.pending.as_mut() {
                Some(event) => {
                    apply(event, field, text);
                    self.last_field = Some(field);
                    None
                }
                None => Some(SourceEvent::new(line)),
            },
            Line::Indented(text) => match (self.pending.as_mut(), self.last_field) {
                (Some(event), Some(field)) => {
                    extend(event, field, text);
                    None
                }
                _ => Some(SourceEvent::new(line)),
            },
            Line::Other(text) => {
                let finished = self.flush();
                self.pending = Some(SourceEvent::new(text));
                self.last_field = Some(Field::Message);
                finished
            }
        }
    }

    /// Returns the event being assembled, if any.
    pub fn flush(&mut self) -> Option<SourceEvent> {
        self.last_field = None;
        self.pending.take()
    }
}

fn apply(event: &mut SourceEvent, field: Field, text: &str) {
    let value = Some(text.to_string());
    match field {
        Field::Message => event.message = text.to_string(),
        Field::Detail => event.detail = value,
        Field::Hint => event.hint = value,
        Field::Query => event.internal_query = value,
        Field::Context => event.context = value,
        Field::Statement => event.statement = value,
        Field::Location => event.location = parse_location(text),
    }
}

fn extend(event: &mut SourceEvent, field: Field, text: &str) {
    let target = match field {
        Field::Message => {
            event.message.push('\n');
            event.message.push_str(text);
            return;
        }
        Field::Detail => &mut event.detail,
        Field::Hint => &mut event.hint,
        Field::Query => &mut event.internal_query,
        Field::Context => &mut event.context,
        Field::Statement => &mut event.statement,
        Field::Location => return,
    };
    if let Some(value) = target {
        value.push('\n');
        value.push_str(text);
    }
}

/// Renders an event the way the server prints it, one field per line.
pub fn render_server_lines(event: &SourceEvent) -> String {
    let mut out = format!("{}:  {}\n", event.severity.keyword(), event.message);
    let fields = [
        ("DETAIL", event.effective_detail()),
        ("HINT", event.hint.as_deref()),
        ("QUERY", event.internal_query.as_deref()),
        ("CONTEXT", event.context.as_deref()),
        ("STATEMENT", event.printable_statement()),
    ];
    for (keyword, value) in fields {
        if let Some(value) = value {
            out.push_str(keyword);
            out.push_str(KEYWORD_SEPARATOR);
            out.push_str(&value.replace('\n', "\n\t"));
            out.push('\n');
        }
    }
    out
}
