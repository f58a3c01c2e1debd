//! JSON-lines record rendering.

use serde::Serialize;

use super::{FormatContext, format_log_time};
use crate::event::{SessionInfo, SourceEvent};

/// Value of the `log.source` key.
const LOG_SOURCE: &str = "auditspool";

#[derive(Serialize)]
struct JsonRecord<'a> {
    #[serde(rename = "log.source")]
    source: &'static str,
    severity: &'static str,
    timestamp: String,
    #[serde(rename = "db.user", skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(rename = "db.name", skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    #[serde(rename = "custom.process_id")]
    process_id: String,
    #[serde(rename = "net.peer.name", skip_serializing_if = "Option::is_none")]
    peer_name: Option<&'a str>,
    #[serde(rename = "net.peer.port", skip_serializing_if = "Option::is_none")]
    peer_port: Option<&'a str>,
    #[serde(rename = "custom.session_id")]
    session_id: String,
    #[serde(rename = "custom.line_num")]
    line_num: String,
    #[serde(rename = "custom.command_tag")]
    command_tag: &'a str,
    #[serde(
        rename = "custom.virtual_transaction_id",
        skip_serializing_if = "Option::is_none"
    )]
    virtual_xid: Option<&'a str>,
    #[serde(rename = "custom.transaction_id")]
    xid: String,
    #[serde(rename = "custom.state_code")]
    state_code: &'a str,
    #[serde(flatten)]
    audit: Option<AuditFields<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(rename = "custom.detail_log", skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
    #[serde(rename = "custom.err_hint", skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
    #[serde(rename = "custom.internal_query", skip_serializing_if = "Option::is_none")]
    internal_query: Option<&'a str>,
    #[serde(
        rename = "custom.internal_query_pos",
        skip_serializing_if = "Option::is_none"
    )]
    internal_pos: Option<String>,
    #[serde(rename = "custom.context", skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
    #[serde(rename = "custom.debug_query", skip_serializing_if = "Option::is_none")]
    statement: Option<&'a str>,
    #[serde(rename = "custom.cursor_pos", skip_serializing_if = "Option::is_none")]
    cursor_pos: Option<String>,
    #[serde(rename = "custom.source_filename", skip_serializing_if = "Option::is_none")]
    source_filename: Option<&'a str>,
    #[serde(rename = "custom.source_linenum", skip_serializing_if = "Option::is_none")]
    source_linenum: Option<String>,
    #[serde(rename = "custom.source_funcname", skip_serializing_if = "Option::is_none")]
    source_funcname: Option<&'a str>,
    #[serde(
        rename = "custom.application_name",
        skip_serializing_if = "Option::is_none"
    )]
    application_name: Option<&'a str>,
}

/// Leading columns of a pgaudit line: `AUDIT_TYPE,STATEMENT_ID,SUBSTATEMENT_ID,
/// CLASS,COMMAND,OBJECT_TYPE,OBJECT_NAME,STATEMENT,PARAMETER`.
#[derive(Serialize, Default)]
struct AuditFields<'a> {
    #[serde(rename = "custom.audit_type", skip_serializing_if = "Option::is_none")]
    audit_type: Option<&'a str>,
    #[serde(rename = "custom.statement_id", skip_serializing_if = "Option::is_none")]
    statement_id: Option<&'a str>,
    #[serde(rename = "custom.substatement_id", skip_serializing_if = "Option::is_none")]
    substatement_id: Option<&'a str>,
    #[serde(rename = "custom.class", skip_serializing_if = "Option::is_none")]
    class: Option<&'a str>,
    #[serde(rename = "custom.command", skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
    #[serde(rename = "custom.object_type", skip_serializing_if = "Option::is_none")]
    object_type: Option<&'a str>,
    #[serde(rename = "custom.object_name", skip_serializing_if = "Option::is_none")]
    object_name: Option<&'a str>,
}

/// Splits a pgaudit message into its leading columns and the remaining
/// text (statement and parameters).
fn split_audit_message(message: &str) -> (AuditFields<'_>, Option<&str>) {
    let mut parts = message.splitn(8, ',');
    let fields = AuditFields {
        audit_type: parts.next(),
        statement_id: parts.next(),
        substatement_id: parts.next(),
        class: parts.next(),
        command: parts.next(),
        object_type: parts.next(),
        object_name: parts.next(),
    };
    (fields, parts.next())
}

/// Renders one newline-terminated JSON object.
pub fn render_json(
    event: &SourceEvent,
    session: &SessionInfo,
    ctx: &FormatContext,
    strip: usize,
) -> Result<String, serde_json::Error> {
    let (audit, content) = if strip > 0 {
        let (fields, rest) = split_audit_message(event.stripped_message(strip));
        (Some(fields), rest)
    } else {
        (None, Some(event.message.as_str()))
    };

    let statement = event.printable_statement();
    let location = event
        .location
        .as_ref()
        .filter(|_| session.verbose_errors);

    let record = JsonRecord {
        source: LOG_SOURCE,
        severity: "audit",
        timestamp: format_log_time(&ctx.log_time),
        user: session.user.as_deref(),
        database: session.database.as_deref(),
        process_id: session.pid.to_string(),
        peer_name: session.remote_host.as_deref(),
        peer_port: session
            .remote_host
            .as_ref()
            .and(session.remote_port.as_deref())
            .filter(|port| !port.is_empty()),
        session_id: session.session_id(),
        line_num: ctx.line_number.to_string(),
        command_tag: &event.process_status,
        virtual_xid: event.virtual_xid.as_deref(),
        xid: event.xid.to_string(),
        state_code: &event.sql_state,
        audit,
        content,
        detail: event.effective_detail(),
        hint: event.hint.as_deref(),
        internal_query: event.internal_query.as_deref(),
        internal_pos: event
            .internal_query
            .as_ref()
            .filter(|_| event.internal_pos > 0)
            .map(|_| event.internal_pos.to_string()),
        context: event.context.as_deref(),
        statement,
        cursor_pos: statement
            .filter(|_| event.cursor_pos > 0)
            .map(|_| event.cursor_pos.to_string()),
        source_filename: location.map(|l| l.filename.as_str()),
        source_linenum: location.map(|l| l.lineno.to_string()),
        source_funcname: location.and_then(|l| l.funcname.as_deref()),
        application_name: session.application_name.as_deref(),
    };

    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, session};
    use super::*;
    use serde_json::Value;

    fn parse(line: &str) -> serde_json::Map<String, Value> {
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        match serde_json::from_str(line.trim_end()).unwrap() {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_json_splits_pgaudit_columns() {
        let event = SourceEvent::new(
            "AUDIT: SESSION,1,1,READ,SELECT,TABLE,public.t,SELECT * FROM t,<none>",
        );
        let record = parse(&render_json(&event, &session(), &context(), 7).unwrap());

        assert_eq!(record["log.source"], "auditspool");
        assert_eq!(record["severity"], "audit");
        assert_eq!(record["db.user"], "alice");
        assert_eq!(record["net.peer.port"], "51234");
        assert_eq!(record["custom.line_num"], "3");
        assert_eq!(record["custom.audit_type"], "SESSION");
        assert_eq!(record["custom.statement_id"], "1");
        assert_eq!(record["custom.substatement_id"], "1");
        assert_eq!(record["custom.class"], "READ");
        assert_eq!(record["custom.command"], "SELECT");
        assert_eq!(record["custom.object_type"], "TABLE");
        assert_eq!(record["custom.object_name"], "public.t");
        assert_eq!(record["content"], "SELECT * FROM t,<none>");
    }

    #[test]
    fn test_json_connection_message_is_content() {
        let event = SourceEvent::new("connection authorized: user=alice");
        let record = parse(&render_json(&event, &session(), &context(), 0).unwrap());
        assert_eq!(record["content"], "connection authorized: user=alice");
        assert!(!record.contains_key("custom.audit_type"));
    }

    #[test]
    fn test_json_omits_absent_values() {
        let mut s = session();
        s.remote_host = None;
        s.application_name = None;
        let record = parse(&render_json(&SourceEvent::new("x"), &s, &context(), 0).unwrap());
        assert!(!record.contains_key("net.peer.name"));
        assert!(!record.contains_key("net.peer.port"));
        assert!(!record.contains_key("custom.application_name"));
        assert!(!record.contains_key("custom.err_hint"));
        assert!(!record.contains_key("custom.cursor_pos"));
    }

    #[test]
    fn test_json_escapes_text() {
        let mut event = SourceEvent::new(
            "AUDIT: SESSION,1,1,DDL,CREATE TABLE,,,\"CREATE TABLE \"\"x\"\"\"\n,<none>",
        );
        event.hint = Some("tab\there".to_string());
        let record = parse(&render_json(&event, &session(), &context(), 7).unwrap());
        assert_eq!(record["custom.err_hint"], "tab\there");
        assert!(record["content"].as_str().unwrap().contains('\n'));
    }

    #[test]
    fn test_json_key_order_is_stable() {
        let event = SourceEvent::new("AUDIT: SESSION,1,1,READ,SELECT,,,SELECT 1,<none>");
        let line = render_json(&event, &session(), &context(), 7).unwrap();
        let source = line.find("\"log.source\"").unwrap();
        let timestamp = line.find("\"timestamp\"").unwrap();
        let audit_type = line.find("\"custom.audit_type\"").unwrap();
        let content = line.find("\"content\"").unwrap();
        let app = line.find("\"custom.application_name\"").unwrap();
        assert!(
            source < timestamp && timestamp < audit_type && audit_type < content && content < app
        );
    }
}
