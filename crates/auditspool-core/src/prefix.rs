//! Connection/disconnection message classification.
//!
//! The host formats connection messages from fixed templates such as
//! `connection authorized: user=%s database=%s`. Everything before the
//! first substitution marker is constant, so an incoming message is
//! recognised by comparing it against those literal prefixes. The
//! catalogue is built once and never changes afterwards.

/// Templates of messages logged when a client connects or authenticates.
pub const CONNECTION_TEMPLATES: &[&str] = &[
    "connection received: host=%s port=%s",
    "connection received: host=%s",
    "connection authorized: user=%s",
    "connection authenticated: identity=\"%s\" method=%s (%s:%d)",
    "replication connection authorized: user=%s",
    "replication connection authorized: user=%s SSL enabled (protocol=%s, cipher=%s, bits=%d, compression=%s)",
    "replication connection authorized: user=%s application_name=%s",
    "replication connection authorized: user=%s application_name=%s SSL enabled (protocol=%s, cipher=%s, bits=%d, compression=%s)",
    "password authentication failed for user \"%s\"",
    "authentication failed for user \"%s\": host rejected",
    "\"trust\" authentication failed for user \"%s\"",
    "Ident authentication failed for user \"%s\"",
    "Peer authentication failed for user \"%s\"",
    "password authentication failed for user \"%s\"",
    "SSPI authentication failed for user \"%s\"",
    "PAM authentication failed for user \"%s\"",
    "BSD authentication failed for user \"%s\"",
    "LDAP authentication failed for user \"%s\"",
    "certificate authentication failed for user \"%s\"",
    "RADIUS authentication failed for user \"%s\"",
    "authentication failed for user \"%s\": invalid authentication method",
    "connection authorized: user=%s database=%s",
    "connection authorized: user=%s database=%s SSL enabled (protocol=%s, cipher=%s, bits=%d, compression=%s)",
    "connection authorized: user=%s database=%s application_name=%s",
    "connection authorized: user=%s database=%s application_name=%s SSL enabled (protocol=%s, cipher=%s, bits=%d, compression=%s)",
];

/// Templates of messages logged when a session ends.
pub const DISCONNECTION_TEMPLATES: &[&str] =
    &["disconnection: session time: %d:%02d:%02d.%03d user=%s database=%s host=%s%s%s"];

/// Marker that starts every substitution in a template.
const PLACEHOLDER: char = '%';

/// Literal text a templated message is guaranteed to start with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPrefix {
    text: String,
}

impl LogPrefix {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// ASCII case-insensitive `starts_with`.
    pub fn matches(&self, message: &str) -> bool {
        message
            .as_bytes()
            .get(..self.text.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(self.text.as_bytes()))
    }
}

/// Builds the ordered, de-duplicated set of literal prefixes.
///
/// Templates whose prefix is empty (they start with a placeholder) are
/// skipped, since an empty prefix would match every message.
pub fn build(templates: &[&str]) -> Vec<LogPrefix> {
    let mut prefixes: Vec<LogPrefix> = Vec::new();
    for template in templates {
        let text = template
            .split_once(PLACEHOLDER)
            .map_or(*template, |(head, _)| head);
        if text.is_empty() || prefixes.iter().any(|p| p.text == text) {
            continue;
        }
        prefixes.push(LogPrefix {
            text: text.to_string(),
        });
    }
    prefixes
}

/// Returns true if `message` starts with any of `prefixes`, ignoring ASCII case.
pub fn is_prefixed(message: &str, prefixes: &[LogPrefix]) -> bool {
    prefixes.iter().any(|p| p.matches(message))
}

/// Both prefix sets, built from the fixed template lists.
#[derive(Debug, Clone, Default)]
pub struct PrefixCatalogue {
    pub connection: Vec<LogPrefix>,
    pub disconnection: Vec<LogPrefix>,
}

impl PrefixCatalogue {
    pub fn new() -> Self {
        Self {
            connection: build(CONNECTION_TEMPLATES),
            disconnection: build(DISCONNECTION_TEMPLATES),
        }
    }

    pub fn is_connection(&self, message: &str) -> bool {
        is_prefixed(message, &self.connection)
    }

    pub fn is_disconnection(&self, message: &str) -> bool {
        is_prefixed(message, &self.disconnection)
    }
}
