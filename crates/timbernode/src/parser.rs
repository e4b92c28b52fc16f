//! Log line parsing: timestamp prefix, severity, structured attributes.
//!
//! Kubernetes log lines arrive as `<RFC3339Nano timestamp> <body>`. The
//! body is probed for structure in order: JSON, logfmt, then a set of
//! regex fallbacks for bare severity markers. Parsing never fails; an
//! unparseable line keeps its body verbatim with `Unknown` severity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use timber_proto::Severity;

/// Severity field names consulted on the structured path, in order.
const SEVERITY_KEYS: [&str; 3] = ["level", "severity", "lvl"];

/// Canonical attribute keys and their accepted aliases. The `msg` family
/// replaces the outgoing message instead of becoming an attribute.
const CANONICAL_ALIASES: [(&str, &[&str]); 7] = [
    ("msg", &["msg", "message", "error", "err"]),
    ("trace_id", &["trace_id", "traceId", "trace-id", "traceID"]),
    ("span_id", &["span_id", "spanId", "span-id", "spanID"]),
    (
        "request_id",
        &["request_id", "requestId", "request-id", "requestID", "req_id"],
    ),
    ("caller", &["caller", "source", "file", "location"]),
    ("service", &["service", "app", "application"]),
    ("user_id", &["user_id", "userId", "user"]),
];

/// Attributes kept per entry; extras are dropped.
const MAX_ATTRIBUTES: usize = 20;

/// The parsed components of a log line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    /// Timestamp from the line prefix, or the current time.
    pub timestamp: DateTime<Utc>,
    /// Extracted severity, `Unknown` if undetectable.
    pub severity: Severity,
    /// The log body. For JSON/logfmt lines with a recognized message
    /// field, that field's value; otherwise the body verbatim.
    pub message: String,
    /// Extracted structured fields, `None` rather than an empty map.
    pub attributes: Option<HashMap<String, String>>,
}

/// Extracts timestamps, severity, and well-known structured attributes
/// from heterogeneous line formats.
pub struct Parser {
    severity_patterns: Vec<Regex>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// Creates a parser with the common format patterns compiled.
    ///
    /// # Panics
    ///
    /// Panics if a built-in pattern fails to compile, which would be a
    /// programming error.
    #[must_use]
    pub fn new() -> Self {
        const LEVELS: &str = "TRACE|DEBUG|INFO|WARN|WARNING|ERROR|FATAL|PANIC";
        let patterns = [
            // JSON-like level field on lines that failed strict parsing.
            format!(r#"(?i)"level"\s*:\s*"({LEVELS})""#),
            // Bracket format: [INFO], [ERROR].
            format!(r"(?i)\[({LEVELS})\]"),
            // Pair format: level=INFO.
            format!(r"(?i)level=({LEVELS})\b"),
            // Prefix format: INFO:, ERROR:.
            format!(r"(?i)\b({LEVELS}):"),
        ];
        Self {
            severity_patterns: patterns
                .iter()
                .map(|p| Regex::new(p).expect("built-in severity pattern"))
                .collect(),
        }
    }

    /// Parses a single raw log line. Never fails.
    #[must_use]
    pub fn parse(&self, line: &str) -> ParsedLine {
        let (timestamp, body) = split_timestamp(line);

        if let Some(structured) = parse_json(body).or_else(|| parse_logfmt(body)) {
            return ParsedLine {
                timestamp,
                severity: structured.severity,
                message: structured.message.unwrap_or_else(|| body.to_string()),
                attributes: structured.attributes,
            };
        }

        ParsedLine {
            timestamp,
            severity: self.regex_severity(body),
            message: body.to_string(),
            attributes: None,
        }
    }

    /// Applies the fallback patterns to an unstructured body.
    fn regex_severity(&self, body: &str) -> Severity {
        for pattern in &self.severity_patterns {
            if let Some(caps) = pattern.captures(body) {
                if let Some(level) = caps.get(1) {
                    return Severity::parse(level.as_str());
                }
            }
        }
        Severity::Unknown
    }
}

/// Splits a leading RFC3339/RFC3339Nano timestamp from the body.
///
/// Lines without a parseable prefix keep their full content as the body
/// and are stamped with the current time.
fn split_timestamp(line: &str) -> (DateTime<Utc>, &str) {
    // Minimum prefix: "2024-01-15T10:30:00Z " is 21 bytes.
    if line.len() < 21 {
        return (Utc::now(), line);
    }

    let Some(space_idx) = line.find(' ') else {
        return (Utc::now(), line);
    };
    if space_idx < 20 {
        return (Utc::now(), line);
    }

    let (prefix, rest) = line.split_at(space_idx);
    match DateTime::parse_from_rfc3339(prefix) {
        Ok(ts) => (ts.with_timezone(&Utc), &rest[1..]),
        Err(_) => (Utc::now(), line),
    }
}

/// Structured data pulled out of a JSON or logfmt body.
struct Structured {
    severity: Severity,
    message: Option<String>,
    attributes: Option<HashMap<String, String>>,
}

impl Structured {
    /// A body counts as structured only if it yielded something.
    fn detected(&self) -> bool {
        self.severity != Severity::Unknown
            || self.message.is_some()
            || self.attributes.is_some()
    }
}

/// Strict JSON path: the body must begin with `{` and parse into an
/// object.
fn parse_json(body: &str) -> Option<Structured> {
    if !body.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let map = value.as_object()?;

    let fields: Vec<(&str, Option<String>)> = map
        .iter()
        .map(|(k, v)| (k.as_str(), stringify_scalar(v)))
        .collect();

    let structured = extract_structured(&fields);
    structured.detected().then_some(structured)
}

/// logfmt path: `key=value` pairs with optional double-quoted values.
fn parse_logfmt(body: &str) -> Option<Structured> {
    if !body.contains('=') || body.starts_with('{') {
        return None;
    }
    let pairs = parse_logfmt_fields(body);
    if pairs.is_empty() {
        return None;
    }

    let fields: Vec<(&str, Option<String>)> = pairs
        .iter()
        .map(|(k, v)| (k.as_str(), (!v.is_empty()).then(|| v.clone())))
        .collect();

    let structured = extract_structured(&fields);
    structured.detected().then_some(structured)
}

/// Shared severity/canonicalization/cap logic over stringified fields.
///
/// `fields` carries every key with its scalar rendering (`None` for
/// non-scalar or empty values, which never become attributes).
fn extract_structured(fields: &[(&str, Option<String>)]) -> Structured {
    let lookup = |key: &str| -> Option<&Option<String>> {
        fields.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    };

    // Severity: first key with a non-empty value wins.
    let mut severity = Severity::Unknown;
    for key in SEVERITY_KEYS {
        if let Some(Some(value)) = lookup(key) {
            severity = Severity::parse(value);
            break;
        }
    }

    let mut message = None;
    let mut attributes = HashMap::new();
    let mut consumed: Vec<&str> = SEVERITY_KEYS.to_vec();

    // Canonical groups: the first matching alias supplies the value; all
    // aliases of every group are withheld from the residual attributes.
    for (canonical, aliases) in CANONICAL_ALIASES {
        consumed.extend_from_slice(aliases);
        for alias in aliases {
            if let Some(Some(value)) = lookup(alias) {
                if canonical == "msg" {
                    message = Some(value.clone());
                } else {
                    attributes.insert(canonical.to_string(), value.clone());
                }
                break;
            }
        }
    }

    // Remaining scalar fields survive verbatim, in sorted key order so
    // the attribute cap drops the same keys every time.
    let mut residual: Vec<(&str, &String)> = fields
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|value| (*k, value)))
        .filter(|(k, _)| !consumed.contains(k))
        .collect();
    residual.sort_by_key(|(k, _)| *k);

    for (key, value) in residual {
        if attributes.len() >= MAX_ATTRIBUTES {
            break;
        }
        attributes.insert(key.to_string(), value.clone());
    }

    Structured {
        severity,
        message,
        attributes: (!attributes.is_empty()).then_some(attributes),
    }
}

/// Renders a JSON scalar for attribute storage. Nested objects, arrays,
/// and null are dropped; integral floats render without a decimal point.
fn stringify_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => (!s.is_empty()).then(|| s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if f.is_finite() && f == f.trunc() && f.abs() < 9.2e18 {
                    Some(format!("{}", f as i64))
                } else {
                    Some(format!("{f}"))
                }
            }
        }
        _ => None,
    }
}

/// Parses logfmt `key=value` pairs, honoring double-quoted values with
/// backslash escapes. Valid key characters: alphanumerics, `_`, `-`, `.`.
fn parse_logfmt_fields(body: &str) -> Vec<(String, String)> {
    let bytes = body.as_bytes();
    let n = bytes.len();
    let mut fields = Vec::new();
    let mut i = 0;

    while i < n {
        while i < n && (bytes[i] == b' ' || bytes[i] == b'\t') {
            i += 1;
        }
        if i >= n {
            break;
        }

        let key_start = i;
        while i < n && is_key_char(bytes[i]) {
            i += 1;
        }
        if i == key_start || i >= n || bytes[i] != b'=' {
            // Not a key=value token; skip to the next whitespace.
            while i < n && bytes[i] != b' ' && bytes[i] != b'\t' {
                i += 1;
            }
            continue;
        }

        let key = String::from_utf8_lossy(&bytes[key_start..i]).into_owned();
        i += 1; // skip '='

        if i >= n {
            fields.push((key, String::new()));
            break;
        }

        let value = if bytes[i] == b'"' {
            i += 1; // skip opening quote
            let value_start = i;
            while i < n {
                if bytes[i] == b'\\' && i + 1 < n {
                    i += 2;
                    continue;
                }
                if bytes[i] == b'"' {
                    break;
                }
                i += 1;
            }
            let raw = &bytes[value_start..i];
            if i < n && bytes[i] == b'"' {
                i += 1; // skip closing quote
            }
            unescape_logfmt_value(raw)
        } else {
            let value_start = i;
            while i < n && bytes[i] != b' ' && bytes[i] != b'\t' {
                i += 1;
            }
            String::from_utf8_lossy(&bytes[value_start..i]).into_owned()
        };

        fields.push((key, value));
    }

    fields
}

const fn is_key_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.'
}

/// Handles `\"`, `\\`, `\n`, `\t`, `\r` in quoted logfmt values.
fn unescape_logfmt_value(raw: &[u8]) -> String {
    if !raw.contains(&b'\\') {
        return String::from_utf8_lossy(raw).into_owned();
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && i + 1 < raw.len() {
            match raw[i + 1] {
                b'"' | b'\\' => out.push(raw[i + 1]),
                b'n' => out.push(b'\n'),
                b't' => out.push(b'\t'),
                b'r' => out.push(b'\r'),
                other => out.push(other),
            }
            i += 2;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
