//! Configuration for the gRPC mock engine.
//!
//! Defines stubs, input matchers, output scripts and global settings. Output
//! entries are decoded once, when the stub file is loaded, into [`OutputKind`].

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// A single message payload (one protobuf message in its JSON form).
pub type Payload = serde_json::Map<String, Value>;

/// Header or trailer metadata.
pub type Metadata = HashMap<String, String>;

/// Main configuration: the stub file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockConfig {
    /// List of stub definitions
    #[serde(default)]
    pub stubs: Vec<Stub>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl MockConfig {
    /// Load configuration from a YAML (or JSON) file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for (i, stub) in self.stubs.iter().enumerate() {
            stub.validate()
                .map_err(|e| anyhow::anyhow!("Stub {}: {}", i, e))?;
            if !seen.insert(stub.id.as_str()) {
                anyhow::bail!("Stub {}: duplicate id '{}'", i, stub.id);
            }
        }
        Ok(())
    }
}

/// A recorded expectation and the response script to replay for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Stub {
    /// Unique identifier for this stub
    #[serde(default)]
    pub id: String,

    /// Optional name/description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Fully qualified service name (e.g. `helloworld.Greeter`)
    pub service: String,

    /// Method name (e.g. `SayHello`)
    pub method: String,

    /// Priority among stubs matching the same call (higher wins)
    #[serde(default)]
    pub priority: i32,

    /// Maximum number of successful executions (0 = unlimited)
    #[serde(default)]
    pub times: u32,

    /// Whether this stub is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Matcher applied to request headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Matcher>,

    /// Matcher for unary and server-streaming requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Matcher>,

    /// Per-message matchers for client-streaming and bidirectional calls
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Matcher>,

    /// Alternative output scripts, tried in order
    #[serde(default)]
    pub outputs: Vec<Output>,

    /// Headers sent before the first message
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: Metadata,

    /// Trailers sent after the last message
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_trailers: Metadata,
}

fn default_true() -> bool {
    true
}

impl Stub {
    /// Validate the stub definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("Stub id cannot be empty");
        }
        if self.service.is_empty() || self.method.is_empty() {
            anyhow::bail!("Stub '{}' must name a service and a method", self.id);
        }
        if self.outputs.is_empty() {
            anyhow::bail!("Stub '{}' has no outputs", self.id);
        }

        let matchers = self
            .headers
            .iter()
            .chain(self.input.iter())
            .chain(self.inputs.iter());
        for matcher in matchers {
            matcher.validate()?;
        }

        for (i, output) in self.outputs.iter().enumerate() {
            if let Some(issue) = output.issues().first() {
                anyhow::bail!("output {}: {}", i, issue);
            }
            if let OutputKind::Sequence(items) = output.kind() {
                for item in items {
                    if let Some(guard) = &item.guard {
                        guard.validate()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The matcher that describes the first request message, if any.
    pub fn primary_input(&self) -> Option<&Matcher> {
        self.inputs.first().or(self.input.as_ref())
    }
}

/// Structural expectation over a message payload.
///
/// All present conditions are ANDed; `any` is an OR over nested matchers.
/// An empty matcher accepts every candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Matcher {
    /// Exact recursive match on the listed keys
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub equals: Payload,

    /// Recursive containment, substring for strings
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub contains: Payload,

    /// Field name to regex pattern
    #[serde(skip_serializing_if = "FieldPatterns::is_empty")]
    pub matches: FieldPatterns,

    /// Nested alternatives, at least one must match
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Matcher>,

    /// Compare arrays as multisets under `equals` and `contains`
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignore_array_order: bool,
}

const MATCHER_KEYS: [&str; 5] = ["equals", "contains", "matches", "any", "ignoreArrayOrder"];

impl Matcher {
    /// Matcher requiring `equals` on the given fields.
    pub fn equals(fields: Payload) -> Self {
        Self {
            equals: fields,
            ..Self::default()
        }
    }

    /// Whether every condition is absent.
    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
            && self.contains.is_empty()
            && self.matches.is_empty()
            && self.any.is_empty()
    }

    /// Decode a legacy sequence guard.
    ///
    /// A mapping spelled with matcher keys is a full matcher; any other mapping
    /// is an `equals` expectation.
    pub fn from_guard(map: &Payload) -> Self {
        let is_matcher = !map.is_empty() && map.keys().all(|k| MATCHER_KEYS.contains(&k.as_str()));
        if is_matcher {
            if let Ok(matcher) = serde_json::from_value(Value::Object(map.clone())) {
                return matcher;
            }
        }
        Self::equals(map.clone())
    }

    /// Check every regex pattern compiles, recursing into `any`.
    pub fn validate(&self) -> anyhow::Result<()> {
        for entry in self.matches.iter() {
            if entry.regex.is_none() {
                let error = Regex::new(&entry.pattern).err().map(|e| e.to_string()).unwrap_or_default();
                anyhow::bail!("Invalid regex for '{}': {}", entry.field, error);
            }
        }
        for nested in &self.any {
            nested.validate()?;
        }
        Ok(())
    }
}

/// Field regexes of a matcher, compiled once when the matcher is decoded.
///
/// A pattern that fails to compile is kept with no regex and never matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct FieldPatterns {
    entries: Vec<FieldPattern>,
}

#[derive(Debug, Clone)]
pub struct FieldPattern {
    pub field: String,
    pub pattern: String,
    pub regex: Option<Regex>,
}

impl FieldPatterns {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by field name.
    pub fn iter(&self) -> std::slice::Iter<'_, FieldPattern> {
        self.entries.iter()
    }
}

impl PartialEq for FieldPatterns {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.field == b.field && a.pattern == b.pattern)
    }
}

impl From<BTreeMap<String, String>> for FieldPatterns {
    fn from(patterns: BTreeMap<String, String>) -> Self {
        let entries = patterns
            .into_iter()
            .map(|(field, pattern)| FieldPattern {
                regex: Regex::new(&pattern).ok(),
                field,
                pattern,
            })
            .collect();
        Self { entries }
    }
}

impl From<FieldPatterns> for BTreeMap<String, String> {
    fn from(patterns: FieldPatterns) -> Self {
        patterns
            .entries
            .into_iter()
            .map(|e| (e.field, e.pattern))
            .collect()
    }
}

/// Shape of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcShape {
    Unary,
    ClientStream,
    ServerStream,
    Bidirectional,
}

impl RpcShape {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcShape::Unary => "unary",
            RpcShape::ClientStream => "client_stream",
            RpcShape::ServerStream => "server_stream",
            RpcShape::Bidirectional => "bidirectional",
        }
    }

    /// Whether the client sends a stream of messages.
    pub fn client_streams(self) -> bool {
        matches!(self, RpcShape::ClientStream | RpcShape::Bidirectional)
    }
}

impl std::fmt::Display for RpcShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RpcShape {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unary" => Ok(RpcShape::Unary),
            "client_stream" => Ok(RpcShape::ClientStream),
            "server_stream" => Ok(RpcShape::ServerStream),
            "bidirectional" | "bidi" => Ok(RpcShape::Bidirectional),
            other => anyhow::bail!("Unknown rpc shape: {}", other),
        }
    }
}

/// Final status of a call or stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// gRPC code name or number (`"NOT_FOUND"`, `"5"`)
    #[serde(default, deserialize_with = "code_from_any")]
    pub code: String,

    /// Status message
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    fn from_map(map: &Payload) -> Self {
        Self {
            code: map.get("code").map(scalar_string).unwrap_or_default(),
            message: map.get("message").map(scalar_string).unwrap_or_default(),
        }
    }
}

fn code_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(scalar_string(&value))
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One output alternative of a stub.
///
/// Keeps the raw mapping for serialization and the dialect decoded from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Payload", into = "Payload")]
pub struct Output {
    raw: Payload,
    kind: OutputKind,
    issues: Vec<String>,
}

/// Output dialect, checked in the order `data`, `stream`, `sequence`.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputKind {
    /// A single terminal payload
    Data(Payload),
    /// Ordered send/delay/end steps
    Stream(Vec<StreamStep>),
    /// Legacy guarded sequence
    Sequence(Vec<SequenceItem>),
    /// No known dialect; skipped at execution
    Unrecognized,
}

/// A single stream step.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
    Send(Payload),
    Delay(Duration),
    End(Status),
}

/// Item of the legacy `sequence` dialect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceItem {
    /// Guard evaluated against the first request (or headers)
    pub guard: Option<Matcher>,
    pub stream: Vec<StreamStep>,
    pub send_each: Option<SendEach>,
    /// Terminal payload
    pub data: Option<Payload>,
    /// Terminal status, only used together with `data`
    pub status: Option<Status>,
}

/// Replay one message per received request.
#[derive(Debug, Clone, PartialEq)]
pub struct SendEach {
    pub message: Payload,
    pub delay: Option<Duration>,
}

impl Output {
    /// The decoded dialect.
    pub fn kind(&self) -> &OutputKind {
        &self.kind
    }

    /// Problems found while decoding (malformed steps, bad delays).
    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    pub fn data(payload: Payload) -> Self {
        let mut raw = Payload::new();
        raw.insert("data".to_string(), Value::Object(payload));
        Self::from(raw)
    }
}

impl From<Payload> for Output {
    fn from(raw: Payload) -> Self {
        let mut issues = Vec::new();
        let kind = decode_output(&raw, &mut issues);
        Self { raw, kind, issues }
    }
}

impl From<Output> for Payload {
    fn from(output: Output) -> Self {
        output.raw
    }
}

fn decode_output(raw: &Payload, issues: &mut Vec<String>) -> OutputKind {
    if let Some(Value::Object(data)) = raw.get("data") {
        return OutputKind::Data(data.clone());
    }
    if let Some(Value::Array(steps)) = raw.get("stream") {
        return OutputKind::Stream(decode_steps(steps, issues));
    }
    if let Some(Value::Array(items)) = raw.get("sequence") {
        let items = items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item {
                Value::Object(map) => Some(decode_sequence_item(map, issues)),
                _ => {
                    issues.push(format!("sequence item {} is not a mapping", i));
                    None
                }
            })
            .collect();
        return OutputKind::Sequence(items);
    }
    issues.push("no data, stream or sequence key".to_string());
    OutputKind::Unrecognized
}

fn decode_steps(steps: &[Value], issues: &mut Vec<String>) -> Vec<StreamStep> {
    let mut decoded = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let Value::Object(map) = step else {
            issues.push(format!("stream step {} is not a mapping", i));
            continue;
        };

        if let Some(Value::Object(send)) = map.get("send") {
            decoded.push(StreamStep::Send(send.clone()));
            continue;
        }

        let delay = map.get("delay").map(scalar_string).unwrap_or_default();
        if !delay.is_empty() {
            match parse_duration(&delay) {
                Ok(d) => decoded.push(StreamStep::Delay(d)),
                Err(e) => issues.push(format!("stream step {}: delay '{}': {}", i, delay, e)),
            }
            continue;
        }

        if let Some(Value::Object(end)) = map.get("end") {
            decoded.push(StreamStep::End(Status::from_map(end)));
            continue;
        }

        issues.push(format!("stream step {} has no send, delay or end", i));
    }
    decoded
}

fn decode_sequence_item(map: &Payload, issues: &mut Vec<String>) -> SequenceItem {
    let mut item = SequenceItem::default();

    if let Some(Value::Object(guard)) = map.get("match") {
        item.guard = Some(Matcher::from_guard(guard));
    }
    if let Some(Value::Array(steps)) = map.get("stream") {
        item.stream = decode_steps(steps, issues);
    }
    if let Some(Value::Object(se)) = map.get("sendEach") {
        let message = match se.get("message") {
            Some(Value::Object(m)) => m.clone(),
            _ => Payload::new(),
        };
        let delay = se.get("delay").map(scalar_string).unwrap_or_default();
        let delay = if delay.is_empty() {
            None
        } else {
            match parse_duration(&delay) {
                Ok(d) => Some(d),
                Err(e) => {
                    issues.push(format!("sendEach delay '{}': {}", delay, e));
                    None
                }
            }
        };
        item.send_each = Some(SendEach { message, delay });
    }
    if let Some(Value::Object(data)) = map.get("data") {
        item.data = Some(data.clone());
    }
    if let Some(Value::Object(status)) = map.get("status") {
        item.status = Some(Status::from_map(status));
    }

    item
}

/// Error parsing a duration string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration")]
    Invalid,
    #[error("missing unit in duration")]
    MissingUnit,
    #[error("unknown unit '{0}' in duration")]
    UnknownUnit(String),
    #[error("negative duration")]
    Negative,
    #[error("duration out of range")]
    Overflow,
}

/// Parse a duration such as `300ms`, `1.5s` or `2m10s`.
///
/// Units: `ns`, `us` (`µs`), `ms`, `s`, `m`, `h`. A bare `0` is zero.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let (negative, mut rest) = match input.as_bytes().first() {
        None => return Err(DurationError::Empty),
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        Some(_) => (false, input),
    };
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(DurationError::Invalid);
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (int_part, after) = rest.split_at(int_len);
        let (frac_part, after) = match after.strip_prefix('.') {
            Some(stripped) => {
                let frac_len = stripped.bytes().take_while(u8::is_ascii_digit).count();
                stripped.split_at(frac_len)
            }
            None => ("", after),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(DurationError::Invalid);
        }

        let unit_len = after
            .find(|c: char| c == '.' || c.is_ascii_digit())
            .unwrap_or(after.len());
        let (unit, after) = after.split_at(unit_len);
        if unit.is_empty() {
            return Err(DurationError::MissingUnit);
        }
        let scale = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit(unit.to_string()))?;

        if !int_part.is_empty() {
            let whole: u128 = int_part.parse().map_err(|_| DurationError::Overflow)?;
            total = whole
                .checked_mul(scale)
                .and_then(|v| total.checked_add(v))
                .ok_or(DurationError::Overflow)?;
        }
        if !frac_part.is_empty() {
            let frac: f64 = format!("0.{}", frac_part)
                .parse()
                .map_err(|_| DurationError::Invalid)?;
            total += (frac * scale as f64) as u128;
        }

        rest = after;
    }

    if total > u128::from(u64::MAX) {
        return Err(DurationError::Overflow);
    }
    if negative && total > 0 {
        return Err(DurationError::Negative);
    }
    Ok(Duration::from_nanos(total as u64))
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60_000_000_000),
        "h" => Some(3_600_000_000_000),
        _ => None,
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log all matched calls
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched calls
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Maximum history records kept in memory (0 = unlimited)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Request bytes kept per history record (0 = unlimited)
    #[serde(default)]
    pub message_size_limit: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            history_limit: default_history_limit(),
            message_size_limit: 0,
        }
    }
}

fn default_history_limit() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_parse_simple_stub() {
        let yaml = r#"
stubs:
  - id: say-hello
    service: helloworld.Greeter
    method: SayHello
    input:
      equals:
        name: Bob
    outputs:
      - data:
          message: "Hello, Bob"
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.stubs.len(), 1);
        let stub = &config.stubs[0];
        assert_eq!(stub.id, "say-hello");
        assert!(stub.enabled);
        assert_eq!(stub.input.as_ref().unwrap().equals["name"], "Bob");
        match stub.outputs[0].kind() {
            OutputKind::Data(data) => assert_eq!(data["message"], "Hello, Bob"),
            other => panic!("Expected data output, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_stream_output() {
        let yaml = r#"
stubs:
  - id: ticks
    service: clock.Clock
    method: Watch
    outputs:
      - stream:
          - send: {tick: 1}
          - delay: 150ms
          - send: {tick: 2}
          - end: {code: 0, message: done}
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        let OutputKind::Stream(steps) = config.stubs[0].outputs[0].kind() else {
            panic!("Expected stream output");
        };
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[1], StreamStep::Delay(Duration::from_millis(150)));
        assert_eq!(steps[3], StreamStep::End(Status::new("0", "done")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dialect_precedence() {
        let output = Output::from(payload(json!({
            "sequence": [{"data": {"a": 1}}],
            "stream": [{"send": {"a": 2}}],
            "data": {"a": 3},
        })));
        assert_eq!(output.kind(), &OutputKind::Data(payload(json!({"a": 3}))));

        // A non-mapping data value falls through to the next dialect.
        let output = Output::from(payload(json!({
            "data": "oops",
            "stream": [{"send": {"a": 2}}],
        })));
        assert!(matches!(output.kind(), OutputKind::Stream(steps) if steps.len() == 1));
    }

    #[test]
    fn test_malformed_steps_are_skipped() {
        let output = Output::from(payload(json!({
            "stream": [
                {"send": {"a": 1}},
                {"wait": "1s"},
                "not-a-step",
                {"delay": "soon"},
                {"end": {"code": "OK"}},
            ]
        })));
        let OutputKind::Stream(steps) = output.kind() else {
            panic!("Expected stream output");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(output.issues().len(), 3);
    }

    #[test]
    fn test_unrecognized_output() {
        let output = Output::from(payload(json!({"reply": {"a": 1}})));
        assert_eq!(output.kind(), &OutputKind::Unrecognized);
        assert!(!output.issues().is_empty());
    }

    #[test]
    fn test_sequence_item_decoding() {
        let output = Output::from(payload(json!({
            "sequence": [
                {"match": {"name": "bob"}, "data": {"greeting": "hi bob"}, "status": {"code": 5, "message": "gone"}},
                {"match": {"contains": {"name": "al"}}, "sendEach": {"message": {"echo": true}, "delay": "5ms"}},
            ]
        })));
        let OutputKind::Sequence(items) = output.kind() else {
            panic!("Expected sequence output");
        };
        assert_eq!(items.len(), 2);

        let bare = items[0].guard.as_ref().unwrap();
        assert_eq!(bare.equals["name"], "bob");
        assert_eq!(items[0].status, Some(Status::new("5", "gone")));

        let full = items[1].guard.as_ref().unwrap();
        assert!(full.equals.is_empty());
        assert_eq!(full.contains["name"], "al");
        let send_each = items[1].send_each.as_ref().unwrap();
        assert_eq!(send_each.delay, Some(Duration::from_millis(5)));
        assert_eq!(send_each.message["echo"], true);
    }

    #[test]
    fn test_output_serializes_raw_form() {
        let raw = payload(json!({"stream": [{"send": {"a": 1}}, {"delay": "1s"}]}));
        let output = Output::from(raw.clone());
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value, Value::Object(raw));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert_eq!(parse_duration("10ms"), Ok(Duration::from_millis(10)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2m10s"), Ok(Duration::from_secs(130)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250us"), Ok(Duration::from_micros(250)));
        assert_eq!(parse_duration("250µs"), Ok(Duration::from_micros(250)));
        assert_eq!(parse_duration("7ns"), Ok(Duration::from_nanos(7)));
        assert_eq!(parse_duration(".5s"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("-0s"), Ok(Duration::ZERO));

        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert_eq!(parse_duration("100"), Err(DurationError::MissingUnit));
        assert_eq!(parse_duration("ms"), Err(DurationError::Invalid));
        assert_eq!(parse_duration("3d"), Err(DurationError::UnknownUnit("d".into())));
        assert_eq!(parse_duration("-1s"), Err(DurationError::Negative));
    }

    #[test]
    fn test_status_code_from_number() {
        let status: Status = serde_yaml::from_str("code: 14\nmessage: unavailable").unwrap();
        assert_eq!(status, Status::new("14", "unavailable"));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let yaml = r#"
stubs:
  - id: bad-regex
    service: s.S
    method: M
    input:
      any:
        - matches:
            name: "([a-z"
    outputs:
      - data: {}
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Stub 0"), "{err}");
        assert!(err.contains("Invalid regex"), "{err}");
    }

    #[test]
    fn test_field_patterns_compiled_on_decode() {
        let matcher: Matcher =
            serde_yaml::from_str("matches:\n  name: \"^B\"\n  code: \"([\"\n").unwrap();

        let fields: Vec<_> = matcher.matches.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["code", "name"]);
        assert!(matcher.matches.iter().all(|e| (e.field == "name") == e.regex.is_some()));

        let value = serde_json::to_value(&matcher).unwrap();
        assert_eq!(value, json!({"matches": {"code": "([", "name": "^B"}}));
    }

    #[test]
    fn test_validate_rejects_bad_delay_and_duplicates() {
        let yaml = r#"
stubs:
  - id: slow
    service: s.S
    method: M
    outputs:
      - stream:
          - delay: forever
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("forever"));

        let yaml = r#"
stubs:
  - {id: a, service: s.S, method: M, outputs: [{data: {}}]}
  - {id: a, service: s.S, method: N, outputs: [{data: {}}]}
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_matcher_from_guard() {
        let guard = Matcher::from_guard(&payload(json!({"equals": {"k": 1}, "ignoreArrayOrder": true})));
        assert_eq!(guard.equals["k"], 1);
        assert!(guard.ignore_array_order);

        // Mixed keys are not a matcher spelling.
        let guard = Matcher::from_guard(&payload(json!({"equals": 1, "other": 2})));
        assert_eq!(guard.equals.len(), 2);
    }

    #[test]
    fn test_settings_defaults() {
        let config: MockConfig = serde_yaml::from_str("stubs: []").unwrap();
        assert!(config.settings.log_matches);
        assert_eq!(config.settings.history_limit, 1000);
        assert_eq!(config.settings.message_size_limit, 0);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"stubs": [{{"id": "j", "service": "s.S", "method": "M", "outputs": [{{"data": {{"ok": true}}}}]}}]}}"#
        )
        .unwrap();
        let config = MockConfig::from_file(file.path()).unwrap();
        assert_eq!(config.stubs[0].id, "j");
    }

    #[test]
    fn test_demo_stubs_are_valid() {
        let config: MockConfig =
            serde_yaml::from_str(include_str!("../demos/default-stubs.yaml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.stubs.len(), 6);
        assert!(config
            .stubs
            .iter()
            .all(|s| s.outputs.iter().all(|o| o.issues().is_empty())));
    }
}
