//! Agent stream parser — decodes the line-delimited JSON event stream the
//! agent CLI emits in `--print --output-format stream-json --verbose` mode.
//!
//! The stream is noisy in practice: terminals prepend escape sequences,
//! the agent prints status lines between events, and blank lines appear
//! freely. The parser skips anything that is not a recognized JSON event
//! and aggregates the facts the engine cares about: the session id, tool
//! activity, and the final error verdict.

use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Recognized `type` values. Anything else is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    System,
    Assistant,
    User,
    Result,
}

impl EventKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(EventKind::System),
            "assistant" => Some(EventKind::Assistant),
            "user" => Some(EventKind::User),
            "result" => Some(EventKind::Result),
            _ => None,
        }
    }
}

/// A tool invocation observed in an `assistant` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
}

/// A tool answer observed in a `user` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
}

/// One decoded line of the stream.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub is_error: bool,
    pub error_message: Option<String>,
    pub tool_uses: Vec<ToolUse>,
    pub tool_results: Vec<ToolResult>,
}

impl StreamEvent {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            subtype: None,
            session_id: None,
            is_error: false,
            error_message: None,
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

/// Aggregate over a whole stream.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Session id, preferring the `system`/`init` event over any later one.
    pub session_id: Option<String>,
    pub is_error: bool,
    pub error_message: Option<String>,
    pub tool_call_count: usize,
    pub events: Vec<StreamEvent>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Incremental parser. Feed lines via [`parse_line`](Self::parse_line) or
/// a full capture via [`parse_all`](Self::parse_all) (which resets first).
#[derive(Debug, Default)]
pub struct StreamParser {
    session_id: Option<String>,
    is_error: bool,
    error_message: Option<String>,
    tool_call_count: usize,
    events: Vec<StreamEvent>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line. Returns `None` for blank lines, non-JSON noise, and
    /// unrecognized event types.
    pub fn parse_line(&mut self, line: &str) -> Option<&StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        // Terminal escape codes and status prefixes can precede the JSON
        // object on an otherwise valid line.
        let line = match line.find('{') {
            Some(0) => line,
            Some(i) => {
                tracing::trace!(prefix_len = i, "stripping non-JSON prefix");
                &line[i..]
            }
            None => {
                tracing::trace!(line = %crate::pulse::truncate(line, 50), "skipping non-JSON line");
                return None;
            }
        };

        let data: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                tracing::trace!(line = %crate::pulse::truncate(line, 50), "skipping unparsable line");
                return None;
            }
        };

        let kind = EventKind::parse(data.get("type")?.as_str()?)?;
        let mut event = StreamEvent::new(kind);
        event.subtype = data.get("subtype").and_then(Value::as_str).map(String::from);
        event.session_id = data
            .get("session_id")
            .and_then(Value::as_str)
            .map(String::from);

        match kind {
            EventKind::System => {
                // The init event is the earliest (and authoritative) place
                // the session identity appears.
                if event.subtype.as_deref() == Some("init") {
                    if let Some(sid) = &event.session_id {
                        tracing::debug!(session_id = %sid, "session id from init event");
                        self.session_id = Some(sid.clone());
                    }
                }
            }
            EventKind::Assistant => {
                for item in content_blocks(&data) {
                    if item.get("type").and_then(Value::as_str) == Some("tool_use") {
                        let tool = ToolUse {
                            id: str_field(item, "id"),
                            name: str_field(item, "name"),
                        };
                        tracing::trace!(tool = %tool.name, "tool use");
                        event.tool_uses.push(tool);
                        self.tool_call_count += 1;
                    }
                }
            }
            EventKind::User => {
                for item in content_blocks(&data) {
                    if item.get("type").and_then(Value::as_str) == Some("tool_result") {
                        event.tool_results.push(ToolResult {
                            tool_use_id: str_field(item, "tool_use_id"),
                        });
                    }
                }
            }
            EventKind::Result => {
                event.is_error = data
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if event.is_error {
                    self.is_error = true;
                    // The first element of the errors array carries the
                    // human-readable message.
                    if let Some(first) = data
                        .get("errors")
                        .and_then(Value::as_array)
                        .and_then(|a| a.first())
                        .and_then(Value::as_str)
                    {
                        event.error_message = Some(first.to_string());
                        self.error_message = Some(first.to_string());
                    }
                }
                // Late fallback only; never overrides the init event.
                if self.session_id.is_none() {
                    if let Some(sid) = &event.session_id {
                        self.session_id = Some(sid.clone());
                    }
                }
            }
        }

        self.events.push(event);
        self.events.last()
    }

    /// Parse a complete stdout capture. Resets state first.
    pub fn parse_all(&mut self, stdout: &str) -> StreamSummary {
        self.reset();
        for line in stdout.lines() {
            self.parse_line(line);
        }
        self.summary()
    }

    /// Snapshot of the aggregate so far.
    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            session_id: self.session_id.clone(),
            is_error: self.is_error,
            error_message: self.error_message.clone(),
            tool_call_count: self.tool_call_count,
            events: self.events.clone(),
        }
    }

    /// Clear state for reuse.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn content_blocks(data: &Value) -> impl Iterator<Item = &Value> {
    data.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|a| a.iter())
        .into_iter()
        .flatten()
}

fn str_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    const HAPPY_STREAM: &str = r#"
{"type":"system","subtype":"init","session_id":"sess-abc123"}
{"type":"assistant","message":{"content":[{"type":"text","text":"on it"},{"type":"tool_use","id":"tu_1","name":"read_calendar"}]}}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu_1"}]}}
{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu_2","name":"send_note"},{"type":"tool_use","id":"tu_3","name":"list_files"}]}}
{"type":"result","is_error":false,"session_id":"sess-abc123"}
"#;

    #[test]
    fn parses_happy_stream() {
        let mut parser = StreamParser::new();
        let summary = parser.parse_all(HAPPY_STREAM);
        assert_eq!(summary.session_id.as_deref(), Some("sess-abc123"));
        assert!(!summary.is_error);
        assert!(summary.error_message.is_none());
        assert_eq!(summary.tool_call_count, 3, "each tool_use block counts");
        assert_eq!(summary.events.len(), 5);
    }

    #[test]
    fn init_session_id_wins_over_result() {
        let stream = concat!(
            "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"first\"}\n",
            "{\"type\":\"result\",\"is_error\":false,\"session_id\":\"second\"}\n",
        );
        let summary = StreamParser::new().parse_all(stream);
        assert_eq!(summary.session_id.as_deref(), Some("first"));
    }

    #[test]
    fn result_session_id_is_late_fallback() {
        let stream = "{\"type\":\"result\",\"is_error\":false,\"session_id\":\"only\"}\n";
        let summary = StreamParser::new().parse_all(stream);
        assert_eq!(summary.session_id.as_deref(), Some("only"));
    }

    #[test]
    fn extracts_first_error_from_errors_array() {
        let stream = r#"{"type":"result","is_error":true,"errors":["Error: rate limited","Error: secondary"]}"#;
        let summary = StreamParser::new().parse_all(stream);
        assert!(summary.is_error);
        assert_eq!(summary.error_message.as_deref(), Some("Error: rate limited"));
    }

    #[test]
    fn tolerates_noise_and_blank_lines() {
        let noisy = format!(
            "\n\x1b]9;9;/home/user\x07{}\nplain status line\n   \nnot json at all\n{}\n",
            r#"{"type":"system","subtype":"init","session_id":"s1"}"#,
            r#"{"type":"result","is_error":false}"#,
        );
        let summary = StreamParser::new().parse_all(&noisy);
        assert_eq!(summary.session_id.as_deref(), Some("s1"));
        assert_eq!(summary.events.len(), 2, "noise lines produce no events");
        assert!(!summary.is_error);
    }

    #[test]
    fn noise_prefix_does_not_change_aggregate() {
        let clean = StreamParser::new().parse_all(HAPPY_STREAM);
        let prefixed: String = HAPPY_STREAM
            .lines()
            .map(|l| {
                if l.trim_start().starts_with('{') {
                    format!(">>> {l}\n")
                } else {
                    format!("{l}\n")
                }
            })
            .collect();
        let noisy = StreamParser::new().parse_all(&prefixed);
        assert_eq!(noisy.session_id, clean.session_id);
        assert_eq!(noisy.is_error, clean.is_error);
        assert_eq!(noisy.tool_call_count, clean.tool_call_count);
        assert_eq!(noisy.events.len(), clean.events.len());
    }

    #[test]
    fn unknown_types_are_skipped() {
        let stream = "{\"type\":\"telemetry\",\"x\":1}\n{\"no_type\":true}\n";
        let summary = StreamParser::new().parse_all(stream);
        assert!(summary.events.is_empty());
    }

    #[test]
    fn parse_all_resets_prior_state() {
        let mut parser = StreamParser::new();
        parser.parse_all(r#"{"type":"result","is_error":true,"errors":["Error: boom"]}"#);
        let second = parser.parse_all(r#"{"type":"result","is_error":false}"#);
        assert!(!second.is_error);
        assert!(second.error_message.is_none());
        assert_eq!(second.events.len(), 1);
    }

    #[test]
    fn reset_clears_state() {
        let mut parser = StreamParser::new();
        parser.parse_line(r#"{"type":"system","subtype":"init","session_id":"s"}"#);
        parser.reset();
        let summary = parser.summary();
        assert!(summary.session_id.is_none());
        assert!(summary.events.is_empty());
    }

    #[test]
    fn event_round_trips_attributes() {
        let mut parser = StreamParser::new();
        let event = parser
            .parse_line(r#"{"type":"system","subtype":"init","session_id":"sess-1"}"#)
            .unwrap();
        assert_eq!(event.kind, EventKind::System);
        assert_eq!(event.subtype.as_deref(), Some("init"));
        assert_eq!(event.session_id.as_deref(), Some("sess-1"));
        assert!(!event.is_error);
    }
}
