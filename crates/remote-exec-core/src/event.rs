//! Stream events delivered by the remote execution service.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Connection state owned by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live connection.
    #[default]
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The event stream is open and the handshake event was received.
    Connected,
    /// The last attempt failed or reconnection gave up.
    Error,
}

/// Discriminant of a [`StreamEvent`], taken from its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    ExecutionStart,
    TickStart,
    TickEnd,
    ContentStart,
    ContentDelta,
    ContentEnd,
    ToolCallStart,
    ToolResult,
    Result,
    ExecutionEnd,
    ToolConfirmationRequired,
    Connection,
    Channel,
    Error,
    /// Any type this library has no special handling for.
    Other(String),
}

impl EventKind {
    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ExecutionStart => "execution_start",
            Self::TickStart => "tick_start",
            Self::TickEnd => "tick_end",
            Self::ContentStart => "content_start",
            Self::ContentDelta => "content_delta",
            Self::ContentEnd => "content_end",
            Self::ToolCallStart => "tool_call_start",
            Self::ToolResult => "tool_result",
            Self::Result => "result",
            Self::ExecutionEnd => "execution_end",
            Self::ToolConfirmationRequired => "tool_confirmation_required",
            Self::Connection => "connection",
            Self::Channel => "channel",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "execution_start" => Self::ExecutionStart,
            "tick_start" => Self::TickStart,
            "tick_end" => Self::TickEnd,
            "content_start" => Self::ContentStart,
            "content_delta" => Self::ContentDelta,
            "content_end" => Self::ContentEnd,
            "tool_call_start" => Self::ToolCallStart,
            "tool_result" => Self::ToolResult,
            "result" => Self::Result,
            "execution_end" => Self::ExecutionEnd,
            "tool_confirmation_required" => Self::ToolConfirmationRequired,
            "connection" => Self::Connection,
            "channel" => Self::Channel,
            "error" => Self::Error,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event from the multiplexed stream or a send response body.
///
/// Only the routing fields are typed; everything else stays in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Globally unique id, used for de-duplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl StreamEvent {
    /// Create an event of the given kind with no payload.
    #[must_use]
    pub fn new(kind: impl Into<EventKind>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            session_id: None,
            execution_id: None,
            sequence: None,
            data: Map::new(),
        }
    }

    /// Set the de-duplication id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the owning session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Add a payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Timestamp in milliseconds, when the server sent a numeric one.
    #[must_use]
    pub fn timestamp(&self) -> Option<i64> {
        self.data.get("timestamp").and_then(Value::as_i64)
    }

    /// Text carried by a `content_delta` event.
    ///
    /// Accepts both `{"delta": "..."}` and `{"delta": {"text": "..."}}`.
    #[must_use]
    pub fn delta_text(&self) -> Option<&str> {
        match self.data.get("delta") {
            Some(Value::String(s)) => Some(s),
            Some(Value::Object(obj)) => obj.get("text").and_then(Value::as_str),
            _ => self.data.get("text").and_then(Value::as_str),
        }
    }

    /// Terminal payload of a `result` event.
    ///
    /// Reads the nested `result` value when present, otherwise the whole
    /// payload. `Some` for every `result` event, see
    /// [`SessionResultPayload::from_value`].
    #[must_use]
    pub fn result_payload(&self) -> Option<SessionResultPayload> {
        if self.kind != EventKind::Result {
            return None;
        }
        let value = self
            .data
            .get("result")
            .cloned()
            .unwrap_or_else(|| Value::Object(self.data.clone()));
        Some(SessionResultPayload::from_value(value))
    }

    /// Confirmation request carried by a `tool_confirmation_required` event.
    #[must_use]
    pub fn tool_confirmation(&self) -> Option<crate::ToolConfirmationRequest> {
        if self.kind != EventKind::ToolConfirmationRequired {
            return None;
        }
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| tracing::warn!(error = %e, "Malformed tool confirmation request"))
            .ok()
    }

    /// Channel envelope carried by a `channel` event.
    ///
    /// The wire shape is `{type: "channel", sessionId, channel, event: {type, payload, id?, metadata?}}`.
    #[must_use]
    pub fn channel_event(&self) -> Option<ChannelEvent> {
        if self.kind != EventKind::Channel {
            return None;
        }
        let channel = self.data.get("channel").and_then(Value::as_str)?;
        let mut inner = match self.data.get("event") {
            Some(Value::Object(obj)) => obj.clone(),
            _ => return None,
        };
        inner
            .entry("channel")
            .or_insert_with(|| Value::String(channel.to_string()));
        serde_json::from_value(Value::Object(inner))
            .map_err(|e| tracing::warn!(channel, error = %e, "Malformed channel event"))
            .ok()
    }

    /// Whether this event marks the end of streamed text.
    #[must_use]
    pub fn is_end_marker(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ContentEnd | EventKind::Result | EventKind::ExecutionEnd
        )
    }
}

/// Terminal output of one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResultPayload {
    /// Final text response, when the execution produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Everything else the server attached (usage, structured output, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionResultPayload {
    /// Interpret a `result` value. Never fails: a bare string becomes the
    /// response, anything else unrecognised is kept raw under `extra["result"]`.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(response) => Self {
                response: Some(response),
                extra: Map::new(),
            },
            Value::Object(_) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Unrecognised result payload, keeping it raw");
                Self::raw(value)
            }),
            other => Self::raw(other),
        }
    }

    fn raw(value: Value) -> Self {
        let mut extra = Map::new();
        extra.insert("result".into(), value);
        Self {
            response: None,
            extra,
        }
    }
}

/// An event on a named per-session side channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Correlation id; present only on requests and their replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChannelEvent {
    /// Create an uncorrelated channel event.
    #[must_use]
    pub fn new(channel: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            kind: kind.into(),
            payload,
            id: None,
            metadata: None,
        }
    }

    /// Whether this event answers a pending request.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.id.is_some() && matches!(self.kind.as_str(), "response" | "error")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_kind_roundtrip_keeps_unknown_types() {
        let event: StreamEvent =
            serde_json::from_value(json!({"type": "custom_thing", "x": 1})).unwrap();
        assert_eq!(event.kind, EventKind::Other("custom_thing".into()));
        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["type"], "custom_thing");
        assert_eq!(back["x"], 1);
    }

    #[test]
    fn test_routing_fields_are_typed() {
        let event: StreamEvent = serde_json::from_value(json!({
            "type": "content_delta",
            "id": "evt-1",
            "sessionId": "s1",
            "executionId": "e1",
            "sequence": 4,
            "delta": "hel"
        }))
        .unwrap();
        assert_eq!(event.kind, EventKind::ContentDelta);
        assert_eq!(event.session_id.as_deref(), Some("s1"));
        assert_eq!(event.execution_id.as_deref(), Some("e1"));
        assert_eq!(event.sequence, Some(4));
        assert_eq!(event.delta_text(), Some("hel"));
        assert!(!event.data.contains_key("sessionId"));
    }

    #[test]
    fn test_delta_text_nested() {
        let event = StreamEvent::new("content_delta").with_field("delta", json!({"text": "lo"}));
        assert_eq!(event.delta_text(), Some("lo"));
    }

    #[test]
    fn test_result_payload_nested_and_flat() {
        let nested = StreamEvent::new(EventKind::Result)
            .with_field("result", json!({"response": "done", "usage": {"tokens": 3}}));
        let payload = nested.result_payload().unwrap();
        assert_eq!(payload.response.as_deref(), Some("done"));
        assert_eq!(payload.extra["usage"]["tokens"], 3);

        let flat = StreamEvent::new(EventKind::Result).with_field("response", json!("ok"));
        assert_eq!(flat.result_payload().unwrap().response.as_deref(), Some("ok"));

        assert!(StreamEvent::new("tick_start").result_payload().is_none());
    }

    #[test]
    fn test_result_payload_keeps_non_object_results() {
        let text = StreamEvent::new(EventKind::Result).with_field("result", json!("plain"));
        assert_eq!(text.result_payload().unwrap().response.as_deref(), Some("plain"));

        let list = StreamEvent::new(EventKind::Result).with_field("result", json!([1, 2]));
        let payload = list.result_payload().unwrap();
        assert_eq!(payload.response, None);
        assert_eq!(payload.extra["result"], json!([1, 2]));

        let odd = StreamEvent::new(EventKind::Result)
            .with_field("result", json!({"response": 7, "usage": {}}));
        assert_eq!(odd.result_payload().unwrap().extra["result"]["response"], 7);
    }

    #[test]
    fn test_channel_event_takes_channel_from_envelope() {
        let event = StreamEvent::new(EventKind::Channel)
            .with_session("s1")
            .with_field("channel", json!("ui"))
            .with_field(
                "event",
                json!({"type": "response", "payload": {"ok": true}, "id": "r1"}),
            );
        let ch = event.channel_event().unwrap();
        assert_eq!(ch.channel, "ui");
        assert_eq!(ch.kind, "response");
        assert!(ch.is_reply());
    }

    #[test]
    fn test_tool_confirmation_parse() {
        let event = StreamEvent::new("tool_confirmation_required").with_field(
            "toolUseId",
            json!("tu-1"),
        )
        .with_field("name", json!("bash"))
        .with_field("arguments", json!({"cmd": "ls"}));
        let req = event.tool_confirmation().unwrap();
        assert_eq!(req.tool_use_id, "tu-1");
        assert_eq!(req.name, "bash");
        assert!(req.message.is_none());
    }
}
