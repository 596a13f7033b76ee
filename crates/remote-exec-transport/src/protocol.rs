//! Wire protocol for client-server communication.

use remote_exec_core::{CanonicalInput, ChannelEvent, Message, StreamEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of `POST /subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

/// Body of `POST /send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(flatten)]
    pub input: CanonicalInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Body of `POST /abort`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of `POST /close`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub session_id: String,
}

/// Body of `POST /tool-response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseRequest {
    pub session_id: String,
    pub tool_use_id: String,
    pub result: Value,
}

/// Body of `POST /channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPublishRequest {
    pub session_id: String,
    #[serde(flatten)]
    pub event: ChannelEvent,
}

/// Body of `POST /channel/subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSubscribeRequest {
    pub session_id: String,
    pub channel: String,
    pub client_id: String,
}

/// Body of `POST /invoke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

/// Body of `POST /queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRequest {
    pub session_id: String,
    pub message: Message,
}

/// Payload of the first `connection` event on the multiplexed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHandshake {
    pub connection_id: String,
    /// Sessions the server already has registered for this connection.
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

impl ConnectionHandshake {
    /// Read the handshake out of a `connection` event.
    #[must_use]
    pub fn from_event(event: &StreamEvent) -> Option<Self> {
        serde_json::from_value(Value::Object(event.data.clone())).ok()
    }
}

/// One frame of a streamed `invoke` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InvokeFrame {
    #[serde(rename = "method:chunk")]
    Chunk {
        #[serde(default)]
        chunk: Value,
    },
    #[serde(rename = "method:end")]
    End,
    #[serde(rename = "method:error")]
    Error {
        #[serde(default)]
        error: Value,
    },
}

/// Strip SSE framing from one line.
///
/// Returns the JSON text for `data:` lines and bare NDJSON lines, and
/// `None` for blank lines, comments, and other SSE fields.
#[must_use]
pub fn frame_payload(line: &str) -> Option<&str> {
    let line = line.trim_end_matches('\r');
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.strip_prefix(' ').unwrap_or(data).trim();
        return (!data.is_empty()).then_some(data);
    }
    let trimmed = line.trim();
    if trimmed.is_empty()
        || trimmed.starts_with(':')
        || ["event:", "id:", "retry:"]
            .iter()
            .any(|field| trimmed.starts_with(field))
    {
        return None;
    }
    Some(trimmed)
}

/// Flatten an `{type: "event", event, sessionId?, data}` envelope.
///
/// The result is `{type: <event>, sessionId?, ...data}`; envelope fields win
/// over same-named keys inside `data`. Other values pass through unchanged.
#[must_use]
pub fn flatten_envelope(value: Value) -> Value {
    let Value::Object(mut obj) = value else {
        return value;
    };
    if obj.get("type").and_then(Value::as_str) != Some("event") {
        return Value::Object(obj);
    }
    let Some(real_type) = obj.remove("event") else {
        return Value::Object(obj);
    };

    let mut flat = match obj.remove("data") {
        Some(Value::Object(data)) => data,
        Some(other) => {
            let mut m = Map::new();
            m.insert("data".to_string(), other);
            m
        }
        None => Map::new(),
    };
    obj.remove("type");
    for (key, val) in obj {
        flat.insert(key, val);
    }
    flat.insert("type".to_string(), real_type);
    Value::Object(flat)
}

/// Parse one line of an event stream.
///
/// `Ok(None)` means the line carried no event.
///
/// # Errors
/// Returns the JSON error for malformed frames.
pub fn parse_frame(line: &str) -> Result<Option<StreamEvent>, serde_json::Error> {
    let Some(payload) = frame_payload(line) else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(payload)?;
    serde_json::from_value(flatten_envelope(value)).map(Some)
}

/// Parse one line of a streamed `invoke` response.
///
/// # Errors
/// Returns the JSON error for malformed frames.
pub fn parse_invoke_frame(line: &str) -> Result<Option<InvokeFrame>, serde_json::Error> {
    frame_payload(line)
        .map(serde_json::from_str::<InvokeFrame>)
        .transpose()
}

#[cfg(test)]
mod tests {
    use remote_exec_core::EventKind;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_envelope_is_flattened_with_envelope_precedence() {
        let flat = flatten_envelope(json!({
            "type": "event",
            "event": "content_delta",
            "sessionId": "s1",
            "data": {"delta": "hi", "sessionId": "stale", "type": "ignored"}
        }));
        assert_eq!(
            flat,
            json!({"type": "content_delta", "sessionId": "s1", "delta": "hi"})
        );
    }

    #[test]
    fn test_plain_events_pass_through() {
        let value = json!({"type": "result", "result": {"response": "x"}});
        assert_eq!(flatten_envelope(value.clone()), value);
    }

    #[test]
    fn test_parse_frame_handles_sse_and_ndjson() {
        let sse = parse_frame(r#"data: {"type":"tick_start","sessionId":"s"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(sse.kind, EventKind::TickStart);
        assert_eq!(sse.session_id.as_deref(), Some("s"));

        let nd = parse_frame(r#"{"type":"execution_end"}"#).unwrap().unwrap();
        assert_eq!(nd.kind, EventKind::ExecutionEnd);

        assert!(parse_frame("").unwrap().is_none());
        assert!(parse_frame(": keepalive").unwrap().is_none());
        assert!(parse_frame("event: message").unwrap().is_none());
        assert!(parse_frame("data: {not json").is_err());
    }

    #[test]
    fn test_request_bodies_use_camel_case() {
        let body = serde_json::to_value(SubscribeRequest {
            connection_id: "c1".into(),
            add: vec!["s1".into()],
            remove: vec![],
        })
        .unwrap();
        assert_eq!(body, json!({"connectionId": "c1", "add": ["s1"]}));

        let body = serde_json::to_value(ChannelPublishRequest {
            session_id: "s1".into(),
            event: ChannelEvent::new("ui", "ping", json!({})),
        })
        .unwrap();
        assert_eq!(
            body,
            json!({"sessionId": "s1", "channel": "ui", "type": "ping", "payload": {}})
        );

        let body = serde_json::to_value(InvokeRequest {
            method: "m".into(),
            params: json!({}),
            stream: false,
        })
        .unwrap();
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_invoke_frames() {
        assert_eq!(
            parse_invoke_frame(r#"data: {"type":"method:chunk","chunk":{"n":1}}"#).unwrap(),
            Some(InvokeFrame::Chunk { chunk: json!({"n": 1}) })
        );
        assert_eq!(
            parse_invoke_frame(r#"{"type":"method:end"}"#).unwrap(),
            Some(InvokeFrame::End)
        );
    }

    #[test]
    fn test_handshake_from_connection_event() {
        let event = parse_frame(
            r#"data: {"type":"connection","connectionId":"c9","subscriptions":["a","b"]}"#,
        )
        .unwrap()
        .unwrap();
        let hs = ConnectionHandshake::from_event(&event).unwrap();
        assert_eq!(hs.connection_id, "c9");
        assert_eq!(hs.subscriptions, vec!["a", "b"]);
    }
}
