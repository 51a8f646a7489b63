//! Shared value types crossing the bridge boundary: handles, request ids and
//! the event payloads delivered to the host application.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const PARTIAL_RESPONSE_EVENT: &str = "onPartialResponse";
pub const ERROR_RESPONSE_EVENT: &str = "onErrorResponse";
pub const FINAL_RESPONSE_EVENT: &str = "onResponse";

/// Opaque identifier of one loaded model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl Handle {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier scoping the callbacks of one generation call.
///
/// Hosts send either numbers or strings; both forms are kept as-is so that
/// events echo back exactly what the caller supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl RequestId {
    /// Canonical decimal strings become `Number`; anything that would not
    /// print back identically ("007", "+7") stays text.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(match raw.parse::<u64>() {
            Ok(n) if n.to_string() == raw => RequestId::Number(n),
            _ => RequestId::Text(raw.to_string()),
        })
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::Text(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::Text(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    PartialResponse,
    ErrorResponse,
}

impl EventKind {
    pub fn event_name(self) -> &'static str {
        match self {
            EventKind::PartialResponse => PARTIAL_RESPONSE_EVENT,
            EventKind::ErrorResponse => ERROR_RESPONSE_EVENT,
        }
    }
}

/// Body of `onPartialResponse` / `onErrorResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub handle: Handle,
    pub request_id: RequestId,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEvent {
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl BridgeEvent {
    pub fn partial(handle: Handle, request_id: RequestId, chunk: impl Into<String>) -> Self {
        Self {
            kind: EventKind::PartialResponse,
            payload: EventPayload {
                handle,
                request_id,
                data: chunk.into(),
            },
        }
    }

    pub fn error(handle: Handle, request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::ErrorResponse,
            payload: EventPayload {
                handle,
                request_id,
                data: message.into(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.event_name()
    }

    pub fn handle(&self) -> Handle {
        self.payload.handle
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Resolved value of a finished generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResponse {
    pub handle: Handle,
    pub request_id: RequestId,
    pub response: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_parse_prefers_numbers() {
        assert_eq!(RequestId::parse("42"), Some(RequestId::Number(42)));
        assert_eq!(
            RequestId::parse(" chat-7 "),
            Some(RequestId::Text("chat-7".to_string()))
        );
        assert_eq!(RequestId::parse("   "), None);
    }

    #[test]
    fn request_id_parse_keeps_non_canonical_numbers_as_text() {
        assert_eq!(RequestId::parse("007"), Some(RequestId::Text("007".to_string())));
        assert_eq!(RequestId::parse("+7"), Some(RequestId::Text("+7".to_string())));
        assert_ne!(RequestId::parse("7"), RequestId::parse("007"));

        let event = BridgeEvent::partial(Handle(1), RequestId::parse("007").expect("id"), "x");
        let json: serde_json::Value = serde_json::from_str(&event.to_json()).expect("valid json");
        assert_eq!(json["requestId"], "007");
    }

    #[test]
    fn event_payload_uses_bridge_field_names() {
        let event = BridgeEvent::partial(Handle(3), RequestId::Number(9), "Hel");
        let json: serde_json::Value = serde_json::from_str(&event.to_json()).expect("valid json");
        assert_eq!(json["handle"], 3);
        assert_eq!(json["requestId"], 9);
        assert_eq!(json["data"], "Hel");
        assert_eq!(event.name(), "onPartialResponse");
    }

    #[test]
    fn text_request_ids_serialize_as_strings() {
        let payload = EventPayload {
            handle: Handle(1),
            request_id: RequestId::from("abc"),
            data: "boom".to_string(),
        };
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["requestId"], "abc");

        let back: EventPayload = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, payload);
    }
}
