//! Typed envelope for inbound events.

use serde_json::Value;

/// One event as delivered to subscription callbacks.
///
/// The raw payload is always preserved. Decoding is best-effort: an event
/// whose payload is not valid JSON still reaches wildcard subscribers with
/// `decoded` unset, and an event whose `type` member is missing or not a
/// string counts as untyped.
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    /// The payload bytes exactly as they arrived (NUL and padding already
    /// stripped by the frame codec).
    pub raw: Vec<u8>,
    /// The event's `type` member, when present as a string.
    pub event_type: Option<String>,
    /// The parsed payload, when it was valid JSON.
    pub decoded: Option<Value>,
}

impl EventEnvelope {
    /// Build an envelope from a frame payload.
    pub fn from_payload(raw: Vec<u8>) -> Self {
        let decoded: Option<Value> = serde_json::from_slice(&raw).ok();
        let event_type = decoded
            .as_ref()
            .and_then(|value| value.get("type"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        EventEnvelope {
            raw,
            event_type,
            decoded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_event() {
        let envelope =
            EventEnvelope::from_payload(br#"{"type":"focus_changed","window":7}"#.to_vec());
        assert_eq!(envelope.event_type.as_deref(), Some("focus_changed"));
        assert_eq!(envelope.decoded, Some(json!({"type": "focus_changed", "window": 7})));
    }

    #[test]
    fn test_missing_type_is_untyped() {
        let envelope = EventEnvelope::from_payload(br#"{"window":7}"#.to_vec());
        assert!(envelope.event_type.is_none());
        assert!(envelope.decoded.is_some());
    }

    #[test]
    fn test_non_string_type_is_untyped() {
        let envelope = EventEnvelope::from_payload(br#"{"type":42}"#.to_vec());
        assert!(envelope.event_type.is_none());
        assert!(envelope.decoded.is_some());
    }

    #[test]
    fn test_invalid_json_keeps_raw() {
        let envelope = EventEnvelope::from_payload(b"not json".to_vec());
        assert!(envelope.event_type.is_none());
        assert!(envelope.decoded.is_none());
        assert_eq!(envelope.raw, b"not json");
    }
}
