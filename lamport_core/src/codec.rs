//! Wire codec for peer-to-peer event notifications.
//!
//! One message is one compact JSON object followed by a single `\n`.
//! JSON string escaping keeps raw newlines out of the record, so the
//! delimiter is unambiguous.
//!
//! ```text
//! {"sender_id":1,"logical_clock":42,"sent_at":"2024-01-01T00:00:00.250Z"}\n
//! ```

use crate::error::CodecError;
use chrono::{DateTime, Utc};
use lamport_env::PeerId;
use serde::{Deserialize, Serialize};

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// An event notification sent from one peer to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sending peer
    pub sender_id: PeerId,

    /// Sender's logical clock after the send event
    pub logical_clock: u64,

    /// Sender's wall-clock time at send (UTC)
    pub sent_at: DateTime<Utc>,

    /// Free-form debug payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl Message {
    /// Creates a message without a debug payload.
    pub fn new(sender_id: PeerId, logical_clock: u64, sent_at: DateTime<Utc>) -> Self {
        Self {
            sender_id,
            logical_clock,
            sent_at,
            debug: None,
        }
    }

    /// Attaches a debug payload.
    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }
}

/// Serializes a message into one newline-terminated frame.
pub fn encode(message: &Message) -> Vec<u8> {
    // Serializing a struct of plain fields into a Vec cannot fail
    let mut frame = serde_json::to_vec(message).unwrap_or_default();
    frame.push(DELIMITER);
    frame
}

/// Parses one frame, with or without its trailing delimiter.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    let record = strip_delimiter(bytes);

    let text = std::str::from_utf8(record)
        .map_err(|e| CodecError::Framing(format!("record is not UTF-8: {}", e)))?;

    if text.contains('\n') {
        return Err(CodecError::Framing("raw newline inside record".to_string()));
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CodecError::Framing(e.to_string()))?;

    if !value.is_object() {
        return Err(CodecError::Schema(format!(
            "expected an object, found {}",
            json_type_name(&value)
        )));
    }

    serde_json::from_value(value).map_err(|e| CodecError::Schema(e.to_string()))
}

fn strip_delimiter(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(&[DELIMITER]).unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Message {
        let sent_at = DateTime::from_timestamp(1_704_067_200, 250_000_000).unwrap();
        Message::new(PeerId::new(1), 42, sent_at)
    }

    #[test]
    fn test_encode_is_single_line() {
        let frame = encode(&sample().with_debug("line one\nline two"));
        assert_eq!(frame.last(), Some(&DELIMITER));
        assert_eq!(frame.iter().filter(|b| **b == DELIMITER).count(), 1);
    }

    #[test]
    fn test_wire_field_names() {
        let frame = encode(&sample());
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.contains("\"sender_id\":1"));
        assert!(text.contains("\"logical_clock\":42"));
        assert!(text.contains("\"sent_at\":\"2024-01-01T00:00:00.250Z\""));
        assert!(!text.contains("debug"));
    }

    #[test]
    fn test_decode_without_delimiter_and_crlf() {
        let frame = encode(&sample());
        let bare = &frame[..frame.len() - 1];
        assert_eq!(decode(bare).unwrap(), sample());

        let mut crlf = bare.to_vec();
        crlf.extend_from_slice(b"\r\n");
        assert_eq!(decode(&crlf).unwrap(), sample());
    }

    #[test]
    fn test_framing_errors() {
        assert!(matches!(decode(b"not json\n"), Err(CodecError::Framing(_))));
        assert!(matches!(decode(b"{\"sender_id\":1\n"), Err(CodecError::Framing(_))));
        assert!(matches!(decode(&[0xff, 0xfe, b'\n']), Err(CodecError::Framing(_))));
        assert!(matches!(decode(b"{}\n{}\n"), Err(CodecError::Framing(_))));
        assert!(matches!(decode(b""), Err(CodecError::Framing(_))));
    }

    #[test]
    fn test_schema_errors() {
        // Missing field
        let missing = br#"{"sender_id":1,"sent_at":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(decode(missing), Err(CodecError::Schema(_))));

        // Wrong type
        let mistyped = br#"{"sender_id":"one","logical_clock":1,"sent_at":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(decode(mistyped), Err(CodecError::Schema(_))));

        // Negative clock
        let negative = br#"{"sender_id":1,"logical_clock":-4,"sent_at":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(decode(negative), Err(CodecError::Schema(_))));

        // Not an object
        assert!(matches!(decode(b"[1,2,3]"), Err(CodecError::Schema(_))));
        assert!(matches!(decode(b"17"), Err(CodecError::Schema(_))));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(CodecError::Framing(String::new()).kind(), crate::ErrorKind::Framing);
        assert_eq!(CodecError::Schema(String::new()).kind(), crate::ErrorKind::Schema);
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            sender in any::<u32>(),
            clock in any::<u64>(),
            secs in 0i64..4_102_444_800,
            nanos in 0u32..1_000_000_000,
            debug in proptest::option::of(any::<String>()),
        ) {
            let sent_at = DateTime::from_timestamp(secs, nanos).unwrap();
            let message = Message {
                sender_id: PeerId::new(sender),
                logical_clock: clock,
                sent_at,
                debug,
            };
            prop_assert_eq!(decode(&encode(&message)).unwrap(), message);
        }
    }
}
