//! Wire envelope encoding and decoding.
//!
//! Every frame exchanged with the host is a JSON array of one or two
//! elements: a header carrying the message name plus optional correlation
//! fields, and an optional body of structured data:
//!
//! ```text
//! [ { "message": "setControl", "replyTo": 4 }, { "instance": 2, ... } ]
//! ```
//!
//! A frame with neither `reply` nor `replyTo` is a one-way notification.
//! `replyTo` marks a call awaiting a reply bearing the same number in
//! `reply`. `replyTo == -1` on an inbound call means "no reply wanted".

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Sentinel correlation id meaning "no reply wanted".
pub const NO_REPLY: i64 = -1;

/// Envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Message name; `"error"` signals a failure in either direction.
    pub message: String,
    /// Set on a call expecting a reply with this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i64>,
    /// Set on a reply, echoing the originating call's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<i64>,
}

/// A decoded `(header, body?)` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub body: Option<Value>,
}

impl Envelope {
    /// A fire-and-forget notification with no correlation fields.
    pub fn notification(message: &str, body: Option<Value>) -> Self {
        Self {
            header: Header {
                message: message.to_string(),
                reply_to: None,
                reply: None,
            },
            body,
        }
    }

    /// An outbound call expecting a reply correlated by `reply_to`.
    pub fn call(message: &str, reply_to: i64, body: Option<Value>) -> Self {
        Self {
            header: Header {
                message: message.to_string(),
                reply_to: Some(reply_to),
                reply: None,
            },
            body,
        }
    }

    /// The answer to an inbound call, echoing its correlation id.
    pub fn reply(message: &str, reply: i64, body: Option<Value>) -> Self {
        Self {
            header: Header {
                message: message.to_string(),
                reply_to: None,
                reply: Some(reply),
            },
            body,
        }
    }

    /// Serialize to the wire form. A missing body yields a one-element
    /// array, not a trailing `null`.
    pub fn encode(&self) -> String {
        let frame = match &self.body {
            Some(body) => serde_json::json!([self.header, body]),
            None => serde_json::json!([self.header]),
        };
        frame.to_string()
    }

    /// Parse a wire frame. Anything that is not the one-or-two element
    /// envelope array is a [`ProtocolError`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(mut parts) = value else {
            return Err(ProtocolError::NotAnEnvelope);
        };
        if parts.is_empty() || parts.len() > 2 {
            return Err(ProtocolError::NotAnEnvelope);
        }
        let body = if parts.len() == 2 { parts.pop() } else { None };
        let header_value = parts.pop().ok_or(ProtocolError::NotAnEnvelope)?;
        let header: Header = serde_json::from_value(header_value)?;
        if header.reply_to.is_some() && header.reply.is_some() {
            return Err(ProtocolError::ConflictingCorrelation);
        }
        Ok(Envelope { header, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_has_no_correlation() {
        let env = Envelope::notification("ping", None);
        let text = env.encode();
        assert_eq!(text, r#"[{"message":"ping"}]"#);
    }

    #[test]
    fn test_call_carries_reply_to() {
        let env = Envelope::call("getFavorites", 7, None);
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded.header.message, "getFavorites");
        assert_eq!(decoded.header.reply_to, Some(7));
        assert_eq!(decoded.header.reply, None);
    }

    #[test]
    fn test_body_round_trip() {
        let body = json!({ "instance": 4, "symbol": "gain", "value": 0.5 });
        let env = Envelope::reply("setControl", 12, Some(body.clone()));
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded.header.reply, Some(12));
        assert_eq!(decoded.body, Some(body));
    }

    #[test]
    fn test_rejects_non_array() {
        let err = Envelope::decode(r#"{"message":"x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnEnvelope));
    }

    #[test]
    fn test_rejects_wrong_arity() {
        assert!(Envelope::decode("[]").is_err());
        assert!(Envelope::decode(r#"[{"message":"x"},{},{}]"#).is_err());
    }

    #[test]
    fn test_rejects_conflicting_correlation() {
        let err = Envelope::decode(r#"[{"message":"x","replyTo":1,"reply":2}]"#).unwrap_err();
        assert!(matches!(err, ProtocolError::ConflictingCorrelation));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Envelope::decode("not json at all").is_err());
    }
}
