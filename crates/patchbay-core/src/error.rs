//! Error types for the client synchronization layer.
//!
//! Two layers: [`ProtocolError`] covers malformed wire frames, which are
//! reported and discarded without tearing down the connection, and
//! [`ClientError`] covers everything a caller of the transport or session
//! can observe.

use thiserror::Error;

/// A received frame that violates the wire contract.
///
/// Surfaced to the registered error handler; the connection stays open and
/// later frames are still processed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A binary frame that was not valid UTF-8.
    #[error("binary frame is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    /// The frame was JSON but not a one- or two-element envelope array.
    #[error("frame is not a one- or two-element envelope array")]
    NotAnEnvelope,

    /// The header carries both `replyTo` and `reply`.
    #[error("envelope header sets both replyTo and reply")]
    ConflictingCorrelation,

    /// A known message name arrived with a body of the wrong shape.
    #[error("body of {message:?} did not match its payload shape: {source}")]
    BadPayload {
        message: String,
        source: serde_json::Error,
    },
}

/// Client-facing error type for transport and session operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// First-connection handshake failed. Never retried automatically;
    /// retrying the first connection is the caller's decision.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport is suspended or mid-reconnect; nothing was sent.
    #[error("not connected")]
    NotConnected,

    /// The call was in flight when the connection was replaced. Its reply
    /// can never arrive; callers may re-issue once the session reports a
    /// reconnect.
    #[error("call abandoned by reconnect")]
    Abandoned,

    /// The transport has shut down for good.
    #[error("socket closed")]
    Closed,

    /// Retry budget exhausted, or the connection failed while sending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The server answered a call with an error reply; the body is the
    /// error detail.
    #[error("server error: {0}")]
    Server(serde_json::Value),

    /// A malformed frame was received.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A reply body did not match the shape the caller asked for.
    #[error("reply did not match the expected shape: {0}")]
    Payload(serde_json::Error),

    /// The session is in its terminal error state.
    #[error("session failed: {0}")]
    SessionFailed(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, ClientError>;
