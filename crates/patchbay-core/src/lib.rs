//! Patchbay Core Library
//!
//! Client-side synchronization layer for the Patchbay audio host. Keeps a
//! UI consistent with the state of a single, long-running audio server over
//! an unreliable network connection.
//!
//! # Modules
//!
//! - [`envelope`] - Wire envelope encoding and decoding
//! - [`messages`] - Typed catalog of server push messages
//! - [`socket`] - Message transport with reconnect/backoff handling
//! - [`session`] - Server-state mirroring and the connection state machine
//! - [`observable`] - Observable value and event containers
//! - [`state`] - Cached server state containers
//! - [`error`] - Error types

pub mod envelope;
pub mod error;
pub mod messages;
pub mod observable;
pub mod session;
pub mod socket;
pub mod state;
mod subscriptions;

// Re-export commonly used types
pub use envelope::{Envelope, Header, NO_REPLY};
pub use error::{ClientError, ProtocolError, Result};
pub use messages::{ControlChange, MonitorOutput, ServerPush, VuUpdate};
pub use observable::{ObservableEvent, ObservableProperty, SubscriptionId};
pub use session::{ConnectionState, PortKey, ReconnectReason, Session, SessionConfig};
pub use socket::{Dialer, Socket, SocketListener, WsDialer, MAX_RECONNECT_ATTEMPTS};
pub use state::{
    Bank, JackConfiguration, JackSettings, Pedalboard, PluginInfo, PluginInstance,
    PortConnection, Preset, ServerCache, UpdateStatus,
};
