//! Typed catalog of server-originated push messages.
//!
//! The transport routes frames by the envelope's `message` name; this
//! module is the single place that name is turned into a typed value.
//! Unknown names become [`ServerPush::Unknown`] so a newer server degrades
//! loudly in logs instead of vanishing silently.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::state::{JackConfiguration, Pedalboard, UpdateStatus};

/// A control port value broadcast to every client after a change,
/// including the client that originated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlChange {
    pub instance: i64,
    pub symbol: String,
    pub value: f64,
    /// Id of the client that originated the change, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A sampled value from a monitored output port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorOutput {
    pub instance: i64,
    pub symbol: String,
    pub value: f64,
}

/// A VU meter level sample for one plugin instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VuUpdate {
    pub instance: i64,
    pub value: f64,
}

/// Server-originated, unsolicited messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPush {
    /// `onControlChanged`
    ControlChanged(ControlChange),
    /// `onPedalboardChanged` — a full replacement snapshot of the graph.
    PedalboardChanged(Pedalboard),
    /// `onJackConfigurationChanged`
    JackConfigurationChanged(JackConfiguration),
    /// `onVuUpdate`
    VuUpdate(VuUpdate),
    /// `onMonitorPortOutput`
    MonitorPortOutput(MonitorOutput),
    /// `onLv2PluginsChanging` — the host is about to rescan its plugins
    /// and will drop the connection while doing so.
    Lv2PluginsChanging,
    /// `onUpdateStatusChanged`
    UpdateStatusChanged(UpdateStatus),
    /// A message name this client does not know.
    Unknown { name: String, body: Option<Value> },
}

fn payload<T: DeserializeOwned>(name: &str, body: Option<Value>) -> Result<T, ProtocolError> {
    serde_json::from_value(body.unwrap_or(Value::Null)).map_err(|source| {
        ProtocolError::BadPayload {
            message: name.to_string(),
            source,
        }
    })
}

impl ServerPush {
    /// Decode a push by its envelope message name.
    pub fn decode(name: &str, body: Option<Value>) -> Result<Self, ProtocolError> {
        Ok(match name {
            "onControlChanged" => ServerPush::ControlChanged(payload(name, body)?),
            "onPedalboardChanged" => ServerPush::PedalboardChanged(payload(name, body)?),
            "onJackConfigurationChanged" => {
                ServerPush::JackConfigurationChanged(payload(name, body)?)
            }
            "onVuUpdate" => ServerPush::VuUpdate(payload(name, body)?),
            "onMonitorPortOutput" => ServerPush::MonitorPortOutput(payload(name, body)?),
            "onLv2PluginsChanging" => ServerPush::Lv2PluginsChanging,
            "onUpdateStatusChanged" => ServerPush::UpdateStatusChanged(payload(name, body)?),
            _ => ServerPush::Unknown {
                name: name.to_string(),
                body,
            },
        })
    }

    /// The wire message name, for logging.
    pub fn name(&self) -> &str {
        match self {
            ServerPush::ControlChanged(_) => "onControlChanged",
            ServerPush::PedalboardChanged(_) => "onPedalboardChanged",
            ServerPush::JackConfigurationChanged(_) => "onJackConfigurationChanged",
            ServerPush::VuUpdate(_) => "onVuUpdate",
            ServerPush::MonitorPortOutput(_) => "onMonitorPortOutput",
            ServerPush::Lv2PluginsChanging => "onLv2PluginsChanging",
            ServerPush::UpdateStatusChanged(_) => "onUpdateStatusChanged",
            ServerPush::Unknown { name, .. } => name,
        }
    }
}
