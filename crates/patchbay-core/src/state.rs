//! Cached, observable mirror of server-owned state.
//!
//! Every container here is written only by (a) the initial full load after
//! a (re)connect, (b) incoming push messages, or (c) locally-optimistic
//! edits that are simultaneously sent to the server. All merges are value
//! assignments, so replaying the same push is a harmless no-op.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::observable::ObservableProperty;

/// One plugin instance loaded in the current pedalboard.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInstance {
    pub instance: i64,
    pub uri: String,
    #[serde(default)]
    pub enabled: bool,
    /// Current control port values, keyed by port symbol.
    #[serde(default)]
    pub controls: BTreeMap<String, f64>,
}

/// A signal connection between two ports, named `instance/symbol`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortConnection {
    pub source: String,
    pub target: String,
}

/// The signal graph currently loaded on the host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pedalboard {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub plugins: Vec<PluginInstance>,
    #[serde(default)]
    pub connections: Vec<PortConnection>,
}

/// Audio engine configuration as reported by the host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JackConfiguration {
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub buffer_size: u32,
    #[serde(default)]
    pub xruns: u64,
}

/// Audio engine settings the user can apply. Applying them restarts the
/// engine, which drops the connection on purpose.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JackSettings {
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub buffer_size: u32,
}

/// A stored preset of the current pedalboard.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Preset {
    pub uri: String,
    #[serde(default)]
    pub label: String,
}

/// Summary of an installed plugin. Full metadata parsing happens
/// elsewhere; the session only mirrors what the host lists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PluginInfo {
    pub uri: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub category: Vec<String>,
}

/// A named group of pedalboards.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Bank {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pedalboards: Vec<String>,
}

/// Update pipeline state reported by the host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum UpdateStatus {
    #[default]
    Idle,
    Downloading {
        progress: f32,
    },
    /// Downloaded and ready to install.
    Ready,
    /// Installing; the host will drop the connection to restart.
    Installing,
}

/// Every server-mirrored value the session exposes to observers.
#[derive(Default)]
pub struct ServerCache {
    pub pedalboard: ObservableProperty<Pedalboard>,
    pub jack_configuration: ObservableProperty<JackConfiguration>,
    pub jack_settings: ObservableProperty<JackSettings>,
    pub presets: ObservableProperty<Vec<Preset>>,
    pub favorites: ObservableProperty<Vec<String>>,
    pub plugins: ObservableProperty<Vec<PluginInfo>>,
    pub plugin_classes: ObservableProperty<Vec<String>>,
    pub banks: ObservableProperty<Vec<Bank>>,
    pub wifi_regulatory_domains: ObservableProperty<Vec<String>>,
    pub update_status: ObservableProperty<UpdateStatus>,
}

impl ServerCache {
    /// Merge a control value into the pedalboard. Returns whether the
    /// stored value actually changed; an identical replay is a no-op, so
    /// the echo of a locally-originated edit does not fire observers a
    /// second time.
    pub fn apply_control(&self, instance: i64, symbol: &str, value: f64) -> bool {
        self.pedalboard.update(|pedalboard| {
            for plugin in &mut pedalboard.plugins {
                if plugin.instance == instance {
                    let previous = plugin.controls.insert(symbol.to_string(), value);
                    return previous != Some(value);
                }
            }
            false
        })
    }

    /// Current value of one control port, if the plugin and port exist.
    pub fn control_value(&self, instance: i64, symbol: &str) -> Option<f64> {
        self.pedalboard
            .get()
            .plugins
            .iter()
            .find(|plugin| plugin.instance == instance)
            .and_then(|plugin| plugin.controls.get(symbol).copied())
    }
}
