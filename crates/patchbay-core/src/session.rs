//! Server-state mirroring and the connection state machine.
//!
//! A [`Session`] owns one [`Socket`] and keeps a [`ServerCache`] consistent
//! with the host across connection churn. It translates application actions
//! into wire calls, merges push messages into the cache, and presents one
//! authoritative [`ConnectionState`] to observers.
//!
//! Sessions are constructed explicitly and passed around by handle; there
//! is no process-wide instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::messages::ServerPush;
use crate::observable::{lock, ObservableEvent, ObservableProperty, SubscriptionId};
use crate::socket::{Dialer, Socket, SocketListener, WsDialer};
use crate::state::{
    Bank, JackConfiguration, JackSettings, Pedalboard, PluginInfo, Preset, ServerCache,
    UpdateStatus,
};
use crate::subscriptions::FanoutTable;

/// How long after arming a [`ReconnectReason`] the expected disconnect may
/// arrive before the reason reverts to `Disconnected`.
pub const EXPECT_DISCONNECT_WINDOW: Duration = Duration::from_secs(10);

/// Pause between sweeps over the candidate addresses while reacquiring the
/// host after a hotspot change.
pub const ADDRESS_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Per-candidate connect timeout of the liveness probe.
pub const ADDRESS_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The one UI-facing connection state. Exactly one is current at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection and initial state load in progress.
    Loading,
    /// Connected, cache synchronized.
    Ready,
    /// Terminal failure with a human-readable message. The session does
    /// not recover from this on its own.
    Error(String),
    /// Connection deliberately yielded while the UI is hidden.
    Background,
    /// Reconnecting after an unexpected loss.
    Reconnecting,
    /// The host dropped the connection to apply new audio settings.
    ApplyingChanges,
    /// The host dropped the connection to rescan its plugins.
    ReloadingPlugins,
    /// A system update is downloading; still connected.
    DownloadingUpdate,
    /// The host dropped the connection to install an update.
    InstallingUpdate,
    /// The host is switching Wi-Fi modes and may come back under a
    /// different address.
    HotspotChanging,
}

/// Why the next disconnect is expected, armed shortly before an action
/// that is known to drop the connection on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// Default: any disconnect is unexpected.
    Disconnected,
    LoadingSettings,
    ReloadingPlugins,
    Updating,
    HotspotChanging,
}

/// Identifies one control or output port on one plugin instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortKey {
    pub instance: i64,
    pub symbol: String,
}

/// Session construction parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the host.
    pub url: String,
    /// Addresses probed when the host changes its network identity during
    /// a hotspot switch. Empty disables the probe.
    pub candidate_addresses: Vec<String>,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            candidate_addresses: Vec::new(),
        }
    }
}

/// Handle to a connected session. Cheap to clone; the background transport
/// task stops once every clone is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    weak_self: Weak<SessionInner>,
    config: SessionConfig,
    client_id: String,
    socket: OnceLock<Socket>,
    cache: ServerCache,
    connection_state: ObservableProperty<ConnectionState>,
    /// Transient per-action failures that leave `connection_state` alone.
    alerts: ObservableEvent<String>,
    /// Fires with the address that answered the hotspot liveness probe.
    /// The embedding UI performs the actual redirect.
    server_address_changed: ObservableEvent<String>,
    /// Fires with the new server version when it changed across a
    /// reconnect; cached state cannot be trusted past a binary change and
    /// the embedding UI must reload itself.
    client_stale: ObservableEvent<String>,
    server_version: Mutex<Option<String>>,
    reconnect_reason: Mutex<ReconnectReason>,
    expect_timer: Mutex<Option<JoinHandle<()>>>,
    address_probe: Mutex<Option<JoinHandle<()>>>,
    monitors: Mutex<FanoutTable<PortKey, f64>>,
    vu_meters: Mutex<FanoutTable<i64, f64>>,
    closed: AtomicBool,
}

impl Session {
    /// Connect to the host and perform the initial full state load. The
    /// returned session is in [`ConnectionState::Ready`]. A handshake or
    /// load failure is returned without retry.
    pub async fn connect(config: SessionConfig) -> Result<Session> {
        let dialer = Arc::new(WsDialer {
            url: config.url.clone(),
        });
        Self::connect_with(dialer, config).await
    }

    /// [`connect`](Session::connect) with an injected connection factory.
    pub async fn connect_with(dialer: Arc<dyn Dialer>, config: SessionConfig) -> Result<Session> {
        let inner = Arc::new_cyclic(|weak| SessionInner {
            weak_self: weak.clone(),
            config,
            client_id: Uuid::new_v4().to_string(),
            socket: OnceLock::new(),
            cache: ServerCache::default(),
            connection_state: ObservableProperty::new(ConnectionState::Loading),
            alerts: ObservableEvent::new(),
            server_address_changed: ObservableEvent::new(),
            client_stale: ObservableEvent::new(),
            server_version: Mutex::new(None),
            reconnect_reason: Mutex::new(ReconnectReason::Disconnected),
            expect_timer: Mutex::new(None),
            address_probe: Mutex::new(None),
            monitors: Mutex::new(FanoutTable::new()),
            vu_meters: Mutex::new(FanoutTable::new()),
            closed: AtomicBool::new(false),
        });
        let listener: Arc<dyn SocketListener> = inner.clone();
        let socket = Socket::connect(dialer, listener).await?;
        let _ = inner.socket.set(socket);

        if let Err(e) = inner.full_load().await {
            if let Ok(socket) = inner.socket() {
                socket.close();
            }
            inner
                .connection_state
                .set(ConnectionState::Error(format!("initial load failed: {e}")));
            return Err(e);
        }
        inner.connection_state.set(ConnectionState::Ready);
        info!(client_id = %inner.client_id, "session ready");
        Ok(Session { inner })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection_state.get()
    }

    pub fn connection_state(&self) -> &ObservableProperty<ConnectionState> {
        &self.inner.connection_state
    }

    /// The cached mirror of server-owned state.
    pub fn cache(&self) -> &ServerCache {
        &self.inner.cache
    }

    pub fn alerts(&self) -> &ObservableEvent<String> {
        &self.inner.alerts
    }

    pub fn server_address_changed(&self) -> &ObservableEvent<String> {
        &self.inner.server_address_changed
    }

    pub fn client_stale(&self) -> &ObservableEvent<String> {
        &self.inner.client_stale
    }

    /// This session's id, attached to locally-originated edits.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Change a control value. Applied to the cache immediately, then sent
    /// to the host; the host's corroborating broadcast merges as a no-op.
    pub fn set_control(&self, instance: i64, symbol: &str, value: f64) {
        self.inner.cache.apply_control(instance, symbol, value);
        self.inner.send_control("setControl", instance, symbol, value);
    }

    /// Transient control change while a widget is being dragged. Not
    /// written to the cache; a final [`set_control`](Session::set_control)
    /// commits the value.
    pub fn preview_control(&self, instance: i64, symbol: &str, value: f64) {
        self.inner
            .send_control("previewControl", instance, symbol, value);
    }

    /// Write a patch property on a plugin instance.
    pub fn set_patch_property(&self, instance: i64, uri: &str, value: Value) {
        if let Ok(socket) = self.inner.socket() {
            socket.send(
                "setPatchProperty",
                Some(json!({
                    "instance": instance,
                    "uri": uri,
                    "value": value,
                    "clientId": self.inner.client_id,
                })),
            );
        }
    }

    /// Read a patch property from a plugin instance.
    pub async fn get_patch_property(&self, instance: i64, uri: &str) -> Result<Value> {
        self.inner
            .socket()?
            .request_value(
                "getPatchProperty",
                Some(json!({ "instance": instance, "uri": uri })),
            )
            .await
    }

    /// Observe an output port. The wire subscription is issued only for
    /// the first local subscriber on a key.
    pub async fn monitor_port(
        &self,
        instance: i64,
        symbol: &str,
        callback: impl Fn(&f64) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        let key = PortKey {
            instance,
            symbol: symbol.to_string(),
        };
        let (id, first) = lock(&self.inner.monitors).add(key, Arc::new(callback));
        if first {
            let result = self
                .inner
                .socket()?
                .request_value(
                    "monitorPort",
                    Some(json!({ "instance": instance, "symbol": symbol })),
                )
                .await;
            if let Err(e) = result {
                lock(&self.inner.monitors).remove(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Remove a port observer. The wire unsubscribe is issued only when
    /// the last local subscriber on the key leaves.
    pub async fn unmonitor_port(&self, id: SubscriptionId) -> Result<()> {
        // bind first so the table guard drops before the await
        let removed = lock(&self.inner.monitors).remove(id);
        if let Some(key) = removed {
            self.inner
                .socket()?
                .request_value(
                    "unmonitorPort",
                    Some(json!({ "instance": key.instance, "symbol": key.symbol })),
                )
                .await?;
        }
        Ok(())
    }

    /// Observe the VU level of a plugin instance; same fan-out discipline
    /// as [`monitor_port`](Session::monitor_port).
    pub async fn add_vu_subscription(
        &self,
        instance: i64,
        callback: impl Fn(&f64) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        let (id, first) = lock(&self.inner.vu_meters).add(instance, Arc::new(callback));
        if first {
            let result = self
                .inner
                .socket()?
                .request_value("addVuSubscription", Some(json!({ "instance": instance })))
                .await;
            if let Err(e) = result {
                lock(&self.inner.vu_meters).remove(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    pub async fn remove_vu_subscription(&self, id: SubscriptionId) -> Result<()> {
        // bind first so the table guard drops before the await
        let removed = lock(&self.inner.vu_meters).remove(id);
        if let Some(instance) = removed {
            self.inner
                .socket()?
                .request_value("removeVuSubscription", Some(json!({ "instance": instance })))
                .await?;
        }
        Ok(())
    }

    /// Apply new audio engine settings. The host restarts its engine and
    /// drops the connection; the reconnect shows as
    /// [`ConnectionState::ApplyingChanges`].
    pub async fn apply_jack_settings(&self, settings: JackSettings) -> Result<()> {
        self.inner
            .expect_disconnect(ReconnectReason::LoadingSettings);
        let body = serde_json::to_value(&settings).map_err(ClientError::Payload)?;
        let result = self
            .inner
            .socket()?
            .request_value("setJackSettings", Some(body))
            .await;
        match result {
            Ok(_) => {
                self.inner.cache.jack_settings.set(settings);
                Ok(())
            }
            // the expected disconnect raced the reply
            Err(ClientError::Abandoned) => Ok(()),
            Err(e) => {
                self.inner.action_failed("applying audio settings failed", &e);
                Err(e)
            }
        }
    }

    /// Install a downloaded update. The host drops the connection to
    /// restart into the new version.
    pub async fn install_update(&self) -> Result<()> {
        self.inner.expect_disconnect(ReconnectReason::Updating);
        match self.inner.socket()?.request_value("updateNow", None).await {
            Ok(_) => Ok(()),
            Err(ClientError::Abandoned) => Ok(()),
            Err(e) => {
                self.inner.action_failed("starting the update failed", &e);
                Err(e)
            }
        }
    }

    /// Toggle the Wi-Fi hotspot. The host's network identity may change;
    /// the candidate addresses from [`SessionConfig`] are probed while
    /// reconnecting.
    pub async fn set_hotspot(&self, enabled: bool) -> Result<()> {
        self.inner
            .expect_disconnect(ReconnectReason::HotspotChanging);
        let result = self
            .inner
            .socket()?
            .request_value("setHotspot", Some(json!({ "enabled": enabled })))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ClientError::Abandoned) => Ok(()),
            Err(e) => {
                self.inner.action_failed("changing the hotspot failed", &e);
                Err(e)
            }
        }
    }

    /// Power the host down.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.socket()?.request_value("shutdown", None).await?;
        Ok(())
    }

    /// Reboot the host.
    pub async fn restart(&self) -> Result<()> {
        self.inner.socket()?.request_value("restart", None).await?;
        Ok(())
    }

    /// Yield the connection while the UI is hidden. No retry loop runs and
    /// no error state is entered.
    pub fn enter_background(&self) {
        if let Ok(socket) = self.inner.socket() {
            socket.enter_background();
            self.inner.connection_state.set(ConnectionState::Background);
        }
    }

    /// Resume from the background: runs the full reconnect and resync
    /// sequence.
    pub fn exit_background(&self) {
        if let Ok(socket) = self.inner.socket() {
            socket.exit_background();
        }
    }

    /// Shut the session down. Idempotent; never fires loss callbacks.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.cancel_expect_timer();
        self.inner.stop_address_probe();
        if let Ok(socket) = self.inner.socket() {
            socket.close();
        }
    }
}

impl SessionInner {
    fn socket(&self) -> Result<&Socket> {
        self.socket.get().ok_or(ClientError::NotConnected)
    }

    fn send_control(&self, name: &str, instance: i64, symbol: &str, value: f64) {
        if let Ok(socket) = self.socket() {
            socket.send(
                name,
                Some(json!({
                    "instance": instance,
                    "symbol": symbol,
                    "value": value,
                    "clientId": self.client_id,
                })),
            );
        }
    }

    /// Handshake, version check, then the sequential get battery that
    /// repopulates every cached container. Any failure leaves the cache
    /// partially stale and must surface as a terminal error, never as a
    /// partially-loaded Ready state.
    async fn full_load(&self) -> Result<()> {
        let socket = self.socket()?;
        socket
            .request_value("hello", Some(json!({ "clientId": self.client_id })))
            .await?;

        let version: String = socket.request("version", None).await?;
        {
            let mut guard = lock(&self.server_version);
            if let Some(previous) = guard.as_ref() {
                if *previous != version {
                    self.client_stale.emit(&version);
                    return Err(ClientError::SessionFailed(format!(
                        "server changed from version {previous} to {version}"
                    )));
                }
            }
            *guard = Some(version);
        }

        let domains: Vec<String> = socket.request("getWifiRegulatoryDomains", None).await?;
        self.cache.wifi_regulatory_domains.set(domains);
        let plugins: Vec<PluginInfo> = socket.request("plugins", None).await?;
        self.cache.plugins.set(plugins);
        let pedalboard: Pedalboard = socket.request("currentPedalboard", None).await?;
        self.cache.pedalboard.set(pedalboard);
        let classes: Vec<String> = socket.request("pluginClasses", None).await?;
        self.cache.plugin_classes.set(classes);
        let presets: Vec<Preset> = socket.request("getPresets", None).await?;
        self.cache.presets.set(presets);
        let configuration: JackConfiguration =
            socket.request("getJackConfiguration", None).await?;
        self.cache.jack_configuration.set(configuration);
        let settings: JackSettings = socket.request("getJackSettings", None).await?;
        self.cache.jack_settings.set(settings);
        let banks: Vec<Bank> = socket.request("getBankIndex", None).await?;
        self.cache.banks.set(banks);
        let favorites: Vec<String> = socket.request("getFavorites", None).await?;
        self.cache.favorites.set(favorites);

        // the host lost the wire subscriptions with the old connection
        let monitored = lock(&self.monitors).keys();
        for key in monitored {
            socket
                .request_value(
                    "monitorPort",
                    Some(json!({ "instance": key.instance, "symbol": key.symbol })),
                )
                .await?;
        }
        let metered = lock(&self.vu_meters).keys();
        for instance in metered {
            socket
                .request_value("addVuSubscription", Some(json!({ "instance": instance })))
                .await?;
        }
        Ok(())
    }

    /// Arm the expect-disconnect window: the next disconnect within it is
    /// attributed to `reason`; if none arrives the reason reverts, so a
    /// later unrelated disconnect is not mis-attributed.
    fn expect_disconnect(&self, reason: ReconnectReason) {
        debug!(?reason, "expecting a deliberate disconnect");
        *lock(&self.reconnect_reason) = reason;
        self.cancel_expect_timer();
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(EXPECT_DISCONNECT_WINDOW).await;
            if let Some(inner) = weak.upgrade() {
                debug!("expected disconnect never arrived, reverting reason");
                *lock(&inner.reconnect_reason) = ReconnectReason::Disconnected;
            }
        });
        if let Some(stale) = lock(&self.expect_timer).replace(handle) {
            stale.abort();
        }
    }

    fn cancel_expect_timer(&self) {
        if let Some(timer) = lock(&self.expect_timer).take() {
            timer.abort();
        }
    }

    /// Sweep the candidate addresses until one answers a TCP probe, then
    /// report it so the embedding UI can redirect.
    fn start_address_probe(&self) {
        let candidates = self.config.candidate_addresses.clone();
        if candidates.is_empty() {
            return;
        }
        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            loop {
                for address in &candidates {
                    let probe = tokio::net::TcpStream::connect(address.as_str());
                    if let Ok(Ok(_)) = tokio::time::timeout(ADDRESS_PROBE_TIMEOUT, probe).await {
                        info!(%address, "host answered at a new address");
                        inner.server_address_changed.emit(address);
                        return;
                    }
                }
                tokio::time::sleep(ADDRESS_PROBE_INTERVAL).await;
            }
        });
        if let Some(stale) = lock(&self.address_probe).replace(handle) {
            stale.abort();
        }
    }

    fn stop_address_probe(&self) {
        if let Some(probe) = lock(&self.address_probe).take() {
            probe.abort();
        }
    }

    /// A recoverable per-action failure: surface it as an alert, disarm
    /// the expected disconnect, leave the connection state alone.
    fn action_failed(&self, what: &str, error: &ClientError) {
        warn!("{what}: {error}");
        self.cancel_expect_timer();
        *lock(&self.reconnect_reason) = ReconnectReason::Disconnected;
        self.alerts.emit(&format!("{what}: {error}"));
    }

    fn fail(&self, message: String) {
        warn!("session failed: {message}");
        self.cancel_expect_timer();
        self.stop_address_probe();
        self.connection_state.set(ConnectionState::Error(message));
    }

    fn apply_push(&self, push: ServerPush) {
        match push {
            ServerPush::ControlChanged(change) => {
                // value assignment, so the echo of a local edit is a no-op
                self.cache
                    .apply_control(change.instance, &change.symbol, change.value);
            }
            ServerPush::PedalboardChanged(pedalboard) => {
                self.cache.pedalboard.set(pedalboard);
            }
            ServerPush::JackConfigurationChanged(configuration) => {
                self.cache.jack_configuration.set(configuration);
            }
            ServerPush::VuUpdate(update) => {
                // fire outside the table lock so callbacks may resubscribe
                let callbacks = lock(&self.vu_meters).snapshot(&update.instance);
                for callback in callbacks {
                    callback(&update.value);
                }
            }
            ServerPush::MonitorPortOutput(output) => {
                let key = PortKey {
                    instance: output.instance,
                    symbol: output.symbol,
                };
                let callbacks = lock(&self.monitors).snapshot(&key);
                for callback in callbacks {
                    callback(&output.value);
                }
            }
            ServerPush::Lv2PluginsChanging => {
                self.expect_disconnect(ReconnectReason::ReloadingPlugins);
            }
            ServerPush::UpdateStatusChanged(status) => {
                match &status {
                    UpdateStatus::Downloading { .. } => {
                        self.connection_state
                            .set(ConnectionState::DownloadingUpdate);
                    }
                    UpdateStatus::Installing => {
                        self.expect_disconnect(ReconnectReason::Updating);
                    }
                    UpdateStatus::Idle | UpdateStatus::Ready => {
                        if self.connection_state.get() == ConnectionState::DownloadingUpdate {
                            self.connection_state.set(ConnectionState::Ready);
                        }
                    }
                }
                self.cache.update_status.set(status);
            }
            ServerPush::Unknown { name, .. } => {
                warn!(name, "ignoring unknown push message");
            }
        }
    }
}

#[async_trait]
impl SocketListener for SessionInner {
    async fn on_push(&self, push: ServerPush, reply_to: i64) {
        self.apply_push(push);
        // a generic acknowledgement; reply() skips the no-reply sentinel
        if let Ok(socket) = self.socket() {
            socket.reply(reply_to, "ok", None);
        }
    }

    async fn on_reconnecting(&self, attempt: u32, _max_attempts: u32) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if matches!(self.connection_state.get(), ConnectionState::Error(_)) {
            return false;
        }
        if attempt == 0 {
            // the disconnect arrived; the revert timer must not fire late
            self.cancel_expect_timer();
            let reason = *lock(&self.reconnect_reason);
            let state = match reason {
                ReconnectReason::Disconnected => ConnectionState::Reconnecting,
                ReconnectReason::LoadingSettings => ConnectionState::ApplyingChanges,
                ReconnectReason::ReloadingPlugins => ConnectionState::ReloadingPlugins,
                ReconnectReason::Updating => ConnectionState::InstallingUpdate,
                ReconnectReason::HotspotChanging => {
                    self.start_address_probe();
                    ConnectionState::HotspotChanging
                }
            };
            info!(?reason, "reconnecting");
            self.connection_state.set(state);
        }
        true
    }

    async fn on_reconnected(&self) {
        self.stop_address_probe();
        *lock(&self.reconnect_reason) = ReconnectReason::Disconnected;
        // resync in a separate task: the transport must keep servicing
        // the wire while the get battery runs
        if let Some(inner) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                match inner.full_load().await {
                    Ok(()) => {
                        inner.connection_state.set(ConnectionState::Ready);
                        info!("resynchronized");
                    }
                    Err(e) => inner.fail(format!("resync failed: {e}")),
                }
            });
        }
    }

    async fn on_connection_lost(&self) {
        debug!("connection lost");
        self.cancel_expect_timer();
    }

    async fn on_fatal(&self, message: String) {
        self.fail(message);
    }

    async fn on_server_error(&self, detail: Value) {
        warn!("server error: {detail}");
        self.alerts.emit(&format!("server error: {detail}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::socket::testing::{Remote, ScriptedDialer};
    use std::sync::atomic::AtomicU32;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    /// Answer the handshake and the whole get battery on `remote`.
    async fn serve_full_load(remote: &mut Remote, version: &str) {
        loop {
            let call = remote.recv().await.expect("host side closed");
            let id = match call.header.reply_to {
                Some(id) => id,
                None => continue,
            };
            let name = call.header.message.as_str();
            let body = match name {
                "hello" => json!({}),
                "version" => json!(version),
                "currentPedalboard" => json!({
                    "title": "demo",
                    "plugins": [{
                        "instance": 4,
                        "uri": "urn:demo:gain",
                        "enabled": true,
                        "controls": { "gain": 0.5 }
                    }],
                    "connections": []
                }),
                "getJackConfiguration" => {
                    json!({ "sampleRate": 48000, "bufferSize": 128, "xruns": 0 })
                }
                "getJackSettings" => json!({ "sampleRate": 48000, "bufferSize": 128 }),
                "getWifiRegulatoryDomains" | "plugins" | "pluginClasses" | "getPresets"
                | "getBankIndex" | "getFavorites" => json!([]),
                other => panic!("unexpected call during load: {other}"),
            };
            let done = name == "getFavorites";
            remote.push_frame(Envelope::reply(name, id, Some(body)));
            if done {
                return;
            }
        }
    }

    async fn connect_session(config: SessionConfig) -> (Session, Remote, Arc<ScriptedDialer>) {
        let dialer = Arc::new(ScriptedDialer::new());
        let mut remote = dialer.script_link();
        let connecting = tokio::spawn(Session::connect_with(dialer.clone(), config));
        serve_full_load(&mut remote, "1.0").await;
        let session = connecting.await.unwrap().unwrap();
        (session, remote, dialer)
    }

    async fn connected() -> (Session, Remote, Arc<ScriptedDialer>) {
        connect_session(SessionConfig::new("ws://patchbay.local/ws")).await
    }

    /// Answer one correlated call on `remote`, asserting its name.
    async fn answer(remote: &mut Remote, expected: &str, body: Value) {
        let call = remote.recv().await.unwrap();
        assert_eq!(call.header.message, expected);
        let id = call.header.reply_to.unwrap();
        remote.push_frame(Envelope::reply(expected, id, Some(body)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_loads_state_and_reaches_ready() {
        let (session, _remote, _dialer) = connected().await;
        assert_eq!(session.state(), ConnectionState::Ready);

        let pedalboard = session.cache().pedalboard.get();
        assert_eq!(pedalboard.title, "demo");
        assert_eq!(pedalboard.plugins.len(), 1);
        assert_eq!(session.cache().control_value(4, "gain"), Some(0.5));
        assert_eq!(session.cache().jack_configuration.get().sample_rate, 48000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_load_failure_propagates() {
        let dialer = Arc::new(ScriptedDialer::new());
        let mut remote = dialer.script_link();
        let connecting = tokio::spawn(Session::connect_with(
            dialer.clone(),
            SessionConfig::new("ws://patchbay.local/ws"),
        ));
        let call = remote.recv().await.unwrap();
        assert_eq!(call.header.message, "hello");
        remote.push_frame(Envelope::reply(
            "error",
            call.header.reply_to.unwrap(),
            Some(json!({"reason": "busy"})),
        ));
        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(ClientError::Server(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_control_is_optimistic_and_echo_safe() {
        let (session, mut remote, _dialer) = connected().await;

        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        session.cache().pedalboard.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        session.set_control(4, "gain", 0.7);
        assert_eq!(session.cache().control_value(4, "gain"), Some(0.7));

        let frame = remote.recv().await.unwrap();
        assert_eq!(frame.header.message, "setControl");
        assert_eq!(frame.header.reply_to, None);
        let body = frame.body.unwrap();
        assert_eq!(body["value"], 0.7);
        assert_eq!(body["clientId"], session.client_id());

        // the host broadcasts the change back to every client, including
        // the originator; the merge must be a no-op
        remote.push_frame(Envelope::notification(
            "onControlChanged",
            Some(json!({
                "instance": 4,
                "symbol": "gain",
                "value": 0.7,
                "clientId": session.client_id(),
            })),
        ));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(session.cache().control_value(4, "gain"), Some(0.7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preview_control_does_not_touch_the_cache() {
        let (session, mut remote, _dialer) = connected().await;
        session.preview_control(4, "gain", 0.9);
        let frame = remote.recv().await.unwrap();
        assert_eq!(frame.header.message, "previewControl");
        assert_eq!(session.cache().control_value(4, "gain"), Some(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_disconnect_enters_reconnecting() {
        let (session, mut remote, _dialer) = connected().await;
        remote.disconnect();
        settle().await;
        assert_eq!(session.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_jack_settings_maps_to_applying_changes() {
        let (session, mut remote, _dialer) = connected().await;
        let action = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .apply_jack_settings(JackSettings {
                        sample_rate: 96000,
                        buffer_size: 256,
                    })
                    .await
            })
        };
        answer(&mut remote, "setJackSettings", json!({})).await;
        action.await.unwrap().unwrap();
        assert_eq!(session.cache().jack_settings.get().sample_rate, 96000);

        remote.disconnect();
        settle().await;
        assert_eq!(session.state(), ConnectionState::ApplyingChanges);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_update_maps_to_installing_update() {
        let (session, mut remote, _dialer) = connected().await;
        let action = {
            let session = session.clone();
            tokio::spawn(async move { session.install_update().await })
        };
        answer(&mut remote, "updateNow", json!({})).await;
        action.await.unwrap().unwrap();

        remote.disconnect();
        settle().await;
        assert_eq!(session.state(), ConnectionState::InstallingUpdate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotspot_change_maps_to_hotspot_changing() {
        let (session, mut remote, _dialer) = connected().await;
        let action = {
            let session = session.clone();
            tokio::spawn(async move { session.set_hotspot(true).await })
        };
        answer(&mut remote, "setHotspot", json!({})).await;
        action.await.unwrap().unwrap();

        remote.disconnect();
        settle().await;
        assert_eq!(session.state(), ConnectionState::HotspotChanging);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugin_rescan_push_maps_to_reloading_plugins() {
        let (session, mut remote, _dialer) = connected().await;
        remote.push_frame(Envelope::notification("onLv2PluginsChanging", None));
        settle().await;

        remote.disconnect();
        settle().await;
        assert_eq!(session.state(), ConnectionState::ReloadingPlugins);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_window_reverts_to_plain_reconnecting() {
        let (session, mut remote, _dialer) = connected().await;
        remote.push_frame(Envelope::notification("onLv2PluginsChanging", None));
        settle().await;

        // no disconnect within the window: a later one is unexpected again
        tokio::time::sleep(EXPECT_DISCONNECT_WINDOW + Duration::from_secs(1)).await;
        remote.disconnect();
        settle().await;
        assert_eq!(session.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resyncs_back_to_ready() {
        let (session, mut remote, dialer) = connected().await;

        let mut fresh = dialer.script_link();
        remote.disconnect();
        serve_full_load(&mut fresh, "1.0").await;
        settle().await;
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_change_across_reconnect_is_terminal() {
        let (session, mut remote, dialer) = connected().await;

        let stale = Arc::new(Mutex::new(Vec::new()));
        let stale_clone = stale.clone();
        session.client_stale().subscribe(move |version: &String| {
            lock(&stale_clone).push(version.clone());
        });

        let mut fresh = dialer.script_link();
        remote.disconnect();
        answer(&mut fresh, "hello", json!({})).await;
        answer(&mut fresh, "version", json!("2.0")).await;
        settle().await;

        assert!(matches!(session.state(), ConnectionState::Error(_)));
        assert_eq!(lock(&stale).clone(), vec!["2.0".to_string()]);

        // terminal: a later disconnect must not start another retry loop
        let dials = dialer.dial_count();
        fresh.disconnect();
        settle().await;
        assert_eq!(dialer.dial_count(), dials);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_failure_is_terminal_error() {
        let (session, mut remote, dialer) = connected().await;

        let mut fresh = dialer.script_link();
        remote.disconnect();
        let call = fresh.recv().await.unwrap();
        assert_eq!(call.header.message, "hello");
        fresh.push_frame(Envelope::reply(
            "error",
            call.header.reply_to.unwrap(),
            Some(json!({"reason": "busy"})),
        ));
        settle().await;
        assert!(matches!(session.state(), ConnectionState::Error(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_fanout_sends_one_wire_subscription() {
        let (session, mut remote, _dialer) = connected().await;

        let hits_a = Arc::new(AtomicU32::new(0));
        let hits_b = Arc::new(AtomicU32::new(0));

        let first = {
            let session = session.clone();
            let hits = hits_a.clone();
            tokio::spawn(async move {
                session
                    .monitor_port(4, "gain", move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            })
        };
        answer(&mut remote, "monitorPort", json!({})).await;
        let sub_a = first.await.unwrap().unwrap();

        // second subscriber on the same key: no wire traffic
        let hits = hits_b.clone();
        let sub_b = session
            .monitor_port(4, "gain", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        settle().await;
        assert!(remote.try_recv().is_none());

        remote.push_frame(Envelope::notification(
            "onMonitorPortOutput",
            Some(json!({ "instance": 4, "symbol": "gain", "value": 0.25 })),
        ));
        settle().await;
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);

        // first removal leaves the server subscription active
        session.unmonitor_port(sub_a).await.unwrap();
        settle().await;
        assert!(remote.try_recv().is_none());

        let last = {
            let session = session.clone();
            tokio::spawn(async move { session.unmonitor_port(sub_b).await })
        };
        answer(&mut remote, "unmonitorPort", json!({})).await;
        last.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_vu_fanout_and_dispatch() {
        let (session, mut remote, _dialer) = connected().await;

        let levels = Arc::new(Mutex::new(Vec::new()));
        let levels_clone = levels.clone();
        let adding = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .add_vu_subscription(4, move |level| {
                        lock(&levels_clone).push(*level);
                    })
                    .await
            })
        };
        answer(&mut remote, "addVuSubscription", json!({})).await;
        let sub = adding.await.unwrap().unwrap();

        remote.push_frame(Envelope::notification(
            "onVuUpdate",
            Some(json!({ "instance": 4, "value": -12.5 })),
        ));
        settle().await;
        assert_eq!(lock(&levels).clone(), vec![-12.5]);

        let removing = {
            let session = session.clone();
            tokio::spawn(async move { session.remove_vu_subscription(sub).await })
        };
        answer(&mut remote, "removeVuSubscription", json!({})).await;
        removing.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_reissues_wire_subscriptions() {
        let (session, mut remote, dialer) = connected().await;

        let monitoring = {
            let session = session.clone();
            tokio::spawn(async move { session.monitor_port(4, "gain", |_| {}).await })
        };
        answer(&mut remote, "monitorPort", json!({})).await;
        monitoring.await.unwrap().unwrap();

        let mut fresh = dialer.script_link();
        remote.disconnect();
        serve_full_load(&mut fresh, "1.0").await;
        answer(&mut fresh, "monitorPort", json!({})).await;
        settle().await;
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_application_is_idempotent() {
        let (session, mut remote, _dialer) = connected().await;

        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        session.cache().jack_configuration.subscribe(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let body = json!({ "sampleRate": 48000, "bufferSize": 256, "xruns": 3 });
        remote.push_frame(Envelope::notification(
            "onJackConfigurationChanged",
            Some(body.clone()),
        ));
        remote.push_frame(Envelope::notification(
            "onJackConfigurationChanged",
            Some(body),
        ));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(session.cache().jack_configuration.get().xruns, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_status_drives_download_state() {
        let (session, mut remote, _dialer) = connected().await;

        remote.push_frame(Envelope::notification(
            "onUpdateStatusChanged",
            Some(json!({ "stage": "downloading", "progress": 0.5 })),
        ));
        settle().await;
        assert_eq!(session.state(), ConnectionState::DownloadingUpdate);

        remote.push_frame(Envelope::notification(
            "onUpdateStatusChanged",
            Some(json!({ "stage": "ready" })),
        ));
        settle().await;
        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(session.cache().update_status.get(), UpdateStatus::Ready);

        // installing arms the expected disconnect
        remote.push_frame(Envelope::notification(
            "onUpdateStatusChanged",
            Some(json!({ "stage": "installing" })),
        ));
        settle().await;
        remote.disconnect();
        settle().await;
        assert_eq!(session.state(), ConnectionState::InstallingUpdate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_suspends_and_resumes() {
        let (session, _remote, dialer) = connected().await;

        session.enter_background();
        settle().await;
        assert_eq!(session.state(), ConnectionState::Background);
        assert_eq!(dialer.dial_count(), 1);

        let mut fresh = dialer.script_link();
        session.exit_background();
        serve_full_load(&mut fresh, "1.0").await;
        settle().await;
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_call_gets_a_generic_ack() {
        let (session, mut remote, _dialer) = connected().await;
        let _ = &session;

        remote.push_text(r#"[{"message":"onLv2PluginsChanging","replyTo":9}]"#);
        let ack = remote.recv().await.unwrap();
        assert_eq!(ack.header.message, "ok");
        assert_eq!(ack.header.reply, Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_handle_stops_the_session() {
        let (session, mut remote, _dialer) = connected().await;
        drop(session);
        settle().await;

        // nothing is left to answer the host once the last handle is gone
        remote.push_text(r#"[{"message":"onLv2PluginsChanging","replyTo":9}]"#);
        settle().await;
        assert!(remote.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_reconnecting() {
        let (session, mut remote, dialer) = connected().await;
        session.close();
        settle().await;

        remote.disconnect();
        settle().await;
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_hotspot_probe_reports_the_new_address() {
        let probe_target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = probe_target.local_addr().unwrap().to_string();

        let mut config = SessionConfig::new("ws://patchbay.local/ws");
        config.candidate_addresses = vec![address.clone()];
        let (session, mut remote, _dialer) = connect_session(config).await;

        let (found_tx, found_rx) = tokio::sync::oneshot::channel::<String>();
        let found_tx = Mutex::new(Some(found_tx));
        session.server_address_changed().subscribe(move |address: &String| {
            if let Some(tx) = lock(&found_tx).take() {
                let _ = tx.send(address.clone());
            }
        });

        let action = {
            let session = session.clone();
            tokio::spawn(async move { session.set_hotspot(true).await })
        };
        answer(&mut remote, "setHotspot", json!({})).await;
        action.await.unwrap().unwrap();
        remote.disconnect();

        let found = tokio::time::timeout(Duration::from_secs(5), found_rx)
            .await
            .expect("probe never reported an address")
            .unwrap();
        assert_eq!(found, address);
    }
}
