//! Message transport over a single persistent connection.
//!
//! The transport frames outgoing messages, demultiplexes incoming frames
//! into correlated replies and unsolicited pushes, and runs the
//! reconnect/backoff state machine. It never interprets message bodies
//! beyond the envelope's correlation fields.
//!
//! The physical connection is owned by a background task; the [`Socket`]
//! handle talks to it over a command channel. The connection is replaced
//! wholesale on every reconnect, never patched in place, and each
//! incarnation gets a fresh epoch: a reply is delivered only when both its
//! correlation id and its epoch match, so a stale reply is provably
//! ignorable rather than accidentally ignorable.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, Header, NO_REPLY};
use crate::error::{ClientError, ProtocolError, Result};
use crate::messages::ServerPush;

/// Attempt-count hint passed to [`SocketListener::on_reconnecting`].
pub const MAX_RECONNECT_ATTEMPTS: u32 = 6;

/// Backoff delay before the second retry; doubles after each failure.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Backoff delay ceiling.
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(3000);

/// Cumulative backoff budget. Once spent, the transport reports a fatal
/// connection loss exactly once and goes idle.
pub const TOTAL_RETRY_BUDGET: Duration = Duration::from_millis(90_000);

/// Writing half of a dialed connection, as text frames.
pub type WireTx = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;

/// Reading half of a dialed connection. The stream ending means the peer
/// closed.
pub type WireRx = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Connection factory. The production implementation dials a WebSocket;
/// tests substitute in-memory pipes.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<(WireTx, WireRx)>;
}

/// Dials `ws://` / `wss://` URLs with tokio-tungstenite.
pub struct WsDialer {
    pub url: String,
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<(WireTx, WireRx)> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Handshake(e.to_string()))?;
        let (sink, stream) = stream.split();

        let tx: WireTx = Box::pin(
            sink.sink_map_err(|e| ClientError::ConnectionLost(e.to_string()))
                .with(|text: String| {
                    futures_util::future::ready(Ok::<_, ClientError>(Message::Text(text)))
                }),
        );
        let rx: WireRx = Box::pin(stream.filter_map(|frame| {
            futures_util::future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => Some(Ok(text)),
                    Err(e) => Some(Err(ProtocolError::NotUtf8(e).into())),
                },
                // ping/pong are handled by the library; a close frame is
                // followed by the stream ending
                Ok(_) => None,
                Err(e) => Some(Err(ClientError::ConnectionLost(e.to_string()))),
            })
        }));
        Ok((tx, rx))
    }
}

/// Receives transport-level callbacks. Implemented by the session.
#[async_trait]
pub trait SocketListener: Send + Sync {
    /// An unsolicited server message. `reply_to` is [`NO_REPLY`] unless
    /// the server expects an answer via [`Socket::reply`].
    async fn on_push(&self, push: ServerPush, reply_to: i64);

    /// Called before each reconnect attempt. Returning `false` stops the
    /// retry loop outright; the socket then stays down until it is
    /// explicitly resumed with [`Socket::exit_background`].
    async fn on_reconnecting(&self, attempt: u32, max_attempts: u32) -> bool;

    /// A fresh connection has been adopted after a loss.
    async fn on_reconnected(&self);

    /// The connection dropped without the caller asking for it.
    async fn on_connection_lost(&self);

    /// The transport gave up: its retry budget is exhausted.
    async fn on_fatal(&self, message: String);

    /// A frame that was not a valid envelope. The connection stays open
    /// and later frames are still processed.
    async fn on_protocol_error(&self, error: ProtocolError) {
        warn!("discarding malformed frame: {error}");
    }

    /// An `error` push with no pending call to reject.
    async fn on_server_error(&self, detail: Value) {
        warn!("server reported an error outside any call: {detail}");
    }
}

enum Command {
    Send {
        name: String,
        body: Option<Value>,
    },
    Request {
        name: String,
        body: Option<Value>,
        reply_tx: oneshot::Sender<Result<Value>>,
    },
    Reply {
        reply_to: i64,
        name: String,
        body: Option<Value>,
    },
    EnterBackground,
    ExitBackground,
    Close,
}

/// Handle to the transport task. Cheap to clone.
#[derive(Clone)]
pub struct Socket {
    cmd_tx: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
}

impl Socket {
    /// Establish the first connection. A handshake failure is returned to
    /// the caller without any retry; retrying the first connection is the
    /// caller's decision.
    ///
    /// The listener is held weakly: the caller keeps it alive, and the
    /// task shuts down once both the listener and every handle are gone.
    pub async fn connect(
        dialer: Arc<dyn Dialer>,
        listener: Arc<dyn SocketListener>,
    ) -> Result<Socket> {
        let link = dialer.dial().await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let task = SocketTask {
            dialer,
            listener: Arc::downgrade(&listener),
            connected: connected.clone(),
            pending: HashMap::new(),
            next_correlation: 0,
            epoch: 0,
        };
        tokio::spawn(task.run(cmd_rx, link));
        Ok(Socket { cmd_tx, connected })
    }

    /// Fire-and-forget notification. Silently dropped while the transport
    /// is reconnecting or suspended; there is no queueing.
    pub fn send(&self, name: &str, body: Option<Value>) {
        let _ = self.cmd_tx.send(Command::Send {
            name: name.to_string(),
            body,
        });
    }

    /// Correlated call. Resolves with the reply body, or rejects with
    /// [`ClientError::Server`] when the reply's message is `"error"`, or
    /// with [`ClientError::Abandoned`] when the connection is replaced
    /// before the reply arrives.
    pub async fn request<T: DeserializeOwned>(&self, name: &str, body: Option<Value>) -> Result<T> {
        let value = self.request_value(name, body).await?;
        serde_json::from_value(value).map_err(ClientError::Payload)
    }

    /// Correlated call returning the raw reply body.
    pub async fn request_value(&self, name: &str, body: Option<Value>) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                name: name.to_string(),
                body,
                reply_tx,
            })
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.unwrap_or(Err(ClientError::Closed))
    }

    /// Answer an inbound call. Skipped entirely when the caller asked for
    /// no reply (`reply_to == NO_REPLY`).
    pub fn reply(&self, reply_to: i64, name: &str, body: Option<Value>) {
        if reply_to == NO_REPLY {
            return;
        }
        let _ = self.cmd_tx.send(Command::Reply {
            reply_to,
            name: name.to_string(),
            body,
        });
    }

    /// Close the connection and stop the task. Idempotent; never fires
    /// loss callbacks.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Yield the connection without treating the closure as a loss, e.g.
    /// while the UI is hidden. No retry loop runs.
    pub fn enter_background(&self) {
        let _ = self.cmd_tx.send(Command::EnterBackground);
    }

    /// Unconditionally run the full reconnect sequence.
    pub fn exit_background(&self) {
        let _ = self.cmd_tx.send(Command::ExitBackground);
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct PendingCall {
    epoch: u64,
    reply_tx: oneshot::Sender<Result<Value>>,
}

/// Why an open connection stopped being usable.
enum Flow {
    /// Abnormal closure; the retry loop should run.
    Lost,
    /// Caller-initiated suspension; wait for an explicit resume.
    Suspended,
    /// Caller-initiated shutdown.
    Shutdown,
}

enum Idle {
    Resume,
    Shutdown,
}

enum Outcome {
    Reconnected(WireTx, WireRx),
    /// The listener vetoed further attempts; idle until resumed.
    Stopped,
    /// Retry budget exhausted; reported fatally, idle until resumed.
    Fatal,
    Shutdown,
}

struct SocketTask {
    dialer: Arc<dyn Dialer>,
    /// Weak so the task never keeps its own listener (and whatever owns
    /// it) alive; dropping every handle tears the whole thing down.
    listener: Weak<dyn SocketListener>,
    connected: Arc<AtomicBool>,
    pending: HashMap<i64, PendingCall>,
    /// Monotonically increasing for the lifetime of the socket, so a
    /// correlation id can never be reused across connections.
    next_correlation: i64,
    /// Bumped whenever the physical connection is replaced.
    epoch: u64,
}

impl SocketTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>, link: (WireTx, WireRx)) {
        let mut link = Some(link);
        loop {
            match link.take() {
                Some((tx, rx)) => match self.run_open(&mut cmd_rx, tx, rx).await {
                    Flow::Lost => {
                        if let Some(listener) = self.listener.upgrade() {
                            listener.on_connection_lost().await;
                        }
                        match self.retry(&mut cmd_rx).await {
                            Outcome::Reconnected(tx, rx) => link = Some((tx, rx)),
                            Outcome::Stopped | Outcome::Fatal => {}
                            Outcome::Shutdown => break,
                        }
                    }
                    Flow::Suspended => {}
                    Flow::Shutdown => break,
                },
                None => match self.run_idle(&mut cmd_rx).await {
                    Idle::Resume => match self.retry(&mut cmd_rx).await {
                        Outcome::Reconnected(tx, rx) => link = Some((tx, rx)),
                        Outcome::Stopped | Outcome::Fatal => {}
                        Outcome::Shutdown => break,
                    },
                    Idle::Shutdown => break,
                },
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.abandon_pending();
    }

    /// Event loop while a connection is open: multiplex inbound frames
    /// with outbound commands.
    async fn run_open(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        mut tx: WireTx,
        mut rx: WireRx,
    ) -> Flow {
        self.connected.store(true, Ordering::SeqCst);
        loop {
            tokio::select! {
                frame = rx.next() => match frame {
                    Some(Ok(text)) => self.handle_frame(text).await,
                    // a malformed frame, not a dead connection
                    Some(Err(ClientError::Protocol(error))) => {
                        if let Some(listener) = self.listener.upgrade() {
                            listener.on_protocol_error(error).await;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("connection error: {e}");
                        self.connected.store(false, Ordering::SeqCst);
                        return Flow::Lost;
                    }
                    None => {
                        self.connected.store(false, Ordering::SeqCst);
                        return Flow::Lost;
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send { name, body }) => {
                        let frame = Envelope::notification(&name, body).encode();
                        if tx.send(frame).await.is_err() {
                            self.connected.store(false, Ordering::SeqCst);
                            return Flow::Lost;
                        }
                    }
                    Some(Command::Request { name, body, reply_tx }) => {
                        let id = self.next_correlation;
                        self.next_correlation += 1;
                        self.pending.insert(id, PendingCall {
                            epoch: self.epoch,
                            reply_tx,
                        });
                        let frame = Envelope::call(&name, id, body).encode();
                        if tx.send(frame).await.is_err() {
                            // the just-registered call is abandoned with
                            // the rest when the retry loop starts
                            self.connected.store(false, Ordering::SeqCst);
                            return Flow::Lost;
                        }
                    }
                    Some(Command::Reply { reply_to, name, body }) => {
                        let frame = Envelope::reply(&name, reply_to, body).encode();
                        if tx.send(frame).await.is_err() {
                            self.connected.store(false, Ordering::SeqCst);
                            return Flow::Lost;
                        }
                    }
                    Some(Command::EnterBackground) => {
                        let _ = tx.close().await;
                        self.connected.store(false, Ordering::SeqCst);
                        return Flow::Suspended;
                    }
                    Some(Command::ExitBackground) => {
                        // already connected
                    }
                    Some(Command::Close) | None => {
                        let _ = tx.close().await;
                        self.connected.store(false, Ordering::SeqCst);
                        return Flow::Shutdown;
                    }
                },
            }
        }
    }

    /// Demultiplex one inbound frame into a reply or a push.
    async fn handle_frame(&mut self, text: String) {
        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope,
            Err(error) => {
                if let Some(listener) = self.listener.upgrade() {
                    listener.on_protocol_error(error).await;
                }
                return;
            }
        };
        let Header {
            message,
            reply_to,
            reply,
        } = envelope.header;

        if let Some(id) = reply {
            let call = match self.pending.remove(&id) {
                Some(call) if call.epoch == self.epoch => call,
                // no matching pending call: abandoned by a prior
                // reconnect, or never issued
                _ => {
                    debug!(id, "ignoring reply with no pending call");
                    return;
                }
            };
            let body = envelope.body.unwrap_or(Value::Null);
            let result = if message == "error" {
                Err(ClientError::Server(body))
            } else {
                Ok(body)
            };
            let _ = call.reply_tx.send(result);
            return;
        }
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        if message == "error" {
            listener
                .on_server_error(envelope.body.unwrap_or(Value::Null))
                .await;
        } else {
            match ServerPush::decode(&message, envelope.body) {
                Ok(push) => {
                    listener.on_push(push, reply_to.unwrap_or(NO_REPLY)).await;
                }
                Err(error) => listener.on_protocol_error(error).await,
            }
        }
    }

    /// Reconnect with capped exponential backoff. Every pending call is
    /// rejected first; their callers observe [`ClientError::Abandoned`]
    /// and may re-issue after the listener's `on_reconnected`.
    async fn retry(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> Outcome {
        self.abandon_pending();
        self.epoch += 1;

        let mut attempt: u32 = 0;
        let mut delay = INITIAL_RETRY_DELAY;
        let mut total = Duration::ZERO;

        loop {
            let Some(listener) = self.listener.upgrade() else {
                return Outcome::Stopped;
            };
            if !listener.on_reconnecting(attempt, MAX_RECONNECT_ATTEMPTS).await {
                info!("reconnect stopped by listener after {attempt} attempts");
                return Outcome::Stopped;
            }
            attempt += 1;
            match self.dialer.dial().await {
                Ok((tx, rx)) => {
                    info!(attempt, "reconnected");
                    self.connected.store(true, Ordering::SeqCst);
                    listener.on_reconnected().await;
                    return Outcome::Reconnected(tx, rx);
                }
                Err(e) => {
                    if total >= TOTAL_RETRY_BUDGET {
                        warn!("retry budget exhausted: {e}");
                        listener.on_fatal(format!("connection lost: {e}")).await;
                        return Outcome::Fatal;
                    }
                    debug!(attempt, ?delay, "reconnect attempt failed: {e}");
                    total += delay;
                    if let Some(outcome) = self.backoff(cmd_rx, delay).await {
                        return outcome;
                    }
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
            }
        }
    }

    /// Wait out one backoff delay, servicing commands the whole time so
    /// callers are answered instead of queueing against a dead wire.
    async fn backoff(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        delay: Duration,
    ) -> Option<Outcome> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send { name, .. }) => {
                        debug!(name, "dropping notification while reconnecting");
                    }
                    Some(Command::Request { reply_tx, .. }) => {
                        let _ = reply_tx.send(Err(ClientError::NotConnected));
                    }
                    Some(Command::Reply { .. }) => {}
                    Some(Command::EnterBackground) => return Some(Outcome::Stopped),
                    Some(Command::ExitBackground) => {}
                    Some(Command::Close) | None => return Some(Outcome::Shutdown),
                },
            }
        }
    }

    /// Command loop while suspended or given up; only an explicit resume
    /// or shutdown leaves it.
    async fn run_idle(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> Idle {
        loop {
            match cmd_rx.recv().await {
                Some(Command::Send { name, .. }) => {
                    debug!(name, "dropping notification while disconnected");
                }
                Some(Command::Request { reply_tx, .. }) => {
                    let _ = reply_tx.send(Err(ClientError::NotConnected));
                }
                Some(Command::Reply { .. }) => {}
                Some(Command::EnterBackground) => {}
                Some(Command::ExitBackground) => return Idle::Resume,
                Some(Command::Close) | None => return Idle::Shutdown,
            }
        }
    }

    fn abandon_pending(&mut self) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "abandoning in-flight calls");
        }
        for (_, call) in self.pending.drain() {
            let _ = call.reply_tx.send(Err(ClientError::Abandoned));
        }
    }
}
