//! The socket: lifecycle state machine, handshake, auth token tracking,
//! write queue, in-band ping watchdog and automatic reconnection.
//!
//! All socket state is owned by one I/O task. The public [`Socket`] handle
//! is cheap to clone and callable from any thread; every operation is
//! forwarded to the task over a command channel, so no internal state
//! needs locking on the hot path.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep, sleep_until},
};
use tokio_tungstenite::tungstenite::{
    Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, ChannelShared, ChannelState, ChannelStateChange, SubscribeOptions},
    config::{AutoReconnectOptions, ConnectOptions},
    error::{ScError, ScResult},
    pending::{PendingCalls, ResponseHandler},
    protocol::{self, CallId, ProtocolEvent},
    signal::{Listener, Signal},
    transport::{self, WsStream},
};

/// Connection state of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Connecting,
    Open,
}

impl SocketState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Connecting => 1,
            Self::Open => 2,
        }
    }
}

/// Authentication state, derived from whether a signed token is held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

/// A server-initiated event delivered to emit listeners.
#[derive(Clone)]
pub struct EmitEvent {
    event: String,
    data: Value,
    responder: Option<Responder>,
}

impl EmitEvent {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// `true` when the server attached a cid and expects a response.
    pub fn wants_response(&self) -> bool {
        self.responder.is_some()
    }

    /// Queue a response for the server. No-op when no response was
    /// requested or the connection that delivered the event is gone.
    pub fn respond(&self, data: Value) {
        if let Some(responder) = &self.responder {
            responder.respond(data);
        }
    }
}

/// Replies to one server event; bound to the connection it arrived on.
#[derive(Clone)]
struct Responder {
    rid: CallId,
    epoch: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Responder {
    fn respond(&self, data: Value) {
        let _ = self.cmd_tx.send(Command::Respond {
            rid: self.rid,
            data,
            epoch: self.epoch,
        });
    }
}

pub(crate) enum Command {
    Connect,
    Close,
    Emit {
        event: String,
        data: Value,
        handler: Option<ResponseHandler>,
        no_timeout: bool,
    },
    Subscribe {
        name: String,
        options: SubscribeOptions,
    },
    Unsubscribe {
        name: String,
    },
    DestroyChannel {
        name: String,
    },
    Respond {
        rid: CallId,
        data: Value,
        epoch: u64,
    },
}

#[derive(Default)]
struct AuthToken {
    signed: String,
    decoded: Value,
}

struct SocketEvents {
    raw: Signal<Bytes>,
    error: Signal<ScError>,
    connecting: Signal<()>,
    connect: Signal<Value>,
    connect_abort: Signal<ScError>,
    disconnect: Signal<ScError>,
    authenticate: Signal<String>,
    auth_token_change: Signal<String>,
    deauthenticate: Signal<()>,
    subscribe: Signal<String>,
    subscribe_fail: Signal<(String, ScError)>,
    subscription_state_change: Signal<ChannelStateChange>,
    unsubscribe: Signal<String>,
    emit: Signal<EmitEvent>,
}

impl SocketEvents {
    fn new() -> Self {
        Self {
            raw: Signal::new(),
            error: Signal::new(),
            connecting: Signal::new(),
            connect: Signal::new(),
            connect_abort: Signal::new(),
            disconnect: Signal::new(),
            authenticate: Signal::new(),
            auth_token_change: Signal::new(),
            deauthenticate: Signal::new(),
            subscribe: Signal::new(),
            subscribe_fail: Signal::new(),
            subscription_state_change: Signal::new(),
            unsubscribe: Signal::new(),
            emit: Signal::new(),
        }
    }
}

struct SocketShared {
    state: AtomicU8,
    auth: Mutex<AuthToken>,
    channels: Mutex<HashMap<String, Arc<ChannelShared>>>,
    events: SocketEvents,
}

impl SocketShared {
    fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SocketState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn auth_state(&self) -> AuthState {
        if self.auth.lock().signed.is_empty() {
            AuthState::Unauthenticated
        } else {
            AuthState::Authenticated
        }
    }

    fn channel(&self, name: &str) -> Option<Arc<ChannelShared>> {
        self.channels.lock().get(name).cloned()
    }

    fn channel_list(&self) -> Vec<Arc<ChannelShared>> {
        self.channels.lock().values().cloned().collect()
    }
}

/// Handle to one SocketCluster socket.
///
/// Cheap to clone; all clones drive the same connection. The underlying
/// I/O task keeps running until every `Socket` and [`Channel`] handle has
/// been dropped.
#[derive(Clone)]
pub struct Socket {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<SocketShared>,
    options: Arc<ConnectOptions>,
}

impl Socket {
    /// Create a socket for the given options and spawn its I/O task.
    ///
    /// Must be called within a Tokio runtime. The socket starts CLOSED;
    /// call [`connect`](Self::connect) to open it.
    pub fn new(options: ConnectOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared {
            state: AtomicU8::new(SocketState::Closed.as_u8()),
            auth: Mutex::new(AuthToken::default()),
            channels: Mutex::new(HashMap::new()),
            events: SocketEvents::new(),
        });
        let options = Arc::new(options);

        let actor = SocketActor {
            options: Arc::clone(&options),
            shared: Arc::clone(&shared),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            next_call_id: 1,
            out_queue: VecDeque::new(),
            deferred: VecDeque::new(),
            pending: PendingCalls::default(),
            connect_attempts: 0,
            ping_timeout: options.ack_timeout,
            epoch: 0,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            shared,
            options,
        }
    }

    /// Open the connection. Idempotent while not CLOSED.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Close the connection. Auto-reconnect is suppressed; the resulting
    /// disconnect event (connectAbort when the socket never reached OPEN)
    /// carries [`ScError::ConnectionClosed`].
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Alias for [`close`](Self::close).
    pub fn disconnect(&self) {
        self.close();
    }

    pub fn state(&self) -> SocketState {
        self.shared.state()
    }

    pub fn auth_state(&self) -> AuthState {
        self.shared.auth_state()
    }

    /// The signed JWT currently held; empty when unauthenticated.
    pub fn signed_auth_token(&self) -> String {
        self.shared.auth.lock().signed.clone()
    }

    /// The decoded JWT payload currently held; null when unauthenticated.
    pub fn auth_token(&self) -> Value {
        self.shared.auth.lock().decoded.clone()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Send an event without requesting an ack.
    pub fn emit(&self, event: impl Into<String>, data: Value) {
        let _ = self.cmd_tx.send(Command::Emit {
            event: event.into(),
            data,
            handler: None,
            no_timeout: false,
        });
    }

    /// Send an event and invoke `handler` exactly once with the ack, a
    /// [`ScError::Response`] or a [`ScError::AckTimeout`].
    pub fn emit_with_ack(
        &self,
        event: impl Into<String>,
        data: Value,
        handler: impl FnOnce(Result<Value, ScError>) + Send + 'static,
    ) {
        let _ = self.cmd_tx.send(Command::Emit {
            event: event.into(),
            data,
            handler: Some(Box::new(handler)),
            no_timeout: false,
        });
    }

    /// Like [`emit_with_ack`](Self::emit_with_ack) but without arming the
    /// ack deadline; the handler waits indefinitely for the server.
    pub fn emit_with_ack_no_timeout(
        &self,
        event: impl Into<String>,
        data: Value,
        handler: impl FnOnce(Result<Value, ScError>) + Send + 'static,
    ) {
        let _ = self.cmd_tx.send(Command::Emit {
            event: event.into(),
            data,
            handler: Some(Box::new(handler)),
            no_timeout: true,
        });
    }

    /// Async convenience over [`emit_with_ack`](Self::emit_with_ack).
    ///
    /// Resolves with [`ScError::ConnectionClosed`] when the socket goes
    /// away before the server acks.
    pub async fn call(&self, event: impl Into<String>, data: Value) -> ScResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.emit_with_ack(event, data, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(ScError::ConnectionClosed))
    }

    /// Subscribe to a channel with default options.
    pub fn subscribe(&self, name: impl Into<String>) -> Channel {
        self.subscribe_with(name, SubscribeOptions::default())
    }

    /// Subscribe to a channel.
    ///
    /// Returns the channel handle immediately; watch the subscribe and
    /// subscribeFail events for the outcome. Subscribing an existing
    /// channel returns the same underlying channel.
    pub fn subscribe_with(&self, name: impl Into<String>, options: SubscribeOptions) -> Channel {
        let name = name.into();
        let shared = {
            let mut channels = self.shared.channels.lock();
            Arc::clone(channels.entry(name.clone()).or_insert_with(|| {
                Arc::new(ChannelShared::new(name.clone(), options.clone()))
            }))
        };
        let _ = self.cmd_tx.send(Command::Subscribe { name, options });
        Channel {
            shared,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Look up an existing channel without subscribing.
    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.shared.channel(name).map(|shared| Channel {
            shared,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Handles for every channel known to this socket.
    pub fn channels(&self) -> Vec<Channel> {
        self.shared
            .channel_list()
            .into_iter()
            .map(|shared| Channel {
                shared,
                cmd_tx: self.cmd_tx.clone(),
            })
            .collect()
    }

    /// Leave a channel by name.
    pub fn unsubscribe(&self, name: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Unsubscribe { name: name.into() });
    }

    /// Detach listeners, unsubscribe and drop a channel by name.
    pub fn destroy_channel(&self, name: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(Command::DestroyChannel { name: name.into() });
    }

    /// Detach every watch listener of a channel.
    pub fn unwatch(&self, name: &str) {
        if let Some(channel) = self.shared.channel(name) {
            channel.events.message.clear();
        }
    }

    pub fn on_raw(&self, f: impl Fn(&Bytes) + Send + Sync + 'static) -> Listener {
        self.shared.events.raw.connect(f)
    }

    pub fn on_error(&self, f: impl Fn(&ScError) + Send + Sync + 'static) -> Listener {
        self.shared.events.error.connect(f)
    }

    pub fn on_connecting(&self, f: impl Fn(&()) + Send + Sync + 'static) -> Listener {
        self.shared.events.connecting.connect(f)
    }

    /// Fires on the handshake ack with its payload; the socket is fully
    /// usable from this point.
    pub fn on_connect(&self, f: impl Fn(&Value) + Send + Sync + 'static) -> Listener {
        self.shared.events.connect.connect(f)
    }

    /// Fires when a connection attempt fails before reaching OPEN.
    pub fn on_connect_abort(&self, f: impl Fn(&ScError) + Send + Sync + 'static) -> Listener {
        self.shared.events.connect_abort.connect(f)
    }

    /// Fires when a previously OPEN connection ends.
    pub fn on_disconnect(&self, f: impl Fn(&ScError) + Send + Sync + 'static) -> Listener {
        self.shared.events.disconnect.connect(f)
    }

    pub fn on_authenticate(&self, f: impl Fn(&String) + Send + Sync + 'static) -> Listener {
        self.shared.events.authenticate.connect(f)
    }

    pub fn on_auth_token_change(&self, f: impl Fn(&String) + Send + Sync + 'static) -> Listener {
        self.shared.events.auth_token_change.connect(f)
    }

    pub fn on_deauthenticate(&self, f: impl Fn(&()) + Send + Sync + 'static) -> Listener {
        self.shared.events.deauthenticate.connect(f)
    }

    pub fn on_subscribe(&self, f: impl Fn(&String) + Send + Sync + 'static) -> Listener {
        self.shared.events.subscribe.connect(f)
    }

    pub fn on_subscribe_fail(
        &self,
        f: impl Fn(&(String, ScError)) + Send + Sync + 'static,
    ) -> Listener {
        self.shared.events.subscribe_fail.connect(f)
    }

    pub fn on_subscription_state_change(
        &self,
        f: impl Fn(&ChannelStateChange) + Send + Sync + 'static,
    ) -> Listener {
        self.shared.events.subscription_state_change.connect(f)
    }

    pub fn on_unsubscribe(&self, f: impl Fn(&String) + Send + Sync + 'static) -> Listener {
        self.shared.events.unsubscribe.connect(f)
    }

    /// Fires for every server-initiated event that is not protocol
    /// housekeeping; respond through [`EmitEvent::respond`].
    pub fn on_emit(&self, f: impl Fn(&EmitEvent) + Send + Sync + 'static) -> Listener {
        self.shared.events.emit.connect(f)
    }
}

/// Compute the reconnect delay for a 0-indexed attempt.
pub(crate) fn reconnect_delay(options: &AutoReconnectOptions, attempt: u32) -> Duration {
    let jitter = options.randomness.as_millis() as f64 * rand::rng().random::<f64>();
    let base = options.initial_delay.as_millis() as f64 + jitter;
    let exponent = options.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    let timeout = (base * exponent).round();
    Duration::from_millis(timeout.min(options.max_delay.as_millis() as f64) as u64)
}

enum OutItem {
    Envelope(Value),
    Pong,
}

enum Idle {
    Connect,
    Shutdown,
}

enum Establish {
    Socket(Box<WsStream>),
    Failed(ScError),
    Aborted,
    HandlesDropped,
}

enum Ended {
    Voluntary,
    Involuntary(ScError),
    HandlesDropped,
}

enum Backoff {
    Retry,
    Abort,
    Shutdown,
}

struct SocketActor {
    options: Arc<ConnectOptions>,
    shared: Arc<SocketShared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    next_call_id: CallId,
    out_queue: VecDeque<OutItem>,
    /// Commands held back until the connection is usable, so queued emits
    /// take their cids after the handshake's.
    deferred: VecDeque<Command>,
    pending: PendingCalls,
    connect_attempts: u32,
    ping_timeout: Duration,
    epoch: u64,
}

impl SocketActor {
    async fn run(mut self) {
        debug!(host = %self.options.host, "socket task started");
        loop {
            match self.run_closed().await {
                Idle::Shutdown => break,
                Idle::Connect => {}
            }
            if !self.run_connect_cycle().await {
                break;
            }
        }
        self.internal_close();
        debug!(host = %self.options.host, "socket task stopped");
    }

    /// Wait in CLOSED for a connect request.
    async fn run_closed(&mut self) -> Idle {
        loop {
            match self.cmd_rx.recv().await {
                None => return Idle::Shutdown,
                Some(Command::Connect) => return Idle::Connect,
                Some(Command::Close) => {}
                Some(command) => self.handle_command(command),
            }
        }
    }

    /// Connect, pump, and reconnect with backoff until the connection
    /// ends voluntarily or reconnection is exhausted. Returns `false`
    /// when every handle is gone and the task should stop.
    async fn run_connect_cycle(&mut self) -> bool {
        loop {
            self.shared.set_state(SocketState::Connecting);
            self.next_call_id = 1;
            self.shared.events.connecting.emit(&());

            let retry = match self.establish().await {
                Establish::Socket(ws) => {
                    info!(host = %self.options.host, "websocket connected");
                    match self.run_open(*ws).await {
                        Ended::Voluntary => {
                            self.internal_close();
                            self.shared.events.disconnect.emit(&ScError::ConnectionClosed);
                            return true;
                        }
                        Ended::HandlesDropped => return false,
                        Ended::Involuntary(error) => {
                            warn!(host = %self.options.host, error = %error, "connection lost");
                            self.internal_close();
                            self.shared.events.disconnect.emit(&error);
                            true
                        }
                    }
                }
                Establish::Aborted => {
                    // A close while still connecting never reached OPEN, so
                    // it surfaces as a connect abort; voluntariness only
                    // suppresses the reconnect attempt, never the event.
                    self.internal_close();
                    self.shared
                        .events
                        .connect_abort
                        .emit(&ScError::ConnectionClosed);
                    return true;
                }
                Establish::HandlesDropped => return false,
                Establish::Failed(error) => {
                    warn!(host = %self.options.host, error = %error, "connect failed");
                    let retryable = !matches!(error, ScError::Config { .. });
                    self.internal_close();
                    self.shared.events.connect_abort.emit(&error);
                    retryable
                }
            };

            if !retry || !self.options.auto_reconnect {
                return true;
            }
            match self.backoff_wait().await {
                Backoff::Retry => {}
                Backoff::Abort => return true,
                Backoff::Shutdown => return false,
            }
        }
    }

    /// Resolve, connect and upgrade while staying responsive to commands.
    async fn establish(&mut self) -> Establish {
        if let Err(error) = self.options.validate() {
            return Establish::Failed(error);
        }

        let connect = transport::connect(&self.options);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(ws) => Establish::Socket(Box::new(ws)),
                        Err(error) => Establish::Failed(error),
                    };
                }
                command = self.cmd_rx.recv() => match command {
                    None => return Establish::HandlesDropped,
                    Some(Command::Close) => return Establish::Aborted,
                    Some(Command::Connect) => {}
                    Some(command) => self.deferred.push_back(command),
                }
            }
        }
    }

    /// Sleep out the backoff delay, still reacting to commands.
    async fn backoff_wait(&mut self) -> Backoff {
        let attempt = self.connect_attempts;
        self.connect_attempts += 1;
        let delay = reconnect_delay(&self.options.auto_reconnect_options, attempt);
        debug!(delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");

        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return Backoff::Retry,
                command = self.cmd_rx.recv() => match command {
                    None => return Backoff::Shutdown,
                    Some(Command::Close) => return Backoff::Abort,
                    Some(Command::Connect) => return Backoff::Retry,
                    Some(command) => self.handle_command(command),
                }
            }
        }
    }

    /// The message pump for one OPEN connection.
    async fn run_open(&mut self, mut ws: WsStream) -> Ended {
        self.shared.set_state(SocketState::Open);
        self.epoch += 1;

        // The #handshake bypasses emit so nothing can debounce it and so
        // it always takes the first cid of the connection.
        let cid = self.next_cid();
        self.out_queue
            .push_back(OutItem::Envelope(protocol::handshake(cid)));

        let held_back: Vec<Command> = self.deferred.drain(..).collect();
        for command in held_back {
            self.handle_command(command);
        }

        let mut ping_deadline = Instant::now() + self.ping_timeout;

        loop {
            while let Some(item) = self.out_queue.pop_front() {
                let message = match self.encode_out(item) {
                    Ok(message) => message,
                    Err(error) => {
                        self.shared.events.error.emit(&error);
                        continue;
                    }
                };
                if let Err(error) = ws.send(message).await {
                    return Ended::Involuntary(error.into());
                }
            }

            let ack_deadline = self.pending.next_deadline();
            let ack_timer = async {
                match ack_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    None => return Ended::HandlesDropped,
                    Some(Command::Close) => {
                        let _ = ws.close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        })).await;
                        return Ended::Voluntary;
                    }
                    Some(Command::Connect) => {}
                    Some(command) => self.handle_command(command),
                },
                message = ws.next() => match message {
                    Some(Ok(message)) => {
                        if let Some(ended) = self.route_message(message, &mut ping_deadline) {
                            return ended;
                        }
                    }
                    Some(Err(error)) => return Ended::Involuntary(error.into()),
                    None => {
                        return Ended::Involuntary(ScError::websocket(
                            "connection closed by peer",
                        ));
                    }
                },
                _ = sleep_until(ping_deadline) => {
                    warn!(host = %self.options.host, "ping deadline expired");
                    let _ = ws.close(Some(CloseFrame {
                        code: CloseCode::Protocol,
                        reason: "ping timeout".into(),
                    })).await;
                    return Ended::Involuntary(ScError::PingTimeout);
                },
                _ = ack_timer => {
                    for (cid, handler) in self.pending.take_expired(Instant::now()) {
                        handler(Err(ScError::ack_timeout(cid)));
                    }
                },
            }
        }
    }

    /// Handle one inbound WebSocket message; `Some` ends the connection.
    fn route_message(&mut self, message: Message, ping_deadline: &mut Instant) -> Option<Ended> {
        match message {
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return None,
            Message::Close(_) => {
                return Some(Ended::Involuntary(ScError::websocket(
                    "close frame received",
                )));
            }
            Message::Text(_) | Message::Binary(_) => {}
        }

        let data = message.into_data();
        self.shared.events.raw.emit(&data);

        // In-band SC ping: reply and re-arm the watchdog, nothing to route.
        if data.as_ref() == protocol::PING_FRAME {
            self.out_queue.push_back(OutItem::Pong);
            *ping_deadline = Instant::now() + self.ping_timeout;
            return None;
        }

        let payload = match self.decode_in(&data) {
            Ok(payload) => payload,
            Err(error) => {
                self.shared.events.error.emit(&error);
                return None;
            }
        };

        self.dispatch(payload);
        None
    }

    fn dispatch(&mut self, payload: Value) {
        match protocol::classify(&payload) {
            ProtocolEvent::IsAuthenticated => {
                info!(host = %self.options.host, "handshake acknowledged");
                self.connect_attempts = 0;
                self.shared.events.connect.emit(&payload);
                self.resubscribe_pending();
            }
            ProtocolEvent::Publish => self.dispatch_publish(&payload),
            ProtocolEvent::RemoveToken => {
                {
                    let mut auth = self.shared.auth.lock();
                    auth.signed.clear();
                    auth.decoded = Value::Null;
                }
                self.shared.events.deauthenticate.emit(&());
            }
            ProtocolEvent::SetToken => self.dispatch_set_token(&payload),
            ProtocolEvent::AckReceive => self.dispatch_ack(&payload),
            ProtocolEvent::Event => self.dispatch_event(&payload),
            ProtocolEvent::Malformed => {
                self.shared
                    .events
                    .error
                    .emit(&ScError::protocol("envelope is not a routable object"));
            }
        }
    }

    fn dispatch_publish(&mut self, payload: &Value) {
        let data = &payload["data"];
        let (Some(name), Some(inner)) = (data["channel"].as_str(), data.get("data")) else {
            self.shared
                .events
                .error
                .emit(&ScError::protocol("#publish without channel or data"));
            return;
        };

        // Publishes for unknown channels are dropped silently.
        if let Some(channel) = self.shared.channel(name) {
            channel.events.message.emit(inner);
        }
    }

    fn dispatch_set_token(&mut self, payload: &Value) {
        let data = &payload["data"];
        let Some(token) = data["token"].as_str() else {
            self.shared
                .events
                .error
                .emit(&ScError::protocol("#setAuthToken without token"));
            return;
        };

        if let Some(ping_timeout) = data["pingTimeout"].as_u64() {
            self.ping_timeout = Duration::from_millis(ping_timeout);
        }

        match protocol::decode_jwt_payload(token) {
            // Not header.payload.signature shaped: ignored without error.
            Ok(None) => {}
            Ok(Some(decoded)) => {
                let first_token = {
                    let mut auth = self.shared.auth.lock();
                    let first = auth.signed.is_empty();
                    auth.signed = token.to_string();
                    auth.decoded = decoded;
                    first
                };

                let signed = token.to_string();
                if first_token {
                    self.shared.events.authenticate.emit(&signed);
                    // Channels held back by waitForAuth can go out now.
                    self.resubscribe_pending();
                }
                self.shared.events.auth_token_change.emit(&signed);
            }
            Err(error) => self.shared.events.error.emit(&error),
        }
    }

    fn dispatch_ack(&mut self, payload: &Value) {
        let rid = payload["rid"].as_u64().unwrap_or(0);
        let Some(handler) = self.pending.take(rid) else {
            self.shared
                .events
                .error
                .emit(&ScError::UnexpectedRid { rid });
            return;
        };

        // Presence of the error member decides the outcome; data is
        // optional and defaults to an empty object.
        if let Some(error) = payload.get("error") {
            handler(Err(ScError::Response {
                details: error.clone(),
            }));
        } else {
            handler(Ok(payload.get("data").cloned().unwrap_or_else(|| json!({}))));
        }
    }

    fn dispatch_event(&mut self, payload: &Value) {
        let Some(event) = payload["event"].as_str() else {
            return;
        };
        let Some(data) = payload.get("data").cloned() else {
            self.shared
                .events
                .error
                .emit(&ScError::protocol("event without data"));
            return;
        };

        let responder = payload["cid"]
            .as_u64()
            .filter(|cid| *cid != 0)
            .map(|cid| Responder {
                rid: cid,
                epoch: self.epoch,
                cmd_tx: self.cmd_tx.clone(),
            });

        self.shared.events.emit.emit(&EmitEvent {
            event: event.to_string(),
            data,
            responder,
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Emit {
                event,
                data,
                handler,
                no_timeout,
            } => {
                if self.shared.state() != SocketState::Open {
                    self.deferred.push_back(Command::Emit {
                        event,
                        data,
                        handler,
                        no_timeout,
                    });
                    return;
                }

                let cid = match handler {
                    Some(handler) => {
                        let cid = self.next_cid();
                        let deadline =
                            (!no_timeout).then(|| Instant::now() + self.options.ack_timeout);
                        self.pending.insert(cid, handler, deadline);
                        Some(cid)
                    }
                    None => None,
                };
                self.out_queue
                    .push_back(OutItem::Envelope(protocol::emit(&event, data, cid)));
            }
            Command::Subscribe { name, options } => {
                let channel = self.ensure_channel(&name, &options);
                *channel.options.lock() = options;
                if channel.state() == ChannelState::Unsubscribed {
                    channel.set_state(ChannelState::Pending);
                    self.try_channel_subscribe(&channel);
                }
            }
            Command::Unsubscribe { name } => {
                if let Some(channel) = self.shared.channel(&name) {
                    if channel.state() != ChannelState::Unsubscribed {
                        channel_unsubscribe_transition(
                            &self.shared,
                            &channel,
                            ChannelState::Unsubscribed,
                        );
                        if self.shared.state() == SocketState::Open {
                            self.out_queue
                                .push_back(OutItem::Envelope(protocol::unsubscribe(&name)));
                        }
                    }
                }
            }
            Command::DestroyChannel { name } => {
                let removed = self.shared.channels.lock().remove(&name);
                if let Some(channel) = removed {
                    channel.events.message.clear();
                    if channel.state() != ChannelState::Unsubscribed {
                        channel_unsubscribe_transition(
                            &self.shared,
                            &channel,
                            ChannelState::Unsubscribed,
                        );
                        if self.shared.state() == SocketState::Open {
                            self.out_queue
                                .push_back(OutItem::Envelope(protocol::unsubscribe(&name)));
                        }
                    }
                    channel.events.clear_all();
                }
            }
            Command::Respond { rid, data, epoch } => {
                // Responses from a previous connection would collide with
                // fresh cids; drop them.
                if epoch == self.epoch && self.shared.state() == SocketState::Open {
                    self.out_queue
                        .push_back(OutItem::Envelope(protocol::response(rid, data)));
                }
            }
            Command::Connect | Command::Close => {}
        }
    }

    fn ensure_channel(&self, name: &str, options: &SubscribeOptions) -> Arc<ChannelShared> {
        let mut channels = self.shared.channels.lock();
        Arc::clone(channels.entry(name.to_string()).or_insert_with(|| {
            Arc::new(ChannelShared::new(name.to_string(), options.clone()))
        }))
    }

    /// Send `#subscribe` for a PENDING channel when the socket and auth
    /// requirements allow it; otherwise the channel simply stays PENDING.
    fn try_channel_subscribe(&mut self, channel: &Arc<ChannelShared>) {
        let options = channel.options.lock().clone();
        let meets_requirements =
            !options.wait_for_auth || self.shared.auth_state() == AuthState::Authenticated;
        if self.shared.state() != SocketState::Open || !meets_requirements {
            return;
        }
        if channel.subscribe_inflight.swap(true, Ordering::AcqRel) {
            return;
        }

        let cid = self.next_cid();
        let shared = Arc::clone(&self.shared);
        let subscribing = Arc::clone(channel);
        let handler: ResponseHandler = Box::new(move |result| {
            subscribing
                .subscribe_inflight
                .store(false, Ordering::Release);
            match result {
                Ok(_) => channel_subscribe_success(&shared, &subscribing),
                Err(error) => channel_subscribe_failure(&shared, &subscribing, error),
            }
        });

        self.pending
            .insert(cid, handler, Some(Instant::now() + self.options.ack_timeout));
        self.out_queue.push_back(OutItem::Envelope(protocol::subscribe(
            &channel.name,
            options.data,
            cid,
        )));
    }

    /// Re-send `#subscribe` for every PENDING channel; called on the
    /// handshake ack and again when authentication completes.
    fn resubscribe_pending(&mut self) {
        for channel in self.shared.channel_list() {
            if channel.state() == ChannelState::Pending {
                self.try_channel_subscribe(&channel);
            }
        }
    }

    /// Drop connection-scoped state and suspend subscriptions.
    fn internal_close(&mut self) {
        self.shared.set_state(SocketState::Closed);
        self.out_queue.clear();
        // Handlers are not invoked: the disconnect event is the signal.
        self.pending.clear();
        self.suspend_channels();
    }

    /// Move SUBSCRIBED and PENDING channels to PENDING so their intent
    /// survives the disconnect.
    fn suspend_channels(&mut self) {
        for channel in self.shared.channel_list() {
            channel.subscribe_inflight.store(false, Ordering::Release);
            let new_state = match channel.state() {
                ChannelState::Subscribed | ChannelState::Pending => ChannelState::Pending,
                ChannelState::Unsubscribed => ChannelState::Unsubscribed,
            };
            channel_unsubscribe_transition(&self.shared, &channel, new_state);
        }
    }

    fn next_cid(&mut self) -> CallId {
        let cid = self.next_call_id;
        self.next_call_id += 1;
        cid
    }

    fn encode_out(&self, item: OutItem) -> ScResult<Message> {
        let binary = self.options.is_binary();
        match item {
            OutItem::Pong => Ok(if binary {
                Message::Binary(Bytes::from_static(protocol::PONG_FRAME))
            } else {
                Message::Text("#2".into())
            }),
            OutItem::Envelope(envelope) => match &self.options.codec {
                Some(codec) => {
                    let bytes = codec.encode(&envelope)?;
                    if codec.is_binary() {
                        Ok(Message::Binary(bytes.into()))
                    } else {
                        let text = String::from_utf8(bytes)
                            .map_err(|e| ScError::parse(e.to_string()))?;
                        Ok(Message::Text(text.into()))
                    }
                }
                None => {
                    let text = serde_json::to_string(&envelope)
                        .map_err(|e| ScError::parse(e.to_string()))?;
                    Ok(Message::Text(text.into()))
                }
            },
        }
    }

    fn decode_in(&self, data: &[u8]) -> ScResult<Value> {
        match &self.options.codec {
            Some(codec) => codec.decode(data),
            None => serde_json::from_slice(data).map_err(|e| ScError::parse(e.to_string())),
        }
    }
}

fn channel_subscribe_success(shared: &SocketShared, channel: &ChannelShared) {
    // Only a PENDING channel can complete a subscription; the user may
    // have unsubscribed while the ack was in flight.
    let old_state = channel.state();
    if old_state != ChannelState::Pending {
        return;
    }
    channel.set_state(ChannelState::Subscribed);

    let change = ChannelStateChange {
        name: channel.name.clone(),
        old_state,
        new_state: ChannelState::Subscribed,
    };
    channel.events.state_change.emit(&change);
    channel.events.subscribe.emit(&channel.name);
    shared.events.subscription_state_change.emit(&change);
    shared.events.subscribe.emit(&channel.name);
}

fn channel_subscribe_failure(shared: &SocketShared, channel: &ChannelShared, error: ScError) {
    if channel.state() == ChannelState::Unsubscribed {
        return;
    }
    channel.set_state(ChannelState::Unsubscribed);

    let failure = (channel.name.clone(), error);
    channel.events.subscribe_fail.emit(&failure);
    shared.events.subscribe_fail.emit(&failure);
}

fn channel_unsubscribe_transition(
    shared: &SocketShared,
    channel: &ChannelShared,
    new_state: ChannelState,
) {
    let old_state = channel.state();
    channel.set_state(new_state);

    // Events fire only for channels that actually lost an established
    // subscription; PENDING already means "not currently subscribed".
    if old_state == ChannelState::Subscribed {
        let change = ChannelStateChange {
            name: channel.name.clone(),
            old_state,
            new_state,
        };
        channel.events.state_change.emit(&change);
        channel.events.unsubscribe.emit(&channel.name);
        shared.events.subscription_state_change.emit(&change);
        shared.events.unsubscribe.emit(&channel.name);
    }
}
