//! Named pub/sub channels layered on a socket.
//!
//! A [`Channel`] is a cheap handle: subscription state lives with the
//! socket's I/O task and operations are forwarded to it. Handles stay
//! valid after the socket is gone; operations then become no-ops.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU8, Ordering},
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    error::ScError,
    signal::{Listener, Signal},
    socket::Command,
};

/// Local subscription state of one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Not subscribed and no subscription in progress.
    Unsubscribed,
    /// Subscription requested, or suspended across a disconnect.
    Pending,
    /// Subscription acknowledged by the server.
    Subscribed,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Pending,
            2 => Self::Subscribed,
            _ => Self::Unsubscribed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unsubscribed => 0,
            Self::Pending => 1,
            Self::Subscribed => 2,
        }
    }
}

/// Payload of subscription state-change events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelStateChange {
    pub name: String,
    pub old_state: ChannelState,
    pub new_state: ChannelState,
}

/// Options for one subscribe request.
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    /// Defer the subscription until the socket is authenticated.
    pub wait_for_auth: bool,
    /// Extra data forwarded to the server inside `#subscribe`.
    pub data: Option<Value>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn wait_for_auth(mut self, wait: bool) -> Self {
        self.wait_for_auth = wait;
        self
    }

    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Per-channel event sinks; these fire independently of the socket-level
/// sinks for the same logical events.
pub(crate) struct ChannelEvents {
    pub subscribe: Signal<String>,
    pub subscribe_fail: Signal<(String, ScError)>,
    pub state_change: Signal<ChannelStateChange>,
    pub unsubscribe: Signal<String>,
    pub message: Signal<Value>,
}

impl ChannelEvents {
    fn new() -> Self {
        Self {
            subscribe: Signal::new(),
            subscribe_fail: Signal::new(),
            state_change: Signal::new(),
            unsubscribe: Signal::new(),
            message: Signal::new(),
        }
    }

    pub fn clear_all(&self) {
        self.subscribe.clear();
        self.subscribe_fail.clear();
        self.state_change.clear();
        self.unsubscribe.clear();
        self.message.clear();
    }
}

pub(crate) struct ChannelShared {
    pub name: String,
    state: AtomicU8,
    pub options: Mutex<SubscribeOptions>,
    /// Set while a `#subscribe` ack is outstanding, so a handshake-time
    /// resubscription walk cannot double-send for the same channel.
    pub subscribe_inflight: AtomicBool,
    pub events: ChannelEvents,
}

impl ChannelShared {
    pub fn new(name: String, options: SubscribeOptions) -> Self {
        Self {
            name,
            state: AtomicU8::new(ChannelState::Unsubscribed.as_u8()),
            options: Mutex::new(options),
            subscribe_inflight: AtomicBool::new(false),
            events: ChannelEvents::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// Handle to a named channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Register a listener for messages published to this channel.
    pub fn watch(&self, f: impl Fn(&Value) + Send + Sync + 'static) -> Listener {
        self.shared.events.message.connect(f)
    }

    /// Detach every watch listener.
    pub fn unwatch(&self) {
        self.shared.events.message.clear();
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
        self.shared.events.state_change.connect(f)
    }

    pub fn on_unsubscribe(&self, f: impl Fn(&String) + Send + Sync + 'static) -> Listener {
        self.shared.events.unsubscribe.connect(f)
    }

    /// Leave the channel. No-op when the socket is gone.
    pub fn unsubscribe(&self) {
        let _ = self.cmd_tx.send(Command::Unsubscribe {
            name: self.shared.name.clone(),
        });
    }

    /// Detach all listeners, unsubscribe and remove the channel from the
    /// socket's table. No-op when the socket is gone.
    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(Command::DestroyChannel {
            name: self.shared.name.clone(),
        });
    }
}
