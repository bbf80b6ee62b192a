//! # sc-client
//!
//! Client for the SocketCluster application-level protocol over WebSockets.
//!
//! A [`Socket`] owns one transport connection and runs a bidirectional
//! message pump on a dedicated I/O task. On top of that it provides:
//!
//! - **Call correlation**: [`Socket::emit_with_ack`] / [`Socket::call`]
//!   match server acks to calls by cid, with per-call deadlines
//! - **Pub/sub channels**: [`Socket::subscribe`] yields a [`Channel`]
//!   whose subscription intent survives disconnects
//! - **Auth lifecycle**: the server-driven `#setAuthToken` /
//!   `#removeAuthToken` handshake with JWT payload decoding
//! - **Auto-reconnect**: exponential backoff with jitter after
//!   involuntary connection loss
//! - **In-band heartbeat**: the SC `#1`/`#2` ping exchange with a ping
//!   deadline watchdog, distinct from WebSocket control frames
//!
//! Wire envelopes are JSON text frames by default; the [`MinBinCodec`]
//! switches the socket to compressed MessagePack binary frames.
//!
//! # Example
//!
//! ```rust,no_run
//! use sc_client::{ConnectOptions, Socket};
//!
//! #[tokio::main]
//! async fn main() {
//!     let socket = Socket::new(ConnectOptions::new("localhost").port("8000"));
//!
//!     socket
//!         .on_connect(|payload| println!("connected: {payload}"))
//!         .forget();
//!
//!     let channel = socket.subscribe("chat");
//!     channel
//!         .watch(|message| println!("chat: {message}"))
//!         .forget();
//!
//!     socket.connect();
//!
//!     // ... emit with an ack:
//!     match socket.call("login", serde_json::json!({ "user": "a" })).await {
//!         Ok(response) => println!("logged in: {response}"),
//!         Err(error) => eprintln!("login failed: {error}"),
//!     }
//! }
//! ```

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod signal;
pub mod socket;

mod pending;
mod transport;

pub use channel::{Channel, ChannelState, ChannelStateChange, SubscribeOptions};
pub use client::SocketClusterClient;
pub use codec::{CodecEngine, JsonCodec, MinBinCodec};
pub use config::{AutoReconnectOptions, ConnectOptions};
pub use error::{ScError, ScResult};
pub use protocol::{CallId, ProtocolEvent};
pub use signal::Listener;
pub use socket::{AuthState, EmitEvent, Socket, SocketState};
