//! Error handling for the SocketCluster client.

use serde_json::{Value, json};
use thiserror::Error;

/// The result type used throughout the crate.
pub type ScResult<T> = Result<T, ScError>;

/// Comprehensive error type for socket, channel and call operations.
///
/// Protocol-level problems (`Protocol`, `UnexpectedRid`, `Parse`) are
/// reported through the socket error event and never terminate the
/// connection. Only transport failures and `PingTimeout` do.
#[derive(Error, Debug)]
pub enum ScError {
    /// Inbound envelope was malformed or missed a field required by its class.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// An ack arrived for a call id nothing is waiting on.
    #[error("unexpected response id (rid) {rid}")]
    UnexpectedRid { rid: u64 },

    /// Payload bytes failed to parse under the active codec.
    #[error("parse failure: {message}")]
    Parse { message: String },

    /// The server answered a call with an `error` field.
    ///
    /// Reported only to the call's response handler, never as a socket event.
    #[error("response contains error")]
    Response { details: Value },

    /// No ack arrived within the ack timeout.
    #[error("acknowledgement timeout for call id (cid) {cid}")]
    AckTimeout { cid: u64, details: Value },

    /// The server stopped sending in-band pings within the ping deadline.
    #[error("ping timeout")]
    PingTimeout,

    /// The connection was closed locally through `close`/`disconnect`.
    ///
    /// This is the voluntary-close marker: auto-reconnect is suppressed
    /// when a connection ends with this cause.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid connect options.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Transport-level I/O error (resolve, connect, TLS, read, write).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// WebSocket-level error from the underlying stack.
    #[error("websocket error: {message}")]
    WebSocket { message: String },
}

impl ScError {
    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a parse failure.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a websocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create the ack-timeout error delivered to a call's response handler.
    ///
    /// The details payload carries `{"error":{"message":"no ack for call id
    /// (cid) <cid>"}}`, matching what SocketCluster servers produce.
    pub fn ack_timeout(cid: u64) -> Self {
        Self::AckTimeout {
            cid,
            details: json!({
                "error": { "message": format!("no ack for call id (cid) {cid}") }
            }),
        }
    }

    /// `true` when this error marks a locally requested close.
    ///
    /// The reconnect logic skips involuntary-close handling for these.
    pub fn is_voluntary_close(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ScError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::Io(io) => Self::Io(io),
            other => Self::WebSocket {
                message: other.to_string(),
            },
        }
    }
}
