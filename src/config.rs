//! Socket connection configuration.

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    codec::CodecEngine,
    error::{ScError, ScResult},
};

/// Exponential-backoff settings for automatic reconnection.
///
/// For attempt `n` (0-indexed) the delay is
/// `round((initial_delay + randomness * U(0,1)) * multiplier^n)`,
/// capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct AutoReconnectOptions {
    /// Base delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Uniform random jitter added to the base delay.
    pub randomness: Duration,
    /// Growth factor applied per attempt; must be >= 1.0.
    pub multiplier: f64,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
}

impl Default for AutoReconnectOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10_000),
            randomness: Duration::from_millis(10_000),
            multiplier: 1.5,
            max_delay: Duration::from_millis(60_000),
        }
    }
}

/// Configuration for one socket.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Server hostname.
    pub host: String,
    /// Server port: a number, or one of the service names
    /// `http`/`ws` (80) and `https`/`wss` (443).
    pub port: String,
    /// HTTP path for the WebSocket upgrade.
    pub path: String,
    /// Wrap the connection in TLS before upgrading.
    pub secure: bool,
    /// User-Agent header sent with the upgrade request.
    pub user_agent: Option<String>,
    /// Reconnect automatically after involuntary disconnects.
    pub auto_reconnect: bool,
    /// Backoff settings used when `auto_reconnect` is on.
    pub auto_reconnect_options: AutoReconnectOptions,
    /// How long to wait for a server ack before a call times out.
    ///
    /// Also seeds the ping deadline until the server supplies its own
    /// `pingTimeout` through `#setAuthToken`.
    pub ack_timeout: Duration,
    /// Envelope codec; `None` means plain JSON text frames.
    pub codec: Option<Arc<dyn CodecEngine>>,
    /// TLS client configuration. When `secure` is set and this is `None`,
    /// a default configuration with the bundled webpki roots is used.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: "http".into(),
            path: "/socketcluster/".into(),
            secure: false,
            user_agent: None,
            auto_reconnect: true,
            auto_reconnect_options: AutoReconnectOptions::default(),
            ack_timeout: Duration::from_secs(10),
            codec: None,
            tls: None,
        }
    }
}

impl ConnectOptions {
    /// Create options for the given host with everything else defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Set the server port (number or service name).
    #[must_use]
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    /// Set the WebSocket upgrade path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Enable or disable TLS.
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set the User-Agent header for the upgrade request.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Enable or disable automatic reconnection.
    #[must_use]
    pub fn auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Replace the reconnect backoff settings.
    #[must_use]
    pub fn auto_reconnect_options(mut self, options: AutoReconnectOptions) -> Self {
        self.auto_reconnect_options = options;
        self
    }

    /// Set the ack timeout for calls expecting a response.
    #[must_use]
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Select an envelope codec.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn CodecEngine>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Supply a TLS client configuration for secure connections.
    #[must_use]
    pub fn tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ScResult<()> {
        if self.host.is_empty() {
            return Err(ScError::config("host cannot be empty"));
        }
        if !self.path.starts_with('/') {
            return Err(ScError::config("path must start with '/'"));
        }
        if self.ack_timeout.is_zero() {
            return Err(ScError::config("ack timeout must be > 0"));
        }
        self.resolve_port()?;

        let backoff = &self.auto_reconnect_options;
        if backoff.multiplier < 1.0 || !backoff.multiplier.is_finite() {
            return Err(ScError::config("reconnect multiplier must be >= 1.0"));
        }
        if backoff.max_delay < backoff.initial_delay {
            return Err(ScError::config(
                "reconnect max delay must be >= initial delay",
            ));
        }
        Ok(())
    }

    pub(crate) fn resolve_port(&self) -> ScResult<u16> {
        match self.port.as_str() {
            "http" | "ws" => Ok(80),
            "https" | "wss" => Ok(443),
            other => other
                .parse()
                .map_err(|_| ScError::config(format!("invalid port {other:?}"))),
        }
    }

    pub(crate) fn is_binary(&self) -> bool {
        self.codec.as_ref().is_some_and(|codec| codec.is_binary())
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("user_agent", &self.user_agent)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("auto_reconnect_options", &self.auto_reconnect_options)
            .field("ack_timeout", &self.ack_timeout)
            .field("binary_codec", &self.is_binary())
            .finish_non_exhaustive()
    }
}
