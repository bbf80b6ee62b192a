//! Factory owning a set of sockets.

use parking_lot::Mutex;

use crate::{config::ConnectOptions, socket::Socket};

/// Owns the sockets it creates and shuts them down together.
pub struct SocketClusterClient {
    options: ConnectOptions,
    sockets: Mutex<Vec<Socket>>,
}

impl SocketClusterClient {
    /// Create a client whose sockets default to `options`.
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options,
            sockets: Mutex::new(Vec::new()),
        }
    }

    /// Create a socket with the client's default options.
    pub fn socket(&self) -> Socket {
        self.socket_with(self.options.clone())
    }

    /// Create a socket with explicit options.
    pub fn socket_with(&self, options: ConnectOptions) -> Socket {
        let socket = Socket::new(options);
        self.sockets.lock().push(socket.clone());
        socket
    }

    /// Close every owned socket and release them.
    pub fn shutdown(&self) {
        for socket in self.sockets.lock().drain(..) {
            socket.close();
        }
    }

    /// Number of sockets currently owned.
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }
}

impl Default for SocketClusterClient {
    fn default() -> Self {
        Self::new(ConnectOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sockets_are_tracked_and_released() {
        let client = SocketClusterClient::default();
        assert_eq!(client.socket_count(), 0);

        let _a = client.socket();
        let _b = client.socket_with(ConnectOptions::new("example.com").port("8000"));
        assert_eq!(client.socket_count(), 2);

        client.shutdown();
        assert_eq!(client.socket_count(), 0);
    }
}
