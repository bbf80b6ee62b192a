//! WebSocket transport: TCP connect, optional TLS, HTTP upgrade.

use std::{
    pin::{Pin, pin},
    sync::Arc,
    task::{Context, Poll},
};

use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::{
    WebSocketStream, client_async_with_config,
    tungstenite::{client::IntoClientRequest, handshake::client::Request, http::header},
};
use tracing::debug;

use crate::{
    config::ConnectOptions,
    error::{ScError, ScResult},
};

/// A stream that might be protected with TLS.
pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => pin!(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => pin!(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => pin!(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => pin!(s).poll_shutdown(cx),
        }
    }
}

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream>;

/// Resolve, connect, TLS-wrap when requested, and upgrade to WebSocket.
pub(crate) async fn connect(options: &ConnectOptions) -> ScResult<WsStream> {
    let port = options.resolve_port()?;
    debug!(host = %options.host, port, secure = options.secure, "connecting");

    let tcp = TcpStream::connect((options.host.as_str(), port)).await?;
    let _ = tcp.set_nodelay(true);

    let stream = if options.secure {
        let connector = options
            .tls
            .clone()
            .map(TlsConnector::from)
            .unwrap_or_else(default_connector);
        let domain = ServerName::try_from(options.host.clone())
            .map_err(|_| ScError::config(format!("invalid TLS server name {:?}", options.host)))?;
        MaybeTlsStream::Tls(connector.connect(domain, tcp).await?)
    } else {
        MaybeTlsStream::Plain(tcp)
    };

    let request = upgrade_request(options, port)?;
    let (ws, _response) = client_async_with_config(request, stream, None).await?;
    debug!(host = %options.host, "websocket upgrade complete");
    Ok(ws)
}

fn upgrade_request(options: &ConnectOptions, port: u16) -> ScResult<Request> {
    let scheme = if options.secure { "wss" } else { "ws" };
    let url = format!("{scheme}://{}:{port}{}", options.host, options.path);
    let mut request = url.into_client_request().map_err(ScError::from)?;

    if let Some(user_agent) = &options.user_agent {
        let value = user_agent
            .parse()
            .map_err(|_| ScError::config(format!("invalid user agent {user_agent:?}")))?;
        request.headers_mut().insert(header::USER_AGENT, value);
    }

    Ok(request)
}

/// TLS connector with the bundled webpki roots, used when `secure` is
/// requested without an explicit TLS configuration.
fn default_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
