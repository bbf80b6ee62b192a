//! In-process server scaffolding shared by the integration tests.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use sc_client::ConnectOptions;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

pub type ServerWs = WebSocketStream<TcpStream>;

/// Bind a loopback listener and build matching connect options.
pub async fn bind() -> (TcpListener, ConnectOptions) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let options = ConnectOptions::new("127.0.0.1")
        .port(port.to_string())
        .auto_reconnect(false);
    (listener, options)
}

pub async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

/// Read the next JSON envelope, skipping WebSocket control frames.
pub async fn read_envelope(ws: &mut ServerWs) -> Value {
    loop {
        match ws.next().await.expect("stream open").expect("read ok") {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Binary(data) => return serde_json::from_slice(&data).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

pub async fn send_envelope(ws: &mut ServerWs, envelope: Value) {
    ws.send(Message::Text(envelope.to_string().into()))
        .await
        .unwrap();
}

/// Expect the client `#handshake` and acknowledge it.
pub async fn ack_handshake(ws: &mut ServerWs) {
    let handshake = read_envelope(ws).await;
    assert_eq!(handshake["event"], "#handshake");
    assert_eq!(handshake["cid"], 1);
    assert!(handshake["data"].is_null());

    send_envelope(
        ws,
        json!({
            "rid": 1,
            "data": { "id": "test-socket", "isAuthenticated": false, "pingTimeout": 10000 }
        }),
    )
    .await;
}

/// A listener closure that records every emission into a channel.
pub fn recorder<T: Clone + Send + 'static>() -> (
    impl Fn(&T) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<T>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |value: &T| {
            let _ = tx.send(value.clone());
        },
        rx,
    )
}

/// Await the next recorded event, with a deadline so broken tests fail
/// instead of hanging.
pub async fn next_recorded<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}
