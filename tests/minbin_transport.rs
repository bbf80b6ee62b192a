//! End-to-end MinBin: binary frames, compressed envelopes and the
//! in-band ping over a binary connection.

mod support;

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use sc_client::{CodecEngine, MinBinCodec, Socket};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use support::{ServerWs, accept, bind, next_recorded, recorder};

async fn read_binary_envelope(ws: &mut ServerWs) -> Value {
    loop {
        match ws.next().await.expect("stream open").expect("read ok") {
            Message::Binary(data) => return MinBinCodec.decode(&data).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_binary_envelope(ws: &mut ServerWs, envelope: Value) {
    let bytes = MinBinCodec.encode(&envelope).unwrap();
    ws.send(Message::Binary(bytes.into())).await.unwrap();
}

#[tokio::test]
async fn minbin_socket_speaks_compressed_binary() {
    let (listener, options) = bind().await;
    let options = options.codec(Arc::new(MinBinCodec));

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;

        let handshake = read_binary_envelope(&mut ws).await;
        assert_eq!(handshake["event"], "#handshake");
        assert_eq!(handshake["cid"], 1);
        send_binary_envelope(&mut ws, json!({ "rid": 1, "data": { "id": "binary" } })).await;

        let subscribe = read_binary_envelope(&mut ws).await;
        assert_eq!(subscribe["event"], "#subscribe");
        assert_eq!(subscribe["data"]["channel"], "chat");
        let cue = read_binary_envelope(&mut ws).await;
        assert_eq!(cue["event"], "ready");
        send_binary_envelope(&mut ws, json!({ "rid": subscribe["cid"], "data": null })).await;

        send_binary_envelope(
            &mut ws,
            json!({ "event": "#publish", "data": { "channel": "chat", "data": { "n": 1 } } }),
        )
        .await;

        // The in-band ping is a bare binary frame on a binary socket.
        ws.send(Message::Binary(b"#1".to_vec().into())).await.unwrap();
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => {
                    assert_eq!(data.as_ref(), b"#2");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        ws
    });

    let socket = Socket::new(options);
    let (connect_fn, mut connect_rx) = recorder::<Value>();
    socket.on_connect(connect_fn).forget();
    let (subscribe_fn, mut subscribe_rx) = recorder::<String>();
    socket.on_subscribe(subscribe_fn).forget();

    socket.connect();
    let payload = next_recorded(&mut connect_rx).await;
    assert_eq!(payload["data"]["id"], "binary");

    let channel = socket.subscribe("chat");
    let (watch_fn, mut watch_rx) = recorder::<Value>();
    channel.watch(watch_fn).forget();
    socket.emit("ready", json!(null));

    assert_eq!(next_recorded(&mut subscribe_rx).await, "chat");
    assert_eq!(next_recorded(&mut watch_rx).await, json!({ "n": 1 }));

    socket.close();
    let _ = server.await;
}
