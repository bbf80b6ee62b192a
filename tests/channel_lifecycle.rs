//! Channel subscription lifecycle against an in-process server.

mod support;

use sc_client::{ChannelState, ChannelStateChange, ScError, Socket, SubscribeOptions};
use serde_json::{Value, json};

use support::{accept, ack_handshake, bind, next_recorded, read_envelope, recorder, send_envelope};

#[tokio::test]
async fn subscribe_progresses_to_subscribed_with_events_once() {
    let (listener, options) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;

        let subscribe = read_envelope(&mut ws).await;
        assert_eq!(
            subscribe,
            json!({ "event": "#subscribe", "data": { "channel": "chat" }, "cid": 2 })
        );

        // The client cues us once its listeners are in place.
        let cue = read_envelope(&mut ws).await;
        assert_eq!(cue["event"], "ready");
        send_envelope(&mut ws, json!({ "rid": 2, "data": null })).await;

        let sync = read_envelope(&mut ws).await;
        send_envelope(&mut ws, json!({ "rid": sync["cid"], "data": null })).await;
        ws
    });

    let socket = Socket::new(options);
    let (connect_fn, mut connect_rx) = recorder::<Value>();
    socket.on_connect(connect_fn).forget();
    let (subscribe_fn, mut subscribe_rx) = recorder::<String>();
    socket.on_subscribe(subscribe_fn).forget();
    let (change_fn, mut change_rx) = recorder::<ChannelStateChange>();
    socket.on_subscription_state_change(change_fn).forget();

    socket.connect();
    next_recorded(&mut connect_rx).await;

    let channel = socket.subscribe("chat");
    assert_eq!(channel.name(), "chat");

    let (channel_sub_fn, mut channel_sub_rx) = recorder::<String>();
    channel.on_subscribe(channel_sub_fn).forget();
    socket.emit("ready", json!(null));

    assert_eq!(next_recorded(&mut subscribe_rx).await, "chat");
    assert_eq!(next_recorded(&mut channel_sub_rx).await, "chat");
    let change = next_recorded(&mut change_rx).await;
    assert_eq!(change.name, "chat");
    assert_eq!(change.old_state, ChannelState::Pending);
    assert_eq!(change.new_state, ChannelState::Subscribed);
    assert_eq!(channel.state(), ChannelState::Subscribed);

    // A full round trip guarantees nothing else is in flight, so the
    // events above fired exactly once.
    socket.call("sync", json!(null)).await.unwrap();
    assert!(subscribe_rx.try_recv().is_err());
    assert!(channel_sub_rx.try_recv().is_err());
    assert!(change_rx.try_recv().is_err());

    socket.close();
    let _ = server.await;
}

#[tokio::test]
async fn publish_routes_to_matching_channel_only() {
    let (listener, options) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;

        let first = read_envelope(&mut ws).await;
        assert_eq!(first["data"]["channel"], "chat");
        let second = read_envelope(&mut ws).await;
        assert_eq!(second["data"]["channel"], "other");

        let cue = read_envelope(&mut ws).await;
        assert_eq!(cue["event"], "ready");

        send_envelope(&mut ws, json!({ "rid": first["cid"], "data": null })).await;
        send_envelope(&mut ws, json!({ "rid": second["cid"], "data": null })).await;

        send_envelope(
            &mut ws,
            json!({ "event": "#publish", "data": { "channel": "chat", "data": { "msg": "hi" } } }),
        )
        .await;
        // Publishes for unknown channels must be ignored silently.
        send_envelope(
            &mut ws,
            json!({ "event": "#publish", "data": { "channel": "ghost", "data": 1 } }),
        )
        .await;

        let sync = read_envelope(&mut ws).await;
        send_envelope(&mut ws, json!({ "rid": sync["cid"], "data": null })).await;
        ws
    });

    let socket = Socket::new(options);
    let (connect_fn, mut connect_rx) = recorder::<Value>();
    socket.on_connect(connect_fn).forget();
    let errors = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let errors_clone = std::sync::Arc::clone(&errors);
    socket
        .on_error(move |_| {
            errors_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        })
        .forget();

    socket.connect();
    next_recorded(&mut connect_rx).await;

    let chat = socket.subscribe("chat");
    let other = socket.subscribe("other");
    let (chat_fn, mut chat_rx) = recorder::<Value>();
    chat.watch(chat_fn).forget();
    let (other_fn, mut other_rx) = recorder::<Value>();
    other.watch(other_fn).forget();
    socket.emit("ready", json!(null));

    assert_eq!(next_recorded(&mut chat_rx).await, json!({ "msg": "hi" }));

    socket.call("sync", json!(null)).await.unwrap();
    assert!(other_rx.try_recv().is_err());
    assert_eq!(errors.load(std::sync::atomic::Ordering::SeqCst), 0);

    socket.close();
    let _ = server.await;
}

#[tokio::test]
async fn unsubscribe_notifies_server_and_fires_events() {
    let (listener, options) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;

        let subscribe = read_envelope(&mut ws).await;
        send_envelope(&mut ws, json!({ "rid": subscribe["cid"], "data": null })).await;

        let unsubscribe = read_envelope(&mut ws).await;
        assert_eq!(
            unsubscribe,
            json!({ "event": "#unsubscribe", "data": "chat" })
        );

        let sync = read_envelope(&mut ws).await;
        send_envelope(&mut ws, json!({ "rid": sync["cid"], "data": null })).await;
        ws
    });

    let socket = Socket::new(options);
    let (connect_fn, mut connect_rx) = recorder::<Value>();
    socket.on_connect(connect_fn).forget();
    let (subscribe_fn, mut subscribe_rx) = recorder::<String>();
    socket.on_subscribe(subscribe_fn).forget();
    let (unsubscribe_fn, mut unsubscribe_rx) = recorder::<String>();
    socket.on_unsubscribe(unsubscribe_fn).forget();
    let (change_fn, mut change_rx) = recorder::<ChannelStateChange>();
    socket.on_subscription_state_change(change_fn).forget();

    socket.connect();
    next_recorded(&mut connect_rx).await;

    let channel = socket.subscribe("chat");
    assert_eq!(next_recorded(&mut subscribe_rx).await, "chat");
    let _ = next_recorded(&mut change_rx).await;

    channel.unsubscribe();
    assert_eq!(next_recorded(&mut unsubscribe_rx).await, "chat");
    let change = next_recorded(&mut change_rx).await;
    assert_eq!(change.old_state, ChannelState::Subscribed);
    assert_eq!(change.new_state, ChannelState::Unsubscribed);
    assert_eq!(channel.state(), ChannelState::Unsubscribed);

    socket.call("sync", json!(null)).await.unwrap();

    socket.close();
    let _ = server.await;
}

#[tokio::test]
async fn subscribe_error_fires_subscribe_fail() {
    let (listener, options) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;

        let subscribe = read_envelope(&mut ws).await;
        let cue = read_envelope(&mut ws).await;
        assert_eq!(cue["event"], "ready");
        send_envelope(
            &mut ws,
            json!({ "rid": subscribe["cid"], "error": { "message": "denied" } }),
        )
        .await;

        let sync = read_envelope(&mut ws).await;
        send_envelope(&mut ws, json!({ "rid": sync["cid"], "data": null })).await;
        ws
    });

    let socket = Socket::new(options);
    let (connect_fn, mut connect_rx) = recorder::<Value>();
    socket.on_connect(connect_fn).forget();

    let (fail_tx, mut fail_rx) = tokio::sync::mpsc::unbounded_channel();
    socket
        .on_subscribe_fail(move |(name, error): &(String, ScError)| {
            let details = match error {
                ScError::Response { details } => details.clone(),
                other => panic!("unexpected failure kind: {other:?}"),
            };
            let _ = fail_tx.send((name.clone(), details));
        })
        .forget();

    socket.connect();
    next_recorded(&mut connect_rx).await;

    let channel = socket.subscribe("chat");
    let (channel_fail_tx, mut channel_fail_rx) = tokio::sync::mpsc::unbounded_channel();
    channel
        .on_subscribe_fail(move |(name, _): &(String, ScError)| {
            let _ = channel_fail_tx.send(name.clone());
        })
        .forget();
    socket.emit("ready", json!(null));

    let (name, details) = next_recorded(&mut fail_rx).await;
    assert_eq!(name, "chat");
    assert_eq!(details["message"], "denied");
    assert_eq!(next_recorded(&mut channel_fail_rx).await, "chat");
    assert_eq!(channel.state(), ChannelState::Unsubscribed);

    socket.call("sync", json!(null)).await.unwrap();

    socket.close();
    let _ = server.await;
}

#[tokio::test]
async fn wait_for_auth_defers_subscribe_until_authenticated() {
    let (listener, options) = bind().await;

    let token_payload = json!({ "sub": "u1" });
    let token = {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&token_payload).unwrap());
        format!("e30.{encoded}.c2ln")
    };
    let server_token = token.clone();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;

        // The subscribe must NOT have been sent yet: the first envelope
        // after the handshake has to be the cue.
        let cue = read_envelope(&mut ws).await;
        assert_eq!(cue["event"], "ready");
        send_envelope(&mut ws, json!({ "rid": cue["cid"], "data": null })).await;

        send_envelope(
            &mut ws,
            json!({ "event": "#setAuthToken", "data": { "token": server_token } }),
        )
        .await;

        let subscribe = read_envelope(&mut ws).await;
        assert_eq!(subscribe["event"], "#subscribe");
        assert_eq!(subscribe["data"]["channel"], "secure");
        send_envelope(&mut ws, json!({ "rid": subscribe["cid"], "data": null })).await;
        ws
    });

    let socket = Socket::new(options);
    let (connect_fn, mut connect_rx) = recorder::<Value>();
    socket.on_connect(connect_fn).forget();
    let (subscribe_fn, mut subscribe_rx) = recorder::<String>();
    socket.on_subscribe(subscribe_fn).forget();

    socket.connect();
    next_recorded(&mut connect_rx).await;

    let channel = socket.subscribe_with("secure", SubscribeOptions::new().wait_for_auth(true));
    // The ack round trip proves the subscribe command was processed and
    // held back rather than sent.
    socket.call("ready", json!(null)).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Pending);

    assert_eq!(next_recorded(&mut subscribe_rx).await, "secure");
    assert_eq!(channel.state(), ChannelState::Subscribed);

    socket.close();
    let _ = server.await;
}

#[tokio::test]
async fn destroy_channel_removes_it_from_the_socket() {
    let (listener, options) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ack_handshake(&mut ws).await;

        let subscribe = read_envelope(&mut ws).await;
        send_envelope(&mut ws, json!({ "rid": subscribe["cid"], "data": null })).await;

        let unsubscribe = read_envelope(&mut ws).await;
        assert_eq!(unsubscribe["event"], "#unsubscribe");

        let sync = read_envelope(&mut ws).await;
        send_envelope(&mut ws, json!({ "rid": sync["cid"], "data": null })).await;
        ws
    });

    let socket = Socket::new(options);
    let (connect_fn, mut connect_rx) = recorder::<Value>();
    socket.on_connect(connect_fn).forget();
    let (subscribe_fn, mut subscribe_rx) = recorder::<String>();
    socket.on_subscribe(subscribe_fn).forget();

    socket.connect();
    next_recorded(&mut connect_rx).await;

    let channel = socket.subscribe("chat");
    assert_eq!(next_recorded(&mut subscribe_rx).await, "chat");

    channel.destroy();
    socket.call("sync", json!(null)).await.unwrap();
    assert!(socket.channel("chat").is_none());

    socket.close();
    let _ = server.await;
}
