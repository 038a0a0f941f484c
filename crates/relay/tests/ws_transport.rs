//! WebSocket transport against an in-process GraphQL-over-WebSocket server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use {
    embed_relay::{EventStream, SubscriptionTransport, WsSubscriptionTransport},
    embed_relay_config::WsProtocol,
    embed_relay_protocol::{GraphQLRequest, Headers},
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::{
        net::{TcpListener, TcpStream},
        sync::mpsc,
    },
    tokio_tungstenite::{
        WebSocketStream, accept_hdr_async,
        tungstenite::{
            Message,
            handshake::server::{ErrorResponse, Request, Response},
        },
    },
    tokio_util::sync::CancellationToken,
};

type ServerSocket = WebSocketStream<TcpStream>;

/// Accept one client, echoing the requested subprotocol and reporting it.
async fn accept(listener: &TcpListener, seen: &mpsc::UnboundedSender<Value>) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    let seen = seen.clone();
    accept_hdr_async(stream, move |request: &Request, mut response: Response| {
        if let Some(protocol) = request.headers().get("sec-websocket-protocol") {
            let _ = seen.send(json!({ "subprotocol": protocol.to_str().unwrap() }));
            response
                .headers_mut()
                .insert("sec-websocket-protocol", protocol.clone());
        }
        Ok::<Response, ErrorResponse>(response)
    })
    .await
    .unwrap()
}

async fn recv_json(socket: &mut ServerSocket) -> Option<Value> {
    loop {
        match socket.next().await? {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {},
        }
    }
}

async fn send_json(socket: &mut ServerSocket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Answer `connection_init` and return the subscribe frame.
async fn handshake(socket: &mut ServerSocket, seen: &mpsc::UnboundedSender<Value>) -> Value {
    let init = recv_json(socket).await.unwrap();
    seen.send(init).unwrap();
    send_json(socket, json!({ "type": "connection_ack" })).await;
    let subscribe = recv_json(socket).await.unwrap();
    seen.send(subscribe.clone()).unwrap();
    subscribe
}

async fn next_event(stream: &mut EventStream) -> Option<Value> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for the subscription stream")
}

fn subscribe(transport: &WsSubscriptionTransport, stop: &CancellationToken) -> EventStream {
    let mut params = Headers::new();
    params.insert("Authorization".into(), "Bearer t".into());
    transport
        .subscribe(
            &params,
            GraphQLRequest::new("subscription { tick }"),
            stop.clone(),
        )
        .unwrap()
}

#[tokio::test]
async fn graphql_transport_ws_events_and_stop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/graphql", listener.local_addr().unwrap());
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut socket = accept(&listener, &seen_tx).await;
        handshake(&mut socket, &seen_tx).await;
        for tick in 1..=2 {
            send_json(
                &mut socket,
                json!({ "type": "next", "id": "1", "payload": { "data": { "tick": tick } } }),
            )
            .await;
        }
        while let Some(frame) = recv_json(&mut socket).await {
            seen_tx.send(frame).unwrap();
        }
    });

    let transport = WsSubscriptionTransport::new(url, WsProtocol::GraphqlTransportWs, false);
    let stop = CancellationToken::new();
    let mut stream = subscribe(&transport, &stop);

    assert_eq!(next_event(&mut stream).await, Some(json!({ "data": { "tick": 1 } })));
    assert_eq!(next_event(&mut stream).await, Some(json!({ "data": { "tick": 2 } })));

    stop.cancel();
    assert_eq!(next_event(&mut stream).await, None);

    assert_eq!(
        seen.recv().await.unwrap(),
        json!({ "subprotocol": "graphql-transport-ws" })
    );
    assert_eq!(
        seen.recv().await.unwrap(),
        json!({ "type": "connection_init", "payload": { "Authorization": "Bearer t" } })
    );
    assert_eq!(
        seen.recv().await.unwrap(),
        json!({ "type": "subscribe", "id": "1", "payload": { "query": "subscription { tick }" } })
    );
    assert_eq!(
        seen.recv().await.unwrap(),
        json!({ "type": "complete", "id": "1" })
    );
}

#[tokio::test]
async fn legacy_protocol_ends_on_server_complete() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/graphql", listener.local_addr().unwrap());
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut socket = accept(&listener, &seen_tx).await;
        handshake(&mut socket, &seen_tx).await;
        send_json(&mut socket, json!({ "type": "ka" })).await;
        send_json(
            &mut socket,
            json!({ "type": "data", "id": "1", "payload": { "data": { "tick": 1 } } }),
        )
        .await;
        send_json(&mut socket, json!({ "type": "complete", "id": "1" })).await;
        while recv_json(&mut socket).await.is_some() {}
    });

    let transport = WsSubscriptionTransport::new(url, WsProtocol::SubscriptionsTransportWs, true);
    let stop = CancellationToken::new();
    let mut stream = subscribe(&transport, &stop);

    assert_eq!(next_event(&mut stream).await, Some(json!({ "data": { "tick": 1 } })));
    assert_eq!(next_event(&mut stream).await, None);

    assert_eq!(seen.recv().await.unwrap(), json!({ "subprotocol": "graphql-ws" }));
    assert_eq!(seen.recv().await.unwrap()["type"], "connection_init");
    assert_eq!(seen.recv().await.unwrap()["type"], "start");
}

#[tokio::test]
async fn reconnects_after_dropped_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/graphql", listener.local_addr().unwrap());
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut first = accept(&listener, &seen_tx).await;
        handshake(&mut first, &seen_tx).await;
        drop(first);

        let mut second = accept(&listener, &seen_tx).await;
        handshake(&mut second, &seen_tx).await;
        send_json(
            &mut second,
            json!({ "type": "next", "id": "1", "payload": { "data": { "tick": 9 } } }),
        )
        .await;
        while recv_json(&mut second).await.is_some() {}
    });

    let transport = WsSubscriptionTransport::new(url, WsProtocol::GraphqlTransportWs, true);
    let stop = CancellationToken::new();
    let mut stream = subscribe(&transport, &stop);

    assert_eq!(next_event(&mut stream).await, Some(json!({ "data": { "tick": 9 } })));

    // Both connections re-sent the subscription.
    let mut subscribes = 0;
    while let Ok(frame) = seen.try_recv() {
        if frame["type"] == "subscribe" {
            subscribes += 1;
        }
    }
    assert_eq!(subscribes, 2);
    stop.cancel();
}

#[tokio::test]
async fn connection_error_ends_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/graphql", listener.local_addr().unwrap());
    let (seen_tx, _seen) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut socket = accept(&listener, &seen_tx).await;
        recv_json(&mut socket).await;
        send_json(
            &mut socket,
            json!({ "type": "connection_error", "payload": { "message": "unauthorized" } }),
        )
        .await;
        while recv_json(&mut socket).await.is_some() {}
    });

    let transport = WsSubscriptionTransport::new(url, WsProtocol::SubscriptionsTransportWs, false);
    let mut stream = subscribe(&transport, &CancellationToken::new());

    assert_eq!(next_event(&mut stream).await, None);
}

#[tokio::test]
async fn unreachable_server_without_reconnect_ends_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/graphql", listener.local_addr().unwrap());
    drop(listener);

    let transport = WsSubscriptionTransport::new(url, WsProtocol::GraphqlTransportWs, false);
    let mut stream = subscribe(&transport, &CancellationToken::new());

    assert_eq!(next_event(&mut stream).await, None);
}

#[tokio::test]
async fn stop_interrupts_reconnect_backoff() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/graphql", listener.local_addr().unwrap());
    drop(listener);

    let transport = WsSubscriptionTransport::new(url, WsProtocol::GraphqlTransportWs, true);
    let stop = CancellationToken::new();
    let mut stream = subscribe(&transport, &stop);

    let canceller = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    assert_eq!(next_event(&mut stream).await, None);
}
