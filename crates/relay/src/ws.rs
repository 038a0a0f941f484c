//! GraphQL-over-WebSocket subscription transport.
//!
//! Speaks either `graphql-transport-ws` or the legacy `graphql-ws`
//! subprotocol of subscriptions-transport-ws. Each subscription owns one
//! socket. The socket is opened lazily on first poll and, when reconnect is
//! enabled, reopened with exponential backoff after it drops.

use std::time::Duration;

use {
    embed_relay_config::{BackendConfig, WsProtocol},
    embed_relay_protocol::{GraphQLRequest, Headers},
    futures::{SinkExt, StreamExt},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::net::TcpStream,
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            Message,
            client::IntoClientRequest,
            http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
        },
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    error::{Error, Result},
    subscription::{EventStream, SubscriptionTransport},
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Every socket carries a single subscription, so the id is fixed.
const SUBSCRIPTION_ID: &str = "1";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Wire messages ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage<'a> {
    ConnectionInit {
        payload: &'a Value,
    },
    Subscribe {
        id: &'a str,
        payload: &'a GraphQLRequest,
    },
    Start {
        id: &'a str,
        payload: &'a GraphQLRequest,
    },
    Complete {
        id: &'a str,
    },
    Stop {
        id: &'a str,
    },
    ConnectionTerminate,
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl ClientMessage<'_> {
    fn to_frame(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    ConnectionAck {},
    ConnectionError {
        #[serde(default)]
        payload: Value,
    },
    Ka {},
    Next {
        id: String,
        payload: Value,
    },
    Data {
        id: String,
        payload: Value,
    },
    Error {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    Complete {
        id: String,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {},
}

trait WsProtocolExt {
    fn subprotocol(self) -> &'static str;
    fn subscribe_message<'a>(self, request: &'a GraphQLRequest) -> ClientMessage<'a>;
    fn stop_messages(self) -> Vec<ClientMessage<'static>>;
}

impl WsProtocolExt for WsProtocol {
    fn subprotocol(self) -> &'static str {
        match self {
            Self::GraphqlTransportWs => "graphql-transport-ws",
            Self::SubscriptionsTransportWs => "graphql-ws",
        }
    }

    fn subscribe_message<'a>(self, request: &'a GraphQLRequest) -> ClientMessage<'a> {
        match self {
            Self::GraphqlTransportWs => ClientMessage::Subscribe {
                id: SUBSCRIPTION_ID,
                payload: request,
            },
            Self::SubscriptionsTransportWs => ClientMessage::Start {
                id: SUBSCRIPTION_ID,
                payload: request,
            },
        }
    }

    fn stop_messages(self) -> Vec<ClientMessage<'static>> {
        match self {
            Self::GraphqlTransportWs => vec![ClientMessage::Complete {
                id: SUBSCRIPTION_ID,
            }],
            Self::SubscriptionsTransportWs => vec![
                ClientMessage::Stop {
                    id: SUBSCRIPTION_ID,
                },
                ClientMessage::ConnectionTerminate,
            ],
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// What to do with one frame read from the socket.
#[derive(Debug)]
enum Step {
    Event(Value),
    Reply(Message),
    Continue,
    /// The server ended the subscription; do not reconnect.
    Finished,
    /// The socket went away; reconnect if enabled.
    Dropped,
}

/// Opens one WebSocket per subscription against the backend streaming URL.
#[derive(Debug, Clone)]
pub struct WsSubscriptionTransport {
    url: String,
    protocol: WsProtocol,
    reconnect: bool,
}

impl WsSubscriptionTransport {
    pub fn new(url: impl Into<String>, protocol: WsProtocol, reconnect: bool) -> Self {
        Self {
            url: url.into(),
            protocol,
            reconnect,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.ws_url.clone(), config.ws_protocol, config.reconnect)
    }
}

impl SubscriptionTransport for WsSubscriptionTransport {
    fn subscribe(
        &self,
        connection_params: &Headers,
        request: GraphQLRequest,
        stop: CancellationToken,
    ) -> Result<EventStream> {
        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::message(format!(
                "unsupported subscription URL scheme: {}",
                url.scheme()
            )));
        }

        let params = serde_json::to_value(connection_params)?;
        let protocol = self.protocol;
        let reconnect = self.reconnect;

        Ok(Box::pin(async_stream::stream! {
            let mut backoff = INITIAL_BACKOFF;

            loop {
                let opened = tokio::select! {
                    biased;
                    () = stop.cancelled() => return,
                    opened = open(&url, protocol, &params, &request) => opened,
                };

                match opened {
                    Ok(mut socket) => {
                        backoff = INITIAL_BACKOFF;
                        info!(url = %url, subprotocol = protocol.subprotocol(), "subscription socket open");

                        loop {
                            let frame = tokio::select! {
                                biased;
                                () = stop.cancelled() => None,
                                frame = socket.next() => Some(frame),
                            };
                            let Some(frame) = frame else {
                                close(&mut socket, protocol).await;
                                return;
                            };

                            match classify(frame) {
                                Step::Event(payload) => yield payload,
                                Step::Reply(message) => {
                                    if let Err(e) = socket.send(message).await {
                                        warn!(error = %e, "failed to answer server ping");
                                        break;
                                    }
                                },
                                Step::Continue => {},
                                Step::Finished => {
                                    let _ = socket.close(None).await;
                                    return;
                                },
                                Step::Dropped => break,
                            }
                        }
                    },
                    Err(e) => {
                        warn!(url = %url, error = %e, "subscription connect failed");
                    },
                }

                if !reconnect {
                    debug!("reconnect disabled, ending subscription stream");
                    return;
                }

                info!(delay_ms = backoff.as_millis(), "reconnecting subscription after delay");
                tokio::select! {
                    biased;
                    () = stop.cancelled() => return,
                    () = tokio::time::sleep(backoff) => {},
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }))
    }
}

/// Connect, run the `connection_init` handshake and send the subscription.
async fn open(url: &Url, protocol: WsProtocol, params: &Value, request: &GraphQLRequest) -> Result<Socket> {
    let mut client_request = url.as_str().into_client_request()?;
    client_request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(protocol.subprotocol()),
    );

    let (mut socket, _response) = connect_async(client_request).await?;
    socket
        .send(ClientMessage::ConnectionInit { payload: params }.to_frame()?)
        .await?;
    wait_for_ack(&mut socket).await?;
    socket
        .send(protocol.subscribe_message(request).to_frame()?)
        .await?;
    Ok(socket)
}

async fn wait_for_ack(socket: &mut Socket) -> Result<()> {
    match tokio::time::timeout(ACK_TIMEOUT, read_ack(socket)).await {
        Ok(result) => result,
        Err(_) => Err(Error::message("connection_ack timed out")),
    }
}

async fn read_ack(socket: &mut Socket) -> Result<()> {
    while let Some(frame) = socket.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => {
                return Err(Error::message("server closed connection during handshake"));
            },
            _ => continue,
        };
        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::ConnectionAck {}) => return Ok(()),
            Ok(ServerMessage::ConnectionError { payload }) => {
                return Err(Error::message(format!("connection rejected: {payload}")));
            },
            Ok(ServerMessage::Ping { payload }) => {
                socket
                    .send(ClientMessage::Pong { payload }.to_frame()?)
                    .await?;
            },
            Ok(_) => {},
            Err(e) => debug!(error = %e, "ignoring unparseable handshake frame"),
        }
    }
    Err(Error::message("connection closed before handshake"))
}

fn classify(frame: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>) -> Step {
    let text = match frame {
        None => {
            debug!("subscription socket closed");
            return Step::Dropped;
        },
        Some(Err(e)) => {
            warn!(error = %e, "subscription socket error");
            return Step::Dropped;
        },
        Some(Ok(Message::Close(_))) => {
            debug!("server closed subscription socket");
            return Step::Dropped;
        },
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(_)) => return Step::Continue,
    };

    let message = match serde_json::from_str::<ServerMessage>(&text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable subscription frame");
            return Step::Continue;
        },
    };

    match message {
        ServerMessage::Next { id, payload } | ServerMessage::Data { id, payload }
            if id == SUBSCRIPTION_ID =>
        {
            Step::Event(payload)
        },
        ServerMessage::Complete { id } if id == SUBSCRIPTION_ID => {
            debug!("server completed subscription");
            Step::Finished
        },
        ServerMessage::Error { id, payload } => {
            warn!(id = ?id, payload = %payload, "server rejected subscription");
            Step::Finished
        },
        ServerMessage::ConnectionError { payload } => {
            warn!(payload = %payload, "server reported connection error");
            Step::Finished
        },
        ServerMessage::Ping { payload } => match (ClientMessage::Pong { payload }).to_frame() {
            Ok(frame) => Step::Reply(frame),
            Err(_) => Step::Continue,
        },
        ServerMessage::Next { .. }
        | ServerMessage::Data { .. }
        | ServerMessage::Complete { .. }
        | ServerMessage::ConnectionAck {}
        | ServerMessage::Ka {}
        | ServerMessage::Pong {} => Step::Continue,
    }
}

/// Tell the server the subscription is over, then close the socket.
async fn close(socket: &mut Socket, protocol: WsProtocol) {
    for message in protocol.stop_messages() {
        let sent = match message.to_frame() {
            Ok(frame) => socket.send(frame).await,
            Err(_) => continue,
        };
        if let Err(e) = sent {
            debug!(error = %e, "could not send stop frame");
            return;
        }
    }
    let _ = socket.close(None).await;
    debug!("subscription socket closed after stop");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    fn text(value: Value) -> Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> {
        Some(Ok(Message::Text(value.to_string().into())))
    }

    #[test]
    fn client_frames_match_each_protocol() {
        let request = GraphQLRequest::new("subscription { tick }");

        let frame = WsProtocol::GraphqlTransportWs
            .subscribe_message(&request)
            .to_frame()
            .unwrap();
        let Message::Text(body) = frame else {
            panic!("expected text frame");
        };
        assert_eq!(
            serde_json::from_str::<Value>(&body).unwrap(),
            json!({ "type": "subscribe", "id": "1", "payload": { "query": "subscription { tick }" } })
        );

        let stops: Vec<Value> = WsProtocol::SubscriptionsTransportWs
            .stop_messages()
            .iter()
            .map(|m| serde_json::to_value(m).unwrap())
            .collect();
        assert_eq!(
            stops,
            vec![
                json!({ "type": "stop", "id": "1" }),
                json!({ "type": "connection_terminate" }),
            ]
        );
    }

    #[test]
    fn classifies_server_frames() {
        assert!(matches!(
            classify(text(json!({ "type": "next", "id": "1", "payload": { "data": 1 } }))),
            Step::Event(payload) if payload == json!({ "data": 1 })
        ));
        assert!(matches!(
            classify(text(json!({ "type": "data", "id": "1", "payload": { "data": 2 } }))),
            Step::Event(_)
        ));
        assert!(matches!(
            classify(text(json!({ "type": "next", "id": "9", "payload": {} }))),
            Step::Continue
        ));
        assert!(matches!(
            classify(text(json!({ "type": "complete", "id": "1" }))),
            Step::Finished
        ));
        assert!(matches!(
            classify(text(json!({ "type": "error", "id": "1", "payload": [] }))),
            Step::Finished
        ));
        assert!(matches!(classify(text(json!({ "type": "ka" }))), Step::Continue));
        assert!(matches!(classify(text(json!({ "type": "ping" }))), Step::Reply(_)));
        assert!(matches!(classify(text(json!({ "type": "mystery" }))), Step::Continue));
        assert!(matches!(classify(None), Step::Dropped));
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        let transport = WsSubscriptionTransport::new(
            "http://localhost:4000/graphql",
            WsProtocol::GraphqlTransportWs,
            true,
        );
        let result = transport.subscribe(
            &Headers::new(),
            GraphQLRequest::new("subscription { tick }"),
            CancellationToken::new(),
        );
        assert!(result.is_err());
    }
}
