//! Config schema types (channel, backend, initial payload).

use {
    embed_relay_protocol::{DEFAULT_FRAME_ID, DEFAULT_WIDGET_ORIGIN, Dialect},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// Root configuration for a relay host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub relay: ChannelConfig,
    pub backend: BackendConfig,
    pub initial: InitialPayload,
}

/// How the relay talks to the widget frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Element id of the widget frame.
    pub frame_id: String,
    /// Origin every outbound post is scoped to.
    pub widget_origin: String,
    pub dialect: Dialect,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame_id: DEFAULT_FRAME_ID.into(),
            widget_origin: DEFAULT_WIDGET_ORIGIN.into(),
            dialect: Dialect::default(),
        }
    }
}

/// GraphQL backend endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Endpoint for queries and mutations (HTTP POST).
    pub http_url: String,
    /// Endpoint for subscriptions (WebSocket).
    pub ws_url: String,
    pub ws_protocol: WsProtocol,
    /// Reconnect dropped subscription sockets.
    pub reconnect: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            http_url: "http://localhost:4000/graphql".into(),
            ws_url: "ws://localhost:4000/graphql".into(),
            ws_protocol: WsProtocol::default(),
            reconnect: true,
        }
    }
}

/// GraphQL-over-WebSocket dialect spoken to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WsProtocol {
    /// `graphql-transport-ws` subprotocol.
    #[default]
    GraphqlTransportWs,
    /// Legacy `graphql-ws` subprotocol from subscriptions-transport-ws.
    SubscriptionsTransportWs,
}

/// Payloads pushed into the frame when the widget signals it is ready.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialPayload {
    /// Operation pushed on the ready-for-operation-state handshake.
    pub operation: Option<String>,
    /// Variables sent alongside `operation`, serialized as JSON text.
    pub variables: Option<Value>,
    /// Schema document (SDL) pushed on the ready-for-schema handshake.
    pub schema: Option<String>,
}
