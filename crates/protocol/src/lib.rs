//! Embed relay channel protocol definitions.
//!
//! The host relay and the embedded widget exchange JSON objects over a
//! cross-document messaging channel. Every message carries a `name` from a
//! closed catalog; requests and their responses are linked by a correlation id
//! chosen by the widget.
//!
//! Message directions:
//! - widget → host: ready handshakes, operation/subscription requests,
//!   subscription termination
//! - host → widget: initial operation/schema pushes, operation and
//!   subscription responses
//!
//! How names and correlation ids appear on the wire depends on the [`Dialect`].

use std::{collections::BTreeMap, fmt};

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

// ── Constants ────────────────────────────────────────────────────────────────

/// Element id of the widget frame in the host document.
pub const DEFAULT_FRAME_ID: &str = "embedded-explorer";
/// Origin the host scopes its posts to when none is configured.
pub const DEFAULT_WIDGET_ORIGIN: &str = "https://explorer.embed.apollographql.com";

/// Caller-supplied headers, forwarded verbatim to the backend.
pub type Headers = BTreeMap<String, String>;

// ── Correlation ids ──────────────────────────────────────────────────────────

/// Opaque token chosen by the widget to link a request to its response(s).
///
/// The host only ever echoes ids it received; it never mints one. Ids are
/// JSON strings or numbers and go back out exactly as they came in, so `7`
/// and `"7"` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Value);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Value::String(id.into()))
    }

    /// Accept a non-empty string or any number; everything else is not an id.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(id) if !id.is_empty() => Some(Self(value.clone())),
            Value::Number(_) => Some(Self(value.clone())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    /// The id as received, for echoing back on the wire.
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(id) => f.write_str(id),
            other => write!(f, "{other}"),
        }
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        Self(Value::from(id))
    }
}

// ── GraphQL request body ─────────────────────────────────────────────────────

/// Standard GraphQL request body sent to the backend.
///
/// Absent optional fields are omitted from the serialized JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }
}

// ── Message catalog ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    WidgetToHost,
    HostToWidget,
}

/// The closed set of message types exchanged over the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ReadyForOperationState,
    ReadyForSchema,
    PushInitialOperation,
    PushSchema,
    OperationRequest,
    SubscriptionRequest,
    OperationResponse,
    SubscriptionResponse,
    SubscriptionTermination,
}

impl MessageKind {
    pub const ALL: [Self; 9] = [
        Self::ReadyForOperationState,
        Self::ReadyForSchema,
        Self::PushInitialOperation,
        Self::PushSchema,
        Self::OperationRequest,
        Self::SubscriptionRequest,
        Self::OperationResponse,
        Self::SubscriptionResponse,
        Self::SubscriptionTermination,
    ];

    pub fn direction(self) -> Direction {
        match self {
            Self::ReadyForOperationState
            | Self::ReadyForSchema
            | Self::OperationRequest
            | Self::SubscriptionRequest
            | Self::SubscriptionTermination => Direction::WidgetToHost,
            Self::PushInitialOperation
            | Self::PushSchema
            | Self::OperationResponse
            | Self::SubscriptionResponse => Direction::HostToWidget,
        }
    }
}

/// A widget → host message that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ReadyForOperationState,
    ReadyForSchema,
    OperationRequest(OperationRequest),
    SubscriptionRequest(OperationRequest),
    /// `None` means the widget did not say which subscription to stop.
    SubscriptionTermination {
        correlation_id: Option<CorrelationId>,
    },
}

/// Operation or subscription request carried by an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub correlation_id: CorrelationId,
    pub request: GraphQLRequest,
    pub headers: Option<Headers>,
}

/// A host → widget message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    PushInitialOperation {
        operation: String,
        /// Variables as serialized JSON text.
        variables: Option<String>,
    },
    PushSchema {
        schema: String,
    },
    OperationResponse {
        correlation_id: CorrelationId,
        response: Value,
    },
    SubscriptionResponse {
        correlation_id: CorrelationId,
        response: Value,
    },
}

impl Outbound {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::PushInitialOperation { .. } => MessageKind::PushInitialOperation,
            Self::PushSchema { .. } => MessageKind::PushSchema,
            Self::OperationResponse { .. } => MessageKind::OperationResponse,
            Self::SubscriptionResponse { .. } => MessageKind::SubscriptionResponse,
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::OperationResponse { correlation_id, .. }
            | Self::SubscriptionResponse { correlation_id, .. } => Some(correlation_id),
            Self::PushInitialOperation { .. } | Self::PushSchema { .. } => None,
        }
    }
}

// ── Dialects ─────────────────────────────────────────────────────────────────

/// Wire encoding of message names and correlation ids.
///
/// A relay instance uses one dialect for both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    /// Kebab-case names, id in a `correlationId` field.
    #[default]
    Relay,
    /// Embedded explorer names, id in an `operationId` field.
    Explorer,
    /// Embedded explorer names, id as a `:` suffix of the name
    /// (`ExplorerRequest:42`).
    ExplorerLegacy,
}

impl Dialect {
    pub fn wire_name(self, kind: MessageKind) -> &'static str {
        match self {
            Self::Relay => match kind {
                MessageKind::ReadyForOperationState => "ready-for-operation-state",
                MessageKind::ReadyForSchema => "ready-for-schema",
                MessageKind::PushInitialOperation => "push-initial-operation",
                MessageKind::PushSchema => "push-schema",
                MessageKind::OperationRequest => "operation-request",
                MessageKind::SubscriptionRequest => "subscription-request",
                MessageKind::OperationResponse => "operation-response",
                MessageKind::SubscriptionResponse => "subscription-response",
                MessageKind::SubscriptionTermination => "subscription-termination",
            },
            Self::Explorer | Self::ExplorerLegacy => match kind {
                MessageKind::ReadyForOperationState => "ExplorerListeningForState",
                MessageKind::ReadyForSchema => "ExplorerListeningForSchema",
                MessageKind::PushInitialOperation => "SetOperation",
                MessageKind::PushSchema => "SchemaResponse",
                MessageKind::OperationRequest => "ExplorerRequest",
                MessageKind::SubscriptionRequest => "ExplorerSubscriptionRequest",
                MessageKind::OperationResponse => "ExplorerResponse",
                MessageKind::SubscriptionResponse => "ExplorerSubscriptionResponse",
                MessageKind::SubscriptionTermination => "ExplorerSubscriptionTermination",
            },
        }
    }

    /// Field carrying the correlation id, `None` when it rides in the name.
    pub fn correlation_field(self) -> Option<&'static str> {
        match self {
            Self::Relay => Some("correlationId"),
            Self::Explorer => Some("operationId"),
            Self::ExplorerLegacy => None,
        }
    }

    /// Parse a raw channel payload into a validated inbound message.
    ///
    /// Returns `None` for anything outside the widget → host catalog or
    /// missing a required field; callers drop those silently.
    pub fn parse_inbound(self, data: &Value) -> Option<Inbound> {
        let object = data.as_object()?;
        let name = object.get("name")?.as_str()?;
        let (kind, suffix) = self.classify(name)?;

        match kind {
            MessageKind::ReadyForOperationState => Some(Inbound::ReadyForOperationState),
            MessageKind::ReadyForSchema => Some(Inbound::ReadyForSchema),
            MessageKind::OperationRequest => {
                parse_request(object, self.correlation_id(object, suffix)?)
                    .map(Inbound::OperationRequest)
            },
            MessageKind::SubscriptionRequest => {
                parse_request(object, self.correlation_id(object, suffix)?)
                    .map(Inbound::SubscriptionRequest)
            },
            MessageKind::SubscriptionTermination => Some(Inbound::SubscriptionTermination {
                correlation_id: self.correlation_id(object, suffix),
            }),
            MessageKind::PushInitialOperation
            | MessageKind::PushSchema
            | MessageKind::OperationResponse
            | MessageKind::SubscriptionResponse => None,
        }
    }

    /// Encode an outbound message as the JSON object posted into the frame.
    pub fn encode(self, message: &Outbound) -> Value {
        let mut object = Map::new();
        let name = self.wire_name(message.kind());

        match (self.correlation_field(), message.correlation_id()) {
            (None, Some(id)) => {
                object.insert("name".into(), Value::String(format!("{name}:{id}")));
            },
            (Some(field), Some(id)) => {
                object.insert("name".into(), Value::String(name.into()));
                object.insert(field.into(), id.as_value().clone());
            },
            (_, None) => {
                object.insert("name".into(), Value::String(name.into()));
            },
        }

        match message {
            Outbound::PushInitialOperation {
                operation,
                variables,
            } => {
                object.insert("operation".into(), Value::String(operation.clone()));
                if let Some(variables) = variables {
                    object.insert("variables".into(), Value::String(variables.clone()));
                }
            },
            Outbound::PushSchema { schema } => {
                object.insert("schema".into(), Value::String(schema.clone()));
            },
            Outbound::OperationResponse { response, .. }
            | Outbound::SubscriptionResponse { response, .. } => {
                object.insert("response".into(), response.clone());
            },
        }

        Value::Object(object)
    }

    /// Map a wire name to a widget → host kind, plus the legacy id suffix.
    fn classify(self, name: &str) -> Option<(MessageKind, Option<&str>)> {
        const INBOUND: [MessageKind; 5] = [
            MessageKind::ReadyForOperationState,
            MessageKind::ReadyForSchema,
            MessageKind::OperationRequest,
            MessageKind::SubscriptionRequest,
            MessageKind::SubscriptionTermination,
        ];

        match self {
            Self::Relay | Self::Explorer => INBOUND
                .into_iter()
                .find(|kind| self.wire_name(*kind) == name)
                .map(|kind| (kind, None)),
            Self::ExplorerLegacy => INBOUND.into_iter().find_map(|kind| {
                let base = self.wire_name(kind);
                match kind {
                    MessageKind::OperationRequest | MessageKind::SubscriptionRequest => {
                        let rest = name.strip_prefix(base)?.strip_prefix(':')?;
                        Some((kind, rest.split(':').next()))
                    },
                    MessageKind::SubscriptionTermination => {
                        let rest = name.strip_prefix(base)?;
                        if rest.is_empty() {
                            Some((kind, None))
                        } else {
                            let rest = rest.strip_prefix(':')?;
                            Some((kind, rest.split(':').next()))
                        }
                    },
                    _ => (name == base).then_some((kind, None)),
                }
            }),
        }
    }

    fn correlation_id(self, object: &Map<String, Value>, suffix: Option<&str>) -> Option<CorrelationId> {
        match self.correlation_field() {
            Some(field) => CorrelationId::from_value(object.get(field)?),
            None => suffix.filter(|id| !id.is_empty()).map(CorrelationId::new),
        }
    }
}

/// Pull the request fields out of an inbound message.
///
/// `operation` must be a non-empty string. Optional fields of the wrong type
/// are treated as absent; header values that are not strings are dropped.
fn parse_request(object: &Map<String, Value>, correlation_id: CorrelationId) -> Option<OperationRequest> {
    let query = object.get("operation")?.as_str()?;
    if query.is_empty() {
        return None;
    }

    let variables = object.get("variables").cloned();
    let operation_name = object
        .get("operationName")
        .and_then(Value::as_str)
        .map(String::from);
    let headers = object.get("headers").and_then(Value::as_object).map(|map| {
        map.iter()
            .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_string())))
            .collect::<Headers>()
    });

    Some(OperationRequest {
        correlation_id,
        request: GraphQLRequest {
            query: query.to_string(),
            variables,
            operation_name,
        },
        headers,
    })
}
