//! Host-side GraphQL relay for a sandboxed embedded widget.
//!
//! The widget cannot reach the network. It posts operation requests over a
//! cross-document [`MessageChannel`]; the [`Relay`] executes them against the
//! backend (HTTP for queries and mutations, WebSocket for subscriptions) and
//! posts the results back into the widget's frame.

pub mod channel;
pub mod error;
pub mod executor;
pub mod frame;
pub mod relay;
pub mod subscription;
pub mod ws;

pub use {
    channel::{ListenerId, MessageChannel, MessageEvent},
    error::{Error, Result},
    executor::{OperationExecutor, with_content_type},
    frame::{ForwardingFrame, FrameLookup, FrameTarget, FrameWindow, PostedMessage, StaticDocument},
    relay::{Relay, RelayRegistration},
    subscription::{EventStream, PendingSubscription, SubscriptionManager, SubscriptionTransport},
    ws::WsSubscriptionTransport,
};
