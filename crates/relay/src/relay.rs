//! The relay dispatcher: the single channel listener that routes widget
//! messages to the executor or the subscription manager.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use {
    embed_relay_config::{InitialPayload, RelayConfig},
    embed_relay_protocol::{Dialect, Inbound, Outbound},
    serde_json::Value,
    tokio::runtime::Handle,
    tracing::{debug, info, trace},
};

use crate::{
    channel::{ListenerId, MessageChannel, MessageEvent},
    error::{Context, Result},
    executor::OperationExecutor,
    frame::{FrameLookup, FrameTarget},
    subscription::{SubscriptionManager, SubscriptionTransport},
    ws::WsSubscriptionTransport,
};

#[derive(Debug, Default)]
struct Registration {
    listener: Option<ListenerId>,
    guards: usize,
    /// Bumped on teardown so guards from an earlier setup become inert.
    generation: u64,
}

struct RelayInner {
    channel: MessageChannel,
    document: Arc<dyn FrameLookup>,
    frame_id: String,
    widget_origin: String,
    dialect: Dialect,
    initial: InitialPayload,
    executor: OperationExecutor,
    subscriptions: SubscriptionManager,
    runtime: Handle,
    registration: Mutex<Registration>,
}

/// Host-side relay between the widget frame and the GraphQL backend.
///
/// Cheap to clone; clones share the same registration and subscriptions.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Build a relay that opens subscriptions over WebSocket.
    ///
    /// Must be called from within a tokio runtime; the runtime handle is
    /// captured so the channel listener can spawn work from any thread.
    pub fn new(config: &RelayConfig, channel: MessageChannel, document: Arc<dyn FrameLookup>) -> Result<Self> {
        let transport = Arc::new(WsSubscriptionTransport::from_config(&config.backend));
        Self::with_transport(config, channel, document, transport)
    }

    pub fn with_transport(
        config: &RelayConfig,
        channel: MessageChannel,
        document: Arc<dyn FrameLookup>,
        transport: Arc<dyn SubscriptionTransport>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().context("relay must be created inside a tokio runtime")?;
        let executor = OperationExecutor::new(config.backend.http_url.clone())?;
        let dialect = config.relay.dialect;
        let subscriptions = SubscriptionManager::new(transport, channel.clone(), dialect, runtime.clone());

        Ok(Self {
            inner: Arc::new(RelayInner {
                channel,
                document,
                frame_id: config.relay.frame_id.clone(),
                widget_origin: config.relay.widget_origin.clone(),
                dialect,
                initial: config.initial.clone(),
                executor,
                subscriptions,
                runtime,
                registration: Mutex::default(),
            }),
        })
    }

    /// Attach the channel listener if it is not attached yet.
    ///
    /// The listener stays attached until every returned guard is dropped or
    /// [`Relay::teardown`] is called.
    pub fn setup(&self) -> RelayRegistration {
        let mut registration = self.inner.registration();
        if registration.listener.is_none() {
            let relay = Arc::downgrade(&self.inner);
            let id = self.inner.channel.add_listener(move |event| {
                if let Some(relay) = relay.upgrade() {
                    relay.on_message(event);
                }
            });
            registration.listener = Some(id);
            info!(
                frame_id = %self.inner.frame_id,
                widget_origin = %self.inner.widget_origin,
                dialect = ?self.inner.dialect,
                "relay listening"
            );
        }
        registration.guards += 1;

        RelayRegistration {
            inner: Arc::clone(&self.inner),
            generation: registration.generation,
        }
    }

    /// Detach the listener and release every pending subscription,
    /// regardless of outstanding guards.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    pub fn is_listening(&self) -> bool {
        self.inner.registration().listener.is_some()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.active()
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.inner.channel
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    pub fn frame_id(&self) -> &str {
        &self.inner.frame_id
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("frame_id", &self.inner.frame_id)
            .field("dialect", &self.inner.dialect)
            .field("listening", &self.is_listening())
            .field("subscriptions", &self.active_subscriptions())
            .finish()
    }
}

impl RelayInner {
    fn on_message(&self, event: &MessageEvent) {
        let target = FrameTarget::new(
            self.document.frame_by_id(&self.frame_id),
            self.widget_origin.as_str(),
            self.dialect,
        );

        let Some(inbound) = self.dialect.parse_inbound(&event.data) else {
            trace!(origin = %event.origin, "ignoring unrecognised message");
            return;
        };

        match inbound {
            Inbound::ReadyForOperationState => self.push_initial_operation(&target),
            Inbound::ReadyForSchema => self.push_schema(&target),
            Inbound::OperationRequest(operation) => {
                debug!(
                    correlation_id = %operation.correlation_id,
                    origin = %event.origin,
                    "operation request"
                );
                let executor = self.executor.clone();
                self.runtime.spawn(async move {
                    executor.execute(operation, target).await;
                });
            },
            Inbound::SubscriptionRequest(operation) => {
                debug!(
                    correlation_id = %operation.correlation_id,
                    origin = %event.origin,
                    "subscription request"
                );
                self.subscriptions.start(operation, target);
            },
            // Each pending subscription listens for its own termination.
            Inbound::SubscriptionTermination { .. } => {},
        }
    }

    fn push_initial_operation(&self, target: &FrameTarget) {
        let Some(operation) = &self.initial.operation else {
            debug!("widget ready for operation state, none configured");
            return;
        };
        target.post(&Outbound::PushInitialOperation {
            operation: operation.clone(),
            variables: self.initial.variables.as_ref().map(Value::to_string),
        });
    }

    fn push_schema(&self, target: &FrameTarget) {
        let Some(schema) = &self.initial.schema else {
            debug!("widget ready for schema, none configured");
            return;
        };
        target.post(&Outbound::PushSchema {
            schema: schema.clone(),
        });
    }

    fn teardown(&self) {
        let listener = {
            let mut registration = self.registration();
            registration.guards = 0;
            registration.generation += 1;
            registration.listener.take()
        };

        if let Some(id) = listener {
            self.channel.remove_listener(id);
        }
        let released = self.subscriptions.release_all();
        info!(released, "relay torn down");
    }

    fn registration(&self) -> MutexGuard<'_, Registration> {
        self.registration.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps the relay listening while held.
#[must_use = "the relay stops listening when the registration is dropped"]
pub struct RelayRegistration {
    inner: Arc<RelayInner>,
    generation: u64,
}

impl Drop for RelayRegistration {
    fn drop(&mut self) {
        let last = {
            let mut registration = self.inner.registration();
            if registration.generation != self.generation || registration.guards == 0 {
                false
            } else {
                registration.guards -= 1;
                registration.guards == 0
            }
        };
        if last {
            self.inner.teardown();
        }
    }
}

impl fmt::Debug for RelayRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayRegistration")
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::frame::StaticDocument};

    fn relay(channel: &MessageChannel) -> Relay {
        Relay::new(
            &RelayConfig::default(),
            channel.clone(),
            Arc::new(StaticDocument::new()),
        )
        .unwrap()
    }

    #[test]
    fn requires_a_runtime() {
        let result = Relay::new(
            &RelayConfig::default(),
            MessageChannel::new(),
            Arc::new(StaticDocument::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn guards_are_reference_counted() {
        let channel = MessageChannel::new();
        let relay = relay(&channel);

        let first = relay.setup();
        let second = relay.setup();
        assert_eq!(channel.listener_count(), 1);

        drop(first);
        assert!(relay.is_listening());
        drop(second);
        assert!(!relay.is_listening());
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn teardown_makes_old_guards_inert() {
        let channel = MessageChannel::new();
        let relay = relay(&channel);

        let stale = relay.setup();
        relay.teardown();
        assert!(!relay.is_listening());

        let fresh = relay.setup();
        drop(stale);
        assert!(relay.is_listening());
        drop(fresh);
        assert!(!relay.is_listening());
    }
}
