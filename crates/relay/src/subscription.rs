//! Subscription lifecycle: open, forward events, terminate.
//!
//! Each subscription request gets its own transport stream and its own
//! termination listener on the channel. Release is idempotent and can come
//! from three places: a matching termination message, an explicit
//! [`SubscriptionManager::terminate`], or relay teardown.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    embed_relay_protocol::{CorrelationId, Dialect, GraphQLRequest, Headers, Inbound, OperationRequest, Outbound},
    futures::{StreamExt, stream::BoxStream},
    serde_json::Value,
    tokio::runtime::Handle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, trace, warn},
};

use crate::{
    channel::{ListenerId, MessageChannel},
    error::Result,
    frame::FrameTarget,
};

/// How long a stopped forwarder waits for the transport stream to wind down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Event payloads delivered by a transport, forwarded verbatim.
pub type EventStream = BoxStream<'static, Value>;

/// Opens streaming subscriptions against the backend.
///
/// `subscribe` must not do I/O; the connection is opened when the returned
/// stream is first polled. Once `stop` is cancelled the stream should send
/// whatever stop frame its protocol needs and then end.
pub trait SubscriptionTransport: Send + Sync {
    fn subscribe(
        &self,
        connection_params: &Headers,
        request: GraphQLRequest,
        stop: CancellationToken,
    ) -> Result<EventStream>;
}

#[derive(Debug, Default)]
struct PendingState {
    listener: Option<ListenerId>,
    released: bool,
}

/// One open subscription.
pub struct PendingSubscription {
    key: u64,
    correlation_id: CorrelationId,
    stop: CancellationToken,
    state: Mutex<PendingState>,
    channel: MessageChannel,
}

impl PendingSubscription {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn is_released(&self) -> bool {
        self.state().released
    }

    /// Stop the stream and deregister the termination listener.
    ///
    /// Returns `false` if the subscription was already released.
    pub fn release(&self) -> bool {
        let listener = {
            let mut state = self.state();
            if state.released {
                return false;
            }
            state.released = true;
            state.listener.take()
        };

        self.stop.cancel();
        if let Some(id) = listener {
            self.channel.remove_listener(id);
        }
        true
    }

    fn attach_listener(&self, id: ListenerId) {
        let mut state = self.state();
        if state.released {
            drop(state);
            self.channel.remove_listener(id);
        } else {
            state.listener = Some(id);
        }
    }

    /// Post one event unless released. The state lock is held across the
    /// post so nothing is delivered after `release` returns.
    fn deliver(&self, target: &FrameTarget, response: Value) -> bool {
        let state = self.state();
        if state.released {
            return false;
        }
        target.post(&Outbound::SubscriptionResponse {
            correlation_id: self.correlation_id.clone(),
            response,
        });
        true
    }

    fn state(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for PendingSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSubscription")
            .field("correlation_id", &self.correlation_id)
            .field("released", &self.is_released())
            .finish()
    }
}

type Registry = Mutex<HashMap<u64, Arc<PendingSubscription>>>;

/// Owns every pending subscription of one relay.
pub struct SubscriptionManager {
    transport: Arc<dyn SubscriptionTransport>,
    channel: MessageChannel,
    dialect: Dialect,
    runtime: Handle,
    next_key: AtomicU64,
    pending: Arc<Registry>,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn SubscriptionTransport>,
        channel: MessageChannel,
        dialect: Dialect,
        runtime: Handle,
    ) -> Self {
        Self {
            transport,
            channel,
            dialect,
            runtime,
            next_key: AtomicU64::new(1),
            pending: Arc::default(),
        }
    }

    /// Open a subscription and start forwarding its events into `target`.
    ///
    /// Returns `None` if the transport refused the request; nothing is posted
    /// in that case.
    pub fn start(&self, operation: OperationRequest, target: FrameTarget) -> Option<Arc<PendingSubscription>> {
        let OperationRequest {
            correlation_id,
            request,
            headers,
        } = operation;
        let connection_params = headers.unwrap_or_default();
        let stop = CancellationToken::new();

        let events = match self.transport.subscribe(&connection_params, request, stop.clone()) {
            Ok(events) => events,
            Err(e) => {
                warn!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "could not open subscription, no responses will be posted"
                );
                return None;
            },
        };

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::new(PendingSubscription {
            key,
            correlation_id,
            stop,
            state: Mutex::default(),
            channel: self.channel.clone(),
        });
        self.registry().insert(key, Arc::clone(&pending));

        let listener = self.termination_listener(&pending);
        pending.attach_listener(listener);

        debug!(correlation_id = %pending.correlation_id, "subscription started");
        self.runtime
            .spawn(forward_events(Arc::clone(&pending), events, target));
        Some(pending)
    }

    /// Release subscriptions matching `correlation_id`, or all of them for
    /// `None`. Returns how many were released.
    pub fn terminate(&self, correlation_id: Option<&CorrelationId>) -> usize {
        let matching: Vec<Arc<PendingSubscription>> = {
            let mut registry = self.registry();
            let keys: Vec<u64> = registry
                .iter()
                .filter(|(_, pending)| correlation_id.is_none_or(|id| *id == pending.correlation_id))
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| registry.remove(key)).collect()
        };

        matching.iter().filter(|pending| pending.release()).count()
    }

    pub fn release_all(&self) -> usize {
        self.terminate(None)
    }

    /// Number of subscriptions not yet released.
    pub fn active(&self) -> usize {
        self.registry().len()
    }

    fn termination_listener(&self, pending: &Arc<PendingSubscription>) -> ListenerId {
        let subscription = Arc::downgrade(pending);
        let registry: Weak<Registry> = Arc::downgrade(&self.pending);
        let dialect = self.dialect;

        self.channel.add_listener(move |event| {
            let Some(Inbound::SubscriptionTermination { correlation_id }) =
                dialect.parse_inbound(&event.data)
            else {
                return;
            };
            let Some(pending) = subscription.upgrade() else {
                return;
            };
            if correlation_id
                .as_ref()
                .is_some_and(|id| *id != pending.correlation_id)
            {
                return;
            }

            if pending.release() {
                debug!(
                    correlation_id = %pending.correlation_id,
                    origin = %event.origin,
                    "subscription terminated"
                );
            }
            if let Some(registry) = registry.upgrade() {
                registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&pending.key);
            }
        })
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u64, Arc<PendingSubscription>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("dialect", &self.dialect)
            .field("active", &self.active())
            .finish()
    }
}

async fn forward_events(pending: Arc<PendingSubscription>, mut events: EventStream, target: FrameTarget) {
    loop {
        tokio::select! {
            biased;
            () = pending.stop.cancelled() => break,
            event = events.next() => match event {
                Some(response) => {
                    if !pending.deliver(&target, response) {
                        break;
                    }
                },
                None => {
                    debug!(correlation_id = %pending.correlation_id, "subscription stream ended");
                    return;
                },
            },
        }
    }

    // Keep polling so the transport can send its stop frame and close.
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while events.next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(correlation_id = %pending.correlation_id, "transport did not stop in time");
    } else {
        trace!(correlation_id = %pending.correlation_id, "forwarder finished");
    }
}
