use std::{fmt, sync::Arc};

use cantaloupe_proto::{error::ServerError, SubscriptionId};
use tokio::sync::mpsc;

/// A connection lifecycle notification
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The connection to the server was lost
    Disconnected,
    /// The connection was re-established and subscriptions replayed
    Reconnected,
    /// The client reached its terminal state
    Closed,
    /// An asynchronous error that couldn't be returned from any call
    Error(ClientError),
}

/// An error surfaced through the asynchronous error callback
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// A subscription exceeded its pending limits and dropped a message
    ///
    /// Reported at most once per overflow burst.
    #[error("slow consumer on subscription {subscription_id}")]
    SlowConsumer { subscription_id: SubscriptionId },
    /// The server stopped answering PINGs
    #[error("stale connection")]
    StaleConnection,
    /// The server reported an error that didn't belong to any operation
    #[error("server error")]
    ServerError(#[source] ServerError),
    /// A JetStream push consumer missed its heartbeat window
    #[error("missed heartbeat from consumer {consumer} on stream {stream}")]
    MissedHeartbeat { stream: String, consumer: String },
    /// A JetStream consumer observed a gap in the delivered sequence
    #[error("sequence mismatch on consumer {consumer} of stream {stream}")]
    SequenceMismatch { stream: String, consumer: String },
}

type EventFn = dyn Fn() + Send + Sync;
type ErrorFn = dyn Fn(ClientError) + Send + Sync;

/// The user installed callbacks
///
/// Invoked from a dedicated dispatch task so user code can never stall
/// the connection's reader, writer or timers.
#[derive(Clone, Default)]
pub(crate) struct EventCallbacks {
    pub(crate) on_disconnected: Option<Arc<EventFn>>,
    pub(crate) on_reconnected: Option<Arc<EventFn>>,
    pub(crate) on_closed: Option<Arc<EventFn>>,
    pub(crate) on_error: Option<Arc<ErrorFn>>,
}

#[derive(Debug, Clone)]
pub(crate) struct EventSender(mpsc::UnboundedSender<ClientEvent>);

impl EventSender {
    pub(crate) fn send(&self, event: ClientEvent) {
        let _ = self.0.send(event);
    }
}

pub(crate) fn spawn_dispatcher(callbacks: EventCallbacks) -> EventSender {
    let (sender, mut receiver) = mpsc::unbounded_channel::<ClientEvent>();

    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match &event {
                ClientEvent::Disconnected => {
                    tracing::warn!("connection lost");
                    if let Some(cb) = &callbacks.on_disconnected {
                        cb();
                    }
                }
                ClientEvent::Reconnected => {
                    tracing::info!("connection re-established");
                    if let Some(cb) = &callbacks.on_reconnected {
                        cb();
                    }
                }
                ClientEvent::Closed => {
                    tracing::info!("connection closed");
                    if let Some(cb) = &callbacks.on_closed {
                        cb();
                    }
                    break;
                }
                ClientEvent::Error(err) => {
                    tracing::warn!(error = %err, "asynchronous client error");
                    if let Some(cb) = &callbacks.on_error {
                        cb(err.clone());
                    }
                }
            }
        }
    });

    EventSender(sender)
}

impl fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_reconnected", &self.on_reconnected.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
