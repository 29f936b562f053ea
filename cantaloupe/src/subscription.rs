use std::{
    num::NonZeroU64,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use cantaloupe_proto::{error::ServerError, ServerMessage, SubscriptionId};
use futures_core::{FusedStream, Stream};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::client::{Client, ClientClosedError};

/// A subscription to a subject
///
/// Receives messages coming from the server with At Most Once delivery.
///
/// Messages are buffered in an in-memory queue bounded by the pending
/// limits configured on the client. When the consumer falls behind and
/// a limit is hit, new messages are dropped and counted in
/// [`SubscriptionStats::dropped`]; the reader never blocks on a full
/// queue.
///
/// Messages can be consumed one at a time via
/// [`Subscription::next_message`], through the [`Stream`]
/// implementation, or by handing the subscription off to a handler
/// task via [`Subscription::spawn_handler`].
///
/// Obtained from [`Client::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    client: Client,
    receiver: mpsc::UnboundedReceiver<Result<ServerMessage, ServerError>>,
    stats: Arc<SubscriptionStats>,
    status: SubscriptionStatus,
}

#[derive(Debug, Copy, Clone)]
enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

/// Counters shared between a [`Subscription`] and the connection
///
/// Obtained from [`Subscription::stats`].
#[derive(Debug)]
pub struct SubscriptionStats {
    /// `usize::MAX` disables the check
    msg_limit: usize,
    byte_limit: usize,
    pending_msgs: AtomicUsize,
    pending_bytes: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
    slow: AtomicBool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    Route,
    /// The message was dropped. `notify` is set for the first drop of
    /// an overflow burst.
    Drop {
        notify: bool,
    },
}

impl SubscriptionStats {
    pub(crate) fn new(msg_limit: usize, byte_limit: usize) -> Self {
        Self {
            msg_limit,
            byte_limit,
            pending_msgs: AtomicUsize::new(0),
            pending_bytes: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slow: AtomicBool::new(false),
        }
    }

    /// Number of messages currently buffered
    #[must_use]
    pub fn pending_msgs(&self) -> usize {
        self.pending_msgs.load(Ordering::Acquire)
    }

    /// Number of payload bytes currently buffered
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    /// Number of messages handed to the consumer
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    /// Number of messages dropped because a pending limit was exceeded
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Admission check performed by the connection before enqueueing
    pub(crate) fn try_route(&self, bytes: usize) -> RouteOutcome {
        let pending_msgs = self.pending_msgs.load(Ordering::Acquire);
        let pending_bytes = self.pending_bytes.load(Ordering::Acquire);

        if pending_msgs >= self.msg_limit || pending_bytes.saturating_add(bytes) > self.byte_limit
        {
            self.dropped.fetch_add(1, Ordering::AcqRel);
            let notify = !self.slow.swap(true, Ordering::AcqRel);
            RouteOutcome::Drop { notify }
        } else {
            self.pending_msgs.fetch_add(1, Ordering::AcqRel);
            self.pending_bytes.fetch_add(bytes, Ordering::AcqRel);
            RouteOutcome::Route
        }
    }

    /// Book-keeping performed by the consumer as it takes a message
    pub(crate) fn consumed(&self, bytes: usize) {
        self.pending_msgs.fetch_sub(1, Ordering::AcqRel);
        self.pending_bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.delivered.fetch_add(1, Ordering::AcqRel);

        // End of the overflow burst: the next drop notifies again
        if self.slow.load(Ordering::Acquire)
            && self.pending_msgs.load(Ordering::Acquire) < self.msg_limit
            && self.pending_bytes.load(Ordering::Acquire) < self.byte_limit
        {
            self.slow.store(false, Ordering::Release);
        }
    }
}

/// An error encountered while waiting for the next message
#[derive(Debug, thiserror::Error)]
pub enum NextMessageError {
    /// No message arrived within the timeout
    #[error("no message within the timeout window")]
    TimedOut,
    /// The subscription was closed
    #[error("subscription closed")]
    Closed,
    /// The server rejected the subscription
    #[error("server error")]
    Server(#[source] ServerError),
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        client: Client,
        receiver: mpsc::UnboundedReceiver<Result<ServerMessage, ServerError>>,
        stats: Arc<SubscriptionStats>,
    ) -> Self {
        Self {
            id,
            client,
            receiver,
            stats,
            status: SubscriptionStatus::Subscribed,
        }
    }

    /// The identifier assigned to this subscription
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The delivery counters of this subscription
    #[must_use]
    pub fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }

    /// Wait for the next message, up to `timeout`
    ///
    /// # Errors
    ///
    /// It returns an error if the timeout elapses before a message
    /// arrives, if the subscription has been closed, or if the server
    /// rejected the subscription.
    pub async fn next_message(&mut self, timeout: Duration) -> Result<ServerMessage, NextMessageError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Err(_) => Err(NextMessageError::TimedOut),
            Ok(None) => Err(NextMessageError::Closed),
            Ok(Some(Ok(message))) => Ok(message),
            Ok(Some(Err(err))) => Err(NextMessageError::Server(err)),
        }
    }

    pub(crate) async fn recv(&mut self) -> Option<Result<ServerMessage, ServerError>> {
        let item = self.receiver.recv().await;
        self.account(item.as_ref());
        item
    }

    /// Take a message out of the queue without waiting
    pub(crate) fn try_next_buffered(&mut self) -> Option<Result<ServerMessage, ServerError>> {
        match self.receiver.try_recv() {
            Ok(item) => {
                self.account(Some(&item));
                Some(item)
            }
            Err(_) => None,
        }
    }

    fn account(&mut self, item: Option<&Result<ServerMessage, ServerError>>) {
        match item {
            Some(Ok(message)) => self.stats.consumed(message.base.payload.len()),
            Some(Err(_)) => {}
            None => self.status = SubscriptionStatus::Unsubscribed,
        }
    }

    /// Hand this subscription to a dedicated delivery task
    ///
    /// `on_message` is invoked for every delivered message, strictly
    /// serialized. `on_complete` fires after the final message once
    /// the subscription has been closed and its queue drained.
    pub fn spawn_handler<F, C>(self, mut on_message: F, on_complete: C) -> JoinHandle<()>
    where
        F: FnMut(ServerMessage) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let mut this = self;
        tokio::spawn(async move {
            while let Some(item) = this.recv().await {
                if let Ok(message) = item {
                    on_message(message);
                }
            }
            on_complete();
        })
    }

    /// Immediately close the subscription
    ///
    /// The queue will continue to yield any already buffered messages.
    ///
    /// Calling this method multiple times is a NOOP.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close(&mut self) -> Result<(), ClientClosedError> {
        match (self.status, self.receiver.is_closed()) {
            (SubscriptionStatus::Subscribed, true) => {
                self.status = SubscriptionStatus::Unsubscribed;
            }
            (SubscriptionStatus::Subscribed, false) => {
                self.client.unsubscribe(self.id, None).await?;
                self.status = SubscriptionStatus::Unsubscribed;
            }
            (SubscriptionStatus::Unsubscribed, _) => {}
        }

        Ok(())
    }

    /// Close the subscription after a total of `max_messages` deliveries
    ///
    /// The cap counts messages already delivered: a subscription that
    /// has seen 3 messages and is given `close_after(5)` will receive
    /// at most 2 more. The server enforces the residual count, and the
    /// connection independently drops the subscription once the cap is
    /// reached, so a reconnect cannot over-deliver.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn close_after(&mut self, max_messages: NonZeroU64) -> Result<(), ClientClosedError> {
        match (self.status, self.receiver.is_closed()) {
            (SubscriptionStatus::Subscribed, true) => {
                self.status = SubscriptionStatus::Unsubscribed;
            }
            (SubscriptionStatus::Subscribed, false) => {
                self.client.unsubscribe(self.id, Some(max_messages)).await?;
            }
            (SubscriptionStatus::Unsubscribed, _) => {}
        }

        Ok(())
    }
}

impl Stream for Subscription {
    type Item = Result<ServerMessage, ServerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.receiver.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(item) => {
                this.account(item.as_ref());
                Poll::Ready(item)
            }
        }
    }
}

impl FusedStream for Subscription {
    fn is_terminated(&self) -> bool {
        self.receiver.is_closed() && self.receiver.is_empty()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if matches!(self.status, SubscriptionStatus::Unsubscribed) || self.receiver.is_closed() {
            return;
        }

        self.client.lazy_unsubscribe(self.id, None);
    }
}
