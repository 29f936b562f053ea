use std::{
    fmt::Write,
    io,
    num::NonZeroU64,
    process::abort,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use cantaloupe_net::error::HandshakeError;
use cantaloupe_proto::{
    error::{ServerAddrError, ServerError},
    headers::HeaderMap,
    QueueGroup, ServerAddr, ServerInfo, Subject, SubscriptionId,
};
use rand::RngCore;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, Permit},
        oneshot,
    },
    task::JoinHandle,
};

pub use self::builder::{Authentication, ClientBuilder, Echo};
pub use self::commands::{
    ClientPublish, ClientRequest, DoClientPublish, DoClientRequest, Publish, PublishBuilder,
    Request, RequestBuilder, ResponseError, ResponseFut,
};
pub use self::events::{ClientError, ClientEvent};
pub(crate) use self::events::EventSender;
pub(crate) use self::pool::ServerPool;
pub use self::status::ClientStatus;
pub(crate) use self::status::RawStatus;
#[cfg(test)]
use self::tests::TestHandler;
use crate::{
    core::{MultiplexedSubscription, Subscription},
    handler::{Handler, HandlerCommand, HandlerOutput, RecycledHandler},
    subscription::SubscriptionStats,
};

mod builder;
mod commands;
mod events;
#[cfg(feature = "from-env")]
mod from_env;
mod pool;
mod status;

const COMMAND_CHANNEL_SIZE: usize = 512;

/// A NATS client
///
/// `Client` is a `Clone`able handle to a connection.
/// If the connection is lost, the client automatically reconnects to
/// the best known server and resumes any currently open subscriptions.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    sender: mpsc::Sender<HandlerCommand>,
    info: Arc<ArcSwap<ServerInfo>>,
    status: Arc<RawStatus>,
    events: EventSender,
    last_error: Arc<ArcSwapOption<ServerError>>,
    request_inbox_prefix: Subject,
    inbox_prefix: Subject,
    next_subscription_id: AtomicU64,
    default_response_timeout: Duration,
    translate_no_responders: bool,
    max_pending_msgs: usize,
    max_pending_bytes: usize,
    reconnect_buffered: Arc<AtomicUsize>,
    reconnect_buf_size: usize,
    handler: JoinHandle<()>,
}

/// An error encountered while trying to use a closed [`Client`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("client closed")]
pub struct ClientClosedError;

/// An error encountered while enqueueing a command without waiting
#[derive(Debug, thiserror::Error)]
#[error("try command error")]
pub enum TryCommandError {
    /// The client's internal buffer is currently full
    #[error("buffer full")]
    BufferFull,
    /// The client has been closed
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// An error encountered while publishing a message
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The subject contains wildcard tokens
    #[error("publish subject contains wildcards")]
    InvalidSubject,
    /// The payload exceeds the server's advertised limit
    #[error("payload of {len} bytes exceeds the server limit of {max}")]
    MaxPayload { len: usize, max: usize },
    /// The reconnect buffer cannot hold the payload
    #[error("insufficient reconnect buffer space")]
    InsufficientBuffer,
    /// The client's internal buffer is currently full
    #[error("buffer full")]
    BufferFull,
    /// The client has been closed
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// An error encountered while flushing the connection
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    /// No PONG came back within the timeout
    #[error("flush timed out")]
    TimedOut,
    /// The connection dropped while the flush was in flight
    #[error("connection lost during flush")]
    Disconnected,
    /// The client has been closed
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// An error encountered while draining the client
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    /// The client has already been closed
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// An error encountered while establishing the first connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// A server URL could not be parsed
    #[error("invalid server address")]
    Addr(#[source] ServerAddrError),
    /// The server list is empty
    #[error("no servers were provided")]
    EmptyServerList,
    /// Every server in the list failed once
    #[error("no server available for connection")]
    NoServersAvailable(#[source] Box<AttemptError>),
}

/// The reason a single connection attempt failed
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("io error")]
    Io(#[source] io::Error),
    #[error("the connection attempt timed out")]
    TimedOut,
    #[error("handshake failed")]
    Handshake(#[source] HandshakeError),
}

impl Client {
    /// Construct a new client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(super) async fn connect(
        addrs: Vec<ServerAddr>,
        builder: ClientBuilder,
    ) -> Result<Self, ConnectError> {
        let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let status = Arc::new(RawStatus::new());
        let events = events::spawn_dispatcher(builder.callbacks.clone());
        let last_error = Arc::new(ArcSwapOption::empty());
        let reconnect_buffered = Arc::new(AtomicUsize::new(0));
        let pool = ServerPool::new(addrs, !builder.no_randomize, builder.max_reconnect);
        let request_inbox_prefix = create_inbox_subject(&builder.inbox_prefix);

        let recycle = RecycledHandler::new(
            receiver,
            pool,
            Arc::clone(&status),
            events.clone(),
            Arc::clone(&last_error),
            Arc::clone(&reconnect_buffered),
            request_inbox_prefix.clone(),
        );
        status.store_status(ClientStatus::Connecting);
        let handle = Handler::initial_connect(&builder, recycle)
            .await
            .map_err(|(err, _recycle)| err)?;
        let info = handle.info().clone();

        let inbox_prefix = builder.inbox_prefix.clone();
        let default_response_timeout = builder.default_response_timeout;
        let translate_no_responders = !builder.no_responders_disabled;
        let max_pending_msgs = builder.max_pending_msgs;
        let max_pending_bytes = builder.max_pending_bytes;
        let reconnect_buf_size = builder.reconnect_buf_size;

        let handler = tokio::spawn({
            let status = Arc::clone(&status);
            let events = events.clone();

            async move {
                let mut handle = handle;

                loop {
                    match (&mut handle).await {
                        HandlerOutput::Disconnected => {
                            status.store_status(ClientStatus::Connecting);
                            events.send(ClientEvent::Disconnected);

                            let recycle = handle.recycle().await;
                            match Handler::reconnect(&builder, recycle).await {
                                Ok(new_handle) => {
                                    handle = new_handle;
                                    events.send(ClientEvent::Reconnected);
                                }
                                Err(_exhausted) => {
                                    status.store_status(ClientStatus::Closed);
                                    events.send(ClientEvent::Closed);
                                    break;
                                }
                            }
                        }
                        HandlerOutput::Closed => {
                            status.store_status(ClientStatus::Closed);
                            events.send(ClientEvent::Closed);
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            inner: Arc::new(ClientInner {
                sender,
                info,
                status,
                events,
                last_error,
                request_inbox_prefix,
                inbox_prefix,
                next_subscription_id: AtomicU64::new(u64::from(SubscriptionId::MIN) + 1),
                default_response_timeout,
                translate_no_responders,
                max_pending_msgs,
                max_pending_bytes,
                reconnect_buffered,
                reconnect_buf_size,
                handler,
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn test(client_to_handler_chan_size: usize) -> (Self, TestHandler) {
        let builder = Self::builder();
        let (sender, receiver) = mpsc::channel(client_to_handler_chan_size);
        let info = Arc::new(ArcSwap::from_pointee(tests::test_server_info()));
        let status = Arc::new(RawStatus::new());
        status.store_status(ClientStatus::Connected);
        let events = events::spawn_dispatcher(builder.callbacks.clone());
        let request_inbox_prefix = create_inbox_subject(&builder.inbox_prefix);

        let this = Self {
            inner: Arc::new(ClientInner {
                sender,
                info: Arc::clone(&info),
                status: Arc::clone(&status),
                events,
                last_error: Arc::new(ArcSwapOption::empty()),
                request_inbox_prefix,
                inbox_prefix: builder.inbox_prefix,
                next_subscription_id: AtomicU64::new(u64::from(SubscriptionId::MIN) + 1),
                default_response_timeout: builder.default_response_timeout,
                translate_no_responders: !builder.no_responders_disabled,
                max_pending_msgs: builder.max_pending_msgs,
                max_pending_bytes: builder.max_pending_bytes,
                reconnect_buffered: Arc::new(AtomicUsize::new(0)),
                reconnect_buf_size: builder.reconnect_buf_size,
                handler: tokio::spawn(async move {}),
            }),
        };
        let handler = TestHandler {
            receiver,
            info,
            status,
        };
        (this, handler)
    }

    /// Publish a new message to the server
    ///
    /// Consider calling [`Publish::client`] instead if you already have
    /// a [`Publish`] instance.
    #[must_use]
    pub fn publish(&self, subject: Subject) -> ClientPublish<'_> {
        ClientPublish::build(self, subject)
    }

    /// Publish a new request to the server and await its reply
    ///
    /// Consider calling [`Request::client`] instead if you already have
    /// a [`Request`] instance.
    #[must_use]
    pub fn request(&self, subject: Subject) -> ClientRequest<'_> {
        ClientRequest::build(self, subject)
    }

    /// Subscribe to the given filter subject
    ///
    /// Ask for all messages matching `filter_subject` to be delivered
    /// to the client. If `queue_group` is provided and multiple clients
    /// subscribe with the same [`QueueGroup`] value, the server
    /// delivers each message to only one of them.
    ///
    /// # Errors
    ///
    /// This returns an error if the client is closed.
    pub async fn subscribe(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, ClientClosedError> {
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| ClientClosedError)?;

        Ok(self.do_subscribe(permit, filter_subject, queue_group))
    }

    pub(crate) fn try_subscribe(
        &self,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscription, TryCommandError> {
        let permit = self
            .inner
            .sender
            .try_reserve()
            .map_err(|_| TryCommandError::BufferFull)?;

        Ok(self.do_subscribe(permit, filter_subject, queue_group))
    }

    fn do_subscribe(
        &self,
        permit: Permit<'_, HandlerCommand>,
        filter_subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Subscription {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::AcqRel)
            .into();
        if id == SubscriptionId::MAX {
            abort();
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(SubscriptionStats::new(
            self.inner.max_pending_msgs,
            self.inner.max_pending_bytes,
        ));

        permit.send(HandlerCommand::Subscribe {
            id,
            subject: filter_subject,
            queue_group,
            messages: sender,
            stats: Arc::clone(&stats),
        });
        Subscription::new(id, self.clone(), receiver, stats)
    }

    /// Send a PING and wait for the matching PONG
    ///
    /// A successful flush implies every command issued before the call
    /// has reached the server.
    ///
    /// # Errors
    ///
    /// It returns an error if the PONG doesn't arrive within `timeout`,
    /// if the connection drops mid-flush, or if the client is closed.
    pub async fn flush(&self, timeout: Duration) -> Result<(), FlushError> {
        let (sender, receiver) = oneshot::channel();
        self.enqueue_command(HandlerCommand::Flush { pong: sender })
            .await
            .map_err(FlushError::Closed)?;

        match tokio::time::timeout(timeout, receiver).await {
            Err(_) => Err(FlushError::TimedOut),
            Ok(Err(_)) => Err(FlushError::Disconnected),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Gracefully wind the client down
    ///
    /// Unsubscribes everything, waits for the subscription queues to
    /// be consumed, then for buffered publishes to reach the server,
    /// and finally closes the connection. `deadline` bounds the whole
    /// procedure; whatever hasn't drained by then is discarded.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is already closed.
    pub async fn drain(&self, deadline: Duration) -> Result<(), DrainError> {
        let (sender, receiver) = oneshot::channel();
        self.enqueue_command(HandlerCommand::Drain {
            deadline,
            done: sender,
        })
        .await
        .map_err(DrainError::Closed)?;

        let _ = receiver.await;
        Ok(())
    }

    /// Close this client, processing any already enqueued commands first
    ///
    /// Attempts to send commands after this method has been called
    /// result in a [`ClientClosedError`].
    pub async fn close(&self) {
        let (sender, receiver) = oneshot::channel();
        if self
            .enqueue_command(HandlerCommand::Close(sender))
            .await
            .is_err()
        {
            return;
        }

        let _ = receiver.await;
    }

    /// Get the last [`ServerInfo`] sent by the server
    #[must_use]
    pub fn server_info(&self) -> Arc<ServerInfo> {
        self.inner.info.load_full()
    }

    /// The current lifecycle state of the connection
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.inner.status.status()
    }

    /// Whether the server asked clients to migrate away
    #[must_use]
    pub fn is_lame_duck_mode(&self) -> bool {
        self.inner.status.is_lameduck()
    }

    /// The last error the server reported on this connection, if any
    #[must_use]
    pub fn last_server_error(&self) -> Option<Arc<ServerError>> {
        self.inner.last_error.load_full()
    }

    pub(crate) fn check_publish(
        &self,
        subject: &Subject,
        payload_len: usize,
    ) -> Result<(), PublishError> {
        if subject.has_wildcards() {
            return Err(PublishError::InvalidSubject);
        }

        let max = self.inner.info.load().max_payload.get() as usize;
        if payload_len > max {
            return Err(PublishError::MaxPayload {
                len: payload_len,
                max,
            });
        }

        match self.status() {
            ClientStatus::Closed | ClientStatus::DrainingPublishes => {
                Err(PublishError::Closed(ClientClosedError))
            }
            ClientStatus::Connecting | ClientStatus::Disconnected => {
                let buffered = self
                    .inner
                    .reconnect_buffered
                    .fetch_add(payload_len, Ordering::AcqRel);
                if buffered + payload_len > self.inner.reconnect_buf_size {
                    self.inner
                        .reconnect_buffered
                        .fetch_sub(payload_len, Ordering::AcqRel);
                    Err(PublishError::InsufficientBuffer)
                } else {
                    Ok(())
                }
            }
            ClientStatus::Connected | ClientStatus::DrainingSubscriptions => Ok(()),
        }
    }

    pub(super) async fn multiplexed_request(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<MultiplexedSubscription, ClientClosedError> {
        let permit = self
            .inner
            .sender
            .reserve()
            .await
            .map_err(|_| ClientClosedError)?;

        Ok(self.do_multiplexed_request(permit, subject, headers, payload))
    }

    pub(super) fn try_multiplexed_request(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<MultiplexedSubscription, TryCommandError> {
        let permit = self
            .inner
            .sender
            .try_reserve()
            .map_err(|_| TryCommandError::BufferFull)?;

        Ok(self.do_multiplexed_request(permit, subject, headers, payload))
    }

    fn do_multiplexed_request(
        &self,
        permit: Permit<'_, HandlerCommand>,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
    ) -> MultiplexedSubscription {
        let (sender, receiver) = oneshot::channel();

        let reply_subject = create_inbox_subject(&self.inner.request_inbox_prefix);

        permit.send(HandlerCommand::RequestMultiplexed {
            subject,
            reply_subject: reply_subject.clone(),
            headers,
            payload,
            reply: sender,
        });
        MultiplexedSubscription::new(reply_subject, receiver, self.clone())
    }

    /// Create a fresh connection-unique inbox subject
    pub(crate) fn create_inbox_subject(&self) -> Subject {
        create_inbox_subject(&self.inner.inbox_prefix)
    }

    pub(crate) fn default_response_timeout(&self) -> Duration {
        self.inner.default_response_timeout
    }

    pub(crate) fn translate_no_responders(&self) -> bool {
        self.inner.translate_no_responders
    }

    pub(crate) fn events(&self) -> &EventSender {
        &self.inner.events
    }

    pub(crate) fn lazy_unsubscribe_multiplexed(&self, reply_subject: Subject) {
        if self
            .try_enqueue_command(HandlerCommand::UnsubscribeMultiplexed { reply_subject })
            .is_ok()
        {
            return;
        }

        self.inner.status.store_is_failed_unsubscribe(true);
    }

    pub(crate) async fn unsubscribe(
        &self,
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    ) -> Result<(), ClientClosedError> {
        self.enqueue_command(HandlerCommand::Unsubscribe { id, max_messages })
            .await
    }

    pub(crate) fn lazy_unsubscribe(&self, id: SubscriptionId, max_messages: Option<NonZeroU64>) {
        if self
            .try_enqueue_command(HandlerCommand::Unsubscribe { id, max_messages })
            .is_ok()
        {
            return;
        }

        self.inner.status.store_is_failed_unsubscribe(true);
    }

    pub(crate) async fn enqueue_command(
        &self,
        cmd: HandlerCommand,
    ) -> Result<(), ClientClosedError> {
        self.inner
            .sender
            .send(cmd)
            .await
            .map_err(|_| ClientClosedError)
    }

    pub(crate) fn try_enqueue_command(&self, cmd: HandlerCommand) -> Result<(), TryCommandError> {
        self.inner
            .sender
            .try_send(cmd)
            .map_err(TryCommandError::from_try_send_error)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl TryCommandError {
    #[expect(
        clippy::needless_pass_by_value,
        reason = "this is an auxiliary conversion function"
    )]
    pub(crate) fn from_try_send_error<T>(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Self::BufferFull,
            TrySendError::Closed(_) => Self::Closed(ClientClosedError),
        }
    }
}

/// Derive a reply subject from `prefix` and a fresh random token
///
/// The token is 12 random bytes, base32 encoded. Tokens drawn for
/// concurrent requests on one connection are unique for any practical
/// purpose.
pub(crate) fn create_inbox_subject(prefix: &Subject) -> Subject {
    let mut token = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut token);
    let token = data_encoding::BASE32_NOPAD.encode(&token);

    let mut subject = String::with_capacity(prefix.len() + ".".len() + token.len());
    write!(&mut subject, "{prefix}.{token}").expect("infallible String write");
    Subject::from_dangerous_value(subject.into())
}
