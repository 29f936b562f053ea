use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    mem,
    num::NonZeroU64,
    ops::ControlFlow,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use cantaloupe_net::{connect_tcp, handshake, Connection, HandshakeError, ReadError};
use cantaloupe_proto::{
    error::ServerError,
    headers::HeaderMap,
    proto::{ClientOp, ServerOp},
    Connect, MessageBase, QueueGroup, ServerAddr, ServerInfo, ServerMessage, Subject,
    SubscriptionId,
};
use rand::Rng;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::{self, Instant, Sleep},
};

use crate::client::{
    AttemptError, Authentication, ClientBuilder, ClientError, ClientEvent, ClientStatus,
    ConnectError, Echo, EventSender, RawStatus, ServerPool,
};
use crate::subscription::{RouteOutcome, SubscriptionStats};

pub(crate) const MULTIPLEXED_SUBSCRIPTION_ID: SubscriptionId = SubscriptionId::MIN;
const RECV_BUF: usize = 16;
const DRAIN_TICK: Duration = Duration::from_millis(10);

/// The connection actor
///
/// Owns the socket and every piece of per-connection state. Driven as
/// a [`Future`] by the client task; resolves when the connection is
/// lost (the client task then recycles it through the reconnect path)
/// or when the client shuts down.
#[derive(Debug)]
pub(crate) struct Handler {
    conn: Connection<TcpStream>,
    pool: ServerPool,
    info: Arc<ArcSwap<ServerInfo>>,
    status: Arc<RawStatus>,
    events: EventSender,
    last_error: Arc<ArcSwapOption<ServerError>>,
    reconnect_buffered: Arc<AtomicUsize>,

    verbose: bool,
    fail_requests_on_disconnect: bool,
    ping_period: Duration,
    max_pings_out: usize,
    write_deadline: Option<Duration>,

    ping_timer: Pin<Box<Sleep>>,
    /// One entry per PING in flight; `Some` entries belong to `flush`
    /// callers and are resolved by the matching PONG
    ping_queue: VecDeque<Option<oneshot::Sender<()>>>,
    /// PINGs sent since the server last gave any sign of life
    unanswered_pings: usize,
    write_stall: Option<Pin<Box<Sleep>>>,

    commands: mpsc::Receiver<HandlerCommand>,
    recv_buf: Vec<HandlerCommand>,
    in_flight_commands: VecDeque<InFlightCommand>,

    request_inbox_prefix: Subject,
    /// `Some` once the shared request inbox subscription exists
    requests: Option<BTreeMap<Subject, oneshot::Sender<ServerMessage>>>,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionEntry>,

    drain: Option<DrainState>,
    shutting_down: bool,
    awaiting_close: Vec<oneshot::Sender<()>>,
}

/// The state that survives a disconnection
#[derive(Debug)]
pub(crate) struct RecycledHandler {
    commands: mpsc::Receiver<HandlerCommand>,
    pool: ServerPool,
    info: Option<Arc<ArcSwap<ServerInfo>>>,
    status: Arc<RawStatus>,
    events: EventSender,
    last_error: Arc<ArcSwapOption<ServerError>>,
    reconnect_buffered: Arc<AtomicUsize>,
    request_inbox_prefix: Subject,
    requests: Option<BTreeMap<Subject, oneshot::Sender<ServerMessage>>>,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionEntry>,
    /// Publishes accepted while disconnected, replayed on reconnect
    replay_buffer: Vec<MessageBase>,
    awaiting_close: Vec<oneshot::Sender<()>>,
    closed: bool,
}

#[derive(Debug)]
struct SubscriptionEntry {
    subject: Subject,
    queue_group: Option<QueueGroup>,
    messages: mpsc::UnboundedSender<Result<ServerMessage, ServerError>>,
    stats: Arc<SubscriptionStats>,
    /// Auto-unsubscribe cap, counted against `routed`
    max_messages: Option<NonZeroU64>,
    /// Messages the connection routed (delivered or dropped) to this
    /// subscription on the current server
    routed: u64,
    failed_subscribe: bool,
}

#[derive(Debug)]
pub(crate) enum HandlerCommand {
    Publish {
        message: MessageBase,
    },
    RequestMultiplexed {
        subject: Subject,
        reply_subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
        reply: oneshot::Sender<ServerMessage>,
    },
    UnsubscribeMultiplexed {
        reply_subject: Subject,
    },
    Subscribe {
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        messages: mpsc::UnboundedSender<Result<ServerMessage, ServerError>>,
        stats: Arc<SubscriptionStats>,
    },
    Unsubscribe {
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    },
    Flush {
        pong: oneshot::Sender<()>,
    },
    Drain {
        deadline: Duration,
        done: oneshot::Sender<()>,
    },
    Close(oneshot::Sender<()>),
}

#[derive(Debug)]
enum InFlightCommand {
    Unimportant,
    Subscribe { id: SubscriptionId },
}

#[derive(Debug)]
struct DrainState {
    phase: DrainPhase,
    deadline: Pin<Box<Sleep>>,
    tick: Pin<Box<Sleep>>,
    done: Vec<oneshot::Sender<()>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DrainPhase {
    Subscriptions,
    Publishes,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum HandlerOutput {
    Disconnected,
    Closed,
}

impl RecycledHandler {
    pub(crate) fn new(
        commands: mpsc::Receiver<HandlerCommand>,
        pool: ServerPool,
        status: Arc<RawStatus>,
        events: EventSender,
        last_error: Arc<ArcSwapOption<ServerError>>,
        reconnect_buffered: Arc<AtomicUsize>,
        request_inbox_prefix: Subject,
    ) -> Self {
        Self {
            commands,
            pool,
            info: None,
            status,
            events,
            last_error,
            reconnect_buffered,
            request_inbox_prefix,
            requests: None,
            subscriptions: BTreeMap::new(),
            replay_buffer: Vec::new(),
            awaiting_close: Vec::new(),
            closed: false,
        }
    }

    /// Sleep for `wait` while applying commands to the offline state
    async fn buffer_commands_for(&mut self, wait: Duration) {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.closed {
                return;
            }

            match time::timeout(remaining, self.commands.recv()).await {
                Err(_elapsed) => return,
                Ok(Some(cmd)) => self.buffer_command(cmd),
                Ok(None) => {
                    self.closed = true;
                    return;
                }
            }
        }
    }

    fn buffer_command(&mut self, cmd: HandlerCommand) {
        match cmd {
            HandlerCommand::Publish { message } => self.replay_buffer.push(message),
            HandlerCommand::RequestMultiplexed {
                subject,
                reply_subject,
                headers,
                payload,
                reply,
            } => {
                self.requests
                    .get_or_insert_with(BTreeMap::new)
                    .insert(reply_subject.clone(), reply);
                self.replay_buffer.push(MessageBase {
                    subject,
                    reply_subject: Some(reply_subject),
                    headers,
                    payload,
                });
            }
            HandlerCommand::UnsubscribeMultiplexed { reply_subject } => {
                if let Some(requests) = &mut self.requests {
                    requests.remove(&reply_subject);
                }
            }
            HandlerCommand::Subscribe {
                id,
                subject,
                queue_group,
                messages,
                stats,
            } => {
                self.subscriptions.insert(
                    id,
                    SubscriptionEntry {
                        subject,
                        queue_group,
                        messages,
                        stats,
                        max_messages: None,
                        routed: 0,
                        failed_subscribe: false,
                    },
                );
            }
            HandlerCommand::Unsubscribe {
                id,
                max_messages: Some(max_messages),
            } => {
                if let Some(subscription) = self.subscriptions.get_mut(&id) {
                    subscription.max_messages = Some(max_messages);
                }
            }
            HandlerCommand::Unsubscribe {
                id,
                max_messages: None,
            } => {
                self.subscriptions.remove(&id);
            }
            // The flush waiter observes a `Disconnected` error
            HandlerCommand::Flush { pong: _ } => {}
            HandlerCommand::Drain { deadline: _, done } => {
                // Nothing to drain while disconnected
                let _ = done.send(());
                self.closed = true;
            }
            HandlerCommand::Close(sender) => {
                self.awaiting_close.push(sender);
                self.closed = true;
            }
        }
    }
}

impl Handler {
    /// Walk the server list once, in order
    ///
    /// Fails with `NoServersAvailable` only after every server failed.
    pub(crate) async fn initial_connect(
        builder: &ClientBuilder,
        mut recycle: RecycledHandler,
    ) -> Result<Self, (ConnectError, RecycledHandler)> {
        let servers = recycle.pool.len();
        if servers == 0 {
            return Err((ConnectError::EmptyServerList, recycle));
        }

        let mut last_error = None;
        for _ in 0..servers {
            let Some(addr) = recycle.pool.current().cloned() else {
                break;
            };

            match Self::try_connect(builder, recycle, &addr).await {
                Ok(handler) => return Ok(handler),
                Err((err, prev_recycle)) => {
                    recycle = prev_recycle;
                    tracing::warn!(addr = %addr, error = %err, "connection attempt failed");

                    if matches!(&err, AttemptError::Handshake(HandshakeError::Authorization)) {
                        recycle.pool.remove_current();
                    } else {
                        recycle.pool.rotate();
                    }
                    last_error = Some(err);
                }
            }
        }

        let last_error = last_error.expect("at least one attempt was made");
        Err((
            ConnectError::NoServersAvailable(Box::new(last_error)),
            recycle,
        ))
    }

    /// Keep trying servers in rotation until one accepts us or the
    /// pool is exhausted
    ///
    /// Waits `reconnect_wait` plus a random jitter before each
    /// attempt. Commands issued meanwhile are applied to the offline
    /// state and replayed on success.
    pub(crate) async fn reconnect(
        builder: &ClientBuilder,
        mut recycle: RecycledHandler,
    ) -> Result<Self, RecycledHandler> {
        if !builder.allow_reconnect {
            return Err(recycle);
        }

        loop {
            if recycle.closed {
                return Err(recycle);
            }
            let Some(addr) = recycle.pool.current().cloned() else {
                return Err(recycle);
            };

            let jitter = match addr.security() {
                cantaloupe_proto::Security::Tls => builder.reconnect_jitter_tls,
                cantaloupe_proto::Security::PossiblyPlain => builder.reconnect_jitter,
            };
            recycle
                .buffer_commands_for(builder.reconnect_wait + random_duration(jitter))
                .await;
            if recycle.closed {
                return Err(recycle);
            }

            tracing::info!(addr = %addr, "attempting reconnect");
            match Self::try_connect(builder, recycle, &addr).await {
                Ok(handler) => return Ok(handler),
                Err((err, prev_recycle)) => {
                    recycle = prev_recycle;
                    tracing::warn!(addr = %addr, error = %err, "reconnect attempt failed");

                    if matches!(&err, AttemptError::Handshake(HandshakeError::Authorization)) {
                        recycle.pool.remove_current();
                    } else {
                        recycle.pool.mark_failure();
                    }
                }
            }
        }
    }

    async fn try_connect(
        builder: &ClientBuilder,
        recycle: RecycledHandler,
        addr: &ServerAddr,
    ) -> Result<Self, (AttemptError, RecycledHandler)> {
        let attempt = async {
            let socket = connect_tcp(addr).await.map_err(AttemptError::Io)?;
            let mut conn = Connection::new(socket);
            let connect = build_connect(builder);
            let info = handshake(&mut conn, addr, connect)
                .await
                .map_err(AttemptError::Handshake)?;
            Ok::<_, AttemptError>((conn, info))
        };

        match time::timeout(builder.connect_timeout, attempt).await {
            Err(_elapsed) => Err((AttemptError::TimedOut, recycle)),
            Ok(Err(err)) => Err((err, recycle)),
            Ok(Ok((conn, info))) => Ok(Self::finish_connect(builder, recycle, conn, info)),
        }
    }

    fn finish_connect(
        builder: &ClientBuilder,
        recycle: RecycledHandler,
        mut conn: Connection<TcpStream>,
        info: Box<ServerInfo>,
    ) -> Self {
        let RecycledHandler {
            commands,
            mut pool,
            info: prev_info,
            status,
            events,
            last_error,
            reconnect_buffered,
            request_inbox_prefix,
            requests,
            mut subscriptions,
            replay_buffer,
            awaiting_close,
            closed,
        } = recycle;

        pool.reset_current();
        pool.merge_discovered(&info.connect_urls);
        status.store_is_lameduck(info.lame_duck_mode);

        let info = match prev_info {
            Some(arc) => {
                arc.store(Arc::new(*info));
                arc
            }
            None => Arc::new(ArcSwap::from_pointee(*info)),
        };

        let verbose = builder.verbose;
        let mut in_flight_commands = VecDeque::new();
        let mut track = |in_flight_commands: &mut VecDeque<InFlightCommand>, cmd| {
            if verbose {
                in_flight_commands.push_back(cmd);
            }
        };

        if requests.is_some() {
            track(
                &mut in_flight_commands,
                InFlightCommand::Subscribe {
                    id: MULTIPLEXED_SUBSCRIPTION_ID,
                },
            );
            conn.enqueue_write_op(&ClientOp::Subscribe {
                id: MULTIPLEXED_SUBSCRIPTION_ID,
                subject: Subject::from_dangerous_value(
                    format!("{request_inbox_prefix}.*").into(),
                ),
                queue_group: None,
            });
        }

        // Replay every surviving subscription, re-arming residual
        // auto-unsubscribe caps
        subscriptions.retain(|&id, subscription| {
            let remaining = match subscription.max_messages {
                Some(max) => match NonZeroU64::new(max.get().saturating_sub(subscription.routed)) {
                    Some(remaining) => Some(remaining),
                    None => return false,
                },
                None => None,
            };

            track(&mut in_flight_commands, InFlightCommand::Subscribe { id });
            conn.enqueue_write_op(&ClientOp::Subscribe {
                id,
                subject: subscription.subject.clone(),
                queue_group: subscription.queue_group.clone(),
            });

            if let Some(remaining) = remaining {
                track(&mut in_flight_commands, InFlightCommand::Unimportant);
                conn.enqueue_write_op(&ClientOp::Unsubscribe {
                    id,
                    max_messages: Some(remaining),
                });
            }
            true
        });

        for message in replay_buffer {
            track(&mut in_flight_commands, InFlightCommand::Unimportant);
            conn.enqueue_write_op(&ClientOp::Publish { message });
        }
        reconnect_buffered.store(0, Ordering::Release);

        status.store_status(ClientStatus::Connected);

        Self {
            conn,
            pool,
            info,
            status,
            events,
            last_error,
            reconnect_buffered,
            verbose,
            fail_requests_on_disconnect: builder.fail_requests_on_disconnect,
            ping_period: builder.ping_interval,
            max_pings_out: builder.max_pings_out,
            write_deadline: builder.write_deadline,
            ping_timer: Box::pin(time::sleep(builder.ping_interval)),
            ping_queue: VecDeque::new(),
            unanswered_pings: 0,
            write_stall: None,
            commands,
            recv_buf: Vec::with_capacity(RECV_BUF),
            in_flight_commands,
            request_inbox_prefix,
            requests,
            subscriptions,
            drain: None,
            shutting_down: closed,
            awaiting_close,
        }
    }

    pub(crate) async fn recycle(mut self) -> RecycledHandler {
        let _ = self.conn.shutdown().await;

        // Flush waiters observe `Disconnected` through their dropped senders
        self.ping_queue.clear();

        let requests = if self.fail_requests_on_disconnect {
            // Waiters fail immediately instead of running out their timeout
            None
        } else {
            self.requests
        };

        RecycledHandler {
            commands: self.commands,
            pool: self.pool,
            info: Some(self.info),
            status: self.status,
            events: self.events,
            last_error: self.last_error,
            reconnect_buffered: self.reconnect_buffered,
            request_inbox_prefix: self.request_inbox_prefix,
            requests,
            subscriptions: self.subscriptions,
            replay_buffer: Vec::new(),
            awaiting_close: self.awaiting_close,
            closed: self.shutting_down || self.drain.is_some(),
        }
    }

    pub(crate) fn info(&self) -> &Arc<ArcSwap<ServerInfo>> {
        &self.info
    }

    fn handle_server_op(&mut self, server_op: ServerOp) -> ControlFlow<HandlerOutput, ()> {
        match server_op {
            ServerOp::Message { message }
                if message.subscription_id == MULTIPLEXED_SUBSCRIPTION_ID =>
            {
                if let Some(requests) = &mut self.requests {
                    if let Some(reply) = requests.remove(&message.base.subject) {
                        let _ = reply.send(message);
                    }
                    // A reply with no waiter is dropped silently
                }
            }
            ServerOp::Message { message } => {
                let subscription_id = message.subscription_id;

                if let Some(subscription) = self.subscriptions.get_mut(&subscription_id) {
                    if subscription.messages.is_closed() {
                        if self.verbose {
                            self.in_flight_commands
                                .push_back(InFlightCommand::Unimportant);
                        }
                        self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                            id: subscription_id,
                            max_messages: None,
                        });
                        self.subscriptions.remove(&subscription_id);
                        return ControlFlow::Continue(());
                    }

                    match subscription.stats.try_route(message.base.payload.len()) {
                        RouteOutcome::Route => {
                            let _ = subscription.messages.send(Ok(message));
                        }
                        RouteOutcome::Drop { notify } => {
                            tracing::warn!(
                                subscription = %subscription_id,
                                "pending limits exceeded, dropping message"
                            );
                            if notify {
                                self.events.send(ClientEvent::Error(ClientError::SlowConsumer {
                                    subscription_id,
                                }));
                            }
                        }
                    }

                    subscription.routed += 1;
                    if subscription
                        .max_messages
                        .is_some_and(|max| subscription.routed >= max.get())
                    {
                        self.subscriptions.remove(&subscription_id);
                    }
                }
            }
            ServerOp::Ok => {
                if self.verbose {
                    let _ = self.in_flight_commands.pop_front();
                }
            }
            ServerOp::Error { error } => {
                self.last_error.store(Some(Arc::new(error.clone())));

                if error.is_fatal() == Some(false) {
                    if self.verbose {
                        if let Some(InFlightCommand::Subscribe { id }) =
                            self.in_flight_commands.pop_front()
                        {
                            self.fail_subscription(id, &error);
                        }
                    }
                    self.events
                        .send(ClientEvent::Error(ClientError::ServerError(error)));
                } else {
                    tracing::error!(error = %error, "fatal server error");
                    self.events
                        .send(ClientEvent::Error(ClientError::ServerError(error)));
                    return ControlFlow::Break(HandlerOutput::Disconnected);
                }
            }
            ServerOp::Ping => {
                self.conn.enqueue_write_op(&ClientOp::Pong);
            }
            ServerOp::Pong => {
                if let Some(Some(waiter)) = self.ping_queue.pop_front() {
                    let _ = waiter.send(());
                }
            }
            ServerOp::Info { info } => {
                self.status.store_is_lameduck(info.lame_duck_mode);
                self.pool.merge_discovered(&info.connect_urls);
                // Changed TLS hints only affect future reconnects
                self.info.store(Arc::new(*info));
            }
        }

        ControlFlow::Continue(())
    }

    fn fail_subscription(&mut self, id: SubscriptionId, error: &ServerError) {
        if let Some(mut subscription) = self.subscriptions.remove(&id) {
            if subscription.messages.send(Err(error.clone())).is_err() {
                // Receiver is gone; remember to confirm the removal
                subscription.failed_subscribe = true;
                self.subscriptions.insert(id, subscription);
                self.status.store_is_failed_unsubscribe(true);
            }
        }
    }

    #[cold]
    fn sweep_failed_unsubscribes(&mut self) {
        self.status.store_is_failed_unsubscribe(false);

        if let Some(requests) = &mut self.requests {
            requests.retain(|_subject, sender| !sender.is_closed());
        }

        let closed_subscription_ids = self
            .subscriptions
            .iter()
            .filter(|(_id, subscription)| {
                subscription.messages.is_closed() || subscription.failed_subscribe
            })
            .map(|(&id, _subscription)| id)
            .collect::<Vec<_>>();

        for id in closed_subscription_ids {
            if self.verbose {
                self.in_flight_commands
                    .push_back(InFlightCommand::Unimportant);
            }
            self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                id,
                max_messages: None,
            });
            self.subscriptions.remove(&id);
        }
    }

    fn reset_ping_timer(&mut self) {
        Sleep::reset(self.ping_timer.as_mut(), Instant::now() + self.ping_period);
    }

    fn ensure_request_inbox(&mut self) {
        if self.requests.is_some() {
            return;
        }

        if self.verbose {
            self.in_flight_commands
                .push_back(InFlightCommand::Subscribe {
                    id: MULTIPLEXED_SUBSCRIPTION_ID,
                });
        }
        self.conn.enqueue_write_op(&ClientOp::Subscribe {
            id: MULTIPLEXED_SUBSCRIPTION_ID,
            subject: Subject::from_dangerous_value(
                format!("{}.*", self.request_inbox_prefix).into(),
            ),
            queue_group: None,
        });
        self.requests = Some(BTreeMap::new());
    }

    fn apply_command(&mut self, cmd: HandlerCommand) {
        match cmd {
            HandlerCommand::Publish { message } => {
                if self.verbose {
                    self.in_flight_commands
                        .push_back(InFlightCommand::Unimportant);
                }
                self.conn.enqueue_write_op(&ClientOp::Publish { message });
            }
            HandlerCommand::RequestMultiplexed {
                subject,
                reply_subject,
                headers,
                payload,
                reply,
            } => {
                debug_assert!(reply_subject.starts_with(&*self.request_inbox_prefix));

                self.ensure_request_inbox();
                self.requests
                    .as_mut()
                    .expect("request inbox initialized")
                    .insert(reply_subject.clone(), reply);

                if self.verbose {
                    self.in_flight_commands
                        .push_back(InFlightCommand::Unimportant);
                }
                self.conn.enqueue_write_op(&ClientOp::Publish {
                    message: MessageBase {
                        subject,
                        reply_subject: Some(reply_subject),
                        headers,
                        payload,
                    },
                });
            }
            HandlerCommand::UnsubscribeMultiplexed { reply_subject } => {
                if let Some(requests) = &mut self.requests {
                    let _ = requests.remove(&reply_subject);
                }
            }
            HandlerCommand::Subscribe {
                id,
                subject,
                queue_group,
                messages,
                stats,
            } => {
                if self.drain.is_some() || self.shutting_down {
                    // Dropping the sender terminates the subscription
                    return;
                }

                self.subscriptions.insert(
                    id,
                    SubscriptionEntry {
                        subject: subject.clone(),
                        queue_group: queue_group.clone(),
                        messages,
                        stats,
                        max_messages: None,
                        routed: 0,
                        failed_subscribe: false,
                    },
                );
                if self.verbose {
                    self.in_flight_commands
                        .push_back(InFlightCommand::Subscribe { id });
                }
                self.conn.enqueue_write_op(&ClientOp::Subscribe {
                    id,
                    subject,
                    queue_group,
                });
            }
            HandlerCommand::Unsubscribe {
                id,
                max_messages: Some(max_messages),
            } => {
                if let Some(subscription) = self.subscriptions.get_mut(&id) {
                    if subscription.routed >= max_messages.get() {
                        self.subscriptions.remove(&id);
                        if self.verbose {
                            self.in_flight_commands
                                .push_back(InFlightCommand::Unimportant);
                        }
                        self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                            id,
                            max_messages: None,
                        });
                        return;
                    }

                    subscription.max_messages = Some(max_messages);
                    if self.verbose {
                        self.in_flight_commands
                            .push_back(InFlightCommand::Unimportant);
                    }
                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                        id,
                        max_messages: Some(max_messages),
                    });
                }
            }
            HandlerCommand::Unsubscribe {
                id,
                max_messages: None,
            } => {
                if self.subscriptions.remove(&id).is_some() {
                    if self.verbose {
                        self.in_flight_commands
                            .push_back(InFlightCommand::Unimportant);
                    }
                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                        id,
                        max_messages: None,
                    });
                }
            }
            HandlerCommand::Flush { pong } => {
                self.conn.enqueue_write_op(&ClientOp::Ping);
                self.ping_queue.push_back(Some(pong));
                self.unanswered_pings += 1;
            }
            HandlerCommand::Drain { deadline, done } => {
                if let Some(drain) = &mut self.drain {
                    drain.done.push(done);
                    return;
                }

                self.status
                    .store_status(ClientStatus::DrainingSubscriptions);
                let ids = self.subscriptions.keys().copied().collect::<Vec<_>>();
                for id in ids {
                    if self.verbose {
                        self.in_flight_commands
                            .push_back(InFlightCommand::Unimportant);
                    }
                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                        id,
                        max_messages: None,
                    });
                }

                self.drain = Some(DrainState {
                    phase: DrainPhase::Subscriptions,
                    deadline: Box::pin(time::sleep(deadline)),
                    tick: Box::pin(time::sleep(DRAIN_TICK)),
                    done: vec![done],
                });
            }
            HandlerCommand::Close(sender) => {
                self.shutting_down = true;
                self.awaiting_close.push(sender);
                self.commands.close();
            }
        }
    }

    fn receive_commands(&mut self, cx: &mut Context<'_>) -> ReceiveOutcome {
        while self.conn.may_enqueue_more_ops() {
            debug_assert!(self.recv_buf.is_empty());

            match self
                .commands
                .poll_recv_many(cx, &mut self.recv_buf, RECV_BUF)
            {
                Poll::Pending => return ReceiveOutcome::NoMoreCommands,
                Poll::Ready(0) => {
                    // Every client handle is gone
                    self.shutting_down = true;
                    return ReceiveOutcome::NoMoreCommands;
                }
                Poll::Ready(1..) => {
                    let mut buf = mem::take(&mut self.recv_buf);
                    for cmd in buf.drain(..) {
                        self.apply_command(cmd);
                    }
                    self.recv_buf = buf;
                }
            }
        }

        ReceiveOutcome::NoMoreSpace
    }

    /// Map a fatal connection outcome through the shutdown flag
    fn teardown_output(&self) -> HandlerOutput {
        if self.shutting_down {
            HandlerOutput::Closed
        } else {
            HandlerOutput::Disconnected
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum ReceiveOutcome {
    NoMoreCommands,
    NoMoreSpace,
}

impl Future for Handler {
    type Output = HandlerOutput;

    #[expect(clippy::too_many_lines)]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.ping_timer.as_mut().poll(cx).is_ready() {
            if this.unanswered_pings >= this.max_pings_out {
                tracing::warn!("server stopped answering pings, marking the connection stale");
                this.events
                    .send(ClientEvent::Error(ClientError::StaleConnection));
                return Poll::Ready(this.teardown_output());
            }

            loop {
                this.reset_ping_timer();
                if this.ping_timer.as_mut().poll(cx).is_pending() {
                    break;
                }
            }
            this.conn.enqueue_write_op(&ClientOp::Ping);
            this.ping_queue.push_back(None);
            this.unanswered_pings += 1;
        }

        if this.status.is_failed_unsubscribe() {
            this.sweep_failed_unsubscribes();
        }

        let mut handled_server_op = false;
        loop {
            match this.conn.poll_read_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Ok(server_op)) => {
                    handled_server_op = true;
                    if let ControlFlow::Break(output) = this.handle_server_op(server_op) {
                        return Poll::Ready(if this.shutting_down {
                            HandlerOutput::Closed
                        } else {
                            output
                        });
                    }
                }
                Poll::Ready(Err(ReadError::Protocol(err))) => {
                    tracing::error!(error = %err, "protocol violation, tearing the connection down");
                    return Poll::Ready(this.teardown_output());
                }
                Poll::Ready(Err(ReadError::Io(err))) => {
                    tracing::debug!(error = %err, "read failed");
                    return Poll::Ready(this.teardown_output());
                }
            }
        }
        if handled_server_op {
            // Any traffic from the server counts as liveness
            this.unanswered_pings = 0;
            this.reset_ping_timer();
        }

        loop {
            let receive_outcome = this.receive_commands(cx);

            let mut write_blocked = false;
            while this.conn.may_write() {
                match this.conn.poll_write_next(cx) {
                    Poll::Pending => {
                        write_blocked = true;
                        break;
                    }
                    Poll::Ready(Ok(_n)) => {
                        this.write_stall = None;
                    }
                    Poll::Ready(Err(_err)) => return Poll::Ready(this.teardown_output()),
                }
            }

            match (receive_outcome, write_blocked) {
                (ReceiveOutcome::NoMoreCommands, _) | (ReceiveOutcome::NoMoreSpace, true) => break,
                (ReceiveOutcome::NoMoreSpace, false) => {
                    // Writing made space; go receive the rest
                }
            }
        }

        if this.conn.should_flush() {
            match this.conn.poll_flush(cx) {
                Poll::Pending | Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(_err)) => return Poll::Ready(this.teardown_output()),
            }
        }

        if let Some(deadline) = this.write_deadline {
            if this.conn.may_write() || this.conn.should_flush() {
                let stall = this
                    .write_stall
                    .get_or_insert_with(|| Box::pin(time::sleep(deadline)));
                if stall.as_mut().poll(cx).is_ready() {
                    tracing::warn!("write deadline elapsed, tearing the connection down");
                    return Poll::Ready(this.teardown_output());
                }
            } else {
                this.write_stall = None;
            }
        }

        let mut drain_finished = false;
        if let Some(drain) = &mut this.drain {
            let deadline_hit = drain.deadline.as_mut().poll(cx).is_ready();
            if drain.tick.as_mut().poll(cx).is_ready() {
                Sleep::reset(drain.tick.as_mut(), Instant::now() + DRAIN_TICK);
            }

            match drain.phase {
                DrainPhase::Subscriptions => {
                    let consumed = this
                        .subscriptions
                        .values()
                        .all(|subscription| subscription.stats.pending_msgs() == 0);
                    if consumed || deadline_hit {
                        // End the subscription streams
                        this.subscriptions.clear();
                        drain.phase = DrainPhase::Publishes;
                        this.status.store_status(ClientStatus::DrainingPublishes);
                    }
                }
                DrainPhase::Publishes => {
                    let written = !this.conn.may_write() && !this.conn.should_flush();
                    if written || deadline_hit {
                        drain_finished = true;
                    }
                }
            }
        }
        if drain_finished {
            if let Some(mut drain) = this.drain.take() {
                for done in drain.done.drain(..) {
                    let _ = done.send(());
                }
            }
            this.shutting_down = true;
        }

        if this.shutting_down && !this.conn.may_write() && !this.conn.should_flush() {
            Poll::Ready(HandlerOutput::Closed)
        } else {
            Poll::Pending
        }
    }
}

fn build_connect(builder: &ClientBuilder) -> Box<Connect> {
    let mut connect = Connect {
        verbose: builder.verbose,
        pedantic: builder.pedantic,
        require_tls: false,
        auth_token: None,
        username: None,
        password: None,
        client_name: builder.client_name.clone(),
        client_lang: "rust-cantaloupe",
        client_version: env!("CARGO_PKG_VERSION"),
        protocol: 1,
        echo: matches!(builder.echo, Echo::Allow),
        signature: None,
        jwt: None,
        supports_no_responders: !builder.no_responders_disabled,
        supports_headers: true,
        nkey: None,
    };

    match &builder.auth {
        Some(Authentication::UserAndPassword { username, password }) => {
            connect.username = Some(username.clone());
            connect.password = Some(password.clone());
        }
        Some(Authentication::Token(token)) => {
            connect.auth_token = Some(token.clone());
        }
        None => {}
    }

    Box::new(connect)
}

fn random_duration(bound: Duration) -> Duration {
    if bound.is_zero() {
        return Duration::ZERO;
    }

    rand::thread_rng().gen_range(Duration::ZERO..=bound)
}
