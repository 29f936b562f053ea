use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use cantaloupe_proto::{
    error::ServerError, headers::HeaderName, QueueGroup, ServerMessage, StatusCode, Subject,
};
use tokio::{
    task::JoinHandle,
    time::{self, Instant},
};

use crate::client::{ClientClosedError, ClientError, ClientEvent, PublishError};
use crate::subscription::Subscription;

use super::{
    ack::AckMetadata,
    consumer::{
        ConsumerConfig, ConsumerInfo, CreateConsumerRequest, DeleteResponse, NextRequest,
        StreamNamesRequest, StreamNamesResponse,
    },
    AckPolicy, DeliverPolicy, ErrorCode, JetStreamContext, JetStreamMessage, RequestError,
};

/// Options for binding or creating a JetStream consumer
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    stream: Option<String>,
    durable: Option<String>,
    queue_group: Option<QueueGroup>,
    deliver_subject: Option<Subject>,
    bind: bool,
    ack_policy: AckPolicy,
    ack_wait: Option<Duration>,
    max_deliver: Option<i64>,
    idle_heartbeat: Option<Duration>,
    flow_control: bool,
    deliver_policy: DeliverPolicy,
}

impl SubscribeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this stream instead of looking one up by subject
    #[must_use]
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Bind to or create a durable consumer with this name
    #[must_use]
    pub fn durable(mut self, durable: impl Into<String>) -> Self {
        self.durable = Some(durable.into());
        self
    }

    /// Join the given delivery group
    #[must_use]
    pub fn queue_group(mut self, queue_group: QueueGroup) -> Self {
        self.queue_group = Some(queue_group);
        self
    }

    /// Use a caller-provided delivery subject instead of a fresh inbox
    #[must_use]
    pub fn deliver_subject(mut self, deliver_subject: Subject) -> Self {
        self.deliver_subject = Some(deliver_subject);
        self
    }

    /// Require the consumer to already exist
    #[must_use]
    pub fn bind(mut self, bind: bool) -> Self {
        self.bind = bind;
        self
    }

    #[must_use]
    pub fn ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    #[must_use]
    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = Some(ack_wait);
        self
    }

    #[must_use]
    pub fn max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    /// Ask the server for idle heartbeats at this interval
    ///
    /// A heartbeat missing for two intervals is reported through the
    /// asynchronous error callback as a missed heartbeat.
    #[must_use]
    pub fn idle_heartbeat(mut self, idle_heartbeat: Duration) -> Self {
        self.idle_heartbeat = Some(idle_heartbeat);
        self
    }

    /// Ask the server to pace deliveries through flow control messages
    #[must_use]
    pub fn flow_control(mut self, flow_control: bool) -> Self {
        self.flow_control = flow_control;
        self
    }

    #[must_use]
    pub fn deliver_policy(mut self, deliver_policy: DeliverPolicy) -> Self {
        self.deliver_policy = deliver_policy;
        self
    }
}

/// An error encountered while establishing a JetStream subscription
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("api request failed")]
    Request(#[source] RequestError),
    /// No stream matches the subject
    #[error("no stream matches the subject")]
    StreamNotFound,
    /// The subject is served by more than one stream
    #[error("multiple streams match the subject")]
    MultipleStreams,
    /// `bind` was requested but the consumer doesn't exist
    #[error("consumer not found")]
    ConsumerNotFound,
    /// The existing consumer filters a different subject
    #[error("the consumer's filter subject doesn't match")]
    FilterMismatch,
    /// A push subscription was requested against a pull consumer, or
    /// the other way around
    #[error("the consumer's delivery kind doesn't match")]
    DeliveryKindMismatch,
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// An error encountered while receiving from a push consumer
#[derive(Debug, thiserror::Error)]
pub enum NextError {
    /// No message arrived within the timeout
    #[error("no message within the timeout window")]
    TimedOut,
    /// The subscription was closed
    #[error("subscription closed")]
    Closed,
    /// The consumer observed a gap in the delivered sequence
    ///
    /// Clears once the server's reported sequence matches again.
    #[error("sequence mismatch")]
    SequenceMismatch,
    #[error("server error")]
    Server(#[source] ServerError),
}

/// An error encountered while fetching from a pull consumer
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// No message arrived before the timeout or pull expiry
    #[error("no messages within the timeout window")]
    TimedOut,
    #[error("couldn't publish the pull request")]
    Publish(#[source] PublishError),
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

impl JetStreamContext {
    /// Create a push subscription on `subject`
    ///
    /// The backing stream is resolved by name or by subject lookup,
    /// and the consumer is bound when it already exists or created
    /// otherwise. Consumers created here without a durable name or
    /// queue group are deleted again by
    /// [`PushSubscription::unsubscribe`].
    ///
    /// # Errors
    ///
    /// It returns an error if stream or consumer resolution fails or
    /// if the client is closed.
    pub async fn subscribe(
        &self,
        subject: Subject,
        options: SubscribeOptions,
    ) -> Result<PushSubscription, SubscribeError> {
        let stream = self.resolve_stream(&subject, &options).await?;

        let (info, created, subscription) = match self
            .existing_consumer(&stream, &options)
            .await?
        {
            Some(info) => {
                let deliver_subject = info
                    .config
                    .deliver_subject
                    .clone()
                    .ok_or(SubscribeError::DeliveryKindMismatch)?;
                validate_binding(&info, &subject)?;

                let subscription = self
                    .client()
                    .subscribe(deliver_subject, options.queue_group.clone())
                    .await
                    .map_err(SubscribeError::Closed)?;
                (info, false, subscription)
            }
            None => {
                // Subscribe before creating the consumer so the first
                // deliveries can't be missed
                let deliver_subject = options
                    .deliver_subject
                    .clone()
                    .unwrap_or_else(|| self.client().create_inbox_subject());
                let subscription = self
                    .client()
                    .subscribe(deliver_subject.clone(), options.queue_group.clone())
                    .await
                    .map_err(SubscribeError::Closed)?;

                let info = self
                    .create_consumer(&stream, &subject, &options, Some(deliver_subject))
                    .await?;
                (info, true, subscription)
            }
        };

        let tracking = Arc::new(SequenceTracking {
            consumer_seq: AtomicU64::new(info.delivered.consumer_seq),
            mismatch: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        });

        let heartbeat_task = info.config.idle_heartbeat.map(|interval| {
            spawn_heartbeat_watchdog(
                self.clone(),
                info.stream_name.clone(),
                info.name.clone(),
                Arc::downgrade(&tracking),
                interval,
            )
        });

        let delete_on_unsubscribe =
            created && options.durable.is_none() && options.queue_group.is_none();

        Ok(PushSubscription {
            subscription,
            context: self.clone(),
            stream: info.stream_name,
            consumer: info.name,
            tracking,
            heartbeat_task,
            delete_on_unsubscribe,
        })
    }

    /// Create a pull subscription on `subject`
    ///
    /// Messages are requested explicitly through
    /// [`PullSubscription::fetch`].
    ///
    /// # Errors
    ///
    /// It returns an error if stream or consumer resolution fails or
    /// if the client is closed.
    pub async fn pull_subscribe(
        &self,
        subject: Subject,
        options: SubscribeOptions,
    ) -> Result<PullSubscription, SubscribeError> {
        let stream = self.resolve_stream(&subject, &options).await?;

        let (info, created) = match self.existing_consumer(&stream, &options).await? {
            Some(info) => {
                if info.config.deliver_subject.is_some() {
                    return Err(SubscribeError::DeliveryKindMismatch);
                }
                validate_binding(&info, &subject)?;
                (info, false)
            }
            None => {
                let info = self
                    .create_consumer(&stream, &subject, &options, None)
                    .await?;
                (info, true)
            }
        };

        let inbox = self.client().create_inbox_subject();
        let subscription = self
            .client()
            .subscribe(inbox.clone(), None)
            .await
            .map_err(SubscribeError::Closed)?;

        let delete_on_unsubscribe =
            created && options.durable.is_none() && options.queue_group.is_none();

        Ok(PullSubscription {
            subscription,
            inbox,
            context: self.clone(),
            stream: info.stream_name,
            consumer: info.name,
            delete_on_unsubscribe,
        })
    }

    async fn resolve_stream(
        &self,
        subject: &Subject,
        options: &SubscribeOptions,
    ) -> Result<String, SubscribeError> {
        if let Some(stream) = &options.stream {
            return Ok(stream.clone());
        }

        let payload = serde_json::to_vec(&StreamNamesRequest { subject })
            .expect("serialize StreamNamesRequest");
        let response: StreamNamesResponse = self
            .api_request("STREAM.NAMES", payload.into())
            .await
            .map_err(from_request_error)?;

        let mut streams = response.streams.unwrap_or_default();
        match streams.len() {
            0 => Err(SubscribeError::StreamNotFound),
            1 => Ok(streams.remove(0)),
            _ => Err(SubscribeError::MultipleStreams),
        }
    }

    /// Look the consumer up by name, when one was provided
    async fn existing_consumer(
        &self,
        stream: &str,
        options: &SubscribeOptions,
    ) -> Result<Option<ConsumerInfo>, SubscribeError> {
        let Some(durable) = &options.durable else {
            return Ok(None);
        };

        match self
            .api_request::<ConsumerInfo>(
                &format!("CONSUMER.INFO.{stream}.{durable}"),
                Bytes::new(),
            )
            .await
        {
            Ok(info) => Ok(Some(info)),
            Err(RequestError::Api(err)) if err.err_code == ErrorCode::CONSUMER_NOT_FOUND => {
                if options.bind {
                    Err(SubscribeError::ConsumerNotFound)
                } else {
                    Ok(None)
                }
            }
            Err(err) => Err(from_request_error(err)),
        }
    }

    async fn create_consumer(
        &self,
        stream: &str,
        subject: &Subject,
        options: &SubscribeOptions,
        deliver_subject: Option<Subject>,
    ) -> Result<ConsumerInfo, SubscribeError> {
        let config = ConsumerConfig {
            durable_name: options.durable.clone(),
            description: None,
            deliver_subject,
            deliver_group: options.queue_group.clone(),
            deliver_policy: options.deliver_policy,
            ack_policy: options.ack_policy,
            ack_wait: options.ack_wait,
            max_deliver: options.max_deliver,
            filter_subject: Some(subject.clone()),
            replay_policy: super::ReplayPolicy::Instant,
            flow_control: options.flow_control,
            idle_heartbeat: options.idle_heartbeat,
            max_ack_pending: None,
        };

        let endpoint = match &options.durable {
            Some(durable) => format!("CONSUMER.DURABLE.CREATE.{stream}.{durable}"),
            None => format!("CONSUMER.CREATE.{stream}"),
        };
        let payload = serde_json::to_vec(&CreateConsumerRequest {
            stream_name: stream,
            config: &config,
        })
        .expect("serialize CreateConsumerRequest");

        self.api_request(&endpoint, payload.into())
            .await
            .map_err(from_request_error)
    }
}

fn validate_binding(info: &ConsumerInfo, subject: &Subject) -> Result<(), SubscribeError> {
    match &info.config.filter_subject {
        Some(filter) if filter != subject => Err(SubscribeError::FilterMismatch),
        _ => Ok(()),
    }
}

fn from_request_error(err: RequestError) -> SubscribeError {
    match &err {
        RequestError::Api(api) if api.err_code == ErrorCode::STREAM_NOT_FOUND => {
            SubscribeError::StreamNotFound
        }
        RequestError::Api(api) if api.err_code == ErrorCode::CONSUMER_NOT_FOUND => {
            SubscribeError::ConsumerNotFound
        }
        _ => SubscribeError::Request(err),
    }
}

/// State shared with the heartbeat watchdog
#[derive(Debug)]
struct SequenceTracking {
    /// Consumer sequence of the last delivered message we observed
    consumer_seq: AtomicU64,
    mismatch: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl SequenceTracking {
    fn observe_delivery(&self, consumer_seq: u64) {
        self.consumer_seq.store(consumer_seq, Ordering::Release);
    }

    /// Compare the server's last sent sequence against ours
    ///
    /// Returns `true` when a fresh mismatch should be reported.
    fn observe_heartbeat(&self, server_consumer_seq: u64) -> bool {
        if server_consumer_seq == self.consumer_seq.load(Ordering::Acquire) {
            self.mismatch.store(false, Ordering::Release);
            false
        } else {
            !self.mismatch.swap(true, Ordering::AcqRel)
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("last activity lock") = Instant::now();
    }
}

fn spawn_heartbeat_watchdog(
    context: JetStreamContext,
    stream: String,
    consumer: String,
    tracking: Weak<SequenceTracking>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            time::sleep(interval).await;
            let Some(tracking) = tracking.upgrade() else {
                return;
            };

            let last_activity = *tracking.last_activity.lock().expect("last activity lock");
            if last_activity.elapsed() >= interval * 2 {
                tracing::warn!(stream = %stream, consumer = %consumer, "missed consumer heartbeat");
                context
                    .client()
                    .events()
                    .send(ClientEvent::Error(ClientError::MissedHeartbeat {
                        stream: stream.clone(),
                        consumer: consumer.clone(),
                    }));
            }
        }
    })
}

/// A push subscription bound to a JetStream consumer
///
/// Obtained from [`JetStreamContext::subscribe`].
#[derive(Debug)]
pub struct PushSubscription {
    subscription: Subscription,
    context: JetStreamContext,
    stream: String,
    consumer: String,
    tracking: Arc<SequenceTracking>,
    heartbeat_task: Option<JoinHandle<()>>,
    delete_on_unsubscribe: bool,
}

impl PushSubscription {
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Wait for the next message, up to `timeout`
    ///
    /// Flow control and heartbeat messages are handled internally and
    /// never surface here.
    ///
    /// # Errors
    ///
    /// It returns an error if the timeout elapses, if the subscription
    /// is closed, or if the consumer entered the sequence mismatch
    /// state.
    pub async fn next_message(&mut self, timeout: Duration) -> Result<JetStreamMessage, NextError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.tracking.mismatch.load(Ordering::Acquire) {
                return Err(NextError::SequenceMismatch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NextError::TimedOut);
            }

            match time::timeout(remaining, self.subscription.recv()).await {
                Err(_elapsed) => return Err(NextError::TimedOut),
                Ok(None) => return Err(NextError::Closed),
                Ok(Some(Err(err))) => return Err(NextError::Server(err)),
                Ok(Some(Ok(message))) => {
                    self.tracking.touch();

                    if message.status_code == Some(StatusCode::IDLE_HEARTBEAT) {
                        self.process_control_message(&message);
                        continue;
                    }

                    if let Ok(meta) = AckMetadata::parse_message(&message) {
                        self.tracking.observe_delivery(meta.consumer_sequence);
                    }
                    return Ok(JetStreamMessage {
                        message,
                        context: self.context.clone(),
                    });
                }
            }
        }
    }

    /// Handle a status-100 control message
    ///
    /// A flow control request carries a reply subject that must be
    /// echoed once every prior message has been handed over; since the
    /// queue is FIFO, reaching the control message is that point. An
    /// idle heartbeat carries the server's last sent sequence and,
    /// when the consumer is stalled, the flow control subject it is
    /// still waiting on.
    fn process_control_message(&self, message: &ServerMessage) {
        if let Some(reply_subject) = &message.base.reply_subject {
            self.echo_flow_control(reply_subject.clone());
            return;
        }

        if let Some(last) = message.base.headers.get(&HeaderName::LAST_CONSUMER) {
            if let Ok(server_consumer_seq) = last.as_str().parse::<u64>() {
                if self.tracking.observe_heartbeat(server_consumer_seq) {
                    tracing::warn!(
                        stream = %self.stream,
                        consumer = %self.consumer,
                        "consumer sequence mismatch"
                    );
                    self.context.client().events().send(ClientEvent::Error(
                        ClientError::SequenceMismatch {
                            stream: self.stream.clone(),
                            consumer: self.consumer.clone(),
                        },
                    ));
                }
            }
        }

        if let Some(stalled) = message.base.headers.get(&HeaderName::CONSUMER_STALLED) {
            if let Ok(subject) = Subject::try_from(stalled.as_str().to_owned()) {
                self.echo_flow_control(subject);
            }
        }
    }

    fn echo_flow_control(&self, reply_subject: Subject) {
        let _ = self
            .context
            .client()
            .publish(reply_subject)
            .payload(Bytes::new())
            .try_publish();
    }

    /// Close the subscription, deleting the consumer if this client
    /// created it as an ephemeral one
    ///
    /// # Errors
    ///
    /// It returns an error if the consumer deletion fails.
    pub async fn unsubscribe(mut self) -> Result<(), RequestError> {
        let _ = self.subscription.close().await;
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }

        if self.delete_on_unsubscribe {
            let response: DeleteResponse = self
                .context
                .api_request(
                    &format!("CONSUMER.DELETE.{}.{}", self.stream, self.consumer),
                    Bytes::new(),
                )
                .await?;
            if !response.success {
                tracing::warn!(
                    stream = %self.stream,
                    consumer = %self.consumer,
                    "the server refused to delete the ephemeral consumer"
                );
            }
        }
        Ok(())
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }
}

/// A pull subscription bound to a JetStream consumer
///
/// Obtained from [`JetStreamContext::pull_subscribe`].
#[derive(Debug)]
pub struct PullSubscription {
    subscription: Subscription,
    inbox: Subject,
    context: JetStreamContext,
    stream: String,
    consumer: String,
    delete_on_unsubscribe: bool,
}

impl PullSubscription {
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Request up to `batch` messages from the consumer
    ///
    /// Messages already buffered locally are served first. A first
    /// attempt for more than one message asks the server not to wait
    /// (`no_wait`); when the server reports nothing immediately
    /// available, a second request expiring slightly before `timeout`
    /// is issued.
    ///
    /// Returns the collected messages as long as at least one was
    /// received.
    ///
    /// # Errors
    ///
    /// It returns an error only when no message was received: the
    /// timeout elapsed, the pull expired, or the client is closed.
    pub async fn fetch(
        &mut self,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<JetStreamMessage>, FetchError> {
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::with_capacity(batch.min(64));

        while messages.len() < batch {
            match self.subscription.try_next_buffered() {
                Some(Ok(message)) if is_delivery(&message) => {
                    messages.push(self.wrap(message));
                }
                // Stale statuses from previous pulls
                Some(_) => {}
                None => break,
            }
        }
        if messages.len() >= batch {
            return Ok(messages);
        }

        let mut no_wait = batch > 1;
        self.send_next_request(batch - messages.len(), no_wait, deadline)
            .await?;

        loop {
            if messages.len() >= batch {
                return Ok(messages);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match time::timeout(remaining, self.subscription.recv()).await {
                Err(_elapsed) => break,
                Ok(None) => {
                    if messages.is_empty() {
                        return Err(FetchError::Closed(ClientClosedError));
                    }
                    break;
                }
                Ok(Some(Err(_err))) => break,
                Ok(Some(Ok(message))) => match message.status_code {
                    None | Some(StatusCode::OK) => messages.push(self.wrap(message)),
                    Some(StatusCode::IDLE_HEARTBEAT) => {}
                    Some(StatusCode::NOT_FOUND) => {
                        // Nothing buffered server side for the no_wait
                        // request; whatever it did deliver is complete
                        if !messages.is_empty() {
                            return Ok(messages);
                        }
                        if no_wait {
                            no_wait = false;
                            self.send_next_request(batch, false, deadline).await?;
                        } else {
                            break;
                        }
                    }
                    // The expiring pull elapsed
                    Some(StatusCode::TIMEOUT) => break,
                    Some(_) => break,
                },
            }
        }

        if messages.is_empty() {
            Err(FetchError::TimedOut)
        } else {
            Ok(messages)
        }
    }

    async fn send_next_request(
        &self,
        batch: usize,
        no_wait: bool,
        deadline: Instant,
    ) -> Result<(), FetchError> {
        let expires = if no_wait {
            None
        } else {
            // Expire slightly before the caller's own deadline so the
            // 408 still reaches us
            let remaining = deadline.saturating_duration_since(Instant::now());
            Some(remaining.saturating_sub(remaining / 10))
        };

        let request = NextRequest {
            batch,
            expires,
            no_wait,
        };
        let payload = serde_json::to_vec(&request).expect("serialize NextRequest");

        let subject = Subject::from_dangerous_value(
            format!(
                "{}.CONSUMER.MSG.NEXT.{}.{}",
                self.context.prefix(),
                self.stream,
                self.consumer
            )
            .into(),
        );
        self.context
            .client()
            .publish(subject)
            .reply_subject(Some(self.inbox.clone()))
            .payload(payload.into())
            .await
            .map_err(FetchError::Publish)
    }

    fn wrap(&self, message: ServerMessage) -> JetStreamMessage {
        JetStreamMessage {
            message,
            context: self.context.clone(),
        }
    }

    /// Close the subscription, deleting the consumer if this client
    /// created it as an ephemeral one
    ///
    /// # Errors
    ///
    /// It returns an error if the consumer deletion fails.
    pub async fn unsubscribe(mut self) -> Result<(), RequestError> {
        let _ = self.subscription.close().await;

        if self.delete_on_unsubscribe {
            let response: DeleteResponse = self
                .context
                .api_request(
                    &format!("CONSUMER.DELETE.{}.{}", self.stream, self.consumer),
                    Bytes::new(),
                )
                .await?;
            if !response.success {
                tracing::warn!(
                    stream = %self.stream,
                    consumer = %self.consumer,
                    "the server refused to delete the ephemeral consumer"
                );
            }
        }
        Ok(())
    }
}

fn is_delivery(message: &ServerMessage) -> bool {
    matches!(message.status_code, None | Some(StatusCode::OK))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU64},
            Mutex,
        },
        time::Duration,
    };

    use claims::assert_matches;
    use tokio::time::Instant;

    use crate::client::Client;
    use crate::jetstream::JetStreamContext;
    use crate::tests::{ServerSeen, TestServer};

    use super::{FetchError, PullSubscription, SequenceTracking};

    #[test]
    fn heartbeat_mismatch_detection() {
        let tracking = SequenceTracking {
            consumer_seq: AtomicU64::new(0),
            mismatch: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        };

        tracking.observe_delivery(10);
        // Server agrees: no mismatch
        assert!(!tracking.observe_heartbeat(10));
        assert!(!tracking.mismatch.load(std::sync::atomic::Ordering::Acquire));

        // Server is ahead of us: report once
        assert!(tracking.observe_heartbeat(12));
        assert!(!tracking.observe_heartbeat(12));
        assert!(tracking.mismatch.load(std::sync::atomic::Ordering::Acquire));

        // The gap closed again: the flag clears
        tracking.observe_delivery(12);
        assert!(!tracking.observe_heartbeat(12));
        assert!(!tracking.mismatch.load(std::sync::atomic::Ordering::Acquire));
    }

    async fn pull_fixture(url: &str) -> PullSubscription {
        let client = Client::builder().connect(url).await.unwrap();
        let context = JetStreamContext::new(client);

        let inbox = context.client().create_inbox_subject();
        let subscription = context
            .client()
            .subscribe(inbox.clone(), None)
            .await
            .unwrap();

        PullSubscription {
            subscription,
            inbox,
            context,
            stream: "ORDERS".to_owned(),
            consumer: "puller".to_owned(),
            delete_on_unsubscribe: false,
        }
    }

    #[tokio::test]
    async fn fetch_collects_available_messages_then_times_out() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;

            // The pull inbox subscription
            let ServerSeen::Sub { sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };

            // fetch(10): a no_wait pull request for the whole batch
            let ServerSeen::Pub {
                subject,
                reply,
                payload,
            } = conn.read_command().await
            else {
                panic!("expected pull request");
            };
            assert_eq!(subject, "$JS.API.CONSUMER.MSG.NEXT.ORDERS.puller");
            let inbox = reply.unwrap();
            let body = String::from_utf8(payload).unwrap();
            assert!(body.contains("\"batch\":10"), "{body}");
            assert!(body.contains("\"no_wait\":true"), "{body}");

            // Five messages are available, then nothing more
            for n in 1..=5u64 {
                conn.send(
                    format!(
                        "MSG orders.new {sid} $JS.ACK.ORDERS.puller.1.{n}.{n}.1700000000000000000.0 5\r\nitem{n}\r\n"
                    )
                    .as_bytes(),
                )
                .await;
            }
            conn.send(
                format!("HMSG {inbox} {sid} 16 16\r\nNATS/1.0 404\r\n\r\n\r\n").as_bytes(),
            )
            .await;

            // Second fetch: the no_wait pull is answered 404 straight away
            let ServerSeen::Pub { .. } = conn.read_command().await else {
                panic!("expected second pull request");
            };
            conn.send(
                format!("HMSG {inbox} {sid} 16 16\r\nNATS/1.0 404\r\n\r\n\r\n").as_bytes(),
            )
            .await;

            // ...followed by the expiring retry, answered 408
            let ServerSeen::Pub { payload, .. } = conn.read_command().await else {
                panic!("expected expiring pull request");
            };
            let body = String::from_utf8(payload).unwrap();
            assert!(body.contains("\"expires\":"), "{body}");
            conn.send(
                format!("HMSG {inbox} {sid} 16 16\r\nNATS/1.0 408\r\n\r\n\r\n").as_bytes(),
            )
            .await;
            conn
        });

        let mut pull = pull_fixture(&url).await;

        let messages = pull.fetch(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].payload().as_ref(), b"item1");
        assert_eq!(messages[4].payload().as_ref(), b"item5");

        let meta = messages[2].metadata().unwrap();
        assert_eq!(meta.stream, "ORDERS");
        assert_eq!(meta.consumer, "puller");
        assert_eq!(meta.stream_sequence, 3);
        assert_eq!(meta.pending, 0);

        let err = pull
            .fetch(10, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_matches!(err, FetchError::TimedOut);

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn fetch_drains_buffered_messages_without_a_request() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;
            let ServerSeen::Sub { sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };

            // Deliveries left over from an earlier, larger pull
            for n in 1..=3u64 {
                conn.send(
                    format!(
                        "MSG orders.new {sid} $JS.ACK.ORDERS.puller.1.{n}.{n}.1700000000000000000.0 5\r\nitem{n}\r\n"
                    )
                    .as_bytes(),
                )
                .await;
            }
            conn
        });

        let mut pull = pull_fixture(&url).await;

        // Wait for the deliveries to be buffered
        for _ in 0..100 {
            if pull.subscription.stats().pending_msgs() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // batch <= buffered: served locally, no pull request goes out
        let messages = pull.fetch(3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(messages.len(), 3);

        drop(server_task.await.unwrap());
    }
}
