use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use cantaloupe_proto::{
    headers::{HeaderMap, HeaderName, HeaderValue},
    ServerMessage, StatusCode, Subject,
};
use serde::Deserialize;
use tokio::{
    sync::{oneshot, Notify, Semaphore, TryAcquireError},
    time::{self, Sleep},
};

use crate::client::{create_inbox_subject, ClientClosedError, PublishError};
use crate::subscription::Subscription;

use super::{ApiError, ApiResponse, JetStreamContext};

pub(crate) type AckErrorFn = Arc<dyn Fn(&Subject, &PublishAckError) + Send + Sync>;

/// Options attached to a JetStream publish
///
/// Every option maps to a header understood by the receiving stream.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    msg_id: Option<String>,
    expect_stream: Option<String>,
    expect_last_msg_id: Option<String>,
    expect_last_seq: Option<u64>,
    expect_last_subject_seq: Option<u64>,
    max_wait: Option<Duration>,
}

impl PublishOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// De-duplication key; the stream rejects duplicates within its
    /// configured window
    #[must_use]
    pub fn msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }

    /// Fail unless the receiving stream carries this name
    #[must_use]
    pub fn expect_stream(mut self, stream: impl Into<String>) -> Self {
        self.expect_stream = Some(stream.into());
        self
    }

    /// Fail unless the last received message id equals this value
    #[must_use]
    pub fn expect_last_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.expect_last_msg_id = Some(msg_id.into());
        self
    }

    /// Fail unless the stream's last sequence equals this value
    #[must_use]
    pub fn expect_last_seq(mut self, seq: u64) -> Self {
        self.expect_last_seq = Some(seq);
        self
    }

    /// Fail unless the last sequence on the published subject equals
    /// this value
    #[must_use]
    pub fn expect_last_subject_seq(mut self, seq: u64) -> Self {
        self.expect_last_subject_seq = Some(seq);
        self
    }

    /// Override the default ack timeout
    #[must_use]
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub(crate) fn max_wait_value(&self) -> Option<Duration> {
        self.max_wait
    }

    pub(crate) fn to_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let pairs = [
            (HeaderName::MESSAGE_ID, self.msg_id.as_deref()),
            (HeaderName::EXPECTED_STREAM, self.expect_stream.as_deref()),
            (
                HeaderName::EXPECTED_LAST_MESSAGE_ID,
                self.expect_last_msg_id.as_deref(),
            ),
        ];
        for (name, value) in pairs {
            if let Some(value) = value {
                headers.insert(
                    name,
                    HeaderValue::from_dangerous_value(value.to_owned().into()),
                );
            }
        }

        if let Some(seq) = self.expect_last_seq {
            headers.insert(
                HeaderName::EXPECTED_LAST_SEQUENCE,
                HeaderValue::from_dangerous_value(seq.to_string().into()),
            );
        }
        if let Some(seq) = self.expect_last_subject_seq {
            headers.insert(
                HeaderName::EXPECTED_LAST_SUBJECT_SEQUENCE,
                HeaderValue::from_dangerous_value(seq.to_string().into()),
            );
        }

        headers
    }
}

/// The acknowledgement of a stream for a received message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PubAck {
    /// The stream that stored the message
    pub stream: String,
    /// The sequence the message was stored at
    #[serde(rename = "seq")]
    pub sequence: u64,
    /// The message was a duplicate of an already stored message
    #[serde(default)]
    pub duplicate: bool,
}

/// An error encountered while publishing to a stream
#[derive(Debug, thiserror::Error)]
pub enum PublishAckError {
    #[error("couldn't publish the message")]
    Publish(#[source] PublishError),
    #[error("no stream is listening on the subject")]
    NoResponders,
    #[error("no ack within the timeout")]
    TimedOut,
    #[error("the ack couldn't be deserialized")]
    Json(#[source] serde_json::Error),
    #[error("the stream rejected the publish")]
    Ack(#[source] ApiError),
    #[error("too many publishes awaiting their ack")]
    Stall,
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

/// An error encountered while waiting for outstanding acks
#[derive(Debug, thiserror::Error)]
pub enum CompleteError {
    #[error("publishes were still awaiting their ack at the deadline")]
    TimedOut,
}

impl JetStreamContext {
    /// Publish a message and wait for the receiving stream's ack
    ///
    /// # Errors
    ///
    /// It returns an error if the message cannot be published, if no
    /// stream answers, or if the stream rejects the message.
    pub async fn publish(
        &self,
        subject: Subject,
        payload: Bytes,
    ) -> Result<PubAck, PublishAckError> {
        self.publish_with_options(subject, &PublishOptions::new(), payload)
            .await
    }

    /// Publish a message with [`PublishOptions`] and wait for the ack
    ///
    /// # Errors
    ///
    /// It returns an error if the message cannot be published, if no
    /// stream answers, or if the stream rejects the message.
    pub async fn publish_with_options(
        &self,
        subject: Subject,
        options: &PublishOptions,
        payload: Bytes,
    ) -> Result<PubAck, PublishAckError> {
        let timeout = options.max_wait_value().unwrap_or(self.request_timeout());

        let response = self
            .client()
            .request(subject)
            .response_timeout(timeout)
            .headers(options.to_headers())
            .payload(payload)
            .await
            .map_err(PublishAckError::Publish)?
            .await
            .map_err(|err| match err {
                crate::client::ResponseError::NoResponders => PublishAckError::NoResponders,
                crate::client::ResponseError::TimedOut => PublishAckError::TimedOut,
                crate::client::ResponseError::ServerError(_)
                | crate::client::ResponseError::SubscriptionClosed => {
                    PublishAckError::Closed(ClientClosedError)
                }
            })?;

        parse_ack(&response)
    }

    /// Publish a message without waiting for the ack
    ///
    /// The ack is correlated in the background and resolved through
    /// the returned [`PublishAckFuture`]. At most `max_acks_in_flight`
    /// publishes may be outstanding; beyond that the call waits up to
    /// the configured stall timeout and then fails with
    /// [`PublishAckError::Stall`].
    ///
    /// # Errors
    ///
    /// It returns an error if the in-flight window stays full past the
    /// stall timeout or if the message cannot be published.
    pub async fn publish_async(
        &self,
        subject: Subject,
        payload: Bytes,
    ) -> Result<PublishAckFuture, PublishAckError> {
        self.publish_async_with_options(subject, &PublishOptions::new(), payload)
            .await
    }

    /// Publish a message with [`PublishOptions`], without waiting for the ack
    ///
    /// # Errors
    ///
    /// See [`JetStreamContext::publish_async`].
    pub async fn publish_async_with_options(
        &self,
        subject: Subject,
        options: &PublishOptions,
        payload: Bytes,
    ) -> Result<PublishAckFuture, PublishAckError> {
        let state = self.async_publishes().await?;

        let permit = match Arc::clone(&state.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PublishAckError::Closed(ClientClosedError)),
            Err(TryAcquireError::NoPermits) => {
                match time::timeout(state.stall_wait, Arc::clone(&state.permits).acquire_owned())
                    .await
                {
                    Err(_elapsed) => return Err(PublishAckError::Stall),
                    Ok(Err(_closed)) => return Err(PublishAckError::Closed(ClientClosedError)),
                    Ok(Ok(permit)) => permit,
                }
            }
        };

        let reply = create_inbox_subject(&state.reply_prefix);
        let (sender, receiver) = oneshot::channel();
        state.pending.lock().expect("pending acks lock").insert(
            reply.clone(),
            PendingAck {
                subject: subject.clone(),
                reply: sender,
                _permit: permit,
            },
        );

        let published = self
            .client()
            .publish(subject)
            .reply_subject(Some(reply.clone()))
            .headers(options.to_headers())
            .payload(payload)
            .await;
        if let Err(err) = published {
            state.take(&reply);
            return Err(PublishAckError::Publish(err));
        }

        Ok(PublishAckFuture {
            state: Arc::clone(state),
            reply,
            receiver,
            timeout: Box::pin(time::sleep(
                options.max_wait_value().unwrap_or(self.request_timeout()),
            )),
            done: false,
        })
    }

    /// Number of asynchronous publishes currently awaiting their ack
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.inner
            .async_publishes
            .get()
            .map_or(0, |state| state.pending.lock().expect("pending acks lock").len())
    }

    /// Wait until every outstanding asynchronous publish has been
    /// acknowledged or timed out
    ///
    /// # Errors
    ///
    /// It returns an error if publishes are still pending at `timeout`.
    pub async fn publish_async_complete(&self, timeout: Duration) -> Result<(), CompleteError> {
        let Some(state) = self.inner.async_publishes.get() else {
            return Ok(());
        };

        time::timeout(timeout, async {
            loop {
                let notified = state.idle.notified();
                if state.pending.lock().expect("pending acks lock").is_empty() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| CompleteError::TimedOut)
    }

    async fn async_publishes(&self) -> Result<&Arc<AsyncPublishes>, PublishAckError> {
        self.inner
            .async_publishes
            .get_or_try_init(|| async {
                let reply_prefix = self.client().create_inbox_subject();
                let wildcard =
                    Subject::from_dangerous_value(format!("{reply_prefix}.*").into());
                let subscription = self
                    .client()
                    .subscribe(wildcard, None)
                    .await
                    .map_err(PublishAckError::Closed)?;

                let state = Arc::new(AsyncPublishes {
                    reply_prefix,
                    permits: Arc::new(Semaphore::new(self.inner.max_acks_in_flight)),
                    stall_wait: self.inner.stall_wait,
                    pending: Mutex::new(HashMap::new()),
                    idle: Notify::new(),
                    on_ack_error: self.inner.on_ack_error.clone(),
                });
                tokio::spawn(reap_acks(subscription, Arc::downgrade(&state)));
                Ok(state)
            })
            .await
    }
}

/// Shared state of the asynchronous publish window
pub(super) struct AsyncPublishes {
    reply_prefix: Subject,
    permits: Arc<Semaphore>,
    stall_wait: Duration,
    pending: Mutex<HashMap<Subject, PendingAck>>,
    idle: Notify,
    on_ack_error: Option<AckErrorFn>,
}

struct PendingAck {
    subject: Subject,
    reply: oneshot::Sender<Result<PubAck, PublishAckError>>,
    /// Released once the entry leaves the map
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl AsyncPublishes {
    fn take(&self, reply: &Subject) -> Option<PendingAck> {
        let mut pending = self.pending.lock().expect("pending acks lock");
        let entry = pending.remove(reply);
        if pending.is_empty() {
            self.idle.notify_waiters();
        }
        entry
    }

    fn resolve(&self, message: &ServerMessage) {
        let Some(entry) = self.take(&message.base.subject) else {
            // The publisher gave up on this ack
            return;
        };

        let result = if message.status_code == Some(StatusCode::NO_RESPONDERS) {
            Err(PublishAckError::NoResponders)
        } else {
            match serde_json::from_slice::<ApiResponse<PubAck>>(&message.base.payload) {
                Ok(ApiResponse::Ok(ack)) => Ok(ack),
                Ok(ApiResponse::Error { error }) => Err(PublishAckError::Ack(error)),
                Err(err) => Err(PublishAckError::Json(err)),
            }
        };

        if let Err(err) = &result {
            if let Some(on_ack_error) = &self.on_ack_error {
                on_ack_error(&entry.subject, err);
            }
        }
        let _ = entry.reply.send(result);
    }

    fn expire(&self, reply: &Subject) {
        if let Some(entry) = self.take(reply) {
            if let Some(on_ack_error) = &self.on_ack_error {
                on_ack_error(&entry.subject, &PublishAckError::TimedOut);
            }
        }
    }
}

async fn reap_acks(mut subscription: Subscription, state: Weak<AsyncPublishes>) {
    loop {
        let Some(item) = subscription.recv().await else {
            return;
        };
        let Ok(message) = item else {
            continue;
        };
        let Some(state) = state.upgrade() else {
            return;
        };
        state.resolve(&message);
    }
}

/// The pending acknowledgement of an asynchronous publish
///
/// Obtained from [`JetStreamContext::publish_async`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct PublishAckFuture {
    state: Arc<AsyncPublishes>,
    reply: Subject,
    receiver: oneshot::Receiver<Result<PubAck, PublishAckError>>,
    timeout: Pin<Box<Sleep>>,
    done: bool,
}

impl Future for PublishAckFuture {
    type Output = Result<PubAck, PublishAckError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        assert!(!this.done, "PublishAckFuture polled after completing");

        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result.unwrap_or(Err(PublishAckError::Closed(ClientClosedError))))
            }
            Poll::Pending => match this.timeout.as_mut().poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(()) => {
                    this.done = true;
                    this.state.expire(&this.reply);
                    Poll::Ready(Err(PublishAckError::TimedOut))
                }
            },
        }
    }
}

impl fmt::Debug for PublishAckFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishAckFuture")
            .field("reply", &self.reply)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for AsyncPublishes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPublishes")
            .field("reply_prefix", &self.reply_prefix)
            .field("stall_wait", &self.stall_wait)
            .finish_non_exhaustive()
    }
}

fn parse_ack(response: &ServerMessage) -> Result<PubAck, PublishAckError> {
    if response.status_code == Some(StatusCode::NO_RESPONDERS) {
        return Err(PublishAckError::NoResponders);
    }

    match serde_json::from_slice::<ApiResponse<PubAck>>(&response.base.payload)
        .map_err(PublishAckError::Json)?
    {
        ApiResponse::Ok(ack) => Ok(ack),
        ApiResponse::Error { error } => Err(PublishAckError::Ack(error)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use cantaloupe_proto::Subject;
    use claims::assert_matches;

    use crate::client::Client;
    use crate::jetstream::JetStreamContext;
    use crate::tests::{ServerSeen, TestServer};

    use super::{ApiResponse, CompleteError, PubAck, PublishAckError};

    #[tokio::test]
    async fn async_publish_resolves_acks() {
        let server = TestServer::bind().await;
        let url = server.url();

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await;

            // The ack reaper subscription
            let ServerSeen::Sub { sid, .. } = conn.read_command().await else {
                panic!("expected SUB");
            };

            let ServerSeen::Pub { subject, reply, payload } = conn.read_command().await else {
                panic!("expected PUB");
            };
            assert_eq!(subject, "orders.new");
            assert_eq!(payload, b"fresh melon");
            let reply = reply.unwrap();

            let ack = r#"{"stream":"ORDERS","seq":7}"#;
            conn.send(format!("MSG {reply} {sid} {}\r\n{ack}\r\n", ack.len()).as_bytes())
                .await;
            conn
        });

        let client = Client::builder().connect(&url).await.unwrap();
        let context = JetStreamContext::new(client);

        let ack = context
            .publish_async(
                Subject::from_static("orders.new"),
                Bytes::from_static(b"fresh melon"),
            )
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(ack.stream, "ORDERS");
        assert_eq!(ack.sequence, 7);
        assert_eq!(context.pending_acks(), 0);

        context
            .publish_async_complete(Duration::from_millis(100))
            .await
            .unwrap();

        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn async_publish_stalls_at_the_in_flight_bound() {
        let server = TestServer::bind().await;
        let url = server.url();

        // Consume whatever the client sends; never ack anything
        tokio::spawn(async move {
            let mut conn = server.accept().await;
            loop {
                let _ = conn.read_command().await;
            }
        });

        let client = Client::builder().connect(&url).await.unwrap();
        let context = JetStreamContext::builder(client)
            .max_acks_in_flight(1)
            .stall_wait(Duration::from_millis(100))
            .request_timeout(Duration::from_millis(400))
            .build();

        let first = context
            .publish_async(Subject::from_static("orders.new"), Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert_eq!(context.pending_acks(), 1);

        // The window is full and stays full past the stall timeout
        let err = context
            .publish_async(Subject::from_static("orders.new"), Bytes::from_static(b"b"))
            .await
            .unwrap_err();
        assert_matches!(err, PublishAckError::Stall);

        // The unacknowledged publish eventually times out, freeing the
        // window again
        let err = first.await.unwrap_err();
        assert_matches!(err, PublishAckError::TimedOut);
        assert_eq!(context.pending_acks(), 0);

        let _second = context
            .publish_async(Subject::from_static("orders.new"), Bytes::from_static(b"c"))
            .await
            .unwrap();
        let err = context
            .publish_async_complete(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_matches!(err, CompleteError::TimedOut);
    }

    #[test]
    fn parse_pub_ack() {
        let ack = serde_json::from_str::<PubAck>(
            r#"{"stream":"ORDERS","seq":42,"duplicate":true}"#,
        )
        .unwrap();
        assert_eq!(
            ack,
            PubAck {
                stream: "ORDERS".to_owned(),
                sequence: 42,
                duplicate: true,
            }
        );
    }

    #[test]
    fn parse_error_response() {
        let response = serde_json::from_str::<ApiResponse<PubAck>>(
            r#"{"type":"io.nats.jetstream.api.v1.pub_ack_response","error":{"code":400,"err_code":10060,"description":"expected stream does not match"}}"#,
        )
        .unwrap();
        let ApiResponse::Error { error } = response else {
            panic!("expected error response");
        };
        assert_eq!(error.code, 400);
        assert_eq!(u16::from(error.err_code), 10060);
    }

    #[test]
    fn parse_ok_response() {
        let response = serde_json::from_str::<ApiResponse<PubAck>>(
            r#"{"type":"io.nats.jetstream.api.v1.pub_ack_response","stream":"ORDERS","seq":7}"#,
        )
        .unwrap();
        let ApiResponse::Ok(ack) = response else {
            panic!("expected ack");
        };
        assert_eq!(ack.sequence, 7);
        assert!(!ack.duplicate);
    }
}
