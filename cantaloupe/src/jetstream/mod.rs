//! NATS JetStream functionality implementation
//!
//! Relies on NATS Core to communicate with the server. Obtained by
//! wrapping a [`Client`] in a [`JetStreamContext`].

use std::{
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use cantaloupe_proto::{error::SubjectValidateError, Subject};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::sync::OnceCell;

pub use self::ack::{AckError, AckKind, AckMetadata, JetStreamMessage, MetadataError};
pub use self::consumer::{
    AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, ReplayPolicy, SequenceInfo,
    StreamConfig, StreamInfo, StreamState,
};
pub use self::publish::{
    CompleteError, PubAck, PublishAckError, PublishAckFuture, PublishOptions,
};
pub(crate) use self::publish::AckErrorFn;
use self::publish::AsyncPublishes;
pub use self::subscription::{
    FetchError, NextError, PullSubscription, PushSubscription, SubscribeError, SubscribeOptions,
};

use crate::client::{PublishError, ResponseError};
use crate::core::Client;

mod ack;
mod consumer;
mod publish;
mod subscription;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_MAX_ACKS_IN_FLIGHT: usize = 256;
const DEFAULT_STALL_WAIT: Duration = Duration::from_millis(200);

/// A JetStream context
///
/// `JetStreamContext` is a `Clone`able handle over a [`Client`] with
/// JetStream specific configuration: the API subject prefix, the
/// request timeout and the asynchronous publish window.
#[derive(Debug, Clone)]
pub struct JetStreamContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    client: Client,
    prefix: Subject,
    request_timeout: Duration,
    max_acks_in_flight: usize,
    stall_wait: Duration,
    on_ack_error: Option<AckErrorFn>,
    async_publishes: OnceCell<Arc<AsyncPublishes>>,
}

impl fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextInner")
            .field("client", &self.client)
            .field("prefix", &self.prefix)
            .field("request_timeout", &self.request_timeout)
            .field("max_acks_in_flight", &self.max_acks_in_flight)
            .field("stall_wait", &self.stall_wait)
            .finish_non_exhaustive()
    }
}

/// A constructor for [`JetStreamContext`]
///
/// Obtained from [`JetStreamContext::builder`].
pub struct ContextBuilder {
    client: Client,
    prefix: Subject,
    request_timeout: Duration,
    max_acks_in_flight: usize,
    stall_wait: Duration,
    on_ack_error: Option<AckErrorFn>,
}

/// An error returned by the JetStream API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, thiserror::Error)]
#[error("jetstream api error {code} ({err_code}): {description}")]
pub struct ApiError {
    /// The HTTP-alike status of the response
    pub code: u16,
    /// The JetStream specific error code
    #[serde(default)]
    pub err_code: ErrorCode,
    #[serde(default)]
    pub description: String,
}

/// The type of error returned by the JetStream API
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(u16);

impl ErrorCode {
    pub const BAD_REQUEST: Self = Self(10003);

    pub const STREAM_NOT_FOUND: Self = Self(10059);
    pub const STREAM_WRONG_LAST_SEQUENCE: Self = Self(10071);

    pub const COULD_NOT_CREATE_CONSUMER: Self = Self(10012);
    pub const CONSUMER_NOT_FOUND: Self = Self(10014);
    pub const CONSUMER_NAME_IN_USE: Self = Self(10148);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.0
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ApiResponse<T> {
    Error { error: ApiError },
    Ok(T),
}

/// An error encountered while making a JetStream API request
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid subject")]
    Subject(#[source] SubjectValidateError),
    #[error("couldn't publish the request")]
    Publish(#[source] PublishError),
    #[error("request failed")]
    Response(#[source] ResponseError),
    #[error("JSON deserialization")]
    Json(#[source] serde_json::Error),
    #[error("api error")]
    Api(#[source] ApiError),
}

impl JetStreamContext {
    /// Create a context using the default configuration
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Create a context builder for non-default configurations
    #[must_use]
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder {
            client,
            prefix: Subject::from_static("$JS.API"),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_acks_in_flight: DEFAULT_MAX_ACKS_IN_FLIGHT,
            stall_wait: DEFAULT_STALL_WAIT,
            on_ack_error: None,
        }
    }

    /// Get a reference to the underlying NATS Core client
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// The API subject prefix of this context
    #[must_use]
    pub fn prefix(&self) -> &Subject {
        &self.inner.prefix
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub(crate) fn api_subject(&self, endpoint: &str) -> Result<Subject, SubjectValidateError> {
        format!("{}.{}", self.inner.prefix, endpoint).try_into()
    }

    /// Run a request against the JetStream API and deserialize the reply
    pub(crate) async fn api_request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: Bytes,
    ) -> Result<T, RequestError> {
        let subject = self.api_subject(endpoint).map_err(RequestError::Subject)?;

        let response = self
            .client()
            .request(subject)
            .response_timeout(self.inner.request_timeout)
            .payload(payload)
            .await
            .map_err(RequestError::Publish)?
            .await
            .map_err(RequestError::Response)?;

        match serde_json::from_slice::<ApiResponse<T>>(&response.base.payload)
            .map_err(RequestError::Json)?
        {
            ApiResponse::Ok(value) => Ok(value),
            ApiResponse::Error { error } => Err(RequestError::Api(error)),
        }
    }

    /// Look up a stream by name
    ///
    /// # Errors
    ///
    /// It returns an error if the stream doesn't exist or if the
    /// request fails.
    pub async fn stream_info(&self, stream: impl Display) -> Result<StreamInfo, RequestError> {
        self.api_request(&format!("STREAM.INFO.{stream}"), Bytes::new())
            .await
    }

    /// Look up a consumer by stream and name
    ///
    /// # Errors
    ///
    /// It returns an error if the consumer doesn't exist or if the
    /// request fails.
    pub async fn consumer_info(
        &self,
        stream: impl Display,
        consumer: impl Display,
    ) -> Result<ConsumerInfo, RequestError> {
        self.api_request(&format!("CONSUMER.INFO.{stream}.{consumer}"), Bytes::new())
            .await
    }
}

impl ContextBuilder {
    /// Use a non-default API prefix
    ///
    /// Default: `$JS.API`.
    #[must_use]
    pub fn prefix(mut self, prefix: Subject) -> Self {
        self.prefix = prefix;
        self
    }

    /// Address the JetStream deployment of the given `domain`
    ///
    /// # Errors
    ///
    /// It returns an error if the subject derived from `domain` is not valid.
    pub fn domain(mut self, domain: impl Display) -> Result<Self, SubjectValidateError> {
        self.prefix = format!("$JS.{domain}.API").try_into()?;
        Ok(self)
    }

    /// The timeout applied to API requests and synchronous publish acks
    ///
    /// Default: 2 seconds.
    #[must_use]
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Bound on unacknowledged asynchronous publishes
    ///
    /// Once the window is full, further `publish_async` calls wait up
    /// to the stall timeout for a slot.
    ///
    /// Default: 256.
    #[must_use]
    pub fn max_acks_in_flight(mut self, max_acks_in_flight: usize) -> Self {
        self.max_acks_in_flight = max_acks_in_flight;
        self
    }

    /// How long a stalled `publish_async` waits for the in-flight
    /// window to open before failing
    ///
    /// Default: 200 milliseconds.
    #[must_use]
    pub fn stall_wait(mut self, stall_wait: Duration) -> Self {
        self.stall_wait = stall_wait;
        self
    }

    /// Callback invoked for every asynchronous publish whose ack
    /// reports an error or times out
    #[must_use]
    pub fn on_ack_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Subject, &PublishAckError) + Send + Sync + 'static,
    {
        self.on_ack_error = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn build(self) -> JetStreamContext {
        JetStreamContext {
            inner: Arc::new(ContextInner {
                client: self.client,
                prefix: self.prefix,
                request_timeout: self.request_timeout,
                max_acks_in_flight: self.max_acks_in_flight,
                stall_wait: self.stall_wait,
                on_ack_error: self.on_ack_error,
                async_publishes: OnceCell::new(),
            }),
        }
    }
}

pub mod error {
    //! JetStream specific errors

    pub use super::ack::{AckError, MetadataError};
    pub use super::publish::{CompleteError, PublishAckError};
    pub use super::subscription::{FetchError, NextError, SubscribeError};
    pub use super::{ApiError, ErrorCode, RequestError};
}
