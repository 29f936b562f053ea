use std::{
    fmt::{self, Debug},
    future::{Future, IntoFuture},
    num::NonZeroU64,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use cantaloupe_proto::{
    error::ServerError,
    headers::{HeaderMap, HeaderName, HeaderValue},
    ServerMessage, StatusCode, Subject,
};
use futures_core::{future::BoxFuture, Stream};
use pin_project_lite::pin_project;
use tokio::time::{sleep, Sleep};

use crate::{
    client::{Client, PublishError, TryCommandError},
    core::MultiplexedSubscription,
    subscription::Subscription,
};

use super::Publish;

/// A publishable request
#[derive(Debug, Clone)]
pub struct Request {
    pub(super) publish: Publish,
    pub(super) response_timeout: Option<Duration>,
}

/// A constructor for a publishable request
///
/// Obtained from [`Request::builder`].
#[derive(Debug)]
pub struct RequestBuilder {
    request: Request,
}

/// A constructor for a publishable request to be sent using the given client
///
/// Obtained from [`Client::request`].
pub struct ClientRequest<'a> {
    client: &'a Client,
    request: Request,
}

/// A publishable request ready to be published to the given client
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct DoClientRequest<'a> {
    client: &'a Client,
    request: Request,
}

pin_project! {
    /// A [`Future`] for receiving a response
    #[derive(Debug)]
    #[must_use = "consider using a `Publish` instead of `Request` if uninterested in the response"]
    pub struct ResponseFut {
        subscription: ResponseSubscription,
        #[pin]
        timeout: Sleep,
        translate_no_responders: bool,
    }
}

#[derive(Debug)]
enum ResponseSubscription {
    Multiplexed(MultiplexedSubscription),
    Subscription(Subscription),
}

/// An error encountered while waiting for a response
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    /// The [`Subscription`] encountered a server error
    #[error("server error")]
    ServerError(#[source] ServerError),
    /// No subscription is listening on the requested subject
    #[error("no responders")]
    NoResponders,
    /// A response hasn't been received within the timeout
    #[error("received no response within the timeout window")]
    TimedOut,
    /// The subscription backing the request was closed
    ///
    /// On a multiplexed request this can mean the client reconnected
    /// with `fail_requests_on_disconnect` set.
    #[error("subscription closed")]
    SubscriptionClosed,
}

macro_rules! request {
    () => {
        #[must_use]
        pub fn reply_subject(mut self, reply_subject: Option<Subject>) -> Self {
            self.request_mut().publish.reply_subject = reply_subject;
            self
        }

        #[must_use]
        pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
            self.request_mut().publish.headers.insert(name, value);
            self
        }

        #[must_use]
        pub fn headers(mut self, headers: HeaderMap) -> Self {
            self.request_mut().publish.headers = headers;
            self
        }

        #[must_use]
        pub fn response_timeout(mut self, timeout: Duration) -> Self {
            self.request_mut().response_timeout = Some(timeout);
            self
        }
    };
}

impl Request {
    /// Build a new [`Request`]
    #[must_use]
    pub fn builder(subject: Subject) -> RequestBuilder {
        RequestBuilder::subject(subject)
    }

    /// Publish this request to `client`
    pub fn client(self, client: &Client) -> DoClientRequest<'_> {
        DoClientRequest {
            client,
            request: self,
        }
    }
}

impl RequestBuilder {
    #[must_use]
    pub fn subject(subject: Subject) -> Self {
        Self {
            request: Request {
                publish: Publish {
                    subject,
                    reply_subject: None,
                    headers: HeaderMap::new(),
                    payload: Bytes::new(),
                },
                response_timeout: None,
            },
        }
    }

    request!();

    #[must_use]
    pub fn payload(mut self, payload: Bytes) -> Request {
        self.request.publish.payload = payload;
        self.request
    }

    fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }
}

impl<'a> ClientRequest<'a> {
    pub(crate) fn build(client: &'a Client, subject: Subject) -> Self {
        Self {
            client,
            request: RequestBuilder::subject(subject).request,
        }
    }

    request!();

    pub fn payload(mut self, payload: Bytes) -> DoClientRequest<'a> {
        self.request.publish.payload = payload;
        self.request.client(self.client)
    }

    fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }
}

impl DoClientRequest<'_> {
    /// Publish this request if there's enough immediately available
    /// space in the internal buffers
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails validation, if the
    /// client's buffer is full or if the client has been closed.
    pub fn try_request(self) -> Result<ResponseFut, PublishError> {
        try_request(self.client, self.request)
    }
}

impl<'a> IntoFuture for DoClientRequest<'a> {
    type Output = Result<ResponseFut, PublishError>;
    type IntoFuture = BoxFuture<'a, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { request(self.client, self.request).await })
    }
}

impl Future for ResponseFut {
    type Output = Result<ServerMessage, ResponseError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let translate_no_responders = *this.translate_no_responders;

        match this.subscription {
            ResponseSubscription::Multiplexed(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Pending => match this.timeout.poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(()) => Poll::Ready(Err(ResponseError::TimedOut)),
                },
                Poll::Ready(Ok(message))
                    if translate_no_responders
                        && message.status_code == Some(StatusCode::NO_RESPONDERS) =>
                {
                    Poll::Ready(Err(ResponseError::NoResponders))
                }
                Poll::Ready(Ok(message)) => Poll::Ready(Ok(message)),
                Poll::Ready(Err(_err)) => Poll::Ready(Err(ResponseError::SubscriptionClosed)),
            },
            ResponseSubscription::Subscription(subscription) => {
                match Pin::new(subscription).poll_next(cx) {
                    Poll::Pending => match this.timeout.poll(cx) {
                        Poll::Pending => Poll::Pending,
                        Poll::Ready(()) => Poll::Ready(Err(ResponseError::TimedOut)),
                    },
                    Poll::Ready(Some(Ok(message)))
                        if translate_no_responders
                            && message.status_code == Some(StatusCode::NO_RESPONDERS) =>
                    {
                        Poll::Ready(Err(ResponseError::NoResponders))
                    }
                    Poll::Ready(Some(Ok(message))) => Poll::Ready(Ok(message)),
                    Poll::Ready(Some(Err(server_error))) => {
                        Poll::Ready(Err(ResponseError::ServerError(server_error)))
                    }
                    Poll::Ready(None) => Poll::Ready(Err(ResponseError::SubscriptionClosed)),
                }
            }
        }
    }
}

fn try_request(client: &Client, request: Request) -> Result<ResponseFut, PublishError> {
    client.check_publish(&request.publish.subject, request.publish.payload.len())?;

    let subscription = if let Some(reply_subject) = &request.publish.reply_subject {
        let subscription = client
            .try_subscribe(reply_subject.clone(), None)
            .map_err(from_try_command_error)?;
        client.lazy_unsubscribe(subscription.id, Some(NonZeroU64::new(1).unwrap()));

        request.publish.client(client).try_publish()?;
        ResponseSubscription::Subscription(subscription)
    } else {
        let receiver = client
            .try_multiplexed_request(
                request.publish.subject,
                request.publish.headers,
                request.publish.payload,
            )
            .map_err(from_try_command_error)?;
        ResponseSubscription::Multiplexed(receiver)
    };

    Ok(response_fut(client, subscription, request.response_timeout))
}

async fn request(client: &Client, request: Request) -> Result<ResponseFut, PublishError> {
    client.check_publish(&request.publish.subject, request.publish.payload.len())?;

    let subscription = if let Some(reply_subject) = &request.publish.reply_subject {
        let subscription = client
            .subscribe(reply_subject.clone(), None)
            .await
            .map_err(PublishError::Closed)?;
        client.lazy_unsubscribe(subscription.id, Some(NonZeroU64::new(1).unwrap()));

        request.publish.client(client).await?;
        ResponseSubscription::Subscription(subscription)
    } else {
        let receiver = client
            .multiplexed_request(
                request.publish.subject,
                request.publish.headers,
                request.publish.payload,
            )
            .await
            .map_err(PublishError::Closed)?;
        ResponseSubscription::Multiplexed(receiver)
    };

    Ok(response_fut(client, subscription, request.response_timeout))
}

fn response_fut(
    client: &Client,
    subscription: ResponseSubscription,
    response_timeout: Option<Duration>,
) -> ResponseFut {
    ResponseFut {
        subscription,
        timeout: sleep(response_timeout.unwrap_or(client.default_response_timeout())),
        translate_no_responders: client.translate_no_responders(),
    }
}

fn from_try_command_error(err: TryCommandError) -> PublishError {
    match err {
        TryCommandError::BufferFull => PublishError::BufferFull,
        TryCommandError::Closed(closed) => PublishError::Closed(closed),
    }
}

impl Debug for ClientRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRequest")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Debug for DoClientRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoClientRequest")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
