use std::num::ParseIntError;

use bytes::Bytes;
use cantaloupe_proto::{headers::HeaderMap, ServerMessage, Subject};
use chrono::{DateTime, Utc};

use crate::client::{PublishError, ResponseError};

use super::JetStreamContext;

/// A message delivered through a JetStream consumer
///
/// Wraps the plain [`ServerMessage`] with the consumer context needed
/// to acknowledge it.
#[derive(Debug)]
pub struct JetStreamMessage {
    pub(crate) message: ServerMessage,
    pub(crate) context: JetStreamContext,
}

/// The kind of acknowledgement sent back for a delivered message
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckKind {
    /// The message was processed; don't redeliver it
    Ack,
    /// The message couldn't be processed; redeliver it
    Nak,
    /// Processing continues; extend the ack window
    InProgress,
    /// The message cannot be processed; never redeliver it
    Term,
}

impl AckKind {
    fn payload(self) -> Bytes {
        Bytes::from_static(match self {
            Self::Ack => b"+ACK",
            Self::Nak => b"-NAK",
            Self::InProgress => b"+WPI",
            Self::Term => b"+TERM",
        })
    }
}

/// The metadata JetStream encodes into the reply subject of a
/// delivered message
///
/// Parsed lazily from
/// `$JS.ACK.<stream>.<consumer>.<delivered>.<stream seq>.<consumer seq>.<timestamp>.<pending>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMetadata {
    pub stream: String,
    pub consumer: String,
    /// How many times this message has been delivered
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    /// When the message was originally received by the stream
    pub timestamp: DateTime<Utc>,
    /// Messages still pending for the consumer after this one
    pub pending: u64,
}

/// An error encountered while parsing [`AckMetadata`]
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The message carries no reply subject
    #[error("the message carries no reply subject")]
    NoReplySubject,
    /// The reply subject doesn't follow the `$JS.ACK` grammar
    #[error("the reply subject doesn't follow the ack grammar")]
    Grammar,
    /// A numeric token couldn't be parsed
    #[error("invalid numeric token")]
    Number(#[source] ParseIntError),
}

/// An error encountered while acknowledging a message
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    /// The message carries no reply subject to acknowledge to
    #[error("the message carries no reply subject")]
    NoReplySubject,
    #[error("couldn't publish the acknowledgement")]
    Publish(#[source] PublishError),
    /// The server didn't confirm the acknowledgement in time
    #[error("no confirmation within the timeout")]
    Response(#[source] ResponseError),
}

impl AckMetadata {
    pub(crate) fn parse(reply_subject: &Subject) -> Result<Self, MetadataError> {
        let mut tokens = reply_subject.split('.');
        if tokens.next() != Some("$JS") || tokens.next() != Some("ACK") {
            return Err(MetadataError::Grammar);
        }

        let mut next = || tokens.next().ok_or(MetadataError::Grammar);
        let stream = next()?.to_owned();
        let consumer = next()?.to_owned();
        let delivered = next()?.parse().map_err(MetadataError::Number)?;
        let stream_sequence = next()?.parse().map_err(MetadataError::Number)?;
        let consumer_sequence = next()?.parse().map_err(MetadataError::Number)?;
        let timestamp_nanos = next()?.parse::<i64>().map_err(MetadataError::Number)?;
        let pending = next()?.parse().map_err(MetadataError::Number)?;

        if tokens.next().is_some() {
            return Err(MetadataError::Grammar);
        }

        Ok(Self {
            stream,
            consumer,
            delivered,
            stream_sequence,
            consumer_sequence,
            timestamp: DateTime::from_timestamp_nanos(timestamp_nanos),
            pending,
        })
    }

    pub(crate) fn parse_message(message: &ServerMessage) -> Result<Self, MetadataError> {
        let reply_subject = message
            .base
            .reply_subject
            .as_ref()
            .ok_or(MetadataError::NoReplySubject)?;
        Self::parse(reply_subject)
    }
}

impl JetStreamMessage {
    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.message.base.subject
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.message.base.payload
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.message.base.headers
    }

    /// Consume the wrapper, returning the plain message
    #[must_use]
    pub fn into_message(self) -> ServerMessage {
        self.message
    }

    /// The JetStream metadata of this delivery
    ///
    /// # Errors
    ///
    /// It returns an error if the message doesn't carry well formed
    /// ack metadata.
    pub fn metadata(&self) -> Result<AckMetadata, MetadataError> {
        AckMetadata::parse_message(&self.message)
    }

    /// Acknowledge the message
    ///
    /// # Errors
    ///
    /// It returns an error if the acknowledgement cannot be published.
    pub async fn ack(&self) -> Result<(), AckError> {
        self.send_ack(AckKind::Ack).await
    }

    /// Reject the message, asking for redelivery
    ///
    /// # Errors
    ///
    /// It returns an error if the acknowledgement cannot be published.
    pub async fn nak(&self) -> Result<(), AckError> {
        self.send_ack(AckKind::Nak).await
    }

    /// Signal that processing is still under way, extending the ack window
    ///
    /// # Errors
    ///
    /// It returns an error if the acknowledgement cannot be published.
    pub async fn in_progress(&self) -> Result<(), AckError> {
        self.send_ack(AckKind::InProgress).await
    }

    /// Reject the message, preventing any redelivery
    ///
    /// # Errors
    ///
    /// It returns an error if the acknowledgement cannot be published.
    pub async fn term(&self) -> Result<(), AckError> {
        self.send_ack(AckKind::Term).await
    }

    /// Acknowledge the message and wait for the server's confirmation
    ///
    /// # Errors
    ///
    /// It returns an error if the acknowledgement cannot be published
    /// or if the server doesn't confirm it within the context's
    /// request timeout.
    pub async fn ack_sync(&self) -> Result<(), AckError> {
        let Some(reply_subject) = &self.message.base.reply_subject else {
            return Err(AckError::NoReplySubject);
        };

        self.context
            .client()
            .request(reply_subject.clone())
            .response_timeout(self.context.request_timeout())
            .payload(AckKind::Ack.payload())
            .await
            .map_err(AckError::Publish)?
            .await
            .map_err(AckError::Response)?;
        Ok(())
    }

    async fn send_ack(&self, kind: AckKind) -> Result<(), AckError> {
        let Some(reply_subject) = &self.message.base.reply_subject else {
            return Err(AckError::NoReplySubject);
        };

        self.context
            .client()
            .publish(reply_subject.clone())
            .payload(kind.payload())
            .await
            .map_err(AckError::Publish)
    }
}
