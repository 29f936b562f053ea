use bytes::Bytes;

use crate::{headers::HeaderMap, subscription_id::SubscriptionId, StatusCode, Subject};

/// The parts of a message shared by both publish and delivery directions
///
/// The payload and the header values are reference counted slices of
/// the buffer they were parsed from or built into, so cloning a
/// message never copies its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBase {
    pub subject: Subject,
    pub reply_subject: Option<Subject>,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

/// A message delivered by the server through `MSG` or `HMSG`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// The status code of the `NATS/1.0` head line, if any
    pub status_code: Option<StatusCode>,
    /// The subscription this message was routed to
    pub subscription_id: SubscriptionId,
    pub base: MessageBase,
}
