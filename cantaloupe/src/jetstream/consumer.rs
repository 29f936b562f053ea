use std::time::Duration;

use cantaloupe_proto::{QueueGroup, Subject};
use serde::{Deserialize, Serialize};

/// The configuration of a JetStream consumer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Subject the server pushes messages to; `None` for pull consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_group: Option<QueueGroup>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(default, with = "option_nanos", skip_serializing_if = "Option::is_none")]
    pub ack_wait: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<Subject>,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    /// Ask the server to interleave flow control messages into the
    /// push delivery stream
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub flow_control: bool,
    /// Interval of the zero-payload heartbeats the server sends while
    /// the push delivery stream is idle
    #[serde(default, with = "option_nanos", skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
}

/// From which position the consumer starts replaying the stream
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    LastPerSubject,
    New,
}

/// Which deliveries require an acknowledgement
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    None,
    All,
    #[default]
    Explicit,
}

/// The pace at which the stream is replayed
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// The server-side state of a consumer
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub config: ConsumerConfig,
    /// Highest sequences the server has sent out
    #[serde(default)]
    pub delivered: SequenceInfo,
    /// Highest sequences acknowledged by consumers
    #[serde(default)]
    pub ack_floor: SequenceInfo,
    /// Messages matching the consumer that haven't been sent yet
    #[serde(default)]
    pub num_pending: u64,
}

/// A consumer/stream sequence pair
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SequenceInfo {
    #[serde(default)]
    pub consumer_seq: u64,
    #[serde(default)]
    pub stream_seq: u64,
}

/// The server-side state of a stream
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    #[serde(default)]
    pub state: StreamState,
}

/// The configuration of a stream, as reported by the server
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub max_msgs: Option<i64>,
    #[serde(default)]
    pub max_bytes: Option<i64>,
}

/// Message accounting of a stream
#[derive(Debug, Copy, Clone, Default, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub first_seq: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub consumer_count: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamNamesRequest<'a> {
    pub(crate) subject: &'a Subject,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamNamesResponse {
    #[serde(default)]
    pub(crate) streams: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateConsumerRequest<'a> {
    pub(crate) stream_name: &'a str,
    pub(crate) config: &'a ConsumerConfig,
}

#[derive(Debug, Serialize)]
pub(crate) struct NextRequest {
    pub(crate) batch: usize,
    #[serde(default, with = "option_nanos", skip_serializing_if = "Option::is_none")]
    pub(crate) expires: Option<Duration>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub(crate) no_wait: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeleteResponse {
    #[serde(default)]
    pub(crate) success: bool,
}

mod option_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[expect(clippy::ref_option, reason = "serde requires this signature")]
    pub(crate) fn serialize<S>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => u64::try_from(duration.as_nanos())
                .map_err(serde::ser::Error::custom)?
                .serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let nanos = Option::<u64>::deserialize(deserializer)?;
        Ok(nanos
            .filter(|&nanos| nanos > 0)
            .map(Duration::from_nanos))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cantaloupe_proto::Subject;

    use super::{AckPolicy, ConsumerConfig, ConsumerInfo, NextRequest};

    #[test]
    fn consumer_config_round_trips() {
        let config = ConsumerConfig {
            durable_name: Some("worker".to_owned()),
            deliver_subject: Some(Subject::from_static("_INBOX.abc")),
            ack_policy: AckPolicy::Explicit,
            ack_wait: Some(Duration::from_secs(30)),
            filter_subject: Some(Subject::from_static("orders.new")),
            flow_control: true,
            idle_heartbeat: Some(Duration::from_secs(5)),
            ..ConsumerConfig::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"ack_wait\":30000000000"));
        assert!(json.contains("\"flow_control\":true"));

        let back = serde_json::from_str::<ConsumerConfig>(&json).unwrap();
        assert_eq!(back.durable_name.as_deref(), Some("worker"));
        assert_eq!(back.ack_wait, Some(Duration::from_secs(30)));
        assert_eq!(back.idle_heartbeat, Some(Duration::from_secs(5)));
        assert!(back.flow_control);
    }

    #[test]
    fn consumer_info_parses_server_response() {
        let info = serde_json::from_str::<ConsumerInfo>(
            r#"{
                "stream_name":"ORDERS","name":"worker",
                "created":"2024-01-01T00:00:00Z",
                "config":{"durable_name":"worker","ack_policy":"explicit","deliver_policy":"all","replay_policy":"instant"},
                "delivered":{"consumer_seq":10,"stream_seq":100},
                "ack_floor":{"consumer_seq":8,"stream_seq":98},
                "num_pending":5
            }"#,
        )
        .unwrap();
        assert_eq!(info.stream_name, "ORDERS");
        assert_eq!(info.delivered.consumer_seq, 10);
        assert_eq!(info.num_pending, 5);
        assert_eq!(info.config.ack_policy, AckPolicy::Explicit);
    }

    #[test]
    fn next_request_shapes() {
        let no_wait = serde_json::to_string(&NextRequest {
            batch: 10,
            expires: None,
            no_wait: true,
        })
        .unwrap();
        assert_eq!(no_wait, r#"{"batch":10,"no_wait":true}"#);

        let expiring = serde_json::to_string(&NextRequest {
            batch: 5,
            expires: Some(Duration::from_millis(900)),
            no_wait: false,
        })
        .unwrap();
        assert_eq!(expiring, r#"{"batch":5,"expires":900000000}"#);
    }
}
