use core::fmt::{self, Write as _};
#[cfg(feature = "std")]
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::headers::HeaderMap;
use crate::util::ChunkList;
use crate::MessageBase;

use super::ClientOp;

/// Payloads below this size are copied into the flattened buffer
/// instead of being chained as separate chunks
const FLATTEN_THRESHOLD: usize = 4096;

/// The outgoing write queue
///
/// Commands are serialized by [`StreamEncoder::enqueue_write_op`] and
/// drained through the [`Buf`] implementation. Control line bytes are
/// flattened into a contiguous buffer, while payloads at or above
/// [`FLATTEN_THRESHOLD`] are appended as shared [`Bytes`] chunks
/// without copying.
///
/// Serialization never performs I/O and never blocks; the connection
/// owns the draining.
#[derive(Debug)]
pub struct StreamEncoder {
    chunks: ChunkList,
    flattened: BytesMut,
}

impl StreamEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: ChunkList::new(),
            flattened: BytesMut::new(),
        }
    }

    /// Append the wire encoding of `item` to the write queue
    pub fn enqueue_write_op(&mut self, item: &ClientOp) {
        macro_rules! control {
            ($dst:expr) => {
                write!(FlattenedWriter(self), $dst).expect("infallible control line write")
            };
        }

        match item {
            ClientOp::Publish { message } => {
                let MessageBase {
                    subject,
                    reply_subject,
                    headers,
                    payload,
                } = &message;
                let verb = if headers.is_empty() { "PUB" } else { "HPUB" };

                control!("{verb} {subject} ");
                if let Some(reply_subject) = reply_subject {
                    control!("{reply_subject} ");
                }

                if headers.is_empty() {
                    let payload_len = payload.len();
                    control!("{payload_len}\r\n");
                } else {
                    let headers_len = header_chunks(headers).map(str::len).sum::<usize>();
                    let total_len = headers_len + payload.len();
                    control!("{headers_len} {total_len}\r\n");

                    header_chunks(headers).for_each(|s| self.put_flattened(s.as_bytes()));
                }

                self.put_payload(payload);
                self.put_flattened(b"\r\n");
            }
            ClientOp::Subscribe {
                id,
                subject,
                queue_group,
            } => match queue_group {
                Some(queue_group) => control!("SUB {subject} {queue_group} {id}\r\n"),
                None => control!("SUB {subject} {id}\r\n"),
            },
            ClientOp::Unsubscribe { id, max_messages } => match max_messages {
                Some(max_messages) => control!("UNSUB {id} {max_messages}\r\n"),
                None => control!("UNSUB {id}\r\n"),
            },
            ClientOp::Connect { connect } => {
                self.put_flattened(b"CONNECT ");
                let connect = serde_json::to_vec(&connect).expect("serialize `Connect`");
                self.put_flattened(&connect);
                self.put_flattened(b"\r\n");
            }
            ClientOp::Ping => self.put_flattened(b"PING\r\n"),
            ClientOp::Pong => self.put_flattened(b"PONG\r\n"),
        }
    }

    fn put_flattened(&mut self, buf: &[u8]) {
        self.flattened.extend_from_slice(buf);
    }

    fn put_payload(&mut self, payload: &Bytes) {
        if payload.is_empty() {
            return;
        }

        if payload.len() < FLATTEN_THRESHOLD {
            self.flattened.extend_from_slice(payload);
        } else {
            if !self.flattened.is_empty() {
                let buffered = self.flattened.split().freeze();
                self.chunks.push(buffered);
            }

            self.chunks.push(Bytes::clone(payload));
        }
    }

    #[cfg(test)]
    fn all_bytes(&mut self) -> alloc::vec::Vec<u8> {
        self.copy_to_bytes(self.remaining()).to_vec()
    }
}

impl Buf for StreamEncoder {
    fn remaining(&self) -> usize {
        self.chunks.remaining() + self.flattened.remaining()
    }

    fn has_remaining(&self) -> bool {
        self.chunks.has_remaining() || self.flattened.has_remaining()
    }

    fn chunk(&self) -> &[u8] {
        let chunk = self.chunks.chunk();
        if chunk.is_empty() {
            &self.flattened
        } else {
            chunk
        }
    }

    #[cfg(feature = "std")]
    fn chunks_vectored<'a>(&'a self, dst: &mut [io::IoSlice<'a>]) -> usize {
        let mut n = self.chunks.chunks_vectored(dst);
        n += self.flattened.chunks_vectored(&mut dst[n..]);
        n
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining());

        let mid = self.chunks.remaining().min(cnt);
        self.chunks.advance(mid);

        let rem = cnt - mid;
        if rem == self.flattened.len() {
            self.flattened.clear();
        } else {
            self.flattened.advance(rem);
        }
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        assert!(
            len <= self.remaining(),
            "copy_to_bytes out of range ({} <= {})",
            len,
            self.remaining()
        );

        if self.chunks.remaining() >= len {
            self.chunks.copy_to_bytes(len)
        } else if !self.chunks.has_remaining() {
            self.flattened.copy_to_bytes(len)
        } else {
            let rem = len - self.chunks.remaining();

            let mut buf = BytesMut::with_capacity(len);
            buf.put(&mut self.chunks);
            buf.put_slice(&self.flattened[..rem]);

            if self.flattened.remaining() == rem {
                self.flattened.clear();
            } else {
                self.flattened.advance(rem);
            }

            buf.freeze()
        }
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

struct FlattenedWriter<'a>(&'a mut StreamEncoder);

impl fmt::Write for FlattenedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_flattened(s.as_bytes());
        Ok(())
    }
}

fn header_chunks(headers: &HeaderMap) -> impl Iterator<Item = &'_ str> {
    let head = ["NATS/1.0\r\n"];
    let headers = headers.iter().flat_map(|(name, values)| {
        values.flat_map(|value| [name.as_str(), ": ", value.as_str(), "\r\n"])
    });
    let footer = ["\r\n"];

    head.into_iter().chain(headers).chain(footer)
}

#[cfg(test)]
mod tests {
    use core::num::NonZeroU64;

    use bytes::{Buf, Bytes};

    use crate::{
        headers::{HeaderMap, HeaderName, HeaderValue},
        proto::ClientOp,
        MessageBase, QueueGroup, Subject,
    };

    use super::StreamEncoder;

    #[test]
    fn encode_ping_pong() {
        let mut encoder = StreamEncoder::new();
        encoder.enqueue_write_op(&ClientOp::Ping);
        encoder.enqueue_write_op(&ClientOp::Pong);
        assert_eq!("PING\r\nPONG\r\n".as_bytes(), encoder.all_bytes());
    }

    #[test]
    fn encode_subscribe() {
        let mut encoder = StreamEncoder::new();
        encoder.enqueue_write_op(&ClientOp::Subscribe {
            id: 1.into(),
            subject: Subject::from_static("orders.new"),
            queue_group: None,
        });
        assert_eq!("SUB orders.new 1\r\n".as_bytes(), encoder.all_bytes());
    }

    #[test]
    fn encode_subscribe_with_queue_group() {
        let mut encoder = StreamEncoder::new();
        encoder.enqueue_write_op(&ClientOp::Subscribe {
            id: 1.into(),
            subject: Subject::from_static("orders.new"),
            queue_group: Some(QueueGroup::from_static("workers")),
        });
        assert_eq!(
            "SUB orders.new workers 1\r\n".as_bytes(),
            encoder.all_bytes()
        );
    }

    #[test]
    fn encode_unsubscribe() {
        let mut encoder = StreamEncoder::new();
        encoder.enqueue_write_op(&ClientOp::Unsubscribe {
            id: 1.into(),
            max_messages: None,
        });
        encoder.enqueue_write_op(&ClientOp::Unsubscribe {
            id: 2.into(),
            max_messages: Some(NonZeroU64::new(5).unwrap()),
        });
        assert_eq!("UNSUB 1\r\nUNSUB 2 5\r\n".as_bytes(), encoder.all_bytes());
    }

    #[test]
    fn encode_publish() {
        let mut encoder = StreamEncoder::new();
        encoder.enqueue_write_op(&ClientOp::Publish {
            message: MessageBase {
                subject: Subject::from_static("orders.new"),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::from_static(b"fresh melon"),
            },
        });
        assert_eq!(
            "PUB orders.new 11\r\nfresh melon\r\n".as_bytes(),
            encoder.all_bytes()
        );
    }

    #[test]
    fn encode_publish_with_reply() {
        let mut encoder = StreamEncoder::new();
        encoder.enqueue_write_op(&ClientOp::Publish {
            message: MessageBase {
                subject: Subject::from_static("orders.new"),
                reply_subject: Some(Subject::from_static("_INBOX.abc.1")),
                headers: HeaderMap::new(),
                payload: Bytes::from_static(b"fresh melon"),
            },
        });
        assert_eq!(
            "PUB orders.new _INBOX.abc.1 11\r\nfresh melon\r\n".as_bytes(),
            encoder.all_bytes()
        );
    }

    #[test]
    fn encode_publish_with_headers() {
        let mut encoder = StreamEncoder::new();
        encoder.enqueue_write_op(&ClientOp::Publish {
            message: MessageBase {
                subject: Subject::from_static("orders.new"),
                reply_subject: None,
                headers: [
                    (
                        HeaderName::from_static("Nats-Msg-Id"),
                        HeaderValue::from_static("abcd"),
                    ),
                    (
                        HeaderName::from_static("Nats-Expected-Stream"),
                        HeaderValue::from_static("ORDERS"),
                    ),
                ]
                .into_iter()
                .collect(),
                payload: Bytes::from_static(b"hello"),
            },
        });
        assert_eq!(
            "HPUB orders.new 61 66\r\nNATS/1.0\r\nNats-Expected-Stream: ORDERS\r\nNats-Msg-Id: abcd\r\n\r\nhello\r\n"
                .as_bytes(),
            encoder.all_bytes()
        );
    }

    #[test]
    fn large_payload_is_chained_not_copied() {
        let payload = Bytes::from(alloc::vec![b'x'; 8192]);
        let mut encoder = StreamEncoder::new();
        encoder.enqueue_write_op(&ClientOp::Publish {
            message: MessageBase {
                subject: Subject::from_static("big"),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: payload.clone(),
            },
        });

        // "PUB big 8192\r\n" + payload + "\r\n"
        assert_eq!(encoder.remaining(), 14 + 8192 + 2);
        let encoded = encoder.copy_to_bytes(14 + 8192 + 2);
        assert!(encoded.starts_with(b"PUB big 8192\r\n"));
        assert!(encoded.ends_with(b"\r\n"));
    }
}
