use core::mem;

use bytes::{Buf, Bytes, BytesMut};
use bytestring::ByteString;

use crate::{
    error::ServerError,
    headers::{
        error::{HeaderNameValidateError, HeaderValueValidateError},
        HeaderMap, HeaderName, HeaderValue,
    },
    status_code::StatusCodeError,
    util::{self, ParseUintError},
    MessageBase, ServerMessage, StatusCode, Subject, SubscriptionId,
};

use super::ServerOp;

const MAX_CONTROL_LINE_LEN: usize = 16 * 1024;
const INITIAL_READ_BUF_CAPACITY: usize = 64 * 1024;

/// An incremental decoder for the byte stream coming from the server
///
/// Bytes are appended to the rolling read buffer obtained from
/// [`StreamDecoder::read_buf`] and consumed by [`StreamDecoder::decode`].
/// The subjects, headers and payloads of decoded messages are slices
/// of that buffer, so decoding a message performs no byte copies.
///
/// A decoder is owned by a single connection and is not reusable
/// after it reports an error.
#[derive(Debug)]
pub struct StreamDecoder {
    read_buf: BytesMut,
    state: ParseState,
}

#[derive(Debug)]
enum ParseState {
    /// Scanning for the CRLF terminating the control line.
    /// `scanned` is the buffer length at the previous attempt, so a
    /// retry without new bytes returns immediately.
    ControlLine {
        scanned: usize,
    },
    CollectHeaders {
        subscription_id: SubscriptionId,
        subject: Subject,
        reply_subject: Option<Subject>,
        header_len: usize,
        payload_len: usize,
    },
    CollectPayload {
        subscription_id: SubscriptionId,
        subject: Subject,
        reply_subject: Option<Subject>,
        status_code: Option<StatusCode>,
        headers: HeaderMap,
        payload_len: usize,
    },
    Failed,
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(INITIAL_READ_BUF_CAPACITY),
            state: ParseState::ControlLine { scanned: 0 },
        }
    }

    /// Access the read buffer new bytes from the socket must be appended to
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Decode the next [`ServerOp`] out of the read buffer
    ///
    /// A `None` variant is returned when more bytes are needed.
    ///
    /// # Errors
    ///
    /// It returns an error if the byte stream violates the protocol.
    /// Decoding errors are fatal: the connection that fed the decoder
    /// must be torn down.
    pub fn decode(&mut self) -> Result<Option<ServerOp>, ProtocolError> {
        loop {
            match &mut self.state {
                ParseState::ControlLine { scanned } => {
                    if *scanned == self.read_buf.len() {
                        return Ok(None);
                    }

                    let Some(line_len) = memchr::memmem::find(&self.read_buf, b"\r\n") else {
                        if self.read_buf.len() > MAX_CONTROL_LINE_LEN {
                            self.state = ParseState::Failed;
                            return Err(ProtocolError::ControlLineTooLong {
                                len: self.read_buf.len(),
                            });
                        }

                        *scanned = self.read_buf.len();
                        return Ok(None);
                    };

                    let mut line = self.read_buf.split_to(line_len + "\r\n".len()).freeze();
                    line.truncate(line.len() - "\r\n".len());
                    self.state = ParseState::ControlLine { scanned: 0 };

                    match decode_control_line(line) {
                        Ok(ControlLine::Op(op)) => return Ok(Some(op)),
                        Ok(ControlLine::Partial(state)) => self.state = state,
                        Err(err) => {
                            self.state = ParseState::Failed;
                            return Err(err);
                        }
                    }
                }
                ParseState::CollectHeaders { header_len, .. } => {
                    if self.read_buf.len() < *header_len {
                        return Ok(None);
                    }

                    let ParseState::CollectHeaders {
                        subscription_id,
                        subject,
                        reply_subject,
                        header_len,
                        payload_len,
                    } = mem::replace(&mut self.state, ParseState::Failed)
                    else {
                        unreachable!()
                    };

                    let block = self.read_buf.split_to(header_len).freeze();
                    let (status_code, headers) = decode_header_block(block)?;
                    self.state = ParseState::CollectPayload {
                        subscription_id,
                        subject,
                        reply_subject,
                        status_code,
                        headers,
                        payload_len,
                    };
                }
                ParseState::CollectPayload { payload_len, .. } => {
                    if self.read_buf.len() < *payload_len + "\r\n".len() {
                        return Ok(None);
                    }

                    let ParseState::CollectPayload {
                        subscription_id,
                        subject,
                        reply_subject,
                        status_code,
                        headers,
                        payload_len,
                    } = mem::replace(&mut self.state, ParseState::ControlLine { scanned: 0 })
                    else {
                        unreachable!()
                    };

                    let payload = self.read_buf.split_to(payload_len).freeze();
                    if !self.read_buf.starts_with(b"\r\n") {
                        self.state = ParseState::Failed;
                        return Err(ProtocolError::MissingPayloadTerminator);
                    }
                    self.read_buf.advance("\r\n".len());

                    let message = ServerMessage {
                        status_code,
                        subscription_id,
                        base: MessageBase {
                            subject,
                            reply_subject,
                            headers,
                            payload,
                        },
                    };
                    return Ok(Some(ServerOp::Message { message }));
                }
                ParseState::Failed => return Err(ProtocolError::Failed),
            }
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

enum ControlLine {
    Op(ServerOp),
    Partial(ParseState),
}

fn verb(line: &[u8], verb: &'static [u8]) -> bool {
    line.len() >= verb.len() && line[..verb.len()].eq_ignore_ascii_case(verb)
}

fn decode_control_line(mut line: Bytes) -> Result<ControlLine, ProtocolError> {
    if verb(&line, b"MSG ") {
        line.advance("MSG ".len());
        decode_msg_args(line).map(ControlLine::Partial)
    } else if verb(&line, b"HMSG ") {
        line.advance("HMSG ".len());
        decode_hmsg_args(line).map(ControlLine::Partial)
    } else if verb(&line, b"PING") {
        Ok(ControlLine::Op(ServerOp::Ping))
    } else if verb(&line, b"PONG") {
        Ok(ControlLine::Op(ServerOp::Pong))
    } else if verb(&line, b"+OK") {
        Ok(ControlLine::Op(ServerOp::Ok))
    } else if verb(&line, b"-ERR ") {
        line.advance("-ERR ".len());
        if !line.starts_with(b"'") || !line.ends_with(b"'") {
            return Err(ProtocolError::InvalidErrorMessage);
        }

        line.advance(1);
        line.truncate(line.len() - 1);
        let raw_message =
            ByteString::try_from(line).map_err(|_| ProtocolError::InvalidErrorMessage)?;
        Ok(ControlLine::Op(ServerOp::Error {
            error: ServerError::parse(raw_message),
        }))
    } else if verb(&line, b"INFO ") {
        let info =
            serde_json::from_slice(&line["INFO ".len()..]).map_err(ProtocolError::InvalidInfo)?;
        Ok(ControlLine::Op(ServerOp::Info { info }))
    } else {
        Err(ProtocolError::UnknownVerb)
    }
}

fn decode_msg_args(args: Bytes) -> Result<ParseState, ProtocolError> {
    let mut args = util::split_args(args);
    let (subject, subscription_id, reply_subject, payload_len) =
        match (args.next(), args.next(), args.next(), args.next(), args.next()) {
            (Some(subject), Some(sid), Some(reply), Some(len), None) => {
                (subject, sid, Some(reply), len)
            }
            (Some(subject), Some(sid), Some(len), None, None) => (subject, sid, None, len),
            _ => return Err(ProtocolError::InvalidMsgArgsCount),
        };

    Ok(ParseState::CollectPayload {
        subscription_id: decode_sid(&subscription_id)?,
        subject: decode_subject(subject)?,
        reply_subject: reply_subject.map(decode_subject).transpose()?,
        status_code: None,
        headers: HeaderMap::new(),
        payload_len: util::parse_usize(&payload_len)
            .map_err(ProtocolError::InvalidPayloadLength)?,
    })
}

fn decode_hmsg_args(args: Bytes) -> Result<ParseState, ProtocolError> {
    let mut args = util::split_args(args);
    let (subject, subscription_id, reply_subject, header_len, total_len) = match (
        args.next(),
        args.next(),
        args.next(),
        args.next(),
        args.next(),
        args.next(),
    ) {
        (Some(subject), Some(sid), Some(reply), Some(header_len), Some(total_len), None) => {
            (subject, sid, Some(reply), header_len, total_len)
        }
        (Some(subject), Some(sid), Some(header_len), Some(total_len), None, None) => {
            (subject, sid, None, header_len, total_len)
        }
        _ => return Err(ProtocolError::InvalidHmsgArgsCount),
    };

    let header_len =
        util::parse_usize(&header_len).map_err(ProtocolError::InvalidHeaderLength)?;
    let total_len = util::parse_usize(&total_len).map_err(ProtocolError::InvalidPayloadLength)?;
    let payload_len = total_len
        .checked_sub(header_len)
        .ok_or(ProtocolError::InvalidTotalLength)?;

    Ok(ParseState::CollectHeaders {
        subscription_id: decode_sid(&subscription_id)?,
        subject: decode_subject(subject)?,
        reply_subject: reply_subject.map(decode_subject).transpose()?,
        header_len,
        payload_len,
    })
}

fn decode_subject(subject: Bytes) -> Result<Subject, ProtocolError> {
    // Subjects chosen by the server are trusted not to require
    // re-validation on the hot path
    ByteString::try_from(subject)
        .map(Subject::from_dangerous_value)
        .map_err(|_| ProtocolError::SubjectInvalidUtf8)
}

fn decode_sid(sid: &[u8]) -> Result<SubscriptionId, ProtocolError> {
    SubscriptionId::from_ascii_bytes(sid).map_err(ProtocolError::SubscriptionId)
}

fn decode_header_block(block: Bytes) -> Result<(Option<StatusCode>, HeaderMap), ProtocolError> {
    let mut lines = util::crlf_lines(block);
    let head = lines.next().ok_or(ProtocolError::MissingHeadersLine)?;
    let head = head
        .strip_prefix(b"NATS/1.0")
        .ok_or(ProtocolError::InvalidHeadersLine)?;
    let status_code = if head.len() >= 4 {
        Some(StatusCode::from_ascii_bytes(&head[1..4]).map_err(ProtocolError::StatusCode)?)
    } else {
        None
    };

    let headers = lines
        .filter(|line| !line.is_empty())
        .map(|mut line| {
            let i = memchr::memchr(b':', &line).ok_or(ProtocolError::InvalidHeaderLine)?;

            let name = line.split_to(i);
            line.advance(":".len());
            if line.first().is_some_and(u8::is_ascii_whitespace) {
                line.advance(1);
            }

            let name = HeaderName::try_from(
                ByteString::try_from(name).map_err(|_| ProtocolError::HeaderNameInvalidUtf8)?,
            )
            .map_err(ProtocolError::HeaderName)?;
            let value = HeaderValue::try_from(
                ByteString::try_from(line).map_err(|_| ProtocolError::HeaderValueInvalidUtf8)?,
            )
            .map_err(ProtocolError::HeaderValue)?;
            Ok((name, value))
        })
        .collect::<Result<_, _>>()?;

    Ok((status_code, headers))
}

/// A fatal violation of the wire protocol
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("control line exceeded the maximum length (len {len} maximum {MAX_CONTROL_LINE_LEN})")]
    ControlLineTooLong { len: usize },
    #[error("unknown protocol verb")]
    UnknownVerb,
    #[error("MSG has an unexpected number of arguments")]
    InvalidMsgArgsCount,
    #[error("HMSG has an unexpected number of arguments")]
    InvalidHmsgArgsCount,
    #[error("the subject isn't valid utf-8")]
    SubjectInvalidUtf8,
    #[error("couldn't parse the subscription id")]
    SubscriptionId(#[source] ParseUintError),
    #[error("couldn't parse the header length")]
    InvalidHeaderLength(#[source] ParseUintError),
    #[error("couldn't parse the payload length")]
    InvalidPayloadLength(#[source] ParseUintError),
    #[error("the header length is greater than the total length")]
    InvalidTotalLength,
    #[error("the payload is not CRLF terminated")]
    MissingPayloadTerminator,
    #[error("HMSG is missing the NATS/1.0 line")]
    MissingHeadersLine,
    #[error("HMSG has an invalid NATS/1.0 line")]
    InvalidHeadersLine,
    #[error("HMSG header line is missing ':'")]
    InvalidHeaderLine,
    #[error("couldn't parse the status code")]
    StatusCode(#[source] StatusCodeError),
    #[error("a header name isn't valid utf-8")]
    HeaderNameInvalidUtf8,
    #[error("a header name couldn't be parsed")]
    HeaderName(#[source] HeaderNameValidateError),
    #[error("a header value isn't valid utf-8")]
    HeaderValueInvalidUtf8,
    #[error("a header value couldn't be parsed")]
    HeaderValue(#[source] HeaderValueValidateError),
    #[error("INFO JSON payload couldn't be deserialized")]
    InvalidInfo(#[source] serde_json::Error),
    #[error("-ERR message couldn't be parsed")]
    InvalidErrorMessage,
    #[error("the decoder previously failed")]
    Failed,
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut as _, Bytes};
    use claims::{assert_err, assert_ok_eq};

    use crate::{
        error::ServerError,
        headers::{HeaderMap, HeaderName, HeaderValue},
        message::{MessageBase, ServerMessage},
        proto::ServerOp,
        StatusCode, Subject,
    };

    use super::StreamDecoder;

    #[test]
    fn decode_ping_pong_ok() {
        let mut decoder = StreamDecoder::new();
        decoder
            .read_buf()
            .put(Bytes::from_static(b"PING\r\nPONG\r\n+OK\r\n"));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Ping));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Pong));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Ok));
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_verbs_case_insensitively() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"ping\r\nPonG\r\n"));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Ping));
        assert_ok_eq!(decoder.decode(), Some(ServerOp::Pong));
    }

    #[test]
    fn decode_error() {
        let mut decoder = StreamDecoder::new();
        decoder
            .read_buf()
            .put(Bytes::from_static(b"-ERR 'Authorization Violation'\r\n"));
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Error {
                error: ServerError::AuthorizationViolation
            })
        );
    }

    #[test]
    fn decode_msg() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"MSG orders.new 9 11\r\nfresh melon\r\n",
        ));
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Message {
                message: ServerMessage {
                    status_code: None,
                    subscription_id: 9.into(),
                    base: MessageBase {
                        subject: Subject::from_static("orders.new"),
                        reply_subject: None,
                        headers: HeaderMap::new(),
                        payload: Bytes::from_static(b"fresh melon"),
                    }
                }
            })
        );
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_msg_with_reply() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"MSG orders.new 9 _INBOX.abc.1 2\r\nok\r\n",
        ));
        let Ok(Some(ServerOp::Message { message })) = decoder.decode() else {
            panic!("expected message");
        };
        assert_eq!(
            message.base.reply_subject,
            Some(Subject::from_static("_INBOX.abc.1"))
        );
    }

    #[test]
    fn decode_msg_split_across_reads() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"MSG orders"));
        assert_ok_eq!(decoder.decode(), None);
        decoder.read_buf().put(Bytes::from_static(b".new 9 11\r\nfresh "));
        assert_ok_eq!(decoder.decode(), None);
        decoder.read_buf().put(Bytes::from_static(b"melon\r\n"));
        let Ok(Some(ServerOp::Message { message })) = decoder.decode() else {
            panic!("expected message");
        };
        assert_eq!(message.base.payload, Bytes::from_static(b"fresh melon"));
    }

    #[test]
    fn decode_hmsg() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"HMSG orders.new 9 31 36\r\nNATS/1.0\r\nNats-Msg-Id: abcd\r\n\r\nhello\r\n",
        ));
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerOp::Message {
                message: ServerMessage {
                    status_code: None,
                    subscription_id: 9.into(),
                    base: MessageBase {
                        subject: Subject::from_static("orders.new"),
                        reply_subject: None,
                        headers: [(
                            HeaderName::from_static("Nats-Msg-Id"),
                            HeaderValue::from_static("abcd"),
                        )]
                        .into_iter()
                        .collect(),
                        payload: Bytes::from_static(b"hello"),
                    }
                }
            })
        );
    }

    #[test]
    fn decode_hmsg_status_no_responders() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"HMSG _INBOX.abc.1 1 16 16\r\nNATS/1.0 503\r\n\r\n\r\n",
        ));
        let Ok(Some(ServerOp::Message { message })) = decoder.decode() else {
            panic!("expected message");
        };
        assert_eq!(message.status_code, Some(StatusCode::NO_RESPONDERS));
        assert!(message.base.payload.is_empty());
    }

    #[test]
    fn decode_info() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(
            b"INFO {\"server_id\":\"a\",\"max_payload\":1048576,\"proto\":1}\r\n",
        ));
        let Ok(Some(ServerOp::Info { info })) = decoder.decode() else {
            panic!("expected info");
        };
        assert_eq!(info.max_payload.get(), 1024 * 1024);
    }

    #[test]
    fn unknown_verb_is_fatal() {
        let mut decoder = StreamDecoder::new();
        decoder.read_buf().put(Bytes::from_static(b"WAT\r\n"));
        assert_err!(decoder.decode());
        // Poisoned from here on
        decoder.read_buf().put(Bytes::from_static(b"PING\r\n"));
        assert_err!(decoder.decode());
    }

    #[test]
    fn payload_missing_terminator_is_fatal() {
        let mut decoder = StreamDecoder::new();
        decoder
            .read_buf()
            .put(Bytes::from_static(b"MSG a 1 2\r\nabXX"));
        assert_err!(decoder.decode());
    }
}
