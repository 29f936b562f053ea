use alloc::boxed::Box;

use crate::{error::ServerError, message::ServerMessage, ServerInfo};

/// An event produced by the server
///
/// `MSG` and `HMSG` both decode into [`ServerOp::Message`]; a message
/// originating from `HMSG` carries a non-empty header map and possibly
/// an inline status code.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerOp {
    Info { info: Box<ServerInfo> },
    Message { message: ServerMessage },
    Ok,
    Error { error: ServerError },
    Ping,
    Pong,
}
