use std::io;

use cantaloupe_proto::{
    error::ServerError,
    proto::{error::ProtocolError, ClientOp, ServerOp},
    Connect, Host, Security, ServerAddr, ServerInfo,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{connection::ReadError, Connection};

/// Open a TCP socket to `addr`
///
/// # Errors
///
/// It returns an error if name resolution or the TCP connect fail.
pub async fn connect_tcp(addr: &ServerAddr) -> io::Result<TcpStream> {
    let socket = match addr.host() {
        Host::Ip(ip) => TcpStream::connect((*ip, addr.port())).await?,
        Host::Dns(name) => TcpStream::connect((&**name, addr.port())).await?,
    };
    socket.set_nodelay(true)?;
    Ok(socket)
}

/// Perform the `INFO` → `CONNECT` → `PING` → `PONG` handshake
///
/// The returned [`ServerInfo`] is the one announced by the server at
/// the beginning of the exchange. The caller is expected to bound the
/// whole handshake with a timeout.
///
/// # Errors
///
/// It returns an error if the server requires TLS (the socket given to
/// [`Connection`] is plaintext), if the server rejects the `CONNECT`,
/// or if an I/O or protocol error occurs.
pub async fn handshake<S>(
    conn: &mut Connection<S>,
    addr: &ServerAddr,
    mut connect: Box<Connect>,
) -> Result<Box<ServerInfo>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let info = match conn.read_next().await? {
        ServerOp::Info { info } => info,
        _ => return Err(HandshakeError::UnexpectedOp),
    };

    if info.tls_required || matches!(addr.security(), Security::Tls) {
        // The TLS upgrade belongs to the socket layer. A plaintext
        // connection to a TLS-requiring endpoint cannot proceed.
        return Err(HandshakeError::SecureConnectionRequired);
    }

    if connect.username.is_none() && connect.auth_token.is_none() {
        connect.username = addr.username().map(str::to_owned);
        connect.password = addr.password().map(str::to_owned);
    }

    conn.enqueue_write_op(&ClientOp::Connect { connect });
    conn.enqueue_write_op(&ClientOp::Ping);
    conn.write_and_flush().await.map_err(HandshakeError::Io)?;

    loop {
        match conn.read_next().await? {
            ServerOp::Pong => return Ok(info),
            // `+OK` replies to CONNECT in verbose mode
            ServerOp::Ok => {}
            ServerOp::Ping => {
                conn.enqueue_write_op(&ClientOp::Pong);
                conn.write_and_flush().await.map_err(HandshakeError::Io)?;
            }
            ServerOp::Error {
                error: ServerError::AuthorizationViolation,
            } => return Err(HandshakeError::Authorization),
            ServerOp::Error { error } => return Err(HandshakeError::Server(error)),
            ServerOp::Info { .. } | ServerOp::Message { .. } => {
                return Err(HandshakeError::UnexpectedOp)
            }
        }
    }
}

/// An error encountered while establishing a connection
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("io error")]
    Io(#[source] io::Error),
    #[error("protocol violation")]
    Protocol(#[source] ProtocolError),
    #[error("the server requires a TLS connection")]
    SecureConnectionRequired,
    #[error("the server rejected our credentials")]
    Authorization,
    #[error("the server rejected the handshake")]
    Server(#[source] ServerError),
    #[error("the server sent an unexpected operation")]
    UnexpectedOp,
}

impl From<ReadError> for HandshakeError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Protocol(err) => Self::Protocol(err),
            ReadError::Io(err) => Self::Io(err),
        }
    }
}
