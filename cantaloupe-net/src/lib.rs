//! Low-level network plumbing for the client
//!
//! [`Connection`] drives the sans-IO decoder and encoder over any
//! `AsyncRead + AsyncWrite` socket. The `poll_read_next`,
//! `poll_write_next` and `poll_flush` entry points also serve hosts
//! that bring their own event loop and push readiness in.

pub use self::connection::{Connection, ReadError};
pub use self::handshake::{connect_tcp, handshake, HandshakeError};

mod connection;
mod handshake;

pub mod error {
    pub use super::connection::ReadError;
    pub use super::handshake::HandshakeError;
}
