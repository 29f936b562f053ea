//! Sans-IO encoder and decoder for the wire protocol

pub use self::client::ClientOp;
pub use self::decoder::StreamDecoder;
pub use self::encoder::StreamEncoder;
pub use self::server::ServerOp;

mod client;
mod decoder;
mod encoder;
mod server;

pub mod error {
    pub use super::decoder::ProtocolError;
}
