use std::{
    future::{self, Future},
    io,
    pin::{pin, Pin},
    task::{Context, Poll},
};

use bytes::Buf;
use cantaloupe_proto::proto::{error::ProtocolError, ClientOp, ServerOp, StreamDecoder, StreamEncoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Writes stop being accepted once this many bytes are queued
const MAX_QUEUED_WRITES: usize = 8 * 1024 * 1024;

/// A protocol connection over a byte stream socket
///
/// Owns the read and write buffers. Reading decodes [`ServerOp`]s out
/// of the socket; writing drains previously enqueued [`ClientOp`]s.
/// All entry points are poll-based so an external event loop can drive
/// the connection directly.
#[derive(Debug)]
pub struct Connection<S> {
    socket: S,
    decoder: StreamDecoder,
    encoder: StreamEncoder,
    may_flush: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            decoder: StreamDecoder::new(),
            encoder: StreamEncoder::new(),
            may_flush: false,
        }
    }

    pub fn poll_read_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<ServerOp, ReadError>> {
        loop {
            match self.decoder.decode() {
                Ok(Some(server_op)) => return Poll::Ready(Ok(server_op)),
                Ok(None) => {}
                Err(err) => return Poll::Ready(Err(ReadError::Protocol(err))),
            }

            let read_buf_fut = pin!(self.socket.read_buf(self.decoder.read_buf()));
            match read_buf_fut.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(1..)) => {}
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(ReadError::Io(io::ErrorKind::UnexpectedEof.into())))
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(ReadError::Io(err))),
            }
        }
    }

    /// Read the next [`ServerOp`]
    ///
    /// # Errors
    ///
    /// It returns an error if the stream cannot be decoded or if an
    /// I/O error occurs.
    pub async fn read_next(&mut self) -> Result<ServerOp, ReadError> {
        future::poll_fn(|cx| self.poll_read_next(cx)).await
    }

    /// Whether any enqueued bytes are waiting to be written
    pub fn may_write(&self) -> bool {
        self.encoder.has_remaining()
    }

    /// Whether written bytes are waiting to be flushed
    pub fn should_flush(&self) -> bool {
        self.may_flush
    }

    /// Whether the write queue is accepting more commands
    pub fn may_enqueue_more_ops(&self) -> bool {
        self.encoder.remaining() < MAX_QUEUED_WRITES
    }

    pub fn enqueue_write_op(&mut self, item: &ClientOp) {
        self.encoder.enqueue_write_op(item);
    }

    pub fn poll_write_next(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if !self.encoder.has_remaining() {
            return Poll::Ready(Ok(0));
        }

        let write_outcome = if self.socket.is_write_vectored() {
            let mut bufs = [io::IoSlice::new(&[]); 64];
            let n = self.encoder.chunks_vectored(&mut bufs);
            debug_assert!(n > 0);

            Pin::new(&mut self.socket).poll_write_vectored(cx, &bufs[..n])
        } else {
            Pin::new(&mut self.socket).poll_write(cx, self.encoder.chunk())
        };

        match write_outcome {
            Poll::Pending => {
                self.may_flush = false;
                Poll::Pending
            }
            Poll::Ready(Ok(n)) => {
                self.encoder.advance(n);
                self.may_flush = true;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }

    /// Write the next chunk of queued data to the socket
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// An I/O error is returned if writing to the socket fails.
    pub async fn write_next(&mut self) -> io::Result<usize> {
        future::poll_fn(|cx| self.poll_write_next(cx)).await
    }

    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.socket).poll_flush(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                self.may_flush = false;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }

    /// Write everything currently enqueued and flush the socket
    ///
    /// # Errors
    ///
    /// An I/O error is returned if writing or flushing fails.
    pub async fn write_and_flush(&mut self) -> io::Result<()> {
        while self.may_write() {
            self.write_next().await?;
        }

        future::poll_fn(|cx| self.poll_flush(cx)).await
    }

    /// Shutdown the connection
    ///
    /// # Errors
    ///
    /// Returns an error if shutting down the socket fails.
    /// Callers usually ignore this error.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        future::poll_fn(|cx| Pin::new(&mut self.socket).poll_shutdown(cx)).await
    }
}

/// An error encountered while reading from the connection
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("protocol violation")]
    Protocol(#[source] ProtocolError),
    #[error("io")]
    Io(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use claims::assert_matches;
    use futures_util::task;
    use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};

    use cantaloupe_proto::proto::{ClientOp, ServerOp};

    use super::Connection;

    #[test]
    fn ping_pong() {
        let waker = task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let (socket, mut server) = io::duplex(1024);
        let mut client = Connection::new(socket);

        // Initial state is quiescent
        assert!(client.poll_read_next(&mut cx).is_pending());
        assert_matches!(client.poll_write_next(&mut cx), Poll::Ready(Ok(0)));

        let mut buf = [0; 1024];
        let mut read_buf = ReadBuf::new(&mut buf);
        assert!(Pin::new(&mut server)
            .poll_read(&mut cx, &mut read_buf)
            .is_pending());

        // Write PING and verify it reaches the socket
        client.enqueue_write_op(&ClientOp::Ping);
        assert!(client.may_write());
        assert_matches!(client.poll_write_next(&mut cx), Poll::Ready(Ok(6)));
        assert_matches!(
            Pin::new(&mut server).poll_read(&mut cx, &mut read_buf),
            Poll::Ready(Ok(()))
        );
        assert_eq!(read_buf.filled(), b"PING\r\n");

        // Receive PONG
        assert_matches!(
            Pin::new(&mut server).poll_write(&mut cx, b"PONG\r\n"),
            Poll::Ready(Ok(6))
        );
        assert_matches!(
            client.poll_read_next(&mut cx),
            Poll::Ready(Ok(ServerOp::Pong))
        );
        assert!(client.poll_read_next(&mut cx).is_pending());
    }

    #[tokio::test]
    async fn eof_is_an_error() {
        let (socket, server) = io::duplex(64);
        let mut client = Connection::new(socket);

        drop(server);
        assert_matches!(client.read_next().await, Err(super::ReadError::Io(_)));
    }
}
