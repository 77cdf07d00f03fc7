//! Buffered socket wrapper shared by the client and upstream legs.
//!
//! Every read and write is bounded by the idle timeout: if the peer sends or
//! accepts nothing for that long the operation fails with `TimedOut`.

use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::http::parser::ParseError;

const READ_CHUNK: usize = 8192;

/// Failure while reading a request or response head.
#[derive(Debug)]
pub enum HeadError {
    Parse(ParseError),
    TooLarge(usize),
    /// The peer closed the connection partway through the head.
    UnexpectedEof,
    Io(io::Error),
}

#[derive(Debug)]
pub struct BufferedStream<S> {
    inner: S,
    buf: BytesMut,
    idle_timeout: Duration,
}

impl<S> BufferedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S, idle_timeout: Duration) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            idle_timeout,
        }
    }

    /// Bytes read from the socket but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Removes and returns the first `n` buffered bytes.
    pub fn consume(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    /// Reads more data into the buffer. Returns 0 on EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        match timeout(self.idle_timeout, self.inner.read_buf(&mut self.buf)).await {
            Ok(res) => res,
            Err(_) => Err(idle_timeout_error()),
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match timeout(self.idle_timeout, self.inner.write_all(data)).await {
            Ok(res) => res,
            Err(_) => Err(idle_timeout_error()),
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match timeout(self.idle_timeout, self.inner.flush()).await {
            Ok(res) => res,
            Err(_) => Err(idle_timeout_error()),
        }
    }

    /// Reads until `parse` yields a complete head.
    ///
    /// Returns `Ok(None)` if the peer closed the connection before sending
    /// any byte, which is the normal end of a keep-alive connection.
    pub async fn read_head<T>(
        &mut self,
        max_bytes: usize,
        parse: fn(&[u8]) -> Result<(T, usize), ParseError>,
    ) -> Result<Option<T>, HeadError> {
        loop {
            if !self.buf.is_empty() {
                match parse(&self.buf) {
                    Ok((head, consumed)) => {
                        if consumed > max_bytes {
                            return Err(HeadError::TooLarge(max_bytes));
                        }
                        let _ = self.buf.split_to(consumed);
                        return Ok(Some(head));
                    }
                    Err(ParseError::Incomplete) => {
                        if self.buf.len() > max_bytes {
                            return Err(HeadError::TooLarge(max_bytes));
                        }
                    }
                    Err(e) => return Err(HeadError::Parse(e)),
                }
            }

            let n = self.fill().await.map_err(HeadError::Io)?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(HeadError::UnexpectedEof)
                };
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

pub(crate) fn idle_timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "idle timeout elapsed")
}
