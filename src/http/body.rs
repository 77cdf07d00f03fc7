//! Message body framing and relaying.
//!
//! Bodies are never buffered whole. They are copied from one
//! [`BufferedStream`] to another as they arrive, keeping the framing the
//! sender declared: fixed length, chunked (chunk lines and trailers are
//! passed through verbatim) or delimited by connection close. The one
//! exception is [`relay_dechunked`], which unwraps chunked bodies for
//! HTTP/1.0 receivers.

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::http::request::{Method, Request};
use crate::http::response::ResponseHead;
use crate::http::stream::BufferedStream;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the sender closes the connection (responses only).
    UntilClose,
}

/// Which side of a relay failed.
#[derive(Debug)]
pub enum RelayError {
    /// Reading from the sender failed or it closed early.
    Source(io::Error),
    /// Writing to the receiver failed.
    Sink(io::Error),
    /// The sender's chunked framing was invalid.
    Malformed(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Source(e) => write!(f, "read failed: {}", e),
            RelayError::Sink(e) => write!(f, "write failed: {}", e),
            RelayError::Malformed(msg) => write!(f, "bad chunked framing: {}", msg),
        }
    }
}

/// Determines how the body of a client request is delimited.
///
/// Rejects the ambiguous combinations that enable request smuggling:
/// `Transfer-Encoding` together with `Content-Length`, conflicting
/// `Content-Length` values, and transfer codings other than a final
/// `chunked`.
pub fn request_framing(req: &Request) -> Result<BodyFraming, String> {
    if req.headers.contains("Transfer-Encoding") {
        if req.headers.contains("Content-Length") {
            return Err("both Transfer-Encoding and Content-Length present".into());
        }
        if !is_chunked_last(req.headers.get_all("Transfer-Encoding")) {
            return Err("unsupported Transfer-Encoding".into());
        }
        return Ok(BodyFraming::Chunked);
    }

    match content_length(req.headers.get_all("Content-Length"))? {
        Some(0) | None => Ok(BodyFraming::Empty),
        Some(n) => Ok(BodyFraming::Length(n)),
    }
}

/// Determines how an upstream response body is delimited.
pub fn response_framing(head: &ResponseHead, method: &Method) -> Result<BodyFraming, String> {
    if !head.has_body(method) {
        return Ok(BodyFraming::Empty);
    }
    if head.headers.contains("Transfer-Encoding") {
        return Ok(if is_chunked_last(head.headers.get_all("Transfer-Encoding")) {
            BodyFraming::Chunked
        } else {
            BodyFraming::UntilClose
        });
    }
    match content_length(head.headers.get_all("Content-Length"))? {
        Some(0) => Ok(BodyFraming::Empty),
        Some(n) => Ok(BodyFraming::Length(n)),
        None => Ok(BodyFraming::UntilClose),
    }
}

fn is_chunked_last<'a>(values: impl Iterator<Item = &'a str>) -> bool {
    values
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .last()
        .is_some_and(|t| t.eq_ignore_ascii_case("chunked"))
}

fn content_length<'a>(values: impl Iterator<Item = &'a str>) -> Result<Option<u64>, String> {
    let mut length = None;
    for value in values.flat_map(|v| v.split(',')) {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid Content-Length {:?}", value));
        }
        let n: u64 = value
            .parse()
            .map_err(|_| format!("invalid Content-Length {:?}", value))?;
        match length {
            Some(prev) if prev != n => return Err("conflicting Content-Length values".into()),
            _ => length = Some(n),
        }
    }
    Ok(length)
}

/// Copies one body from `src` to `dst` according to `framing`.
///
/// Returns the number of body bytes relayed (chunk framing excluded).
pub async fn relay_body<R, W>(
    framing: BodyFraming,
    src: &mut BufferedStream<R>,
    dst: &mut BufferedStream<W>,
) -> Result<u64, RelayError>
where
    R: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    let relayed = match framing {
        BodyFraming::Empty => 0,
        BodyFraming::Length(n) => copy_exact(n, src, dst).await?,
        BodyFraming::Chunked => relay_chunked(src, dst, true).await?,
        BodyFraming::UntilClose => copy_to_eof(src, dst).await?,
    };
    dst.flush().await.map_err(RelayError::Sink)?;
    Ok(relayed)
}

/// Copies a chunked body from `src` to `dst` with the chunk framing removed.
///
/// For receivers that cannot parse chunked encoding (HTTP/1.0); the caller
/// must delimit the result by closing the connection. Trailers are dropped.
pub async fn relay_dechunked<R, W>(
    src: &mut BufferedStream<R>,
    dst: &mut BufferedStream<W>,
) -> Result<u64, RelayError>
where
    R: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    let relayed = relay_chunked(src, dst, false).await?;
    dst.flush().await.map_err(RelayError::Sink)?;
    Ok(relayed)
}

/// Reads and discards one body, for requests answered without forwarding.
///
/// Gives up (returning false) once more than `limit` bytes would have to be
/// read; the caller should then close the connection instead of reusing it.
pub async fn discard_body<S>(
    framing: BodyFraming,
    src: &mut BufferedStream<S>,
    limit: u64,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => true,
        BodyFraming::Length(n) if n <= limit => {
            let mut remaining = n;
            while remaining > 0 {
                if src.buffered().is_empty() {
                    match src.fill().await {
                        Ok(0) | Err(_) => return false,
                        Ok(_) => {}
                    }
                }
                let take = remaining.min(src.buffered().len() as u64) as usize;
                src.consume(take);
                remaining -= take as u64;
            }
            true
        }
        _ => false,
    }
}

async fn copy_exact<R, W>(
    n: u64,
    src: &mut BufferedStream<R>,
    dst: &mut BufferedStream<W>,
) -> Result<u64, RelayError>
where
    R: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    let mut remaining = n;
    while remaining > 0 {
        if src.buffered().is_empty() {
            let read = src.fill().await.map_err(RelayError::Source)?;
            if read == 0 {
                return Err(RelayError::Source(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body ended {} bytes early", remaining),
                )));
            }
        }
        let take = remaining.min(src.buffered().len() as u64) as usize;
        let data = src.consume(take);
        dst.write_all(&data).await.map_err(RelayError::Sink)?;
        remaining -= take as u64;
    }
    Ok(n)
}

async fn copy_to_eof<R, W>(
    src: &mut BufferedStream<R>,
    dst: &mut BufferedStream<W>,
) -> Result<u64, RelayError>
where
    R: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        if src.buffered().is_empty() && src.fill().await.map_err(RelayError::Source)? == 0 {
            return Ok(total);
        }
        let len = src.buffered().len();
        let data = src.consume(len);
        dst.write_all(&data).await.map_err(RelayError::Sink)?;
        total += len as u64;
    }
}

async fn relay_chunked<R, W>(
    src: &mut BufferedStream<R>,
    dst: &mut BufferedStream<W>,
    keep_framing: bool,
) -> Result<u64, RelayError>
where
    R: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let line = read_line(src).await?;
        let size = parse_chunk_size(&line)?;
        if keep_framing {
            dst.write_all(&line).await.map_err(RelayError::Sink)?;
        }

        if size == 0 {
            // Trailer section, terminated by an empty line.
            loop {
                let trailer = read_line(src).await?;
                if keep_framing {
                    dst.write_all(&trailer).await.map_err(RelayError::Sink)?;
                }
                if trailer.as_ref() == b"\r\n" {
                    return Ok(total);
                }
            }
        }

        copy_exact(size, src, dst).await?;
        total += size;

        let crlf = read_exact_buffered(src, 2).await?;
        if crlf.as_ref() != b"\r\n" {
            return Err(RelayError::Malformed("missing CRLF after chunk data".into()));
        }
        if keep_framing {
            dst.write_all(&crlf).await.map_err(RelayError::Sink)?;
        }
    }
}

/// Reads one CRLF-terminated line, terminator included.
async fn read_line<R>(src: &mut BufferedStream<R>) -> Result<Bytes, RelayError>
where
    R: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if let Some(pos) = src.buffered().windows(2).position(|w| w == b"\r\n") {
            return Ok(src.consume(pos + 2));
        }
        if src.buffered().len() > MAX_LINE {
            return Err(RelayError::Malformed("chunk line too long".into()));
        }
        if src.fill().await.map_err(RelayError::Source)? == 0 {
            return Err(RelayError::Source(io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

async fn read_exact_buffered<R>(src: &mut BufferedStream<R>, n: usize) -> Result<Bytes, RelayError>
where
    R: AsyncRead + AsyncWrite + Unpin,
{
    while src.buffered().len() < n {
        if src.fill().await.map_err(RelayError::Source)? == 0 {
            return Err(RelayError::Source(io::ErrorKind::UnexpectedEof.into()));
        }
    }
    Ok(src.consume(n))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, RelayError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| RelayError::Malformed("non-ASCII chunk size".into()))?;
    let size = line
        .trim_end_matches("\r\n")
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    if size.is_empty() || size.len() > 16 {
        return Err(RelayError::Malformed(format!("invalid chunk size {:?}", size)));
    }
    u64::from_str_radix(size, 16)
        .map_err(|_| RelayError::Malformed(format!("invalid chunk size {:?}", size)))
}
