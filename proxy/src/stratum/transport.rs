/// Line-framed transport over a byte stream
///
/// Every read and write call carries its own deadline. A deadline bounds the
/// single call it is passed to, never the session as a whole.

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::protocol::{self, Method, Request, Response};
use crate::error::{ProxyError, Result};

/// Longest accepted line. A submit is under 3 KiB.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

pub struct LineReader<R> {
    lines: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_length(inner, MAX_LINE_LENGTH)
    }

    pub fn with_max_length(inner: R, max_length: usize) -> Self {
        Self {
            lines: FramedRead::new(inner, LinesCodec::new_with_max_length(max_length)),
        }
    }

    /// Next non-blank line, or `Eof` once the peer has closed the stream.
    pub async fn read_line_timed(&mut self, deadline: Instant) -> Result<String> {
        loop {
            let next = timeout_at(deadline, self.lines.next())
                .await
                .map_err(|_| ProxyError::Timeout("read"))?;

            match next {
                None => return Err(ProxyError::Eof),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(ProxyError::Framing("line too long".to_string()))
                }
                Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                    return Err(ProxyError::Framing(e.to_string()))
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(ProxyError::Transport(e)),
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Ok(line);
                }
            }
        }
    }

    pub async fn read_timed(&mut self, deadline: Instant) -> Result<Request> {
        let line = self.read_line_timed(deadline).await?;
        protocol::parse(&line)
    }

    /// Read one request and require it to be `expected`.
    pub async fn wait_for(&mut self, expected: Method, deadline: Instant) -> Result<Request> {
        let request = self.read_timed(deadline).await?;
        let got = request.method();
        if got != expected {
            return Err(ProxyError::ProtocolViolation { expected, got });
        }
        Ok(request)
    }
}

pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_timed(&mut self, response: &Response, deadline: Instant) -> Result<()> {
        let mut line = protocol::serialize(response);
        line.push('\n');
        self.write_raw(line.as_bytes(), deadline).await
    }

    /// Write pre-framed bytes as-is.
    pub async fn write_raw(&mut self, bytes: &[u8], deadline: Instant) -> Result<()> {
        let inner = &mut self.inner;
        timeout_at(deadline, async move {
            inner.write_all(bytes).await?;
            inner.flush().await
        })
        .await
        .map_err(|_| ProxyError::Timeout("write"))??;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
