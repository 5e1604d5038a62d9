//! Byte-stream endpoints a connection runs over.

use std::fmt;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::process::Child;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A duplex byte transport: one inbound stream, one outbound stream.
///
/// The connection does not care what sits underneath; pipes, sockets and
/// in-memory streams are all equivalent.
pub struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// The process's own stdin/stdout, as used when an editor launches us.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Two transports wired to each other in memory. Bytes written to one
    /// are read from the other.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (Self::from_duplex(a), Self::from_duplex(b))
    }

    fn from_duplex(stream: DuplexStream) -> Self {
        let (reader, writer): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) =
            tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Take the stdout/stdin pipes of a child spawned with piped stdio.
    pub fn from_child(child: &mut Child) -> Result<Self> {
        let stdout = child.stdout.take().context("no stdout from child")?;
        let stdin = child.stdin.take().context("no stdin from child")?;
        Ok(Self::new(stdout, stdin))
    }

    pub(crate) fn into_parts(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}
