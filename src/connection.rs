// ABOUTME: Per-socket RESP framing over TCP or Unix-domain byte streams
// ABOUTME: Owns the read buffer and decode loop; higher layers own request/response pairing

use crate::error::{Error, Result};
use crate::resp::{self, Decoded, Value};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpStream, ToSocketAddrs, UnixStream};

#[cfg(unix)]
use std::path::Path;

/// The two transports this crate speaks RESP over.
///
/// The codec, command pipeline, and pool are all written against
/// [`Connection`] rather than against `TcpStream` directly, so a
/// Unix-domain socket is a first-class connection target.
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read_buf(buf).await,
            #[cfg(unix)]
            Stream::Unix(s) => s.read_buf(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf).await,
            #[cfg(unix)]
            Stream::Unix(s) => s.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush().await,
            #[cfg(unix)]
            Stream::Unix(s) => s.flush().await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown().await,
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown().await,
        }
    }
}

/// A RESP connection over a single byte stream.
///
/// Handles frame-based I/O with buffering: a read buffer is retained
/// across calls to [`Connection::read_value`] so a value spanning
/// multiple socket reads is assembled incrementally, and any bytes read
/// past the end of one frame are kept for the next call.
pub struct Connection {
    stream: BufWriter<Stream>,
    buffer: BytesMut,
}

impl Connection {
    /// Connect to `addr` over TCP.
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(socket))
    }

    /// Wrap an already-connected `TcpStream`.
    pub fn from_tcp(socket: TcpStream) -> Self {
        Self::new(Stream::Tcp(socket))
    }

    /// Connect to `path` over a Unix-domain socket.
    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        let socket = UnixStream::connect(path.as_ref()).await?;
        Ok(Self::from_unix(socket))
    }

    /// Wrap an already-connected `UnixStream`.
    #[cfg(unix)]
    pub fn from_unix(socket: UnixStream) -> Self {
        Self::new(Stream::Unix(socket))
    }

    fn new(stream: Stream) -> Self {
        Connection {
            stream: BufWriter::new(stream),
            // Default to a 4KB read buffer; callers exchanging large bulk
            // strings will see it grow via `BytesMut`'s reallocation.
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Read a single RESP value from the underlying stream.
    ///
    /// Waits until enough data has been buffered to decode a full value.
    /// Returns `Ok(None)` if the stream closes cleanly between values (no
    /// partial value buffered); returns `Err` if it closes mid-value, or if
    /// the buffered bytes are not a valid RESP prefix.
    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(value) = self.try_decode()? {
                return Ok(Some(value));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::ConnectionClosed)
                };
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<Value>> {
        match resp::decode(&self.buffer)? {
            Decoded::Value { value, consumed } => {
                self.buffer.advance(consumed);
                Ok(Some(value))
            }
            Decoded::Incomplete => Ok(None),
        }
    }

    /// Write a single RESP value and flush it to the socket.
    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        let mut encoded = BytesMut::new();
        resp::encode(value, &mut encoded);
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Best-effort shutdown of the write half. Used when the command
    /// pipeline transitions to `Errored` or finishes draining.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
