// ABOUTME: Crate-wide error types for the RESP codec, command pipeline, and connection pool
// ABOUTME: Errors are cheaply cloneable so a single transport failure can fan out to every queued sink

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Error produced while decoding a RESP frame from a byte buffer.
///
/// Distinct from [`Error`] because it is produced by a pure, synchronous
/// function (`crate::resp::decode`) with no I/O or pool involvement.
#[derive(Debug, Clone, Error)]
pub enum FrameError {
    /// The leading type-tag byte was not one of `+ - : $ *`.
    #[error("invalid frame type byte {0:#04x}")]
    InvalidTypeByte(u8),

    /// A length or integer field did not parse as a signed 64-bit decimal.
    #[error("invalid numeric field: {0}")]
    InvalidNumber(String),

    /// A bulk string or array length was negative and not the `-1` null sentinel.
    #[error("invalid length {0} (only -1 is a valid negative length)")]
    InvalidLength(i64),
}

/// The crate-wide result and error surface.
///
/// Names are semantic, matching the error surface described in the RESP
/// client specification, rather than being tied to any one transport or
/// scheduler. Variants that wrap an underlying `std::io::Error` (which is
/// not `Clone`) wrap it in an `Arc` so a single connection failure can be
/// delivered to every queued response sink without cloning the error text
/// N times or giving up on `Clone` entirely.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A transport-level I/O failure (read, write, or connect).
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The byte stream could not be framed as a valid RESP value.
    #[error("protocol framing error: {0}")]
    Frame(#[from] FrameError),

    /// The server returned a RESP `Error` value for this request.
    #[error("server error: {0}")]
    Server(String),

    /// The connection was closed (locally or remotely) while a request was
    /// in flight, or before a new request could be written.
    #[error("connection closed")]
    ConnectionClosed,

    /// A `leaseConnection` deadline elapsed before a connection became
    /// available.
    #[error("timed out waiting for a connection")]
    TimedOutWaitingForConnection,

    /// The pool has been closed (or is closing) and cannot serve new leases.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// True for errors that represent the connection no longer being usable,
    /// as opposed to a single request having failed server-side.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Frame(_) | Error::ConnectionClosed
        )
    }
}

/// Opaque, fire-and-forget increment hooks for command outcomes.
///
/// The specification deliberately keeps metrics out of scope beyond these
/// two counters; implementors plug in whatever counting/metrics backend
/// they like. The default implementation (used when no [`Metrics`] is
/// supplied) does nothing.
pub trait Metrics: Send + Sync + 'static {
    /// Called once for every response successfully paired with a request.
    fn incr_command_success(&self) {}
    /// Called once for every response that carried a RESP `Error` value, or
    /// every queued request failed by a transport error/close.
    fn incr_command_failure(&self) {}
}

/// The no-op metrics implementation used when a pool or pipeline is built
/// without an explicit [`Metrics`] hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;
