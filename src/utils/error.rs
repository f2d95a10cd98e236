//! The `error` module defines the error types used across `rabtap`.
//!
//! Errors are split by where they originate:
//!
//! - [`TransportError`] is raised by the protocol client seam (connectors,
//!   links and sessions).
//! - [`CodecError`] is raised while reading or writing persistent message
//!   records.
//! - [`Error`] is what the loops surface to their callers. Its variants map
//!   one-to-one onto the termination kinds of a loop, so callers can decide
//!   whether a retry makes sense with [`Error::is_retryable`].

use thiserror::Error;

/// Error type returned by caller-supplied sinks and sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared result type for `rabtap` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the underlying protocol client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid broker uri: {0}")]
    InvalidUri(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("session is not open")]
    NotOpen,
}

/// Failures while encoding or decoding persistent message records.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record truncated: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown header value tag {0:#04x}")]
    UnknownTag(u8),

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid delivery mode {0}")]
    InvalidDeliveryMode(u8),

    #[error("duplicate header key {0:?}")]
    DuplicateKey(String),

    #[error("header tables nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    #[error("{field} is {len} bytes long, limit is {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal outcome of a failed loop invocation.
#[derive(Debug, Error)]
pub enum Error {
    /// The session could not be opened.
    #[error("setup failed: {0}")]
    Setup(#[source] TransportError),

    /// The session opened, but declaring, binding or consuming the queue was
    /// refused by the broker.
    #[error("declare failed: {0}")]
    Declare(#[source] TransportError),

    /// The connection or channel failed mid-stream.
    #[error("transport failed: {0}")]
    Transport(#[source] TransportError),

    /// The caller-supplied sink rejected a message.
    #[error("sink failed: {0}")]
    Sink(#[source] BoxError),

    /// The caller-supplied source failed to produce the next message.
    #[error("source failed: {0}")]
    Source(#[source] BoxError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Setup, declare and transport failures may go away on reconnect;
    /// everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Setup(_) | Error::Declare(_) | Error::Transport(_))
    }

    /// True for failures raised before any message was exchanged.
    pub fn is_setup(&self) -> bool {
        matches!(self, Error::Setup(_) | Error::Declare(_))
    }

    /// True when the failed attempt had got its session open.
    pub fn session_opened(&self) -> bool {
        matches!(self, Error::Declare(_) | Error::Transport(_))
    }
}
