use std::io;
use std::time::SystemTimeError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The caller violated the contract of the called function.
    #[error("invalid argument: {0}")]
    ErrInvalidArgument(String),
    /// The requested value is not known yet, e.g. the local description
    /// before gathering produced one.
    #[error("not available")]
    ErrNotAvailable,
    /// The channel or track is not open.
    #[error("not open")]
    ErrNotOpen,
    /// The outbound queue is over its limit and the send is non-blocking.
    #[error("buffer is full")]
    ErrBufferFull,
    /// A lower transport failed and cannot recover.
    #[error("transport failed: {0}")]
    ErrTransportFailed(String),
    /// Malformed SDP, DCEP, RTP or WebSocket data.
    #[error("protocol error: {0}")]
    ErrProtocol(String),
    #[error("i/o timeout")]
    ErrTimeout,
    /// The object was closed and no longer accepts operations.
    #[error("closed")]
    ErrClosed,
    #[error("DTLS certificate fingerprint mismatch")]
    ErrFingerprintMismatch,
    #[error("no more stream ids available")]
    ErrMaxStreamId,
    #[error("stream {0} already in use")]
    ErrStreamInUse(u16),
    #[error("unexpected end of buffer: (expected: {expected}, actual: {actual})")]
    ErrUnexpectedEndOfBuffer { expected: usize, actual: usize },
    #[error("message too large: {size} > {limit}")]
    ErrMessageTooLarge { size: usize, limit: usize },
    #[error("mutex poison: {0}")]
    PoisonError(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock {
            Error::ErrTimeout
        } else {
            Error::Io(e.to_string())
        }
    }
}

impl From<SystemTimeError> for Error {
    fn from(e: SystemTimeError) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Self {
        Error::ErrProtocol(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Error::ErrProtocol(e.to_string())
    }
}
