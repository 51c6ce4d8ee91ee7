//! Error types for channel-manager operations.

use thiserror::Error;

/// Errors surfaced by channel and port operations.
///
/// Every caller-initiated operation returns one of these; the adaptor layer
/// maps them onto its own surface. Inbound packet problems (unknown channel,
/// wrong packet type, oversized message) are logged and dropped instead of
/// being surfaced.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad argument or wrong channel state for the requested operation.
    #[error("invalid argument or channel state")]
    Invalid,

    /// Unknown port, peer or channel.
    #[error("port, peer or channel not found")]
    NotFound,

    /// Resource busy: outbound ring full or channel ID already taken.
    #[error("resource busy")]
    Busy,

    /// Operation would block: channel not connected yet, or a non-blocking
    /// call found nothing to consume.
    #[error("try again")]
    Again,

    /// Wait timeout expired.
    #[error("operation timed out")]
    Timeout,

    /// Wait was interrupted by core shutdown.
    #[error("wait interrupted")]
    Interrupted,

    /// Channel left the listen state while an accept was waiting.
    #[error("listen canceled")]
    Canceled,

    /// Connect request was answered by something other than an accept.
    #[error("connection refused")]
    Refused,

    /// Peer closed the channel while a receive was waiting.
    #[error("connection reset by peer")]
    ConnReset,

    /// No buffer space: receive ring full, or all in-use slots lent out.
    #[error("out of buffer space")]
    NoMemory,

    /// Data arrived for a channel that is not ready to receive it.
    #[error("channel not ready for data")]
    Io,

    /// The owning port has been torn down.
    #[error("port has been shut down")]
    NoDevice,
}

/// Result alias for channel-manager operations.
pub type Result<T> = core::result::Result<T, Error>;
