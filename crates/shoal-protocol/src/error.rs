//! Protocol error types.
//!
//! The display strings are part of the observable surface: operators grep
//! logs for them. They are spelled exactly once here and must not drift.

use thiserror::Error;

/// Errors produced while decoding or encoding RESP frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The first byte of a frame is not one of `+ - : $ *`.
    #[error("bad resp type {0}")]
    BadRespType(char),

    /// A line did not end with `\r\n`, or a payload's trailer was wrong.
    #[error("bad CRLF end")]
    BadCrlfEnd,

    #[error("bad array len")]
    BadArrayLen,

    #[error("bad array len, too long")]
    BadArrayLenTooLong,

    #[error("bad bulk bytes len")]
    BadBulkBytesLen,

    #[error("bad bulk bytes len, too long")]
    BadBulkBytesLenTooLong,

    /// An inline command line produced no tokens, or a multi-bulk header
    /// declared a non-positive count.
    #[error("bad multi-bulk len")]
    BadMultiBulkLen,

    /// A multi-bulk element decoded to something other than a bulk string.
    #[error("bad multi-bulk content, should be bulkbytes")]
    BadMultiBulkContent,

    /// Integer bytes that are not an optional sign plus ASCII digits.
    #[error("invalid integer encoding")]
    InvalidInt,

    /// The decoder already failed; it cannot be reused.
    #[error("use of failed decoder")]
    FailedDecoder,

    /// The encoder already failed; it cannot be reused.
    #[error("use of failed encoder")]
    FailedEncoder,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
