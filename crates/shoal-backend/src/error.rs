//! Backend worker error surface.
//!
//! These strings are stable; operators and upstream routers match on them.

use thiserror::Error;

/// Errors a backend worker can assign to a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The connection round ended before the request got a response. The
    /// request was never lost, only failed fast; the caller may retry.
    #[error("backend conn reset")]
    ConnReset,

    /// A read-only request arrived flagged broken and was refused before
    /// transmission.
    #[error("request is broken")]
    RequestBroken,

    /// Transport or protocol failure on the wire, with the cause.
    #[error("backend conn failure, {0}")]
    ConnFailure(String),
}
