//! The unit of work flowing through a backend worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use shoal_protocol::Resp;

use crate::error::BackendError;
use crate::sync::WaitGroup;

/// A completed request carries either the backend's verbatim reply
/// (including RESP errors) or a worker-level failure.
pub type Reply = Result<Resp, BackendError>;

/// One request borrowed by exactly one backend worker at a time and
/// completed exactly once.
///
/// The router must not read [`reply`](Request::reply) until the batch
/// handle has fired.
#[derive(Debug)]
pub struct Request {
    /// The command as a multi-bulk: an ordered sequence of bulk strings.
    pub multi: Vec<Resp>,

    /// Read-only requests flagged broken are refused before transmission.
    pub read_only: bool,

    /// Shared across all requests of one upstream session; flipping it
    /// poisons the read-only ones still queued.
    pub broken: Arc<AtomicBool>,

    /// Fires when this request completes.
    pub batch: Option<WaitGroup>,

    /// Coordinates a fan-out of sub-requests composing one operation.
    pub group: Option<WaitGroup>,

    reply: OnceLock<Reply>,
}

impl Request {
    pub fn new(multi: Vec<Resp>) -> Request {
        Request {
            multi,
            read_only: false,
            broken: Arc::new(AtomicBool::new(false)),
            batch: None,
            group: None,
            reply: OnceLock::new(),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// The reply, once the batch handle has fired.
    pub fn reply(&self) -> Option<&Reply> {
        self.reply.get()
    }

    /// Completes the request: assigns the reply, then signals group and
    /// batch, in that order. A second completion would release a batch
    /// handle twice, so it is rejected.
    pub(crate) fn complete(&self, reply: Reply) {
        if self.reply.set(reply).is_err() {
            debug_assert!(false, "request completed twice");
            return;
        }
        if let Some(group) = &self.group {
            group.done();
        }
        if let Some(batch) = &self.batch {
            batch.done();
        }
    }
}
