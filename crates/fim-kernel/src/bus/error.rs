//! Typed errors for request/reply messaging.

use std::time::Duration;
use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

/// Errors raised by a [`RequestReplyBus`](super::RequestReplyBus) transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// Nothing serves the requested subject.
    #[error("no responders for subject: {0}")]
    NoResponders(String),

    #[error("subject already served: {0}")]
    AlreadyServed(String),

    #[error("request on {subject} timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    /// The serving side went away before replying.
    #[error("reply dropped for subject: {0}")]
    ReplyDropped(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("bus is closed")]
    Closed,
}
