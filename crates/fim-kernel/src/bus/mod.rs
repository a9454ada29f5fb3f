//! Request/reply messaging contracts.
//!
//! The remote flow invoker talks to other nodes through a [`RequestReplyBus`]: one subject per
//! pipeline, one [`MessageEnvelope`] per request and per reply. Transports live outside the
//! kernel; `fim-runtime` ships an in-process one.

pub mod envelope;
pub mod error;
pub mod traits;

pub use envelope::{HEADER_ERROR, HEADER_ERROR_CODE, MessageEnvelope};
pub use error::{BusError, BusResult};
pub use traits::{RequestHandler, RequestReplyBus};
