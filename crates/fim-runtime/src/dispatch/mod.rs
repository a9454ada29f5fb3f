//! Pipeline dispatch.
//!
//! - [`LocalFlowInvoker`]: runs pipelines in this process.
//! - [`BusFlowInvoker`]: relays invocations over a [`RequestReplyBus`](fim_kernel::bus::RequestReplyBus)
//!   and serves the local pipelines to other nodes.
//! - [`SingleDispatchDecider`]: routes every pipeline through one invoker.

mod decider;
mod local;
mod remote;

pub use decider::SingleDispatchDecider;
pub use local::LocalFlowInvoker;
pub use remote::{
    BusFlowInvoker, CODE_FLOW_ERROR, CODE_FLOW_STOP, CODE_INTERNAL_ERROR, PipelineHandler,
};

pub use fim_kernel::dispatch::{DispatchDecider, FlowInvoker, FlowInvokerMeta};
