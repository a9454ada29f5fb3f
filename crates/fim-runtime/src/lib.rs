// =============================================================================
// FIM Runtime - Flow Execution, Pipelines and Dispatch
// =============================================================================
//
// The runtime compiles the declarative definitions understood by the kernel
// into callable units and manages their lifecycle.
//
// Main Components:
// - function: builtin and custom flow functions, case clauses
// - flow: in-mapping, function chain, pre-out edits, out-mapping
// - pipeline: ordered flow and target connector steps bound to source connectors
// - dispatch: local and bus-backed flow invokers behind a dispatch decider
// - container / application: definition loading, ordered startup and shutdown
//
// =============================================================================

pub mod application;
pub mod bus;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod function;
pub mod generator;
pub mod logging;
pub mod pipeline;

pub use application::{Application, ApplicationBuilder, LifecycleListener};
pub use bus::InProcessBus;
pub use container::{ConnectorHandle, ConnectorSet, Container};
pub use dispatch::{BusFlowInvoker, LocalFlowInvoker, SingleDispatchDecider};
pub use error::{RuntimeError, RuntimeResult};
pub use flow::Flow;
pub use function::{FlowFunction, FunctionGenerator, FunctionRef, FunctionRegistry};
pub use generator::GeneratorRegistry;
pub use logging::init_logging;
pub use pipeline::Pipeline;

// Re-export the kernel so connector crates only need one dependency
pub use fim_kernel;
