//! Subgraph pool (C5) and graph lifecycle state machine with RTGM (C6),
//! plus the process-wide [`runtime::RuntimeContext`] that owns the
//! shared-resource locks in their required order.

pub mod pool;
pub mod runtime;
pub mod signal;
pub mod state;

pub use pool::{SubgraphPool, WireAction};
pub use runtime::{GraphHandle, RuntimeContext};
pub use signal::Signal;
pub use state::{GraphState, GraphStateMachine, RtgmPlan, Timeouts};
