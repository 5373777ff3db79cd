// State machine module - generic, graph-driven lifecycle transitions
//
// Entities, permissions and storage are injected through traits so the
// engine stays free of domain logic and can be tested with mocks.

pub mod graph;
pub mod state_machine;
pub mod traits;
pub mod types;

#[cfg(test)]
pub mod mocks;

#[cfg(test)]
pub mod tests;

pub use graph::{GraphError, TransitionGraph, TransitionGraphBuilder};
pub use state_machine::StateMachine;
pub use traits::{EntityHandle, NoHooks, PermissionOracle, TransitionHooks};
pub use types::{
    FailureKind, Metadata, Principal, State, TransitionContext, TransitionRecord, TransitionResult,
};
