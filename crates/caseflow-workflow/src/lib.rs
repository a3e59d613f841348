//! caseflow-workflow
//!
//! Status taxonomy graph, permission gate and the workflow engine.
//!
//! - The graph is a closed, exhaustive lookup table over `CaseStatus`.
//! - The permission gate is injected at construction (no ambient table).
//! - The engine is pure: no IO, no clock, no randomness beyond what the
//!   caller passes in.

mod engine;
pub mod graph;
mod permission;

pub use caseflow_schemas::{CaseStatus, Role};
pub use engine::{
    AmendmentPlan, AmendmentRequest, TransitionOutcome, TransitionRequest, WorkflowEngine,
    WorkflowError,
};
pub use graph::{all_transitions, edge, is_valid_transition, successors, Capability, Transition};
pub use permission::{CapabilityTable, PermissionGate};
