//! Plan, phase and step primitives.
//!
//! Deployment and recovery work is tracked as a hierarchy:
//!
//! - **Plan**: an ordered set of phases, run with a strategy, optionally
//!   interrupted by an operator.
//! - **Phase**: an ordered set of steps, run with a strategy.
//! - **Step**: the unit of work for exactly one pod instance.
//!
//! # Invariants
//!
//! - A step only moves forward: `PENDING -> PREPARED -> STARTING -> STARTED
//!   -> COMPLETE`, with `ERROR` reachable from any non-terminal status
//! - `COMPLETE` and `ERROR` are terminal; recovery adds a new step, and an
//!   `ERROR` step is only left by force-completion once that recovery
//!   succeeds or an operator overrides it
//! - Candidate selection is deterministic given the same plan state
//! - A pod instance is offered to at most one step per cycle

mod hash;
mod phase;
mod plan;
mod step;

use thiserror::Error;

pub use hash::SpecHash;
pub use phase::{Phase, Strategy};
pub use plan::{AggregateStatus, Plan, PlanCoordinator, StepAddr};
pub use step::{Step, StepIntent, StepStatus};

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A step was asked to move to a status it cannot reach.
    #[error("step {step}: invalid transition {from} -> {to}")]
    InvalidTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },

    /// Plan not found.
    #[error("plan not found: {0}")]
    UnknownPlan(String),

    /// Phase not found in a plan.
    #[error("phase not found: {plan}/{phase}")]
    UnknownPhase { plan: String, phase: String },

    /// Two children of the same parent share a name.
    #[error("duplicate name: {0}")]
    DuplicateName(String),
}
