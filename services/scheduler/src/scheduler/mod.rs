//! Offer-driven scheduling.
//!
//! The scheduler is responsible for:
//! - Building deploy, custom and recovery plans from the service spec
//! - Matching offers to eligible steps and accepting the ones that fit
//! - Routing task status updates to the step that launched the task
//! - Releasing reservations the service no longer owns
//! - Stopping tasks that hold resources a new launch needs
//! - Applying operator commands

mod plans;
mod reconciler;
mod worker;

use keel_id::PodInstanceName;
use keel_reconcile::ReconcileError;
use serde::{Deserialize, Serialize};

use crate::spec::SpecError;
use crate::state::StateStoreError;

pub use reconciler::{CycleStats, Scheduler};
pub use worker::SchedulerWorker;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur during scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),

    #[error("plan error: {0}")]
    Plan(#[from] ReconcileError),

    #[error("spec error: {0}")]
    Spec(#[from] SpecError),

    /// A command targeted a pod whose operations are still in flight.
    #[error("pod {0} has operations in flight")]
    PodBusy(PodInstanceName),

    #[error("step not found: {0}")]
    UnknownStep(String),
}

/// Operator commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Stop offering resources to a plan's steps.
    Interrupt { plan: String },

    /// Resume an interrupted plan.
    Proceed { plan: String },

    /// Mark a step complete, whatever its status.
    ForceComplete {
        plan: String,
        phase: String,
        step: String,
    },

    /// Stop a pod's tasks and launch it afresh on new reservations. The old
    /// reservations are released.
    Replace { pod_instance: PodInstanceName },

    /// Stop all plans and tasks and release every reservation.
    Uninstall,
}
