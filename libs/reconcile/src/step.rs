//! Steps: the unit of work for one pod instance.

use keel_id::PodInstanceName;
use serde::{Deserialize, Serialize};

use crate::{ReconcileError, SpecHash};

/// Status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Intent recorded, no resources yet.
    Pending,
    /// Requirement computed, awaiting a satisfying offer.
    Prepared,
    /// Operations sent to the transport, awaiting acknowledgment.
    Starting,
    /// Tasks running; may still await readiness.
    Started,
    Complete,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Prepared => "PREPARED",
            StepStatus::Starting => "STARTING",
            StepStatus::Started => "STARTED",
            StepStatus::Complete => "COMPLETE",
            StepStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(StepStatus::Pending),
            "PREPARED" => Some(StepStatus::Prepared),
            "STARTING" => Some(StepStatus::Starting),
            "STARTED" => Some(StepStatus::Started),
            "COMPLETE" => Some(StepStatus::Complete),
            "ERROR" => Some(StepStatus::Error),
            _ => None,
        }
    }

    /// Returns true for `COMPLETE` and `ERROR`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Error)
    }

    /// Returns true if the step may be offered resources.
    pub fn is_eligible(&self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::Prepared)
    }

    /// Returns true if operations for the step are out with the transport.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, StepStatus::Starting | StepStatus::Started)
    }

    fn can_become(&self, to: StepStatus) -> bool {
        use StepStatus::*;
        match (self, to) {
            (Complete | Error, _) => false,
            (_, Error) => true,
            (Pending, Prepared) => true,
            (Prepared, Prepared | Starting) => true,
            (Starting, Started) => true,
            (Started, Complete) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step is trying to achieve for its pod instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepIntent {
    /// First launch, or relaunch after a configuration change.
    Deploy,
    /// Relaunch in place, reusing existing reservations.
    Recover,
    /// Relaunch from scratch; existing reservations are released.
    Replace,
}

impl StepIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepIntent::Deploy => "deploy",
            StepIntent::Recover => "recover",
            StepIntent::Replace => "replace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploy" => Some(StepIntent::Deploy),
            "recover" => Some(StepIntent::Recover),
            "replace" => Some(StepIntent::Replace),
            _ => None,
        }
    }

    /// Returns true if evaluation should consult existing reservations.
    pub fn reuses_reservations(&self) -> bool {
        !matches!(self, StepIntent::Replace)
    }
}

/// One pod instance's deployment or recovery intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    name: String,
    pod_instance: PodInstanceName,
    intent: StepIntent,
    status: StepStatus,
    target: SpecHash,
    errors: Vec<String>,
}

impl Step {
    /// Create a pending step.
    pub fn new(pod_instance: PodInstanceName, intent: StepIntent, target: SpecHash) -> Self {
        let name = match intent {
            StepIntent::Deploy => pod_instance.to_string(),
            other => format!("{}:[{}]", pod_instance, other.as_str()),
        };
        Self {
            name,
            pod_instance,
            intent,
            status: StepStatus::Pending,
            target,
            errors: Vec::new(),
        }
    }

    /// Rebuild a step from persisted state.
    pub fn restore(
        name: String,
        pod_instance: PodInstanceName,
        intent: StepIntent,
        status: StepStatus,
        target: SpecHash,
        errors: Vec<String>,
    ) -> Self {
        Self {
            name,
            pod_instance,
            intent,
            status,
            target,
            errors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pod_instance(&self) -> &PodInstanceName {
        &self.pod_instance
    }

    pub fn intent(&self) -> StepIntent {
        self.intent
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Hash of the pod spec this step deploys.
    pub fn target(&self) -> &SpecHash {
        &self.target
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Move to `to`, rejecting backwards or terminal transitions.
    pub fn transition(&mut self, to: StepStatus) -> Result<(), ReconcileError> {
        if !self.status.can_become(to) {
            return Err(ReconcileError::InvalidTransition {
                step: self.name.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Move to `ERROR`, recording why.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ReconcileError> {
        self.transition(StepStatus::Error)?;
        self.errors.push(reason.into());
        Ok(())
    }

    /// Mark the step `COMPLETE` from any status. Errors are kept.
    ///
    /// For work finished elsewhere, such as a recovery that relaunched the
    /// pod after this step failed, or an operator override.
    pub fn force_complete(&mut self) {
        self.status = StepStatus::Complete;
    }
}
