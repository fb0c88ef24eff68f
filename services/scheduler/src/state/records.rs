//! Rows persisted by the state store.

use keel_events::{ResourceValue, TaskState};
use keel_id::{NodeId, OfferId, PersistenceId, PodInstanceName, ReservationId, TaskId};
use keel_reconcile::{SpecHash, StepIntent, StepStatus};
use serde::{Deserialize, Serialize};

use crate::spec::TaskGoal;

/// A resource this service has reserved for one slot of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub pod_instance: PodInstanceName,
    pub task_name: String,

    /// Requirement slot within the task (see `ResourceRequirement::slot`).
    pub slot: String,

    /// Name of the offered resource, e.g. `cpus` or `disk`.
    pub resource_name: String,

    pub label: ReservationId,

    /// Node the reservation lives on.
    pub node_id: NodeId,

    /// Reserved value as last offered.
    pub value: ResourceValue,

    /// Persistent volume created on the reservation, if any.
    pub persistence_id: Option<PersistenceId>,
}

/// A label whose record was dropped and which must still be unreserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRelease {
    pub label: ReservationId,
    pub node_id: NodeId,
    pub pod_instance: PodInstanceName,

    /// Whether an UNRESERVE has been sent at least once.
    pub requested: bool,
}

/// The current launch of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub pod_instance: PodInstanceName,
    pub task_name: String,
    pub node_id: NodeId,
    pub offer_id: OfferId,
    pub goal: TaskGoal,
    pub readiness_check: bool,

    /// Last reported state; `None` until the first update.
    pub state: Option<TaskState>,
    pub ready: bool,

    /// A KILL has been sent for the task.
    pub kill_requested: bool,
}

impl TaskRecord {
    /// The task has been acknowledged as running (or has already finished).
    pub fn is_started(&self) -> bool {
        matches!(self.state, Some(TaskState::Running | TaskState::Finished))
    }

    /// The task may still be holding its resources.
    pub fn is_live(&self) -> bool {
        !self.state.is_some_and(|state| state.is_terminal())
    }

    /// The task has met its goal.
    pub fn is_done(&self) -> bool {
        match self.goal {
            TaskGoal::Running => {
                self.state == Some(TaskState::Running) && (!self.readiness_check || self.ready)
            }
            TaskGoal::Finished => self.state == Some(TaskState::Finished),
        }
    }
}

/// A step as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub plan: String,
    pub phase: String,
    pub name: String,

    /// Order within the phase.
    pub position: usize,

    pub pod_instance: PodInstanceName,
    pub intent: StepIntent,
    pub status: StepStatus,
    pub target: SpecHash,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn task(goal: TaskGoal, readiness_check: bool) -> TaskRecord {
        TaskRecord {
            task_id: TaskId::new(),
            pod_instance: PodInstanceName::new("hello", 0).unwrap(),
            task_name: "server".into(),
            node_id: NodeId::new(),
            offer_id: OfferId::new(),
            goal,
            readiness_check,
            state: None,
            ready: false,
            kill_requested: false,
        }
    }

    #[rstest]
    #[case(TaskGoal::Running, false, Some(TaskState::Running), false, true, true)]
    #[case(TaskGoal::Running, true, Some(TaskState::Running), false, true, false)]
    #[case(TaskGoal::Running, true, Some(TaskState::Running), true, true, true)]
    #[case(TaskGoal::Running, false, Some(TaskState::Staging), false, false, false)]
    #[case(TaskGoal::Finished, false, Some(TaskState::Running), false, true, false)]
    #[case(TaskGoal::Finished, false, Some(TaskState::Finished), false, true, true)]
    #[case(TaskGoal::Running, false, None, false, false, false)]
    fn test_task_progress(
        #[case] goal: TaskGoal,
        #[case] readiness_check: bool,
        #[case] state: Option<TaskState>,
        #[case] ready: bool,
        #[case] started: bool,
        #[case] done: bool,
    ) {
        let mut record = task(goal, readiness_check);
        record.state = state;
        record.ready = ready;
        assert_eq!(record.is_started(), started);
        assert_eq!(record.is_done(), done);
    }

    #[rstest]
    #[case(None, true)]
    #[case(Some(TaskState::Running), true)]
    #[case(Some(TaskState::Unreachable), true)]
    #[case(Some(TaskState::Killed), false)]
    #[case(Some(TaskState::Finished), false)]
    fn test_task_liveness(#[case] state: Option<TaskState>, #[case] live: bool) {
        let mut record = task(TaskGoal::Running, false);
        record.state = state;
        assert_eq!(record.is_live(), live);
    }
}
