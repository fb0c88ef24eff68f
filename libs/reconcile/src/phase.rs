//! Phases: ordered groups of steps.

use serde::{Deserialize, Serialize};

use crate::plan::AggregateStatus;
use crate::{ReconcileError, Step, StepStatus};

/// How the children of a phase or plan are released for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Only the first incomplete child is eligible.
    #[default]
    Serial,
    /// Every incomplete child is eligible, still in declared order.
    Parallel,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Serial => "serial",
            Strategy::Parallel => "parallel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "serial" => Some(Strategy::Serial),
            "parallel" => Some(Strategy::Parallel),
            _ => None,
        }
    }
}

/// An ordered set of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    name: String,
    strategy: Strategy,
    steps: Vec<Step>,
}

impl Phase {
    pub fn new(name: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            steps: Vec::new(),
        }
    }

    /// Append a step, rejecting duplicate names.
    pub fn push(&mut self, step: Step) -> Result<(), ReconcileError> {
        if self.steps.iter().any(|s| s.name() == step.name()) {
            return Err(ReconcileError::DuplicateName(format!(
                "{}/{}",
                self.name,
                step.name()
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub(crate) fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    /// Aggregate status of the phase's steps.
    pub fn status(&self) -> AggregateStatus {
        AggregateStatus::of(self.steps.iter().map(Step::status))
    }

    pub fn is_complete(&self) -> bool {
        self.status() == AggregateStatus::Complete
    }

    /// Indices of steps that may be offered resources, in priority order.
    pub fn candidates(&self) -> Vec<usize> {
        match self.strategy {
            Strategy::Serial => self
                .steps
                .iter()
                .position(|s| s.status() != StepStatus::Complete)
                .filter(|&i| self.steps[i].status().is_eligible())
                .into_iter()
                .collect(),
            Strategy::Parallel => self
                .steps
                .iter()
                .enumerate()
                .filter(|(_, s)| s.status().is_eligible())
                .map(|(i, _)| i)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SpecHash, StepIntent};
    use keel_id::PodInstanceName;

    fn phase(strategy: Strategy, n: u32) -> Phase {
        let mut phase = Phase::new("hello", strategy);
        for i in 0..n {
            phase
                .push(Step::new(
                    PodInstanceName::new("hello", i).unwrap(),
                    StepIntent::Deploy,
                    SpecHash::from_stored("sha256:abc"),
                ))
                .unwrap();
        }
        phase
    }

    #[test]
    fn test_serial_only_first_incomplete() {
        let mut p = phase(Strategy::Serial, 3);
        assert_eq!(p.candidates(), vec![0]);

        let first = &mut p.steps_mut()[0];
        first.transition(StepStatus::Prepared).unwrap();
        assert_eq!(p.candidates(), vec![0]);

        let first = &mut p.steps_mut()[0];
        first.transition(StepStatus::Starting).unwrap();
        assert!(p.candidates().is_empty(), "in-flight step blocks a serial phase");

        let first = &mut p.steps_mut()[0];
        first.transition(StepStatus::Started).unwrap();
        first.transition(StepStatus::Complete).unwrap();
        assert_eq!(p.candidates(), vec![1]);
    }

    #[test]
    fn test_serial_error_blocks() {
        let mut p = phase(Strategy::Serial, 2);
        p.steps_mut()[0].fail("boom").unwrap();
        assert!(p.candidates().is_empty());
        assert_eq!(p.status(), AggregateStatus::Error);
    }

    #[test]
    fn test_parallel_all_eligible() {
        let mut p = phase(Strategy::Parallel, 3);
        p.steps_mut()[1].transition(StepStatus::Prepared).unwrap();
        p.steps_mut()[1].transition(StepStatus::Starting).unwrap();
        assert_eq!(p.candidates(), vec![0, 2]);
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let mut p = phase(Strategy::Serial, 1);
        let dup = Step::new(
            PodInstanceName::new("hello", 0).unwrap(),
            StepIntent::Deploy,
            SpecHash::from_stored("sha256:abc"),
        );
        assert!(matches!(p.push(dup), Err(ReconcileError::DuplicateName(_))));
    }

    #[test]
    fn test_empty_phase_is_complete() {
        assert!(Phase::new("empty", Strategy::Serial).is_complete());
    }
}
