//! Plans and the coordinator that orders work across them.

use std::collections::HashSet;

use keel_id::PodInstanceName;

use crate::{Phase, ReconcileError, Step, StepStatus, Strategy};

/// Rolled-up status of a phase or plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateStatus {
    Pending,
    InProgress,
    Complete,
    Error,
    /// Incomplete and paused by an operator.
    Interrupted,
}

impl AggregateStatus {
    /// Roll up step statuses.
    pub fn of(statuses: impl IntoIterator<Item = StepStatus>) -> Self {
        Self::combine(statuses.into_iter().map(|s| match s {
            StepStatus::Pending => AggregateStatus::Pending,
            StepStatus::Complete => AggregateStatus::Complete,
            StepStatus::Error => AggregateStatus::Error,
            StepStatus::Prepared | StepStatus::Starting | StepStatus::Started => {
                AggregateStatus::InProgress
            }
        }))
    }

    /// Roll up child aggregates. No children means complete.
    pub fn combine(children: impl IntoIterator<Item = AggregateStatus>) -> Self {
        let (mut any, mut all_complete, mut all_pending) = (false, true, true);
        for child in children {
            any = true;
            if child == AggregateStatus::Error {
                return AggregateStatus::Error;
            }
            all_complete &= child == AggregateStatus::Complete;
            all_pending &= child == AggregateStatus::Pending;
        }
        if !any || all_complete {
            AggregateStatus::Complete
        } else if all_pending {
            AggregateStatus::Pending
        } else {
            AggregateStatus::InProgress
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::Pending => "PENDING",
            AggregateStatus::InProgress => "IN_PROGRESS",
            AggregateStatus::Complete => "COMPLETE",
            AggregateStatus::Error => "ERROR",
            AggregateStatus::Interrupted => "INTERRUPTED",
        }
    }
}

impl std::fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered set of phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    name: String,
    strategy: Strategy,
    phases: Vec<Phase>,
    interrupted: bool,
}

impl Plan {
    pub fn new(name: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            phases: Vec::new(),
            interrupted: false,
        }
    }

    /// Append a phase, rejecting duplicate names.
    pub fn push(&mut self, phase: Phase) -> Result<(), ReconcileError> {
        if self.phases.iter().any(|p| p.name() == phase.name()) {
            return Err(ReconcileError::DuplicateName(format!(
                "{}/{}",
                self.name,
                phase.name()
            )));
        }
        self.phases.push(phase);
        Ok(())
    }

    /// Append a step to the named phase, creating the phase if needed.
    pub fn push_step(
        &mut self,
        phase_name: &str,
        strategy: Strategy,
        step: Step,
    ) -> Result<(), ReconcileError> {
        if !self.phases.iter().any(|p| p.name() == phase_name) {
            self.phases.push(Phase::new(phase_name, strategy));
        }
        let phase = self
            .phases
            .iter_mut()
            .find(|p| p.name() == phase_name)
            .ok_or_else(|| ReconcileError::UnknownPhase {
                plan: self.name.clone(),
                phase: phase_name.to_string(),
            })?;
        phase.push(step)
    }

    /// Keep only the phases for which `keep` returns true.
    pub fn retain_phases(&mut self, keep: impl FnMut(&Phase) -> bool) {
        self.phases.retain(keep);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Pause the plan. In-flight steps are not aborted.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    /// Resume a paused plan.
    pub fn proceed(&mut self) {
        self.interrupted = false;
    }

    /// Rolled-up status of the plan.
    pub fn status(&self) -> AggregateStatus {
        let status = AggregateStatus::combine(self.phases.iter().map(Phase::status));
        match status {
            AggregateStatus::Complete | AggregateStatus::Error => status,
            _ if self.interrupted => AggregateStatus::Interrupted,
            _ => status,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status() == AggregateStatus::Complete
    }

    /// `(phase, step)` indices that may be offered resources, in priority order.
    pub fn candidates(&self) -> Vec<(usize, usize)> {
        if self.interrupted {
            return Vec::new();
        }
        let with_steps = |(i, phase): (usize, &Phase)| {
            phase.candidates().into_iter().map(move |s| (i, s))
        };
        match self.strategy {
            Strategy::Serial => self
                .phases
                .iter()
                .enumerate()
                .find(|(_, p)| !p.is_complete())
                .filter(|(_, p)| p.status() != AggregateStatus::Error)
                .into_iter()
                .flat_map(with_steps)
                .collect(),
            Strategy::Parallel => self.phases.iter().enumerate().flat_map(with_steps).collect(),
        }
    }
}

/// Position of a step inside a [`PlanCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepAddr {
    pub plan: usize,
    pub phase: usize,
    pub step: usize,
}

/// Orders work across all plans of a service.
///
/// Plans earlier in the list have priority. A pod instance is never a
/// candidate twice, and never a candidate while another step for it has
/// operations in flight.
#[derive(Debug, Clone, Default)]
pub struct PlanCoordinator {
    plans: Vec<Plan>,
}

impl PlanCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plan, rejecting duplicate names.
    pub fn push(&mut self, plan: Plan) -> Result<(), ReconcileError> {
        if self.plans.iter().any(|p| p.name() == plan.name()) {
            return Err(ReconcileError::DuplicateName(plan.name().to_string()));
        }
        self.plans.push(plan);
        Ok(())
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn plan(&self, name: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.name() == name)
    }

    pub fn plan_mut(&mut self, name: &str) -> Result<&mut Plan, ReconcileError> {
        self.plans
            .iter_mut()
            .find(|p| p.name() == name)
            .ok_or_else(|| ReconcileError::UnknownPlan(name.to_string()))
    }

    pub fn step(&self, addr: StepAddr) -> &Step {
        &self.plans[addr.plan].phases[addr.phase].steps()[addr.step]
    }

    pub fn step_mut(&mut self, addr: StepAddr) -> &mut Step {
        &mut self.plans[addr.plan].phases[addr.phase].steps_mut()[addr.step]
    }

    /// Names of the plan and phase holding `addr`.
    pub fn path(&self, addr: StepAddr) -> (&str, &str) {
        let plan = &self.plans[addr.plan];
        (plan.name(), plan.phases[addr.phase].name())
    }

    /// Every step with its address, in plan/phase/step order.
    pub fn steps(&self) -> impl Iterator<Item = (StepAddr, &Step)> + '_ {
        self.plans.iter().enumerate().flat_map(|(p, plan)| {
            plan.phases.iter().enumerate().flat_map(move |(ph, phase)| {
                phase.steps().iter().enumerate().map(move |(s, step)| {
                    (
                        StepAddr {
                            plan: p,
                            phase: ph,
                            step: s,
                        },
                        step,
                    )
                })
            })
        })
    }

    /// Locate a step by its names.
    pub fn find(&self, plan: &str, phase: &str, step: &str) -> Option<StepAddr> {
        self.steps().find_map(|(addr, s)| {
            let (plan_name, phase_name) = self.path(addr);
            (plan_name == plan && phase_name == phase && s.name() == step).then_some(addr)
        })
    }

    /// The step whose operations for `pod` are currently in flight.
    pub fn in_flight(&self, pod: &PodInstanceName) -> Option<StepAddr> {
        self.steps()
            .filter(|(_, s)| s.pod_instance() == pod && s.status().is_in_flight())
            .map(|(addr, _)| addr)
            .last()
    }

    /// Steps eligible for offers this cycle, highest priority first.
    pub fn candidates(&self) -> Vec<StepAddr> {
        let busy: HashSet<&PodInstanceName> = self
            .steps()
            .filter(|(_, s)| s.status().is_in_flight())
            .map(|(_, s)| s.pod_instance())
            .collect();

        let mut claimed: HashSet<&PodInstanceName> = HashSet::new();
        let mut out = Vec::new();
        for (p, plan) in self.plans.iter().enumerate() {
            for (phase, step) in plan.candidates() {
                let addr = StepAddr {
                    plan: p,
                    phase,
                    step,
                };
                let pod = self.step(addr).pod_instance();
                if busy.contains(pod) || !claimed.insert(pod) {
                    continue;
                }
                out.push(addr);
            }
        }
        out
    }
}
