//! The scheduler: offers in, accepts and declines out.
//!
//! Each offer cycle walks the eligible steps in priority order and gives
//! every step the first unused offer that satisfies its pod. A step whose
//! pod still has live tasks from an earlier launch gets a KILL for them
//! instead, and waits until they stop. Offers no step wanted are checked for
//! orphaned reservations and otherwise declined.
//!
//! State for an accepted offer is committed to the store before the accept
//! is returned, so a crash after the commit replays at most one launch.

use std::collections::HashMap;

use keel_events::{Offer, OutboundMessage, TaskStatusUpdate};
use keel_id::{PodInstanceName, TaskId};
use keel_reconcile::{
    Plan, PlanCoordinator, ReconcileError, Step, StepAddr, StepIntent, StepStatus, Strategy,
};
use tracing::{debug, error, info, instrument, warn};

use crate::cleaner::ResourceCleaner;
use crate::evaluate::{EvaluationOutcome, Evaluator};
use crate::spec::{ServiceSpec, SpecError, TaskGoal, RECOVERY_PLAN};
use crate::state::{StateStore, StepRecord, TaskRecord};

use super::plans::{build_plans, pod_target, step_record};
use super::{Command, SchedulerError, SchedulerResult};

/// Property set once an uninstall has been requested.
const UNINSTALL_PROPERTY: &str = "uninstall";

/// Statistics from one offer cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub offers: usize,
    pub evaluations: usize,
    pub launched: usize,
    pub killed: usize,
    pub cleaned: usize,
    pub declined: usize,
    pub config_errors: usize,
}

/// Offer-driven scheduler for one service.
pub struct Scheduler {
    spec: ServiceSpec,
    evaluator: Evaluator,
    cleaner: ResourceCleaner,
    plans: PlanCoordinator,
    store: StateStore,
    uninstalling: bool,
}

impl Scheduler {
    /// Build the scheduler, restoring plan progress from `store`.
    pub fn new(
        spec: ServiceSpec,
        evaluator: Evaluator,
        store: StateStore,
    ) -> SchedulerResult<Self> {
        let cleaner = ResourceCleaner::new(evaluator.role());
        let uninstalling = store.property(UNINSTALL_PROPERTY)?.as_deref() == Some("true");
        let flags: HashMap<String, bool> = store.plan_flags()?.into_iter().collect();

        let persisted = store.load_steps()?;
        let mut plans = PlanCoordinator::new();
        for mut plan in build_plans(&spec, &persisted)? {
            match flags.get(plan.name()) {
                Some(true) => plan.interrupt(),
                Some(false) => plan.proceed(),
                None => {}
            }
            if uninstalling {
                plan.interrupt();
            }
            plans.push(plan)?;
        }

        let scheduler = Self {
            spec,
            evaluator,
            cleaner,
            plans,
            store,
            uninstalling,
        };
        scheduler.persist_plans()?;

        info!(
            service = %scheduler.spec.name,
            plans = scheduler.plans.plans().len(),
            uninstalling,
            "Scheduler restored"
        );
        Ok(scheduler)
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn plans(&self) -> &PlanCoordinator {
        &self.plans
    }

    pub fn plan(&self, name: &str) -> Option<&Plan> {
        self.plans.plan(name)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Returns true once an uninstall has released everything.
    pub fn is_uninstalled(&self) -> SchedulerResult<bool> {
        Ok(self.uninstalling
            && self.store.all_reservations()?.is_empty()
            && self.store.pending_releases()?.is_empty())
    }

    // =========================================================================
    // Offers
    // =========================================================================

    /// Run one offer cycle.
    #[instrument(skip_all, fields(offers = offers.len()))]
    pub fn process_offers(
        &mut self,
        offers: Vec<Offer>,
    ) -> SchedulerResult<(Vec<OutboundMessage>, CycleStats)> {
        let mut stats = CycleStats {
            offers: offers.len(),
            ..CycleStats::default()
        };
        let mut unused = offers;
        let mut messages = Vec::new();

        if !self.uninstalling {
            for addr in self.plans.candidates() {
                let live = self.live_tasks(self.plans.step(addr).pod_instance())?;
                if !live.is_empty() {
                    if let Some(kill) = self.kill(&live)? {
                        messages.push(kill);
                        stats.killed += 1;
                    }
                    continue;
                }
                if unused.is_empty() {
                    continue;
                }
                if let Some(message) = self.offer_to_step(addr, &mut unused, &mut stats)? {
                    messages.push(message);
                    stats.launched += 1;
                }
            }
        }

        let owned = self.store.owned_labels()?;
        let pending = self.store.pending_releases()?;
        let mut declined = Vec::new();
        for offer in unused {
            let cleanup = self.cleaner.clean(&offer, &owned, &pending);
            if !cleanup.confirmed.is_empty() {
                self.store.clear_releases(&cleanup.confirmed)?;
                debug!(
                    node_id = %offer.node_id,
                    released = cleanup.confirmed.len(),
                    "Pending releases confirmed"
                );
            }
            if cleanup.operations.is_empty() {
                declined.push(offer.id);
                continue;
            }

            self.store.mark_requested(&cleanup.released)?;
            info!(
                offer_id = %offer.id,
                node_id = %offer.node_id,
                operations = cleanup.operations.len(),
                "Releasing orphaned resources"
            );
            messages.push(OutboundMessage::Accept {
                offer_id: offer.id,
                node_id: offer.node_id,
                operations: cleanup.operations,
            });
            stats.cleaned += 1;
        }

        stats.declined = declined.len();
        if !declined.is_empty() {
            messages.push(OutboundMessage::Decline {
                offer_ids: declined,
            });
        }

        info!(
            offers = stats.offers,
            evaluations = stats.evaluations,
            launched = stats.launched,
            killed = stats.killed,
            cleaned = stats.cleaned,
            declined = stats.declined,
            config_errors = stats.config_errors,
            "Offer cycle complete"
        );
        Ok((messages, stats))
    }

    /// Try every unused offer against one step, consuming the first that
    /// fits.
    fn offer_to_step(
        &mut self,
        addr: StepAddr,
        unused: &mut Vec<Offer>,
        stats: &mut CycleStats,
    ) -> SchedulerResult<Option<OutboundMessage>> {
        if self.plans.step(addr).status() == StepStatus::Pending {
            self.update_step(addr, |step| step.transition(StepStatus::Prepared))?;
        }

        let step = self.plans.step(addr).clone();
        let pod = match self.spec.pod_instance(step.pod_instance()) {
            Ok(pod) => pod,
            Err(e) => {
                warn!(step = step.name(), error = %e, "Step targets a pod no longer in the spec");
                self.fail_step(addr, e.to_string())?;
                return Ok(None);
            }
        };
        let existing = if step.intent().reuses_reservations() {
            self.store.reservations_for(&pod.name)?
        } else {
            Vec::new()
        };

        for i in 0..unused.len() {
            if !self.evaluator.accepts_role(&unused[i], &pod) {
                continue;
            }
            stats.evaluations += 1;
            match self.evaluator.evaluate(&unused[i], &pod, &existing) {
                Ok(outcome) if outcome.passed() => {
                    let offer = unused.remove(i);
                    let outcome = match step.intent() {
                        StepIntent::Replace => self.release_replaced(outcome, &offer)?,
                        _ => outcome,
                    };
                    return self.launch(addr, outcome, &offer).map(Some);
                }
                Ok(outcome) => {
                    debug!(
                        step = step.name(),
                        offer_id = %unused[i].id,
                        unmet = %outcome
                            .unmet
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join("; "),
                        "Offer does not satisfy step"
                    );
                }
                Err(e) => {
                    error!(step = step.name(), error = %e, "Invalid pod configuration");
                    self.fail_step(addr, e.to_string())?;
                    stats.config_errors += 1;
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    /// Prepend the release of the pod's old reservations that `offer`
    /// still carries.
    fn release_replaced(
        &self,
        mut outcome: EvaluationOutcome,
        offer: &Offer,
    ) -> SchedulerResult<EvaluationOutcome> {
        let old = self.store.reservations_for(&outcome.pod_instance)?;
        let cleanup = self.cleaner.release(offer, &old);
        if cleanup.operations.is_empty() {
            return Ok(outcome);
        }

        outcome
            .superseded
            .extend(old.into_iter().filter(|record| cleanup.released.contains(&record.label)));
        let mut operations = cleanup.operations;
        operations.append(&mut outcome.operations);
        outcome.operations = operations;
        Ok(outcome)
    }

    fn launch(
        &mut self,
        addr: StepAddr,
        outcome: EvaluationOutcome,
        offer: &Offer,
    ) -> SchedulerResult<OutboundMessage> {
        let mut next = self.plans.step(addr).clone();
        next.transition(StepStatus::Starting)?;
        let record = self.record(addr, &next);

        self.store.commit_launch(
            &outcome.pod_instance,
            &outcome.reservations,
            &outcome.superseded,
            &outcome.tasks,
            &record,
        )?;
        *self.plans.step_mut(addr) = next;

        info!(
            step = %record.name,
            plan = %record.plan,
            offer_id = %offer.id,
            node_id = %offer.node_id,
            hostname = %offer.hostname,
            operations = outcome.operations.len(),
            "Launching pod"
        );
        Ok(OutboundMessage::Accept {
            offer_id: outcome.offer_id,
            node_id: outcome.node_id,
            operations: outcome.operations,
        })
    }

    // =========================================================================
    // Task status
    // =========================================================================

    /// Apply a task status update and advance the step that launched it.
    #[instrument(skip_all, fields(task_id = %update.task_id, state = %update.state.as_str()))]
    pub fn handle_status(&mut self, update: &TaskStatusUpdate) -> SchedulerResult<()> {
        let Some(task) = self
            .store
            .update_task(&update.task_id, update.state, update.ready)?
        else {
            debug!("Status for unknown task ignored");
            return Ok(());
        };
        if task.kill_requested {
            debug!(pod = %task.pod_instance, "Status for stopped task");
            return Ok(());
        }

        let failed = update.state.is_failure()
            || (update.state.is_terminal() && task.goal == TaskGoal::Running);
        let pod = task.pod_instance.clone();

        let Some(addr) = self.plans.in_flight(&pod) else {
            if failed && !self.uninstalling {
                warn!(pod = %pod, task = %task.task_name, "Task failed, scheduling recovery");
                self.schedule(&pod, StepIntent::Recover)?;
            }
            return Ok(());
        };

        if failed {
            let mut reason = format!("task {} {}", task.task_name, update.state.as_str());
            if let Some(message) = &update.message {
                reason.push_str(": ");
                reason.push_str(message);
            }
            warn!(pod = %pod, reason = %reason, "Step failed");
            self.fail_step(addr, reason)?;
            if !self.uninstalling {
                self.schedule(&pod, StepIntent::Recover)?;
            }
            return Ok(());
        }

        let tasks = self.store.tasks_for(&pod)?;
        if self.plans.step(addr).status() == StepStatus::Starting
            && tasks.iter().all(TaskRecord::is_started)
        {
            self.update_step(addr, |step| step.transition(StepStatus::Started))?;
        }
        if self.plans.step(addr).status() == StepStatus::Started
            && tasks.iter().all(TaskRecord::is_done)
        {
            self.update_step(addr, |step| step.transition(StepStatus::Complete))?;
            info!(pod = %pod, step = self.plans.step(addr).name(), "Step complete");
            self.supersede_failed(&pod, addr)?;
        }
        Ok(())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Apply an operator command, returning messages for the transport.
    #[instrument(skip(self))]
    pub fn handle_command(&mut self, command: Command) -> SchedulerResult<Vec<OutboundMessage>> {
        let mut messages = Vec::new();
        match command {
            Command::Interrupt { plan } => {
                self.plans.plan_mut(&plan)?.interrupt();
                self.store.set_interrupted(&plan, true)?;
                info!(plan = %plan, "Plan interrupted");
            }
            Command::Proceed { plan } => {
                if self.uninstalling {
                    warn!(plan = %plan, "Ignoring proceed during uninstall");
                    return Ok(messages);
                }
                self.plans.plan_mut(&plan)?.proceed();
                self.store.set_interrupted(&plan, false)?;
                info!(plan = %plan, "Plan proceeding");
            }
            Command::ForceComplete { plan, phase, step } => {
                let addr = self.plans.find(&plan, &phase, &step).ok_or_else(|| {
                    SchedulerError::UnknownStep(format!("{}/{}/{}", plan, phase, step))
                })?;
                self.update_step(addr, |step| {
                    step.force_complete();
                    Ok(())
                })?;
                info!(plan = %plan, phase = %phase, step = %step, "Step force-completed");
            }
            Command::Replace { pod_instance } => {
                self.spec.pod_instance(&pod_instance)?;
                if self.plans.in_flight(&pod_instance).is_some() {
                    return Err(SchedulerError::PodBusy(pod_instance));
                }
                self.schedule(&pod_instance, StepIntent::Replace)?;
                let live = self.live_tasks(&pod_instance)?;
                messages.extend(self.kill(&live)?);
                info!(pod = %pod_instance, stopping = live.len(), "Pod replacement scheduled");
            }
            Command::Uninstall => {
                self.uninstalling = true;
                self.store.set_property(UNINSTALL_PROPERTY, "true")?;
                let names: Vec<String> =
                    self.plans.plans().iter().map(|p| p.name().to_string()).collect();
                for name in names {
                    self.plans.plan_mut(&name)?.interrupt();
                    self.store.set_interrupted(&name, true)?;
                }
                let live: Vec<TaskRecord> = self
                    .store
                    .all_tasks()?
                    .into_iter()
                    .filter(TaskRecord::is_live)
                    .collect();
                messages.extend(self.kill(&live)?);
                let released = self.store.release_all()?;
                info!(released, stopping = live.len(), "Uninstall started");
            }
        }
        Ok(messages)
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Launch records of `pod` that may still hold resources.
    fn live_tasks(&self, pod: &PodInstanceName) -> SchedulerResult<Vec<TaskRecord>> {
        Ok(self
            .store
            .tasks_for(pod)?
            .into_iter()
            .filter(TaskRecord::is_live)
            .collect())
    }

    /// KILL the live tasks among `tasks` not already being stopped.
    fn kill(&mut self, tasks: &[TaskRecord]) -> SchedulerResult<Option<OutboundMessage>> {
        let task_ids: Vec<TaskId> = tasks
            .iter()
            .filter(|task| task.is_live() && !task.kill_requested)
            .map(|task| task.task_id)
            .collect();
        if task_ids.is_empty() {
            return Ok(None);
        }

        self.store.mark_kill_requested(&task_ids)?;
        info!(tasks = task_ids.len(), "Stopping tasks");
        Ok(Some(OutboundMessage::Kill { task_ids }))
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Add a recover or replace step for `pod` to the recovery plan.
    ///
    /// A recovery already waiting for the pod absorbs a new recover request;
    /// a replace supersedes it.
    fn schedule(&mut self, pod: &PodInstanceName, intent: StepIntent) -> SchedulerResult<()> {
        let target = match pod_target(&self.spec, pod.pod_type()) {
            Ok(target) => target,
            Err(SchedulerError::Spec(SpecError::UnknownPod(pod_type))) => {
                warn!(pod = %pod, pod_type = %pod_type, "Pod type no longer in the spec");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let phase_name = pod.to_string();

        let recovery = self.plans.plan_mut(RECOVERY_PLAN)?;
        let active = recovery
            .phases()
            .iter()
            .find(|p| p.name() == phase_name)
            .map(|p| p.steps().iter().any(|s| !s.status().is_terminal()))
            .unwrap_or(false);
        if active && intent == StepIntent::Recover {
            debug!(pod = %pod, "Recovery already scheduled");
            return Ok(());
        }

        let step = Step::new(pod.clone(), intent, target);
        let step_name = step.name().to_string();
        recovery.retain_phases(|p| p.name() != phase_name);
        recovery.push_step(&phase_name, Strategy::Serial, step)?;
        self.store.delete_phase(RECOVERY_PLAN, &phase_name)?;

        if let Some(addr) = self.plans.find(RECOVERY_PLAN, &phase_name, &step_name) {
            self.store.save_step(&self.record(addr, self.plans.step(addr)))?;
        }
        info!(pod = %pod, intent = intent.as_str(), "Recovery step added");
        Ok(())
    }

    fn update_step(
        &mut self,
        addr: StepAddr,
        change: impl FnOnce(&mut Step) -> Result<(), ReconcileError>,
    ) -> SchedulerResult<()> {
        change(self.plans.step_mut(addr))?;
        self.store.save_step(&self.record(addr, self.plans.step(addr)))?;
        Ok(())
    }

    fn fail_step(&mut self, addr: StepAddr, reason: String) -> SchedulerResult<()> {
        self.update_step(addr, |step| step.fail(reason))
    }

    /// A completed launch of `pod` supersedes its earlier failed steps.
    fn supersede_failed(&mut self, pod: &PodInstanceName, completed: StepAddr) -> SchedulerResult<()> {
        let failed: Vec<StepAddr> = self
            .plans
            .steps()
            .filter(|(addr, step)| {
                *addr != completed
                    && step.pod_instance() == pod
                    && step.status() == StepStatus::Error
            })
            .map(|(addr, _)| addr)
            .collect();
        for addr in failed {
            self.update_step(addr, |step| {
                step.force_complete();
                Ok(())
            })?;
            info!(pod = %pod, step = self.plans.step(addr).name(), "Failed step superseded");
        }
        Ok(())
    }

    fn record(&self, addr: StepAddr, step: &Step) -> StepRecord {
        let (plan, phase) = self.plans.path(addr);
        step_record(plan, phase, addr.step, step)
    }

    /// Write every step and plan flag, replacing rows of steps that no
    /// longer exist.
    fn persist_plans(&self) -> SchedulerResult<()> {
        for plan in self.plans.plans() {
            self.store.delete_steps(plan.name())?;
            self.store.set_interrupted(plan.name(), plan.is_interrupted())?;
        }
        for (addr, step) in self.plans.steps() {
            self.store.save_step(&self.record(addr, step))?;
        }
        Ok(())
    }
}
