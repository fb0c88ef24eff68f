//! Plan construction and restoration.
//!
//! Plans are rebuilt from the service spec on every start. Persisted step
//! rows are overlaid on the rebuilt steps when the step still targets the
//! same pod definition; a step whose target changed starts over from
//! `PENDING`.

use std::collections::HashMap;

use keel_id::PodInstanceName;
use keel_reconcile::{Plan, SpecHash, Step, StepIntent, Strategy};
use tracing::info;

use crate::spec::{
    PhaseSpec, PlanSpec, PodSpec, ServiceSpec, SpecError, DEPLOY_PLAN, RECOVERY_PLAN,
};
use crate::state::StepRecord;

use super::SchedulerResult;

type StepKey<'a> = (&'a str, &'a str, &'a str);

/// Every plan of the service, in priority order: deploy, custom plans,
/// then recovery.
pub(crate) fn build_plans(
    spec: &ServiceSpec,
    persisted: &[StepRecord],
) -> SchedulerResult<Vec<Plan>> {
    let rows: HashMap<StepKey<'_>, &StepRecord> = persisted
        .iter()
        .map(|r| ((r.plan.as_str(), r.phase.as_str(), r.name.as_str()), r))
        .collect();

    let mut plans = Vec::new();
    let mut changed = 0;

    let deploy = match spec.deploy_plan() {
        Some(custom) => custom.clone(),
        None => default_deploy_plan(spec),
    };
    plans.push(build_plan(spec, &deploy, &rows, &mut changed)?);
    for custom in spec.plans.iter().filter(|p| p.name != DEPLOY_PLAN) {
        plans.push(build_plan(spec, custom, &rows, &mut changed)?);
    }
    plans.push(recovery_plan(persisted)?);

    if changed > 0 {
        info!(steps = changed, "Configuration change detected, steps reset");
    }
    Ok(plans)
}

/// One serial phase per pod type, in declaration order.
fn default_deploy_plan(spec: &ServiceSpec) -> PlanSpec {
    PlanSpec {
        name: DEPLOY_PLAN.to_string(),
        strategy: Strategy::Serial,
        start_interrupted: false,
        phases: spec
            .pods
            .iter()
            .map(|pod| PhaseSpec {
                name: pod.pod_type.clone(),
                strategy: Strategy::Serial,
                pod: pod.pod_type.clone(),
                instances: None,
            })
            .collect(),
    }
}

fn build_plan(
    spec: &ServiceSpec,
    plan_spec: &PlanSpec,
    rows: &HashMap<StepKey<'_>, &StepRecord>,
    changed: &mut usize,
) -> SchedulerResult<Plan> {
    let mut plan = Plan::new(plan_spec.name.clone(), plan_spec.strategy);
    if plan_spec.start_interrupted {
        plan.interrupt();
    }

    for phase in &plan_spec.phases {
        let pod = spec
            .pod(&phase.pod)
            .ok_or_else(|| SpecError::UnknownPod(phase.pod.clone()))?;
        let target = pod.hash()?;

        for name in phase_instances(pod, phase.instances.as_deref())? {
            let fresh = Step::new(name, StepIntent::Deploy, target.clone());
            let step = match rows.get(&(plan_spec.name.as_str(), phase.name.as_str(), fresh.name())) {
                Some(row) if row.target == target && row.intent == StepIntent::Deploy => {
                    restore(row)
                }
                Some(_) => {
                    *changed += 1;
                    fresh
                }
                None => fresh,
            };
            plan.push_step(&phase.name, phase.strategy, step)?;
        }
    }
    Ok(plan)
}

fn phase_instances(
    pod: &PodSpec,
    instances: Option<&[u32]>,
) -> Result<Vec<PodInstanceName>, SpecError> {
    match instances {
        None => pod.instance_names(),
        Some(indices) => indices
            .iter()
            .map(|&i| PodInstanceName::new(pod.pod_type.clone(), i).map_err(SpecError::from))
            .collect(),
    }
}

/// The recovery plan, rebuilt from its persisted rows. Each pod instance
/// gets its own phase so pods recover independently.
fn recovery_plan(persisted: &[StepRecord]) -> SchedulerResult<Plan> {
    let mut plan = Plan::new(RECOVERY_PLAN, Strategy::Parallel);
    for row in persisted.iter().filter(|r| r.plan == RECOVERY_PLAN) {
        plan.push_step(&row.phase, Strategy::Serial, restore(row))?;
    }
    Ok(plan)
}

fn restore(row: &StepRecord) -> Step {
    Step::restore(
        row.name.clone(),
        row.pod_instance.clone(),
        row.intent,
        row.status,
        row.target.clone(),
        row.errors.clone(),
    )
}

/// The persisted form of `step`.
pub(crate) fn step_record(
    plan: &str,
    phase: &str,
    position: usize,
    step: &Step,
) -> StepRecord {
    StepRecord {
        plan: plan.to_string(),
        phase: phase.to_string(),
        name: step.name().to_string(),
        position,
        pod_instance: step.pod_instance().clone(),
        intent: step.intent(),
        status: step.status(),
        target: step.target().clone(),
        errors: step.errors().to_vec(),
    }
}

/// Target hash for a recovery of `pod_type`.
pub(crate) fn pod_target(spec: &ServiceSpec, pod_type: &str) -> SchedulerResult<SpecHash> {
    let pod = spec
        .pod(pod_type)
        .ok_or_else(|| SpecError::UnknownPod(pod_type.to_string()))?;
    Ok(pod.hash()?)
}
