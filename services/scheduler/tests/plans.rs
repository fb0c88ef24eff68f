//! Integration tests for plan execution.
//!
//! Drives a scheduler with an in-memory store through offer cycles and
//! task status updates, checking step progression, plan ordering,
//! recovery, replacement and uninstall.

use keel_events::{
    Offer, OfferedResource, OperationKind, OutboundMessage, ResourceOperation, TaskState,
    TaskStatusUpdate, ValueRange,
};
use keel_id::{NodeId, OfferId, PodInstanceName, TaskId};
use keel_reconcile::{AggregateStatus, StepIntent, StepStatus};
use keel_scheduler::evaluate::Evaluator;
use keel_scheduler::spec::{ServiceSpec, RECOVERY_PLAN};
use keel_scheduler::state::{StateStore, StepRecord};
use keel_scheduler::{Command, Scheduler, SchedulerError};

const ROLE: &str = "hello-world-role";

const TWO_PHASE: &str = r#"{
    "name": "hello-world",
    "pods": [
        {"type": "hello", "count": 1, "tasks": [{"name": "server",
            "resources": [{"type": "scalar", "name": "cpus", "value": 1}]}]},
        {"type": "world", "count": 1, "tasks": [{"name": "server",
            "resources": [{"type": "scalar", "name": "cpus", "value": 1}]}]}
    ],
    "plans": [{"name": "deploy", "strategy": "parallel", "phases": [
        {"name": "p1", "pod": "hello"},
        {"name": "p2", "pod": "world"}
    ]}]
}"#;

fn web(count: u32) -> String {
    format!(
        r#"{{
        "name": "hello-world",
        "pods": [
            {{"type": "hello", "count": {count}, "tasks": [{{"name": "server", "readiness_check": true,
                "resources": [
                    {{"type": "scalar", "name": "cpus", "value": 1}},
                    {{"type": "scalar", "name": "mem", "value": 512}},
                    {{"type": "volume", "container_path": "data", "size_mb": 256, "source": {{"kind": "root"}}}}
                ]}}]}}
        ]
    }}"#
    )
}

fn scheduler_with(json: &str, store: StateStore) -> Scheduler {
    let spec = ServiceSpec::from_json(json).unwrap();
    let evaluator = Evaluator::new(&spec.name, ROLE, "hello-world-principal");
    Scheduler::new(spec, evaluator, store).unwrap()
}

fn scheduler(json: &str) -> Scheduler {
    scheduler_with(json, StateStore::open_in_memory().unwrap())
}

fn offer_on(node_id: NodeId, resources: Vec<OfferedResource>) -> Offer {
    Offer {
        id: OfferId::new(),
        node_id,
        hostname: "agent-1".into(),
        role: ROLE.into(),
        resources,
    }
}

fn big_offer() -> Offer {
    offer_on(
        NodeId::new(),
        vec![
            OfferedResource::scalar("cpus", 8.0),
            OfferedResource::scalar("mem", 8192.0),
            OfferedResource::scalar("disk", 10240.0),
            OfferedResource::ranges("ports", vec![ValueRange::new(8000, 9000).unwrap()]),
        ],
    )
}

fn pod(name: &str) -> PodInstanceName {
    name.parse().unwrap()
}

fn accepts(messages: &[OutboundMessage]) -> Vec<&[ResourceOperation]> {
    messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::Accept { operations, .. } => Some(operations.as_slice()),
            _ => None,
        })
        .collect()
}

fn kills(messages: &[OutboundMessage]) -> Vec<TaskId> {
    messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::Kill { task_ids } => Some(task_ids.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn kinds(operations: &[ResourceOperation]) -> Vec<OperationKind> {
    operations.iter().map(ResourceOperation::kind).collect()
}

fn launched_pod(operations: &[ResourceOperation]) -> Option<&PodInstanceName> {
    operations.iter().find_map(|op| match op {
        ResourceOperation::Launch { pod_instance, .. } => Some(pod_instance),
        _ => None,
    })
}

/// Resources as the resource manager would re-offer them after `operations`
/// were applied.
fn applied(operations: &[ResourceOperation]) -> Vec<OfferedResource> {
    let mut resources: Vec<OfferedResource> = Vec::new();
    for op in operations {
        match op {
            ResourceOperation::Reserve { resource } => resources.push(resource.clone()),
            ResourceOperation::Create { volume } => {
                if let Some(existing) = resources.iter_mut().find(|r| r.label() == volume.label()) {
                    *existing = volume.clone();
                }
            }
            _ => {}
        }
    }
    resources
}

fn step_status(scheduler: &Scheduler, plan: &str, phase: &str, step: &str) -> StepStatus {
    let addr = scheduler.plans().find(plan, phase, step).unwrap();
    scheduler.plans().step(addr).status()
}

fn report(scheduler: &mut Scheduler, pod: &PodInstanceName, state: TaskState, ready: Option<bool>) {
    for task in scheduler.store().tasks_for(pod).unwrap() {
        let mut update = TaskStatusUpdate::new(task.task_id, state);
        update.ready = ready;
        scheduler.handle_status(&update).unwrap();
    }
}

#[test]
fn test_offer_routed_to_first_phase_even_if_second_prepared_first() {
    let store = StateStore::open_in_memory().unwrap();
    let spec = ServiceSpec::from_json(TWO_PHASE).unwrap();
    store
        .save_step(&StepRecord {
            plan: "deploy".into(),
            phase: "p2".into(),
            name: "world-0".into(),
            position: 0,
            pod_instance: pod("world-0"),
            intent: StepIntent::Deploy,
            status: StepStatus::Prepared,
            target: spec.pod("world").unwrap().hash().unwrap(),
            errors: Vec::new(),
        })
        .unwrap();

    let mut scheduler = scheduler_with(TWO_PHASE, store);
    assert_eq!(step_status(&scheduler, "deploy", "p2", "world-0"), StepStatus::Prepared);

    let (messages, stats) = scheduler
        .process_offers(vec![offer_on(
            NodeId::new(),
            vec![OfferedResource::scalar("cpus", 1.0)],
        )])
        .unwrap();
    assert_eq!(stats.launched, 1);
    let accepted = accepts(&messages);
    assert_eq!(launched_pod(accepted[0]), Some(&pod("hello-0")));
    assert_eq!(step_status(&scheduler, "deploy", "p1", "hello-0"), StepStatus::Starting);
    assert_eq!(step_status(&scheduler, "deploy", "p2", "world-0"), StepStatus::Prepared);
}

#[test]
fn test_serial_deploy_waits_for_previous_step() {
    let mut scheduler = scheduler(&web(2));

    let (messages, _) = scheduler.process_offers(vec![big_offer(), big_offer()]).unwrap();
    assert_eq!(accepts(&messages).len(), 1);
    assert!(matches!(
        messages.last(),
        Some(OutboundMessage::Decline { offer_ids }) if offer_ids.len() == 1
    ));

    let first = pod("hello-0");
    report(&mut scheduler, &first, TaskState::Running, None);
    assert_eq!(step_status(&scheduler, "deploy", "hello", "hello-0"), StepStatus::Started);

    // Still not done: the readiness check has not passed.
    let (messages, _) = scheduler.process_offers(vec![big_offer()]).unwrap();
    assert!(accepts(&messages).is_empty());

    report(&mut scheduler, &first, TaskState::Running, Some(true));
    assert_eq!(step_status(&scheduler, "deploy", "hello", "hello-0"), StepStatus::Complete);

    let (messages, _) = scheduler.process_offers(vec![big_offer()]).unwrap();
    let accepted = accepts(&messages);
    assert_eq!(launched_pod(accepted[0]), Some(&pod("hello-1")));
    assert_eq!(
        kinds(accepted[0]),
        vec![
            OperationKind::Reserve,
            OperationKind::Reserve,
            OperationKind::Reserve,
            OperationKind::Create,
            OperationKind::Launch
        ]
    );
}

#[test]
fn test_finished_goal_completes_on_finish() {
    let mut scheduler = scheduler(
        r#"{"name": "hello-world", "pods": [{"type": "init", "count": 1, "tasks": [
            {"name": "bootstrap", "goal": "finished",
             "resources": [{"type": "scalar", "name": "cpus", "value": 0.5}]}]}]}"#,
    );
    scheduler.process_offers(vec![big_offer()]).unwrap();

    let init = pod("init-0");
    report(&mut scheduler, &init, TaskState::Running, None);
    assert_eq!(step_status(&scheduler, "deploy", "init", "init-0"), StepStatus::Started);
    report(&mut scheduler, &init, TaskState::Finished, None);
    assert_eq!(step_status(&scheduler, "deploy", "init", "init-0"), StepStatus::Complete);
    assert!(scheduler.plan("deploy").unwrap().is_complete());
}

#[test]
fn test_interrupt_and_proceed() {
    let mut scheduler = scheduler(TWO_PHASE);
    scheduler
        .handle_command(Command::Interrupt {
            plan: "deploy".into(),
        })
        .unwrap();
    assert_eq!(
        scheduler.plan("deploy").unwrap().status(),
        AggregateStatus::Interrupted
    );

    let (messages, stats) = scheduler.process_offers(vec![big_offer()]).unwrap();
    assert!(accepts(&messages).is_empty());
    assert_eq!(stats.declined, 1);

    scheduler
        .handle_command(Command::Proceed {
            plan: "deploy".into(),
        })
        .unwrap();
    let (messages, _) = scheduler.process_offers(vec![big_offer(), big_offer()]).unwrap();
    assert_eq!(accepts(&messages).len(), 2);

    assert!(matches!(
        scheduler.handle_command(Command::Interrupt {
            plan: "missing".into()
        }),
        Err(SchedulerError::Plan(_))
    ));
}

#[test]
fn test_configuration_error_moves_step_to_error() {
    let mut scheduler = scheduler(
        r#"{"name": "hello-world", "pods": [{"type": "gpu", "count": 1, "tasks": [
            {"name": "trainer", "resources": [{"type": "scalar", "name": "gpus", "value": 1}]}]}]}"#,
    );
    let (messages, stats) = scheduler.process_offers(vec![big_offer()]).unwrap();
    assert_eq!(stats.config_errors, 1);
    assert!(accepts(&messages).is_empty());

    let addr = scheduler.plans().find("deploy", "gpu", "gpu-0").unwrap();
    let step = scheduler.plans().step(addr);
    assert_eq!(step.status(), StepStatus::Error);
    assert!(step.errors()[0].contains("gpu-resources"));

    // Not retried.
    let (_, stats) = scheduler.process_offers(vec![big_offer()]).unwrap();
    assert_eq!(stats.evaluations, 0);

    // An operator can override the failed step.
    scheduler
        .handle_command(Command::ForceComplete {
            plan: "deploy".into(),
            phase: "gpu".into(),
            step: "gpu-0".into(),
        })
        .unwrap();
    assert!(scheduler.plan("deploy").unwrap().is_complete());
    assert!(matches!(
        scheduler.handle_command(Command::ForceComplete {
            plan: "deploy".into(),
            phase: "gpu".into(),
            step: "gpu-7".into(),
        }),
        Err(SchedulerError::UnknownStep(_))
    ));
}

#[test]
fn test_task_failure_schedules_recovery_on_same_reservations() {
    let mut scheduler = scheduler(&web(2));
    let node = NodeId::new();
    let mut offer = big_offer();
    offer.node_id = node;

    let (messages, _) = scheduler.process_offers(vec![offer]).unwrap();
    let first_ops = accepts(&messages)[0].to_vec();
    let first = pod("hello-0");
    report(&mut scheduler, &first, TaskState::Running, Some(true));
    assert_eq!(step_status(&scheduler, "deploy", "hello", "hello-0"), StepStatus::Complete);

    report(&mut scheduler, &first, TaskState::Failed, None);
    assert_eq!(
        step_status(&scheduler, RECOVERY_PLAN, "hello-0", "hello-0:[recover]"),
        StepStatus::Pending
    );

    // A second failure report does not queue another recovery.
    report(&mut scheduler, &first, TaskState::Lost, None);
    assert_eq!(scheduler.plan(RECOVERY_PLAN).unwrap().phases()[0].steps().len(), 1);

    // The node re-offers the reserved resources and its volume; the
    // recovery relaunches on them without new reservations.
    let (messages, _) = scheduler
        .process_offers(vec![offer_on(node, applied(&first_ops))])
        .unwrap();
    let accepted = accepts(&messages);
    assert_eq!(accepted.len(), 1);
    assert_eq!(kinds(accepted[0]), vec![OperationKind::Launch]);
    assert_eq!(
        step_status(&scheduler, RECOVERY_PLAN, "hello-0", "hello-0:[recover]"),
        StepStatus::Starting
    );
}

#[test]
fn test_failure_while_starting_fails_step() {
    let mut scheduler = scheduler(&web(2));
    scheduler.process_offers(vec![big_offer()]).unwrap();
    let first = pod("hello-0");

    for task in scheduler.store().tasks_for(&first).unwrap() {
        let update = TaskStatusUpdate::new(task.task_id, TaskState::Failed).with_message("exit 1");
        scheduler.handle_status(&update).unwrap();
    }

    let addr = scheduler.plans().find("deploy", "hello", "hello-0").unwrap();
    let step = scheduler.plans().step(addr);
    assert_eq!(step.status(), StepStatus::Error);
    assert_eq!(step.errors(), ["task server failed: exit 1".to_string()]);
    assert!(scheduler
        .plans()
        .find(RECOVERY_PLAN, "hello-0", "hello-0:[recover]")
        .is_some());
}

#[test]
fn test_recovery_unblocks_serial_deploy() {
    let mut scheduler = scheduler(&web(2));
    let node = NodeId::new();
    let mut offer = big_offer();
    offer.node_id = node;
    let (messages, _) = scheduler.process_offers(vec![offer]).unwrap();
    let first_ops = accepts(&messages)[0].to_vec();
    let first = pod("hello-0");

    report(&mut scheduler, &first, TaskState::Failed, None);
    assert_eq!(step_status(&scheduler, "deploy", "hello", "hello-0"), StepStatus::Error);
    assert_eq!(
        scheduler.plan("deploy").unwrap().status(),
        AggregateStatus::Error
    );

    // The failed task released nothing; the recovery relaunches in place.
    let (messages, _) = scheduler
        .process_offers(vec![offer_on(node, applied(&first_ops))])
        .unwrap();
    assert_eq!(kinds(accepts(&messages)[0]), vec![OperationKind::Launch]);
    report(&mut scheduler, &first, TaskState::Running, Some(true));
    assert_eq!(
        step_status(&scheduler, RECOVERY_PLAN, "hello-0", "hello-0:[recover]"),
        StepStatus::Complete
    );

    // The failed deploy step is superseded and keeps its error.
    let addr = scheduler.plans().find("deploy", "hello", "hello-0").unwrap();
    assert_eq!(scheduler.plans().step(addr).status(), StepStatus::Complete);
    assert_eq!(scheduler.plans().step(addr).errors().len(), 1);

    let (messages, stats) = scheduler.process_offers(vec![big_offer()]).unwrap();
    assert_eq!(stats.launched, 1);
    assert_eq!(launched_pod(accepts(&messages)[0]), Some(&pod("hello-1")));
}

#[test]
fn test_replace_stops_old_tasks_before_relaunch() {
    let mut scheduler = scheduler(&web(1));
    let node = NodeId::new();
    let mut offer = big_offer();
    offer.node_id = node;

    let (messages, _) = scheduler.process_offers(vec![offer]).unwrap();
    let first_ops = accepts(&messages)[0].to_vec();
    let first = pod("hello-0");
    report(&mut scheduler, &first, TaskState::Running, Some(true));

    let old_task = scheduler.store().tasks_for(&first).unwrap().remove(0);
    let old_labels: Vec<_> = scheduler
        .store()
        .reservations_for(&first)
        .unwrap()
        .iter()
        .map(|r| r.label)
        .collect();

    let messages = scheduler
        .handle_command(Command::Replace {
            pod_instance: first.clone(),
        })
        .unwrap();
    assert_eq!(kills(&messages), vec![old_task.task_id]);
    assert_eq!(
        step_status(&scheduler, RECOVERY_PLAN, "hello-0", "hello-0:[replace]"),
        StepStatus::Pending
    );

    // While the old task runs its resources are not offered, and the
    // replacement waits without a second kill.
    let (messages, stats) = scheduler.process_offers(vec![big_offer()]).unwrap();
    assert_eq!(stats.launched, 0);
    assert_eq!(stats.evaluations, 0);
    assert!(kills(&messages).is_empty());

    // Killing the old task is not a failure.
    report(&mut scheduler, &first, TaskState::Killed, None);
    assert_eq!(scheduler.plan(RECOVERY_PLAN).unwrap().phases()[0].steps().len(), 1);

    // The node offers the old reservations back with spare capacity: they
    // are released in the same accept that reserves the replacement.
    let mut resources = applied(&first_ops);
    resources.push(OfferedResource::scalar("cpus", 4.0));
    resources.push(OfferedResource::scalar("mem", 4096.0));
    resources.push(OfferedResource::scalar("disk", 4096.0));
    let (messages, _) = scheduler.process_offers(vec![offer_on(node, resources)]).unwrap();
    let accepted = accepts(&messages);
    assert_eq!(launched_pod(accepted[0]), Some(&first));
    assert_eq!(
        kinds(accepted[0]),
        vec![
            OperationKind::Destroy,
            OperationKind::Unreserve,
            OperationKind::Unreserve,
            OperationKind::Unreserve,
            OperationKind::Reserve,
            OperationKind::Reserve,
            OperationKind::Reserve,
            OperationKind::Create,
            OperationKind::Launch
        ]
    );

    let live = scheduler.store().reservations_for(&first).unwrap();
    assert_eq!(live.len(), 3);
    assert!(live.iter().all(|r| !old_labels.contains(&r.label)));
    let pending = scheduler.store().pending_releases().unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|p| p.requested));

    // Once the node stops offering them the releases are done.
    scheduler
        .process_offers(vec![offer_on(node, vec![OfferedResource::scalar("cpus", 1.0)])])
        .unwrap();
    assert!(scheduler.store().pending_releases().unwrap().is_empty());
}

#[test]
fn test_replace_of_stopped_pod_needs_no_kill() {
    let mut scheduler = scheduler(&web(1));
    scheduler.process_offers(vec![big_offer()]).unwrap();
    let first = pod("hello-0");
    report(&mut scheduler, &first, TaskState::Running, Some(true));
    report(&mut scheduler, &first, TaskState::Lost, None);

    let messages = scheduler
        .handle_command(Command::Replace {
            pod_instance: first.clone(),
        })
        .unwrap();
    assert!(messages.is_empty());

    // The waiting recovery was superseded by the replacement.
    let phase = &scheduler.plan(RECOVERY_PLAN).unwrap().phases()[0];
    assert_eq!(phase.steps().len(), 1);
    assert_eq!(phase.steps()[0].intent(), StepIntent::Replace);

    let (messages, _) = scheduler.process_offers(vec![big_offer()]).unwrap();
    assert_eq!(accepts(&messages)[0][0].kind(), OperationKind::Reserve);
    assert_eq!(scheduler.store().pending_releases().unwrap().len(), 3);
}

#[test]
fn test_replace_rejected_while_in_flight() {
    let mut scheduler = scheduler(&web(2));
    scheduler.process_offers(vec![big_offer()]).unwrap();
    let err = scheduler
        .handle_command(Command::Replace {
            pod_instance: pod("hello-0"),
        })
        .unwrap_err();
    assert!(matches!(err, SchedulerError::PodBusy(_)));

    let err = scheduler
        .handle_command(Command::Replace {
            pod_instance: pod("hello-9"),
        })
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Spec(_)));
}

#[test]
fn test_uninstall_releases_everything() {
    let mut scheduler = scheduler(&web(2));
    let node = NodeId::new();
    let mut offer = big_offer();
    offer.node_id = node;
    let (messages, _) = scheduler.process_offers(vec![offer]).unwrap();
    let first_ops = accepts(&messages)[0].to_vec();
    let first = pod("hello-0");
    let task = scheduler.store().tasks_for(&first).unwrap().remove(0);
    report(&mut scheduler, &first, TaskState::Running, None);

    let messages = scheduler.handle_command(Command::Uninstall).unwrap();
    assert_eq!(kills(&messages), vec![task.task_id]);
    assert!(!scheduler.is_uninstalled().unwrap());
    assert!(scheduler.plans().plans().iter().all(|p| p.is_interrupted()));

    // Proceed is refused while uninstalling.
    scheduler
        .handle_command(Command::Proceed {
            plan: "deploy".into(),
        })
        .unwrap();
    assert!(scheduler.plan("deploy").unwrap().is_interrupted());

    // The kill lands; its resources come back and are released.
    scheduler
        .handle_status(&TaskStatusUpdate::new(task.task_id, TaskState::Killed))
        .unwrap();
    assert!(scheduler.plan(RECOVERY_PLAN).unwrap().phases().is_empty());
    let mut resources = applied(&first_ops);
    resources.push(OfferedResource::scalar("cpus", 4.0));
    let (messages, stats) = scheduler.process_offers(vec![offer_on(node, resources)]).unwrap();
    assert_eq!(stats.launched, 0);
    assert_eq!(stats.cleaned, 1);
    assert_eq!(accepts(&messages)[0].len(), 4);

    scheduler
        .process_offers(vec![offer_on(node, vec![OfferedResource::scalar("cpus", 4.0)])])
        .unwrap();
    assert!(scheduler.is_uninstalled().unwrap());
}

#[test]
fn test_stale_status_ignored() {
    let mut scheduler = scheduler(&web(2));
    scheduler.process_offers(vec![big_offer()]).unwrap();

    let update = TaskStatusUpdate::new(TaskId::new(), TaskState::Failed);
    scheduler.handle_status(&update).unwrap();
    assert!(scheduler.plan(RECOVERY_PLAN).unwrap().phases().is_empty());
    assert_eq!(
        step_status(&scheduler, "deploy", "hello", "hello-0"),
        StepStatus::Starting
    );
}
