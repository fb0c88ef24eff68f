//! Integration tests for restart and recovery of scheduler state.
//!
//! The scheduler is dropped and rebuilt on the same database file to check
//! that reservations, step progress and operator decisions survive.

use keel_events::{
    Offer, OfferedResource, OperationKind, OutboundMessage, ResourceOperation, TaskState,
    TaskStatusUpdate, ValueRange,
};
use keel_id::{NodeId, OfferId, PodInstanceName};
use keel_reconcile::StepStatus;
use keel_scheduler::evaluate::Evaluator;
use keel_scheduler::spec::ServiceSpec;
use keel_scheduler::state::StateStore;
use keel_scheduler::{Command, Scheduler};
use tempfile::TempDir;

const ROLE: &str = "data-role";

fn spec_json(mem: u32) -> String {
    format!(
        r#"{{
        "name": "data",
        "pods": [{{"type": "node", "count": 2, "tasks": [{{"name": "db",
            "resources": [
                {{"type": "scalar", "name": "cpus", "value": 1}},
                {{"type": "scalar", "name": "mem", "value": {mem}}},
                {{"type": "port", "name": "client", "port": 9042, "env_key": "PORT_CLIENT"}}
            ]}}]}}],
        "plans": [{{"name": "repair", "start_interrupted": true, "phases": [
            {{"name": "repair", "pod": "node"}}
        ]}}]
    }}"#
    )
}

fn open(dir: &TempDir, json: &str) -> Scheduler {
    let spec = ServiceSpec::from_json(json).unwrap();
    let store = StateStore::open(dir.path().join("state.db")).unwrap();
    Scheduler::new(spec, Evaluator::new("data", ROLE, "data-principal"), store).unwrap()
}

fn offer(node_id: NodeId, resources: Vec<OfferedResource>) -> Offer {
    Offer {
        id: OfferId::new(),
        node_id,
        hostname: "agent-1".into(),
        role: ROLE.into(),
        resources,
    }
}

fn unreserved() -> Vec<OfferedResource> {
    vec![
        OfferedResource::scalar("cpus", 4.0),
        OfferedResource::scalar("mem", 8192.0),
        OfferedResource::ranges("ports", vec![ValueRange::new(9000, 9100).unwrap()]),
    ]
}

fn reserved_by(messages: &[OutboundMessage]) -> Vec<OfferedResource> {
    messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::Accept { operations, .. } => Some(operations),
            _ => None,
        })
        .flatten()
        .filter_map(|op| match op {
            ResourceOperation::Reserve { resource } => Some(resource.clone()),
            _ => None,
        })
        .collect()
}

fn status(scheduler: &Scheduler, plan: &str, phase: &str, step: &str) -> StepStatus {
    let addr = scheduler.plans().find(plan, phase, step).unwrap();
    scheduler.plans().step(addr).status()
}

fn run(scheduler: &mut Scheduler, pod: &PodInstanceName) {
    for task in scheduler.store().tasks_for(pod).unwrap() {
        scheduler
            .handle_status(&TaskStatusUpdate::new(task.task_id, TaskState::Running))
            .unwrap();
    }
}

#[test]
fn test_restart_restores_reservations_and_steps() {
    let dir = tempfile::tempdir().unwrap();
    let node = NodeId::new();
    let first = PodInstanceName::new("node", 0).unwrap();

    let reserved = {
        let mut scheduler = open(&dir, &spec_json(1024));
        let (messages, _) = scheduler.process_offers(vec![offer(node, unreserved())]).unwrap();
        run(&mut scheduler, &first);
        assert_eq!(status(&scheduler, "deploy", "node", "node-0"), StepStatus::Complete);
        reserved_by(&messages)
    };
    assert_eq!(reserved.len(), 3);

    let mut scheduler = open(&dir, &spec_json(1024));
    assert_eq!(status(&scheduler, "deploy", "node", "node-0"), StepStatus::Complete);
    assert_eq!(status(&scheduler, "deploy", "node", "node-1"), StepStatus::Pending);
    assert_eq!(scheduler.store().reservations_for(&first).unwrap().len(), 3);
    assert!(scheduler.plan("repair").unwrap().is_interrupted());

    // The restored reservations are still ours: re-offering them to the
    // next step does not trigger a release.
    let (messages, stats) = scheduler.process_offers(vec![offer(node, reserved)]).unwrap();
    assert_eq!(stats.cleaned, 0);
    assert_eq!(stats.launched, 0);
    assert!(matches!(messages.as_slice(), [OutboundMessage::Decline { .. }]));
}

#[test]
fn test_restart_resets_steps_whose_pod_changed() {
    let dir = tempfile::tempdir().unwrap();
    let node = NodeId::new();
    let first = PodInstanceName::new("node", 0).unwrap();

    let reserved = {
        let mut scheduler = open(&dir, &spec_json(1024));
        let (messages, _) = scheduler.process_offers(vec![offer(node, unreserved())]).unwrap();
        run(&mut scheduler, &first);
        reserved_by(&messages)
    };

    // Memory grows: the step restarts and re-acquires only the memory.
    let mut scheduler = open(&dir, &spec_json(2048));
    assert_eq!(status(&scheduler, "deploy", "node", "node-0"), StepStatus::Pending);

    // The running task is stopped first; its resources are not offered
    // until it has.
    let task = scheduler.store().tasks_for(&first).unwrap().remove(0);
    let (messages, stats) = scheduler.process_offers(vec![offer(node, unreserved())]).unwrap();
    assert_eq!(stats.killed, 1);
    assert_eq!(stats.launched, 0);
    assert!(matches!(
        messages.as_slice(),
        [OutboundMessage::Kill { task_ids }, OutboundMessage::Decline { .. }] if task_ids == &vec![task.task_id]
    ));
    scheduler
        .handle_status(&TaskStatusUpdate::new(task.task_id, TaskState::Killed))
        .unwrap();
    assert_eq!(status(&scheduler, "deploy", "node", "node-0"), StepStatus::Pending);

    let mut resources = reserved;
    resources.extend(unreserved());
    let (messages, _) = scheduler.process_offers(vec![offer(node, resources)]).unwrap();
    let OutboundMessage::Accept { operations, .. } = &messages[0] else {
        panic!("expected accept, got {:?}", messages[0]);
    };
    let kinds: Vec<_> = operations.iter().map(ResourceOperation::kind).collect();
    assert_eq!(
        kinds,
        vec![OperationKind::Unreserve, OperationKind::Reserve, OperationKind::Launch]
    );
    assert_eq!(operations[0].resource().unwrap().name, "mem");

    // The old memory label is queued and already requested.
    let pending = scheduler.store().pending_releases().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].requested);
}

#[test]
fn test_restart_keeps_operator_decisions() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut scheduler = open(&dir, &spec_json(1024));
        scheduler
            .handle_command(Command::Proceed {
                plan: "repair".into(),
            })
            .unwrap();
        scheduler
            .handle_command(Command::Interrupt {
                plan: "deploy".into(),
            })
            .unwrap();
    }

    let scheduler = open(&dir, &spec_json(1024));
    assert!(!scheduler.plan("repair").unwrap().is_interrupted());
    assert!(scheduler.plan("deploy").unwrap().is_interrupted());
}

#[test]
fn test_restart_during_uninstall() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut scheduler = open(&dir, &spec_json(1024));
        scheduler
            .process_offers(vec![offer(NodeId::new(), unreserved())])
            .unwrap();
        scheduler.handle_command(Command::Uninstall).unwrap();
    }

    let scheduler = open(&dir, &spec_json(1024));
    assert!(scheduler.plans().plans().iter().all(|p| p.is_interrupted()));
    assert_eq!(scheduler.store().pending_releases().unwrap().len(), 3);
    assert!(!scheduler.is_uninstalled().unwrap());
}
