//! Releases reserved resources the service no longer owns.
//!
//! A resource reserved under the service's role is released when its label
//! is not held by any live reservation record. Volumes are destroyed before
//! their disk is unreserved. A pending release is considered done once an
//! offer from its node no longer carries the label.

use std::collections::HashSet;

use keel_events::{Offer, OfferedResource, ResourceOperation};
use keel_id::ReservationId;

use crate::state::{PendingRelease, ReservationRecord};

/// What one offer needs released.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupPlan {
    /// DESTROY then UNRESERVE operations, in that order.
    pub operations: Vec<ResourceOperation>,

    /// Labels being unreserved by `operations`.
    pub released: Vec<ReservationId>,

    /// Pending releases that have taken effect on this node.
    pub confirmed: Vec<ReservationId>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.confirmed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ResourceCleaner {
    role: String,
}

impl ResourceCleaner {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }

    /// Plan the release of every resource in `offer` reserved by this role
    /// but not in `owned`.
    pub fn clean(
        &self,
        offer: &Offer,
        owned: &HashSet<ReservationId>,
        pending: &[PendingRelease],
    ) -> CleanupPlan {
        let mut destroys = Vec::new();
        let mut unreserves = Vec::new();
        let mut released = Vec::new();
        let mut present = HashSet::new();

        for resource in offer.reserved_for(&self.role) {
            let Some(label) = resource.label() else {
                continue;
            };
            present.insert(label);
            if owned.contains(&label) {
                continue;
            }
            push_release(resource, &mut destroys, &mut unreserves);
            released.push(label);
        }

        let confirmed = pending
            .iter()
            .filter(|p| p.node_id == offer.node_id && !present.contains(&p.label))
            .map(|p| p.label)
            .collect();

        destroys.extend(unreserves);
        CleanupPlan {
            operations: destroys,
            released,
            confirmed,
        }
    }

    /// Plan the release of `records` whose resources `offer` carries.
    ///
    /// Used when a pod is relaunched from scratch on an offer that still
    /// holds its old reservations.
    pub fn release(&self, offer: &Offer, records: &[ReservationRecord]) -> CleanupPlan {
        let wanted: HashSet<ReservationId> = records.iter().map(|r| r.label).collect();
        let mut destroys = Vec::new();
        let mut unreserves = Vec::new();
        let mut released = Vec::new();

        for resource in offer.reserved_for(&self.role) {
            let Some(label) = resource.label().filter(|label| wanted.contains(label)) else {
                continue;
            };
            push_release(resource, &mut destroys, &mut unreserves);
            released.push(label);
        }

        destroys.extend(unreserves);
        CleanupPlan {
            operations: destroys,
            released,
            confirmed: Vec::new(),
        }
    }
}

/// DESTROY a volume, then UNRESERVE its bare disk.
fn push_release(
    resource: &OfferedResource,
    destroys: &mut Vec<ResourceOperation>,
    unreserves: &mut Vec<ResourceOperation>,
) {
    let mut bare = resource.clone();
    if resource.persistence().is_some() {
        destroys.push(ResourceOperation::Destroy {
            volume: resource.clone(),
        });
        if let Some(disk) = bare.disk.as_mut() {
            disk.persistence = None;
            disk.container_path = None;
        }
    }
    unreserves.push(ResourceOperation::Unreserve { resource: bare });
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_events::{DiskInfo, DiskSource, OperationKind, Persistence, Reservation};
    use keel_id::{NodeId, OfferId, PersistenceId, PodInstanceName};

    const ROLE: &str = "hello-role";

    fn reserved(resource: OfferedResource, role: &str) -> (OfferedResource, ReservationId) {
        let label = ReservationId::new();
        let resource = resource.reserved(Reservation {
            role: role.into(),
            principal: "hello-principal".into(),
            label,
        });
        (resource, label)
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

    #[test]
    fn test_releases_only_orphans_of_our_role() {
        let (owned_cpu, owned_label) = reserved(OfferedResource::scalar("cpus", 1.0), ROLE);
        let (orphan_mem, orphan_label) = reserved(OfferedResource::scalar("mem", 256.0), ROLE);
        let (foreign, _) = reserved(OfferedResource::scalar("cpus", 1.0), "other-role");
        let offer = offer(
            NodeId::new(),
            vec![owned_cpu, orphan_mem, foreign, OfferedResource::scalar("cpus", 4.0)],
        );

        let owned: HashSet<_> = [owned_label].into_iter().collect();
        let plan = ResourceCleaner::new(ROLE).clean(&offer, &owned, &[]);
        assert_eq!(plan.released, vec![orphan_label]);
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].kind(), OperationKind::Unreserve);
    }

    #[test]
    fn test_volume_destroyed_before_unreserve() {
        let volume = OfferedResource::scalar("disk", 512.0).with_disk(DiskInfo {
            source: DiskSource::Root,
            persistence: Some(Persistence {
                id: PersistenceId::new(),
                principal: "hello-principal".into(),
            }),
            container_path: Some("data".into()),
        });
        let (volume, _) = reserved(volume, ROLE);
        let plan = ResourceCleaner::new(ROLE).clean(
            &offer(NodeId::new(), vec![volume]),
            &HashSet::new(),
            &[],
        );
        let kinds: Vec<_> = plan.operations.iter().map(ResourceOperation::kind).collect();
        assert_eq!(kinds, vec![OperationKind::Destroy, OperationKind::Unreserve]);
        assert!(plan.operations[1]
            .resource()
            .and_then(OfferedResource::persistence)
            .is_none());
    }

    #[test]
    fn test_release_only_named_records() {
        let node = NodeId::new();
        let (old_cpu, old_label) = reserved(OfferedResource::scalar("cpus", 1.0), ROLE);
        let (kept_mem, _) = reserved(OfferedResource::scalar("mem", 256.0), ROLE);
        let pod = PodInstanceName::new("hello", 0).unwrap();
        let record = |label, name: &str| ReservationRecord {
            pod_instance: pod.clone(),
            task_name: "server".into(),
            slot: name.into(),
            resource_name: name.into(),
            label,
            node_id: node,
            value: keel_events::ResourceValue::Scalar(1.0),
            persistence_id: None,
        };
        let gone = record(ReservationId::new(), "disk");

        let plan = ResourceCleaner::new(ROLE).release(
            &offer(node, vec![old_cpu, kept_mem, OfferedResource::scalar("cpus", 4.0)]),
            &[record(old_label, "cpus"), gone],
        );
        assert_eq!(plan.released, vec![old_label]);
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].resource().and_then(OfferedResource::label), Some(old_label));
    }

    #[test]
    fn test_pending_release_confirmed_by_absence() {
        let node = NodeId::new();
        let (still_there, there_label) = reserved(OfferedResource::scalar("cpus", 1.0), ROLE);
        let gone_label = ReservationId::new();
        let pending = |label, node_id| PendingRelease {
            label,
            node_id,
            pod_instance: PodInstanceName::new("hello", 0).unwrap(),
            requested: true,
        };
        let pending = vec![
            pending(there_label, node),
            pending(gone_label, node),
            pending(ReservationId::new(), NodeId::new()),
        ];

        let plan = ResourceCleaner::new(ROLE).clean(
            &offer(node, vec![still_there]),
            &HashSet::new(),
            &pending,
        );
        assert_eq!(plan.released, vec![there_label]);
        assert_eq!(plan.confirmed, vec![gone_label]);
        assert!(!plan.is_empty());
    }
}
