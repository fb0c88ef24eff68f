//! Offer evaluation engine.
//!
//! Decides whether one offer can host one pod instance, and which
//! operations to send if it can. Evaluation is pure: it reads the offer,
//! the pod's requirements and the reservations already recorded for the
//! pod, and performs no I/O.
//!
//! ## Algorithm
//!
//! Tasks are walked in declared order, and each task's requirements in
//! declared order. For every requirement:
//!
//! 1. **Reuse**: if a reservation is recorded for the slot, the offer must
//!    carry the labeled resource. If it does and still fits, it is claimed
//!    with no new RESERVE. If it no longer fits and holds no data, it is
//!    unreserved and the requirement falls through to a fresh claim.
//! 2. **Fresh**: claim from unreserved resources of the pod's role. Scalars
//!    accumulate across resources; fixed ports must be free; dynamic ports
//!    take the first free port in offer order; external volumes are built
//!    by the driver's provider.
//!
//! Every unmet requirement is reported. Operations are only emitted when
//! all requirements are met, in the order UNRESERVE, RESERVE, CREATE,
//! provider operations, LAUNCH.

mod ids;
mod pool;

use std::collections::{BTreeMap, BTreeSet};

use keel_events::{
    round_scalar, DiskInfo, DiskSource, ExternalVolumeMount, Offer, OfferedResource, Persistence,
    Reservation, ResourceOperation, ResourceValue, TaskLaunch, ValueRange,
};
use keel_id::{NodeId, OfferId, PodInstanceName};
use thiserror::Error;

use crate::config::Capabilities;
use crate::spec::{
    PodInstance, ResourceRequirement, TaskSpec, VolumeRequirement, VolumeSource, DISK_RESOURCE,
    GPU_RESOURCE, PORTS_RESOURCE,
};
use crate::state::{ReservationRecord, TaskRecord};
use crate::volume::{ExternalVolume, VolumeProviderContext, VolumeProviderError, VolumeProviderRegistry};

use pool::ResourcePool;

/// Configuration errors. Retrying with another offer cannot help.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("task {task}: {source}")]
    Volume {
        task: String,
        source: VolumeProviderError,
    },

    #[error("{context}: {requirement} needs the {capability} capability")]
    CapabilityDisabled {
        context: String,
        requirement: String,
        capability: &'static str,
    },
}

/// A requirement the offer could not meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmetRequirement {
    pub task: String,
    pub slot: String,
    pub reason: String,
}

impl std::fmt::Display for UnmetRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}: {}", self.task, self.slot, self.reason)
    }
}

/// Result of evaluating one offer against one pod instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub offer_id: OfferId,
    pub node_id: NodeId,
    pub pod_instance: PodInstanceName,

    /// Operations to send, empty unless the evaluation passed.
    pub operations: Vec<ResourceOperation>,

    pub unmet: Vec<UnmetRequirement>,

    /// The pod's full reservation set if the operations are applied.
    pub reservations: Vec<ReservationRecord>,

    /// Records whose resources the operations unreserve.
    pub superseded: Vec<ReservationRecord>,

    /// Tasks the LAUNCH starts.
    pub tasks: Vec<TaskRecord>,
}

impl EvaluationOutcome {
    pub fn passed(&self) -> bool {
        self.unmet.is_empty()
    }
}

/// What one requirement claimed.
#[derive(Debug, Default)]
struct Claim {
    unreserve: Option<OfferedResource>,
    superseded: Option<ReservationRecord>,
    reserve: Option<OfferedResource>,
    create: Option<OfferedResource>,
    launch: Option<OfferedResource>,
    record: Option<ReservationRecord>,
    port: Option<u64>,
    external: Option<ExternalVolume>,
}

/// Requirement being evaluated, with what it needs to know about the pod.
struct Slot<'a> {
    offer: &'a Offer,
    pod: &'a PodInstance,
    task: &'a TaskSpec,
    requirement: &'a ResourceRequirement,
    slot: String,
}

impl Slot<'_> {
    fn label(&self) -> keel_id::ReservationId {
        ids::reservation_label(&self.offer.id, &self.pod.name, &self.task.name, &self.slot)
    }

    fn record(&self, resource: &OfferedResource) -> Option<ReservationRecord> {
        let label = resource.label()?;
        Some(ReservationRecord {
            pod_instance: self.pod.name.clone(),
            task_name: self.task.name.clone(),
            slot: self.slot.clone(),
            resource_name: resource.name.clone(),
            label,
            node_id: self.offer.node_id,
            value: resource.value.clone(),
            persistence_id: resource.persistence().map(|p| p.id),
        })
    }
}

/// Evaluates offers for one service.
#[derive(Debug, Clone)]
pub struct Evaluator {
    service_name: String,
    role: String,
    principal: String,
    capabilities: Capabilities,
    providers: VolumeProviderRegistry,
}

impl Evaluator {
    /// An evaluator with default capabilities and the built-in drivers.
    pub fn new(
        service_name: impl Into<String>,
        role: impl Into<String>,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            role: role.into(),
            principal: principal.into(),
            capabilities: Capabilities::default(),
            providers: VolumeProviderRegistry::with_defaults(),
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_providers(mut self, providers: VolumeProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Returns true if `offer` could carry resources usable by `pod`.
    pub fn accepts_role(&self, offer: &Offer, pod: &PodInstance) -> bool {
        (offer.role == self.role || offer.role == pod.role())
            && (offer.has_role(pod.role()) || offer.reserved_for(&self.role).next().is_some())
    }

    /// Evaluate `offer` for `pod`, given the reservations already recorded
    /// for it.
    pub fn evaluate(
        &self,
        offer: &Offer,
        pod: &PodInstance,
        existing: &[ReservationRecord],
    ) -> Result<EvaluationOutcome, EvaluationError> {
        let externals = self.check_config(pod)?;

        let avoid: BTreeSet<u64> = pod
            .tasks()
            .iter()
            .flat_map(|t| &t.resources)
            .filter_map(|r| match r {
                ResourceRequirement::Port(p) if !p.is_dynamic() => Some(p.port),
                _ => None,
            })
            .collect();

        let mut pool = ResourcePool::new(offer, &self.role);
        let mut outcome = EvaluationOutcome {
            offer_id: offer.id,
            node_id: offer.node_id,
            pod_instance: pod.name.clone(),
            operations: Vec::new(),
            unmet: Vec::new(),
            reservations: Vec::new(),
            superseded: Vec::new(),
            tasks: Vec::new(),
        };
        let (mut unreserves, mut reserves, mut creates, mut provider_ops) =
            (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        let mut launches = Vec::new();

        for task in pod.tasks() {
            let mut resources = Vec::new();
            let mut mounts: Vec<ExternalVolumeMount> = Vec::new();
            let mut env = task.env.clone();

            for requirement in &task.resources {
                let slot = Slot {
                    offer,
                    pod,
                    task,
                    requirement,
                    slot: requirement.slot(),
                };
                let record = existing
                    .iter()
                    .find(|r| r.task_name == task.name && r.slot == slot.slot);

                let claim = match record {
                    Some(record) => self.reuse(&slot, record, &mut pool, &avoid),
                    None => match externals.get(&(task.name.clone(), slot.slot.clone())) {
                        Some(external) => Ok(Claim {
                            external: Some(external.clone()),
                            ..Claim::default()
                        }),
                        None => self.fresh(&slot, &mut pool, &avoid),
                    },
                };

                let claim = match claim {
                    Ok(claim) => claim,
                    Err(reason) => {
                        outcome.unmet.push(UnmetRequirement {
                            task: task.name.clone(),
                            slot: slot.slot,
                            reason,
                        });
                        continue;
                    }
                };

                if let (ResourceRequirement::Port(port), Some(allocated)) = (requirement, claim.port) {
                    if let Some(key) = &port.env_key {
                        env.insert(key.clone(), allocated.to_string());
                    }
                }
                unreserves.extend(claim.unreserve.map(|resource| ResourceOperation::Unreserve { resource }));
                reserves.extend(claim.reserve.map(|resource| ResourceOperation::Reserve { resource }));
                creates.extend(claim.create.map(|volume| ResourceOperation::Create { volume }));
                resources.extend(claim.launch);
                outcome.reservations.extend(claim.record);
                outcome.superseded.extend(claim.superseded);
                if let Some(external) = claim.external {
                    provider_ops.extend(external.operations);
                    env.extend(external.env);
                    mounts.push(external.mount);
                }
            }

            env.insert("FRAMEWORK_NAME".into(), self.service_name.clone());
            env.insert("POD_INSTANCE_INDEX".into(), pod.index().to_string());
            env.insert("TASK_NAME".into(), format!("{}-{}", pod.name, task.name));

            let task_id = ids::task_id(&offer.id, &pod.name, &task.name);
            launches.push(TaskLaunch {
                task_id,
                task_name: task.name.clone(),
                resources,
                command: task.command.clone(),
                env,
                external_volumes: mounts,
            });
            outcome.tasks.push(TaskRecord {
                task_id,
                pod_instance: pod.name.clone(),
                task_name: task.name.clone(),
                node_id: offer.node_id,
                offer_id: offer.id,
                goal: task.goal,
                readiness_check: task.readiness_check,
                state: None,
                ready: false,
                kill_requested: false,
            });
        }

        if !outcome.passed() {
            outcome.reservations.clear();
            outcome.superseded.clear();
            outcome.tasks.clear();
            return Ok(outcome);
        }

        outcome.operations = unreserves
            .into_iter()
            .chain(reserves)
            .chain(creates)
            .chain(provider_ops)
            .chain(std::iter::once(ResourceOperation::Launch {
                pod_instance: pod.name.clone(),
                tasks: launches,
            }))
            .collect();
        Ok(outcome)
    }

    /// Reject requirements that no offer can ever satisfy, and build every
    /// external volume up front.
    fn check_config(
        &self,
        pod: &PodInstance,
    ) -> Result<BTreeMap<(String, String), ExternalVolume>, EvaluationError> {
        if pod.role() != keel_events::UNRESERVED_ROLE && !self.capabilities.pre_reserved_resources {
            return Err(EvaluationError::CapabilityDisabled {
                context: format!("pod {}", pod.name),
                requirement: format!("pre-reserved role {}", pod.role()),
                capability: "pre-reserved-resources",
            });
        }

        let mut externals = BTreeMap::new();
        for task in pod.tasks() {
            for requirement in &task.resources {
                match requirement {
                    ResourceRequirement::Scalar { name, .. }
                        if name == GPU_RESOURCE && !self.capabilities.gpu_resources =>
                    {
                        return Err(EvaluationError::CapabilityDisabled {
                            context: format!("task {}", task.name),
                            requirement: requirement.slot(),
                            capability: "gpu-resources",
                        });
                    }
                    ResourceRequirement::Volume(volume) if volume.is_external() => {
                        if !self.capabilities.external_volumes {
                            return Err(EvaluationError::CapabilityDisabled {
                                context: format!("task {}", task.name),
                                requirement: requirement.slot(),
                                capability: "external-volumes",
                            });
                        }
                        let built = self.build_external(pod, volume).map_err(|source| {
                            EvaluationError::Volume {
                                task: task.name.clone(),
                                source,
                            }
                        })?;
                        externals.insert((task.name.clone(), requirement.slot()), built);
                    }
                    _ => {}
                }
            }
        }
        Ok(externals)
    }

    fn build_external(
        &self,
        pod: &PodInstance,
        volume: &VolumeRequirement,
    ) -> Result<ExternalVolume, VolumeProviderError> {
        let VolumeSource::External {
            driver,
            volume_name,
            options,
        } = &volume.source
        else {
            return Err(VolumeProviderError::NotExternal(volume.container_path.clone()));
        };
        let provider = self.providers.create(VolumeProviderContext {
            service_name: self.service_name.clone(),
            volume_name: volume_name.clone(),
            driver_name: driver.clone(),
            pod_index: pod.index(),
            driver_options: options.clone(),
        })?;
        provider.build(volume)
    }

    fn reservation(&self, label: keel_id::ReservationId) -> Reservation {
        Reservation {
            role: self.role.clone(),
            principal: self.principal.clone(),
            label,
        }
    }

    /// Claim the resource recorded for the slot, re-acquiring it when it no
    /// longer fits and holds no data.
    fn reuse(
        &self,
        slot: &Slot<'_>,
        record: &ReservationRecord,
        pool: &mut ResourcePool,
        avoid: &BTreeSet<u64>,
    ) -> Result<Claim, String> {
        let Some(resource) = pool.take_reserved(record.label) else {
            return Err(format!(
                "reserved resource {} ({}) not present in offer",
                record.label, record.resource_name
            ));
        };

        if reused_fits(slot.requirement, &resource) {
            return Ok(self.claim_reserved(slot, record, resource));
        }
        if !slot.requirement.is_reacquirable() {
            return Err(format!(
                "reserved volume {} is smaller than required",
                record.label
            ));
        }

        pool.release(resource.clone());
        let mut claim = self.fresh(slot, pool, avoid)?;
        claim.unreserve = Some(resource);
        claim.superseded = Some(record.clone());
        Ok(claim)
    }

    fn claim_reserved(
        &self,
        slot: &Slot<'_>,
        record: &ReservationRecord,
        resource: OfferedResource,
    ) -> Claim {
        let mut claim = Claim::default();
        match slot.requirement {
            ResourceRequirement::Volume(volume) if resource.persistence().is_none() => {
                // Reserved but never created.
                let id = record.persistence_id.unwrap_or_else(|| {
                    ids::persistence_id(&slot.offer.id, &slot.pod.name, &slot.task.name, &slot.slot)
                });
                let created = self.with_volume(resource, id, volume);
                claim.create = Some(created.clone());
                claim.launch = Some(created);
            }
            ResourceRequirement::Volume(volume) => {
                let mut mounted = resource;
                if let Some(disk) = mounted.disk.as_mut() {
                    disk.container_path = Some(volume.container_path.clone());
                }
                claim.launch = Some(mounted);
            }
            ResourceRequirement::Port(port) => {
                claim.port = match &resource.value {
                    ResourceValue::Ranges(ranges) if port.is_dynamic() => {
                        ranges.first().map(|r| r.begin)
                    }
                    _ => Some(port.port),
                };
                claim.launch = Some(resource);
            }
            _ => claim.launch = Some(resource),
        }
        claim.record = claim.launch.as_ref().and_then(|r| slot.record(r));
        claim
    }

    /// Claim the requirement from unreserved resources.
    fn fresh(
        &self,
        slot: &Slot<'_>,
        pool: &mut ResourcePool,
        avoid: &BTreeSet<u64>,
    ) -> Result<Claim, String> {
        let role = slot.pod.role();
        let reservation = self.reservation(slot.label());

        let reserved = match slot.requirement {
            ResourceRequirement::Scalar { name, value } => {
                pool.take_scalar(name, role, *value).map_err(|available| {
                    format!(
                        "insufficient {}: requested {}, available {}",
                        name, value, available
                    )
                })?;
                OfferedResource::scalar(name.clone(), round_scalar(*value))
            }
            ResourceRequirement::Ranges { name, ranges } => {
                if !pool.take_ranges(name, role, ranges) {
                    return Err(format!(
                        "{} {} unavailable",
                        name,
                        ResourceValue::Ranges(ranges.clone())
                    ));
                }
                OfferedResource::ranges(name.clone(), ranges.clone())
            }
            ResourceRequirement::Set { name, items } => {
                if !pool.take_set(name, role, items) {
                    return Err(format!(
                        "{} {} unavailable",
                        name,
                        ResourceValue::Set(items.clone())
                    ));
                }
                OfferedResource::set(name.clone(), items.iter().cloned())
            }
            ResourceRequirement::Port(port) => {
                let allocated = if port.is_dynamic() {
                    pool.take_dynamic_port(role, avoid)
                        .ok_or_else(|| "no ports available".to_string())?
                } else if pool.take_ranges(PORTS_RESOURCE, role, &[ValueRange::single(port.port)]) {
                    port.port
                } else {
                    return Err(format!("port {} unavailable", port.port));
                };
                let resource = OfferedResource::ranges(PORTS_RESOURCE, vec![ValueRange::single(allocated)])
                    .with_role(role)
                    .reserved(reservation);
                return Ok(Claim {
                    reserve: Some(resource.clone()),
                    record: slot.record(&resource),
                    launch: Some(resource),
                    port: Some(allocated),
                    ..Claim::default()
                });
            }
            ResourceRequirement::Volume(volume) => {
                let disk = match volume.source {
                    VolumeSource::Root => {
                        pool.take_scalar(DISK_RESOURCE, role, volume.size_mb)
                            .map_err(|available| {
                                format!(
                                    "insufficient disk for volume {}: requested {}, available {}",
                                    volume.container_path, volume.size_mb, available
                                )
                            })?;
                        OfferedResource::scalar(DISK_RESOURCE, round_scalar(volume.size_mb)).with_disk(
                            DiskInfo {
                                source: DiskSource::Root,
                                persistence: None,
                                container_path: None,
                            },
                        )
                    }
                    VolumeSource::Mount => pool.take_mount_disk(role, volume.size_mb).ok_or_else(|| {
                        format!(
                            "no mount disk of at least {} MB for volume {}",
                            volume.size_mb, volume.container_path
                        )
                    })?,
                    VolumeSource::External { .. } => {
                        return Err(format!("external volume {} was not built", volume.container_path));
                    }
                };
                let reserved = disk.with_role(role).reserved(reservation);
                let id = ids::persistence_id(&slot.offer.id, &slot.pod.name, &slot.task.name, &slot.slot);
                let created = self.with_volume(reserved.clone(), id, volume);
                return Ok(Claim {
                    reserve: Some(reserved),
                    create: Some(created.clone()),
                    record: slot.record(&created),
                    launch: Some(created),
                    ..Claim::default()
                });
            }
        };

        let resource = reserved.with_role(role).reserved(reservation);
        Ok(Claim {
            reserve: Some(resource.clone()),
            record: slot.record(&resource),
            launch: Some(resource),
            ..Claim::default()
        })
    }

    fn with_volume(
        &self,
        mut resource: OfferedResource,
        id: keel_id::PersistenceId,
        volume: &VolumeRequirement,
    ) -> OfferedResource {
        let disk = resource.disk.get_or_insert(DiskInfo {
            source: DiskSource::Root,
            persistence: None,
            container_path: None,
        });
        disk.persistence = Some(Persistence {
            id,
            principal: self.principal.clone(),
        });
        disk.container_path = Some(volume.container_path.clone());
        resource
    }
}

/// Whether a reserved resource still satisfies its requirement.
fn reused_fits(requirement: &ResourceRequirement, resource: &OfferedResource) -> bool {
    match (requirement, &resource.value) {
        (ResourceRequirement::Port(port), ResourceValue::Ranges(ranges)) if port.is_dynamic() => {
            !ranges.is_empty()
        }
        _ => requirement
            .required_value()
            .is_some_and(|required| resource.value.satisfies(&required)),
    }
}
