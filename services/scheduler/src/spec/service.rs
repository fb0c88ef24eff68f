use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use keel_events::UNRESERVED_ROLE;
use keel_id::PodInstanceName;
use keel_reconcile::{SpecHash, Strategy};
use serde::{Deserialize, Serialize};

use super::{ResourceRequirement, SpecError};

/// Name of the plan built from the pod list when the spec does not
/// declare one.
pub const DEPLOY_PLAN: &str = "deploy";

/// Name of the plan holding recover and replace steps.
pub const RECOVERY_PLAN: &str = "recovery";

/// Declarative description of a whole service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub pods: Vec<PodSpec>,

    /// Custom plans. A plan named `deploy` replaces the default one.
    #[serde(default)]
    pub plans: Vec<PlanSpec>,
}

/// A pod type and how many instances of it to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(rename = "type")]
    pub pod_type: String,

    pub count: u32,

    /// Role whose statically reserved resources this pod consumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_reserved_role: Option<String>,

    pub tasks: Vec<TaskSpec>,
}

/// When a task counts as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskGoal {
    /// Long-running; done once running (and ready, if checked).
    #[default]
    Running,
    /// Run to completion; done once finished.
    Finished,
}

impl TaskGoal {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskGoal::Running => "running",
            TaskGoal::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(TaskGoal::Running),
            "finished" => Some(TaskGoal::Finished),
            _ => None,
        }
    }
}

/// One task inside a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,

    #[serde(default)]
    pub goal: TaskGoal,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Whether a readiness signal is required before the task is done.
    #[serde(default)]
    pub readiness_check: bool,

    #[serde(default)]
    pub resources: Vec<ResourceRequirement>,
}

/// A custom plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,

    #[serde(default)]
    pub strategy: Strategy,

    /// Manual plans wait for an operator to proceed.
    #[serde(default)]
    pub start_interrupted: bool,

    pub phases: Vec<PhaseSpec>,
}

/// A phase deploying some or all instances of one pod type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,

    #[serde(default)]
    pub strategy: Strategy,

    /// Pod type the phase deploys.
    pub pod: String,

    /// Instance indices, in step order. Defaults to every instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<u32>>,
}

impl ServiceSpec {
    /// Parse and validate a spec from JSON.
    pub fn from_json(json: &str) -> Result<Self, SpecError> {
        let spec: ServiceSpec = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Read, parse and validate a spec file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SpecError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::invalid("service", "empty name"));
        }
        if self.pods.is_empty() {
            return Err(SpecError::invalid(&self.name, "no pods"));
        }

        let mut pod_types = HashSet::new();
        for pod in &self.pods {
            pod.validate()?;
            if !pod_types.insert(pod.pod_type.as_str()) {
                return Err(SpecError::Duplicate {
                    kind: "pod type",
                    name: pod.pod_type.clone(),
                });
            }
        }

        let mut plan_names = HashSet::new();
        for plan in &self.plans {
            if plan.name == RECOVERY_PLAN {
                return Err(SpecError::invalid(&plan.name, "plan name is reserved"));
            }
            if !plan_names.insert(plan.name.as_str()) {
                return Err(SpecError::Duplicate {
                    kind: "plan",
                    name: plan.name.clone(),
                });
            }
            self.validate_plan(plan)?;
        }
        Ok(())
    }

    fn validate_plan(&self, plan: &PlanSpec) -> Result<(), SpecError> {
        if plan.phases.is_empty() {
            return Err(SpecError::invalid(&plan.name, "no phases"));
        }
        let mut phase_names = HashSet::new();
        for phase in &plan.phases {
            if !phase_names.insert(phase.name.as_str()) {
                return Err(SpecError::Duplicate {
                    kind: "phase",
                    name: format!("{}/{}", plan.name, phase.name),
                });
            }
            let pod = self
                .pod(&phase.pod)
                .ok_or_else(|| SpecError::UnknownPod(phase.pod.clone()))?;
            if let Some(instances) = &phase.instances {
                let mut seen = HashSet::new();
                for index in instances {
                    if *index >= pod.count || !seen.insert(*index) {
                        return Err(SpecError::invalid(
                            format!("{}/{}", plan.name, phase.name),
                            format!("bad instance index {}", index),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn pod(&self, pod_type: &str) -> Option<&PodSpec> {
        self.pods.iter().find(|p| p.pod_type == pod_type)
    }

    /// Resolve a pod instance name against this spec.
    pub fn pod_instance(&self, name: &PodInstanceName) -> Result<PodInstance, SpecError> {
        let pod = self
            .pod(name.pod_type())
            .ok_or_else(|| SpecError::UnknownPod(name.pod_type().to_string()))?;
        if name.index() >= pod.count {
            return Err(SpecError::invalid(name, "index beyond pod count"));
        }
        Ok(PodInstance {
            name: name.clone(),
            spec: pod.clone(),
        })
    }

    /// The custom plan that replaces the default deploy plan, if any.
    pub fn deploy_plan(&self) -> Option<&PlanSpec> {
        self.plans.iter().find(|p| p.name == DEPLOY_PLAN)
    }
}

impl PodSpec {
    fn validate(&self) -> Result<(), SpecError> {
        PodInstanceName::new(self.pod_type.clone(), 0)?;
        if self.count == 0 {
            return Err(SpecError::invalid(&self.pod_type, "count must be at least 1"));
        }
        if self.tasks.is_empty() {
            return Err(SpecError::invalid(&self.pod_type, "no tasks"));
        }
        if matches!(&self.pre_reserved_role, Some(role) if role.is_empty()) {
            return Err(SpecError::invalid(&self.pod_type, "empty pre-reserved role"));
        }

        let mut task_names = HashSet::new();
        let mut fixed_ports = HashSet::new();
        for task in &self.tasks {
            let context = format!("{}/{}", self.pod_type, task.name);
            if task.name.is_empty() {
                return Err(SpecError::invalid(&self.pod_type, "empty task name"));
            }
            if !task_names.insert(task.name.as_str()) {
                return Err(SpecError::Duplicate {
                    kind: "task",
                    name: context,
                });
            }

            let mut slots = HashSet::new();
            for req in &task.resources {
                req.validate(&context)?;
                if !slots.insert(req.slot()) {
                    return Err(SpecError::Duplicate {
                        kind: "resource",
                        name: format!("{}/{}", context, req.slot()),
                    });
                }
                if let ResourceRequirement::Port(port) = req {
                    if !port.is_dynamic() && !fixed_ports.insert(port.port) {
                        return Err(SpecError::Duplicate {
                            kind: "port",
                            name: format!("{}/{}", self.pod_type, port.port),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Role the pod's fresh reservations draw from.
    pub fn role(&self) -> &str {
        self.pre_reserved_role.as_deref().unwrap_or(UNRESERVED_ROLE)
    }

    /// Hash of this pod's definition, for change detection.
    pub fn hash(&self) -> Result<SpecHash, SpecError> {
        Ok(SpecHash::from_json(&serde_json::to_value(self)?))
    }

    /// Names of every instance of this pod, in index order.
    pub fn instance_names(&self) -> Result<Vec<PodInstanceName>, SpecError> {
        (0..self.count)
            .map(|index| PodInstanceName::new(self.pod_type.clone(), index).map_err(SpecError::from))
            .collect()
    }
}

/// One numbered deployment of a pod type, with its requirements.
#[derive(Debug, Clone, PartialEq)]
pub struct PodInstance {
    pub name: PodInstanceName,
    pub spec: PodSpec,
}

impl PodInstance {
    pub fn tasks(&self) -> &[TaskSpec] {
        &self.spec.tasks
    }

    pub fn index(&self) -> u32 {
        self.name.index()
    }

    pub fn role(&self) -> &str {
        self.spec.role()
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.spec.tasks.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = r#"{
        "name": "hello-world",
        "pods": [
            {"type": "hello", "count": 2, "tasks": [
                {"name": "server", "command": "./server", "readiness_check": true, "resources": [
                    {"type": "scalar", "name": "cpus", "value": 1.0},
                    {"type": "scalar", "name": "mem", "value": 512},
                    {"type": "port", "name": "http", "port": 8080, "env_key": "PORT_HTTP"}
                ]}
            ]},
            {"type": "world", "count": 1, "tasks": [
                {"name": "init", "goal": "finished", "resources": [
                    {"type": "scalar", "name": "cpus", "value": 0.5}
                ]}
            ]}
        ],
        "plans": [
            {"name": "manual", "start_interrupted": true, "phases": [
                {"name": "hello-phase", "pod": "hello", "instances": [1, 0]}
            ]}
        ]
    }"#;

    #[test]
    fn test_load_and_resolve() {
        let spec = ServiceSpec::from_json(HELLO).unwrap();
        assert_eq!(spec.pods.len(), 2);
        assert_eq!(spec.pods[1].tasks[0].goal, TaskGoal::Finished);
        assert!(spec.plans[0].start_interrupted);
        assert!(spec.deploy_plan().is_none());

        let name = PodInstanceName::new("hello", 1).unwrap();
        let instance = spec.pod_instance(&name).unwrap();
        assert_eq!(instance.index(), 1);
        assert_eq!(instance.role(), "*");
        assert!(instance.task("server").is_some());

        let beyond = PodInstanceName::new("hello", 2).unwrap();
        assert!(spec.pod_instance(&beyond).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.json");
        std::fs::write(&path, HELLO).unwrap();
        assert_eq!(ServiceSpec::load(&path).unwrap().name, "hello-world");
        assert!(matches!(
            ServiceSpec::load(dir.path().join("missing.json")),
            Err(SpecError::Io(_))
        ));
    }

    #[test]
    fn test_hash_tracks_changes() {
        let spec = ServiceSpec::from_json(HELLO).unwrap();
        let mut changed = spec.pods[0].clone();
        assert_eq!(changed.hash().unwrap(), spec.pods[0].hash().unwrap());
        changed.tasks[0].command = Some("./server --v2".into());
        assert_ne!(changed.hash().unwrap(), spec.pods[0].hash().unwrap());
    }

    #[test]
    fn test_duplicate_fixed_port_across_tasks() {
        let json = r#"{"name": "svc", "pods": [{"type": "p", "count": 1, "tasks": [
            {"name": "a", "resources": [{"type": "port", "name": "x", "port": 9000}]},
            {"name": "b", "resources": [{"type": "port", "name": "y", "port": 9000}]}
        ]}]}"#;
        assert!(matches!(
            ServiceSpec::from_json(json),
            Err(SpecError::Duplicate { kind: "port", .. })
        ));
    }

    #[test]
    fn test_plan_validation() {
        let unknown_pod = r#"{"name": "svc", "pods": [{"type": "p", "count": 1, "tasks": [{"name": "a"}]}],
            "plans": [{"name": "x", "phases": [{"name": "ph", "pod": "q"}]}]}"#;
        assert!(matches!(
            ServiceSpec::from_json(unknown_pod),
            Err(SpecError::UnknownPod(_))
        ));

        let reserved = r#"{"name": "svc", "pods": [{"type": "p", "count": 1, "tasks": [{"name": "a"}]}],
            "plans": [{"name": "recovery", "phases": [{"name": "ph", "pod": "p"}]}]}"#;
        assert!(ServiceSpec::from_json(reserved).is_err());

        let bad_index = r#"{"name": "svc", "pods": [{"type": "p", "count": 1, "tasks": [{"name": "a"}]}],
            "plans": [{"name": "x", "phases": [{"name": "ph", "pod": "p", "instances": [3]}]}]}"#;
        assert!(ServiceSpec::from_json(bad_index).is_err());
    }

    #[test]
    fn test_invalid_pod_type() {
        let json = r#"{"name": "svc", "pods": [{"type": "bad type", "count": 1, "tasks": [{"name": "a"}]}]}"#;
        assert!(matches!(ServiceSpec::from_json(json), Err(SpecError::Name(_))));
    }
}
