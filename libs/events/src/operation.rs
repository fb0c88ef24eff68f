//! Operations sent back to the resource manager for an accepted offer.

use std::collections::BTreeMap;

use keel_id::{PodInstanceName, TaskId};
use serde::{Deserialize, Serialize};

use crate::OfferedResource;

/// The kind of a [`ResourceOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Unreserve,
    Destroy,
    Reserve,
    Create,
    Launch,
}

/// An operation applied to the resources of one offer.
///
/// Operations in a batch are applied in order; a later operation sees the
/// resources as transformed by earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceOperation {
    /// Dynamically reserve an unreserved resource, attaching a label.
    Reserve { resource: OfferedResource },

    /// Release a dynamic reservation.
    Unreserve { resource: OfferedResource },

    /// Create a persistent volume on a reserved disk.
    Create { volume: OfferedResource },

    /// Destroy a persistent volume, keeping the disk reserved.
    Destroy { volume: OfferedResource },

    /// Launch every task of one pod instance.
    Launch {
        pod_instance: PodInstanceName,
        tasks: Vec<TaskLaunch>,
    },
}

impl ResourceOperation {
    /// The kind of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            ResourceOperation::Reserve { .. } => OperationKind::Reserve,
            ResourceOperation::Unreserve { .. } => OperationKind::Unreserve,
            ResourceOperation::Create { .. } => OperationKind::Create,
            ResourceOperation::Destroy { .. } => OperationKind::Destroy,
            ResourceOperation::Launch { .. } => OperationKind::Launch,
        }
    }

    /// The resource an operation applies to, for non-launch operations.
    pub fn resource(&self) -> Option<&OfferedResource> {
        match self {
            ResourceOperation::Reserve { resource } | ResourceOperation::Unreserve { resource } => {
                Some(resource)
            }
            ResourceOperation::Create { volume } | ResourceOperation::Destroy { volume } => {
                Some(volume)
            }
            ResourceOperation::Launch { .. } => None,
        }
    }
}

/// A volume provisioned by an external storage driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalVolumeMount {
    /// Storage driver that provisions the volume.
    pub driver: String,

    /// Provider-specific volume name, unique per pod instance.
    pub name: String,

    /// Mount point inside the task sandbox.
    pub container_path: String,

    /// Driver options passed through to the provider.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Runtime definition of one task inside a launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLaunch {
    pub task_id: TaskId,
    pub task_name: String,

    /// Resources the task runs with, as they look after reservation.
    pub resources: Vec<OfferedResource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_volumes: Vec<ExternalVolumeMount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_json_tag() {
        let op = ResourceOperation::Reserve {
            resource: OfferedResource::scalar("cpus", 1.0),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "RESERVE");
        assert_eq!(op.kind(), OperationKind::Reserve);
        assert_eq!(op.resource().map(|r| r.name.as_str()), Some("cpus"));
    }

    #[test]
    fn test_launch_has_no_single_resource() {
        let op = ResourceOperation::Launch {
            pod_instance: PodInstanceName::new("hello", 0).unwrap(),
            tasks: vec![],
        };
        assert!(op.resource().is_none());
        assert_eq!(op.kind(), OperationKind::Launch);
    }
}
