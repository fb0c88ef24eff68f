use std::collections::{BTreeMap, BTreeSet};

use keel_events::{ResourceValue, ValueRange};
use serde::{Deserialize, Serialize};

use super::SpecError;

/// Resource name carrying port ranges.
pub const PORTS_RESOURCE: &str = "ports";

/// Resource name carrying disk.
pub const DISK_RESOURCE: &str = "disk";

/// Resource name carrying GPUs; gated by a capability.
pub const GPU_RESOURCE: &str = "gpus";

/// One thing a task needs from an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceRequirement {
    /// A divisible quantity, such as `cpus` or `mem`.
    Scalar { name: String, value: f64 },

    /// Explicit sub-ranges of a ranges resource.
    Ranges {
        name: String,
        ranges: Vec<ValueRange>,
    },

    /// Members of a set resource.
    Set {
        name: String,
        items: BTreeSet<String>,
    },

    /// A single port, fixed or dynamic.
    Port(PortRequirement),

    /// A volume mounted into the task sandbox.
    Volume(VolumeRequirement),
}

/// A port the task listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequirement {
    pub name: String,

    /// Fixed port number; `0` asks for any free port.
    #[serde(default)]
    pub port: u64,

    /// Environment variable that receives the allocated port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_key: Option<String>,
}

impl PortRequirement {
    pub fn is_dynamic(&self) -> bool {
        self.port == 0
    }
}

/// A volume mounted at `container_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRequirement {
    pub container_path: String,

    /// Size in megabytes. Required for root and mount volumes.
    #[serde(default)]
    pub size_mb: f64,

    pub source: VolumeSource,
}

/// Where a volume's storage comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeSource {
    /// Persistent volume carved out of the node's root disk.
    Root,

    /// Persistent volume on a whole mounted disk.
    Mount,

    /// Storage provisioned by an external volume driver.
    External {
        driver: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume_name: Option<String>,

        #[serde(default)]
        options: BTreeMap<String, String>,
    },
}

impl VolumeRequirement {
    pub fn is_external(&self) -> bool {
        matches!(self.source, VolumeSource::External { .. })
    }
}

impl ResourceRequirement {
    /// Key identifying this requirement's reservation within its task.
    ///
    /// Scalars, ranges and sets are keyed by resource name; ports and volumes
    /// by what distinguishes them, since a task may hold several of each.
    pub fn slot(&self) -> String {
        match self {
            ResourceRequirement::Scalar { name, .. }
            | ResourceRequirement::Ranges { name, .. }
            | ResourceRequirement::Set { name, .. } => name.clone(),
            ResourceRequirement::Port(port) => format!("{}:{}", PORTS_RESOURCE, port.name),
            ResourceRequirement::Volume(volume) => format!("volume:{}", volume.container_path),
        }
    }

    /// Name of the offered resource that satisfies this requirement.
    pub fn resource_name(&self) -> &str {
        match self {
            ResourceRequirement::Scalar { name, .. }
            | ResourceRequirement::Ranges { name, .. }
            | ResourceRequirement::Set { name, .. } => name,
            ResourceRequirement::Port(_) => PORTS_RESOURCE,
            ResourceRequirement::Volume(_) => DISK_RESOURCE,
        }
    }

    /// The value an offered resource must satisfy, when one is fixed.
    ///
    /// Dynamic ports and external volumes have no fixed value.
    pub fn required_value(&self) -> Option<ResourceValue> {
        match self {
            ResourceRequirement::Scalar { value, .. } => Some(ResourceValue::Scalar(*value)),
            ResourceRequirement::Ranges { ranges, .. } => Some(ResourceValue::Ranges(ranges.clone())),
            ResourceRequirement::Set { items, .. } => Some(ResourceValue::Set(items.clone())),
            ResourceRequirement::Port(port) if port.is_dynamic() => None,
            ResourceRequirement::Port(port) => {
                Some(ResourceValue::Ranges(vec![ValueRange::single(port.port)]))
            }
            ResourceRequirement::Volume(volume) if volume.is_external() => None,
            ResourceRequirement::Volume(volume) => Some(ResourceValue::Scalar(volume.size_mb)),
        }
    }

    /// Returns true for requirements that may be released and re-acquired
    /// when their reserved resource no longer fits. Volumes hold data and
    /// never are.
    pub fn is_reacquirable(&self) -> bool {
        !matches!(self, ResourceRequirement::Volume(_))
    }

    pub(crate) fn validate(&self, context: &str) -> Result<(), SpecError> {
        let context = format!("{}/{}", context, self.slot());
        match self {
            ResourceRequirement::Scalar { name, value } => {
                check_name(&context, name)?;
                if !value.is_finite() || *value <= 0.0 {
                    return Err(SpecError::invalid(context, "scalar must be positive"));
                }
            }
            ResourceRequirement::Ranges { name, ranges } => {
                check_name(&context, name)?;
                if ranges.is_empty() {
                    return Err(SpecError::invalid(context, "no ranges"));
                }
                for r in ranges {
                    ValueRange::new(r.begin, r.end)
                        .map_err(|e| SpecError::invalid(&context, e.to_string()))?;
                }
            }
            ResourceRequirement::Set { name, items } => {
                check_name(&context, name)?;
                if items.is_empty() {
                    return Err(SpecError::invalid(context, "empty set"));
                }
            }
            ResourceRequirement::Port(port) => {
                check_name(&context, &port.name)?;
                if port.port > u64::from(u16::MAX) {
                    return Err(SpecError::invalid(context, "port out of range"));
                }
                if let Some(key) = &port.env_key {
                    let valid = !key.is_empty()
                        && !key.starts_with(|c: char| c.is_ascii_digit())
                        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                    if !valid {
                        return Err(SpecError::invalid(context, format!("bad env key {:?}", key)));
                    }
                }
            }
            ResourceRequirement::Volume(volume) => {
                if volume.container_path.is_empty() || volume.container_path.starts_with('/') {
                    return Err(SpecError::invalid(
                        context,
                        "container path must be relative and non-empty",
                    ));
                }
                match &volume.source {
                    VolumeSource::Root | VolumeSource::Mount => {
                        if !volume.size_mb.is_finite() || volume.size_mb <= 0.0 {
                            return Err(SpecError::invalid(context, "volume size must be positive"));
                        }
                    }
                    VolumeSource::External { driver, .. } => {
                        if driver.is_empty() {
                            return Err(SpecError::invalid(context, "empty driver name"));
                        }
                        if !volume.size_mb.is_finite() || volume.size_mb < 0.0 {
                            return Err(SpecError::invalid(context, "volume size must not be negative"));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_name(context: &str, name: &str) -> Result<(), SpecError> {
    if name.is_empty() {
        return Err(SpecError::invalid(context, "empty resource name"));
    }
    Ok(())
}
