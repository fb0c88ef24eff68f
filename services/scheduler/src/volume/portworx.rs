//! Portworx (`pxd`) volumes.
//!
//! Portworx accepts an inline volume spec as the docker volume name, e.g.
//! `repl=3,size=10,name=hello-world_data_0`. The named volume is created on
//! first mount and reattached on later ones, so no resource operations are
//! needed beyond the mount itself.

use std::collections::BTreeMap;

use keel_events::ExternalVolumeMount;

use super::{
    ExternalVolume, ExternalVolumeProvider, VolumeProviderContext, VolumeProviderError,
};
use crate::spec::{VolumeRequirement, VolumeSource};

const MB_PER_GB: f64 = 1024.0;

pub struct PortworxVolumeProvider {
    context: VolumeProviderContext,
}

impl PortworxVolumeProvider {
    pub const DRIVER: &'static str = "pxd";

    pub fn new(context: VolumeProviderContext) -> Self {
        Self { context }
    }

    pub(crate) fn boxed(context: VolumeProviderContext) -> Box<dyn ExternalVolumeProvider> {
        Box::new(Self::new(context))
    }

    /// Volume identity: unique per (service, volume, pod index).
    fn volume_id(&self, volume: &VolumeRequirement) -> String {
        let base = self
            .context
            .volume_name
            .as_deref()
            .unwrap_or(&volume.container_path);
        sanitize(&format!(
            "{}_{}_{}",
            self.context.service_name, base, self.context.pod_index
        ))
    }

    fn inline_spec(&self, volume: &VolumeRequirement, id: &str) -> Result<String, VolumeProviderError> {
        let mut options = self.context.driver_options.clone();
        if let Some(key) = options.keys().find(|k| k.is_empty()) {
            return Err(VolumeProviderError::InvalidOption {
                key: key.clone(),
                reason: "empty key".into(),
            });
        }
        for (key, value) in &options {
            if key == "name" {
                return Err(VolumeProviderError::InvalidOption {
                    key: key.clone(),
                    reason: "name is derived from the pod instance".into(),
                });
            }
            if value.is_empty() || value.contains([',', '=']) || key.contains([',', '=']) {
                return Err(VolumeProviderError::InvalidOption {
                    key: key.clone(),
                    reason: format!("unusable value {:?}", value),
                });
            }
        }
        if volume.size_mb > 0.0 && !options.contains_key("size") {
            let gb = (volume.size_mb / MB_PER_GB).ceil().max(1.0);
            options.insert("size".into(), format!("{}", gb as u64));
        }

        let mut parts: Vec<String> = options
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        parts.push(format!("name={}", id));
        Ok(parts.join(","))
    }
}

impl ExternalVolumeProvider for PortworxVolumeProvider {
    fn driver_name(&self) -> &str {
        &self.context.driver_name
    }

    fn build(&self, volume: &VolumeRequirement) -> Result<ExternalVolume, VolumeProviderError> {
        if !matches!(volume.source, VolumeSource::External { .. }) {
            return Err(VolumeProviderError::NotExternal(
                volume.container_path.clone(),
            ));
        }
        let id = self.volume_id(volume);
        let name = self.inline_spec(volume, &id)?;

        Ok(ExternalVolume {
            operations: Vec::new(),
            mount: ExternalVolumeMount {
                driver: self.context.driver_name.clone(),
                name,
                container_path: volume.container_path.clone(),
                options: BTreeMap::new(),
            },
            env: BTreeMap::new(),
        })
    }
}

/// Portworx volume names allow alphanumerics, `_`, `-` and `.`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
