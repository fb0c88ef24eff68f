//! Configuration for the scheduler.

use std::path::PathBuf;

use anyhow::Result;

/// Resource features the cluster supports.
///
/// Passed to the evaluator at construction; requirements that need a
/// disabled capability are configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub pre_reserved_resources: bool,
    pub gpu_resources: bool,
    pub external_volumes: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            pre_reserved_resources: true,
            gpu_resources: false,
            external_volumes: true,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Overrides the service name from the spec.
    pub service_name: Option<String>,

    /// Role reservations are made under. Defaults to `{service}-role`.
    pub role: Option<String>,

    /// Principal reservations are made by. Defaults to `{service}-principal`.
    pub principal: Option<String>,

    /// Data directory for local state.
    pub data_dir: String,

    /// Path to the JSON service spec.
    pub service_spec: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub capabilities: Capabilities,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let service_name = std::env::var("KEEL_SERVICE_NAME").ok();
        let role = std::env::var("KEEL_ROLE").ok();
        let principal = std::env::var("KEEL_PRINCIPAL").ok();

        let data_dir =
            std::env::var("KEEL_DATA_DIR").unwrap_or_else(|_| "/var/lib/keel".to_string());

        let service_spec =
            std::env::var("KEEL_SERVICE_SPEC").unwrap_or_else(|_| "svc.json".to_string());

        let log_level = std::env::var("KEEL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let defaults = Capabilities::default();
        let capabilities = Capabilities {
            pre_reserved_resources: flag("KEEL_CAP_PRE_RESERVED")?
                .unwrap_or(defaults.pre_reserved_resources),
            gpu_resources: flag("KEEL_CAP_GPU")?.unwrap_or(defaults.gpu_resources),
            external_volumes: flag("KEEL_CAP_EXTERNAL_VOLUMES")?
                .unwrap_or(defaults.external_volumes),
        };

        Ok(Self {
            service_name,
            role,
            principal,
            data_dir,
            service_spec,
            log_level,
            capabilities,
        })
    }

    pub fn role_for(&self, service: &str) -> String {
        self.role
            .clone()
            .unwrap_or_else(|| format!("{}-role", service))
    }

    pub fn principal_for(&self, service: &str) -> String {
        self.principal
            .clone()
            .unwrap_or_else(|| format!("{}-principal", service))
    }

    /// Location of the state database.
    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("state.db")
    }
}

fn flag(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(value) => parse_flag(&value)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("{} must be true or false, got {:?}", key, value)),
        Err(_) => Ok(None),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
