//! External volume providers.
//!
//! Volumes not managed by the resource manager are provisioned by a driver.
//! Each driver is a [`ExternalVolumeProvider`] registered by name in a
//! [`VolumeProviderRegistry`]; the evaluator only ever looks providers up
//! by name.

mod portworx;

use std::collections::BTreeMap;

use keel_events::{ExternalVolumeMount, ResourceOperation};
use thiserror::Error;

use crate::spec::VolumeRequirement;

pub use portworx::PortworxVolumeProvider;

/// Errors from building an external volume.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolumeProviderError {
    #[error("unsupported external volume driver {0}")]
    UnsupportedDriver(String),

    #[error("invalid driver option {key}: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("volume at {0} is not an external volume")]
    NotExternal(String),
}

/// What a provider is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeProviderContext {
    pub service_name: String,
    pub volume_name: Option<String>,
    pub driver_name: String,
    pub pod_index: u32,
    pub driver_options: BTreeMap<String, String>,
}

/// Everything the evaluator needs to satisfy one external volume.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalVolume {
    /// Resource operations to run before launch, in order.
    pub operations: Vec<ResourceOperation>,

    /// Mount attached to the launched task.
    pub mount: ExternalVolumeMount,

    /// Extra task environment.
    pub env: BTreeMap<String, String>,
}

/// A storage driver.
pub trait ExternalVolumeProvider: Send + Sync {
    fn driver_name(&self) -> &str;

    /// Build the operations and mount metadata for `volume`.
    fn build(&self, volume: &VolumeRequirement) -> Result<ExternalVolume, VolumeProviderError>;
}

/// Constructs a provider for one volume of one pod instance.
pub type ProviderConstructor = fn(VolumeProviderContext) -> Box<dyn ExternalVolumeProvider>;

/// Driver name to provider constructor.
#[derive(Clone, Default)]
pub struct VolumeProviderRegistry {
    constructors: BTreeMap<String, ProviderConstructor>,
}

impl VolumeProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in driver.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PortworxVolumeProvider::DRIVER, PortworxVolumeProvider::boxed);
        registry
    }

    /// Register a driver, replacing any previous constructor for the name.
    pub fn register(&mut self, driver: impl Into<String>, constructor: ProviderConstructor) {
        self.constructors.insert(driver.into(), constructor);
    }

    /// Registered driver names, sorted.
    pub fn drivers(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Construct the provider for `context.driver_name`.
    pub fn create(
        &self,
        context: VolumeProviderContext,
    ) -> Result<Box<dyn ExternalVolumeProvider>, VolumeProviderError> {
        let constructor = self
            .constructors
            .get(&context.driver_name)
            .ok_or_else(|| VolumeProviderError::UnsupportedDriver(context.driver_name.clone()))?;
        Ok(constructor(context))
    }
}

impl std::fmt::Debug for VolumeProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeProviderRegistry")
            .field("drivers", &self.drivers().collect::<Vec<_>>())
            .finish()
    }
}
