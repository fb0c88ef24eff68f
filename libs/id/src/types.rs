//! Typed ID definitions for scheduler resources.
//!
//! Each generated ID type has a unique prefix that identifies what it names.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Transport
// =============================================================================

define_id!(OfferId, "offer");
define_id!(NodeId, "node");

// =============================================================================
// Reservations and Tasks
// =============================================================================

define_id!(ReservationId, "res");
define_id!(PersistenceId, "vol");
define_id!(TaskId, "task");

// =============================================================================
// Pod Instances
// =============================================================================

/// Identity of one numbered deployment of a pod type.
///
/// Rendered as `{pod_type}-{index}`. The pod type may itself contain dashes;
/// the index is always the part after the last dash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodInstanceName {
    pod_type: String,
    index: u32,
}

impl PodInstanceName {
    /// Creates a pod instance name, validating the pod type.
    pub fn new(pod_type: impl Into<String>, index: u32) -> Result<Self, IdError> {
        let pod_type = pod_type.into();
        if pod_type.is_empty() {
            return Err(IdError::Empty);
        }
        if pod_type
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(IdError::InvalidPodType(pod_type));
        }
        Ok(Self { pod_type, index })
    }

    /// The pod type this instance belongs to.
    pub fn pod_type(&self) -> &str {
        &self.pod_type
    }

    /// The ordinal index of this instance within its pod type.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Parses a `{pod_type}-{index}` string.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((pod_type, index)) = s.rsplit_once('-') else {
            return Err(IdError::MissingSeparator('-'));
        };
        let index = index
            .parse::<u32>()
            .map_err(|_| IdError::InvalidIndex(index.to_string()))?;
        Self::new(pod_type, index)
    }
}

impl std::fmt::Display for PodInstanceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.pod_type, self.index)
    }
}

impl std::str::FromStr for PodInstanceName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for PodInstanceName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for PodInstanceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
