//! Offered resources and their values.
//!
//! A resource is unreserved when it carries no [`Reservation`]. Unreserved
//! resources may still belong to a statically assigned role; the role `*`
//! means "available to any framework".

use std::collections::BTreeSet;

use keel_id::{PersistenceId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Role of resources that are not statically assigned to anyone.
pub const UNRESERVED_ROLE: &str = "*";

/// Tolerance used when comparing scalar quantities.
pub const SCALAR_EPSILON: f64 = 1e-6;

/// Round a scalar to the three decimal places the resource manager keeps.
pub fn round_scalar(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// The shape of a resource value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Scalar,
    Range,
    Set,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Scalar => write!(f, "scalar"),
            ResourceKind::Range => write!(f, "range"),
            ResourceKind::Set => write!(f, "set"),
        }
    }
}

/// An inclusive range of integer values, typically ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueRange {
    pub begin: u64,
    pub end: u64,
}

impl ValueRange {
    /// Creates a range, rejecting `end < begin`.
    pub fn new(begin: u64, end: u64) -> Result<Self, EventError> {
        if end < begin {
            return Err(EventError::InvalidRange { begin, end });
        }
        Ok(Self { begin, end })
    }

    /// A range holding exactly one value.
    pub const fn single(value: u64) -> Self {
        Self {
            begin: value,
            end: value,
        }
    }

    /// Returns true if `other` lies entirely inside this range.
    pub fn contains(&self, other: &ValueRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    fn overlaps(&self, other: &ValueRange) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }
}

impl std::fmt::Display for ValueRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.begin == self.end {
            write!(f, "{}", self.begin)
        } else {
            write!(f, "{}-{}", self.begin, self.end)
        }
    }
}

/// Sort and merge overlapping or adjacent ranges.
pub fn normalize_ranges(ranges: &[ValueRange]) -> Vec<ValueRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort();
    let mut merged: Vec<ValueRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.begin <= last.end.saturating_add(1) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Returns true if every value of `wanted` appears in `ranges`.
pub fn ranges_contain(ranges: &[ValueRange], wanted: &ValueRange) -> bool {
    normalize_ranges(ranges).iter().any(|r| r.contains(wanted))
}

/// Remove `taken` from `ranges`, splitting ranges as needed.
///
/// The relative order of the remaining ranges is preserved.
pub fn subtract_range(ranges: &mut Vec<ValueRange>, taken: &ValueRange) {
    let mut remaining = Vec::with_capacity(ranges.len() + 1);
    for range in ranges.drain(..) {
        if !range.overlaps(taken) {
            remaining.push(range);
            continue;
        }
        if range.begin < taken.begin {
            remaining.push(ValueRange {
                begin: range.begin,
                end: taken.begin - 1,
            });
        }
        if taken.end < range.end {
            remaining.push(ValueRange {
                begin: taken.end + 1,
                end: range.end,
            });
        }
    }
    *ranges = remaining;
}

/// The value carried by a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceValue {
    Scalar(f64),
    Ranges(Vec<ValueRange>),
    Set(BTreeSet<String>),
}

impl ResourceValue {
    /// The kind of this value.
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceValue::Scalar(_) => ResourceKind::Scalar,
            ResourceValue::Ranges(_) => ResourceKind::Range,
            ResourceValue::Set(_) => ResourceKind::Set,
        }
    }

    /// Returns true if this value can satisfy `required`.
    ///
    /// Scalars compare by quantity, ranges by containment, sets by superset.
    /// Values of different kinds never satisfy each other.
    pub fn satisfies(&self, required: &ResourceValue) -> bool {
        match (self, required) {
            (ResourceValue::Scalar(have), ResourceValue::Scalar(want)) => {
                *have + SCALAR_EPSILON >= *want
            }
            (ResourceValue::Ranges(have), ResourceValue::Ranges(want)) => {
                want.iter().all(|w| ranges_contain(have, w))
            }
            (ResourceValue::Set(have), ResourceValue::Set(want)) => want.is_subset(have),
            _ => false,
        }
    }

    /// The scalar quantity, if this is a scalar.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ResourceValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceValue::Scalar(v) => write!(f, "{}", v),
            ResourceValue::Ranges(ranges) => {
                let parts: Vec<String> = ranges.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(","))
            }
            ResourceValue::Set(items) => {
                let parts: Vec<&str> = items.iter().map(String::as_str).collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

/// Dynamic reservation metadata attached to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Role the resource is reserved to.
    pub role: String,

    /// Principal that made the reservation.
    pub principal: String,

    /// Label identifying the reservation across offer cycles.
    pub label: ReservationId,
}

/// Where a disk resource comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiskSource {
    /// Carved out of the agent's root disk; divisible.
    Root,

    /// A dedicated mounted disk; consumed whole.
    Mount { root: String },
}

/// A created persistent volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persistence {
    pub id: PersistenceId,
    pub principal: String,
}

/// Disk metadata on a `disk` resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub source: DiskSource,

    /// Set once a persistent volume has been created on this disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<Persistence>,

    /// Mount point inside the task sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_path: Option<String>,
}

/// One resource inside an offer or an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferedResource {
    pub name: String,
    pub value: ResourceValue,

    /// Static role of the resource (`*` when unassigned).
    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskInfo>,
}

fn default_role() -> String {
    UNRESERVED_ROLE.to_string()
}

impl OfferedResource {
    fn with_value(name: impl Into<String>, value: ResourceValue) -> Self {
        Self {
            name: name.into(),
            value,
            role: default_role(),
            reservation: None,
            disk: None,
        }
    }

    /// An unreserved scalar resource.
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self::with_value(name, ResourceValue::Scalar(value))
    }

    /// An unreserved ranges resource.
    pub fn ranges(name: impl Into<String>, ranges: Vec<ValueRange>) -> Self {
        Self::with_value(name, ResourceValue::Ranges(ranges))
    }

    /// An unreserved set resource.
    pub fn set<I, S>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_value(
            name,
            ResourceValue::Set(items.into_iter().map(Into::into).collect()),
        )
    }

    /// Validate the value of this resource.
    pub fn validate(&self) -> Result<(), EventError> {
        match &self.value {
            ResourceValue::Scalar(v) if !v.is_finite() || *v < 0.0 => {
                Err(EventError::InvalidScalar {
                    name: self.name.clone(),
                    value: *v,
                })
            }
            ResourceValue::Ranges(ranges) => {
                for r in ranges {
                    ValueRange::new(r.begin, r.end)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Assign a static role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Attach a dynamic reservation.
    #[must_use]
    pub fn reserved(mut self, reservation: Reservation) -> Self {
        self.reservation = Some(reservation);
        self
    }

    /// Attach disk metadata.
    #[must_use]
    pub fn with_disk(mut self, disk: DiskInfo) -> Self {
        self.disk = Some(disk);
        self
    }

    /// The reservation label, if dynamically reserved.
    pub fn label(&self) -> Option<ReservationId> {
        self.reservation.as_ref().map(|r| r.label)
    }

    /// Returns true if the resource carries no dynamic reservation.
    pub fn is_unreserved(&self) -> bool {
        self.reservation.is_none()
    }

    /// Returns true if this is a mount disk (consumed whole).
    pub fn is_mount_disk(&self) -> bool {
        matches!(
            self.disk.as_ref().map(|d| &d.source),
            Some(DiskSource::Mount { .. })
        )
    }

    /// The persistent volume created on this resource, if any.
    pub fn persistence(&self) -> Option<&Persistence> {
        self.disk.as_ref().and_then(|d| d.persistence.as_ref())
    }
}
