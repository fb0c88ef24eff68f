//! Working copy of an offer's resources during one evaluation.

use std::collections::BTreeSet;

use keel_events::{
    ranges_contain, round_scalar, subtract_range, DiskSource, Offer, OfferedResource, ResourceValue,
    ValueRange, SCALAR_EPSILON,
};
use keel_id::ReservationId;

use crate::spec::{DISK_RESOURCE, PORTS_RESOURCE};

/// Resources left to claim, in offer order.
///
/// Reserved resources are claimed whole by label. Unreserved resources are
/// carved up as requirements consume them; a failed claim leaves the pool
/// untouched.
#[derive(Debug, Clone)]
pub(crate) struct ResourcePool {
    reserved: Vec<OfferedResource>,
    unreserved: Vec<OfferedResource>,
}

impl ResourcePool {
    /// Split `offer` into resources reserved by `role` and unreserved ones.
    pub fn new(offer: &Offer, role: &str) -> Self {
        Self {
            reserved: offer.reserved_for(role).cloned().collect(),
            unreserved: offer
                .resources
                .iter()
                .filter(|r| r.is_unreserved())
                .cloned()
                .collect(),
        }
    }

    /// Remove and return the resource carrying `label`.
    pub fn take_reserved(&mut self, label: ReservationId) -> Option<OfferedResource> {
        let pos = self
            .reserved
            .iter()
            .position(|r| r.label() == Some(label))?;
        Some(self.reserved.remove(pos))
    }

    /// Return a reserved resource to the unreserved pool.
    pub fn release(&mut self, mut resource: OfferedResource) {
        resource.reservation = None;
        if let Some(disk) = resource.disk.as_mut() {
            disk.persistence = None;
            disk.container_path = None;
        }
        self.unreserved.push(resource);
    }

    /// Claim `amount` of a scalar, accumulating across matching resources.
    ///
    /// On shortfall nothing is claimed and the available total is returned.
    pub fn take_scalar(&mut self, name: &str, role: &str, amount: f64) -> Result<(), f64> {
        let matching = |r: &OfferedResource| {
            r.name == name
                && r.role == role
                && r.value.as_scalar().is_some()
                && !r.is_mount_disk()
        };

        let available: f64 = self
            .unreserved
            .iter()
            .filter(|r| matching(r))
            .filter_map(|r| r.value.as_scalar())
            .sum();
        if available + SCALAR_EPSILON < amount {
            return Err(round_scalar(available));
        }

        let mut remaining = amount;
        for resource in self.unreserved.iter_mut().filter(|r| matching(r)) {
            if remaining <= SCALAR_EPSILON {
                break;
            }
            if let ResourceValue::Scalar(have) = &mut resource.value {
                let taken = have.min(remaining);
                *have = round_scalar(*have - taken);
                remaining = round_scalar(remaining - taken);
            }
        }
        self.unreserved
            .retain(|r| r.value.as_scalar().map_or(true, |v| v > SCALAR_EPSILON));
        Ok(())
    }

    /// Claim explicit sub-ranges from the first matching resource holding
    /// all of them.
    pub fn take_ranges(&mut self, name: &str, role: &str, wanted: &[ValueRange]) -> bool {
        let found = self.unreserved.iter_mut().find(|r| {
            r.name == name
                && r.role == role
                && matches!(&r.value, ResourceValue::Ranges(have)
                    if wanted.iter().all(|w| ranges_contain(have, w)))
        });
        let Some(resource) = found else {
            return false;
        };
        if let ResourceValue::Ranges(have) = &mut resource.value {
            for w in wanted {
                subtract_range(have, w);
            }
        }
        true
    }

    /// Claim the first free port in offer order, skipping `avoid`.
    pub fn take_dynamic_port(&mut self, role: &str, avoid: &BTreeSet<u64>) -> Option<u64> {
        let port = self
            .unreserved
            .iter()
            .filter(|r| r.name == PORTS_RESOURCE && r.role == role)
            .filter_map(|r| match &r.value {
                ResourceValue::Ranges(ranges) => Some(ranges),
                _ => None,
            })
            .flatten()
            .find_map(|range| first_free(range, avoid))?;
        self.take_ranges(PORTS_RESOURCE, role, &[ValueRange::single(port)])
            .then_some(port)
    }

    /// Claim members of a set resource.
    pub fn take_set(&mut self, name: &str, role: &str, items: &BTreeSet<String>) -> bool {
        let found = self.unreserved.iter_mut().find(|r| {
            r.name == name
                && r.role == role
                && matches!(&r.value, ResourceValue::Set(have) if items.is_subset(have))
        });
        let Some(resource) = found else {
            return false;
        };
        if let ResourceValue::Set(have) = &mut resource.value {
            have.retain(|item| !items.contains(item));
        }
        true
    }

    /// Claim a whole mount disk of at least `size_mb`.
    pub fn take_mount_disk(&mut self, role: &str, size_mb: f64) -> Option<OfferedResource> {
        let pos = self.unreserved.iter().position(|r| {
            r.name == DISK_RESOURCE
                && r.role == role
                && matches!(r.disk.as_ref().map(|d| &d.source), Some(DiskSource::Mount { .. }))
                && r.value.as_scalar().is_some_and(|v| v + SCALAR_EPSILON >= size_mb)
        })?;
        Some(self.unreserved.remove(pos))
    }
}

fn first_free(range: &ValueRange, avoid: &BTreeSet<u64>) -> Option<u64> {
    let mut port = range.begin;
    while avoid.contains(&port) {
        port = port.checked_add(1)?;
    }
    (port <= range.end).then_some(port)
}
