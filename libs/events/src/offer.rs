//! Resource offers.

use keel_id::{NodeId, OfferId};
use serde::{Deserialize, Serialize};

use crate::{EventError, OfferedResource};

/// A time-bounded grant of resources on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,

    /// Node the resources live on.
    pub node_id: NodeId,

    /// Hostname of the node, for logging.
    #[serde(default)]
    pub hostname: String,

    /// Role the offer was allocated to.
    pub role: String,

    /// Offered resources, in the order the resource manager listed them.
    pub resources: Vec<OfferedResource>,
}

impl Offer {
    /// Validate every resource in the offer.
    pub fn validate(&self) -> Result<(), EventError> {
        self.resources.iter().try_for_each(OfferedResource::validate)
    }

    /// Iterate over resources carrying a dynamic reservation made by `role`.
    pub fn reserved_for<'a>(
        &'a self,
        role: &'a str,
    ) -> impl Iterator<Item = &'a OfferedResource> + 'a {
        self.resources.iter().filter(move |r| {
            r.reservation
                .as_ref()
                .is_some_and(|reservation| reservation.role == role)
        })
    }

    /// Returns true if any resource belongs to `role`, either statically or
    /// through a dynamic reservation.
    pub fn has_role(&self, role: &str) -> bool {
        self.resources.iter().any(|r| {
            r.role == role
                || r.reservation
                    .as_ref()
                    .is_some_and(|reservation| reservation.role == role)
        })
    }
}
