//! Inbound events and outbound messages - the whole transport surface.

use keel_id::{NodeId, OfferId, TaskId};
use serde::{Deserialize, Serialize};

use crate::{EventError, Offer, ResourceOperation, TaskStatusUpdate};

/// Events the transport delivers to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A batch of offers to evaluate together.
    Offers { offers: Vec<Offer> },

    /// A task changed state.
    Status { update: TaskStatusUpdate },
}

impl InboundEvent {
    /// Decode one event from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        let event: InboundEvent = serde_json::from_str(json)?;
        if let InboundEvent::Offers { offers } = &event {
            offers.iter().try_for_each(Offer::validate)?;
        }
        Ok(event)
    }

    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Offers { .. } => "offers",
            InboundEvent::Status { .. } => "status",
        }
    }
}

/// Messages the scheduler hands back to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Accept an offer, applying the operations in order.
    Accept {
        offer_id: OfferId,
        node_id: NodeId,
        operations: Vec<ResourceOperation>,
    },

    /// Return offers unused.
    Decline { offer_ids: Vec<OfferId> },

    /// Stop running tasks. Their resources come back in later offers.
    Kill { task_ids: Vec<TaskId> },
}

impl OutboundMessage {
    /// Encode as a single-line JSON document.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}
