//! # keel-events
//!
//! Data exchanged with the cluster resource manager transport.
//!
//! ## Design Principles
//!
//! - Offers are ephemeral; nothing here outlives one evaluation cycle
//!   except what the scheduler chooses to persist
//! - Operations are ordered; the transport applies them in sequence
//! - The wire protocol itself is opaque: these types are what the scheduler
//!   consumes and produces, not how they are encoded on the network
//!
//! ## Modules
//!
//! - `resource`: offered resources, values, ranges, reservations, disks
//! - `offer`: resource offers
//! - `operation`: reserve/unreserve/create/destroy/launch operations
//! - `status`: task status updates
//! - `envelope`: inbound events and outbound messages

mod envelope;
mod error;
mod offer;
mod operation;
mod resource;
mod status;

pub use envelope::*;
pub use error::EventError;
pub use offer::*;
pub use operation::*;
pub use resource::*;
pub use status::*;
