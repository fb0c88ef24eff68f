//! Durable scheduler state.
//!
//! Everything the scheduler must know after a restart: reservations it
//! owns, labels it still has to release, the current launch of every task,
//! and the status of every step.

mod records;
mod store;

pub use records::{PendingRelease, ReservationRecord, StepRecord, TaskRecord};
pub use store::{StateStore, StateStoreError};
