//! Deterministic identifiers for what an evaluation creates.
//!
//! Labels, volume ids and task ids are digests of the offer and the slot
//! they fill, so evaluating the same offer twice yields the same outcome.

use keel_id::{OfferId, PersistenceId, PodInstanceName, ReservationId, TaskId};
use sha2::{Digest, Sha256};

pub(crate) fn reservation_label(
    offer: &OfferId,
    pod: &PodInstanceName,
    task: &str,
    slot: &str,
) -> ReservationId {
    ReservationId::from_digest(digest(&[
        "reservation",
        &offer.to_string(),
        &pod.to_string(),
        task,
        slot,
    ]))
}

pub(crate) fn persistence_id(
    offer: &OfferId,
    pod: &PodInstanceName,
    task: &str,
    slot: &str,
) -> PersistenceId {
    PersistenceId::from_digest(digest(&[
        "volume",
        &offer.to_string(),
        &pod.to_string(),
        task,
        slot,
    ]))
}

pub(crate) fn task_id(offer: &OfferId, pod: &PodInstanceName, task: &str) -> TaskId {
    TaskId::from_digest(digest(&["task", &offer.to_string(), &pod.to_string(), task]))
}

fn digest(parts: &[&str]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let hash = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash[..16]);
    out
}
