//! Service specification: the immutable requirement model.
//!
//! A service is a set of pod types, each deployed `count` times. Every pod
//! instance owns an ordered list of tasks, and every task an ordered list of
//! resource requirements. Declared order is significant: evaluation walks it
//! as written.

mod error;
mod requirement;
mod service;

pub use error::SpecError;
pub use requirement::*;
pub use service::*;
