//! # keel-id
//!
//! Stable ID types, parsing, and validation for the keel scheduler.
//!
//! ## ID Format
//!
//! Generated IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `offer_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `res_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `task_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! Pod instances are the exception: their identity is the pair
//! `(pod type, index)` and is rendered as `{pod_type}-{index}`, e.g. `hello-0`.
//! That identity is stable for the lifetime of the service.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
