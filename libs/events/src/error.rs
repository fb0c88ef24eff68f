//! Error types for transport data.

use thiserror::Error;

/// Errors that can occur when building or decoding transport data.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventError {
    /// A range has its end before its beginning.
    #[error("invalid range: {begin}-{end}")]
    InvalidRange { begin: u64, end: u64 },

    /// A scalar value is negative or not finite.
    #[error("invalid scalar value {value} for resource '{name}'")]
    InvalidScalar { name: String, value: f64 },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
