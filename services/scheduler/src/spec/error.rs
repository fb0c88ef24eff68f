use keel_id::IdError;
use thiserror::Error;

/// Errors from loading or validating a service spec.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read service spec: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse service spec: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid name: {0}")]
    Name(#[from] IdError),

    #[error("{context}: {reason}")]
    Invalid { context: String, reason: String },

    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },

    #[error("unknown pod type: {0}")]
    UnknownPod(String),
}

impl SpecError {
    pub(crate) fn invalid(context: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        SpecError::Invalid {
            context: context.to_string(),
            reason: reason.into(),
        }
    }
}
