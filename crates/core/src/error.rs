//! Descriptor error model.

use thiserror::Error;

/// Result type used when building descriptors.
pub type DescriptorResult<T> = Result<T, DescriptorError>;

/// Descriptor-level error.
///
/// Keep this focused on deterministic construction failures. Store and engine
/// failures belong to `deferq-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// The target cache key is empty; it is the descriptor's identity.
    #[error("target cache key must not be empty")]
    EmptyTargetKey,

    /// A parameter failed validation (e.g. empty name).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DescriptorError {
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
