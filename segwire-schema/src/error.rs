//! Schema error types.

use segwire_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while loading or compiling a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid schema: {reason}")]
    Invalid { reason: String },

    #[error("invalid validator on '{field}': {reason}")]
    InvalidValidator { field: String, reason: String },

    #[error("invalid pattern on '{field}': {source}")]
    Pattern {
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid field layout: {0}")]
    Layout(#[from] ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchemaError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        SchemaError::Invalid {
            reason: reason.into(),
        }
    }
}

/// A value failed one of its field's validators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed for '{field}': {reason}")]
pub struct ValidationError {
    /// Path of the offending value, e.g. `tags[2]`.
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
