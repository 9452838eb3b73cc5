//! Store Error Types
//!
//! This module defines the error taxonomy shared by every layer of the engine:
//! identity cache, value coercion, relationship resolution and the write-back
//! pipeline. Collaborator failures are wrapped with the operation that produced
//! them so a failed save can be traced back to its request.

use thiserror::Error;

/// Errors surfaced by the mirror store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The collaborator could not mint or extract an identifier
    #[error("Missing identifier for entity '{entity}'")]
    MissingIdentifier { entity: String },

    /// Malformed fetch/save descriptor
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Wire value does not match the declared attribute kind
    #[error("Invalid value for {entity}.{key}: {value}")]
    InvalidValueType {
        entity: String,
        key: String,
        value: String,
    },

    /// Relationship points at an identifier that could not be resolved
    #[error("Dangling reference {entity}.{relationship} -> {identifier}")]
    DanglingRelationshipReference {
        entity: String,
        relationship: String,
        identifier: String,
    },

    /// No remote collaborator configured
    #[error("Remote delegate is not configured")]
    DelegateUnavailable,

    /// Entity name not present in the entity model
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    /// A collaborator request failed while executing
    #[error("Remote request failed during {operation}: {source}")]
    RemoteRequestFailed {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// Operation was cancelled before it started (fail-fast)
    #[error("Operation cancelled: {key}")]
    OperationCancelled { key: String },

    /// Store configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    pub fn missing_identifier(entity: impl Into<String>) -> Self {
        Self::MissingIdentifier {
            entity: entity.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an invalid value error, rendering the offending value for the message
    pub fn invalid_value_type(
        entity: impl Into<String>,
        key: impl Into<String>,
        value: impl std::fmt::Debug,
    ) -> Self {
        Self::InvalidValueType {
            entity: entity.into(),
            key: key.into(),
            value: format!("{:?}", value),
        }
    }

    pub fn dangling_reference(
        entity: impl Into<String>,
        relationship: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self::DanglingRelationshipReference {
            entity: entity.into(),
            relationship: relationship.into(),
            identifier: identifier.into(),
        }
    }

    pub fn unknown_entity(name: impl Into<String>) -> Self {
        Self::UnknownEntity(name.into())
    }

    pub fn remote_request_failed(operation: impl Into<String>, source: anyhow::Error) -> Self {
        Self::RemoteRequestFailed {
            operation: operation.into(),
            source,
        }
    }

    pub fn operation_cancelled(key: impl Into<String>) -> Self {
        Self::OperationCancelled { key: key.into() }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether the operation was cancelled before it ran
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::OperationCancelled { .. })
    }
}

/// Result alias used throughout the crate
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = StoreError::invalid_value_type("Line", "quantity", "abc");
        assert_eq!(err.to_string(), "Invalid value for Line.quantity: \"abc\"");

        let err = StoreError::dangling_reference("Document", "lines", "L2");
        assert_eq!(err.to_string(), "Dangling reference Document.lines -> L2");
    }

    #[test]
    fn test_cancellation_is_not_a_failure() {
        let err = StoreError::remote_request_failed("insert Line://L1", anyhow::anyhow!("503"));
        assert!(!err.is_cancellation());
        assert!(StoreError::operation_cancelled("Line://L1").is_cancellation());
    }
}
