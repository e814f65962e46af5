//! Error types for cluster-facing podlab operations
//!
//! Errors carry the resource kind and name they concern so a failed test
//! run points straight at the object that misbehaved.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cluster operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error, passed through unchanged
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An object with the same name already exists
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Resource kind (e.g. "Namespace")
        kind: String,
        /// Resource name
        name: String,
    },

    /// The object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Resource kind (e.g. "Deployment")
        kind: String,
        /// Resource name
        name: String,
    },

    /// Invalid user-supplied configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field, if known (e.g. "ports")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "port_forward", "create_client")
        context: String,
    },
}

impl Error {
    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the API reported the object as already present (HTTP 409)
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && (ae.reason == "AlreadyExists" || ae.reason.is_empty()),
            _ => false,
        }
    }

    /// True when the API reported the object as absent (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation errors need a config fix. Kubernetes
    /// errors are retryable unless the API answered with a 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::AlreadyExists { .. } | Error::NotFound { .. } => false,
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}
