//! Error types for the API sync agent
//!
//! Errors are structured with fields to aid debugging in production. Every
//! variant classifies itself into an [`ErrorClass`] so the reconciler can turn
//! any failure into a retry decision without inspecting messages.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// How the engine reacts to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network trouble, server unavailable, version conflict: retry with backoff
    Transient,
    /// Object content cannot be projected: pause until the input changes
    Validation,
    /// Two upstream identities map onto the same downstream identity
    Collision,
    /// Shutdown or leadership loss: stop quietly
    Cancelled,
    /// Startup configuration problem: terminate the process
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Validation => write!(f, "validation"),
            Self::Collision => write!(f, "collision"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Main error type for sync agent operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency failure: the object changed since it was read
    #[error("version conflict on {object}: {message}")]
    Conflict {
        /// Identity of the object that was written
        object: String,
        /// Server message
        message: String,
    },

    /// Object content that cannot be projected downstream
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Identity of the offending object
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec")
        field: Option<String>,
    },

    /// Two configured workspaces map to the same downstream prefix
    #[error("identity collision on prefix {prefix}: {first} and {second}")]
    IdentityCollision {
        /// The colliding downstream prefix
        prefix: String,
        /// First workspace path
        first: String,
        /// Second workspace path
        second: String,
    },

    /// Startup configuration error (kubeconfig, API binding, flags)
    #[error("configuration error: {message}")]
    Config {
        /// Description of what is misconfigured
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// The fencing term this work was started under is no longer current
    #[error("leadership lost by {identity} (term {term})")]
    LeadershipLost {
        /// Identity of the agent instance
        identity: String,
        /// Term the work was started under
        term: u64,
    },

    /// Work was abandoned because shutdown was requested
    #[error("cancelled [{context}]")]
    Cancelled {
        /// Where the cancellation was observed
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a version conflict error for an object
    pub fn conflict(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without object context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a cancellation marker
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
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

    /// Classify this error for the retry decision
    ///
    /// Kubernetes errors: 409 is a version conflict (transient), 400 and 422
    /// mean the server rejected the projected object (validation), everything
    /// else including 401/403/404/429 and connection failures is retried.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
                    ErrorClass::Validation
                }
                _ => ErrorClass::Transient,
            },
            Error::Conflict { .. } => ErrorClass::Transient,
            Error::Validation { .. } => ErrorClass::Validation,
            Error::IdentityCollision { .. } => ErrorClass::Collision,
            Error::Config { .. } => ErrorClass::Fatal,
            Error::Serialization { .. } => ErrorClass::Validation,
            Error::LeadershipLost { .. } => ErrorClass::Cancelled,
            Error::Cancelled { .. } => ErrorClass::Cancelled,
            Error::Internal { .. } => ErrorClass::Transient,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Get the object identity if this error is associated with one
    pub fn object(&self) -> Option<&str> {
        match self {
            Error::Conflict { object, .. } => Some(object),
            Error::Validation { object, .. } => Some(object),
            _ => None,
        }
    }
}
