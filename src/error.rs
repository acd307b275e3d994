//! Error types for the kiln operator
//!
//! Every error the reconciler can observe is classified here as either
//! retryable (requeue with backoff, state preserved) or terminal (the
//! workload is marked Failed and waits for a spec change). Leaf components
//! (registry, capacity, placement, resource manager) return these errors and
//! never touch workload status themselves; status writes belong to the
//! reconciler alone.

use thiserror::Error;

/// Main error type for kiln operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for workload specs
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested model/version does not exist in the registry
    #[error("model {name}:{version} not found in registry")]
    ModelNotFound {
        /// Model name as requested
        name: String,
        /// Model version as requested
        version: String,
    },

    /// The model registry could not be reached
    #[error("model registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// No node in the cluster can host the requested envelope
    #[error("no feasible node: {0}")]
    NoFeasibleNode(String),

    /// A child object exists but is not owned by the workload
    #[error("ownership conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An outbound call exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unexpected invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a model-not-found error for the given model identity
    pub fn model_not_found(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self::ModelNotFound {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Create a registry-unavailable error with the given message
    pub fn registry_unavailable(msg: impl Into<String>) -> Self {
        Self::RegistryUnavailable(msg.into())
    }

    /// Create a no-feasible-node error with the given message
    pub fn no_feasible_node(msg: impl Into<String>) -> Self {
        Self::NoFeasibleNode(msg.into())
    }

    /// Create an ownership-conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the reconciler should requeue after this error.
    ///
    /// Retryable errors preserve the workload's current phase; terminal
    /// errors transition it to Failed until the spec changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_)
            | Self::RegistryUnavailable(_)
            | Self::NoFeasibleNode(_)
            | Self::Timeout(_) => true,
            Self::Validation(_)
            | Self::ModelNotFound { .. }
            | Self::Conflict(_)
            | Self::Serialization(_)
            | Self::Internal(_) => false,
        }
    }

    /// Stable reason label for status conditions and failure metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Kube(_) => "PlatformTransient",
            Self::Validation(_) => "InvalidSpec",
            Self::ModelNotFound { .. } => "ModelNotFound",
            Self::RegistryUnavailable(_) => "RegistryUnavailable",
            Self::NoFeasibleNode(_) => "Unschedulable",
            Self::Conflict(_) => "OwnedByOther",
            Self::Serialization(_) => "Serialization",
            Self::Timeout(_) => "Timeout",
            Self::Internal(_) => "Internal",
        }
    }
}
