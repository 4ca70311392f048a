//! Error types for virtwatch
//!
//! Errors carry the object they concern so that log lines and queue retries
//! can be traced back to a node or VM without extra context.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for virtwatch operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// One or more mutations of a reconciliation cycle failed
    ///
    /// The remaining mutations of the cycle were still attempted.
    #[error(
        "reconciliation of node {node} partially failed: node patch failed: {node_patch_failed}, failed VMs: {failed_vms:?}"
    )]
    PartialFailure {
        /// Node whose cycle failed
        node: String,
        /// Whether the schedulable label patch failed
        node_patch_failed: bool,
        /// `namespace/name` of every VM whose failure patch was rejected
        failed_vms: Vec<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "queue", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
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
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Returns true if the API server rejected the request with a conflict
    ///
    /// Conflicts come from failed JSON patch `test` operations or stale
    /// resource versions; the next cycle re-reads the object.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 409 || ae.code == 422)
    }

    /// Returns true if the object no longer exists on the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Short machine-readable classification used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kube { .. } if self.is_conflict() => "conflict",
            Self::Kube { .. } if self.is_not_found() => "not_found",
            Self::Kube { .. } => "kube",
            Self::Serialization { .. } => "serialization",
            Self::PartialFailure { .. } => "partial_failure",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
