//! Error types shared by the CSI driver and the approver
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information such as volume IDs and
//! underlying causes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for driver and approver operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The Pod identity could not be derived from the ServiceAccount token
    #[error("identity error: {message}")]
    Identity {
        /// Description of what's wrong with the token or its claims
        message: String,
    },

    /// Building or encoding the certificate signing request failed
    #[error("csr error: {message}")]
    Csr {
        /// Description of what failed
        message: String,
    },

    /// Volume store I/O error
    #[error("store error for volume {volume_id}: {message}")]
    Store {
        /// Volume the operation was acting on
        volume_id: String,
        /// Description of what failed
        message: String,
    },

    /// Signing-request lifecycle error (creation, await, denial)
    #[error("request error for volume {volume_id}: {message}")]
    Request {
        /// Volume the request belongs to
        volume_id: String,
        /// Description of what failed
        message: String,
        /// Whether the failure is terminal for this attempt (e.g. a Denied
        /// condition) rather than transient
        terminal: bool,
    },

    /// Invalid or missing configuration
    #[error("config error: {message}")]
    Config {
        /// Description of what's invalid or missing
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "camanager", "watcher")
        context: String,
    },
}

impl Error {
    /// Create an identity error with the given message
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity {
            message: msg.into(),
        }
    }

    /// Create a CSR error with the given message
    pub fn csr(msg: impl Into<String>) -> Self {
        Self::Csr {
            message: msg.into(),
        }
    }

    /// Create a store error for a specific volume
    pub fn store(volume_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            volume_id: volume_id.into(),
            message: msg.into(),
        }
    }

    /// Create a transient request error for a specific volume
    pub fn request(volume_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Request {
            volume_id: volume_id.into(),
            message: msg.into(),
            terminal: false,
        }
    }

    /// Create a terminal request error (e.g. the request was denied)
    pub fn request_terminal(volume_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Request {
            volume_id: volume_id.into(),
            message: msg.into(),
            terminal: true,
        }
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
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

    /// Check if this error is retryable
    ///
    /// Identity, CSR and config errors require a caller-side fix and are not
    /// retryable. Store and transient request errors are. Kubernetes errors
    /// depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout).
                // Don't retry on 4xx errors (validation, not found, etc.)
                // except 409 conflicts which resolve on refetch.
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Identity { .. } => false,
            Error::Csr { .. } => false,
            Error::Store { .. } => true,
            Error::Request { terminal, .. } => !terminal,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the volume ID if this error is associated with a specific volume
    pub fn volume_id(&self) -> Option<&str> {
        match self {
            Error::Store { volume_id, .. } => Some(volume_id),
            Error::Request { volume_id, .. } => Some(volume_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_errors_are_not_retryable() {
        let err = Error::identity("token has no kubernetes.io claim");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("identity error"));
        assert!(err.to_string().contains("kubernetes.io"));
    }

    #[test]
    fn store_errors_carry_the_volume_and_retry() {
        let err = Error::store("csi-123", "short write");
        assert!(err.is_retryable());
        assert_eq!(err.volume_id(), Some("csi-123"));
        assert!(err.to_string().contains("csi-123"));
    }

    #[test]
    fn denied_requests_are_terminal() {
        let denied = Error::request_terminal("csi-abc", "request was denied: bad identity");
        assert!(!denied.is_retryable());

        let transient = Error::request("csi-abc", "timed out waiting for signature");
        assert!(transient.is_retryable());
    }

    #[test]
    fn config_errors_require_operator_action() {
        let err = Error::config("no issuerRef configured");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("issuerRef"));
    }

    #[test]
    fn internal_errors_carry_context() {
        let err = Error::internal_with_context("camanager", "sweep failed");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[camanager]"));

        let err = Error::internal("unexpected");
        assert!(err.to_string().contains("[unknown]"));
    }
}
