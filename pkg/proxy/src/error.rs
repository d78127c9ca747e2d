//! Error taxonomy of the flow proxy core.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Address cannot be encoded into the 32-bit endpoint register.
    #[error("unsupported address family: {address}")]
    UnsupportedAddressFamily { address: String },

    /// Executor call did not complete within the configured bound.
    #[error("executor timed out after {timeout_ms}ms: {operation}")]
    ExecutorTimeout { operation: String, timeout_ms: u64 },

    /// Executor refused the mutation (e.g. table full).
    #[error("executor rejected {operation}: {reason}")]
    ExecutorRejected { operation: String, reason: String },

    /// Endpoints arrived for a Service the proxy has not seen.
    #[error("endpoints reference unknown service {key}")]
    InconsistentSnapshot { key: String },

    /// Object snapshot is unusable as delivered.
    #[error("invalid object {key}: {reason}")]
    InvalidObject { key: String, reason: String },
}

impl ProxyError {
    pub fn unsupported_address(address: impl Into<String>) -> Self {
        Self::UnsupportedAddressFamily {
            address: address.into(),
        }
    }

    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutorRejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Timeouts and rejections are retried; everything else is final for the object.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProxyError::ExecutorTimeout { .. } | ProxyError::ExecutorRejected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
