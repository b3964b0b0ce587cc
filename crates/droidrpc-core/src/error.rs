//! Error type shared by every layer of the crate.
//!
//! The engine boundary reports almost everything as a zero scalar, so most
//! variants carry the name of the operation that failed. Two classification
//! helpers tell callers what to do with an error:
//!
//! - [`RpcError::is_fatal`]: the engine library or one of its entry points is
//!   missing. This is a configuration or version mismatch and retrying will
//!   not help.
//! - [`RpcError::is_retryable`]: the device or its UI was not ready. Callers
//!   may retry or skip the step.

use std::ffi::NulError;
use std::path::PathBuf;

use thiserror::Error;

use crate::node::QueryKind;

/// Errors produced by the engine binding, sessions, devices and selectors.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The engine shared library could not be loaded.
    #[error("Failed to load engine library {}: {message}", path.display())]
    LibraryLoad {
        /// Path that was tried.
        path: PathBuf,
        /// Loader error message.
        message: String,
    },

    /// The engine does not export an expected entry point.
    #[error("Engine does not export entry point '{0}'")]
    Binding(String),

    /// An entry point was invoked with more arguments than the boundary supports.
    #[error("Entry point '{name}' called with {arity} arguments (max {max})")]
    Arity {
        /// Entry point name.
        name: String,
        /// Number of arguments supplied.
        arity: usize,
        /// Largest supported argument count.
        max: usize,
    },

    /// `openDevice` returned a zero handle.
    #[error("Engine rejected connection to {host}:{port}")]
    Rejected {
        /// Device host.
        host: String,
        /// Device port.
        port: u16,
    },

    /// The connection was accepted but the liveness check failed.
    #[error("Device {0} failed the liveness check")]
    NotAlive(String),

    /// An operation was attempted on a closed session.
    #[error("Operation attempted on a closed or invalid handle")]
    InvalidHandle,

    /// An entry point returned its failure scalar.
    #[error("{0} failed")]
    OperationFailed(&'static str),

    /// A selector refused a query predicate.
    #[error("Selector rejected {kind} query '{value}'")]
    QueryRejected {
        /// Predicate kind.
        kind: QueryKind,
        /// Serialized predicate value.
        value: String,
    },

    /// A foreign buffer did not hold valid text.
    #[error("Failed to decode engine buffer: {0}")]
    Decode(String),

    /// Text entry did not succeed within the retry budget.
    #[error("Text entry failed after {0} attempts")]
    RetriesExhausted(u32),

    /// A string argument could not be passed across the boundary.
    #[error("String argument contains an interior NUL byte")]
    InteriorNul(#[from] NulError),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Returns `true` for configuration problems that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::LibraryLoad { .. } | RpcError::Binding(_) | RpcError::Arity { .. }
        )
    }

    /// Returns `true` for environmental failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Rejected { .. }
                | RpcError::NotAlive(_)
                | RpcError::OperationFailed(_)
                | RpcError::RetriesExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::Binding("touchDown".to_string());
        assert!(err.to_string().contains("touchDown"));

        let err = RpcError::Rejected {
            host: "10.0.0.5".to_string(),
            port: 7101,
        };
        assert!(err.to_string().contains("10.0.0.5:7101"));

        let err = RpcError::OperationFailed("keyPress");
        assert_eq!(err.to_string(), "keyPress failed");

        let err = RpcError::QueryRejected {
            kind: QueryKind::ClassEquals,
            value: "android.widget.Button".to_string(),
        };
        assert!(err.to_string().contains("class-equals"));
        assert!(err.to_string().contains("android.widget.Button"));

        let err = RpcError::LibraryLoad {
            path: PathBuf::from("lib/libmytrpc.so"),
            message: "not found".to_string(),
        };
        assert!(err.to_string().contains("lib/libmytrpc.so"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RpcError::Binding("x".to_string()).is_fatal());
        assert!(RpcError::LibraryLoad {
            path: PathBuf::new(),
            message: String::new()
        }
        .is_fatal());
        assert!(!RpcError::OperationFailed("swipe").is_fatal());
        assert!(!RpcError::InvalidHandle.is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RpcError::Rejected {
            host: "h".to_string(),
            port: 1
        }
        .is_retryable());
        assert!(RpcError::NotAlive("h:1".to_string()).is_retryable());
        assert!(RpcError::OperationFailed("sendText").is_retryable());
        assert!(!RpcError::Binding("sendText".to_string()).is_retryable());
        assert!(!RpcError::InvalidHandle.is_retryable());
    }
}
