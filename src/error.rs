//! Error types for parley-ls.
//!
//! One enum per layer. Transport errors end the session; document and
//! provider errors are recovered locally and surface as JSON-RPC errors or
//! log entries.

use std::path::PathBuf;

use thiserror::Error;

use crate::rpc::protocol::{ErrorCode, ResponseError};
use crate::types::DocumentUri;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Fatal framing or channel failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The underlying channel failed.
    #[error("transport I/O failed")]
    Io(#[from] std::io::Error),

    /// A header block ended without a `Content-Length` field.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// The `Content-Length` value is not a number.
    #[error("invalid Content-Length value: {value}")]
    InvalidContentLength {
        /// The raw header value.
        value: String,
    },

    /// A frame announced more bytes than we are willing to buffer.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The peer disconnected in the middle of a frame.
    #[error("unexpected EOF while reading {context}")]
    UnexpectedEof {
        /// Which part of the frame was being read.
        context: &'static str,
    },
}

/// Errors raised by the document store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// The document was never opened or is already closed.
    #[error("document {uri} is not open")]
    NotOpen {
        /// Document URI.
        uri: DocumentUri,
    },

    /// `didOpen` for a URI that is already open.
    #[error("document {uri} is already open")]
    AlreadyOpen {
        /// Document URI.
        uri: DocumentUri,
    },

    /// A change declared a version other than `current + 1`.
    #[error("document {uri}: expected version {expected}, got {got}")]
    VersionMismatch {
        /// Document URI.
        uri: DocumentUri,
        /// The only acceptable version.
        expected: i32,
        /// The version the change declared.
        got: i32,
    },

    /// A range edit whose start lies after its end.
    #[error("document {uri}: range start is after range end")]
    InvalidRange {
        /// Document URI.
        uri: DocumentUri,
    },
}

impl From<DocumentError> for ResponseError {
    fn from(err: DocumentError) -> Self {
        let code = match err {
            DocumentError::InvalidRange { .. } => ErrorCode::InvalidParams,
            _ => ErrorCode::RequestFailed,
        };
        Self::with_message(code, err.to_string())
    }
}

/// Failures of a single feature or diagnostics provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider observed its cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,

    /// The provider did not finish within the liveness timeout.
    #[error("timed out after {millis} ms")]
    TimedOut {
        /// Elapsed budget.
        millis: u64,
    },

    /// The request parameters did not match what the provider expects.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// Description of the mismatch.
        message: String,
    },

    /// Any other provider failure.
    #[error("{message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },
}

impl ProviderError {
    /// Creates a generic failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Creates an invalid params failure.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }
}

impl From<ProviderError> for ResponseError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => Self::from_code(ErrorCode::RequestCancelled),
            ProviderError::InvalidParams { message } => {
                Self::with_message(ErrorCode::InvalidParams, message)
            }
            ProviderError::TimedOut { .. } | ProviderError::Failed { .. } => {
                Self::with_message(ErrorCode::RequestFailed, err.to_string())
            }
        }
    }
}

impl From<DocumentError> for ProviderError {
    fn from(err: DocumentError) -> Self {
        Self::failed(err.to_string())
    }
}

/// Invalid provider registrations, detected before the session starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two providers claim the same request method.
    #[error("method {method} is handled by both {existing} and {provider}")]
    DuplicateMethod {
        /// The contested method.
        method: String,
        /// Provider registered first.
        existing: String,
        /// Provider that tried to register second.
        provider: String,
    },

    /// A provider claims a method the session handles itself.
    #[error("method {method} is reserved by the session (provider {provider})")]
    ReservedMethod {
        /// The reserved method.
        method: String,
        /// The offending provider.
        provider: String,
    },
}

/// Failures of an outgoing server-to-client request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    /// The client answered with an error object.
    #[error("peer returned error {}: {}", .0.code, .0.message)]
    Response(ResponseError),

    /// The connection went away before the response arrived.
    #[error("connection closed before a response arrived")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/path/to/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn validation_error_display() {
        let error = ConfigError::ValidationError {
            message: "invalid setting".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("invalid setting"));
    }

    #[test]
    fn version_mismatch_maps_to_request_failed() {
        let err = DocumentError::VersionMismatch {
            uri: "file:///a.txt".to_string(),
            expected: 3,
            got: 5,
        };
        assert_eq!(err.to_string(), "document file:///a.txt: expected version 3, got 5");
        let rpc: ResponseError = err.into();
        assert_eq!(rpc.code, ErrorCode::RequestFailed.code());
    }

    #[test]
    fn provider_cancellation_maps_to_request_cancelled() {
        let rpc: ResponseError = ProviderError::Cancelled.into();
        assert_eq!(rpc.code, ErrorCode::RequestCancelled.code());
    }
}
