//! Crate-wide error taxonomy.
//!
//! Mirrors the driver interface's error contract: every fallible operation returns a
//! [`PulseError`] that carries enough structure to reconstruct an [`ErrorInfo`] for
//! diagnostics, without the caller needing to downcast or string-match.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptors::Protocol;

/// Broad failure family for a driver error. Used for caller dispatch; `native_code` on
/// [`ErrorInfo`] carries the protocol-specific detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Success,
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionLost,
    AuthFailed,
    ProtocolError,
    FrameError,
    ChecksumError,
    UnsupportedFunction,
    InvalidAddress,
    DataFormat,
    DataOutOfRange,
    TypeMismatch,
    DeviceNotResponding,
    DeviceBusy,
    ResourceExhausted,
    InvalidParameter,
    ConfigurationError,
    Internal,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Default for ErrorCategory {
    fn default() -> Self {
        ErrorCategory::Success
    }
}

/// Structured error record attached to a driver, point, or operation.
///
/// Round-trips through JSON preserving `category`, `native_code`, `protocol`, and
/// `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub category: ErrorCategory,
    pub native_code: Option<i32>,
    pub protocol: Protocol,
    pub message: String,
    pub context: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl ErrorInfo {
    pub fn new(category: ErrorCategory, protocol: Protocol, message: impl Into<String>) -> Self {
        Self {
            category,
            native_code: None,
            protocol,
            message: message.into(),
            context: None,
            timestamp: Utc::now(),
            extra: HashMap::new(),
        }
    }

    pub fn with_native_code(mut self, code: i32) -> Self {
        self.native_code = Some(code);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn success(protocol: Protocol) -> Self {
        Self::new(ErrorCategory::Success, protocol, "ok")
    }
}

/// Crate-wide error enum. One variant per broad failure family; driver code builds
/// these with `?`, then the worker converts to [`ErrorInfo`] for statistics/last_error.
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timed out after {0}ms")]
    ConnectionTimeout(u64),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame error: {0}")]
    Frame(String),

    #[error("checksum mismatch: {0}")]
    Checksum(String),

    #[error("unsupported function: {0}")]
    UnsupportedFunction(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("data format error: {0}")]
    DataFormat(String),

    #[error("value out of range: {0}")]
    DataOutOfRange(String),

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("device not responding: {0}")]
    DeviceNotResponding(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("operation cancelled")]
    OperationCancelled,

    #[error("access denied: point is not writable")]
    AccessDenied,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, PulseError>;

impl PulseError {
    /// Maps this error onto the caller-facing category, matching the taxonomy in
    /// `ErrorInfo.category`.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PulseError::Configuration(_) => ErrorCategory::ConfigurationError,
            PulseError::ConnectionFailed(_) => ErrorCategory::ConnectionFailed,
            PulseError::ConnectionTimeout(_) => ErrorCategory::ConnectionTimeout,
            PulseError::ConnectionLost(_) => ErrorCategory::ConnectionLost,
            PulseError::AuthFailed(_) => ErrorCategory::AuthFailed,
            PulseError::Protocol(_) => ErrorCategory::ProtocolError,
            PulseError::Frame(_) => ErrorCategory::FrameError,
            PulseError::Checksum(_) => ErrorCategory::ChecksumError,
            PulseError::UnsupportedFunction(_) => ErrorCategory::UnsupportedFunction,
            PulseError::InvalidAddress(_) => ErrorCategory::InvalidAddress,
            PulseError::DataFormat(_) => ErrorCategory::DataFormat,
            PulseError::DataOutOfRange(_) => ErrorCategory::DataOutOfRange,
            PulseError::TypeMismatch { .. } => ErrorCategory::TypeMismatch,
            PulseError::DeviceNotResponding(_) => ErrorCategory::DeviceNotResponding,
            PulseError::DeviceBusy(_) => ErrorCategory::DeviceBusy,
            PulseError::ResourceExhausted(_) => ErrorCategory::ResourceExhausted,
            PulseError::InvalidParameter(_) => ErrorCategory::InvalidParameter,
            PulseError::OperationCancelled => ErrorCategory::Internal,
            PulseError::AccessDenied => ErrorCategory::InvalidParameter,
            PulseError::Io(_) => ErrorCategory::ConnectionFailed,
            PulseError::Internal(_) => ErrorCategory::Internal,
            PulseError::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    pub fn to_error_info(&self, protocol: Protocol) -> ErrorInfo {
        ErrorInfo::new(self.category(), protocol, self.to_string())
    }

    /// Transient failures the driver retries locally before surfacing to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PulseError::ConnectionTimeout(_)
                | PulseError::Checksum(_)
                | PulseError::ConnectionLost(_)
                | PulseError::DeviceBusy(_)
        )
    }

    /// Fatal failures that move the driver to `Error` and refuse further operations
    /// until re-initialized.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PulseError::Internal(_) | PulseError::ResourceExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_info_round_trips_through_json() {
        let info = ErrorInfo::new(ErrorCategory::InvalidAddress, Protocol::Modbus, "bad address")
            .with_native_code(2)
            .with_context("point 200");
        let json = serde_json::to_string(&info).unwrap();
        let back: ErrorInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.category, info.category);
        assert_eq!(back.native_code, info.native_code);
        assert_eq!(back.protocol, info.protocol);
        assert_eq!(back.message, info.message);
    }

    #[test]
    fn category_mapping_covers_transient_and_fatal() {
        assert!(PulseError::ConnectionTimeout(1000).is_transient());
        assert!(!PulseError::ConnectionTimeout(1000).is_fatal());
        assert!(PulseError::Internal("oops".into()).is_fatal());
        assert_eq!(
            PulseError::InvalidAddress("x".into()).category(),
            ErrorCategory::InvalidAddress
        );
    }

    #[test]
    fn success_error_info_has_success_category() {
        let info = ErrorInfo::success(Protocol::Mqtt);
        assert_eq!(info.category, ErrorCategory::Success);
    }
}
