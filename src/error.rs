//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire application.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur between a caller and the instruments on the bench.
//!
//! ## Error Hierarchy
//!
//! - **`HardwareBusy`**: The command bridge could not accept or answer a command, either
//!   because its queue is saturated or because the owner task is gone. Nothing reached the
//!   hardware, so the caller may retry.
//! - **`Device`**: An instrument reported a fault or its transport failed. Never retried
//!   automatically; an active session moves to `Faulted`.
//! - **`Timeout`**: No answer within the configured bound. Sessions treat it exactly like
//!   `Device`.
//! - **`ConfigInvalid`**: A parameter violates an invariant. Raised before any hardware
//!   command is issued, so no state changes.
//! - **`Conflict`**: Two sessions tried to drive the same output, or a session that is
//!   already running was started again.
//! - **`Config`**, **`Io`**, **`Serialization`**: ambient failures while loading or
//!   persisting configuration.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! which keeps the `?` operator usable throughout the application.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors surfaced by the bridge, the sessions and the configuration layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    #[error("Hardware busy: {0}")]
    HardwareBusy(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DaqError {
    /// Whether this error moves an active session into its `Faulted` state.
    ///
    /// Timeouts count as device faults: after a timeout the state of the output is
    /// unknown, and the command must not be repeated silently.
    pub fn is_fault(&self) -> bool {
        matches!(self, DaqError::Device(_) | DaqError::Timeout(_))
    }

    /// Whether the caller may safely resubmit the same command.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DaqError::HardwareBusy(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(err.to_string())
    }
}

impl From<std::io::Error> for DaqError {
    fn from(err: std::io::Error) -> Self {
        DaqError::Io(err.to_string())
    }
}

impl From<toml::ser::Error> for DaqError {
    fn from(err: toml::ser::Error) -> Self {
        DaqError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DaqError {
    fn from(err: serde_json::Error) -> Self {
        DaqError::Serialization(err.to_string())
    }
}
