//! Custom error types for the centring engine.
//!
//! This module defines the primary error type, `DiffractometerError`, used by every
//! component of the engine. Using the `thiserror` crate, it provides a centralized
//! and consistent way to report failures, from configuration problems to motors that
//! never settle.
//!
//! ## Error Hierarchy
//!
//! - **`AlreadyCentring`**: `start` was rejected because a session is active. The active
//!   session is left untouched.
//! - **`UnknownCentringMethod`**: the requested variant is not registered. No session is
//!   created.
//! - **`DeviceTimeout`**: a readiness wait exceeded its bound. Device state is left as-is
//!   so the caller can inspect it.
//! - **`CalibrationUnavailable`**: the click-point resolver could not produce a target,
//!   usually because the pixel-per-millimetre scale is unknown.
//! - **`Procedure`**: any unexpected failure inside a centring task.
//! - **`Cancelled`**: a procedure was torn down at one of its suspension points.
//! - **`Motor`**: a motor driver reported an error while moving.
//! - **`Config`** / **`Configuration`**: load and validation errors for the
//!   configuration file.
//!
//! Errors raised inside background centring tasks never reach callers directly. The
//! actor funnels them into a `CentringFailed` event; only the synchronous entry points
//! return them.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, DiffractometerError>;

/// Errors produced by the centring engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiffractometerError {
    /// A centring session is already active.
    #[error("Already in centring method {0}")]
    AlreadyCentring(String),

    /// The requested centring method is not registered.
    #[error("Unknown centring method: {0}")]
    UnknownCentringMethod(String),

    /// The device did not become ready in time.
    #[error("Timeout waiting for device ready after {0} ms")]
    DeviceTimeout(u64),

    /// Calibration state is incomplete.
    #[error("Calibration unavailable: {0}")]
    CalibrationUnavailable(String),

    /// Unexpected failure inside a centring procedure.
    #[error("Centring procedure error: {0}")]
    Procedure(String),

    /// The procedure was cancelled at a suspension point.
    #[error("Centring procedure cancelled")]
    Cancelled,

    /// A motor driver failed.
    #[error("Motor '{motor}' error: {message}")]
    Motor {
        /// Logical motor name.
        motor: String,
        /// Driver error rendered with its context chain.
        message: String,
    },

    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration loaded but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The actor task is gone (shut down or panicked).
    #[error("Diffractometer actor is not running")]
    ActorUnavailable,
}

impl From<figment::Error> for DiffractometerError {
    fn from(err: figment::Error) -> Self {
        DiffractometerError::Config(err.to_string())
    }
}

impl DiffractometerError {
    /// Wraps a driver error for the named motor.
    pub fn motor(motor: impl Into<String>, err: &anyhow::Error) -> Self {
        DiffractometerError::Motor {
            motor: motor.into(),
            message: format!("{:#}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DiffractometerError::AlreadyCentring("Manual 3-click".to_string());
        assert_eq!(
            err.to_string(),
            "Already in centring method Manual 3-click"
        );
    }

    #[test]
    fn test_motor_error_keeps_context() {
        let source = anyhow::anyhow!("limit switch").context("move to 12.5 failed");
        let err = DiffractometerError::motor("phiz", &source);
        let rendered = err.to_string();
        assert!(rendered.contains("phiz"));
        assert!(rendered.contains("limit switch"));
    }

    #[test]
    fn test_timeout_mentions_bound() {
        let err = DiffractometerError::DeviceTimeout(15000);
        assert!(err.to_string().contains("15000"));
    }
}
