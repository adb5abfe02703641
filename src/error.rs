//! Error types for the camera acquisition core.
//!
//! This module defines the primary error type, `CameraError`, for the entire
//! library. Using the `thiserror` crate, it provides a centralized and
//! machine-readable taxonomy for everything that can go wrong between a
//! client, the camera runtime and a device backend.
//!
//! ## Error Hierarchy
//!
//! `CameraError` consolidates three layers of failure:
//!
//! - **Parameter errors** (`NotFound`, `AccessDenied`, `TypeMismatch`,
//!   `OutOfRange`, `BusyRecording`): raised by the parameter layer before a
//!   value ever reaches a backend. A rejected write leaves the parameter at
//!   its previous value.
//! - **State-machine errors** (`NotRecording`, `AlreadyRecording`,
//!   `Unsupported`): raised by the camera runtime when an operation does not
//!   fit the current acquisition state or the device capabilities.
//! - **Device errors** (`Device`, `Timeout`, `EndOfStream`): reported by a
//!   backend. `EndOfStream` is the normal terminator of a readout drain and
//!   is treated as a completion by the acquisition driver, not a failure.
//!
//! Every variant carries enough context for diagnostics; the variant itself
//! is the machine-readable kind. Nothing in the core swallows an error.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type CamResult<T> = std::result::Result<T, CameraError>;

/// Error taxonomy of the acquisition core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    /// Unknown parameter or camera name.
    #[error("No such parameter or camera: {0}")]
    NotFound(String),

    /// The device does not advertise the required capability.
    #[error("Operation not supported by this camera: {0}")]
    Unsupported(String),

    /// Read of a write-only parameter or write of a read-only parameter.
    #[error("Access denied for parameter '{0}'")]
    AccessDenied(String),

    /// Value tag does not match the declared parameter type.
    #[error("Type mismatch for parameter '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        /// Parameter name.
        name: String,
        /// Declared value type.
        expected: &'static str,
        /// Type of the rejected value.
        actual: &'static str,
    },

    /// Value violates the declared range, step or choice set.
    #[error("Value for parameter '{name}' out of range: {message}")]
    OutOfRange {
        /// Parameter name.
        name: String,
        /// Description of the violated constraint.
        message: String,
    },

    /// Write of a non-live-writable parameter during acquisition.
    #[error("Parameter '{0}' is not writable while the camera is recording")]
    BusyRecording(String),

    /// Operation requires RECORDING (or READOUT) state.
    #[error("Camera is not recording")]
    NotRecording,

    /// `start_recording` while already in RECORDING state.
    #[error("Camera is already recording")]
    AlreadyRecording,

    /// Normal terminator of a readout drain; not a failure.
    #[error("End of stream")]
    EndOfStream,

    /// The device timeout elapsed before a frame arrived.
    #[error("Timed out waiting for a frame")]
    Timeout,

    /// Error reported by the device layer.
    #[error("Device error {code}: {message}")]
    Device {
        /// Backend-specific error code.
        code: i32,
        /// Backend diagnostic message.
        message: String,
    },

    /// Invariant violation inside the core.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CameraError {
    /// Whether a producer loop may carry on after this error.
    ///
    /// Timeouts are transient: a single late frame does not invalidate the
    /// acquisition. Everything else reported by a backend during production
    /// is fatal to the running producer.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::Timeout)
    }

    /// Shorthand for a device-layer error.
    pub fn device(code: i32, message: impl Into<String>) -> Self {
        CameraError::Device {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CameraError::device(-12, "link lost");
        assert_eq!(err.to_string(), "Device error -12: link lost");

        let err = CameraError::BusyRecording("roi_width".into());
        assert!(err.to_string().contains("roi_width"));
    }

    #[test]
    fn test_type_mismatch_display() {
        let err = CameraError::TypeMismatch {
            name: "exposure_time".into(),
            expected: "float",
            actual: "string",
        };
        assert_eq!(
            err.to_string(),
            "Type mismatch for parameter 'exposure_time': expected float, got string"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(CameraError::Timeout.is_transient());
        assert!(!CameraError::device(1, "dma stall").is_transient());
        assert!(!CameraError::EndOfStream.is_transient());
    }
}
