//! Error types for the wavefront scheduler.

use thiserror::Error;

/// Main error type for scheduler, device and display operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Device memory could not be obtained
    #[error("Allocation of {size} bytes for '{label}' failed: device memory exhausted")]
    Allocation { label: String, size: usize },

    /// A device batch reported failure at synchronization
    #[error("Device failure: {0}")]
    DeviceFailure(String),

    /// Scheduler invariant does not hold (counters, compaction, slot ownership)
    #[error("Consistency violation: {0}")]
    Consistency(String),

    /// Graphics interop could not be used
    #[error("Graphics interop failed: {0}")]
    Interop(String),

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Buffer handle, size or layout does not match its use
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Create a consistency violation error.
    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    /// Create a device failure error.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceFailure(msg.into())
    }

    /// Create an invalid buffer error.
    pub fn buffer(msg: impl Into<String>) -> Self {
        Self::InvalidBuffer(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether this error aborts the current render pass without a usable device state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Allocation { .. } | Self::Consistency(_))
    }
}

/// Result type alias for wavefront operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::Allocation { label: "integrator_state_ray_P".into(), size: 4096 };
        assert!(e.to_string().contains("4096"));
        assert!(e.to_string().contains("integrator_state_ray_P"));

        let e = Error::consistency("compaction produced 3 paths, expected 4");
        assert!(e.to_string().contains("expected 4"));
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::consistency("x").is_fatal());
        assert!(Error::Allocation { label: "x".into(), size: 1 }.is_fatal());
        assert!(!Error::device("x").is_fatal());
        assert!(!Error::Interop("x".into()).is_fatal());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
