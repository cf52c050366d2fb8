//! Error types for the Kolosal NAS framework

use thiserror::Error;

/// Result type alias for Kolosal NAS operations
pub type Result<T> = std::result::Result<T, KolosalError>;

/// Main error type for the Kolosal NAS framework
#[derive(Error, Debug)]
pub enum KolosalError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("Invalid stride {stride} for {op}")]
    InvalidStride { op: String, stride: usize },

    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Node not found: {0}")]
    NodeNotFound(usize),

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Computation error: {0}")]
    ComputationError(String),
}

impl KolosalError {
    /// Shorthand for a shape mismatch between two NCHW shapes
    pub fn shape(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        KolosalError::ShapeError {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

impl From<serde_json::Error> for KolosalError {
    fn from(err: serde_json::Error) -> Self {
        KolosalError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for KolosalError {
    fn from(err: ndarray::ShapeError) -> Self {
        KolosalError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KolosalError::UnknownOperation("conv_9x9".to_string());
        assert_eq!(err.to_string(), "Unknown operation: conv_9x9");

        let err = KolosalError::InvalidStride { op: "FactorizedReduce".to_string(), stride: 3 };
        assert_eq!(err.to_string(), "Invalid stride 3 for FactorizedReduce");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KolosalError = io_err.into();
        assert!(matches!(err, KolosalError::IoError(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<Vec<usize>>("{").unwrap_err();
        let err: KolosalError = json_err.into();
        assert!(matches!(err, KolosalError::SerializationError(_)));
    }
}
