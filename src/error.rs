//! Error types for Tesela operations.
//!
//! Provides rich error context for library consumers.

use std::fmt;

/// Main error type for Tesela operations.
///
/// Provides detailed context about failures including normalization-stats
/// mismatches across ensemble members, tile-coverage violations, and shape
/// mismatches between collaborators.
///
/// # Examples
///
/// ```
/// use tesela::error::TeselaError;
///
/// let err = TeselaError::CoverageViolation {
///     row: 3,
///     col: 7,
///     weight: 0.0,
/// };
/// assert!(err.to_string().contains("coverage"));
/// ```
#[derive(Debug)]
pub enum TeselaError {
    /// Two models in a pool were trained with different normalization statistics.
    StatsMismatch {
        /// Statistics of the first loaded model
        expected: String,
        /// Statistics of the offending model
        actual: String,
    },

    /// A model pool was constructed from zero checkpoints.
    EmptyEnsemble,

    /// A tile layout contains no tiles.
    EmptyTiling,

    /// A merger reduction was requested before any tensor was appended.
    EmptyMerge,

    /// Tensor shapes don't match for the operation.
    ShapeMismatch {
        /// Expected shape description
        expected: String,
        /// Actual shape found
        actual: String,
    },

    /// A pixel received zero (or negative) accumulated weight after all
    /// tiles were processed, violating the tiling coverage contract.
    CoverageViolation {
        /// Image row of the uncovered pixel
        row: usize,
        /// Image column of the uncovered pixel
        col: usize,
        /// Accumulated weight at that pixel
        weight: f32,
    },

    /// Invalid hyperparameter value provided.
    InvalidHyperparameter {
        /// Parameter name
        param: String,
        /// Provided value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// A model forward pass failed; aborts the in-flight image.
    Inference {
        /// Error details from the model backend
        message: String,
    },

    /// No result stored under the requested image name.
    UnknownImage {
        /// Image name used as store key
        name: String,
    },

    /// I/O error (file not found, permission denied, etc.).
    Io(std::io::Error),

    /// Serialization/deserialization error.
    Serialization(String),
}

impl fmt::Display for TeselaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeselaError::StatsMismatch { expected, actual } => {
                write!(
                    f,
                    "Normalization stats mismatch: pool was loaded with {expected}, got {actual}; \
                     only models trained on the same stats are allowed"
                )
            }
            TeselaError::EmptyEnsemble => {
                write!(f, "Empty ensemble: at least one model is required")
            }
            TeselaError::EmptyTiling => {
                write!(f, "Empty tiling: at least one tile is required")
            }
            TeselaError::EmptyMerge => {
                write!(f, "Empty merge: no tensors appended before reduction")
            }
            TeselaError::ShapeMismatch { expected, actual } => {
                write!(f, "Shape mismatch: expected {expected}, got {actual}")
            }
            TeselaError::CoverageViolation { row, col, weight } => {
                write!(
                    f,
                    "Tile coverage violation at pixel ({row}, {col}): accumulated weight = {weight}"
                )
            }
            TeselaError::InvalidHyperparameter {
                param,
                value,
                constraint,
            } => {
                write!(
                    f,
                    "Invalid hyperparameter: {param} = {value}, expected {constraint}"
                )
            }
            TeselaError::Inference { message } => write!(f, "Inference failure: {message}"),
            TeselaError::UnknownImage { name } => {
                write!(f, "No stored result for image '{name}'")
            }
            TeselaError::Io(e) => write!(f, "I/O error: {e}"),
            TeselaError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
        }
    }
}

impl std::error::Error for TeselaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TeselaError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TeselaError {
    fn from(err: std::io::Error) -> Self {
        TeselaError::Io(err)
    }
}

impl TeselaError {
    /// Create a shape mismatch error from two shape slices.
    #[must_use]
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    /// Create an inference error with descriptive context.
    #[must_use]
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
        }
    }
}

/// Convenience type alias for Results.
pub type Result<T> = std::result::Result<T, TeselaError>;
