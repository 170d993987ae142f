//! Error type shared by every fallible operation in the crate.
use thiserror::Error;

/// Everything that can go wrong when building dotprops, loading a scoring matrix,
/// or scoring neurons against each other.
///
/// All of these are deterministic consequences of the input:
/// retrying with the same arguments will fail in the same way.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NblastError {
    /// A parameter (e.g. neighborhood size, dimensionality, thread count) is out of range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Too few points to define a tangent.
    #[error("Insufficient points: need at least {needed}, got {got}")]
    InsufficientPoints { needed: usize, got: usize },

    /// One side of a comparison has no points.
    #[error("Cannot score an empty dotprops")]
    EmptyDotprops,

    /// The lookup table is malformed.
    #[error("Invalid scoring matrix: {0}")]
    InvalidScoringMatrix(String),

    /// Two inputs disagree on their shape.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The caller cancelled a batch job before it finished.
    #[error("Operation was cancelled")]
    Cancelled,
}

impl NblastError {
    pub(crate) fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub(crate) fn invalid_smat(msg: impl Into<String>) -> Self {
        Self::InvalidScoringMatrix(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, NblastError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let e = NblastError::InsufficientPoints { needed: 2, got: 1 };
        assert!(e.to_string().contains("at least 2"));

        let e = NblastError::DimensionMismatch {
            expected: 3,
            got: 2,
        };
        assert_eq!(e.to_string(), "Dimension mismatch: expected 3, got 2");
    }
}
