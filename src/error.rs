//! Error types for the se3-layers library
//!
//! Every operation validates shapes, widths and enum strings at entry and fails
//! before doing any arithmetic. Numeric degeneracies (zero angle, zero depth,
//! zero mask weight, zero moving-point count) are never reported here; they are
//! handled inside the operations with explicit branches and clamps.

use thiserror::Error;

/// Main result type used throughout the se3-layers library
pub type Se3Result<T> = Result<T, Se3Error>;

/// Main error type for the se3-layers library
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Se3Error {
    /// Batch, body, channel or spatial dimensions disagree between operands
    #[error("Shape mismatch in {op}: expected {expected}, got {actual}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        actual: String,
    },

    /// A motion parameter vector does not match its declared parameterization
    #[error("Invalid parameter width for {kind}: expected {expected}, got {actual}")]
    InvalidParameterWidth {
        kind: String,
        expected: usize,
        actual: usize,
    },

    /// A configuration string does not name a known variant
    #[error("Unknown {category} value: '{value}'")]
    UnknownEnumValue {
        category: &'static str,
        value: String,
    },

    /// An optional operand required by the selected mode was not supplied
    #[error("{op} requires input '{input}'")]
    MissingInput {
        op: &'static str,
        input: &'static str,
    },

    /// A layer was asked for gradients without a retained forward pass
    #[error("Backward called on {0} before forward")]
    MissingForwardContext(&'static str),

    /// Configuration values outside their valid range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Se3Error {
    /// Shorthand for a [`Se3Error::ShapeMismatch`] with displayable shapes.
    pub fn shape(
        op: &'static str,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Se3Error::ShapeMismatch {
            op,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Shorthand for a [`Se3Error::UnknownEnumValue`].
    pub fn unknown(category: &'static str, value: &str) -> Self {
        Se3Error::UnknownEnumValue {
            category,
            value: value.to_string(),
        }
    }
}

/// Fail with [`Se3Error::ShapeMismatch`] unless `expected == actual`.
pub(crate) fn ensure_len(op: &'static str, expected: usize, actual: usize) -> Se3Result<()> {
    if expected != actual {
        return Err(Se3Error::shape(
            op,
            format!("{expected} elements"),
            format!("{actual} elements"),
        ));
    }
    Ok(())
}
