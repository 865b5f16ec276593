//! Error taxonomy for node operations
//!
//! Fatal conditions are returned as [`NodeError`]. Soft diagnostics
//! (condition-number warnings, precision reports) never become errors;
//! they are logged and recorded as reports instead.

use crate::debug::ValueKind;
use thiserror::Error;

/// Errors raised by nodes, the numeric kernel and the debug-point registry
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid dimension, unsupported dtype or lifecycle misuse
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The matrix has no inverse
    #[error("matrix {name} is singular")]
    SingularMatrix {
        /// Matrix name
        name: String,
    },

    /// `invert` was called on a non-square matrix
    #[error("matrix {name} is not square: {shape:?}")]
    NonSquare {
        /// Matrix name
        name: String,
        /// Actual shape
        shape: Vec<usize>,
    },

    /// A debug point and the live value are of different kinds
    #[error("{name} are not of the same type! (outside: {reference}, module: {live})")]
    TypeMismatch {
        /// Debug point name
        name: String,
        /// Kind of the stored reference
        reference: ValueKind,
        /// Kind of the live value
        live: ValueKind,
    },

    /// A debug point and the live value have different shapes
    #[error("{name} have not the same size! (outside: {reference:?}, module: {live:?})")]
    ShapeMismatch {
        /// Debug point name
        name: String,
        /// Shape of the stored reference
        reference: Vec<usize>,
        /// Shape of the live value
        live: Vec<usize>,
    },

    /// An injected test-case assertion failed
    #[error("{name} differs by {difference:e} (precision {precision:e})")]
    AssertionFailed {
        /// Label of the failed assertion
        name: String,
        /// Measured difference
        difference: f64,
        /// Accepted difference
        precision: f64,
    },

    /// `connect` was given a slot name that does not exist
    #[error("unknown handler slot: {0}")]
    UnknownHandler(String),

    /// Tensor backend failure
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl NodeError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error belongs to the configuration class
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, NodeError>;
