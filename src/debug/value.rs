//! Values compared at debug points

use candle_core::Tensor;
use std::fmt;

/// A reference or live value at a debug point
#[derive(Debug, Clone)]
pub enum DebugValue {
    /// Integer scalar (counters, indices)
    Integer(i64),
    /// Floating-point scalar
    Scalar(f64),
    /// Tensor of any rank, compared with the Frobenius norm
    Matrix(Tensor),
}

/// Kind tag of a [`DebugValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `DebugValue::Integer`
    Integer,
    /// `DebugValue::Scalar`
    Scalar,
    /// `DebugValue::Matrix`
    Matrix,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Integer => "integer",
            ValueKind::Scalar => "scalar",
            ValueKind::Matrix => "matrix",
        };
        f.write_str(name)
    }
}

impl DebugValue {
    /// Kind tag of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            DebugValue::Integer(_) => ValueKind::Integer,
            DebugValue::Scalar(_) => ValueKind::Scalar,
            DebugValue::Matrix(_) => ValueKind::Matrix,
        }
    }

    /// Shape of the value (empty for scalars)
    pub fn shape(&self) -> Vec<usize> {
        match self {
            DebugValue::Matrix(t) => t.dims().to_vec(),
            _ => Vec::new(),
        }
    }
}

impl From<f64> for DebugValue {
    fn from(v: f64) -> Self {
        DebugValue::Scalar(v)
    }
}

impl From<f32> for DebugValue {
    fn from(v: f32) -> Self {
        DebugValue::Scalar(v as f64)
    }
}

impl From<i64> for DebugValue {
    fn from(v: i64) -> Self {
        DebugValue::Integer(v)
    }
}

impl From<usize> for DebugValue {
    fn from(v: usize) -> Self {
        DebugValue::Integer(v as i64)
    }
}

impl From<Tensor> for DebugValue {
    fn from(t: Tensor) -> Self {
        DebugValue::Matrix(t)
    }
}

impl From<&Tensor> for DebugValue {
    fn from(t: &Tensor) -> Self {
        DebugValue::Matrix(t.clone())
    }
}
