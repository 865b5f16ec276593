//! Assertion collaborator used in `TestCase` debug mode

use candle_core::Tensor;

use crate::error::{NodeError, Result};
use crate::utils::tensor_utils::frobenius_distance;

/// External test-assertion interface
///
/// Injected into a node to turn debug points into hard test assertions.
/// Arguments are `(reference, live, precision)`. An `Err` is returned to
/// the caller of the operation that hit the debug point.
pub trait TestCase {
    /// Assert two scalars are within `precision` of each other
    fn assert_scalar_almost_equal(&self, reference: f64, live: f64, precision: f64) -> Result<()>;

    /// Assert two tensors are within `precision` in Frobenius norm
    fn assert_matrix_almost_equal(&self, reference: &Tensor, live: &Tensor, precision: f64) -> Result<()>;
}

/// Tolerance-based assertions
///
/// Fails with [`NodeError::AssertionFailed`] when the difference exceeds
/// the precision.
#[derive(Debug, Clone, Default)]
pub struct ToleranceAssertions {
    label: String,
}

impl ToleranceAssertions {
    /// Create assertions whose failures are tagged with `label`
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl TestCase for ToleranceAssertions {
    fn assert_scalar_almost_equal(&self, reference: f64, live: f64, precision: f64) -> Result<()> {
        let difference = (reference - live).abs();
        if difference > precision || difference.is_nan() {
            return Err(NodeError::AssertionFailed {
                name: self.label.clone(),
                difference,
                precision,
            });
        }
        Ok(())
    }

    fn assert_matrix_almost_equal(&self, reference: &Tensor, live: &Tensor, precision: f64) -> Result<()> {
        let difference = frobenius_distance(reference, live)?;
        if difference > precision || difference.is_nan() {
            return Err(NodeError::AssertionFailed {
                name: self.label.clone(),
                difference,
                precision,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_scalar_assertion() {
        let tc = ToleranceAssertions::new("x");
        assert!(tc.assert_scalar_almost_equal(1.0, 1.05, 0.1).is_ok());
        let err = tc.assert_scalar_almost_equal(1.0, 1.5, 0.1).unwrap_err();
        assert!(matches!(err, NodeError::AssertionFailed { .. }));
        assert!(tc.assert_scalar_almost_equal(1.0, f64::NAN, 0.1).is_err());
    }

    #[test]
    fn test_matrix_assertion() {
        let device = Device::Cpu;
        let tc = ToleranceAssertions::default();
        let a = Tensor::zeros((2, 2), DType::F64, &device).unwrap();
        let b = Tensor::ones((2, 2), DType::F64, &device).unwrap();
        // ||a - b||_F = 2
        assert!(tc.assert_matrix_almost_equal(&a, &b, 2.5).is_ok());
        assert!(tc.assert_matrix_almost_equal(&a, &b, 1.5).is_err());
    }
}
