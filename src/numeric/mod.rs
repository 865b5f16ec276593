//! Matrix inversion with condition-number monitoring
//!
//! Training a readout usually means inverting a covariance-like matrix.
//! The kernel computes inverses and Moore-Penrose pseudo-inverses in `f64`
//! and, when the debug mode asks for it, audits the conditioning of the
//! input first:
//!
//! `condition_number = log10(s_max / s_min)`
//!
//! Above [`CONDITION_WARNING_THRESHOLD`] (14 decades, i.e. nearly every
//! significant digit of an IEEE double lost) a warning naming the matrix is
//! logged. The audit is side-channel only: it never changes the result and
//! never fails the operation.

use candle_core::Tensor;
use nalgebra::{DMatrix, SVD};
use std::fmt;
use tracing::{info, warn};

use crate::debug::DebugMode;
use crate::error::{NodeError, Result};
use crate::utils::tensor_utils::{all_finite, from_dmatrix, to_dmatrix};

/// Condition numbers above this many decades trigger a stability warning
pub const CONDITION_WARNING_THRESHOLD: f64 = 14.0;

const SVD_MAX_ITERATIONS: usize = 10_000;

/// Which inversion an audit was made for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inversion {
    /// Exact inverse of a square matrix
    Inverse,
    /// Moore-Penrose pseudo-inverse
    PseudoInverse,
}

impl fmt::Display for Inversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inversion::Inverse => f.write_str("inversing"),
            Inversion::PseudoInverse => f.write_str("pseudo-inversing"),
        }
    }
}

/// Conditioning audit of one matrix
#[derive(Debug, Clone)]
pub struct ConditionReport {
    /// Name the caller gave the matrix
    pub name: String,
    /// Operation the matrix was audited for
    pub operation: Inversion,
    /// `log10(s_max / s_min)`
    pub condition_number: f64,
    /// Whether the stability warning was emitted
    pub ill_conditioned: bool,
}

/// Singular values of a 2-D tensor, largest first
pub fn singular_values(m: &Tensor) -> Result<Vec<f64>> {
    let mut values = svd(to_dmatrix(m)?, false)
        .ok_or_else(|| NodeError::config("singular value decomposition did not converge"))?
        .singular_values
        .iter()
        .copied()
        .collect::<Vec<f64>>();
    values.sort_by(|a, b| b.total_cmp(a));
    Ok(values)
}

/// `log10(s_max / s_min)` of a 2-D tensor
///
/// Infinite for singular matrices, NaN for the zero matrix.
pub fn condition_number(m: &Tensor) -> Result<f64> {
    let s = singular_values(m)?;
    match (s.first(), s.last()) {
        (Some(max), Some(min)) => Ok((max / min).log10()),
        _ => Ok(f64::NAN),
    }
}

fn svd(m: DMatrix<f64>, vectors: bool) -> Option<SVD<f64, nalgebra::Dyn, nalgebra::Dyn>> {
    if m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    SVD::try_new(m, vectors, vectors, f64::EPSILON, SVD_MAX_ITERATIONS)
}

/// Inversion routines bound to a debug mode
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericKernel {
    mode: DebugMode,
}

impl NumericKernel {
    /// Create a kernel auditing according to `mode`
    pub fn new(mode: DebugMode) -> Self {
        Self { mode }
    }

    /// Debug mode in effect
    pub fn mode(&self) -> DebugMode {
        self.mode
    }

    /// Audit the conditioning of `m`
    ///
    /// Only runs in `Test` and `Output` mode. Never fails: when the singular
    /// values cannot be computed the audit is skipped with a warning.
    pub fn audit(&self, operation: Inversion, name: &str, m: &Tensor) -> Option<ConditionReport> {
        if !self.mode.audits_conditioning() {
            return None;
        }

        let condition_number = match condition_number(m) {
            Ok(c) => c,
            Err(e) => {
                warn!("DEBUG - WARNING : Cannot audit {} while {}: {}", name, operation, e);
                return None;
            }
        };

        if self.mode == DebugMode::Output {
            info!(
                "DEBUG - INFO : Condition number while {} {} : {}",
                operation, name, condition_number
            );
        }

        // NaN (zero matrix) counts as ill-conditioned
        let ill_conditioned = !(condition_number <= CONDITION_WARNING_THRESHOLD);
        if ill_conditioned {
            warn!(
                "DEBUG - WARNING : High condition number while {} {} : {}",
                operation, name, condition_number
            );
        }

        Some(ConditionReport {
            name: name.to_string(),
            operation,
            condition_number,
            ill_conditioned,
        })
    }

    /// Inverse of a square, non-singular matrix
    ///
    /// The result has the dtype and device of `m`.
    pub fn invert(&self, name: &str, m: &Tensor) -> Result<(Tensor, Option<ConditionReport>)> {
        let (rows, cols) = m.dims2()?;
        if rows != cols {
            return Err(NodeError::NonSquare {
                name: name.to_string(),
                shape: vec![rows, cols],
            });
        }

        let report = self.audit(Inversion::Inverse, name, m);

        let inverse = to_dmatrix(m)?
            .try_inverse()
            .ok_or_else(|| NodeError::SingularMatrix { name: name.to_string() })?;
        let inverse = from_dmatrix(&inverse, m.dtype(), m.device())?;
        if !all_finite(&inverse)? {
            return Err(NodeError::SingularMatrix { name: name.to_string() });
        }

        Ok((inverse, report))
    }

    /// Moore-Penrose pseudo-inverse of any 2-D matrix
    ///
    /// Singular values below `max(rows, cols) * eps * s_max` are treated as zero.
    pub fn pseudo_invert(&self, name: &str, m: &Tensor) -> Result<(Tensor, Option<ConditionReport>)> {
        let (rows, cols) = m.dims2()?;
        let report = self.audit(Inversion::PseudoInverse, name, m);

        let decomposition = svd(to_dmatrix(m)?, true)
            .ok_or_else(|| NodeError::SingularMatrix { name: name.to_string() })?;
        let s_max = decomposition.singular_values.iter().copied().fold(0.0, f64::max);
        let tolerance = rows.max(cols) as f64 * f64::EPSILON * s_max;
        let pinv = decomposition
            .pseudo_inverse(tolerance)
            .map_err(|e| NodeError::config(format!("pseudo-inverse of {}: {}", name, e)))?;

        Ok((from_dmatrix(&pinv, m.dtype(), m.device())?, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> Tensor {
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    fn assert_close(a: &Tensor, b: &Tensor, tol: f64) {
        let a = a.to_dtype(DType::F64).unwrap().flatten_all().unwrap().to_vec1::<f64>().unwrap();
        let b = b.to_dtype(DType::F64).unwrap().flatten_all().unwrap().to_vec1::<f64>().unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_invert_gives_identity() {
        let m = matrix(3, 3, vec![4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let (inv, report) = NumericKernel::default().invert("m", &m).unwrap();
        assert!(report.is_none());
        let eye = Tensor::eye(3, DType::F64, &Device::Cpu).unwrap();
        assert_close(&m.matmul(&inv).unwrap(), &eye, 1e-10);
    }

    #[test]
    fn test_invert_keeps_dtype() {
        let m = matrix(2, 2, vec![2.0, 0.0, 0.0, 4.0]).to_dtype(DType::F32).unwrap();
        let (inv, _) = NumericKernel::default().invert("m", &m).unwrap();
        assert_eq!(inv.dtype(), DType::F32);
        assert_eq!(inv.to_vec2::<f32>().unwrap(), vec![vec![0.5, 0.0], vec![0.0, 0.25]]);
    }

    #[test]
    fn test_invert_singular() {
        let m = matrix(2, 2, vec![1.0, 2.0, 2.0, 4.0]);
        let err = NumericKernel::default().invert("cov", &m).unwrap_err();
        assert!(matches!(err, NodeError::SingularMatrix { ref name } if name == "cov"));
    }

    #[test]
    fn test_invert_non_square() {
        let m = matrix(2, 3, vec![1.0; 6]);
        let err = NumericKernel::default().invert("m", &m).unwrap_err();
        assert!(matches!(err, NodeError::NonSquare { .. }));
    }

    #[test]
    fn test_pseudo_inverse_rank_deficient() {
        // rank 1, 3x2
        let a = matrix(3, 2, vec![1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        let (p, _) = NumericKernel::default().pseudo_invert("a", &a).unwrap();
        assert_eq!(p.dims2().unwrap(), (2, 3));

        // Moore-Penrose conditions
        let apa = a.matmul(&p).unwrap().matmul(&a).unwrap();
        assert_close(&apa, &a, 1e-9);
        let pap = p.matmul(&a).unwrap().matmul(&p).unwrap();
        assert_close(&pap, &p, 1e-9);
        let ap = a.matmul(&p).unwrap();
        assert_close(&ap, &ap.t().unwrap(), 1e-9);
        let pa = p.matmul(&a).unwrap();
        assert_close(&pa, &pa.t().unwrap(), 1e-9);
    }

    #[test]
    fn test_condition_number_from_known_singular_values() {
        let m = matrix(3, 3, vec![100.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 0.01]);
        let s = singular_values(&m).unwrap();
        assert!((s[0] - 100.0).abs() < 1e-9);
        assert!((s[2] - 0.01).abs() < 1e-12);
        assert!((condition_number(&m).unwrap() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_audit_only_in_test_and_output() {
        let m = matrix(2, 2, vec![1.0, 0.0, 0.0, 1e-3]);
        assert!(NumericKernel::new(DebugMode::Off).audit(Inversion::Inverse, "m", &m).is_none());
        assert!(NumericKernel::new(DebugMode::TestCase).audit(Inversion::Inverse, "m", &m).is_none());

        let report = NumericKernel::new(DebugMode::Test)
            .audit(Inversion::Inverse, "m", &m)
            .unwrap();
        assert!((report.condition_number - 3.0).abs() < 1e-9);
        assert!(!report.ill_conditioned);
    }

    #[test]
    fn test_warning_threshold() {
        let kernel = NumericKernel::new(DebugMode::Output);
        // log10(1 / 1e-15) = 15
        let bad = matrix(2, 2, vec![1.0, 0.0, 0.0, 1e-15]);
        let (_, report) = kernel.invert("bad", &bad).unwrap();
        let report = report.unwrap();
        assert!(report.ill_conditioned);
        assert!(report.condition_number > CONDITION_WARNING_THRESHOLD);

        // log10(1 / 1e-13) = 13
        let ok = matrix(2, 2, vec![1.0, 0.0, 0.0, 1e-13]);
        let (_, report) = kernel.pseudo_invert("ok", &ok).unwrap();
        let report = report.unwrap();
        assert!((report.condition_number - 13.0).abs() < 1e-6);
        assert!(!report.ill_conditioned);
        assert_eq!(report.operation, Inversion::PseudoInverse);
    }

    #[test]
    fn test_audit_does_not_change_result() {
        let m = matrix(2, 2, vec![3.0, 1.0, 1.0, 2.0]);
        let (quiet, _) = NumericKernel::new(DebugMode::Off).invert("m", &m).unwrap();
        let (loud, _) = NumericKernel::new(DebugMode::Output).invert("m", &m).unwrap();
        assert_close(&quiet, &loud, f64::EPSILON);
    }
}
