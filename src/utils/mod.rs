//! Utility functions and helpers
//!
//! This module provides common utilities used across the crate.

/// Tensor utilities
pub mod tensor_utils {
    use candle_core::{DType, Device, Result, Tensor};
    use nalgebra::DMatrix;

    /// Copy a 2-D tensor into an `f64` nalgebra matrix
    ///
    /// Any float dtype is accepted; values are widened to `f64` first.
    pub fn to_dmatrix(m: &Tensor) -> Result<DMatrix<f64>> {
        let (rows, cols) = m.dims2()?;
        let flat: Vec<f64> = m.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        Ok(DMatrix::from_row_slice(rows, cols, &flat))
    }

    /// Build a tensor of the given dtype from an nalgebra matrix
    pub fn from_dmatrix(m: &DMatrix<f64>, dtype: DType, device: &Device) -> Result<Tensor> {
        // nalgebra is column-major, so the transpose's storage is our row-major layout
        let row_major: Vec<f64> = m.transpose().as_slice().to_vec();
        Tensor::from_vec(row_major, (m.nrows(), m.ncols()), device)?.to_dtype(dtype)
    }

    /// Frobenius norm of `a - b`, computed in `f64`
    ///
    /// Works for tensors of any rank; shapes must match.
    pub fn frobenius_distance(a: &Tensor, b: &Tensor) -> Result<f64> {
        let a = a.to_dtype(DType::F64)?;
        let b = b.to_dtype(DType::F64)?;
        (a - b)?.sqr()?.sum_all()?.sqrt()?.to_scalar::<f64>()
    }

    /// Append a column of ones to a `(n, d)` matrix, giving `(n, d + 1)`
    pub fn append_bias_column(x: &Tensor) -> Result<Tensor> {
        let (n, _) = x.dims2()?;
        let ones = Tensor::ones((n, 1), x.dtype(), x.device())?;
        Tensor::cat(&[x, &ones], 1)
    }

    /// Whether every element of the tensor is finite
    pub fn all_finite(m: &Tensor) -> Result<bool> {
        let flat: Vec<f64> = m.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        Ok(flat.iter().all(|v| v.is_finite()))
    }

}
