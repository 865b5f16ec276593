//! Ridge-regression readout
//!
//! While training, every forward call accumulates `XᵀX` and `XᵀY` from the
//! batch inputs and targets. `finalize` solves
//!
//! ```text
//! w_out = (XᵀX + λI)⁻¹ XᵀY
//! ```
//!
//! through the node's numeric kernel, falling back to the pseudo-inverse
//! when `λ = 0`. Inference then computes `X · w_out`.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Batch, Lifecycle, Node, NodeCore, NodeOptions};
use crate::error::{NodeError, Result};
use crate::utils::tensor_utils::append_bias_column;

/// Readout dtypes; half precision is too coarse for the normal equations
const RIDGE_DTYPES: &[DType] = &[DType::F32, DType::F64];

/// Ridge readout parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RidgeParams {
    /// Regularisation `λ`; zero selects the pseudo-inverse
    pub ridge_param: f64,
    /// Append a constant input column
    pub with_bias: bool,
}

impl Default for RidgeParams {
    fn default() -> Self {
        Self {
            ridge_param: 0.0,
            with_bias: true,
        }
    }
}

/// Trainable linear readout
#[derive(Debug)]
pub struct RidgeReadout {
    core: NodeCore,
    params: RidgeParams,
    xtx: Option<Tensor>,
    xty: Option<Tensor>,
    w_out: Option<Tensor>,
    samples_seen: usize,
}

impl RidgeReadout {
    /// Create an uninitialized readout
    pub fn new(options: NodeOptions, params: RidgeParams) -> Result<Self> {
        if !(params.ridge_param >= 0.0) {
            return Err(NodeError::config(format!(
                "ridge_param must be non-negative, got {}",
                params.ridge_param
            )));
        }
        Ok(Self {
            core: NodeCore::new(&options, RIDGE_DTYPES)?,
            params,
            xtx: None,
            xty: None,
            w_out: None,
            samples_seen: 0,
        })
    }

    /// Parameters
    pub fn params(&self) -> &RidgeParams {
        &self.params
    }

    /// Learned weights `(input_dim [+1], output_dim)`
    pub fn weights(&self) -> Option<&Tensor> {
        self.w_out.as_ref()
    }

    /// Rows accumulated since the last initialize or reset
    pub fn samples_seen(&self) -> usize {
        self.samples_seen
    }

    fn feature_dim(&self) -> usize {
        self.core.input_dim() + usize::from(self.params.with_bias)
    }

    fn design_matrix(&self, inputs: &Tensor) -> Result<Tensor> {
        let (b, t, d) = inputs.dims3()?;
        let x = inputs.reshape((b * t, d))?;
        if self.params.with_bias {
            Ok(append_bias_column(&x)?)
        } else {
            Ok(x)
        }
    }

    fn clear_statistics(&mut self) -> Result<()> {
        let (d, out) = (self.feature_dim(), self.core.output_dim());
        let (dtype, device) = (self.core.dtype(), self.core.device().clone());
        self.xtx = Some(Tensor::zeros((d, d), dtype, &device)?);
        self.xty = Some(Tensor::zeros((d, out), dtype, &device)?);
        self.samples_seen = 0;
        Ok(())
    }

    fn accumulate(&mut self, x: &Tensor, targets: Option<&Tensor>) -> Result<()> {
        let targets = targets.ok_or_else(|| {
            NodeError::config("training forward requires targets")
        })?;
        let y = self
            .core
            .prepare("targets", targets, self.core.output_dim())?;
        let (b, t, out) = y.dims3()?;
        if b * t != x.dim(0)? {
            return Err(NodeError::config(format!(
                "targets cover {} rows, inputs {}",
                b * t,
                x.dim(0)?
            )));
        }
        let y = y.reshape((b * t, out))?;

        let xt = x.t()?;
        let (xtx, xty) = match (&self.xtx, &self.xty) {
            (Some(xtx), Some(xty)) => ((xtx + xt.matmul(x)?)?, (xty + xt.matmul(&y)?)?),
            _ => return Err(NodeError::config("readout statistics missing")),
        };
        self.xtx = Some(xtx);
        self.xty = Some(xty);
        self.samples_seen += b * t;
        Ok(())
    }
}

impl Node for RidgeReadout {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn initialize(&mut self) -> Result<()> {
        self.clear_statistics()?;
        self.w_out = Some(Tensor::zeros(
            (self.feature_dim(), self.core.output_dim()),
            self.core.dtype(),
            self.core.device(),
        )?);
        self.core.mark_initialized();
        Ok(())
    }

    fn forward(&mut self, batch: &Batch) -> Result<Tensor> {
        self.core.ensure_initialized("forward")?;
        let inputs = self
            .core
            .prepare("inputs", &batch.inputs, self.core.input_dim())?;
        let (b, t, _) = inputs.dims3()?;
        let x = self.design_matrix(&inputs)?;

        if self.core.is_accumulating() {
            self.accumulate(&x, batch.targets.as_ref())?;
        }

        let w_out = self
            .w_out
            .as_ref()
            .ok_or_else(|| NodeError::config("readout weights missing"))?;
        let y = x.matmul(w_out)?.reshape((b, t, self.core.output_dim()))?;
        self.core.check_debug_point("outputs", &y)?;
        Ok(y)
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.ensure_initialized("finalize")?;
        if self.core.lifecycle() == Lifecycle::Finalized {
            debug!("readout already finalized");
            return Ok(());
        }
        if self.samples_seen == 0 {
            return Err(NodeError::config("finalize without training data"));
        }
        let (xtx, xty) = match (self.xtx.clone(), self.xty.clone()) {
            (Some(xtx), Some(xty)) => (xtx, xty),
            _ => return Err(NodeError::config("readout statistics missing")),
        };

        self.core.check_debug_point("xTx", &xtx)?;
        self.core.check_debug_point("xTy", &xty)?;

        let inverse = if self.params.ridge_param > 0.0 {
            let d = xtx.dim(0)?;
            let eye = Tensor::eye(d, xtx.dtype(), xtx.device())?;
            let regularised = (xtx + (eye * self.params.ridge_param)?)?;
            self.core.inverse("xTx", &regularised)?
        } else {
            self.core.pinverse("xTx", &xtx)?
        };
        let w_out = inverse.matmul(&xty)?;

        self.core.check_debug_point("w_out", &w_out)?;
        info!(
            "ridge readout trained on {} rows ({} -> {})",
            self.samples_seen,
            self.feature_dim(),
            self.core.output_dim()
        );
        self.w_out = Some(w_out);
        self.core.mark_finalized();
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        if self.core.lifecycle() != Lifecycle::Constructed {
            self.clear_statistics()?;
        }
        self.core.reenter_training();
        Ok(())
    }

    fn is_trainable(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!(
            "RidgeReadout(input_dim={}, output_dim={}, ridge_param={}, with_bias={}, dtype={})",
            self.core.input_dim(),
            self.core.output_dim(),
            self.params.ridge_param,
            self.params.with_bias,
            self.core.dtype().as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::DebugMode;
    use candle_core::Device;

    /// y = 2 x0 - x1 + 0.5 over a small grid
    fn linear_data() -> (Tensor, Tensor) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..5 {
            for j in 0..4 {
                let (a, b) = (i as f64 * 0.5, j as f64 - 1.5);
                x.extend([a, b]);
                y.push(2.0 * a - b + 0.5);
            }
        }
        let x = Tensor::from_vec(x, (2, 10, 2), &Device::Cpu).unwrap();
        let y = Tensor::from_vec(y, (2, 10, 1), &Device::Cpu).unwrap();
        (x, y)
    }

    fn readout(ridge_param: f64) -> RidgeReadout {
        let options = NodeOptions::new(2, 1).dtype(DType::F64);
        RidgeReadout::new(options, RidgeParams { ridge_param, with_bias: true }).unwrap()
    }

    fn max_error(a: &Tensor, b: &Tensor) -> f64 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f64>()
            .unwrap()
    }

    #[test]
    fn test_recovers_linear_map_with_pinv() {
        let (x, y) = linear_data();
        let mut node = readout(0.0);
        node.initialize().unwrap();
        node.forward(&Batch::with_targets(x.clone(), y.clone())).unwrap();
        node.finalize().unwrap();

        let w: Vec<Vec<f64>> = node.weights().unwrap().to_vec2().unwrap();
        assert!((w[0][0] - 2.0).abs() < 1e-9);
        assert!((w[1][0] + 1.0).abs() < 1e-9);
        assert!((w[2][0] - 0.5).abs() < 1e-9);

        let pred = node.forward(&x.into()).unwrap();
        assert!(max_error(&pred, &y) < 1e-9);
    }

    #[test]
    fn test_recovers_linear_map_with_ridge() {
        let (x, y) = linear_data();
        let mut node = readout(1e-8);
        node.initialize().unwrap();
        node.forward(&Batch::with_targets(x.clone(), y.clone())).unwrap();
        node.finalize().unwrap();
        let pred = node.forward(&x.into()).unwrap();
        assert!(max_error(&pred, &y) < 1e-5);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let (x, y) = linear_data();
        let mut node = readout(0.0);
        node.initialize().unwrap();
        node.forward(&Batch::with_targets(x.clone(), y.clone())).unwrap();
        node.finalize().unwrap();
        let first: Vec<Vec<f64>> = node.weights().unwrap().to_vec2().unwrap();

        node.finalize().unwrap();
        let second: Vec<Vec<f64>> = node.weights().unwrap().to_vec2().unwrap();
        assert_eq!(first, second);

        // inference after finalize does not accumulate
        node.forward(&Batch::with_targets(x, y)).unwrap();
        assert_eq!(node.samples_seen(), 20);
    }

    #[test]
    fn test_training_requires_targets() {
        let (x, _) = linear_data();
        let mut node = readout(0.0);
        node.initialize().unwrap();
        assert!(node.forward(&x.clone().into()).unwrap_err().is_configuration());

        node.set_training(false);
        assert_eq!(node.forward(&x.into()).unwrap().dims3().unwrap(), (2, 10, 1));
        assert_eq!(node.samples_seen(), 0);
    }

    #[test]
    fn test_finalize_without_data() {
        let mut node = readout(0.0);
        assert!(node.finalize().unwrap_err().is_configuration());
        node.initialize().unwrap();
        assert!(node.finalize().unwrap_err().is_configuration());
    }

    #[test]
    fn test_reset_discards_statistics() {
        let (x, y) = linear_data();
        let mut node = readout(0.0);
        node.initialize().unwrap();
        node.forward(&Batch::with_targets(x.clone(), y.clone())).unwrap();
        node.finalize().unwrap();

        node.reset().unwrap();
        assert_eq!(node.lifecycle(), Lifecycle::Initialized);
        assert!(node.is_training());
        assert_eq!(node.samples_seen(), 0);

        node.forward(&Batch::with_targets(x, y)).unwrap();
        assert_eq!(node.samples_seen(), 20);
    }

    #[test]
    fn test_singular_without_ridge_uses_pinv() {
        // duplicated feature makes XᵀX singular
        let x = Tensor::new(&[[[1.0f64, 1.0], [2.0, 2.0], [3.0, 3.0]]], &Device::Cpu).unwrap();
        let y = Tensor::new(&[[[2.0f64], [4.0], [6.0]]], &Device::Cpu).unwrap();
        let options = NodeOptions::new(2, 1).dtype(DType::F64);
        let mut node = RidgeReadout::new(options, RidgeParams { ridge_param: 0.0, with_bias: false }).unwrap();
        node.initialize().unwrap();
        node.forward(&Batch::with_targets(x.clone(), y.clone())).unwrap();
        node.finalize().unwrap();

        let w: Vec<Vec<f64>> = node.weights().unwrap().to_vec2().unwrap();
        assert!((w[0][0] - 1.0).abs() < 1e-9);
        assert!((w[1][0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_condition_reports_in_output_mode() {
        let (x, y) = linear_data();
        let options = NodeOptions::new(2, 1).dtype(DType::F64).debug_mode(DebugMode::Output);
        let mut node = RidgeReadout::new(options, RidgeParams::default()).unwrap();
        node.initialize().unwrap();
        node.forward(&Batch::with_targets(x, y)).unwrap();
        node.finalize().unwrap();

        let reports = node.condition_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "xTx");
        assert!(!reports[0].ill_conditioned);
    }

    #[test]
    fn test_debug_format() {
        let text = format!("{:?}", readout(0.5));
        assert!(text.starts_with("RidgeReadout"));
        assert!(text.contains("ridge_param: 0.5"));
    }

    #[test]
    fn test_half_precision_rejected() {
        let options = NodeOptions::new(2, 1).dtype(DType::F16);
        assert!(RidgeReadout::new(options, RidgeParams::default()).unwrap_err().is_configuration());
        assert!(readout(0.0).is_trainable());
        assert!(RidgeReadout::new(NodeOptions::new(2, 1), RidgeParams { ridge_param: -1.0, with_bias: true })
            .unwrap_err()
            .is_configuration());
    }
}
