//! Leaky echo-state cell
//!
//! Each timestep computes
//!
//! ```text
//! x(t) = (1 - a) x(t-1) + a tanh(W_in u(t) + W x(t-1) + b)
//! ```
//!
//! then passes `x(t)` through the `neural-filter` handler, if one is bound.
//! The update runs inside a [`HookChain`], so every [`UpdateHooks`] point
//! applies around it.

use candle_core::{Device, Tensor};
use candle_nn::{Linear, Module};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Batch, Node, NodeCore, NodeOptions, DEFAULT_SUPPORTED_DTYPES};
use crate::error::{NodeError, Result};
use crate::hooks::{HookChain, IdentityHooks, UpdateHooks};

/// Echo-state parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EsnParams {
    /// Leak rate `a` in `(0, 1]`
    pub leaky_rate: f64,
    /// Range of the input weights
    pub input_scale: f64,
    /// Range of the recurrent weights, divided by `sqrt(reservoir_dim)`
    pub weight_scale: f64,
    /// Range of the bias
    pub bias_scale: f64,
    /// Seed for generated weights
    pub seed: u64,
    /// Start every sample from a zero state
    pub reset_state: bool,
}

impl Default for EsnParams {
    fn default() -> Self {
        Self {
            leaky_rate: 1.0,
            input_scale: 1.0,
            weight_scale: 0.9,
            bias_scale: 0.0,
            seed: 42,
            reset_state: true,
        }
    }
}

/// Reservoir weights in `f64`
#[derive(Debug, Clone)]
pub struct EsnWeights {
    /// Input weights `(reservoir_dim, input_dim)`
    pub w_in: Tensor,
    /// Recurrent weights `(reservoir_dim, reservoir_dim)`
    pub w: Tensor,
    /// Bias `(reservoir_dim,)`
    pub w_bias: Tensor,
}

impl EsnWeights {
    /// Draw uniform weights from a seeded generator
    pub fn random(input_dim: usize, reservoir_dim: usize, params: &EsnParams) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut uniform = |n: usize, scale: f64| -> Vec<f64> {
            (0..n).map(|_| rng.gen_range(-1.0..1.0) * scale).collect()
        };

        let recurrent_scale = params.weight_scale / (reservoir_dim as f64).sqrt();
        let w_in = uniform(reservoir_dim * input_dim, params.input_scale);
        let w = uniform(reservoir_dim * reservoir_dim, recurrent_scale);
        let w_bias = uniform(reservoir_dim, params.bias_scale);

        Ok(Self {
            w_in: Tensor::from_vec(w_in, (reservoir_dim, input_dim), &Device::Cpu)?,
            w: Tensor::from_vec(w, (reservoir_dim, reservoir_dim), &Device::Cpu)?,
            w_bias: Tensor::from_vec(w_bias, reservoir_dim, &Device::Cpu)?,
        })
    }

    fn matches(&self, input_dim: usize, reservoir_dim: usize) -> bool {
        self.w_in.dims() == [reservoir_dim, input_dim]
            && self.w.dims() == [reservoir_dim, reservoir_dim]
            && self.w_bias.dims() == [reservoir_dim]
    }
}

#[derive(Debug)]
struct Layers {
    input: Linear,
    recurrent: Linear,
}

/// Echo-state cell; `output_dim` is the reservoir size
#[derive(Debug)]
pub struct EsnCell<H = IdentityHooks> {
    core: NodeCore,
    params: EsnParams,
    chain: HookChain<H>,
    weights: Option<EsnWeights>,
    supplied: bool,
    layers: Option<Layers>,
    hidden: Option<Tensor>,
}

impl EsnCell<IdentityHooks> {
    /// Cell with identity hooks
    pub fn new(options: NodeOptions, params: EsnParams) -> Result<Self> {
        Self::with_hooks(options, params, IdentityHooks)
    }
}

impl<H: UpdateHooks> EsnCell<H> {
    /// Cell whose update runs through `hooks`
    pub fn with_hooks(options: NodeOptions, params: EsnParams, hooks: H) -> Result<Self> {
        if !(params.leaky_rate > 0.0 && params.leaky_rate <= 1.0) {
            return Err(NodeError::config(format!(
                "leaky_rate must be in (0, 1], got {}",
                params.leaky_rate
            )));
        }
        Ok(Self {
            core: NodeCore::new(&options, DEFAULT_SUPPORTED_DTYPES)?,
            params,
            chain: HookChain::new(hooks),
            weights: None,
            supplied: false,
            layers: None,
            hidden: None,
        })
    }

    /// Use fixed weights instead of generated ones
    pub fn with_weights(mut self, weights: EsnWeights) -> Result<Self> {
        if !weights.matches(self.core.input_dim(), self.core.output_dim()) {
            return Err(NodeError::config(format!(
                "weights do not fit input_dim={} reservoir_dim={}",
                self.core.input_dim(),
                self.core.output_dim()
            )));
        }
        self.weights = Some(weights);
        self.supplied = true;
        Ok(self)
    }

    /// Parameters
    pub fn params(&self) -> &EsnParams {
        &self.params
    }

    /// Weights in use, once generated or supplied
    pub fn weights(&self) -> Option<&EsnWeights> {
        self.weights.as_ref()
    }

    /// The hooks
    pub fn hooks(&self) -> &H {
        self.chain.hooks()
    }

    /// Last reservoir state `(1, reservoir_dim)`
    pub fn hidden(&self) -> Option<&Tensor> {
        self.hidden.as_ref()
    }

    /// Zero the reservoir state
    pub fn reset_hidden(&mut self) -> Result<()> {
        self.hidden = Some(self.zero_state()?);
        Ok(())
    }

    fn zero_state(&self) -> Result<Tensor> {
        Ok(Tensor::zeros(
            (1, self.core.output_dim()),
            self.core.dtype(),
            self.core.device(),
        )?)
    }

    fn cast(&self, t: &Tensor) -> Result<Tensor> {
        Ok(t.to_dtype(self.core.dtype())?.to_device(self.core.device())?)
    }
}

impl<H: UpdateHooks> Node for EsnCell<H> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn initialize(&mut self) -> Result<()> {
        let (input_dim, reservoir_dim) = (self.core.input_dim(), self.core.output_dim());
        let current = self
            .weights
            .as_ref()
            .filter(|w| w.matches(input_dim, reservoir_dim));

        let weights = match current {
            Some(w) => w.clone(),
            None if self.supplied => {
                return Err(NodeError::config(format!(
                    "supplied weights do not fit input_dim={} reservoir_dim={}",
                    input_dim, reservoir_dim
                )))
            }
            None => {
                debug!(
                    "generating reservoir weights {}x{} (seed {})",
                    reservoir_dim, input_dim, self.params.seed
                );
                EsnWeights::random(input_dim, reservoir_dim, &self.params)?
            }
        };

        self.core.check_debug_point("w_in", &weights.w_in)?;
        self.core.check_debug_point("w", &weights.w)?;
        self.core.check_debug_point("w_bias", &weights.w_bias)?;

        self.layers = Some(Layers {
            input: Linear::new(self.cast(&weights.w_in)?, Some(self.cast(&weights.w_bias)?)),
            recurrent: Linear::new(self.cast(&weights.w)?, None),
        });
        self.weights = Some(weights);
        self.hidden = Some(self.zero_state()?);
        self.core.mark_initialized();
        Ok(())
    }

    fn forward(&mut self, batch: &Batch) -> Result<Tensor> {
        self.core.ensure_initialized("forward")?;
        let inputs = self
            .core
            .prepare("inputs", &batch.inputs, self.core.input_dim())?;
        let layers = self
            .layers
            .as_ref()
            .ok_or_else(|| NodeError::config("reservoir layers missing"))?;

        let zero = self.zero_state()?;
        let mut hidden = match self.hidden.take() {
            Some(h) => h,
            None => zero.clone(),
        };
        let a = self.params.leaky_rate;
        let reset_state = self.params.reset_state;
        let handlers = self.core.handlers();

        let states = self.chain.run(&inputs, |ut, b, t| {
            if t == 0 && reset_state {
                hidden = zero.clone();
            }
            let pre = (layers.input.forward(ut)? + layers.recurrent.forward(&hidden)?)?;
            let x = ((&hidden * (1.0 - a))? + (pre.tanh()? * a)?)?;
            let x = handlers.filter(&x, ut, b, t)?;
            hidden = x.clone();
            Ok(x)
        });
        self.hidden = Some(hidden);
        let states = states?;

        self.core.check_debug_point("states", &states)?;
        Ok(states)
    }

    fn reset(&mut self) -> Result<()> {
        self.core.reenter_training();
        if self.layers.is_some() {
            self.reset_hidden()?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "EsnCell(input_dim={}, reservoir_dim={}, leaky_rate={}, dtype={})",
            self.core.input_dim(),
            self.core.output_dim(),
            self.params.leaky_rate,
            self.core.dtype().as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use crate::debug::DebugMode;
    use crate::hooks::HandlerSlot;
    use crate::node::Lifecycle;

    fn options(input_dim: usize, reservoir_dim: usize) -> NodeOptions {
        NodeOptions::new(input_dim, reservoir_dim).dtype(DType::F64)
    }

    fn fixed_weights() -> EsnWeights {
        let dev = Device::Cpu;
        EsnWeights {
            w_in: Tensor::new(&[[1.0f64], [0.5]], &dev).unwrap(),
            w: Tensor::new(&[[0.0f64, 0.0], [0.0, 0.0]], &dev).unwrap(),
            w_bias: Tensor::new(&[0.0f64, 0.0], &dev).unwrap(),
        }
    }

    #[test]
    fn test_generated_weights_are_seeded() {
        let params = EsnParams::default();
        let a = EsnWeights::random(3, 10, &params).unwrap();
        let b = EsnWeights::random(3, 10, &params).unwrap();
        assert_eq!(
            a.w.flatten_all().unwrap().to_vec1::<f64>().unwrap(),
            b.w.flatten_all().unwrap().to_vec1::<f64>().unwrap()
        );
        assert_eq!(a.w_in.dims(), &[10, 3]);
        assert_eq!(a.w_bias.dims(), &[10]);

        let bound = params.weight_scale / 10f64.sqrt();
        let w: Vec<f64> = a.w.flatten_all().unwrap().to_vec1().unwrap();
        assert!(w.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_forward_shape_and_range() {
        let mut cell = EsnCell::new(options(2, 8), EsnParams::default()).unwrap();
        cell.initialize().unwrap();
        let x = Tensor::randn(0.0f64, 1.0, (3, 5, 2), &Device::Cpu).unwrap();
        let states = cell.forward(&x.into()).unwrap();
        assert_eq!(states.dims3().unwrap(), (3, 5, 8));

        let v: Vec<f64> = states.flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|s| s.abs() <= 1.0));
        assert!(!cell.is_trainable());
    }

    #[test]
    fn test_known_update() {
        let params = EsnParams {
            leaky_rate: 0.5,
            ..Default::default()
        };
        let mut cell = EsnCell::new(options(1, 2), params)
            .unwrap()
            .with_weights(fixed_weights())
            .unwrap();
        cell.initialize().unwrap();

        let x = Tensor::new(&[[[1.0f64], [1.0]]], &Device::Cpu).unwrap();
        let states = cell.forward(&x.into()).unwrap();
        let s: Vec<Vec<f64>> = states.squeeze(0).unwrap().to_vec2().unwrap();

        let x0 = [0.5 * 1f64.tanh(), 0.5 * 0.5f64.tanh()];
        let x1 = [0.5 * x0[0] + 0.5 * 1f64.tanh(), 0.5 * x0[1] + 0.5 * 0.5f64.tanh()];
        for (got, want) in s[0].iter().zip(x0.iter()).chain(s[1].iter().zip(x1.iter())) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reset_state_per_sample() {
        let mut cell = EsnCell::new(options(1, 4), EsnParams::default()).unwrap();
        cell.initialize().unwrap();
        let x = Tensor::ones((2, 3, 1), DType::F64, &Device::Cpu).unwrap();
        let states = cell.forward(&x.into()).unwrap();
        let a: Vec<f64> = states.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f64> = states.get(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_neural_filter_applied() {
        let mut cell = EsnCell::new(options(1, 3), EsnParams::default()).unwrap();
        cell.connect(HandlerSlot::NeuralFilter, |s: &Tensor, _: &Tensor, _, _| Ok((s * 0.0)?));
        cell.initialize().unwrap();
        let x = Tensor::ones((1, 4, 1), DType::F64, &Device::Cpu).unwrap();
        let states = cell.forward(&x.into()).unwrap();
        let v: Vec<f64> = states.flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_supplied_weights_must_fit() {
        assert!(EsnCell::new(options(2, 2), EsnParams::default())
            .unwrap()
            .with_weights(fixed_weights())
            .unwrap_err()
            .is_configuration());

        let mut cell = EsnCell::new(options(1, 2), EsnParams::default())
            .unwrap()
            .with_weights(fixed_weights())
            .unwrap();
        cell.set_input_dim(3).unwrap();
        assert_eq!(cell.lifecycle(), Lifecycle::Constructed);
        assert!(cell.initialize().unwrap_err().is_configuration());
    }

    #[test]
    fn test_invalid_leaky_rate() {
        let params = EsnParams {
            leaky_rate: 0.0,
            ..Default::default()
        };
        assert!(EsnCell::new(options(1, 2), params).unwrap_err().is_configuration());
    }

    #[test]
    fn test_weight_debug_points() {
        let mut cell = EsnCell::new(options(1, 2).debug_mode(DebugMode::Test), EsnParams::default())
            .unwrap()
            .with_weights(fixed_weights())
            .unwrap();
        cell.set_debug_point("w_in", fixed_weights().w_in, 1e-12);
        cell.set_debug_point("w", Tensor::zeros((3, 3), DType::F64, &Device::Cpu).unwrap(), 1e-12);
        assert!(matches!(cell.initialize().unwrap_err(), NodeError::ShapeMismatch { .. }));
        assert_eq!(cell.debug_points().reports().len(), 1);
        assert!(cell.debug_points().all_passed());
    }

    #[test]
    fn test_debug_format() {
        let cell = EsnCell::new(options(1, 2), EsnParams::default()).unwrap();
        let text = format!("{:?}", cell);
        assert!(text.starts_with("EsnCell"));
        assert!(text.contains("leaky_rate"));
    }

    #[test]
    fn test_f32_cell() {
        let mut cell = EsnCell::new(NodeOptions::new(2, 4), EsnParams::default()).unwrap();
        cell.initialize().unwrap();
        let x = Tensor::ones((1, 2, 2), DType::F64, &Device::Cpu).unwrap();
        let states = cell.forward(&x.into()).unwrap();
        assert_eq!(states.dtype(), DType::F32);
    }
}
