//! Update hooks around a node's recurrence
//!
//! A node's core update runs inside a fixed sequence of extension points:
//!
//! ```text
//! for each sample b:
//!     u  = pre_update(inputs[b], b)
//!     for each timestep t:
//!         ut = pre_step_update(u[t], t)
//!         x  = step(ut)                    // the variant's recurrence
//!         x  = post_step_update(x, ut, t)
//!     states[b] = post_update(x[0..T], u, b)
//! ```
//!
//! All four hooks default to the identity, so a variant only overrides the
//! points it needs (normalisation, noise, leaky integration, ...).

mod handlers;

use candle_core::Tensor;

use crate::error::{NodeError, Result};

pub use handlers::{HandlerRegistry, HandlerSlot, NeuralFilter};

/// Per-sample and per-timestep transformation points
///
/// Each hook returns a value with the shape of its first argument.
pub trait UpdateHooks {
    /// Runs on a whole sample `(time, input_dim)` before its timesteps
    fn pre_update(&self, inputs: &Tensor, _sample: usize) -> Result<Tensor> {
        Ok(inputs.clone())
    }

    /// Runs on one timestep `(1, input_dim)` before the recurrence
    fn pre_step_update(&self, inputs: &Tensor, _t: usize) -> Result<Tensor> {
        Ok(inputs.clone())
    }

    /// Runs on a whole sample's states `(time, output_dim)` after its timesteps
    fn post_update(&self, states: &Tensor, _inputs: &Tensor, _sample: usize) -> Result<Tensor> {
        Ok(states.clone())
    }

    /// Runs on one timestep's state `(1, output_dim)` after the recurrence
    fn post_step_update(&self, states: &Tensor, _inputs: &Tensor, _t: usize) -> Result<Tensor> {
        Ok(states.clone())
    }
}

/// Hooks that change nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityHooks;

impl UpdateHooks for IdentityHooks {}

/// Drives a per-timestep recurrence through a set of [`UpdateHooks`]
#[derive(Debug, Clone, Default)]
pub struct HookChain<H> {
    hooks: H,
}

impl<H: UpdateHooks> HookChain<H> {
    /// Wrap a set of hooks
    pub fn new(hooks: H) -> Self {
        Self { hooks }
    }

    /// The wrapped hooks
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Mutable access to the wrapped hooks
    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Run `step` over every timestep of every sample
    ///
    /// `inputs` is `(batch, time, input_dim)`. `step` receives one timestep
    /// `(1, input_dim)` with its sample index and timestep and returns the
    /// state `(1, output_dim)`. The result is `(batch, time, output_dim)`.
    pub fn run<F>(&self, inputs: &Tensor, mut step: F) -> Result<Tensor>
    where
        F: FnMut(&Tensor, usize, usize) -> Result<Tensor>,
    {
        let (batch, time, _) = inputs.dims3()?;
        if batch == 0 || time == 0 {
            return Err(NodeError::config(format!(
                "cannot run an empty batch (batch={}, time={})",
                batch, time
            )));
        }

        let mut samples = Vec::with_capacity(batch);
        for b in 0..batch {
            let u = self.hooks.pre_update(&inputs.get(b)?, b)?;

            let mut steps = Vec::with_capacity(time);
            for t in 0..time {
                let ut = self.hooks.pre_step_update(&u.narrow(0, t, 1)?, t)?;
                let x = step(&ut, b, t)?;
                steps.push(self.hooks.post_step_update(&x, &ut, t)?);
            }

            let states = Tensor::cat(&steps, 0)?;
            samples.push(self.hooks.post_update(&states, &u, b)?);
        }

        Ok(Tensor::stack(&samples, 0)?)
    }
}
