//! Node abstraction for reservoir computing
//!
//! A node is a stateful processing unit with declared input/output
//! dimensionality and dtype. Every node owns a [`NodeCore`] holding that
//! configuration together with its debug points, handler slots, conditioning
//! history and lifecycle state:
//!
//! ```text
//! Constructed --initialize--> Initialized --finalize--> Finalized
//!                                  ^                        |
//!                                  +---------reset----------+
//! ```
//!
//! While `Initialized`, the training flag toggles between accumulating
//! statistics (training) and pure inference (active).

mod esn;
mod ridge;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::debug::{CheckReport, DebugMode, DebugPointRegistry, DebugValue, TestCase};
use crate::error::{NodeError, Result};
use crate::hooks::{HandlerRegistry, HandlerSlot};
use crate::numeric::{ConditionReport, NumericKernel};

pub use esn::{EsnCell, EsnParams, EsnWeights};
pub use ridge::{RidgeParams, RidgeReadout};

/// Float precisions a node accepts unless a variant narrows the set
pub const DEFAULT_SUPPORTED_DTYPES: &[DType] = &[DType::F16, DType::F32, DType::F64];

/// Construction parameters shared by every node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOptions {
    /// Input dimension
    pub input_dim: usize,
    /// Output dimension
    pub output_dim: usize,
    /// Numeric type of the node's tensors
    #[serde(with = "dtype_name", default = "default_dtype")]
    pub dtype: DType,
    /// Debug strictness
    #[serde(default)]
    pub debug_mode: DebugMode,
}

fn default_dtype() -> DType {
    DType::F32
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            input_dim: 1,
            output_dim: 1,
            dtype: default_dtype(),
            debug_mode: DebugMode::Off,
        }
    }
}

impl NodeOptions {
    /// Options with the given dimensions, `f32` and debugging off
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            ..Default::default()
        }
    }

    /// Set the dtype
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Set the debug mode
    pub fn debug_mode(mut self, mode: DebugMode) -> Self {
        self.debug_mode = mode;
        self
    }
}

mod dtype_name {
    use candle_core::DType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dtype: &DType, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(dtype.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DType, D::Error> {
        let name = String::deserialize(d)?;
        name.parse::<DType>().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Dimensions and dtype fixed, no numeric state allocated
    Constructed,
    /// Numeric state allocated, forward allowed
    Initialized,
    /// Training concluded, parameters fixed
    Finalized,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Constructed => "constructed",
            Lifecycle::Initialized => "initialized",
            Lifecycle::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Inputs of one forward call, with optional training targets
///
/// Tensors are `(batch, time, dim)`; a 2-D `(time, dim)` tensor is a
/// batch of one.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Input signal
    pub inputs: Tensor,
    /// Desired outputs, used by trainable nodes while training
    pub targets: Option<Tensor>,
}

impl Batch {
    /// Batch without targets
    pub fn new(inputs: Tensor) -> Self {
        Self { inputs, targets: None }
    }

    /// Batch with training targets
    pub fn with_targets(inputs: Tensor, targets: Tensor) -> Self {
        Self {
            inputs,
            targets: Some(targets),
        }
    }
}

impl From<Tensor> for Batch {
    fn from(inputs: Tensor) -> Self {
        Self::new(inputs)
    }
}

/// State shared by every node variant
pub struct NodeCore {
    input_dim: usize,
    output_dim: usize,
    dtype: DType,
    supported_dtypes: &'static [DType],
    device: Device,
    debug_mode: DebugMode,
    test_case: Option<Box<dyn TestCase + Send>>,
    debug_points: DebugPointRegistry,
    handlers: HandlerRegistry,
    condition_reports: Vec<ConditionReport>,
    lifecycle: Lifecycle,
    training: bool,
}

impl NodeCore {
    /// Validate `options` against `supported_dtypes` and build the core
    pub fn new(options: &NodeOptions, supported_dtypes: &'static [DType]) -> Result<Self> {
        check_dim("input_dim", options.input_dim)?;
        check_dim("output_dim", options.output_dim)?;
        check_dtype(options.dtype, supported_dtypes)?;

        Ok(Self {
            input_dim: options.input_dim,
            output_dim: options.output_dim,
            dtype: options.dtype,
            supported_dtypes,
            device: Device::Cpu,
            debug_mode: options.debug_mode,
            test_case: None,
            debug_points: DebugPointRegistry::new(),
            handlers: HandlerRegistry::new(),
            condition_reports: Vec::new(),
            lifecycle: Lifecycle::Constructed,
            training: true,
        })
    }

    /// Place the node's tensors on `device`
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Inject the assertion collaborator used in `TestCase` mode
    pub fn with_test_case(mut self, test_case: Box<dyn TestCase + Send>) -> Self {
        self.test_case = Some(test_case);
        self
    }

    /// Input dimension
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Output dimension
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Numeric type
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Accepted dtypes
    pub fn supported_dtypes(&self) -> &'static [DType] {
        self.supported_dtypes
    }

    /// Device holding the node's tensors
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current debug mode
    pub fn debug_mode(&self) -> DebugMode {
        self.debug_mode
    }

    /// Lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Whether the training flag is set
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Whether forward calls should accumulate training statistics
    pub fn is_accumulating(&self) -> bool {
        self.training && self.lifecycle == Lifecycle::Initialized
    }

    /// Change the input dimension
    pub fn set_input_dim(&mut self, dim: usize) -> Result<()> {
        check_dim("input_dim", dim)?;
        if dim != self.input_dim {
            self.input_dim = dim;
            self.invalidate("input_dim changed");
        }
        Ok(())
    }

    /// Change the output dimension
    pub fn set_output_dim(&mut self, dim: usize) -> Result<()> {
        check_dim("output_dim", dim)?;
        if dim != self.output_dim {
            self.output_dim = dim;
            self.invalidate("output_dim changed");
        }
        Ok(())
    }

    /// Change the dtype
    pub fn set_dtype(&mut self, dtype: DType) -> Result<()> {
        check_dtype(dtype, self.supported_dtypes)?;
        if dtype != self.dtype {
            self.dtype = dtype;
            self.invalidate("dtype changed");
        }
        Ok(())
    }

    /// Change the debug mode
    pub fn set_debug_mode(&mut self, mode: DebugMode) {
        self.debug_mode = mode;
    }

    /// Replace the injected test case
    pub fn set_test_case(&mut self, test_case: Option<Box<dyn TestCase + Send>>) {
        self.test_case = test_case;
    }

    /// Store or overwrite a debug point
    pub fn set_debug_point(&mut self, name: impl Into<String>, value: impl Into<DebugValue>, precision: f64) {
        self.debug_points.set(name, value, precision);
    }

    /// Debug points and check history
    pub fn debug_points(&self) -> &DebugPointRegistry {
        &self.debug_points
    }

    /// Mutable debug points
    pub fn debug_points_mut(&mut self) -> &mut DebugPointRegistry {
        &mut self.debug_points
    }

    /// Compare a live value with the debug point `name`, if any
    pub fn check_debug_point(&mut self, name: &str, value: impl Into<DebugValue>) -> Result<Option<CheckReport>> {
        if !self.debug_mode.is_enabled() || !self.debug_points.contains(name) {
            return Ok(None);
        }
        let test_case = self.test_case.as_deref().map(|tc| tc as &dyn TestCase);
        self.debug_points
            .check(self.debug_mode, test_case, name, &value.into())
    }

    /// Handler slots
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Mutable handler slots
    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    /// Kernel bound to the current debug mode
    pub fn kernel(&self) -> NumericKernel {
        NumericKernel::new(self.debug_mode)
    }

    /// Inverse of `m`, recording its conditioning audit
    pub fn inverse(&mut self, name: &str, m: &Tensor) -> Result<Tensor> {
        let (inverse, report) = self.kernel().invert(name, m)?;
        self.condition_reports.extend(report);
        Ok(inverse)
    }

    /// Pseudo-inverse of `m`, recording its conditioning audit
    pub fn pinverse(&mut self, name: &str, m: &Tensor) -> Result<Tensor> {
        let (pinv, report) = self.kernel().pseudo_invert(name, m)?;
        self.condition_reports.extend(report);
        Ok(pinv)
    }

    /// Conditioning audits made so far
    pub fn condition_reports(&self) -> &[ConditionReport] {
        &self.condition_reports
    }

    /// Fail unless `initialize` has run
    pub fn ensure_initialized(&self, operation: &str) -> Result<()> {
        if self.lifecycle == Lifecycle::Constructed {
            return Err(NodeError::config(format!(
                "{} called before initialize",
                operation
            )));
        }
        Ok(())
    }

    /// Record that numeric state has been allocated
    pub fn mark_initialized(&mut self) {
        debug!("node {} -> initialized", self.lifecycle);
        self.lifecycle = Lifecycle::Initialized;
        self.training = true;
    }

    /// Record that training has concluded
    pub fn mark_finalized(&mut self) {
        debug!("node {} -> finalized", self.lifecycle);
        self.lifecycle = Lifecycle::Finalized;
        self.training = false;
    }

    /// Set the training flag
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Training mode again; a finalized node goes back to `Initialized`
    pub fn reenter_training(&mut self) {
        if self.lifecycle == Lifecycle::Finalized {
            debug!("node finalized -> initialized (reset)");
            self.lifecycle = Lifecycle::Initialized;
        }
        self.training = true;
    }

    /// Convert a `(batch, time, dim)` or `(time, dim)` tensor to the node's
    /// dtype and device, checking the last dimension
    pub fn prepare(&self, what: &str, x: &Tensor, dim: usize) -> Result<Tensor> {
        let x = match x.rank() {
            2 => x.unsqueeze(0)?,
            3 => x.clone(),
            r => {
                return Err(NodeError::config(format!(
                    "{} must be (batch, time, dim) or (time, dim), got rank {}",
                    what, r
                )))
            }
        };
        let (_, _, d) = x.dims3()?;
        if d != dim {
            return Err(NodeError::config(format!(
                "{} has dimension {}, node expects {}",
                what, d, dim
            )));
        }
        Ok(x.to_dtype(self.dtype)?.to_device(&self.device)?)
    }

    fn invalidate(&mut self, reason: &str) {
        if self.lifecycle != Lifecycle::Constructed {
            debug!("node {} -> constructed ({})", self.lifecycle, reason);
            self.lifecycle = Lifecycle::Constructed;
        }
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("input_dim", &self.input_dim)
            .field("output_dim", &self.output_dim)
            .field("dtype", &self.dtype)
            .field("debug_mode", &self.debug_mode)
            .field("lifecycle", &self.lifecycle)
            .field("training", &self.training)
            .field("debug_points", &self.debug_points.len())
            .field("handlers", &self.handlers)
            .finish()
    }
}

fn check_dim(what: &str, dim: usize) -> Result<()> {
    if dim == 0 {
        return Err(NodeError::config(format!("{} must be positive", what)));
    }
    Ok(())
}

fn check_dtype(dtype: DType, supported: &[DType]) -> Result<()> {
    if !supported.contains(&dtype) {
        return Err(NodeError::config(format!(
            "unsupported dtype {:?} (supported: {:?})",
            dtype, supported
        )));
    }
    Ok(())
}

/// A reservoir-computing processing unit
///
/// Variants implement `core`, `initialize` and `forward`; `finalize` and
/// `reset` default to lifecycle bookkeeping only.
pub trait Node {
    /// Shared node state
    fn core(&self) -> &NodeCore;

    /// Mutable shared node state
    fn core_mut(&mut self) -> &mut NodeCore;

    /// Allocate or reset numeric state; safe to call repeatedly
    fn initialize(&mut self) -> Result<()>;

    /// Process one batch
    fn forward(&mut self, batch: &Batch) -> Result<Tensor>;

    /// Conclude training
    fn finalize(&mut self) -> Result<()> {
        self.core().ensure_initialized("finalize")?;
        self.core_mut().mark_finalized();
        Ok(())
    }

    /// Enter training mode again
    fn reset(&mut self) -> Result<()> {
        self.core_mut().reenter_training();
        Ok(())
    }

    /// Whether `finalize` learns parameters
    fn is_trainable(&self) -> bool {
        false
    }

    /// Whether the node's mapping can be inverted
    fn is_invertible(&self) -> bool {
        false
    }

    /// Accepted dtypes
    fn supported_dtypes(&self) -> &'static [DType] {
        self.core().supported_dtypes()
    }

    /// Input dimension
    fn input_dim(&self) -> usize {
        self.core().input_dim()
    }

    /// Output dimension
    fn output_dim(&self) -> usize {
        self.core().output_dim()
    }

    /// Numeric type
    fn dtype(&self) -> DType {
        self.core().dtype()
    }

    /// Change the input dimension; an initialized node must be initialized again
    fn set_input_dim(&mut self, dim: usize) -> Result<()> {
        self.core_mut().set_input_dim(dim)
    }

    /// Change the output dimension; an initialized node must be initialized again
    fn set_output_dim(&mut self, dim: usize) -> Result<()> {
        self.core_mut().set_output_dim(dim)
    }

    /// Change the dtype; an initialized node must be initialized again
    fn set_dtype(&mut self, dtype: DType) -> Result<()> {
        self.core_mut().set_dtype(dtype)
    }

    /// Lifecycle state
    fn lifecycle(&self) -> Lifecycle {
        self.core().lifecycle()
    }

    /// Whether the training flag is set
    fn is_training(&self) -> bool {
        self.core().is_training()
    }

    /// Toggle between training and inference
    fn set_training(&mut self, training: bool) {
        self.core_mut().set_training(training);
    }

    /// Set the debug mode
    fn debug(&mut self, mode: DebugMode) {
        self.core_mut().set_debug_mode(mode);
    }

    /// Store or overwrite a debug point
    fn set_debug_point(&mut self, name: &str, value: impl Into<DebugValue>, precision: f64)
    where
        Self: Sized,
    {
        self.core_mut().set_debug_point(name, value, precision);
    }

    /// Debug points and check history
    fn debug_points(&self) -> &DebugPointRegistry {
        self.core().debug_points()
    }

    /// Conditioning audits made so far
    fn condition_reports(&self) -> &[ConditionReport] {
        self.core().condition_reports()
    }

    /// Bind an external handler to a slot
    fn connect<F>(&mut self, slot: HandlerSlot, handler: F)
    where
        Self: Sized,
        F: Fn(&Tensor, &Tensor, usize, usize) -> Result<Tensor> + Send + 'static,
    {
        self.core_mut().handlers_mut().connect(slot, handler);
    }

    /// Bind an external handler by slot name; unknown names are rejected
    fn connect_named<F>(&mut self, name: &str, handler: F) -> Result<()>
    where
        Self: Sized,
        F: Fn(&Tensor, &Tensor, usize, usize) -> Result<Tensor> + Send + 'static,
    {
        self.core_mut().handlers_mut().connect_named(name, handler)
    }

    /// One-line description
    fn describe(&self) -> String {
        format!(
            "input_dim={}, output_dim={}, dtype={}",
            self.input_dim(),
            self.output_dim(),
            self.dtype().as_str()
        )
    }
}
