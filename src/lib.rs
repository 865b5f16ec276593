//! # reservoir-node
//!
//! Core of a reservoir-computing processing unit ("Node"): lifecycle,
//! numerically robust inversion with condition-number monitoring, hook-based
//! state transformation, and debug points that cross-check internal values
//! against a reference implementation.
//!
//! ## Features
//!
//! - `Node` trait with shared lifecycle and dtype/dimension validation
//! - Inverse and pseudo-inverse with conditioning audits
//! - Per-sample and per-timestep update hooks, plus a `neural-filter` slot
//! - Debug points in three strictness levels, with `.npy` golden data
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reservoir_node::{Batch, EsnCell, EsnParams, Node, NodeOptions, RidgeParams, RidgeReadout};
//!
//! let mut esn = EsnCell::new(NodeOptions::new(1, 100), EsnParams::default())?;
//! let mut readout = RidgeReadout::new(NodeOptions::new(100, 1), RidgeParams::default())?;
//! esn.initialize()?;
//! readout.initialize()?;
//!
//! let states = esn.forward(&Batch::new(inputs))?;
//! readout.forward(&Batch::with_targets(states, targets))?;
//! readout.finalize()?;
//! ```

// Require docs for public items, but not struct fields (too verbose)
#![warn(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod debug;
pub mod error;
pub mod hooks;
pub mod node;
pub mod numeric;
pub mod utils;

// Re-exports for convenience
pub use config::NodeConfig;
pub use debug::{DebugMode, DebugPointRegistry, DebugValue, TestCase, ToleranceAssertions};
pub use error::{NodeError, Result};
pub use hooks::{HandlerSlot, HookChain, IdentityHooks, UpdateHooks};
pub use node::{
    Batch, EsnCell, EsnParams, EsnWeights, Lifecycle, Node, NodeCore, NodeOptions, RidgeParams,
    RidgeReadout,
};
pub use numeric::{ConditionReport, NumericKernel, CONDITION_WARNING_THRESHOLD};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
