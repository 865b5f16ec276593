//! YAML configuration for a reservoir pipeline

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::node::{EsnParams, NodeOptions, RidgeParams};

/// Echo-state section; `reservoir_dim` becomes the cell's output dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EsnConfig {
    /// Number of reservoir units
    pub reservoir_dim: usize,
    /// Cell parameters
    #[serde(flatten)]
    pub params: EsnParams,
}

impl Default for EsnConfig {
    fn default() -> Self {
        Self {
            reservoir_dim: 50,
            params: EsnParams::default(),
        }
    }
}

/// Debug section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Precision given to golden debug points
    pub precision: f64,
    /// Directory of `.npy` golden values, one debug point per file
    pub golden_dir: Option<PathBuf>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            precision: 1e-6,
            golden_dir: None,
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Pipeline input/output dimensions, dtype and debug mode
    pub node: NodeOptions,
    /// Readout parameters
    pub ridge: RidgeParams,
    /// Optional reservoir in front of the readout
    pub esn: Option<EsnConfig>,
    /// Golden data settings
    pub debug: DebugConfig,
}

impl NodeConfig {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Options for the reservoir cell, if one is configured
    pub fn esn_options(&self) -> Option<NodeOptions> {
        self.esn.as_ref().map(|esn| NodeOptions {
            output_dim: esn.reservoir_dim,
            ..self.node.clone()
        })
    }

    /// Options for the readout; its input is the reservoir when present
    pub fn readout_options(&self) -> NodeOptions {
        let input_dim = self
            .esn
            .as_ref()
            .map_or(self.node.input_dim, |esn| esn.reservoir_dim);
        NodeOptions {
            input_dim,
            ..self.node.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.node.input_dim > 0, "node.input_dim must be positive");
        anyhow::ensure!(self.node.output_dim > 0, "node.output_dim must be positive");
        if let Some(esn) = &self.esn {
            anyhow::ensure!(esn.reservoir_dim > 0, "esn.reservoir_dim must be positive");
        }
        anyhow::ensure!(self.debug.precision >= 0.0, "debug.precision must be non-negative");
        Ok(())
    }
}
