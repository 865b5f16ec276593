//! Debug-point registry
//!
//! Holds named reference values ("debug points") supplied from outside the
//! node, typically exported from a reference implementation, and compares
//! them with the values the node computes internally.

use anyhow::Context;
use candle_core::Device;
use std::collections::HashMap;
use std::path::Path;
use tracing::{error, info};

use super::mode::DebugMode;
use super::npy_loader::load_debug_value;
use super::test_case::TestCase;
use super::value::{DebugValue, ValueKind};
use crate::error::{NodeError, Result};
use crate::utils::tensor_utils::frobenius_distance;

/// A reference value and the tolerance it is compared with
#[derive(Debug, Clone)]
pub struct DebugPoint {
    /// Value supplied from outside the node
    pub reference: DebugValue,
    /// Maximum accepted difference
    pub precision: f64,
}

/// Outcome of one evaluated debug-point comparison
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Debug point name
    pub name: String,
    /// Kind of the compared values
    pub kind: ValueKind,
    /// Absolute difference (scalars) or Frobenius norm of the difference (matrices)
    pub difference: f64,
    /// Tolerance that applied
    pub precision: f64,
    /// Whether the comparison passed
    pub passed: bool,
}

impl CheckReport {
    /// Summary string
    pub fn summary(&self) -> String {
        let status = if self.passed { "PASS" } else { "FAIL" };
        format!(
            "[{}] {} ({}) - diff={:.2e}, precision={:.2e}",
            status, self.name, self.kind, self.difference, self.precision
        )
    }
}

/// Registry of debug points plus the history of evaluated checks
#[derive(Debug, Default)]
pub struct DebugPointRegistry {
    points: HashMap<String, DebugPoint>,
    reports: Vec<CheckReport>,
}

impl DebugPointRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or overwrite a debug point
    pub fn set(&mut self, name: impl Into<String>, reference: impl Into<DebugValue>, precision: f64) {
        self.points.insert(
            name.into(),
            DebugPoint {
                reference: reference.into(),
                precision,
            },
        );
    }

    /// Look up a debug point
    pub fn get(&self, name: &str) -> Option<&DebugPoint> {
        self.points.get(name)
    }

    /// Whether a debug point is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.points.contains_key(name)
    }

    /// Remove a debug point
    pub fn remove(&mut self, name: &str) -> Option<DebugPoint> {
        self.points.remove(name)
    }

    /// Remove every debug point (the report history is kept)
    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Number of registered debug points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether no debug point is registered
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Register every `*.npy` file in `dir` as a debug point named by its file stem
    ///
    /// Returns the number of points loaded.
    pub fn load_npy_dir<P: AsRef<Path>>(
        &mut self,
        dir: P,
        precision: f64,
        device: &Device,
    ) -> anyhow::Result<usize> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read golden directory: {:?}", dir))?;

        let mut loaded = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("npy") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let value = load_debug_value(&path, device)
                .with_context(|| format!("Failed to load debug point {:?}", path))?;
            self.set(name, value, precision);
            loaded += 1;
        }

        info!("Loaded {} debug points from {:?}", loaded, dir);
        Ok(loaded)
    }

    /// Compare a live value with the debug point registered under `name`
    ///
    /// Returns `Ok(None)` when the mode is `Off` or nothing is registered.
    /// Kind and shape mismatches are fatal. Precision failures are only
    /// fatal in `TestCase` mode, where the test case decides.
    pub fn check(
        &mut self,
        mode: DebugMode,
        test_case: Option<&dyn TestCase>,
        name: &str,
        live: &DebugValue,
    ) -> Result<Option<CheckReport>> {
        if !mode.is_enabled() {
            return Ok(None);
        }
        let Some(point) = self.points.get(name) else {
            return Ok(None);
        };
        let precision = point.precision;

        let (difference, assertion) = match (&point.reference, live) {
            (DebugValue::Integer(r), DebugValue::Integer(l)) => {
                (r.abs_diff(*l) as f64, Assertion::Scalar(*r as f64, *l as f64))
            }
            (DebugValue::Scalar(r), DebugValue::Scalar(l)) => {
                ((r - l).abs(), Assertion::Scalar(*r, *l))
            }
            (DebugValue::Matrix(r), DebugValue::Matrix(l)) => {
                if r.dims() != l.dims() {
                    error!(
                        "DEBUG - FATAL: {} have not the same size! (module:{:?}, outside:{:?})",
                        name,
                        l.dims(),
                        r.dims()
                    );
                    return Err(NodeError::ShapeMismatch {
                        name: name.to_string(),
                        reference: r.dims().to_vec(),
                        live: l.dims().to_vec(),
                    });
                }
                (frobenius_distance(r, l)?, Assertion::Matrix(r, l))
            }
            (reference, live) => {
                error!(
                    "DEBUG - FATAL: {} are not of the same type! (module:{}, outside:{})",
                    name,
                    live.kind(),
                    reference.kind()
                );
                return Err(NodeError::TypeMismatch {
                    name: name.to_string(),
                    reference: reference.kind(),
                    live: live.kind(),
                });
            }
        };

        if mode.reports_differences() {
            match assertion {
                Assertion::Scalar(..) => {
                    info!("DEBUG - INFO: {} (scalar) has an absolute difference of {:e}", name, difference)
                }
                Assertion::Matrix(..) => {
                    info!("DEBUG - INFO: {} (matrix) has a norm-2 difference of {:e}", name, difference)
                }
            }
        }

        let verdict = if mode == DebugMode::TestCase {
            let tc = test_case.ok_or_else(|| {
                NodeError::config("test_case debug mode requires an injected test case")
            })?;
            match assertion {
                Assertion::Scalar(r, l) => tc.assert_scalar_almost_equal(r, l, precision),
                Assertion::Matrix(r, l) => tc.assert_matrix_almost_equal(r, l, precision),
            }
        } else {
            // NaN differences fail as well
            if !(difference <= precision) {
                error!(
                    "DEBUG - ERROR: {} have precision issue! (difference:{:e}, precision:{:e})",
                    name, difference, precision
                );
            }
            Ok(())
        };

        let passed = match mode {
            DebugMode::TestCase => verdict.is_ok(),
            _ => difference <= precision,
        };
        let report = CheckReport {
            name: name.to_string(),
            kind: live.kind(),
            difference,
            precision,
            passed,
        };
        self.reports.push(report.clone());
        verdict?;
        Ok(Some(report))
    }

    /// All evaluated checks, oldest first
    pub fn reports(&self) -> &[CheckReport] {
        &self.reports
    }

    /// Whether every evaluated check passed
    pub fn all_passed(&self) -> bool {
        self.reports.iter().all(|r| r.passed)
    }

    /// Number of failed checks
    pub fn failures(&self) -> usize {
        self.reports.iter().filter(|r| !r.passed).count()
    }

    /// Clear the report history
    pub fn clear_reports(&mut self) {
        self.reports.clear();
    }

    /// Multi-line summary of every evaluated check
    pub fn summary(&self) -> String {
        let passed = self.reports.len() - self.failures();
        let mut out = String::from("=== Debug Point Summary ===\n");
        for report in &self.reports {
            out.push_str(&report.summary());
            out.push('\n');
        }
        out.push_str(&format!("Total: {}/{} passed", passed, self.reports.len()));
        out
    }
}

enum Assertion<'a> {
    Scalar(f64, f64),
    Matrix(&'a candle_core::Tensor, &'a candle_core::Tensor),
}
