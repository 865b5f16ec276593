//! Debug strictness levels

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much checking and reporting a node performs
///
/// - `Off`: no debug points evaluated, no conditioning audit
/// - `Test`: precision failures logged, conditioning warnings only
/// - `Output`: every difference and condition number reported
/// - `TestCase`: differences reported and pass/fail delegated to a [`TestCase`](super::TestCase)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugMode {
    /// No debugging
    #[default]
    #[serde(alias = "none")]
    Off,
    /// Silent checks, errors on precision loss
    Test,
    /// Interactive diagnostics
    Output,
    /// Hard assertions through an injected test case
    TestCase,
}

impl DebugMode {
    /// Whether debug points are evaluated at all
    pub fn is_enabled(self) -> bool {
        self != DebugMode::Off
    }

    /// Whether matrix conditioning is audited before inversion
    pub fn audits_conditioning(self) -> bool {
        matches!(self, DebugMode::Test | DebugMode::Output)
    }

    /// Whether informational differences are reported
    pub fn reports_differences(self) -> bool {
        matches!(self, DebugMode::Output | DebugMode::TestCase)
    }

    /// Name used in configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            DebugMode::Off => "off",
            DebugMode::Test => "test",
            DebugMode::Output => "output",
            DebugMode::TestCase => "test_case",
        }
    }
}

impl fmt::Display for DebugMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DebugMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "off" | "none" => Ok(DebugMode::Off),
            "test" => Ok(DebugMode::Test),
            "output" => Ok(DebugMode::Output),
            "test_case" | "testcase" => Ok(DebugMode::TestCase),
            other => Err(format!("unknown debug mode: {}", other)),
        }
    }
}
