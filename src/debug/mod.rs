//! Debug and verification utilities
//!
//! Tools for checking a node's internal values against a reference
//! implementation:
//! - Debug modes (off, test, output, test case)
//! - Named debug points with tolerance-based comparison
//! - Injected test-case assertions
//! - NPY golden data loading

mod mode;
mod npy_loader;
mod registry;
mod test_case;
mod value;

pub use mode::DebugMode;
pub use npy_loader::{
    load_debug_value, load_npy, load_npy_tensor, save_npy_f64, save_tensor_npy, NpyArray, NpyDtype,
};
pub use registry::{CheckReport, DebugPoint, DebugPointRegistry};
pub use test_case::{TestCase, ToleranceAssertions};
pub use value::{DebugValue, ValueKind};
