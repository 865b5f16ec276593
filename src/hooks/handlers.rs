//! Named handler slots ("connect")

use candle_core::Tensor;
use std::fmt;
use std::str::FromStr;

use crate::error::{NodeError, Result};

/// Neural filter: `(states, inputs, sample, t) -> states'`
///
/// Called by a variant's update logic after each recurrence step.
pub type NeuralFilter = Box<dyn Fn(&Tensor, &Tensor, usize, usize) -> Result<Tensor> + Send>;

/// Slots an external handler can be connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerSlot {
    /// `"neural-filter"`
    NeuralFilter,
}

impl HandlerSlot {
    /// Slot name as used by `connect`
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerSlot::NeuralFilter => "neural-filter",
        }
    }
}

impl fmt::Display for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerSlot {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "neural-filter" => Ok(HandlerSlot::NeuralFilter),
            other => Err(NodeError::UnknownHandler(other.to_string())),
        }
    }
}

/// Handlers bound to a node, one per slot
#[derive(Default)]
pub struct HandlerRegistry {
    neural_filter: Option<NeuralFilter>,
}

impl HandlerRegistry {
    /// Create a registry with every slot empty
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `slot`, returning the handler it replaces
    pub fn connect<F>(&mut self, slot: HandlerSlot, handler: F) -> Option<NeuralFilter>
    where
        F: Fn(&Tensor, &Tensor, usize, usize) -> Result<Tensor> + Send + 'static,
    {
        match slot {
            HandlerSlot::NeuralFilter => self.neural_filter.replace(Box::new(handler)),
        }
    }

    /// Bind a handler by slot name; unknown names are rejected
    pub fn connect_named<F>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&Tensor, &Tensor, usize, usize) -> Result<Tensor> + Send + 'static,
    {
        let slot = name.parse::<HandlerSlot>()?;
        self.connect(slot, handler);
        Ok(())
    }

    /// Unbind whatever occupies `slot`
    pub fn disconnect(&mut self, slot: HandlerSlot) -> Option<NeuralFilter> {
        match slot {
            HandlerSlot::NeuralFilter => self.neural_filter.take(),
        }
    }

    /// Whether a handler occupies `slot`
    pub fn is_connected(&self, slot: HandlerSlot) -> bool {
        match slot {
            HandlerSlot::NeuralFilter => self.neural_filter.is_some(),
        }
    }

    /// Apply the neural filter, or return `states` unchanged when none is bound
    pub fn filter(&self, states: &Tensor, inputs: &Tensor, sample: usize, t: usize) -> Result<Tensor> {
        match &self.neural_filter {
            Some(f) => f(states, inputs, sample, t),
            None => Ok(states.clone()),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("neural_filter", &self.neural_filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_slot_names() {
        assert_eq!("neural-filter".parse::<HandlerSlot>().unwrap(), HandlerSlot::NeuralFilter);
        assert_eq!(HandlerSlot::NeuralFilter.to_string(), "neural-filter");
        let err = "spike-filter".parse::<HandlerSlot>().unwrap_err();
        assert!(matches!(err, NodeError::UnknownHandler(ref n) if n == "spike-filter"));
    }

    #[test]
    fn test_connect_replaces_previous() {
        let mut reg = HandlerRegistry::new();
        assert!(!reg.is_connected(HandlerSlot::NeuralFilter));
        assert!(reg.connect(HandlerSlot::NeuralFilter, |s: &Tensor, _: &Tensor, _, _| Ok(s.clone())).is_none());
        assert!(reg
            .connect(HandlerSlot::NeuralFilter, |s: &Tensor, _: &Tensor, _, _| Ok((s * 0.0)?))
            .is_some());

        let x = Tensor::ones((1, 2), DType::F64, &Device::Cpu).unwrap();
        let out = reg.filter(&x, &x, 0, 0).unwrap();
        assert_eq!(out.to_vec2::<f64>().unwrap(), vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn test_unbound_filter_is_identity() {
        let reg = HandlerRegistry::new();
        let x = Tensor::ones((1, 2), DType::F64, &Device::Cpu).unwrap();
        assert_eq!(reg.filter(&x, &x, 0, 0).unwrap().id(), x.id());
    }

    #[test]
    fn test_connect_named_unknown() {
        let mut reg = HandlerRegistry::new();
        assert!(reg.connect_named("nope", |s: &Tensor, _: &Tensor, _, _| Ok(s.clone())).is_err());
        assert!(!reg.is_connected(HandlerSlot::NeuralFilter));
        reg.connect_named("neural-filter", |s: &Tensor, _: &Tensor, _, _| Ok(s.clone())).unwrap();
        assert!(reg.is_connected(HandlerSlot::NeuralFilter));
    }
}
