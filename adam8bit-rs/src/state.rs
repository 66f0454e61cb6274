//! Per-parameter optimizer state.

use std::collections::BTreeMap;

use candle_core::{DType, Device};
use serde_json::Value;

use crate::error::Result;
use crate::quantized::QuantizedTensor;

/// Parameter identity: registration index across all groups, in group order.
pub type ParamId = usize;

/// A moment buffer, either live or still in a persisted encoding.
#[derive(Debug, Clone)]
pub enum MomentValue {
    /// Live 8-bit buffer.
    Quantized(QuantizedTensor),
    /// Structural payload not yet normalized; repaired or rejected at the
    /// next step.
    RawLegacy(Value),
}

impl MomentValue {
    /// The live buffer, if normalized.
    #[must_use]
    pub const fn as_quantized(&self) -> Option<&QuantizedTensor> {
        match self {
            Self::Quantized(q) => Some(q),
            Self::RawLegacy(_) => None,
        }
    }

    /// Whether the value is a live buffer.
    #[must_use]
    pub const fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }
}

impl From<QuantizedTensor> for MomentValue {
    fn from(q: QuantizedTensor) -> Self {
        Self::Quantized(q)
    }
}

/// Step counter and both moment buffers of one parameter.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    /// Completed optimization steps.
    pub step: u64,
    /// First moment (EMA of gradients).
    pub exp_avg: MomentValue,
    /// Second moment (EMA of squared gradients).
    pub exp_avg_sq: MomentValue,
    /// Unrecognised persisted fields, carried through verbatim.
    pub extra: BTreeMap<String, Value>,
}

impl OptimizerState {
    /// Fresh state with zeroed moments, as created at a parameter's first step.
    ///
    /// # Errors
    ///
    /// Returns an error if the code buffers cannot be allocated.
    pub fn zeroed(dims: &[usize], device: &Device) -> Result<Self> {
        Ok(Self {
            step: 0,
            exp_avg: QuantizedTensor::zeros(dims, DType::F32, device)?.into(),
            exp_avg_sq: QuantizedTensor::zeros(dims, DType::F32, device)?.into(),
            extra: BTreeMap::new(),
        })
    }

    /// Whether both moments are live buffers.
    #[must_use]
    pub const fn is_normalized(&self) -> bool {
        self.exp_avg.is_quantized() && self.exp_avg_sq.is_quantized()
    }

    /// Bytes held by the live moment buffers.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        [&self.exp_avg, &self.exp_avg_sq]
            .into_iter()
            .filter_map(MomentValue::as_quantized)
            .map(QuantizedTensor::memory_bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_zeroed_state() {
        let state = OptimizerState::zeroed(&[4, 8], &Device::Cpu).unwrap();
        assert_eq!(state.step, 0);
        assert!(state.is_normalized());
        assert_eq!(state.memory_bytes(), 2 * (32 + 4));
        assert_eq!(state.exp_avg.as_quantized().unwrap().dims(), &[4, 8]);
    }

    #[test]
    fn test_raw_moment_is_not_normalized() {
        let mut state = OptimizerState::zeroed(&[2], &Device::Cpu).unwrap();
        state.exp_avg = MomentValue::RawLegacy(json!({"foo": 1}));
        assert!(!state.is_normalized());
        assert!(state.exp_avg.as_quantized().is_none());
        assert_eq!(state.memory_bytes(), 2 + 4);
    }
}
