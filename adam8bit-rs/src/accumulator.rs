//! Stochastic gradient accumulation for reduced-precision parameters.
//!
//! When a `bf16` parameter receives several gradient contributions before an
//! optimizer step, summing them in `bf16` with round-to-nearest drops any
//! contribution smaller than half a `bf16` step. The accumulator instead sums
//! in `f32` and stochastically rounds the total back into the parameter's
//! storage type, so small contributions survive in expectation.
//!
//! The training driver calls [`GradientAccumulator::accumulate`] after each
//! backward pass; the optimizer calls [`GradientAccumulator::take`] when it
//! consumes the gradient, which clears the buffer.

use std::collections::HashMap;

use candle_core::{DType, Tensor};

use crate::error::{OptimError, Result};
use crate::rounding::StochasticRounder;

/// Per-parameter accumulation buffers, keyed by parameter id.
#[derive(Debug, Default)]
pub struct GradientAccumulator {
    buffers: HashMap<usize, Tensor>,
}

impl GradientAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` to the buffer of parameter `id`.
    ///
    /// The buffer is kept in `param`'s dtype and device.
    ///
    /// # Arguments
    ///
    /// * `id` - Parameter id
    /// * `param` - The parameter the gradient belongs to
    /// * `grad` - Freshly computed gradient
    /// * `rounder` - Source of rounding randomness
    ///
    /// # Errors
    ///
    /// Returns an error if the gradient shape differs from the parameter's or
    /// a tensor operation fails.
    pub fn accumulate(
        &mut self,
        id: usize,
        param: &Tensor,
        grad: &Tensor,
        rounder: &mut StochasticRounder,
    ) -> Result<()> {
        if grad.dims() != param.dims() {
            return Err(OptimError::ShapeMismatch {
                expected: param.dims().to_vec(),
                actual: grad.dims().to_vec(),
            });
        }

        let grad = grad.to_device(param.device())?.to_dtype(DType::F32)?;
        let total = match self.buffers.get(&id) {
            Some(residual) => residual.to_dtype(DType::F32)?.add(&grad)?,
            None => grad,
        };
        let stored = rounder.round_to_dtype(&total, param.dtype())?;
        self.buffers.insert(id, stored);
        Ok(())
    }

    /// Remove and return the accumulated gradient of parameter `id`.
    pub fn take(&mut self, id: usize) -> Option<Tensor> {
        self.buffers.remove(&id)
    }

    /// Accumulated gradient of parameter `id`, if any.
    #[must_use]
    pub fn get(&self, id: usize) -> Option<&Tensor> {
        self.buffers.get(&id)
    }

    /// Whether parameter `id` has a pending buffer.
    #[must_use]
    pub fn contains(&self, id: usize) -> bool {
        self.buffers.contains_key(&id)
    }

    /// Drop all pending buffers.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Number of pending buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
