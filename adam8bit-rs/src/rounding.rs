//! Stochastic rounding.
//!
//! Rounds up with probability equal to the fractional distance to the upper
//! neighbour, so `E[round(x)] = x`. Round-to-nearest would instead drop every
//! update smaller than half a quantization step, which adds up over thousands
//! of optimizer steps.
//!
//! Two targets are supported:
//! - integers, used for 8-bit moment codes
//! - `bf16` / `f16`, used when writing parameters and accumulated gradients
//!   back into their storage precision

use candle_core::{DType, Tensor, Var};
use half::{bf16, f16};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{OptimError, Result};

/// Unbiased rounding driven by a seedable ChaCha stream.
#[derive(Debug, Clone)]
pub struct StochasticRounder {
    rng: ChaCha8Rng,
}

impl Default for StochasticRounder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StochasticRounder {
    /// Create a rounder. `None` seeds from the thread RNG.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        Self { rng }
    }

    /// Round to one of the two neighbouring integers.
    ///
    /// NaN and infinities are returned unchanged.
    pub fn round_scalar(&mut self, x: f32) -> f32 {
        if !x.is_finite() {
            return x;
        }
        let floor = x.floor();
        let frac = x - floor;
        if self.rng.random::<f32>() < frac {
            floor + 1.0
        } else {
            floor
        }
    }

    /// Round every element to a neighbouring integer.
    pub fn round_slice(&mut self, values: &[f32]) -> Vec<f32> {
        values.iter().map(|&v| self.round_scalar(v)).collect()
    }

    /// Round to one of the two neighbouring `bf16` values.
    ///
    /// Adds 16 random low bits to the `f32` pattern and truncates, which
    /// carries into the kept bits with probability equal to the discarded
    /// fraction.
    #[allow(clippy::cast_possible_truncation)]
    pub fn round_bf16(&mut self, x: f32) -> bf16 {
        if !x.is_finite() {
            return bf16::from_f32(x);
        }
        let noise = self.rng.random::<u32>() & 0xFFFF;
        let bits = x.to_bits().wrapping_add(noise) & 0xFFFF_0000;
        bf16::from_bits((bits >> 16) as u16)
    }

    /// Round to one of the two neighbouring `f16` values.
    pub fn round_f16(&mut self, x: f32) -> f16 {
        let nearest = f16::from_f32(x);
        if !x.is_finite() || nearest.is_infinite() {
            return nearest;
        }
        let nearest_val = nearest.to_f32();
        let err = x - nearest_val;
        if err == 0.0 {
            return nearest;
        }

        let adjacent = if err > 0.0 {
            next_f16_up(nearest)
        } else {
            next_f16_down(nearest)
        };
        let gap = (adjacent.to_f32() - nearest_val).abs();
        if !gap.is_finite() || gap == 0.0 {
            return nearest;
        }

        if self.rng.random::<f32>() < err.abs() / gap {
            adjacent
        } else {
            nearest
        }
    }

    /// Round a tensor element-wise into `dtype`.
    ///
    /// `f32` and `f64` targets are exact conversions.
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::UnsupportedDType`] for non-float targets.
    pub fn round_to_dtype(&mut self, src: &Tensor, dtype: DType) -> Result<Tensor> {
        match dtype {
            DType::F32 | DType::F64 => Ok(src.to_dtype(dtype)?),
            DType::BF16 => {
                let values = host_f32(src)?;
                let rounded: Vec<bf16> = values.iter().map(|&v| self.round_bf16(v)).collect();
                Ok(Tensor::from_vec(rounded, src.shape().clone(), src.device())?)
            }
            DType::F16 => {
                let values = host_f32(src)?;
                let rounded: Vec<f16> = values.iter().map(|&v| self.round_f16(v)).collect();
                Ok(Tensor::from_vec(rounded, src.shape().clone(), src.device())?)
            }
            other => Err(OptimError::UnsupportedDType(format!(
                "cannot stochastically round into {other:?}"
            ))),
        }
    }

    /// Round `src` into `target`'s dtype and write it into `target` in place.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch, a non-float target, or a failed
    /// tensor write.
    pub fn copy_stochastic(&mut self, target: &Var, src: &Tensor) -> Result<()> {
        if target.dims() != src.dims() {
            return Err(OptimError::ShapeMismatch {
                expected: target.dims().to_vec(),
                actual: src.dims().to_vec(),
            });
        }
        let rounded = self
            .round_to_dtype(src, target.dtype())?
            .to_device(target.device())?;
        target.set(&rounded)?;
        Ok(())
    }
}

/// Flatten a tensor into host `f32` values.
pub(crate) fn host_f32(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

fn next_f16_up(h: f16) -> f16 {
    let bits = h.to_bits();
    if bits & 0x7FFF == 0 {
        return f16::from_bits(0x0001);
    }
    if bits & 0x8000 == 0 {
        f16::from_bits(bits + 1)
    } else {
        f16::from_bits(bits - 1)
    }
}

fn next_f16_down(h: f16) -> f16 {
    let bits = h.to_bits();
    if bits & 0x7FFF == 0 {
        return f16::from_bits(0x8001);
    }
    if bits & 0x8000 == 0 {
        f16::from_bits(bits - 1)
    } else {
        f16::from_bits(bits + 1)
    }
}
