//! 8-bit quantized moment buffers.
//!
//! A [`QuantizedTensor`] stores one buffer as symmetric 8-bit codes in
//! `[-127, 127]` plus a single per-tensor scale:
//!
//! ```text
//! scale   = max(|x|) / 127          (floored at MIN_SCALE)
//! code[i] = clamp(sround(x[i] / scale), -127, 127)
//! x̂[i]    = code[i] * scale
//! ```
//!
//! Codes live on the owning parameter's device. Candle has no signed 8-bit
//! dtype, so they are held as `u8` in offset-binary form (`code + 127`).
//! A quantized tensor is never modified after construction; every optimizer
//! step replaces it with a fresh one.

use candle_core::{DType, Device, DeviceLocation, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{OptimError, Result};
use crate::rounding::{host_f32, StochasticRounder};

/// Largest code magnitude.
pub const QMAX: f32 = 127.0;

/// Scale used when a buffer is all zeros.
pub const MIN_SCALE: f32 = 1e-12;

/// Type tag of the persisted quantized form.
pub const QUANTIZED_TYPE_TAG: &str = "Auto8bitTensor";

const CODE_OFFSET: f32 = 127.0;

/// Signed 8-bit codes with their shape, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Int8Buffer {
    /// Tensor dimensions.
    pub shape: Vec<usize>,
    /// Row-major codes.
    pub data: Vec<i8>,
}

/// Plain copy of a [`QuantizedTensor`]'s fields.
///
/// `orig_dtype` is optional because some older checkpoints dropped
/// non-numeric metadata; it defaults to `f32` on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedSnapshot {
    /// Quantized codes.
    pub quantized: Int8Buffer,
    /// Dequantization scale.
    pub scale: f32,
    /// Element type to reconstruct on dequantization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_dtype: Option<String>,
}

/// One moment buffer in 8-bit form.
#[derive(Clone)]
pub struct QuantizedTensor {
    codes: Tensor,
    scale: f32,
    orig_dtype: DType,
}

impl std::fmt::Debug for QuantizedTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizedTensor")
            .field("shape", &self.dims())
            .field("scale", &self.scale)
            .field("orig_dtype", &self.orig_dtype)
            .field("location", &self.location())
            .finish_non_exhaustive()
    }
}

impl QuantizedTensor {
    /// Quantize a floating-point buffer with stochastic rounding.
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::NonFinite`] if any element is NaN or infinite,
    /// or an error if the buffer cannot be read back from its device.
    pub fn quantize(src: &Tensor, rounder: &mut StochasticRounder) -> Result<Self> {
        let values = host_f32(src)?;
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(OptimError::NonFinite(format!(
                "element {index} is {} in a buffer of shape {:?}",
                values[index],
                src.dims()
            )));
        }
        let abs_max = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let scale = (abs_max / QMAX).max(MIN_SCALE);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let codes: Vec<u8> = values
            .iter()
            .map(|&v| (rounder.round_scalar(v / scale).clamp(-QMAX, QMAX) + CODE_OFFSET) as u8)
            .collect();

        Ok(Self {
            codes: Tensor::from_vec(codes, src.shape().clone(), src.device())?,
            scale,
            orig_dtype: src.dtype(),
        })
    }

    /// All-zero buffer, quantized without drawing random numbers.
    ///
    /// # Errors
    ///
    /// Returns an error if the code tensor cannot be allocated.
    pub fn zeros(dims: &[usize], orig_dtype: DType, device: &Device) -> Result<Self> {
        let count: usize = dims.iter().product();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let codes = vec![CODE_OFFSET as u8; count];
        Ok(Self {
            codes: Tensor::from_vec(codes, dims, device)?,
            scale: MIN_SCALE,
            orig_dtype,
        })
    }

    /// Reconstruct in `f32`, the precision all moment arithmetic runs in.
    ///
    /// # Errors
    ///
    /// Returns an error on tensor failure.
    pub fn dequantize_f32(&self) -> Result<Tensor> {
        let scale = f64::from(self.scale);
        let offset = -f64::from(CODE_OFFSET) * scale;
        Ok(self.codes.to_dtype(DType::F32)?.affine(scale, offset)?)
    }

    /// Reconstruct in the original element type.
    ///
    /// # Errors
    ///
    /// Returns an error on tensor failure.
    pub fn dequantize(&self) -> Result<Tensor> {
        Ok(self.dequantize_f32()?.to_dtype(self.orig_dtype)?)
    }

    /// Copy the fields out for persistence.
    ///
    /// The snapshot owns host memory, so later changes to live state never
    /// reach it.
    ///
    /// # Errors
    ///
    /// Returns an error if the codes cannot be copied to the host.
    pub fn snapshot(&self) -> Result<QuantizedSnapshot> {
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let data: Vec<i8> = self
            .codes
            .flatten_all()?
            .to_vec1::<u8>()?
            .into_iter()
            .map(|c| (i16::from(c) - 127) as i8)
            .collect();

        Ok(QuantizedSnapshot {
            quantized: Int8Buffer {
                shape: self.dims().to_vec(),
                data,
            },
            scale: self.scale,
            orig_dtype: Some(self.orig_dtype.as_str().to_string()),
        })
    }

    /// Rebuild from a snapshot, placing the codes on `device`.
    ///
    /// A missing `orig_dtype` defaults to `f32`. A code of `-128` is clamped to
    /// `-127`. A zero scale is raised to [`MIN_SCALE`] only when every code is
    /// zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the code count does not match the shape, the
    /// scale is negative or not finite, the scale is zero under nonzero codes,
    /// or `orig_dtype` names an unknown or non-float type.
    pub fn restore(snapshot: &QuantizedSnapshot, device: &Device) -> Result<Self> {
        let shape = &snapshot.quantized.shape;
        let expected: usize = shape.iter().product();
        if snapshot.quantized.data.len() != expected {
            return Err(OptimError::InvalidSnapshot(format!(
                "{} codes for shape {shape:?}",
                snapshot.quantized.data.len()
            )));
        }
        if !snapshot.scale.is_finite() || snapshot.scale < 0.0 {
            return Err(OptimError::InvalidSnapshot(format!(
                "scale {} is not a finite non-negative number",
                snapshot.scale
            )));
        }
        if snapshot.scale <= 0.0 && snapshot.quantized.data.iter().any(|&c| c != 0) {
            return Err(OptimError::InvalidSnapshot(
                "zero scale with nonzero codes".to_string(),
            ));
        }

        let orig_dtype = match snapshot.orig_dtype.as_deref() {
            None => DType::F32,
            Some(tag) => parse_dtype_tag(tag)
                .ok_or_else(|| OptimError::UnsupportedDType(format!("orig_dtype '{tag}'")))?,
        };

        #[allow(clippy::cast_sign_loss)]
        let codes: Vec<u8> = snapshot
            .quantized
            .data
            .iter()
            .map(|&c| (i16::from(c.max(-127)) + 127) as u8)
            .collect();

        Ok(Self {
            codes: Tensor::from_vec(codes, shape.as_slice(), device)?,
            scale: if snapshot.scale > 0.0 {
                snapshot.scale
            } else {
                MIN_SCALE
            },
            orig_dtype,
        })
    }

    /// Copy onto another device, returning a new tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails.
    pub fn relocate(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            codes: self.codes.to_device(device)?,
            scale: self.scale,
            orig_dtype: self.orig_dtype,
        })
    }

    /// Dequantization scale. Always strictly positive.
    #[must_use]
    pub const fn scale(&self) -> f32 {
        self.scale
    }

    /// Element type restored by [`Self::dequantize`].
    #[must_use]
    pub const fn orig_dtype(&self) -> DType {
        self.orig_dtype
    }

    /// Tensor dimensions.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        self.codes.dims()
    }

    /// Device holding the codes.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.codes.device()
    }

    /// Location tag of the codes.
    #[must_use]
    pub fn location(&self) -> DeviceLocation {
        self.codes.device().location()
    }

    /// Number of elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.codes.elem_count()
    }

    /// Bytes held: one per code plus the scale.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.elem_count() + std::mem::size_of::<f32>()
    }
}

/// Parse a persisted dtype tag.
///
/// Accepts candle's short names (`f32`, `bf16`, ...), the long names
/// (`float32`, `bfloat16`, ...) and a `torch.` prefix. Only float types are
/// recognised.
#[must_use]
pub fn parse_dtype_tag(tag: &str) -> Option<DType> {
    let name = tag.trim();
    let name = name.strip_prefix("torch.").unwrap_or(name);
    match name {
        "f32" | "float32" | "float" => Some(DType::F32),
        "f16" | "float16" | "half" => Some(DType::F16),
        "bf16" | "bfloat16" => Some(DType::BF16),
        "f64" | "float64" | "double" => Some(DType::F64),
        _ => None,
    }
}
