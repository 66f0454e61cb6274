//! # adam8bit-rs
//!
//! Adam with 8-bit quantized moment state and stochastic rounding, for
//! [candle](https://github.com/huggingface/candle) training loops.
//!
//! Both Adam moments are stored as signed 8-bit codes with one `f32` scale per
//! tensor, cutting optimizer memory to roughly a quarter of `f32` moments.
//! Every rounding step (quantization, writing updated parameters back into
//! `bf16`/`f16`, gradient accumulation) is stochastic and therefore unbiased
//! in expectation.
//!
//! ## Key Properties
//!
//! - **Compact**: one byte per moment element plus one scale per tensor
//! - **Unbiased**: stochastic rounding everywhere precision is lost
//! - **All-or-nothing steps**: a failed step leaves parameters and state untouched
//! - **Checkpoint compatible**: reads the tagged and the legacy flat moment encodings
//!
//! ## Quick Start
//!
//! ```no_run
//! use adam8bit_rs::{Adam8bit, Adam8bitConfig};
//! use candle_core::{DType, Device, Var};
//! use candle_nn::Optimizer;
//!
//! let w = Var::zeros((16, 16), DType::BF16, &Device::Cpu)?;
//! let config = Adam8bitConfig::default().with_lr(1e-3).with_weight_decay(0.01);
//! let mut opt = Adam8bit::new(vec![w.clone()], config)?;
//!
//! for _ in 0..10 {
//!     let loss = w.as_tensor().to_dtype(DType::F32)?.sqr()?.sum_all()?;
//!     opt.backward_step(&loss)?;
//! }
//!
//! opt.state_dict()?.save_json("optimizer.json")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Hyperparameters
//! - [`error`]: Error types and result aliases
//! - [`optimizer`]: The [`Adam8bit`] optimizer
//! - [`quantized`]: 8-bit per-tensor quantized buffers
//! - [`rounding`]: Stochastic rounding into narrower float types
//! - [`accumulator`]: Gradient accumulation for reduced-precision parameters
//! - [`state`]: Per-parameter optimizer state
//! - [`codec`]: Persisted state format
//! - [`inspect`]: Checkpoint format survey
//! - [`support`]: Backend availability probes

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod accumulator;
pub mod codec;
pub mod config;
pub mod error;
pub mod inspect;
pub mod optimizer;
pub mod quantized;
pub mod rounding;
pub mod state;
pub mod support;

// Re-export main types at crate root for convenience
pub use accumulator::GradientAccumulator;
pub use codec::{OptimizerStateDict, PersistedGroup, PersistedState, StateCodec};
pub use config::Adam8bitConfig;
pub use error::{ImportFailure, OptimError, Result};
pub use inspect::{survey, FormatSurvey};
pub use optimizer::{Adam8bit, ImportReport, MemoryStats, ParamGroup};
pub use quantized::{QuantizedSnapshot, QuantizedTensor};
pub use rounding::StochasticRounder;
pub use state::{MomentValue, OptimizerState, ParamId};
pub use support::{require_backend, AdvisorySink, BackendProbe, CandleProbe, TracingAdvisory};
