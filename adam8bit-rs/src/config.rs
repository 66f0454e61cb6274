//! Hyperparameter configuration for the 8-bit Adam optimizer.
//!
//! One [`Adam8bitConfig`] applies to every parameter of a group. Values are
//! validated when the optimizer is built, never at the first step.

use serde::{Deserialize, Serialize};

use crate::error::{OptimError, Result};

/// Hyperparameters shared by a group of parameters.
///
/// # Example
///
/// ```
/// use adam8bit_rs::Adam8bitConfig;
///
/// let config = Adam8bitConfig::default()
///     .with_lr(3e-4)
///     .with_weight_decay(0.01)
///     .with_decouple(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adam8bitConfig {
    /// Learning rate.
    pub lr: f64,

    /// Decay rate of the first moment estimate.
    pub beta1: f64,

    /// Decay rate of the second moment estimate.
    pub beta2: f64,

    /// Term added to the denominator after the square root.
    pub eps: f64,

    /// Weight decay coefficient (0 disables decay).
    pub weight_decay: f64,

    /// Apply decay directly to the parameter (AdamW) instead of folding it
    /// into the gradient.
    pub decouple: bool,
}

impl Default for Adam8bitConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            decouple: true,
        }
    }
}

impl Adam8bitConfig {
    /// Set the learning rate.
    #[must_use]
    pub const fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    /// Set both beta coefficients.
    #[must_use]
    pub const fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Set epsilon.
    #[must_use]
    pub const fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Set the weight decay coefficient.
    #[must_use]
    pub const fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Select decoupled (AdamW) or coupled (L2) weight decay.
    #[must_use]
    pub const fn with_decouple(mut self, decouple: bool) -> Self {
        self.decouple = decouple;
        self
    }

    /// Check every hyperparameter.
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::InvalidConfig`] naming the first offending value.
    pub fn validate(&self) -> Result<()> {
        if !self.lr.is_finite() || self.lr < 0.0 {
            return Err(OptimError::InvalidConfig(format!(
                "invalid learning rate: {}",
                self.lr
            )));
        }
        if !self.eps.is_finite() || self.eps < 0.0 {
            return Err(OptimError::InvalidConfig(format!(
                "invalid epsilon value: {}",
                self.eps
            )));
        }
        for (index, beta) in [self.beta1, self.beta2].into_iter().enumerate() {
            if !(0.0..1.0).contains(&beta) {
                return Err(OptimError::InvalidConfig(format!(
                    "invalid beta parameter at index {index}: {beta}"
                )));
            }
        }
        if !self.weight_decay.is_finite() {
            return Err(OptimError::InvalidConfig(format!(
                "invalid weight decay: {}",
                self.weight_decay
            )));
        }
        Ok(())
    }

    /// Whether coupled (L2) decay is folded into the gradient.
    #[must_use]
    pub fn coupled_decay(&self) -> bool {
        self.weight_decay != 0.0 && !self.decouple
    }

    /// Whether decoupled (AdamW) decay scales the parameter.
    #[must_use]
    pub fn decoupled_decay(&self) -> bool {
        self.weight_decay != 0.0 && self.decouple
    }
}
