//! Adam with 8-bit moment state and stochastic rounding.
//!
//! Per step and per parameter:
//!
//! 1. read the gradient (an accumulated one takes precedence) and an `f32`
//!    copy of the parameter
//! 2. fold coupled weight decay into the gradient
//! 3. initialise zeroed moments on the first step
//! 4. repair moments still in a persisted encoding and move them to the
//!    parameter's device
//! 5. dequantize both moments
//! 6. advance the step counter and compute bias corrections
//! 7. update the moment EMAs
//! 8. apply decoupled weight decay
//! 9. take the bias-corrected Adam step, with `eps` added after the square root
//! 10. stochastically round the parameter back into its storage type
//! 11. requantize both moments into fresh buffers
//!
//! A step is all-or-nothing: every touched parameter is validated before any
//! is written, and updates are computed into locals and committed together.

use std::collections::{HashMap, HashSet};

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use tracing::{debug, trace, warn};

use crate::accumulator::GradientAccumulator;
use crate::codec::{observed_keys, OptimizerStateDict, PersistedGroup, PersistedState, StateCodec};
use crate::config::Adam8bitConfig;
use crate::error::{ImportFailure, OptimError, Result};
use crate::quantized::QuantizedTensor;
use crate::rounding::StochasticRounder;
use crate::state::{MomentValue, OptimizerState, ParamId};

/// Parameters sharing one set of hyperparameters.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Trainable parameters.
    pub params: Vec<Var>,
    /// Hyperparameters.
    pub config: Adam8bitConfig,
}

impl ParamGroup {
    /// Create a group.
    #[must_use]
    pub fn new(params: Vec<Var>, config: Adam8bitConfig) -> Self {
        Self { params, config }
    }
}

/// State entry that failed to import, kept until the caller resets it.
#[derive(Debug, Clone)]
struct Quarantined {
    failure: ImportFailure,
    raw: PersistedState,
}

/// Summary of a [`Adam8bit::load_state_dict`] call.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    /// Number of parameter states restored.
    pub restored: usize,
    /// Number of restored buffers moved onto their parameter's device.
    pub relocated: usize,
    /// Failed fields. Affected parameters refuse to step until reset.
    pub failures: Vec<ImportFailure>,
}

impl ImportReport {
    /// Whether every entry was restored.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn the first failure into an error, for callers that hard-fail.
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::Import`] if any entry failed.
    pub fn into_result(self) -> Result<usize> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(OptimError::Import(failure)),
            None => Ok(self.restored),
        }
    }
}

/// Memory used by moment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Parameters with state.
    pub params: usize,
    /// Bytes held by the quantized moments.
    pub quantized_bytes: usize,
    /// Bytes the same moments would take in `f32`.
    pub full_precision_bytes: usize,
}

impl MemoryStats {
    /// Fraction of moment memory saved versus `f32` storage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn savings(&self) -> f32 {
        if self.full_precision_bytes == 0 {
            return 0.0;
        }
        1.0 - self.quantized_bytes as f32 / self.full_precision_bytes as f32
    }
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Params: {} | Moments: {} B (f32: {} B) | Memory saved: {:.1}%",
            self.params,
            self.quantized_bytes,
            self.full_precision_bytes,
            self.savings() * 100.0
        )
    }
}

/// Adam optimizer storing both moments as 8-bit quantized buffers.
///
/// # Example
///
/// ```no_run
/// use adam8bit_rs::{Adam8bit, Adam8bitConfig, ParamGroup};
/// use candle_core::{DType, Device, Var};
///
/// let w = Var::zeros((4, 4), DType::BF16, &Device::Cpu)?;
/// let config = Adam8bitConfig::default().with_lr(1e-3);
/// let mut opt = Adam8bit::from_groups(vec![ParamGroup::new(vec![w], config)], Some(0))?;
///
/// // let grads = loss.backward()?;
/// // opt.step(&grads)?;
/// let saved = opt.state_dict()?;
/// opt.load_state_dict(&saved)?.into_result()?;
/// # Ok::<(), adam8bit_rs::OptimError>(())
/// ```
pub struct Adam8bit {
    groups: Vec<ParamGroup>,
    state: HashMap<ParamId, OptimizerState>,
    quarantine: HashMap<ParamId, Quarantined>,
    accumulator: GradientAccumulator,
    reduced_precision: HashSet<ParamId>,
    rounder: StochasticRounder,
}

impl std::fmt::Debug for Adam8bit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adam8bit")
            .field("groups", &self.groups.len())
            .field("params", &self.num_params())
            .field("states", &self.state.len())
            .field("quarantined", &self.quarantine.len())
            .finish_non_exhaustive()
    }
}

/// Work item for one parameter in a step.
struct Prepared {
    id: ParamId,
    group: usize,
    var: Var,
    grad: Tensor,
    state: OptimizerState,
}

/// Computed result for one parameter, not yet committed.
struct Update {
    id: ParamId,
    var: Var,
    param: Tensor,
    state: OptimizerState,
}

impl Adam8bit {
    /// Build from parameter groups.
    ///
    /// Every group is validated here, never at the first step.
    ///
    /// # Arguments
    ///
    /// * `groups` - Parameter groups; ids are assigned in order
    /// * `seed` - Seed for stochastic rounding (`None` for a random seed)
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::InvalidConfig`] for invalid hyperparameters and
    /// [`OptimError::UnsupportedDType`] for non-float parameters.
    pub fn from_groups(groups: Vec<ParamGroup>, seed: Option<u64>) -> Result<Self> {
        let mut reduced_precision = HashSet::new();
        let mut id = 0;
        for group in &groups {
            group.config.validate()?;
            for var in &group.params {
                match var.dtype() {
                    DType::F32 | DType::F64 => {}
                    DType::BF16 | DType::F16 => {
                        reduced_precision.insert(id);
                    }
                    other => {
                        return Err(OptimError::UnsupportedDType(format!(
                            "param {id} has non-float dtype {other:?}"
                        )))
                    }
                }
                id += 1;
            }
        }

        debug!(
            groups = groups.len(),
            params = id,
            reduced_precision = reduced_precision.len(),
            "built Adam8bit"
        );

        Ok(Self {
            groups,
            state: HashMap::new(),
            quarantine: HashMap::new(),
            accumulator: GradientAccumulator::new(),
            reduced_precision,
            rounder: StochasticRounder::new(seed),
        })
    }

    /// Build a single group from `vars`.
    ///
    /// # Errors
    ///
    /// See [`Self::from_groups`].
    pub fn from_vars(vars: Vec<Var>, config: Adam8bitConfig) -> Result<Self> {
        Self::from_groups(vec![ParamGroup::new(vars, config)], None)
    }

    /// Parameter groups.
    #[must_use]
    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Total number of registered parameters.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.groups.iter().map(|g| g.params.len()).sum()
    }

    /// Set the learning rate of one group.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown group or an invalid rate.
    pub fn set_group_learning_rate(&mut self, group: usize, lr: f64) -> Result<()> {
        let count = self.groups.len();
        let slot = self
            .groups
            .get_mut(group)
            .ok_or_else(|| OptimError::InvalidParam(format!("group {group} of {count}")))?;
        let config = slot.config.with_lr(lr);
        config.validate()?;
        slot.config = config;
        Ok(())
    }

    /// Whether any parameter is stored below `f32` precision and therefore
    /// takes accumulated gradients.
    #[must_use]
    pub fn uses_stochastic_accumulation(&self) -> bool {
        !self.reduced_precision.is_empty()
    }

    /// Full-precision moments are never required.
    #[must_use]
    pub const fn supports_memory_efficient_fp16(&self) -> bool {
        false
    }

    /// Parameters may be flattened into one buffer by the caller.
    #[must_use]
    pub const fn supports_flat_params(&self) -> bool {
        true
    }

    /// The parameter with id `id`.
    #[must_use]
    pub fn param(&self, id: ParamId) -> Option<&Var> {
        self.groups.iter().flat_map(|g| &g.params).nth(id)
    }

    /// State of parameter `id`, if it has stepped or been loaded.
    #[must_use]
    pub fn state(&self, id: ParamId) -> Option<&OptimizerState> {
        self.state.get(&id)
    }

    /// Import failure that is blocking parameter `id`, if any.
    #[must_use]
    pub fn quarantined(&self, id: ParamId) -> Option<&ImportFailure> {
        self.quarantine.get(&id).map(|q| &q.failure)
    }

    /// Replace the state of parameter `id`.
    ///
    /// Moments may be given in raw persisted form; they are repaired at the
    /// next step.
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::InvalidParam`] for an unknown id.
    pub fn set_state(&mut self, id: ParamId, state: OptimizerState) -> Result<()> {
        self.check_id(id)?;
        self.quarantine.remove(&id);
        self.state.insert(id, state);
        Ok(())
    }

    /// Drop the state of parameter `id`, including any quarantined import.
    ///
    /// The next step starts it from zeroed moments. This is the explicit
    /// fall-back after a failed import.
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::InvalidParam`] for an unknown id.
    pub fn reset_state(&mut self, id: ParamId) -> Result<()> {
        self.check_id(id)?;
        self.state.remove(&id);
        if self.quarantine.remove(&id).is_some() {
            warn!(param_id = id, "discarding quarantined optimizer state");
        }
        Ok(())
    }

    /// Add a gradient to the accumulation buffer of a reduced-precision
    /// parameter. Call after each backward pass and before [`Self::step`].
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::InvalidParam`] for an unknown id or an `f32`/`f64`
    /// parameter, or a shape error.
    pub fn accumulate_grad(&mut self, id: ParamId, grad: &Tensor) -> Result<()> {
        if !self.reduced_precision.contains(&id) {
            return Err(OptimError::InvalidParam(format!(
                "param {id} is not a reduced-precision parameter"
            )));
        }
        let var = self
            .param(id)
            .cloned()
            .ok_or_else(|| OptimError::InvalidParam(format!("unknown param {id}")))?;
        self.accumulator
            .accumulate(id, var.as_tensor(), grad, &mut self.rounder)
    }

    /// Whether parameter `id` has an accumulated gradient pending.
    #[must_use]
    pub fn has_accumulated_grad(&self, id: ParamId) -> bool {
        self.accumulator.contains(id)
    }

    /// Take one optimization step with gradients from a backward pass.
    ///
    /// # Errors
    ///
    /// See [`Self::step_with`].
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let supplied: HashMap<ParamId, Tensor> = self
            .groups
            .iter()
            .flat_map(|g| &g.params)
            .enumerate()
            .filter_map(|(id, var)| grads.get(var.as_tensor()).map(|g| (id, g.clone())))
            .collect();
        self.step_with(&supplied)
    }

    /// Take one optimization step with explicit per-parameter gradients.
    ///
    /// Accumulated gradients take precedence over supplied ones and are
    /// consumed. Parameters with neither are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::StateCorruption`] if a state entry is neither a
    /// live buffer nor a recognised encoding, or a shape/tensor error. No
    /// parameter or state is modified when an error is returned.
    pub fn step_with(&mut self, grads: &HashMap<ParamId, Tensor>) -> Result<()> {
        let prepared = self.prepare(grads)?;

        let mut updates = Vec::with_capacity(prepared.len());
        for item in prepared {
            let config = self.groups[item.group].config;
            updates.push(self.compute_update(item, &config)?);
        }

        debug!(params = updates.len(), "Adam8bit step");
        for update in updates {
            update.var.set(&update.param)?;
            self.accumulator.take(update.id);
            self.state.insert(update.id, update.state);
        }
        Ok(())
    }

    /// Collect gradients and repaired state for every parameter to update.
    fn prepare(&self, grads: &HashMap<ParamId, Tensor>) -> Result<Vec<Prepared>> {
        let mut prepared = Vec::new();
        let mut id = 0;
        for (group, g) in self.groups.iter().enumerate() {
            for var in &g.params {
                let grad = self
                    .accumulator
                    .get(id)
                    .or_else(|| grads.get(&id))
                    .cloned();
                if let Some(grad) = grad {
                    if grad.dims() != var.dims() {
                        return Err(OptimError::ShapeMismatch {
                            expected: var.dims().to_vec(),
                            actual: grad.dims().to_vec(),
                        });
                    }
                    let state = self.repaired_state(id, var)?;
                    prepared.push(Prepared {
                        id,
                        group,
                        var: var.clone(),
                        grad,
                        state,
                    });
                }
                id += 1;
            }
        }
        Ok(prepared)
    }

    /// Current state of `id` normalized for `var`, or fresh zeroed state.
    fn repaired_state(&self, id: ParamId, var: &Var) -> Result<OptimizerState> {
        if let Some(q) = self.quarantine.get(&id) {
            return Err(OptimError::StateCorruption {
                param_id: id,
                field: q.failure.field.clone(),
                observed_keys: q.failure.observed_keys.clone(),
            });
        }

        let Some(current) = self.state.get(&id) else {
            return OptimizerState::zeroed(var.dims(), var.device());
        };

        let mut state = current.clone();
        state.exp_avg = repair_moment(id, "exp_avg", &current.exp_avg, var)?;
        state.exp_avg_sq = repair_moment(id, "exp_avg_sq", &current.exp_avg_sq, var)?;
        Ok(state)
    }

    /// Run the Adam update for one parameter without touching live state.
    fn compute_update(&mut self, item: Prepared, config: &Adam8bitConfig) -> Result<Update> {
        let Prepared {
            id,
            var,
            grad,
            state,
            ..
        } = item;
        let compute = if var.dtype() == DType::F64 {
            DType::F64
        } else {
            DType::F32
        };

        let mut grad = grad.to_device(var.device())?.to_dtype(compute)?;
        let mut param = var.as_tensor().to_dtype(compute)?;

        if config.coupled_decay() {
            grad = grad.add(&param.affine(config.weight_decay, 0.0)?)?;
        }

        let (Some(m), Some(v)) = (state.exp_avg.as_quantized(), state.exp_avg_sq.as_quantized())
        else {
            return Err(OptimError::StateCorruption {
                param_id: id,
                field: "exp_avg".to_string(),
                observed_keys: Vec::new(),
            });
        };
        let exp_avg = m.dequantize_f32()?.to_dtype(compute)?;
        let exp_avg_sq = v.dequantize_f32()?.to_dtype(compute)?;

        let step = state.step + 1;
        #[allow(clippy::cast_precision_loss)]
        let t = step as f64;
        let bias_correction1 = 1.0 - config.beta1.powf(t);
        let bias_correction2 = 1.0 - config.beta2.powf(t);

        let exp_avg = exp_avg
            .affine(config.beta1, 0.0)?
            .add(&grad.affine(1.0 - config.beta1, 0.0)?)?;
        let exp_avg_sq = exp_avg_sq
            .affine(config.beta2, 0.0)?
            .add(&grad.sqr()?.affine(1.0 - config.beta2, 0.0)?)?;

        if config.decoupled_decay() {
            param = param.affine(1.0 - config.lr * config.weight_decay, 0.0)?;
        }

        let step_size = config.lr / bias_correction1;
        let denom = exp_avg_sq
            .sqrt()?
            .affine(1.0 / bias_correction2.sqrt(), config.eps)?;
        let param = param.sub(&exp_avg.div(&denom)?.affine(step_size, 0.0)?)?;

        let param = self.rounder.round_to_dtype(&param, var.dtype())?;
        let exp_avg = QuantizedTensor::quantize(&exp_avg.to_dtype(DType::F32)?, &mut self.rounder)?;
        let exp_avg_sq =
            QuantizedTensor::quantize(&exp_avg_sq.to_dtype(DType::F32)?, &mut self.rounder)?;

        trace!(
            param_id = id,
            step,
            exp_avg_scale = exp_avg.scale(),
            exp_avg_sq_scale = exp_avg_sq.scale(),
            "updated parameter"
        );

        Ok(Update {
            id,
            var,
            param,
            state: OptimizerState {
                step,
                exp_avg: exp_avg.into(),
                exp_avg_sq: exp_avg_sq.into(),
                extra: state.extra,
            },
        })
    }

    /// Export hyperparameters and all state in the persisted encoding.
    ///
    /// Quarantined entries are written back verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffer cannot be copied out.
    pub fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut state = StateCodec::export(&self.state)?;
        for (&id, q) in &self.quarantine {
            state.insert(id, q.raw.clone());
        }

        let mut next = 0;
        let param_groups = self
            .groups
            .iter()
            .map(|g| {
                let params = (next..next + g.params.len()).collect();
                next += g.params.len();
                PersistedGroup {
                    config: g.config,
                    params,
                }
            })
            .collect();

        Ok(OptimizerStateDict {
            state,
            param_groups,
        })
    }

    /// Restore hyperparameters and state.
    ///
    /// Existing state is replaced. Entries that fail to decode do not abort
    /// the load: they are listed in the report and block their parameter's
    /// next step with [`OptimError::StateCorruption`] until
    /// [`Self::reset_state`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`OptimError::InvalidConfig`] if the group layout does not
    /// match this optimizer or a group's hyperparameters are invalid.
    pub fn load_state_dict(&mut self, dict: &OptimizerStateDict) -> Result<ImportReport> {
        let configs = self.check_groups(&dict.param_groups)?;

        let num_params = self.num_params();
        let mut outcome = StateCodec::import(&dict.state);
        let mut report = ImportReport::default();
        let mut state = HashMap::with_capacity(outcome.states.len());

        let mut ids: Vec<ParamId> = outcome.states.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(mut entry) = outcome.states.remove(&id) else {
                continue;
            };
            let Some(var) = self.param(id) else {
                outcome.failures.push(ImportFailure {
                    param_id: id,
                    field: String::new(),
                    observed_keys: dict.state[&id].keys().cloned().collect(),
                    reason: format!("no parameter with this id ({num_params} registered)"),
                });
                continue;
            };
            match place_state(&mut entry, id, var) {
                Ok(moved) => {
                    report.relocated += moved;
                    state.insert(id, entry);
                }
                Err(failure) => outcome.failures.push(failure),
            }
        }

        let mut quarantine = HashMap::new();
        for failure in &outcome.failures {
            warn!(
                param_id = failure.param_id,
                field = %failure.field,
                keys = ?failure.observed_keys,
                reason = %failure.reason,
                "optimizer state entry failed to import"
            );
            if let Some(raw) = dict.state.get(&failure.param_id) {
                if self.param(failure.param_id).is_some() {
                    quarantine
                        .entry(failure.param_id)
                        .or_insert_with(|| Quarantined {
                            failure: failure.clone(),
                            raw: raw.clone(),
                        });
                }
            }
        }

        if let Some(configs) = configs {
            for (group, config) in self.groups.iter_mut().zip(configs) {
                group.config = config;
            }
        }

        report.restored = state.len();
        report.failures = outcome.failures;
        self.state = state;
        self.quarantine = quarantine;

        debug!(
            restored = report.restored,
            relocated = report.relocated,
            failed = report.failures.len(),
            "loaded optimizer state"
        );
        Ok(report)
    }

    /// Memory held by moment state versus `f32` storage.
    #[must_use]
    pub fn memory_stats(&self) -> MemoryStats {
        let quantized_bytes = self.state.values().map(OptimizerState::memory_bytes).sum();
        let full_precision_bytes = self
            .state
            .iter()
            .filter_map(|(&id, _)| self.param(id))
            .map(|var| 2 * var.elem_count() * std::mem::size_of::<f32>())
            .sum();
        MemoryStats {
            params: self.state.len(),
            quantized_bytes,
            full_precision_bytes,
        }
    }

    fn check_id(&self, id: ParamId) -> Result<()> {
        if id < self.num_params() {
            Ok(())
        } else {
            Err(OptimError::InvalidParam(format!(
                "unknown param {id} ({} registered)",
                self.num_params()
            )))
        }
    }

    /// Validate persisted groups against this optimizer's layout.
    fn check_groups(&self, groups: &[PersistedGroup]) -> Result<Option<Vec<Adam8bitConfig>>> {
        if groups.is_empty() {
            return Ok(None);
        }
        if groups.len() != self.groups.len() {
            return Err(OptimError::InvalidConfig(format!(
                "loaded state has {} parameter groups, optimizer has {}",
                groups.len(),
                self.groups.len()
            )));
        }
        for (index, (saved, live)) in groups.iter().zip(&self.groups).enumerate() {
            if saved.params.len() != live.params.len() {
                return Err(OptimError::InvalidConfig(format!(
                    "group {index}: loaded state has {} parameters, optimizer has {}",
                    saved.params.len(),
                    live.params.len()
                )));
            }
            saved.config.validate()?;
        }
        Ok(Some(groups.iter().map(|g| g.config).collect()))
    }
}

impl candle_nn::Optimizer for Adam8bit {
    type Config = Adam8bitConfig;

    fn new(vars: Vec<Var>, config: Self::Config) -> candle_core::Result<Self> {
        Self::from_vars(vars, config).map_err(candle_core::Error::wrap)
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        Adam8bit::step(self, grads).map_err(candle_core::Error::wrap)
    }

    fn learning_rate(&self) -> f64 {
        self.groups.first().map_or(0.0, |g| g.config.lr)
    }

    /// Invalid rates are ignored with a warning, since this cannot fail.
    fn set_learning_rate(&mut self, lr: f64) {
        if let Err(e) = self
            .groups
            .iter()
            .try_for_each(|g| g.config.with_lr(lr).validate())
        {
            warn!(lr, error = %e, "ignoring invalid learning rate");
            return;
        }
        for group in &mut self.groups {
            group.config.lr = lr;
        }
    }
}

/// Normalize one moment for `var`: decode a raw payload, move to the
/// parameter's device, and check the shape.
fn repair_moment(id: ParamId, field: &str, value: &MomentValue, var: &Var) -> Result<MomentValue> {
    let q = match value {
        MomentValue::Quantized(q) => relocated(q, id, field, var.device())?,
        MomentValue::RawLegacy(raw) => {
            let q = StateCodec::restore_moment(raw, var.device()).map_err(|_| {
                OptimError::StateCorruption {
                    param_id: id,
                    field: field.to_string(),
                    observed_keys: observed_keys(raw),
                }
            })?;
            debug!(param_id = id, field, "repaired legacy moment encoding");
            q
        }
    };
    if q.dims() != var.dims() {
        return Err(OptimError::ShapeMismatch {
            expected: var.dims().to_vec(),
            actual: q.dims().to_vec(),
        });
    }
    Ok(MomentValue::Quantized(q))
}

fn relocated(q: &QuantizedTensor, id: ParamId, field: &str, device: &Device) -> Result<QuantizedTensor> {
    if q.device().same_device(device) {
        return Ok(q.clone());
    }
    debug!(
        param_id = id,
        field,
        from = ?q.location(),
        to = ?device.location(),
        "relocating quantized moment"
    );
    q.relocate(device)
}

/// Move a freshly imported state onto `var`'s device and check shapes.
///
/// Returns the number of buffers moved.
fn place_state(
    state: &mut OptimizerState,
    id: ParamId,
    var: &Var,
) -> std::result::Result<usize, ImportFailure> {
    let mut moved = 0;
    for (field, moment) in [
        ("exp_avg", &mut state.exp_avg),
        ("exp_avg_sq", &mut state.exp_avg_sq),
    ] {
        let MomentValue::Quantized(q) = moment else {
            continue;
        };
        let fail = |reason: String| ImportFailure {
            param_id: id,
            field: field.to_string(),
            observed_keys: Vec::new(),
            reason,
        };
        if q.dims() != var.dims() {
            return Err(fail(format!(
                "shape {:?} does not match parameter shape {:?}",
                q.dims(),
                var.dims()
            )));
        }
        if !q.device().same_device(var.device()) {
            *q = relocated(q, id, field, var.device()).map_err(|e| fail(e.to_string()))?;
            moved += 1;
        }
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::rounding::host_f32;

    fn single(values: &[f32], dtype: DType, config: Adam8bitConfig) -> (Adam8bit, Var) {
        let t = Tensor::new(values, &Device::Cpu)
            .unwrap()
            .to_dtype(dtype)
            .unwrap();
        let var = Var::from_tensor(&t).unwrap();
        let opt =
            Adam8bit::from_groups(vec![ParamGroup::new(vec![var.clone()], config)], Some(0))
                .unwrap();
        (opt, var)
    }

    fn grads(id: ParamId, values: &[f32]) -> HashMap<ParamId, Tensor> {
        let mut map = HashMap::new();
        map.insert(id, Tensor::new(values, &Device::Cpu).unwrap());
        map
    }

    fn values(var: &Var) -> Vec<f32> {
        host_f32(var.as_tensor()).unwrap()
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let var = Var::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let config = Adam8bitConfig::default().with_betas(1.5, 0.999);
        let err = Adam8bit::from_groups(vec![ParamGroup::new(vec![var], config)], None)
            .unwrap_err();
        assert!(matches!(err, OptimError::InvalidConfig(_)));
    }

    #[test]
    fn test_non_float_param_rejected() {
        let var = Var::zeros(2, DType::U8, &Device::Cpu).unwrap();
        let err = Adam8bit::from_vars(vec![var], Adam8bitConfig::default()).unwrap_err();
        assert!(matches!(err, OptimError::UnsupportedDType(_)));
    }

    #[test]
    fn test_first_step_bias_correction() {
        let config = Adam8bitConfig::default().with_lr(0.01);
        let (mut opt, var) = single(&[1.0, 1.0, 1.0, 1.0], DType::F32, config);

        opt.step_with(&grads(0, &[0.5, 0.5, 0.5, 0.5])).unwrap();

        let state = opt.state(0).unwrap();
        assert_eq!(state.step, 1);
        let m = host_f32(&state.exp_avg.as_quantized().unwrap().dequantize().unwrap()).unwrap();
        for v in &m {
            assert!((v - 0.05).abs() < 1e-5, "exp_avg {v}");
        }
        let v = host_f32(&state.exp_avg_sq.as_quantized().unwrap().dequantize().unwrap())
            .unwrap();
        for x in &v {
            assert!((x - 0.00025).abs() < 1e-7, "exp_avg_sq {x}");
        }

        // m̂ = g and v̂ = g², so the first step moves by lr.
        for p in values(&var) {
            assert!((p - 0.99).abs() < 1e-5, "param {p}");
        }
    }

    #[test]
    fn test_step_counter_is_monotonic() {
        let (mut opt, _var) = single(&[0.3, -0.2], DType::F32, Adam8bitConfig::default());
        for n in 1..=5 {
            opt.step_with(&grads(0, &[0.1, -0.1])).unwrap();
            assert_eq!(opt.state(0).unwrap().step, n);
        }
    }

    #[test]
    fn test_param_without_gradient_is_skipped() {
        let (mut opt, var) = single(&[0.3, -0.2], DType::F32, Adam8bitConfig::default());
        opt.step_with(&HashMap::new()).unwrap();
        assert!(opt.state(0).is_none());
        assert_eq!(values(&var), vec![0.3, -0.2]);
    }

    #[test]
    fn test_weight_decay_modes_differ() {
        let base = Adam8bitConfig::default().with_lr(0.1).with_weight_decay(0.5);
        let (mut coupled, coupled_var) = single(&[2.0, 2.0], DType::F32, base.with_decouple(false));
        let (mut decoupled, decoupled_var) =
            single(&[2.0, 2.0], DType::F32, base.with_decouple(true));

        for _ in 0..3 {
            coupled.step_with(&grads(0, &[0.1, 0.1])).unwrap();
            decoupled.step_with(&grads(0, &[0.1, 0.1])).unwrap();
        }

        let a = values(&coupled_var);
        let b = values(&decoupled_var);
        assert!((a[0] - b[0]).abs() > 1e-3, "coupled {a:?} decoupled {b:?}");
    }

    #[test]
    fn test_decoupled_decay_scales_param() {
        let config = Adam8bitConfig::default()
            .with_lr(0.1)
            .with_weight_decay(0.5)
            .with_decouple(true);
        let (mut opt, var) = single(&[2.0, 2.0], DType::F32, config);

        opt.step_with(&grads(0, &[1.0, 1.0])).unwrap();

        // 2.0 * (1 - 0.05) - 0.1 * sign(g)
        for p in values(&var) {
            assert!((p - 1.8).abs() < 1e-4, "param {p}");
        }
    }

    #[test]
    fn test_bf16_param_keeps_dtype() {
        let (mut opt, var) = single(&[1.0, -1.0, 0.5], DType::BF16, Adam8bitConfig::default());
        assert!(opt.uses_stochastic_accumulation());

        opt.step_with(&grads(0, &[0.1, -0.1, 0.2])).unwrap();
        assert_eq!(var.dtype(), DType::BF16);
        assert_eq!(opt.state(0).unwrap().step, 1);
    }

    #[test]
    fn test_accumulated_gradient_is_consumed() {
        let config = Adam8bitConfig::default().with_lr(0.1);
        let (mut opt, var) = single(&[1.0, 1.0], DType::BF16, config);
        let g = Tensor::new(&[0.25f32, 0.25], &Device::Cpu).unwrap();
        opt.accumulate_grad(0, &g).unwrap();
        opt.accumulate_grad(0, &g).unwrap();
        assert!(opt.has_accumulated_grad(0));

        opt.step_with(&HashMap::new()).unwrap();

        assert!(!opt.has_accumulated_grad(0));
        assert_eq!(opt.state(0).unwrap().step, 1);
        assert!(values(&var).iter().all(|&p| p < 1.0));
    }

    #[test]
    fn test_accumulate_rejects_full_precision_param() {
        let (mut opt, _var) = single(&[1.0], DType::F32, Adam8bitConfig::default());
        assert!(!opt.uses_stochastic_accumulation());
        let g = Tensor::new(&[0.5f32], &Device::Cpu).unwrap();
        assert!(matches!(
            opt.accumulate_grad(0, &g),
            Err(OptimError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_raw_legacy_state_is_repaired() {
        let (mut opt, _var) = single(&[1.0, 1.0], DType::F32, Adam8bitConfig::default());
        opt.step_with(&grads(0, &[0.5, 0.5])).unwrap();

        let live = opt.state(0).unwrap().clone();
        let flat = serde_json::to_value(
            live.exp_avg.as_quantized().unwrap().snapshot().unwrap(),
        )
        .unwrap();
        let mut raw = live.clone();
        raw.exp_avg = MomentValue::RawLegacy(flat);
        opt.set_state(0, raw).unwrap();

        opt.step_with(&grads(0, &[0.5, 0.5])).unwrap();
        let state = opt.state(0).unwrap();
        assert_eq!(state.step, 2);
        assert!(state.is_normalized());
    }

    #[test]
    fn test_corrupt_state_aborts_without_changes() {
        let (mut opt, var) = single(&[1.0, 1.0], DType::F32, Adam8bitConfig::default());
        opt.step_with(&grads(0, &[0.5, 0.5])).unwrap();
        let before = values(&var);

        let mut raw = opt.state(0).unwrap().clone();
        raw.exp_avg_sq = MomentValue::RawLegacy(json!({"foo": 1}));
        opt.set_state(0, raw).unwrap();

        let err = opt.step_with(&grads(0, &[0.5, 0.5])).unwrap_err();
        match err {
            OptimError::StateCorruption {
                param_id,
                field,
                observed_keys,
            } => {
                assert_eq!(param_id, 0);
                assert_eq!(field, "exp_avg_sq");
                assert_eq!(observed_keys, vec!["foo".to_string()]);
            }
            other => panic!("expected StateCorruption, got {other:?}"),
        }
        assert_eq!(values(&var), before);
        assert_eq!(opt.state(0).unwrap().step, 1);
    }

    #[test]
    fn test_failure_in_one_param_leaves_others_untouched() {
        let device = Device::Cpu;
        let a = Var::from_tensor(&Tensor::new(&[1.0f32, 1.0], &device).unwrap()).unwrap();
        let b = Var::from_tensor(&Tensor::new(&[1.0f32, 1.0], &device).unwrap()).unwrap();
        let mut opt = Adam8bit::from_groups(
            vec![ParamGroup::new(vec![a.clone(), b], Adam8bitConfig::default())],
            Some(0),
        )
        .unwrap();

        let mut broken = OptimizerState::zeroed(&[2], &device).unwrap();
        broken.exp_avg = MomentValue::RawLegacy(json!([1, 2]));
        opt.set_state(1, broken).unwrap();

        let mut g = grads(0, &[0.5, 0.5]);
        g.insert(1, Tensor::new(&[0.5f32, 0.5], &device).unwrap());
        assert!(opt.step_with(&g).is_err());

        assert_eq!(values(&a), vec![1.0, 1.0]);
        assert!(opt.state(0).is_none());
    }

    #[test]
    fn test_gradient_shape_mismatch() {
        let (mut opt, _var) = single(&[1.0, 1.0], DType::F32, Adam8bitConfig::default());
        let err = opt.step_with(&grads(0, &[0.5, 0.5, 0.5])).unwrap_err();
        assert!(matches!(err, OptimError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_state_dict_roundtrip_restores_state() {
        let config = Adam8bitConfig::default().with_lr(0.02);
        let (mut opt, _var) = single(&[1.0, -1.0, 0.5], DType::F32, config);
        for _ in 0..3 {
            opt.step_with(&grads(0, &[0.1, -0.3, 0.2])).unwrap();
        }
        let dict = opt.state_dict().unwrap();
        assert_eq!(dict.param_groups.len(), 1);
        assert_eq!(dict.param_groups[0].params, vec![0]);

        let (mut fresh, _var) = single(&[1.0, -1.0, 0.5], DType::F32, Adam8bitConfig::default());
        let report = fresh.load_state_dict(&dict).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.restored, 1);
        assert_eq!(fresh.param_groups()[0].config.lr, 0.02);

        let a = opt.state(0).unwrap();
        let b = fresh.state(0).unwrap();
        assert_eq!(a.step, b.step);
        for (x, y) in [(&a.exp_avg, &b.exp_avg), (&a.exp_avg_sq, &b.exp_avg_sq)] {
            assert_eq!(
                host_f32(&x.as_quantized().unwrap().dequantize().unwrap()).unwrap(),
                host_f32(&y.as_quantized().unwrap().dequantize().unwrap()).unwrap()
            );
        }
    }

    #[test]
    fn test_load_quarantines_bad_entry() {
        let (mut opt, var) = single(&[1.0, 1.0], DType::F32, Adam8bitConfig::default());
        opt.step_with(&grads(0, &[0.5, 0.5])).unwrap();
        let mut dict = opt.state_dict().unwrap();
        dict.state
            .get_mut(&0)
            .unwrap()
            .insert("exp_avg".to_string(), json!({"foo": 1}));

        let report = opt.load_state_dict(&dict).unwrap();
        assert_eq!(report.restored, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(opt.state(0).is_none());
        assert_eq!(opt.quarantined(0).unwrap().field, "exp_avg");

        let before = values(&var);
        let err = opt.step_with(&grads(0, &[0.5, 0.5])).unwrap_err();
        assert!(matches!(err, OptimError::StateCorruption { .. }));
        assert_eq!(values(&var), before);

        // Quarantined entries survive a save.
        let saved = opt.state_dict().unwrap();
        assert_eq!(saved.state[&0]["exp_avg"], json!({"foo": 1}));

        opt.reset_state(0).unwrap();
        opt.step_with(&grads(0, &[0.5, 0.5])).unwrap();
        assert_eq!(opt.state(0).unwrap().step, 1);
    }

    #[test]
    fn test_load_rejects_group_layout_mismatch() {
        let (mut opt, _var) = single(&[1.0, 1.0], DType::F32, Adam8bitConfig::default());
        let mut dict = opt.state_dict().unwrap();
        dict.param_groups[0].params.push(1);
        assert!(matches!(
            opt.load_state_dict(&dict),
            Err(OptimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_reports_unknown_param_id() {
        let (mut opt, _var) = single(&[1.0, 1.0], DType::F32, Adam8bitConfig::default());
        opt.step_with(&grads(0, &[0.5, 0.5])).unwrap();
        let mut dict = opt.state_dict().unwrap();
        let entry = dict.state[&0].clone();
        dict.state.insert(7, entry);

        let report = opt.load_state_dict(&dict).unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].param_id, 7);
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_memory_stats() {
        let (mut opt, _var) = single(&[0.0; 64], DType::F32, Adam8bitConfig::default());
        opt.step_with(&grads(0, &[0.1; 64])).unwrap();
        let stats = opt.memory_stats();
        assert_eq!(stats.params, 1);
        assert_eq!(stats.quantized_bytes, 2 * (64 + 4));
        assert_eq!(stats.full_precision_bytes, 2 * 64 * 4);
        assert!(stats.savings() > 0.7);
        assert!(stats.to_string().contains("Memory saved"));
    }

    #[test]
    fn test_candle_optimizer_trait() {
        use candle_nn::Optimizer;

        let w = Var::from_tensor(&Tensor::new(&[3.0f32], &Device::Cpu).unwrap()).unwrap();
        let mut opt =
            <Adam8bit as Optimizer>::new(vec![w.clone()], Adam8bitConfig::default().with_lr(0.1))
                .unwrap();
        assert_eq!(opt.learning_rate(), 0.1);

        for _ in 0..20 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        let value = values(&w)[0];
        assert!(value < 3.0, "w = {value}");

        opt.set_learning_rate(0.05);
        assert_eq!(opt.learning_rate(), 0.05);
    }

    #[test]
    fn test_trait_set_learning_rate_ignores_invalid() {
        use candle_nn::Optimizer;

        let (mut opt, _var) = single(&[1.0], DType::F32, Adam8bitConfig::default().with_lr(0.1));
        opt.set_learning_rate(-5.0);
        assert_eq!(opt.learning_rate(), 0.1);
        opt.set_learning_rate(f64::NAN);
        assert_eq!(opt.learning_rate(), 0.1);
        assert!(opt.param_groups()[0].config.validate().is_ok());

        opt.set_learning_rate(0.02);
        assert_eq!(opt.learning_rate(), 0.02);
    }

    #[test]
    fn test_f64_param_step() {
        let device = Device::Cpu;
        let var = Var::from_tensor(&Tensor::new(&[2.0f64, -1.0], &device).unwrap()).unwrap();
        let config = Adam8bitConfig::default().with_lr(0.01);
        let mut opt =
            Adam8bit::from_groups(vec![ParamGroup::new(vec![var.clone()], config)], Some(0))
                .unwrap();
        assert!(!opt.uses_stochastic_accumulation());

        let mut g = HashMap::new();
        g.insert(0, Tensor::new(&[0.5f64, -0.5], &device).unwrap());
        opt.step_with(&g).unwrap();

        assert_eq!(var.dtype(), DType::F64);
        let after = var.as_tensor().to_vec1::<f64>().unwrap();
        assert!((after[0] - 1.99).abs() < 1e-6, "param {after:?}");
        assert!((after[1] + 0.99).abs() < 1e-6, "param {after:?}");
        assert_eq!(opt.state(0).unwrap().step, 1);
    }

    #[test]
    fn test_non_finite_gradient_aborts_step() {
        let (mut opt, var) = single(&[1.0, 1.0, 1.0], DType::F32, Adam8bitConfig::default());
        opt.step_with(&grads(0, &[0.5, 0.5, 0.5])).unwrap();
        let before = values(&var);

        let err = opt
            .step_with(&grads(0, &[f32::NAN, 0.5, 0.25]))
            .unwrap_err();
        assert!(matches!(err, OptimError::NonFinite(_)));
        assert_eq!(values(&var), before);

        let state = opt.state(0).unwrap();
        assert_eq!(state.step, 1);
        let v = host_f32(&state.exp_avg_sq.as_quantized().unwrap().dequantize().unwrap())
            .unwrap();
        assert!(v.iter().all(|&x| x >= 0.0), "exp_avg_sq {v:?}");
    }

    #[test]
    fn test_set_group_learning_rate_validates() {
        let (mut opt, _var) = single(&[1.0], DType::F32, Adam8bitConfig::default());
        opt.set_group_learning_rate(0, 0.5).unwrap();
        assert_eq!(opt.param_groups()[0].config.lr, 0.5);
        assert!(opt.set_group_learning_rate(0, -1.0).is_err());
        assert!(opt.set_group_learning_rate(3, 0.1).is_err());
    }
}
