//! Persistence of optimizer state.
//!
//! The current encoding writes each moment buffer in tagged form:
//!
//! ```text
//! {
//!   "step": 12,
//!   "exp_avg":    {"_type": "Auto8bitTensor", "state": {"quantized": {...}, "scale": 0.01, "orig_dtype": "f32"}},
//!   "exp_avg_sq": {"_type": "Auto8bitTensor", "state": {...}}
//! }
//! ```
//!
//! Older checkpoints are read but never written:
//! - the flat form, where the snapshot fields sit directly in the moment entry
//! - snapshots without `orig_dtype`, which default to `f32`
//! - a `step` stored as an integral float
//!
//! Export and import are pure in-memory transformations; where the bytes end
//! up is the caller's concern ([`OptimizerStateDict::save_json`] is a
//! convenience).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::Adam8bitConfig;
use crate::error::{ImportFailure, Result};
use crate::quantized::{QuantizedSnapshot, QuantizedTensor, QUANTIZED_TYPE_TAG};
use crate::state::{MomentValue, OptimizerState, ParamId};

/// Field holding the step counter.
pub const STEP_FIELD: &str = "step";

/// Fields holding quantized moments.
pub const MOMENT_FIELDS: [&str; 2] = ["exp_avg", "exp_avg_sq"];

/// Persisted form of one parameter's state.
pub type PersistedState = BTreeMap<String, Value>;

/// Hyperparameters of one group and the ids of its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedGroup {
    /// Group hyperparameters.
    #[serde(flatten)]
    pub config: Adam8bitConfig,
    /// Ids of the group's parameters.
    pub params: Vec<ParamId>,
}

/// Complete persisted optimizer state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    /// Per-parameter state keyed by parameter id.
    pub state: BTreeMap<ParamId, PersistedState>,
    /// Parameter groups. Empty for state-only dumps.
    #[serde(default)]
    pub param_groups: Vec<PersistedGroup>,
}

impl OptimizerStateDict {
    /// Serialize to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O or serialization failure.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read JSON from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or malformed JSON.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Result of decoding a batch of persisted entries.
#[derive(Debug, Default)]
pub struct ImportOutcome {
    /// Entries decoded into live state, codes on the host.
    pub states: HashMap<ParamId, OptimizerState>,
    /// Entries that could not be decoded, one record per failed field.
    pub failures: Vec<ImportFailure>,
}

/// Converts between live state and its persisted form.
pub struct StateCodec;

impl StateCodec {
    /// Wrap a snapshot in the tagged form.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized.
    pub fn tagged(snapshot: &QuantizedSnapshot) -> Result<Value> {
        Ok(json!({
            "_type": QUANTIZED_TYPE_TAG,
            "state": serde_json::to_value(snapshot)?,
        }))
    }

    /// Persist one parameter's state.
    ///
    /// Moments still in raw form and extra fields are written verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffer cannot be copied out.
    pub fn export_state(state: &OptimizerState) -> Result<PersistedState> {
        let mut entry = state.extra.clone();
        entry.insert(STEP_FIELD.to_string(), json!(state.step));
        for (field, moment) in [("exp_avg", &state.exp_avg), ("exp_avg_sq", &state.exp_avg_sq)] {
            let value = match moment {
                MomentValue::Quantized(q) => Self::tagged(&q.snapshot()?)?,
                MomentValue::RawLegacy(raw) => raw.clone(),
            };
            entry.insert(field.to_string(), value);
        }
        Ok(entry)
    }

    /// Persist every parameter's state.
    ///
    /// The result owns copies of all buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffer cannot be copied out.
    pub fn export(
        states: &HashMap<ParamId, OptimizerState>,
    ) -> Result<BTreeMap<ParamId, PersistedState>> {
        states
            .iter()
            .map(|(&id, state)| Ok((id, Self::export_state(state)?)))
            .collect()
    }

    /// Recognise a persisted moment payload.
    ///
    /// Accepts the tagged form and the flat form.
    ///
    /// # Errors
    ///
    /// Returns a description of why the payload was rejected.
    pub fn decode_moment(value: &Value) -> std::result::Result<QuantizedSnapshot, String> {
        let Value::Object(map) = value else {
            return Err(format!("expected an object, found {}", kind(value)));
        };

        if let Some(Value::Object(inner)) = map.get("state") {
            let tag_ok = map
                .get("_type")
                .is_none_or(|t| t.as_str() == Some(QUANTIZED_TYPE_TAG));
            if tag_ok && has_snapshot_keys(inner) {
                return serde_json::from_value(Value::Object(inner.clone()))
                    .map_err(|e| format!("malformed tagged snapshot: {e}"));
            }
        }

        if has_snapshot_keys(map) {
            return serde_json::from_value(value.clone())
                .map_err(|e| format!("malformed flat snapshot: {e}"));
        }

        Err("not a recognised quantized encoding".to_string())
    }

    /// Decode and restore a moment payload onto `device`.
    ///
    /// # Errors
    ///
    /// Returns a description of why the payload was rejected.
    pub fn restore_moment(
        value: &Value,
        device: &Device,
    ) -> std::result::Result<QuantizedTensor, String> {
        let snapshot = Self::decode_moment(value)?;
        QuantizedTensor::restore(&snapshot, device).map_err(|e| e.to_string())
    }

    /// Decode one persisted entry. Codes are placed on the host.
    ///
    /// Returns `Ok(None)` for an empty entry (a parameter that never stepped).
    ///
    /// # Errors
    ///
    /// Returns every field that failed to decode.
    pub fn import_state(
        id: ParamId,
        entry: &PersistedState,
    ) -> std::result::Result<Option<OptimizerState>, Vec<ImportFailure>> {
        if entry.is_empty() {
            return Ok(None);
        }

        let mut failures = Vec::new();

        let step = match entry.get(STEP_FIELD) {
            Some(value) => decode_step(value).unwrap_or_else(|reason| {
                failures.push(failure(id, STEP_FIELD, value, reason));
                0
            }),
            None => {
                failures.push(failure(id, STEP_FIELD, &Value::Null, "missing".to_string()));
                0
            }
        };

        let exp_avg = restore_field(id, entry, "exp_avg", &mut failures);
        let exp_avg_sq = restore_field(id, entry, "exp_avg_sq", &mut failures);
        let (Some(exp_avg), Some(exp_avg_sq)) = (exp_avg, exp_avg_sq) else {
            return Err(failures);
        };
        if !failures.is_empty() {
            return Err(failures);
        }

        let extra = entry
            .iter()
            .filter(|(k, _)| k.as_str() != STEP_FIELD && !MOMENT_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Some(OptimizerState {
            step,
            exp_avg: exp_avg.into(),
            exp_avg_sq: exp_avg_sq.into(),
            extra,
        }))
    }

    /// Decode every persisted entry.
    ///
    /// A failed entry never aborts the pass; it is reported in
    /// [`ImportOutcome::failures`] and left out of the decoded states.
    #[must_use]
    pub fn import(entries: &BTreeMap<ParamId, PersistedState>) -> ImportOutcome {
        let mut outcome = ImportOutcome::default();
        for (&id, entry) in entries {
            match Self::import_state(id, entry) {
                Ok(Some(state)) => {
                    outcome.states.insert(id, state);
                }
                Ok(None) => {}
                Err(failures) => outcome.failures.extend(failures),
            }
        }
        outcome
    }
}

/// Keys of a payload, sorted; empty for non-objects.
#[must_use]
pub fn observed_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

fn restore_field(
    id: ParamId,
    entry: &PersistedState,
    field: &str,
    failures: &mut Vec<ImportFailure>,
) -> Option<QuantizedTensor> {
    let value = entry.get(field).unwrap_or(&Value::Null);
    match StateCodec::restore_moment(value, &Device::Cpu) {
        Ok(q) => Some(q),
        Err(reason) => {
            failures.push(failure(id, field, value, reason));
            None
        }
    }
}

fn has_snapshot_keys(map: &Map<String, Value>) -> bool {
    map.contains_key("quantized") && map.contains_key("scale")
}

fn decode_step(value: &Value) -> std::result::Result<u64, String> {
    if let Some(step) = value.as_u64() {
        return Ok(step);
    }
    match value.as_f64() {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
        _ => Err(format!("step must be a non-negative integer, found {value}")),
    }
}

fn failure(id: ParamId, field: &str, value: &Value, reason: String) -> ImportFailure {
    ImportFailure {
        param_id: id,
        field: field.to_string(),
        observed_keys: observed_keys(value),
        reason,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};

    use crate::rounding::{host_f32, StochasticRounder};

    fn live_state(step: u64) -> OptimizerState {
        let device = Device::Cpu;
        let mut rounder = StochasticRounder::new(Some(1));
        let m = Tensor::new(&[0.5f32, -0.25, 0.125, 1.0], &device).unwrap();
        let v = Tensor::new(&[0.25f32, 0.0625, 0.015625, 1.0], &device).unwrap();
        OptimizerState {
            step,
            exp_avg: QuantizedTensor::quantize(&m, &mut rounder).unwrap().into(),
            exp_avg_sq: QuantizedTensor::quantize(&v, &mut rounder).unwrap().into(),
            extra: BTreeMap::new(),
        }
    }

    fn moment_values(state: &OptimizerState) -> (Vec<f32>, Vec<f32>) {
        let m = state.exp_avg.as_quantized().unwrap().dequantize().unwrap();
        let v = state.exp_avg_sq.as_quantized().unwrap().dequantize().unwrap();
        (host_f32(&m).unwrap(), host_f32(&v).unwrap())
    }

    #[test]
    fn test_export_writes_tagged_form() {
        let entry = StateCodec::export_state(&live_state(7)).unwrap();
        assert_eq!(entry["step"], json!(7));
        assert_eq!(entry["exp_avg"]["_type"], json!("Auto8bitTensor"));
        assert_eq!(entry["exp_avg"]["state"]["orig_dtype"], json!("f32"));
        assert!(entry["exp_avg_sq"]["state"]["quantized"]["data"].is_array());
    }

    #[test]
    fn test_tagged_roundtrip() {
        let original = live_state(3);
        let entry = StateCodec::export_state(&original).unwrap();
        let restored = StateCodec::import_state(0, &entry).unwrap().unwrap();

        assert_eq!(restored.step, 3);
        assert_eq!(moment_values(&restored), moment_values(&original));
    }

    #[test]
    fn test_flat_form_with_and_without_dtype() {
        let original = live_state(5);
        let entry = StateCodec::export_state(&original).unwrap();

        for keep_dtype in [true, false] {
            let mut legacy = PersistedState::new();
            legacy.insert("step".to_string(), json!(5));
            for field in MOMENT_FIELDS {
                let mut inner = entry[field]["state"].clone();
                if !keep_dtype {
                    inner.as_object_mut().unwrap().remove("orig_dtype");
                }
                legacy.insert(field.to_string(), inner);
            }

            let restored = StateCodec::import_state(0, &legacy).unwrap().unwrap();
            assert_eq!(restored.step, 5);
            assert_eq!(moment_values(&restored), moment_values(&original));
            assert_eq!(
                restored.exp_avg.as_quantized().unwrap().orig_dtype(),
                DType::F32
            );
        }
    }

    #[test]
    fn test_tagged_form_without_dtype() {
        let original = live_state(2);
        let mut entry = StateCodec::export_state(&original).unwrap();
        entry.get_mut("exp_avg").unwrap()["state"]
            .as_object_mut()
            .unwrap()
            .remove("orig_dtype");

        let restored = StateCodec::import_state(0, &entry).unwrap().unwrap();
        assert_eq!(moment_values(&restored), moment_values(&original));
    }

    #[test]
    fn test_export_is_detached_from_live_state() {
        let mut states = HashMap::new();
        states.insert(0, live_state(1));
        let exported = StateCodec::export(&states).unwrap();
        let before = exported.clone();

        let replacement = live_state(9);
        states.insert(0, replacement);

        assert_eq!(exported, before);
        assert_eq!(exported[&0]["step"], json!(1));
    }

    #[test]
    fn test_unrecognised_moment_is_reported() {
        let mut entry = StateCodec::export_state(&live_state(1)).unwrap();
        entry.insert("exp_avg".to_string(), json!({"foo": 1}));

        let failures = StateCodec::import_state(4, &entry).unwrap_err();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].param_id, 4);
        assert_eq!(failures[0].field, "exp_avg");
        assert_eq!(failures[0].observed_keys, vec!["foo".to_string()]);
    }

    #[test]
    fn test_negative_scale_is_reported() {
        let mut entry = StateCodec::export_state(&live_state(2)).unwrap();
        entry.insert(
            "exp_avg".to_string(),
            json!({"quantized": {"shape": [2], "data": [100, -50]}, "scale": -0.5}),
        );

        let failures = StateCodec::import_state(0, &entry).unwrap_err();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field, "exp_avg");
        assert!(failures[0].reason.contains("scale"), "{}", failures[0].reason);
    }

    #[test]
    fn test_import_pass_continues_after_failure() {
        let mut entries = BTreeMap::new();
        entries.insert(0, StateCodec::export_state(&live_state(1)).unwrap());
        let mut bad = StateCodec::export_state(&live_state(1)).unwrap();
        bad.insert("exp_avg_sq".to_string(), json!(3.5));
        entries.insert(1, bad);
        entries.insert(2, PersistedState::new());

        let outcome = StateCodec::import(&entries);
        assert_eq!(outcome.states.len(), 1);
        assert!(outcome.states.contains_key(&0));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].param_id, 1);
        assert!(outcome.failures[0].observed_keys.is_empty());
    }

    #[test]
    fn test_extra_fields_pass_through() {
        let mut entry = StateCodec::export_state(&live_state(1)).unwrap();
        entry.insert("note".to_string(), json!({"anything": [1, 2]}));

        let restored = StateCodec::import_state(0, &entry).unwrap().unwrap();
        assert_eq!(restored.extra["note"], json!({"anything": [1, 2]}));

        let again = StateCodec::export_state(&restored).unwrap();
        assert_eq!(again["note"], json!({"anything": [1, 2]}));
    }

    #[test]
    fn test_step_decoding() {
        assert_eq!(decode_step(&json!(12)), Ok(12));
        assert_eq!(decode_step(&json!(12.0)), Ok(12));
        assert!(decode_step(&json!(-1)).is_err());
        assert!(decode_step(&json!(1.5)).is_err());
        assert!(decode_step(&json!("3")).is_err());
    }

    #[test]
    fn test_missing_step_is_reported() {
        let mut entry = StateCodec::export_state(&live_state(1)).unwrap();
        entry.remove("step");
        let failures = StateCodec::import_state(0, &entry).unwrap_err();
        assert_eq!(failures[0].field, "step");
    }

    #[test]
    fn test_wrong_type_tag_rejected() {
        let mut entry = StateCodec::export_state(&live_state(1)).unwrap();
        entry.get_mut("exp_avg").unwrap()["_type"] = json!("SomethingElse");
        assert!(StateCodec::import_state(0, &entry).is_err());
    }

    #[test]
    fn test_state_dict_json_roundtrip() {
        let mut dict = OptimizerStateDict::default();
        dict.state
            .insert(3, StateCodec::export_state(&live_state(4)).unwrap());
        dict.param_groups.push(PersistedGroup {
            config: Adam8bitConfig::default(),
            params: vec![3],
        });

        let json = dict.to_json_string().unwrap();
        let back = OptimizerStateDict::from_json_str(&json).unwrap();
        assert_eq!(back, dict);
    }
}
