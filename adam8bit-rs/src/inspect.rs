//! Survey of the moment encodings present in a saved state dict.
//!
//! Useful when a checkpoint fails to load: it shows which key layouts a
//! field was written with and the first entry that no decoder accepts.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::codec::{observed_keys, OptimizerStateDict, StateCodec};
use crate::state::ParamId;

/// First entry whose payload is not a recognised encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadSample {
    /// Parameter id.
    pub param_id: ParamId,
    /// Keys of the payload.
    pub keys: Vec<String>,
    /// Value of `_type`, if present and a string.
    pub type_tag: Option<String>,
    /// Keys of the nested `state` object, if present.
    pub state_keys: Option<Vec<String>>,
}

/// Key layouts observed for one field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatSurvey {
    /// Field surveyed.
    pub field: String,
    /// Entries that contain the field.
    pub total: usize,
    /// Entries lacking the field.
    pub missing: usize,
    /// Count per distinct sorted key set.
    pub keysets: BTreeMap<Vec<String>, usize>,
    /// Entries no decoder accepts.
    pub bad: usize,
    /// The first of them, in id order.
    pub first_bad: Option<BadSample>,
}

impl FormatSurvey {
    /// Whether every present payload decodes.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.bad == 0
    }
}

/// Survey `field` across every entry of `dict`.
#[must_use]
pub fn survey(dict: &OptimizerStateDict, field: &str) -> FormatSurvey {
    let mut report = FormatSurvey {
        field: field.to_string(),
        ..FormatSurvey::default()
    };

    for (&param_id, entry) in &dict.state {
        let Some(value) = entry.get(field) else {
            report.missing += 1;
            continue;
        };
        report.total += 1;
        *report.keysets.entry(observed_keys(value)).or_default() += 1;

        if StateCodec::decode_moment(value).is_err() {
            report.bad += 1;
            if report.first_bad.is_none() {
                report.first_bad = Some(BadSample {
                    param_id,
                    keys: observed_keys(value),
                    type_tag: value.get("_type").and_then(Value::as_str).map(str::to_string),
                    state_keys: value.get("state").filter(|s| s.is_object()).map(observed_keys),
                });
            }
        }
    }

    report
}

impl fmt::Display for FormatSurvey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "field '{}': {} present, {} missing, {} unrecognised",
            self.field, self.total, self.missing, self.bad
        )?;
        for (keys, count) in &self.keysets {
            writeln!(f, "  {count:>6}  [{}]", keys.join(", "))?;
        }
        if let Some(sample) = &self.first_bad {
            writeln!(f, "first unrecognised entry: param {}", sample.param_id)?;
            writeln!(f, "  keys: [{}]", sample.keys.join(", "))?;
            if let Some(tag) = &sample.type_tag {
                writeln!(f, "  _type: {tag}")?;
            }
            if let Some(keys) = &sample.state_keys {
                writeln!(f, "  state keys: [{}]", keys.join(", "))?;
            }
        }
        Ok(())
    }
}
