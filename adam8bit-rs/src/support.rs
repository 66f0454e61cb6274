//! Backend availability checks for training drivers.
//!
//! Drivers decide whether to offer the 8-bit optimizer at all with
//! [`require_backend`]. The step itself never consults a probe.

use tracing::warn;

/// Answers whether a quantization backend is usable here.
pub trait BackendProbe {
    /// Whether the backend can be used.
    fn is_available(&self) -> bool;

    /// Human-readable backend name.
    fn name(&self) -> &str {
        "backend"
    }
}

/// Receives non-fatal advisory messages.
pub trait AdvisorySink {
    /// Deliver one advisory.
    fn warn(&self, message: &str);
}

/// Forwards advisories to `tracing` at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAdvisory;

impl AdvisorySink for TracingAdvisory {
    fn warn(&self, message: &str) {
        warn!(target: "adam8bit_rs::advisory", "{message}");
    }
}

/// Probe for the built-in candle path, which has no external requirements.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleProbe;

impl BackendProbe for CandleProbe {
    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "candle"
    }
}

/// Check `probe` and send an advisory through `sink` when unavailable.
///
/// # Arguments
///
/// * `probe` - Backend to check
/// * `context` - What the caller wanted the backend for
/// * `sink` - Advisory destination
///
/// # Returns
///
/// Whether the backend is available.
pub fn require_backend(probe: &dyn BackendProbe, context: &str, sink: &dyn AdvisorySink) -> bool {
    let available = probe.is_available();
    if !available {
        sink.warn(&format!(
            "{context} requires the {} backend, which is not available",
            probe.name()
        ));
    }
    available
}
