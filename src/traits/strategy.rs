//! Ramp curves for software transitions.
//!
//! A software transition samples its curve on every tick with the elapsed
//! fraction of its duration. The curve decides how far along the value is.
//!
//! | Curve | Shape | Notes |
//! |-------|-------|-------|
//! | [`Linear`] | `t` | default, same as the device's own smooth mode |
//! | [`EaseInOut`] | `t² × (3 - 2t)` | soft start and stop, nice for lights |
//!
//! # Example
//!
//! ```rust
//! use rs_megad::traits::{EaseInOut, Linear, RampCurve};
//!
//! let (value, done) = Linear.interpolate(0.0, 200.0, 500, 1000);
//! assert_eq!(value, 100.0);
//! assert!(!done);
//!
//! // Starts slower than linear
//! let (value, _) = EaseInOut.interpolate(0.0, 1.0, 100, 1000);
//! assert!(value < 0.1);
//! ```

/// Describes how a value moves from `from` to `to` over time.
///
/// Only [`shape`](Self::shape) is required. It maps the elapsed fraction
/// `t ∈ [0, 1]` to the travelled fraction, and must return 0 at 0 and 1 at 1
/// and stay within `[0, 1]` in between.
pub trait RampCurve: Send + Sync {
    /// Travelled fraction at elapsed fraction `t`.
    fn shape(&self, t: f64) -> f64;

    /// Value after `elapsed_ms` of a `duration_ms` ramp.
    ///
    /// Returns `(value, is_complete)`. Once complete the value is exactly `to`.
    fn interpolate(&self, from: f64, to: f64, elapsed_ms: u64, duration_ms: u64) -> (f64, bool) {
        if duration_ms == 0 || elapsed_ms >= duration_ms {
            return (to, true);
        }

        let t = elapsed_ms as f64 / duration_ms as f64;
        let s = self.shape(t).clamp(0.0, 1.0);
        (from + (to - from) * s, false)
    }
}

/// Constant rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Linear;

impl RampCurve for Linear {
    fn shape(&self, t: f64) -> f64 {
        t
    }
}

/// Smoothstep: slow at both ends, fastest in the middle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EaseInOut;

impl RampCurve for EaseInOut {
    fn shape(&self, t: f64) -> f64 {
        t * t * (3.0 - 2.0 * t)
    }
}

/// Built-in curves as a value, for configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Curve {
    /// [`Linear`].
    #[default]
    Linear,
    /// [`EaseInOut`].
    EaseInOut,
}

impl RampCurve for Curve {
    fn shape(&self, t: f64) -> f64 {
        match self {
            Curve::Linear => Linear.shape(t),
            Curve::EaseInOut => EaseInOut.shape(t),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
