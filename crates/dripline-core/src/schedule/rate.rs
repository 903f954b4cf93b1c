//! Rate Model - Canonical per-email delay from a user-chosen rate spec

use serde::{Deserialize, Serialize};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// User-specified throughput control for a campaign send
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum RateSpec {
    /// Emails per hour
    PerHour(f64),
    /// Fixed delay between consecutive emails, in milliseconds
    DelayMs(f64),
}

impl RateSpec {
    /// Convert to the canonical per-email delay in milliseconds.
    ///
    /// Non-positive or non-finite values normalize to 0 (unbounded / send
    /// immediately). These are preview computations, so degenerate input
    /// degrades silently instead of failing.
    pub fn to_delay_ms(self) -> f64 {
        match self {
            RateSpec::PerHour(value) if value > 0.0 && value.is_finite() => MS_PER_HOUR / value,
            RateSpec::DelayMs(value) if value > 0.0 && value.is_finite() => value,
            _ => 0.0,
        }
    }

    /// Inverse of [`to_delay_ms`](Self::to_delay_ms), for display
    pub fn to_rate_per_hour(delay_ms: f64) -> f64 {
        if delay_ms > 0.0 && delay_ms.is_finite() {
            MS_PER_HOUR / delay_ms
        } else {
            0.0
        }
    }
}
