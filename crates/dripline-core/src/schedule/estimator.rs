//! Completion Estimator - Projects when a windowed drip send will finish

use super::rate::RateSpec;
use super::window::SendWindow;
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

/// Estimate the completion instant of a drip send.
///
/// The total span is pinned to the gaps between consecutive sends: n
/// recipients take n-1 delay intervals. Capacity is only burned inside the
/// daily send window; backlog that does not fit in the remainder of the
/// current day's window carries forward into subsequent days.
///
/// Returns `None` when the send has no measurable span (`recipient_count <=
/// 1` or no delay), or when the walk cannot make progress.
pub fn estimate(
    start: NaiveDateTime,
    recipient_count: u64,
    per_email_delay_ms: f64,
    window: &SendWindow,
) -> Option<NaiveDateTime> {
    if recipient_count <= 1 || per_email_delay_ms <= 0.0 || !per_email_delay_ms.is_finite() {
        return None;
    }

    let mut remaining_ms = (per_email_delay_ms * (recipient_count - 1) as f64).round() as i64;
    if remaining_ms <= 0 {
        return None;
    }

    let today = start.date();
    let window_end_today = window.end_on(today);

    if window.is_within(start) {
        let left_today_ms = (window_end_today - start).num_milliseconds();
        if remaining_ms <= left_today_ms {
            // Same-day fast path
            return Some(start + Duration::milliseconds(remaining_ms));
        }
        remaining_ms -= left_today_ms;
    }

    let day_capacity_ms = window.duration_ms();
    if day_capacity_ms <= 0 {
        // Cannot happen with a validated window; bail rather than spin
        return None;
    }

    let mut date = today;
    loop {
        date = date.succ_opt()?;
        if remaining_ms <= day_capacity_ms {
            return Some(window.start_on(date) + Duration::milliseconds(remaining_ms));
        }
        remaining_ms -= day_capacity_ms;
    }
}

/// Derived scheduling preview for one campaign send.
///
/// Created fresh on every preview request and never mutated; a new plan
/// replaces the old one.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryPlan {
    pub start: NaiveDateTime,
    pub recipient_count: u64,
    pub per_email_delay_ms: f64,
    pub window: SendWindow,
    /// Total drip span in milliseconds (n-1 gaps), ignoring the window
    pub total_duration_ms: i64,
    /// Projected completion instant; `None` when the send is effectively
    /// instantaneous from a scheduling standpoint
    pub completion: Option<NaiveDateTime>,
}

impl DeliveryPlan {
    /// Build a preview from a rate spec and a send window
    pub fn preview(
        start: NaiveDateTime,
        recipient_count: u64,
        rate: RateSpec,
        window: SendWindow,
    ) -> Self {
        let per_email_delay_ms = rate.to_delay_ms();
        let total_duration_ms = if recipient_count > 1 {
            (per_email_delay_ms * (recipient_count - 1) as f64).round() as i64
        } else {
            0
        };
        let completion = estimate(start, recipient_count, per_email_delay_ms, &window);

        Self {
            start,
            recipient_count,
            per_email_delay_ms,
            window,
            total_duration_ms,
            completion,
        }
    }
}
