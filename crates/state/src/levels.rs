//! Numeric semantics for sliders, exposure, and decay.
//!
//! Decay model: `x ← x − k·x·(1−x)·hours`, clamped to [0, 1]. The logistic
//! term is fastest at mid-range, so half-warm topics cool quickly while
//! near-zero and near-one values barely move. Desire (`level_ideal` /
//! `exposure_desired`) never decays; it only moves on explicit preference
//! signals.

use chrono::{DateTime, Utc};

/// Default decay constant per hour.
pub const DECAY_K: f32 = 0.1;

/// Persona topics below this exposure are candidates for expiry…
pub const EXPIRE_THRESHOLD: f32 = 0.05;

/// …unless the persona still wants to discuss them at least this much.
pub const EXPOSURE_DESIRED_FLOOR: f32 = 0.2;

pub fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

pub fn clamp_sentiment(value: f32) -> f32 {
    value.clamp(-1.0, 1.0)
}

/// One decay step over `hours` elapsed. Monotonically non-increasing; exact
/// zero stays zero.
pub fn decay(current: f32, hours: f32) -> f32 {
    let current = clamp_unit(current);
    if hours <= 0.0 {
        return current;
    }
    clamp_unit(current - DECAY_K * current * (1.0 - current) * hours)
}

/// Decay driven by an item's own `last_updated` timestamp.
pub fn decay_since(current: f32, last_updated: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let hours = (now - last_updated).num_minutes().max(0) as f32 / 60.0;
    decay(current, hours)
}

/// Map an exposure label from the LLM onto a level. Labels replace the
/// current value; they do not compose with it. Unknown labels return `None`
/// and the caller leaves the level untouched.
pub fn exposure_label_value(label: &str) -> Option<f32> {
    match label.trim().to_ascii_lowercase().as_str() {
        "high" => Some(0.8),
        "medium" => Some(0.5),
        "low" => Some(0.2),
        "none" => Some(0.0),
        _ => None,
    }
}

/// Whether a persona topic should be expired: cold *and* unwanted.
pub fn should_expire(exposure_current: f32, exposure_desired: f32) -> bool {
    exposure_current < EXPIRE_THRESHOLD && exposure_desired < EXPOSURE_DESIRED_FLOOR
}

// ── Tests ─────────────────────────────────────────────────────────────────────
