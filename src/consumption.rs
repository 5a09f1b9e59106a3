//! Training consumption
//!
//! Converts logged sessions into an intraday readiness deduction so the
//! displayed score decrements as the athlete trains. The morning's base
//! score is immutable for the day; the display value is re-derived from the
//! base and the full session list on every call, so replays are idempotent.

use crate::tables::label_to_au;
use crate::types::{
    ConsumptionBreakdown, ConsumptionRequest, ConsumptionResult, SessionConsumption,
    TrainingSession,
};
use serde::{Deserialize, Serialize};

/// Caps for the deduction; overridable per request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsumptionParams {
    /// Largest deduction any single session can contribute.
    pub per_session_cap: f64,
    /// Largest total training deduction for one day.
    pub per_day_cap: f64,
}

impl Default for ConsumptionParams {
    fn default() -> Self {
        ConsumptionParams {
            per_session_cap: 40.0,
            per_day_cap: 60.0,
        }
    }
}

/// Computes the day's training consumption.
pub struct ConsumptionCalculator;

impl ConsumptionCalculator {
    pub fn compute(request: &ConsumptionRequest) -> ConsumptionResult {
        let params = request.params_override.unwrap_or_default();
        let mut sessions = Vec::with_capacity(request.sessions.len());
        let mut raw_total = 0.0;
        let mut caps_applied = false;

        for session in &request.sessions {
            let au = session_au(session);
            let raw = deduction(au);
            let delta = raw.min(params.per_session_cap);
            if delta < raw {
                caps_applied = true;
            }
            raw_total += delta;
            sessions.push(SessionConsumption {
                au_used: au,
                delta_consumption: delta,
            });
        }

        let total = raw_total.min(params.per_day_cap);
        if total < raw_total {
            caps_applied = true;
        }

        let display = (i32::from(request.base_readiness_score) - total.round() as i32).max(0);

        ConsumptionResult {
            consumption_score: total,
            display_readiness: display as u8,
            breakdown: ConsumptionBreakdown {
                raw_total,
                capped_total: total,
                per_session_cap: params.per_session_cap,
                per_day_cap: params.per_day_cap,
            },
            sessions,
            caps_applied,
        }
    }
}

/// Session AU, by priority: explicit `au`, then `rpe x duration`, then the
/// label map, else zero.
pub fn session_au(session: &TrainingSession) -> f64 {
    if let Some(au) = session.au {
        if au > 0.0 {
            return au;
        }
    }
    if let (Some(rpe), Some(duration)) = (session.rpe, session.duration_minutes) {
        if rpe > 0.0 && duration > 0.0 {
            return rpe * duration;
        }
    }
    if let Some(label) = session.label {
        return label_to_au(label);
    }
    0.0
}

/// Per-session deduction g(AU): piecewise linear, non-decreasing, saturating
/// toward 40 points as AU approaches 900+.
pub fn deduction(au: f64) -> f64 {
    let au = au.max(0.0);
    if au <= 150.0 {
        5.0 * au / 150.0
    } else if au <= 300.0 {
        5.0 + 7.0 * (au - 150.0) / 150.0
    } else if au <= 500.0 {
        12.0 + 13.0 * (au - 300.0) / 200.0
    } else {
        (25.0 + 15.0 * (au - 500.0) / 400.0).min(40.0)
    }
}
