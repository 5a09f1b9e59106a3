//! Evidence mapping
//!
//! This module converts the day's raw signals into categorical evidence
//! labels using personal thresholds where a baseline is available, with
//! graceful fallback to fixed population thresholds. Missing signals are
//! first-class: a variable that cannot be derived is simply absent from the
//! evidence map and the fusion order of the remaining variables is
//! unchanged.

use crate::baseline::Baseline;
use crate::types::{DailyPayload, Gender};
use std::collections::BTreeMap;

/// Evidence map: variable name -> observed category.
pub type EvidenceMap = BTreeMap<String, String>;

/// Baseline fields as seen by the mapper. Payload-level overrides take
/// precedence over the cached per-user baseline; absent fields fall back to
/// fixed thresholds. The mapper never blocks on I/O: it either has these
/// values or proceeds without them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvedBaseline {
    pub sleep_hours_mu: Option<f64>,
    pub sleep_eff_mu: Option<f64>,
    pub restorative_mu: Option<f64>,
    pub hrv_mu: Option<f64>,
    pub hrv_sd: Option<f64>,
}

impl ResolvedBaseline {
    /// Merge payload overrides over an optional cached baseline.
    pub fn resolve(payload: &DailyPayload, cached: Option<&Baseline>) -> Self {
        let mut resolved = ResolvedBaseline {
            sleep_hours_mu: payload.sleep_baseline_hours,
            sleep_eff_mu: payload.sleep_baseline_eff,
            restorative_mu: payload.rest_baseline_ratio,
            hrv_mu: payload.hrv_baseline_mu,
            hrv_sd: payload.hrv_baseline_sd,
        };
        if let Some(b) = cached {
            resolved.sleep_hours_mu = resolved.sleep_hours_mu.or(Some(b.sleep_hours_mean));
            resolved.sleep_eff_mu = resolved.sleep_eff_mu.or(Some(b.sleep_efficiency_mean));
            resolved.restorative_mu = resolved.restorative_mu.or(Some(b.restorative_ratio_mean));
            resolved.hrv_mu = resolved.hrv_mu.or(Some(b.hrv_rmssd_mean));
            resolved.hrv_sd = resolved.hrv_sd.or(Some(b.hrv_rmssd_sd));
        }
        resolved
    }
}

/// Maps raw daily signals onto categorical evidence.
pub struct EvidenceMapper;

impl EvidenceMapper {
    /// Derive every evidence variable the payload supports.
    pub fn map(payload: &DailyPayload, baseline: &ResolvedBaseline) -> EvidenceMap {
        let mut evidence = EvidenceMap::new();

        if let Some(category) = sleep_performance(payload, baseline) {
            evidence.insert("sleep_performance".to_string(), category.to_string());
        }
        if let Some(category) = restorative_sleep(payload, baseline) {
            evidence.insert("restorative_sleep".to_string(), category.to_string());
        }
        if let Some(category) = hrv_trend(payload, baseline) {
            evidence.insert("hrv_trend".to_string(), category.to_string());
        }
        if let Some(h) = &payload.hooper {
            evidence.insert(
                "subjective_fatigue".to_string(),
                hooper_band(h.fatigue).to_string(),
            );
            evidence.insert(
                "muscle_soreness".to_string(),
                hooper_band(h.soreness).to_string(),
            );
            evidence.insert(
                "subjective_stress".to_string(),
                hooper_band(h.stress).to_string(),
            );
            evidence.insert(
                "subjective_sleep".to_string(),
                hooper_band(h.sleep).to_string(),
            );
        }

        let journal = &payload.journal;
        if journal.is_sick.unwrap_or(false) {
            evidence.insert("is_sick".to_string(), "true".to_string());
        }
        if journal.is_injured.unwrap_or(false) {
            evidence.insert("is_injured".to_string(), "true".to_string());
        }
        if journal.poor_nutrition.unwrap_or(false) {
            evidence.insert("nutrition".to_string(), "poor".to_string());
        }
        if journal.gi_symptoms.unwrap_or(false) {
            evidence.insert("gi_symptoms".to_string(), "present".to_string());
        }

        if payload.gender == Gender::Female {
            if let Some(cycle) = &payload.cycle {
                evidence.insert(
                    "menstrual_cycle".to_string(),
                    format!("day_{}_of_{}", cycle.day, cycle.cycle_length),
                );
            }
        }

        evidence
    }
}

/// Hooper 1..=7 score to a coarse band.
pub fn hooper_band(score: u8) -> &'static str {
    match score {
        1..=2 => "low",
        3..=4 => "medium",
        _ => "high",
    }
}

fn sleep_performance(payload: &DailyPayload, baseline: &ResolvedBaseline) -> Option<&'static str> {
    let hours = payload.total_sleep_minutes? / 60.0;
    let efficiency = match (payload.total_sleep_minutes, payload.in_bed_minutes) {
        (Some(sleep), Some(bed)) if bed > 0.0 => Some((sleep / bed).clamp(0.0, 1.0)),
        _ => None,
    };

    let (good_hours, medium_hours) = match baseline.sleep_hours_mu {
        Some(mu) => ((mu + 1.0).clamp(7.0, 9.0), (mu - 0.5).clamp(6.0, 8.0)),
        None => (7.0, 6.0),
    };
    let (good_eff, medium_eff) = match baseline.sleep_eff_mu {
        Some(mu) => ((mu - 0.05).max(0.85), (mu - 0.10).max(0.75)),
        None => (0.85, 0.75),
    };

    let (eff_good, eff_medium) = match efficiency {
        Some(e) => (e >= good_eff, e >= medium_eff),
        // Without an in-bed figure, judge duration alone.
        None => (true, true),
    };

    if hours >= good_hours && eff_good {
        Some("good")
    } else if hours >= medium_hours && eff_medium {
        Some("medium")
    } else {
        Some("poor")
    }
}

fn restorative_sleep(payload: &DailyPayload, baseline: &ResolvedBaseline) -> Option<&'static str> {
    let ratio = payload.restorative_ratio.or_else(|| {
        match (
            payload.deep_sleep_minutes,
            payload.rem_sleep_minutes,
            payload.total_sleep_minutes,
        ) {
            (Some(deep), Some(rem), Some(total)) if total > 0.0 => {
                Some(((deep + rem) / total).clamp(0.0, 1.0))
            }
            _ => None,
        }
    })?;

    let (high_threshold, medium_threshold) = match baseline.restorative_mu {
        Some(mu) => ((mu + 0.10).max(0.35).min(0.55), (mu - 0.05).max(0.25)),
        None => (0.35, 0.25),
    };

    if ratio >= high_threshold {
        Some("high")
    } else if ratio >= medium_threshold {
        Some("medium")
    } else {
        Some("low")
    }
}

fn hrv_trend(payload: &DailyPayload, baseline: &ResolvedBaseline) -> Option<&'static str> {
    // Preferred path: z-score against the personal baseline.
    if let (Some(today), Some(mu), Some(sd)) =
        (payload.hrv_rmssd_today, baseline.hrv_mu, baseline.hrv_sd)
    {
        if sd > 0.0 {
            let z = (today - mu) / sd;
            return Some(if z >= 0.5 {
                "rising"
            } else if z > -0.5 {
                "stable"
            } else if z > -1.5 {
                "slight_decline"
            } else {
                "significant_decline"
            });
        }
    }

    // Fallback: relative change of the 3-day average against the 7-day.
    if let (Some(avg3), Some(avg7)) = (payload.hrv_rmssd_3day_avg, payload.hrv_rmssd_7day_avg) {
        if avg7 > 0.0 {
            let delta = (avg3 - avg7) / avg7;
            return Some(if delta >= 0.03 {
                "rising"
            } else if delta > -0.03 {
                "stable"
            } else if delta > -0.08 {
                "slight_decline"
            } else {
                "significant_decline"
            });
        }
    }

    None
}
