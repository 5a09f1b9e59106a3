//! Core types for the readiness pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: the daily payload, the six-state distribution, per-day records,
//! and the daily result returned by the orchestrator.

use crate::error::EngineError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Number of physiological states in the model.
///
/// The state set is closed: changing it is a breaking change that
/// invalidates every CPT, so it is treated as a schema-versioned constant.
pub const STATE_COUNT: usize = 6;

/// Probability floor applied to likelihoods so a single zero cell can never
/// annihilate a posterior.
pub const PROB_FLOOR: f64 = 1e-6;

/// Tolerance used when checking that a distribution sums to 1.0.
pub const SUM_TOLERANCE: f64 = 1e-6;

/// Physiological state along the training-stress continuum, best to worst.
///
/// Ordering is semantic: `Peak` outranks `WellAdapted`, and so on down to
/// `Overtraining`. Diagnosis tie-breaks follow this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Peak,
    WellAdapted,
    /// Functional overreaching: productive short-term fatigue.
    #[serde(rename = "for")]
    FunctionalOverreaching,
    AcuteFatigue,
    /// Non-functional overreaching: fatigue without adaptation.
    #[serde(rename = "nfor")]
    NonFunctionalOverreaching,
    /// Overtraining syndrome.
    #[serde(rename = "ots")]
    Overtraining,
}

impl State {
    /// All states in canonical index order.
    pub const ALL: [State; STATE_COUNT] = [
        State::Peak,
        State::WellAdapted,
        State::FunctionalOverreaching,
        State::AcuteFatigue,
        State::NonFunctionalOverreaching,
        State::Overtraining,
    ];

    /// Canonical index of this state into distribution/CPT arrays.
    pub fn index(self) -> usize {
        match self {
            State::Peak => 0,
            State::WellAdapted => 1,
            State::FunctionalOverreaching => 2,
            State::AcuteFatigue => 3,
            State::NonFunctionalOverreaching => 4,
            State::Overtraining => 5,
        }
    }

    /// Score weight used to collapse a distribution to a 0-100 readiness score.
    pub fn score_weight(self) -> f64 {
        match self {
            State::Peak => 100.0,
            State::WellAdapted => 85.0,
            State::FunctionalOverreaching => 60.0,
            State::AcuteFatigue => 50.0,
            State::NonFunctionalOverreaching => 30.0,
            State::Overtraining => 10.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Peak => "peak",
            State::WellAdapted => "well_adapted",
            State::FunctionalOverreaching => "for",
            State::AcuteFatigue => "acute_fatigue",
            State::NonFunctionalOverreaching => "nfor",
            State::Overtraining => "ots",
        }
    }
}

/// Probability distribution over the six states.
///
/// Invariant: probabilities sum to 1.0 within [`SUM_TOLERANCE`] after every
/// engine step. All non-normalizing transforms call
/// [`StateDistribution::normalize`] immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDistribution(pub [f64; STATE_COUNT]);

impl StateDistribution {
    /// Uniform distribution.
    pub fn uniform() -> Self {
        StateDistribution([1.0 / STATE_COUNT as f64; STATE_COUNT])
    }

    /// Default seed used when no previous-day posterior is available.
    pub fn default_seed() -> Self {
        StateDistribution([0.10, 0.50, 0.30, 0.10, 0.0, 0.0])
    }

    /// Build from a state-keyed map, renormalizing on entry. Missing states
    /// get zero mass; an all-zero map falls back to the default seed.
    pub fn from_map(map: &HashMap<State, f64>) -> Self {
        let mut probs = [0.0; STATE_COUNT];
        for (state, p) in map {
            probs[state.index()] = p.max(0.0);
        }
        if probs.iter().sum::<f64>() <= 0.0 {
            return Self::default_seed();
        }
        let mut dist = StateDistribution(probs);
        dist.normalize();
        dist
    }

    /// Export to a state-keyed map for JSON output.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        State::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), self.0[s.index()]))
            .collect()
    }

    pub fn get(&self, state: State) -> f64 {
        self.0[state.index()]
    }

    /// Rescale so the probabilities sum to 1.0. A degenerate all-zero vector
    /// becomes uniform rather than NaN.
    pub fn normalize(&mut self) {
        let sum: f64 = self.0.iter().sum();
        if sum <= 0.0 || !sum.is_finite() {
            self.0 = [1.0 / STATE_COUNT as f64; STATE_COUNT];
            return;
        }
        for p in &mut self.0 {
            *p /= sum;
        }
    }

    /// Multiply element-wise by a likelihood vector raised to `weight`, then
    /// normalize. Likelihood cells are floored at [`PROB_FLOOR`] on read.
    pub fn apply_likelihood(&mut self, likelihood: &[f64; STATE_COUNT], weight: f64) {
        for (p, l) in self.0.iter_mut().zip(likelihood.iter()) {
            *p *= l.max(PROB_FLOOR).powf(weight);
        }
        self.normalize();
    }

    /// Move `fraction` of the combined mass on `from` states onto `to` states.
    ///
    /// The moved mass is subtracted proportionally from the `from` pool
    /// (floored at [`PROB_FLOOR`]) and divided equally across the `to` pool,
    /// then the distribution is renormalized.
    pub fn shift_mass(&mut self, from: &[State], to: &[State], fraction: f64) {
        let total_from: f64 = from.iter().map(|s| self.0[s.index()]).sum();
        if total_from <= 0.0 || fraction <= 0.0 || to.is_empty() {
            return;
        }
        let moved = total_from * fraction;
        for s in from {
            let i = s.index();
            let share = self.0[i] / total_from;
            self.0[i] = (self.0[i] - moved * share).max(PROB_FLOOR);
        }
        let per_target = moved / to.len() as f64;
        for s in to {
            self.0[s.index()] += per_target;
        }
        self.normalize();
    }

    /// Expected readiness score: per-state probability times state weight,
    /// rounded and clamped to [0, 100].
    pub fn score(&self) -> u8 {
        let raw: f64 = State::ALL
            .iter()
            .map(|s| self.0[s.index()] * s.score_weight())
            .sum();
        raw.round().clamp(0.0, 100.0) as u8
    }

    /// Most probable state; ties break toward the better-ranked state.
    pub fn argmax(&self) -> State {
        let mut best = State::Peak;
        let mut best_p = self.0[0];
        for s in State::ALL.iter().skip(1) {
            if self.0[s.index()] > best_p {
                best = *s;
                best_p = self.0[s.index()];
            }
        }
        best
    }

    /// True when the distribution sums to 1.0 within tolerance.
    pub fn is_normalized(&self) -> bool {
        (self.0.iter().sum::<f64>() - 1.0).abs() <= SUM_TOLERANCE
    }
}

/// Training-load label for a day or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadLabel {
    Rest,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl LoadLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadLabel::Rest => "rest",
            LoadLabel::Low => "low",
            LoadLabel::Medium => "medium",
            LoadLabel::High => "high",
            LoadLabel::VeryHigh => "very_high",
        }
    }

    /// High-side labels counted by the consecutive-load penalty.
    pub fn is_high_side(self) -> bool {
        matches!(self, LoadLabel::High | LoadLabel::VeryHigh)
    }
}

/// Gender as carried by the payload; gates cycle evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// Hooper questionnaire scores, each on the 1..=7 scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HooperScores {
    pub fatigue: u8,
    pub soreness: u8,
    pub stress: u8,
    pub sleep: u8,
}

/// Menstrual cycle position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CycleInfo {
    /// 1-based day within the cycle.
    pub day: u32,
    /// Cycle length in days, 20..=40.
    pub cycle_length: u32,
}

/// Daily journal entry. Known booleans are read by the engine; any other
/// keys are preserved in the stored record but ignored by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Journal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alcohol_consumed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_caffeine: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_before_bed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_meal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_sick: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_injured: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poor_nutrition: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gi_symptoms: Option<bool>,
    /// Unlisted keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Full day-level input to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPayload {
    pub user_id: String,
    /// Day the payload describes (YYYY-MM-DD).
    pub date: NaiveDate,
    pub gender: Gender,

    /// Yesterday's final posterior; default seed supplied if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state_probs: Option<HashMap<State, f64>>,

    // Raw biometrics (any subset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_sleep_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_bed_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_sleep_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rem_sleep_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restorative_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hrv_rmssd_today: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hrv_rmssd_3day_avg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hrv_rmssd_7day_avg: Option<f64>,

    // Baseline overrides: when present they take precedence over the cached
    // per-user baseline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_baseline_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_baseline_eff: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_baseline_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hrv_baseline_mu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hrv_baseline_sd: Option<f64>,

    // Training history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_load: Option<LoadLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_training_loads: Option<Vec<LoadLabel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_training_au: Option<Vec<f64>>,

    /// Yesterday's journal: short-term effects folded into today's prior.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yesterday_journal: Option<Journal>,
    /// Today's journal: persistent effects (illness, injury) fused as evidence.
    #[serde(default)]
    pub journal: Journal,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooper: Option<HooperScores>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<CycleInfo>,

    /// Free-text athlete notes; stored, never read by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_notes: Option<String>,
}

impl DailyPayload {
    /// Validate payload shape. This is the only failure that ever reaches the
    /// caller; everything downstream degrades gracefully.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.user_id.trim().is_empty() {
            return Err(EngineError::invalid("user_id", "must be non-empty"));
        }
        if let Some(h) = &self.hooper {
            for (name, v) in [
                ("hooper.fatigue", h.fatigue),
                ("hooper.soreness", h.soreness),
                ("hooper.stress", h.stress),
                ("hooper.sleep", h.sleep),
            ] {
                if !(1..=7).contains(&v) {
                    return Err(EngineError::invalid(name, "must be within 1..=7"));
                }
            }
        }
        for (name, v) in [
            ("total_sleep_minutes", self.total_sleep_minutes),
            ("in_bed_minutes", self.in_bed_minutes),
            ("deep_sleep_minutes", self.deep_sleep_minutes),
            ("rem_sleep_minutes", self.rem_sleep_minutes),
        ] {
            if let Some(m) = v {
                if m < 0.0 || !m.is_finite() {
                    return Err(EngineError::invalid(name, "must be non-negative"));
                }
            }
        }
        if let Some(c) = &self.cycle {
            if c.day < 1 {
                return Err(EngineError::invalid("cycle.day", "must be >= 1"));
            }
            if !(20..=40).contains(&c.cycle_length) {
                return Err(EngineError::invalid(
                    "cycle.cycle_length",
                    "must be within 20..=40",
                ));
            }
        }
        Ok(())
    }
}

/// A single per-night sleep record used for baseline computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepRecord {
    pub date: NaiveDate,
    pub duration_hours: f64,
    /// Sleep efficiency in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<f64>,
    /// (deep + REM) / total, in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restorative_ratio: Option<f64>,
}

/// A single HRV measurement used for baseline computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HrvRecord {
    pub date: NaiveDate,
    pub rmssd_ms: f64,
}

/// Two-question profile driving the default (cold-start) baseline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub sleep_type: SleepType,
    #[serde(default)]
    pub hrv_type: HrvType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepType {
    ShortSleeper,
    #[default]
    NormalSleeper,
    LongSleeper,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HrvType {
    /// Typically < 25 years old.
    HighHrv,
    /// Typically 25-45 years old.
    #[default]
    NormalHrv,
    /// Typically > 45 years old.
    LowHrv,
}

/// One non-trivial pipeline step and the distribution after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStep {
    pub step: String,
    pub probs_after: BTreeMap<String, f64>,
}

/// Result of one daily readiness computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyResult {
    pub user_id: String,
    pub date: NaiveDate,
    pub final_readiness_score: u8,
    pub final_diagnosis: State,
    pub prior_probs: BTreeMap<String, f64>,
    pub final_posterior_probs: BTreeMap<String, f64>,
    /// Exactly the evidence items that were applied, variable -> category.
    pub evidence_pool: BTreeMap<String, String>,
    /// One entry per non-trivial update, in application order.
    pub update_history: Vec<UpdateStep>,
    /// Feed back as tomorrow's `previous_state_probs`.
    pub next_previous_state_probs: BTreeMap<String, f64>,
}

/// One logged training session for the consumption calculator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpe: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<LoadLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub au: Option<f64>,
}

/// Input to the consumption calculator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionRequest {
    pub user_id: String,
    pub date: NaiveDate,
    /// The morning's posterior score; immutable for the day.
    pub base_readiness_score: u8,
    #[serde(default)]
    pub sessions: Vec<TrainingSession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_override: Option<crate::consumption::ConsumptionParams>,
}

/// Per-session deduction detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConsumption {
    pub au_used: f64,
    pub delta_consumption: f64,
}

/// How the day total was assembled from the session deltas and caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionBreakdown {
    pub raw_total: f64,
    pub capped_total: f64,
    pub per_session_cap: f64,
    pub per_day_cap: f64,
}

/// Output of the consumption calculator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionResult {
    pub consumption_score: f64,
    pub display_readiness: u8,
    pub breakdown: ConsumptionBreakdown,
    pub sessions: Vec<SessionConsumption>,
    pub caps_applied: bool,
}
