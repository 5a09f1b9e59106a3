//! Pipeline orchestration
//!
//! This module provides the public API of the readiness engine. One call
//! routes a daily payload through mapping, prior assembly and evidence
//! fusion, and returns the final score, diagnosis, posterior and the seed
//! for tomorrow.
//!
//! Pipeline stages:
//! 1. Payload validation - the only failure that reaches the caller
//! 2. EvidenceMapper - raw signals to categorical evidence (+ baseline)
//! 3. PriorEngine - transition, load CPT, streak penalty, ACWR, journal
//! 4. PosteriorEngine - weighted likelihood fusion in canonical order
//! 5. Result assembly - score, diagnosis, history, next-day seed

use crate::baseline::{
    Baseline, BaselineEventSink, BaselineRepository, BaselineUpdater, InMemoryBaselineRepository,
    NullEventSink,
};
use crate::consumption::ConsumptionCalculator;
use crate::error::EngineError;
use crate::mapping::{EvidenceMapper, ResolvedBaseline};
use crate::personalization::{
    InMemoryPersonalizationStore, PersonalizationLoader, PersonalizationStore,
};
use crate::posterior::PosteriorEngine;
use crate::prior::PriorEngine;
use crate::tables::CptLibrary;
use crate::types::{
    ConsumptionRequest, ConsumptionResult, DailyPayload, DailyResult, HrvRecord, SleepRecord,
    StateDistribution, UserProfile,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stateless per-request orchestrator over shared read-only tables and the
/// per-user baseline/personalization stores.
///
/// The math pipeline never suspends; the only I/O points are the baseline
/// read, the personalization read and whatever persistence the caller does
/// with the returned result. Two calls with the same payload produce
/// bit-identical results.
pub struct ReadinessEngine {
    tables: CptLibrary,
    baselines: Arc<dyn BaselineRepository>,
    updater: BaselineUpdater,
    personalization: PersonalizationLoader,
}

impl Default for ReadinessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessEngine {
    /// Engine with in-memory stores; suits tests, the CLI and single-process
    /// deployments.
    pub fn new() -> Self {
        Self::with_stores(
            Arc::new(InMemoryBaselineRepository::new()),
            Arc::new(InMemoryPersonalizationStore::new()),
            Arc::new(NullEventSink),
        )
    }

    /// Engine over caller-provided stores.
    pub fn with_stores(
        baselines: Arc<dyn BaselineRepository>,
        personalization: Arc<dyn PersonalizationStore>,
        events: Arc<dyn BaselineEventSink>,
    ) -> Self {
        ReadinessEngine {
            tables: CptLibrary::new(),
            updater: BaselineUpdater::new(baselines.clone(), events),
            baselines,
            personalization: PersonalizationLoader::new(personalization),
        }
    }

    /// Compute the day's readiness. Total for any well-formed payload:
    /// missing evidence is omitted, baseline and personalization failures
    /// degrade to defaults.
    pub fn compute_readiness(&self, payload: &DailyPayload) -> Result<DailyResult, EngineError> {
        payload.validate()?;

        let previous = match &payload.previous_state_probs {
            Some(map) => StateDistribution::from_map(map),
            None => StateDistribution::default_seed(),
        };

        // Baseline injection: payload overrides win, then the cached store,
        // then fixed thresholds. Never blocks beyond the single cache read.
        let cached = self.baselines.load(&payload.user_id).map(|v| v.baseline);
        let baseline = ResolvedBaseline::resolve(payload, cached.as_ref());

        let evidence = EvidenceMapper::map(payload, &baseline);

        let mut history = Vec::new();
        let prior_engine = PriorEngine::new(&self.tables);
        let prior = prior_engine.assemble(&previous, payload, &mut history);

        let overrides = self.personalization.load(&payload.user_id);
        let posterior_engine = PosteriorEngine::new(&self.tables, overrides.as_deref());
        let posterior = posterior_engine.fuse(
            &prior,
            &evidence,
            payload.cycle.as_ref(),
            &mut history,
        );

        // Exactly the evidence items that were applied, recovered from the
        // recorded update steps.
        let mut applied = BTreeMap::new();
        for step in &history {
            if let Some(rest) = step.step.strip_prefix("evidence:") {
                if let Some((variable, _)) = rest.split_once('=') {
                    if let Some(category) = evidence.get(variable) {
                        applied.insert(variable.to_string(), category.clone());
                    }
                }
            }
        }

        Ok(DailyResult {
            user_id: payload.user_id.clone(),
            date: payload.date,
            final_readiness_score: posterior.score(),
            final_diagnosis: posterior.argmax(),
            prior_probs: prior.to_map(),
            final_posterior_probs: posterior.to_map(),
            evidence_pool: applied,
            update_history: history,
            next_previous_state_probs: posterior.to_map(),
        })
    }

    /// Compute readiness from a JSON payload, returning a JSON result.
    pub fn compute_readiness_json(&self, json: &str) -> Result<String, EngineError> {
        let payload: DailyPayload = serde_json::from_str(json)?;
        let result = self.compute_readiness(&payload)?;
        Ok(serde_json::to_string_pretty(&result)?)
    }

    /// Intraday consumption from the immutable morning base score.
    pub fn compute_consumption(
        &self,
        request: &ConsumptionRequest,
    ) -> Result<ConsumptionResult, EngineError> {
        if request.user_id.trim().is_empty() {
            return Err(EngineError::invalid("user_id", "must be non-empty"));
        }
        Ok(ConsumptionCalculator::compute(request))
    }

    /// Read-through baseline access; computes and stores on first use.
    pub fn get_or_compute_baseline(
        &self,
        user_id: &str,
        sleep_records: &[SleepRecord],
        hrv_records: &[HrvRecord],
        profile: Option<&UserProfile>,
    ) -> Baseline {
        self.updater
            .get_or_compute(user_id, sleep_records, hrv_records, profile)
    }

    /// Run the smart refresh policy; emits `baseline_updated` on change.
    pub fn update_baseline(
        &self,
        user_id: &str,
        sleep_records: &[SleepRecord],
        hrv_records: &[HrvRecord],
        now: DateTime<Utc>,
    ) -> Baseline {
        self.updater
            .update(user_id, sleep_records, hrv_records, None, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineSource;
    use crate::types::tests::minimal_payload;
    use crate::types::{
        CycleInfo, Gender, HooperScores, Journal, LoadLabel, State,
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn previous(probs: [f64; 6]) -> Option<HashMap<State, f64>> {
        Some(
            State::ALL
                .iter()
                .zip(probs.iter())
                .map(|(s, p)| (*s, *p))
                .collect(),
        )
    }

    fn hooper(fatigue: u8, soreness: u8, stress: u8, sleep: u8) -> Option<HooperScores> {
        Some(HooperScores {
            fatigue,
            soreness,
            stress,
            sleep,
        })
    }

    /// Scenario A: baseline healthy day.
    fn healthy_day_payload() -> DailyPayload {
        let mut payload = minimal_payload();
        payload.training_load = Some(LoadLabel::Medium);
        let mut au = vec![350.0; 21];
        au.extend(vec![500.0; 7]);
        payload.recent_training_au = Some(au);
        payload.hooper = hooper(3, 3, 3, 3);
        payload.total_sleep_minutes = Some(450.0);
        payload.in_bed_minutes = Some(500.0); // efficiency 0.90
        payload.restorative_ratio = Some(0.38);
        payload.hrv_rmssd_today = Some(60.0);
        payload.hrv_baseline_mu = Some(58.0);
        payload.hrv_baseline_sd = Some(6.0);
        payload
    }

    #[test]
    fn test_scenario_a_baseline_healthy_day() {
        let engine = ReadinessEngine::new();
        let result = engine.compute_readiness(&healthy_day_payload()).unwrap();

        assert!(
            (72..=82).contains(&result.final_readiness_score),
            "score {}",
            result.final_readiness_score
        );
        assert_eq!(result.final_diagnosis, State::WellAdapted);
        assert_eq!(result.evidence_pool["hrv_trend"], "stable");
        assert_eq!(result.evidence_pool["sleep_performance"], "good");
        assert_eq!(result.evidence_pool["restorative_sleep"], "high");
        // The heavy final week trips the ACWR penalty.
        assert!(result.update_history.iter().any(|s| s.step == "acwr_penalty"));
    }

    #[test]
    fn test_scenario_b_post_heavy_block_fatigue() {
        let mut payload = minimal_payload();
        payload.previous_state_probs = previous([0.05, 0.30, 0.40, 0.20, 0.05, 0.0]);
        payload.training_load = Some(LoadLabel::High);
        payload.recent_training_loads = Some(vec![
            LoadLabel::High,
            LoadLabel::High,
            LoadLabel::High,
            LoadLabel::High,
            LoadLabel::VeryHigh,
            LoadLabel::High,
            LoadLabel::High,
            LoadLabel::High,
        ]);
        payload.hooper = hooper(5, 5, 4, 4);
        payload.total_sleep_minutes = Some(372.0); // 6.2 h
        payload.in_bed_minutes = Some(372.0 / 0.78);
        payload.restorative_ratio = Some(0.22);
        payload.hrv_rmssd_today = Some(42.0);
        payload.hrv_baseline_mu = Some(58.0);
        payload.hrv_baseline_sd = Some(6.0); // z ~ -2.67
        let mut yesterday = Journal::default();
        yesterday.late_meal = Some(true);
        payload.yesterday_journal = Some(yesterday);

        let engine = ReadinessEngine::new();
        let result = engine.compute_readiness(&payload).unwrap();

        assert!(
            (35..=50).contains(&result.final_readiness_score),
            "score {}",
            result.final_readiness_score
        );
        assert!(matches!(
            result.final_diagnosis,
            State::AcuteFatigue | State::NonFunctionalOverreaching
        ));
        assert_eq!(result.evidence_pool["hrv_trend"], "significant_decline");
        assert!(result
            .update_history
            .iter()
            .any(|s| s.step == "consecutive_load_penalty"));
        assert!(result
            .update_history
            .iter()
            .any(|s| s.step == "journal:late_meal"));
    }

    #[test]
    fn test_scenario_c_acwr_reward() {
        let mut payload = minimal_payload();
        let mut au = vec![500.0; 28];
        au.extend(vec![200.0; 7]);
        payload.recent_training_au = Some(au);
        payload.hooper = hooper(2, 2, 2, 2);
        payload.total_sleep_minutes = Some(480.0); // 8.0 h
        payload.in_bed_minutes = Some(480.0 / 0.92);
        payload.restorative_ratio = Some(0.40);
        payload.hrv_rmssd_today = Some(64.0);
        payload.hrv_baseline_mu = Some(58.0);
        payload.hrv_baseline_sd = Some(6.0); // z = +1.0

        let engine = ReadinessEngine::new();
        let result = engine.compute_readiness(&payload).unwrap();

        assert!(
            (85..=95).contains(&result.final_readiness_score),
            "score {}",
            result.final_readiness_score
        );
        assert!(matches!(
            result.final_diagnosis,
            State::Peak | State::WellAdapted
        ));
        assert!(result.update_history.iter().any(|s| s.step == "acwr_reward"));
        // Today's label is bucketed from the taper AU, not doubled up.
        assert!(result
            .update_history
            .iter()
            .any(|s| s.step == "training_load:low"));
    }

    #[test]
    fn test_scenario_d_sick_override() {
        let mut payload = healthy_day_payload();
        payload.journal.is_sick = Some(true);

        let engine = ReadinessEngine::new();
        let result = engine.compute_readiness(&payload).unwrap();

        let peak = result.final_posterior_probs["peak"];
        assert!(peak < 0.02, "peak mass {peak}");
        assert!(result.final_readiness_score <= 50);
        assert!(matches!(
            result.final_diagnosis,
            State::FunctionalOverreaching
                | State::AcuteFatigue
                | State::NonFunctionalOverreaching
                | State::Overtraining
        ));
    }

    #[test]
    fn test_scenario_e_new_user_insufficient_data() {
        // Single day of data, no baselines anywhere: fixed thresholds apply
        // and the engine still produces a full result.
        let mut payload = minimal_payload();
        payload.total_sleep_minutes = Some(420.0);
        payload.in_bed_minutes = Some(480.0);
        payload.hooper = hooper(3, 3, 3, 3);

        let engine = ReadinessEngine::new();
        let baseline = engine.get_or_compute_baseline(&payload.user_id, &[], &[], None);
        assert!(matches!(
            baseline.source,
            BaselineSource::Default | BaselineSource::Fallback
        ));

        let result = engine.compute_readiness(&payload).unwrap();
        assert!(result.final_readiness_score <= 100);
        // 7.0 h at 0.875 efficiency: good duration band, medium efficiency.
        assert_eq!(result.evidence_pool["sleep_performance"], "medium");
        // HRV evidence omitted entirely.
        assert!(!result.evidence_pool.contains_key("hrv_trend"));
    }

    #[test]
    fn test_scenario_f_consumption_day() {
        use crate::types::TrainingSession;
        let engine = ReadinessEngine::new();
        let mut request = ConsumptionRequest {
            user_id: "athlete-1".to_string(),
            date: minimal_payload().date,
            base_readiness_score: 80,
            sessions: vec![
                TrainingSession {
                    rpe: Some(8.0),
                    duration_minutes: Some(60.0),
                    ..TrainingSession::default()
                },
                TrainingSession {
                    label: Some(LoadLabel::Medium),
                    duration_minutes: Some(30.0),
                    ..TrainingSession::default()
                },
            ],
            params_override: None,
        };
        let result = engine.compute_consumption(&request).unwrap();
        assert_eq!(
            result.display_readiness,
            80 - result.consumption_score.round() as u8
        );

        // A third hard session drives the day into the 60-point cap.
        request.sessions.push(TrainingSession {
            rpe: Some(9.0),
            duration_minutes: Some(60.0),
            ..TrainingSession::default()
        });
        let capped = engine.compute_consumption(&request).unwrap();
        assert_eq!(capped.consumption_score, 60.0);
        assert_eq!(capped.display_readiness, 20);
    }

    #[test]
    fn test_posterior_always_normalized_and_bounded() {
        let engine = ReadinessEngine::new();
        for payload in [minimal_payload(), healthy_day_payload()] {
            let result = engine.compute_readiness(&payload).unwrap();
            let sum: f64 = result.final_posterior_probs.values().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            assert!(result.final_readiness_score <= 100);
            for step in &result.update_history {
                let sum: f64 = step.probs_after.values().sum();
                assert!((sum - 1.0).abs() < 1e-6, "step {} denormalized", step.step);
            }
        }
    }

    #[test]
    fn test_diagnosis_is_argmax() {
        let engine = ReadinessEngine::new();
        let result = engine.compute_readiness(&healthy_day_payload()).unwrap();
        let (best_state, _) = result
            .final_posterior_probs
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_eq!(result.final_diagnosis.as_str(), best_state);
    }

    #[test]
    fn test_bit_identical_reruns() {
        let engine = ReadinessEngine::new();
        let payload = healthy_day_payload();
        let first = engine.compute_readiness(&payload).unwrap();
        let second = engine.compute_readiness(&payload).unwrap();
        assert_eq!(first.final_posterior_probs, second.final_posterior_probs);
        assert_eq!(first.final_readiness_score, second.final_readiness_score);
    }

    #[test]
    fn test_next_seed_feeds_transition_only_tomorrow() {
        let engine = ReadinessEngine::new();
        let today = engine.compute_readiness(&healthy_day_payload()).unwrap();

        // Tomorrow with no training, no biometrics, no questionnaire.
        let mut tomorrow = minimal_payload();
        tomorrow.previous_state_probs = Some(
            today
                .next_previous_state_probs
                .iter()
                .map(|(k, v)| (serde_json::from_value(serde_json::json!(k)).unwrap(), *v))
                .collect(),
        );
        let result = engine.compute_readiness(&tomorrow).unwrap();

        // Only the transition step ran, so posterior == prior.
        assert_eq!(result.update_history.len(), 1);
        assert_eq!(result.update_history[0].step, "transition");
        assert_eq!(result.prior_probs, result.final_posterior_probs);
    }

    #[test]
    fn test_hooper_fatigue_monotonically_lowers_score() {
        let engine = ReadinessEngine::new();
        let mut last = u8::MAX;
        for fatigue in 1..=7 {
            let mut payload = healthy_day_payload();
            payload.hooper = hooper(fatigue, 3, 3, 3);
            let score = engine
                .compute_readiness(&payload)
                .unwrap()
                .final_readiness_score;
            assert!(score <= last, "fatigue {fatigue} raised score");
            last = score;
        }
    }

    #[test]
    fn test_hrv_two_sigma_swing_monotone() {
        let engine = ReadinessEngine::new();
        let mut last = 0;
        // From 2 sigma below to 2 sigma above baseline (mu 58, sd 6).
        for today in [46.0, 52.0, 58.0, 64.0, 70.0] {
            let mut payload = healthy_day_payload();
            payload.hrv_rmssd_today = Some(today);
            let score = engine
                .compute_readiness(&payload)
                .unwrap()
                .final_readiness_score;
            assert!(score >= last, "hrv {today} lowered score");
            last = score;
        }
    }

    #[test]
    fn test_training_load_sweep_monotone_score() {
        let engine = ReadinessEngine::new();
        let mut last = u8::MAX;
        for label in [
            LoadLabel::Rest,
            LoadLabel::Low,
            LoadLabel::Medium,
            LoadLabel::High,
            LoadLabel::VeryHigh,
        ] {
            let mut payload = healthy_day_payload();
            payload.training_load = Some(label);
            payload.recent_training_au = None; // isolate the label effect
            let score = engine
                .compute_readiness(&payload)
                .unwrap()
                .final_readiness_score;
            assert!(score <= last, "{label:?} raised score");
            last = score;
        }
    }

    #[test]
    fn test_neutral_evidence_drifts_below_epsilon() {
        let engine = ReadinessEngine::new();
        let mut payload = healthy_day_payload();
        payload.hooper = None;
        let without = engine.compute_readiness(&payload).unwrap();

        // All-neutral questionnaire.
        payload.hooper = hooper(3, 3, 3, 3);
        let with = engine.compute_readiness(&payload).unwrap();

        let drift: f64 = without
            .final_posterior_probs
            .iter()
            .map(|(k, v)| (v - with.final_posterior_probs[k]).abs())
            .sum();
        assert!(drift < 0.35, "L1 drift {drift}");
        let delta = i32::from(without.final_readiness_score)
            - i32::from(with.final_readiness_score);
        assert!(delta.abs() <= 5, "score delta {delta}");
    }

    #[test]
    fn test_invalid_payload_is_the_only_user_visible_error() {
        let engine = ReadinessEngine::new();
        let mut payload = minimal_payload();
        payload.user_id = String::new();
        let err = engine.compute_readiness(&payload).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPayload { .. }));
    }

    #[test]
    fn test_stored_baseline_injected_into_mapping() {
        let engine = ReadinessEngine::new();
        // A long-sleeper baseline shifts the good-sleep threshold to 9 h.
        let mut records = Vec::new();
        for i in 0..30 {
            records.push(crate::types::SleepRecord {
                date: minimal_payload().date - chrono::Days::new(30 - i),
                duration_hours: 8.5,
                efficiency: Some(0.90),
                restorative_ratio: Some(0.35),
            });
        }
        let hrv: Vec<crate::types::HrvRecord> = (0..30)
            .map(|i| crate::types::HrvRecord {
                date: minimal_payload().date - chrono::Days::new(30 - i),
                rmssd_ms: 58.0 + (i % 5) as f64,
            })
            .collect();
        engine.get_or_compute_baseline("athlete-1", &records, &hrv, None);

        let mut payload = minimal_payload();
        payload.total_sleep_minutes = Some(7.5 * 60.0); // good for a default user
        payload.in_bed_minutes = Some(7.5 * 60.0 / 0.92);
        let result = engine.compute_readiness(&payload).unwrap();
        // 7.5 h is below the personal 8.0 medium threshold (8.5 - 0.5).
        assert_eq!(result.evidence_pool["sleep_performance"], "poor");
    }

    #[test]
    fn test_personalized_cpt_overrides_fusion() {
        let store = Arc::new(InMemoryPersonalizationStore::new());
        // A model that treats stable HRV as strongly peak-predictive.
        store.put(
            "athlete-1",
            r#"{"emission_cpt": {"hrv_trend": {"stable": {
                "peak": 0.70, "well_adapted": 0.25, "for": 0.02,
                "acute_fatigue": 0.01, "nfor": 0.01, "ots": 0.01
            }}}}"#,
        );
        let personalized = ReadinessEngine::with_stores(
            Arc::new(InMemoryBaselineRepository::new()),
            store,
            Arc::new(NullEventSink),
        );
        let default_engine = ReadinessEngine::new();

        let payload = healthy_day_payload();
        let with = personalized.compute_readiness(&payload).unwrap();
        let without = default_engine.compute_readiness(&payload).unwrap();
        assert!(with.final_readiness_score > without.final_readiness_score);
    }

    #[test]
    fn test_cycle_evidence_applied_for_female_payload() {
        let engine = ReadinessEngine::new();
        let mut payload = healthy_day_payload();
        payload.gender = Gender::Female;
        payload.cycle = Some(CycleInfo {
            day: 7,
            cycle_length: 28,
        });
        let follicular = engine.compute_readiness(&payload).unwrap();
        assert!(follicular.evidence_pool.contains_key("menstrual_cycle"));

        payload.cycle = Some(CycleInfo {
            day: 26,
            cycle_length: 28,
        });
        let luteal = engine.compute_readiness(&payload).unwrap();
        assert!(luteal.final_readiness_score <= follicular.final_readiness_score);
    }

    #[test]
    fn test_json_round_trip_entry_point() {
        let engine = ReadinessEngine::new();
        let json = serde_json::to_string(&healthy_day_payload()).unwrap();
        let out = engine.compute_readiness_json(&json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["final_diagnosis"], "well_adapted");
        assert!(value["final_readiness_score"].as_u64().unwrap() <= 100);
    }
}
