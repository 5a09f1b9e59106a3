//! Prior assembly
//!
//! Builds today's prior distribution before any evidence fusion: baseline
//! state transition, training-load CPT, consecutive-high-load penalty, ACWR
//! adjustment, and yesterday's short-term journal effects, normalizing after
//! each step.

use crate::tables::{au_to_label, CptLibrary, SHORT_TERM_JOURNAL_KEYS};
use crate::types::{
    DailyPayload, Journal, LoadLabel, State, StateDistribution, UpdateStep, STATE_COUNT,
};

/// Chronic-load adaptation bands by 28-day mean AU.
const ADAPTATION_LOW_CEILING: f64 = 1200.0;
const ADAPTATION_MID_CEILING: f64 = 2500.0;

/// Streak penalty tiers.
const SHORT_STREAK_WINDOW: usize = 4;
const SHORT_STREAK_COUNT: usize = 3;
const SHORT_STREAK_SHIFT: f64 = 0.50;
const LONG_STREAK_WINDOW: usize = 8;
const LONG_STREAK_COUNT: usize = 6;
const LONG_STREAK_SHIFT: f64 = 0.60;

/// Minimum AU history for the ACWR adjustment to apply.
const ACWR_MIN_ENTRIES: usize = 7;

/// Assembles the prior for one day.
pub struct PriorEngine<'a> {
    tables: &'a CptLibrary,
}

impl<'a> PriorEngine<'a> {
    pub fn new(tables: &'a CptLibrary) -> Self {
        PriorEngine { tables }
    }

    /// Run every prior step in order, recording non-trivial updates.
    pub fn assemble(
        &self,
        previous: &StateDistribution,
        payload: &DailyPayload,
        history: &mut Vec<UpdateStep>,
    ) -> StateDistribution {
        let mut prior = self.transition(previous);
        push_step(history, "transition", &prior);

        if let Some(label) = resolve_today_label(payload) {
            prior.apply_likelihood(self.tables.training_load_likelihood(label), 1.0);
            push_step(history, &format!("training_load:{}", label.as_str()), &prior);
        }

        if let Some(loads) = &payload.recent_training_loads {
            if let Some(shift) = streak_shift(loads) {
                prior.shift_mass(
                    &[
                        State::Peak,
                        State::WellAdapted,
                        State::FunctionalOverreaching,
                        State::AcuteFatigue,
                    ],
                    &[State::NonFunctionalOverreaching],
                    shift,
                );
                push_step(history, "consecutive_load_penalty", &prior);
            }
        }

        if let Some(au) = &payload.recent_training_au {
            if let Some(adjustment) = acwr_adjustment(au) {
                match adjustment {
                    AcwrAdjustment::Reward(fraction) => {
                        prior.shift_mass(
                            &[State::NonFunctionalOverreaching, State::AcuteFatigue],
                            &[State::WellAdapted, State::Peak],
                            fraction,
                        );
                        push_step(history, "acwr_reward", &prior);
                    }
                    AcwrAdjustment::Penalty(fraction) => {
                        prior.shift_mass(
                            &[State::Peak, State::WellAdapted, State::FunctionalOverreaching],
                            &[State::AcuteFatigue, State::NonFunctionalOverreaching],
                            fraction,
                        );
                        push_step(history, "acwr_penalty", &prior);
                    }
                }
            }
        }

        if let Some(journal) = &payload.yesterday_journal {
            for key in SHORT_TERM_JOURNAL_KEYS {
                if journal_flag(journal, key) {
                    if let Some((row, weight)) = self.tables.journal_effect(key) {
                        prior.apply_likelihood(row, weight);
                        push_step(history, &format!("journal:{key}"), &prior);
                    }
                }
            }
        }

        prior
    }

    /// prior[today] = sum over yesterday of P(yesterday) * T[yesterday][today].
    fn transition(&self, previous: &StateDistribution) -> StateDistribution {
        let t = self.tables.transition();
        let mut probs = [0.0; STATE_COUNT];
        for (from, row) in t.iter().enumerate() {
            for (to, cell) in row.iter().enumerate() {
                probs[to] += previous.0[from] * cell;
            }
        }
        let mut prior = StateDistribution(probs);
        prior.normalize();
        prior
    }
}

/// Today's single training-load label: the explicit label wins; otherwise
/// the most recent AU entry is bucketed. Exactly one load CPT applies per
/// day, never both.
pub fn resolve_today_label(payload: &DailyPayload) -> Option<LoadLabel> {
    if let Some(label) = payload.training_load {
        return Some(label);
    }
    payload
        .recent_training_au
        .as_ref()
        .and_then(|au| au.last())
        .map(|au| au_to_label(*au))
}

/// Mass fraction to shift toward NFOR for sustained high loading, if any.
/// The longer tier wins when both match.
fn streak_shift(loads: &[LoadLabel]) -> Option<f64> {
    let high_in = |window: usize| {
        loads
            .iter()
            .rev()
            .take(window)
            .filter(|l| l.is_high_side())
            .count()
    };
    if loads.len() >= LONG_STREAK_WINDOW && high_in(LONG_STREAK_WINDOW) >= LONG_STREAK_COUNT {
        Some(LONG_STREAK_SHIFT)
    } else if loads.len() >= SHORT_STREAK_WINDOW && high_in(SHORT_STREAK_WINDOW) >= SHORT_STREAK_COUNT
    {
        Some(SHORT_STREAK_SHIFT)
    } else {
        None
    }
}

enum AcwrAdjustment {
    Reward(f64),
    Penalty(f64),
}

/// Acute:chronic workload adjustment from the AU history, most recent last.
fn acwr_adjustment(au: &[f64]) -> Option<AcwrAdjustment> {
    if au.len() < ACWR_MIN_ENTRIES {
        return None;
    }
    let chronic_window = &au[au.len().saturating_sub(28)..];
    let chronic = mean(chronic_window);
    if chronic <= 0.0 {
        return None;
    }
    let acute7 = mean(&au[au.len() - 7..]);
    let acute3 = mean(&au[au.len() - 3..]);
    let ratio = acute7 / chronic;

    let band_multiplier_penalty = if chronic < ADAPTATION_LOW_CEILING {
        1.5
    } else if chronic <= ADAPTATION_MID_CEILING {
        1.0
    } else {
        0.5
    };
    let band_multiplier_reward = if chronic > ADAPTATION_MID_CEILING { 1.2 } else { 1.0 };

    if ratio <= 0.9 {
        let base = if ratio <= 0.8 { 0.02 } else { 0.01 };
        Some(AcwrAdjustment::Reward(base * band_multiplier_reward))
    } else if ratio >= 1.15 {
        let base = if ratio < 1.30 {
            0.02
        } else if ratio < 1.50 {
            0.04
        } else {
            0.06
        };
        let mut fraction = base * band_multiplier_penalty;
        if acute3 / chronic >= 1.30 {
            fraction += 0.01;
        }
        Some(AcwrAdjustment::Penalty(fraction))
    } else {
        None
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn journal_flag(journal: &Journal, key: &str) -> bool {
    match key {
        "alcohol_consumed" => journal.alcohol_consumed.unwrap_or(false),
        "late_caffeine" => journal.late_caffeine.unwrap_or(false),
        "screen_before_bed" => journal.screen_before_bed.unwrap_or(false),
        "late_meal" => journal.late_meal.unwrap_or(false),
        _ => false,
    }
}

fn push_step(history: &mut Vec<UpdateStep>, step: &str, dist: &StateDistribution) {
    history.push(UpdateStep {
        step: step.to_string(),
        probs_after: dist.to_map(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::minimal_payload;

    fn engine_prior(payload: &DailyPayload) -> (StateDistribution, Vec<UpdateStep>) {
        let tables = CptLibrary::new();
        let engine = PriorEngine::new(&tables);
        let mut history = Vec::new();
        let prior = engine.assemble(&StateDistribution::default_seed(), payload, &mut history);
        (prior, history)
    }

    #[test]
    fn test_transition_from_default_seed() {
        let (prior, history) = engine_prior(&minimal_payload());
        assert!(prior.is_normalized());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].step, "transition");
        // Seed mass flows heavily toward Peak/Well-adapted.
        assert!(prior.get(State::Peak) > 0.40);
        assert!(prior.get(State::WellAdapted) > 0.35);
        // FOR row leaks a little into the overtrained tail.
        assert!(prior.get(State::Overtraining) > 0.0);
    }

    #[test]
    fn test_training_load_label_applied_once() {
        let mut payload = minimal_payload();
        payload.training_load = Some(LoadLabel::High);
        let (_, history) = engine_prior(&payload);
        let load_steps: Vec<_> = history
            .iter()
            .filter(|s| s.step.starts_with("training_load"))
            .collect();
        assert_eq!(load_steps.len(), 1);
        assert_eq!(load_steps[0].step, "training_load:high");
    }

    #[test]
    fn test_label_derived_from_last_au_when_absent() {
        let mut payload = minimal_payload();
        payload.recent_training_au = Some(vec![300.0, 300.0, 480.0]);
        assert_eq!(resolve_today_label(&payload), Some(LoadLabel::High));

        payload.training_load = Some(LoadLabel::Rest);
        assert_eq!(resolve_today_label(&payload), Some(LoadLabel::Rest));
    }

    #[test]
    fn test_load_monotonically_drains_peak() {
        let labels = [
            LoadLabel::Rest,
            LoadLabel::Low,
            LoadLabel::Medium,
            LoadLabel::High,
            LoadLabel::VeryHigh,
        ];
        let mut last_peak = f64::INFINITY;
        let mut last_fatigue = -1.0;
        for label in labels {
            let mut payload = minimal_payload();
            payload.training_load = Some(label);
            let (prior, _) = engine_prior(&payload);
            let peak = prior.get(State::Peak);
            let fatigue =
                prior.get(State::FunctionalOverreaching) + prior.get(State::AcuteFatigue);
            assert!(peak <= last_peak + 1e-12, "{label:?} raised Peak");
            assert!(fatigue >= last_fatigue - 1e-12, "{label:?} lowered FOR+AF");
            last_peak = peak;
            last_fatigue = fatigue;
        }
    }

    #[test]
    fn test_short_streak_penalty() {
        let mut payload = minimal_payload();
        payload.recent_training_loads = Some(vec![
            LoadLabel::High,
            LoadLabel::High,
            LoadLabel::Medium,
            LoadLabel::VeryHigh,
        ]);
        let (prior, history) = engine_prior(&payload);
        assert!(history.iter().any(|s| s.step == "consecutive_load_penalty"));
        assert!(prior.get(State::NonFunctionalOverreaching) > 0.40);
    }

    #[test]
    fn test_long_streak_outweighs_short() {
        let eight_high = vec![LoadLabel::High; 8];
        assert_eq!(streak_shift(&eight_high), Some(LONG_STREAK_SHIFT));

        let four_high = vec![LoadLabel::High; 4];
        assert_eq!(streak_shift(&four_high), Some(SHORT_STREAK_SHIFT));

        let easy = vec![LoadLabel::Low; 8];
        assert_eq!(streak_shift(&easy), None);
    }

    #[test]
    fn test_acwr_requires_seven_entries() {
        // A taper that would earn a reward, but one day short of the minimum.
        let mut au = vec![500.0; 4];
        au.extend(vec![100.0; 2]);
        assert!(acwr_adjustment(&au).is_none());
    }

    #[test]
    fn test_acwr_neutral_band_no_change() {
        // Flat loading: A7 == C28, ratio 1.0.
        assert!(acwr_adjustment(&[400.0; 28]).is_none());
    }

    #[test]
    fn test_acwr_reward_after_taper() {
        // 28 hard days then a 7-day taper.
        let mut au = vec![500.0; 28];
        au.extend(vec![200.0; 7]);
        let fraction = match acwr_adjustment(&au) {
            Some(AcwrAdjustment::Reward(f)) => f,
            _ => panic!("expected reward"),
        };
        // R = 200 / 425 <= 0.8, low band, no reward multiplier.
        assert!((fraction - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_acwr_penalty_on_spike() {
        // Three weeks moderate then a heavy week: R = 500/387.5 = 1.29.
        let mut au = vec![350.0; 21];
        au.extend(vec![500.0; 7]);
        let fraction = match acwr_adjustment(&au) {
            Some(AcwrAdjustment::Penalty(f)) => f,
            _ => panic!("expected penalty"),
        };
        // base 0.02, low band multiplier 1.5, A3/C28 = 1.29 < 1.30.
        assert!((fraction - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_acwr_penalty_spike_surcharge() {
        // Sharp 3-day spike on top of a heavy week.
        let mut au = vec![300.0; 25];
        au.extend(vec![600.0; 3]);
        let fraction = match acwr_adjustment(&au) {
            Some(AcwrAdjustment::Penalty(f)) => f,
            _ => panic!("expected penalty"),
        };
        // C28 ~ 332, A7 ~ 428 -> R ~ 1.29 -> base 0.02; low band x1.5;
        // A3/C28 ~ 1.81 >= 1.30 -> +0.01.
        assert!((fraction - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_yesterday_journal_lowers_prior() {
        let mut payload = minimal_payload();
        let (clean, _) = engine_prior(&payload);

        let mut journal = Journal::default();
        journal.alcohol_consumed = Some(true);
        payload.yesterday_journal = Some(journal);
        let (with_alcohol, history) = engine_prior(&payload);

        assert!(history.iter().any(|s| s.step == "journal:alcohol_consumed"));
        assert!(with_alcohol.score() < clean.score());
    }

    #[test]
    fn test_unlisted_journal_keys_ignored() {
        let mut payload = minimal_payload();
        let mut journal = Journal::default();
        journal
            .extra
            .insert("went_bowling".to_string(), serde_json::json!(true));
        payload.yesterday_journal = Some(journal);
        let (_, history) = engine_prior(&payload);
        assert!(!history.iter().any(|s| s.step.starts_with("journal:")));
    }
}
