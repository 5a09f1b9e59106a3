//! Reference probability tables
//!
//! Transition matrix, training-load CPT, emission CPTs, short-term journal
//! CPTs, evidence weights and the label/AU maps. Tables are backed by arrays
//! indexed by `(category_idx, state_idx)` with companion category-name
//! tables, so unknown categories are caught at lookup time instead of
//! producing silent partial updates.

use crate::error::EngineError;
use crate::types::{LoadLabel, STATE_COUNT};
use std::collections::BTreeMap;

/// Likelihood row over the six states, in canonical state order.
pub type LikelihoodRow = [f64; STATE_COUNT];

/// A conditional probability table for one evidence variable:
/// category -> likelihood over states. Rows may be unnormalized weights.
#[derive(Debug, Clone)]
pub struct Cpt {
    categories: &'static [&'static str],
    rows: Vec<LikelihoodRow>,
}

impl Cpt {
    fn new(categories: &'static [&'static str], rows: Vec<LikelihoodRow>) -> Self {
        debug_assert_eq!(categories.len(), rows.len());
        Cpt { categories, rows }
    }

    pub fn categories(&self) -> &'static [&'static str] {
        self.categories
    }

    /// Row for `category`, or an error naming the bad lookup.
    pub fn likelihood(&self, variable: &str, category: &str) -> Result<&LikelihoodRow, EngineError> {
        self.categories
            .iter()
            .position(|c| *c == category)
            .map(|i| &self.rows[i])
            .ok_or_else(|| EngineError::UnknownCategory {
                variable: variable.to_string(),
                category: category.to_string(),
            })
    }

}

/// Evidence variable names in the canonical fusion order.
///
/// The order is fixed so update histories and test oracles are stable even
/// though the updates commute up to normalization.
pub const EVIDENCE_ORDER: [&str; 12] = [
    "hrv_trend",
    "restorative_sleep",
    "sleep_performance",
    "subjective_fatigue",
    "subjective_stress",
    "muscle_soreness",
    "subjective_sleep",
    "nutrition",
    "gi_symptoms",
    "is_sick",
    "is_injured",
    "menstrual_cycle",
];

/// Whitelisted short-term journal keys applied to the prior from yesterday.
pub const SHORT_TERM_JOURNAL_KEYS: [&str; 4] = [
    "alcohol_consumed",
    "late_caffeine",
    "screen_before_bed",
    "late_meal",
];

/// Baseline yesterday->today transition matrix, un-normalized weights.
/// Rows are normalized on load.
const TRANSITION_WEIGHTS: [[f64; STATE_COUNT]; STATE_COUNT] = [
    // from Peak
    [0.80, 0.10, 0.05, 1e-6, 1e-6, 1e-6],
    // from Well-adapted
    [0.60, 0.35, 0.05, 1e-6, 1e-6, 1e-6],
    // from FOR
    [0.05, 0.40, 0.30, 0.10, 0.10, 0.05],
    // from Acute Fatigue
    [0.20, 0.70, 0.10, 1e-6, 1e-6, 1e-6],
    // from NFOR
    [0.01, 0.05, 0.10, 0.05, 0.70, 0.09],
    // from OTS
    [0.01, 0.04, 0.10, 0.05, 0.30, 0.50],
];

/// Canonical label -> AU map (typical session equivalents).
pub fn label_to_au(label: LoadLabel) -> f64 {
    match label {
        LoadLabel::Rest => 0.0,
        LoadLabel::Low => 200.0,
        LoadLabel::Medium => 350.0,
        LoadLabel::High => 500.0,
        LoadLabel::VeryHigh => 700.0,
    }
}

/// Bucket an AU value back onto a label, splitting at the midpoints of the
/// canonical map.
pub fn au_to_label(au: f64) -> LoadLabel {
    if au < 100.0 {
        LoadLabel::Rest
    } else if au < 275.0 {
        LoadLabel::Low
    } else if au < 425.0 {
        LoadLabel::Medium
    } else if au < 600.0 {
        LoadLabel::High
    } else {
        LoadLabel::VeryHigh
    }
}

/// Process-wide immutable table set. Built once at engine construction and
/// shared read-only between requests.
#[derive(Debug, Clone)]
pub struct CptLibrary {
    transition: [[f64; STATE_COUNT]; STATE_COUNT],
    training_load: Cpt,
    emissions: BTreeMap<&'static str, Cpt>,
    weights: BTreeMap<&'static str, f64>,
    journal: BTreeMap<&'static str, (LikelihoodRow, f64)>,
    interaction: Cpt,
}

impl Default for CptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl CptLibrary {
    pub fn new() -> Self {
        let mut transition = TRANSITION_WEIGHTS;
        for row in &mut transition {
            let sum: f64 = row.iter().sum();
            for cell in row.iter_mut() {
                *cell /= sum;
            }
        }

        let training_load = Cpt::new(
            &["rest", "low", "medium", "high", "very_high"],
            vec![
                [0.30, 0.60, 0.05, 0.03, 0.02, 0.0],
                [0.20, 0.70, 0.05, 0.04, 0.01, 0.0],
                [0.10, 0.60, 0.20, 0.08, 0.02, 0.0],
                [0.05, 0.15, 0.50, 0.25, 0.05, 0.0],
                [0.01, 0.05, 0.40, 0.50, 0.04, 0.0],
            ],
        );

        let mut emissions = BTreeMap::new();
        emissions.insert(
            "sleep_performance",
            Cpt::new(
                &["good", "medium", "poor"],
                vec![
                    [0.28, 0.32, 0.19, 0.14, 0.10, 0.06],
                    [0.14, 0.18, 0.22, 0.21, 0.19, 0.16],
                    [0.05, 0.10, 0.25, 0.30, 0.35, 0.40],
                ],
            ),
        );
        emissions.insert(
            "restorative_sleep",
            Cpt::new(
                &["high", "medium", "low"],
                vec![
                    [0.26, 0.31, 0.20, 0.15, 0.11, 0.07],
                    [0.15, 0.19, 0.22, 0.21, 0.19, 0.16],
                    [0.08, 0.14, 0.26, 0.30, 0.33, 0.34],
                ],
            ),
        );
        emissions.insert(
            "hrv_trend",
            Cpt::new(
                &["rising", "stable", "slight_decline", "significant_decline"],
                vec![
                    [0.36, 0.32, 0.18, 0.12, 0.07, 0.04],
                    [0.16, 0.20, 0.21, 0.20, 0.18, 0.16],
                    [0.08, 0.18, 0.28, 0.30, 0.26, 0.18],
                    [0.02, 0.07, 0.22, 0.35, 0.36, 0.34],
                ],
            ),
        );
        let hooper_rows = vec![
            [0.26, 0.30, 0.20, 0.15, 0.11, 0.08],
            [0.10, 0.14, 0.22, 0.21, 0.20, 0.19],
            [0.05, 0.10, 0.30, 0.38, 0.31, 0.26],
        ];
        for var in [
            "subjective_fatigue",
            "subjective_stress",
            "muscle_soreness",
            "subjective_sleep",
        ] {
            emissions.insert(
                var,
                Cpt::new(&["low", "medium", "high"], hooper_rows.clone()),
            );
        }
        emissions.insert(
            "is_sick",
            Cpt::new(
                &["true"],
                vec![[1e-6, 1e-6, 0.03, 0.17, 0.44, 0.36]],
            ),
        );
        emissions.insert(
            "is_injured",
            Cpt::new(
                &["true"],
                vec![[0.02, 0.08, 0.25, 0.35, 0.20, 0.10]],
            ),
        );
        emissions.insert(
            "nutrition",
            Cpt::new(
                &["poor"],
                vec![[0.12, 0.17, 0.23, 0.23, 0.20, 0.17]],
            ),
        );
        emissions.insert(
            "gi_symptoms",
            Cpt::new(
                &["present"],
                vec![[0.10, 0.15, 0.24, 0.25, 0.21, 0.18]],
            ),
        );

        let mut weights = BTreeMap::new();
        weights.insert("hrv_trend", 1.00);
        weights.insert("restorative_sleep", 0.95);
        weights.insert("sleep_performance", 0.90);
        weights.insert("subjective_fatigue", 0.75);
        weights.insert("subjective_stress", 0.70);
        weights.insert("muscle_soreness", 0.65);
        weights.insert("subjective_sleep", 0.60);
        weights.insert("nutrition", 0.60);
        weights.insert("gi_symptoms", 0.50);
        weights.insert("is_sick", 1.00);
        weights.insert("is_injured", 0.80);
        weights.insert("menstrual_cycle", 0.80);

        let mut journal = BTreeMap::new();
        journal.insert(
            "alcohol_consumed",
            ([0.08, 0.14, 0.22, 0.26, 0.24, 0.20], 0.9),
        );
        journal.insert(
            "late_caffeine",
            ([0.12, 0.18, 0.23, 0.23, 0.20, 0.17], 0.7),
        );
        journal.insert(
            "screen_before_bed",
            ([0.14, 0.19, 0.22, 0.22, 0.19, 0.16], 0.5),
        );
        journal.insert("late_meal", ([0.15, 0.20, 0.22, 0.22, 0.19, 0.15], 0.5));

        // Soreness x stress synergy; cells are multiplicative factors, all-ones
        // rows are no-ops.
        let interaction = Cpt::new(
            &[
                "low_low",
                "low_medium",
                "low_high",
                "medium_low",
                "medium_medium",
                "medium_high",
                "high_low",
                "high_medium",
                "high_high",
            ],
            vec![
                [1.15, 1.10, 0.95, 0.90, 0.85, 0.80],
                [1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
                [0.95, 0.95, 1.0, 1.05, 1.05, 1.05],
                [1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
                [1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
                [0.90, 0.95, 1.05, 1.05, 1.10, 1.10],
                [0.95, 0.95, 1.0, 1.05, 1.05, 1.05],
                [0.90, 0.95, 1.05, 1.05, 1.10, 1.10],
                [0.70, 0.80, 1.10, 1.20, 1.30, 1.30],
            ],
        );

        CptLibrary {
            transition,
            training_load,
            emissions,
            weights,
            journal,
            interaction,
        }
    }

    /// Row-normalized transition matrix, indexed `[from][to]`.
    pub fn transition(&self) -> &[[f64; STATE_COUNT]; STATE_COUNT] {
        &self.transition
    }

    /// Training-load likelihood for a label.
    pub fn training_load_likelihood(&self, label: LoadLabel) -> &LikelihoodRow {
        // Rows are laid out in label order, so the closed enum indexes directly.
        let idx = match label {
            LoadLabel::Rest => 0,
            LoadLabel::Low => 1,
            LoadLabel::Medium => 2,
            LoadLabel::High => 3,
            LoadLabel::VeryHigh => 4,
        };
        &self.training_load.rows[idx]
    }

    /// Emission table for an evidence variable.
    pub fn emission(&self, variable: &str) -> Result<&Cpt, EngineError> {
        self.emissions
            .get(variable)
            .ok_or_else(|| EngineError::UnknownEvidenceVariable(variable.to_string()))
    }

    /// All emission variables known to the library.
    pub fn emission_variables(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.emissions.keys().copied()
    }

    /// Fusion weight for an evidence variable (1.0 when unregistered).
    pub fn weight(&self, variable: &str) -> f64 {
        self.weights.get(variable).copied().unwrap_or(1.0)
    }

    /// Short-term journal CPT and weight for a whitelisted key.
    pub fn journal_effect(&self, key: &str) -> Option<(&LikelihoodRow, f64)> {
        self.journal.get(key).map(|(row, w)| (row, *w))
    }

    /// Soreness x stress interaction factor row.
    pub fn interaction_row(
        &self,
        soreness: &str,
        stress: &str,
    ) -> Result<&LikelihoodRow, EngineError> {
        let key = format!("{soreness}_{stress}");
        self.interaction.likelihood("soreness_x_stress", &key)
    }
}

/// Anchor rows blended by the continuous cycle likelihood.
pub const CYCLE_GOOD_ANCHOR: LikelihoodRow = [0.30, 0.33, 0.18, 0.12, 0.08, 0.05];
pub const CYCLE_POOR_ANCHOR: LikelihoodRow = [0.08, 0.14, 0.24, 0.27, 0.24, 0.20];

/// Wellness profile knots over normalized cycle position: peak
/// mid-follicular, trough late-luteal.
pub const CYCLE_PROFILE_KNOTS: [(f64, f64); 6] = [
    (0.00, 0.60),
    (0.25, 1.00),
    (0.50, 0.70),
    (0.75, 0.35),
    (0.90, 0.15),
    (1.00, 0.60),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::State;

    #[test]
    fn test_transition_rows_normalized() {
        let lib = CptLibrary::new();
        for row in lib.transition() {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_training_load_covers_all_labels() {
        let lib = CptLibrary::new();
        for label in [
            LoadLabel::Rest,
            LoadLabel::Low,
            LoadLabel::Medium,
            LoadLabel::High,
            LoadLabel::VeryHigh,
        ] {
            let row = lib.training_load_likelihood(label);
            assert!(row.iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn test_every_fusion_variable_has_table_and_weight() {
        let lib = CptLibrary::new();
        for var in EVIDENCE_ORDER {
            if var == "menstrual_cycle" {
                // Continuous likelihood, no discrete table.
                assert!(lib.weight(var) > 0.0);
                continue;
            }
            assert!(lib.emission(var).is_ok(), "missing table for {var}");
            assert!(lib.weight(var) > 0.0);
        }
    }

    #[test]
    fn test_unknown_category_is_an_error() {
        let lib = CptLibrary::new();
        let cpt = lib.emission("hrv_trend").unwrap();
        assert!(cpt.likelihood("hrv_trend", "plummeting").is_err());
    }

    #[test]
    fn test_bad_categories_weight_fatigue_states() {
        let lib = CptLibrary::new();
        for (var, bad) in [
            ("sleep_performance", "poor"),
            ("restorative_sleep", "low"),
            ("hrv_trend", "significant_decline"),
            ("subjective_fatigue", "high"),
        ] {
            let row = lib.emission(var).unwrap().likelihood(var, bad).unwrap();
            let good_mass = row[State::Peak.index()] + row[State::WellAdapted.index()];
            let bad_mass: f64 = row[2..].iter().sum();
            assert!(bad_mass > good_mass, "{var}/{bad} should load fatigue states");
            assert!(row[State::Peak.index()] <= 0.10);
        }
    }

    #[test]
    fn test_sick_row_collapses_healthy_states() {
        let lib = CptLibrary::new();
        let row = lib
            .emission("is_sick")
            .unwrap()
            .likelihood("is_sick", "true")
            .unwrap();
        assert!(row[State::Peak.index()] <= 1e-6);
        assert!(row[State::WellAdapted.index()] <= 1e-6);
    }

    #[test]
    fn test_au_label_round_trip_buckets() {
        for label in [
            LoadLabel::Rest,
            LoadLabel::Low,
            LoadLabel::Medium,
            LoadLabel::High,
            LoadLabel::VeryHigh,
        ] {
            assert_eq!(au_to_label(label_to_au(label)), label);
        }
        assert_eq!(au_to_label(480.0), LoadLabel::High);
        assert_eq!(au_to_label(60.0), LoadLabel::Rest);
    }

    #[test]
    fn test_neutral_interaction_cells_are_identity() {
        let lib = CptLibrary::new();
        let row = lib.interaction_row("medium", "medium").unwrap();
        assert!(row.iter().all(|f| (*f - 1.0).abs() < 1e-12));
    }
}
