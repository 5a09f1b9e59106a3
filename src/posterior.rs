//! Evidence fusion
//!
//! Multiplies today's evidence into the prior as weighted likelihoods,
//! normalizing after each update: P(S|E) ∝ P(S) · L(E|S)^w. Updates commute
//! up to normalization but run in the fixed canonical order of
//! [`EVIDENCE_ORDER`] so update histories and test oracles are stable.

use crate::mapping::EvidenceMap;
use crate::personalization::PersonalizedCpt;
use crate::tables::{
    CptLibrary, LikelihoodRow, CYCLE_GOOD_ANCHOR, CYCLE_POOR_ANCHOR, CYCLE_PROFILE_KNOTS,
    EVIDENCE_ORDER,
};
use crate::types::{CycleInfo, StateDistribution, UpdateStep, STATE_COUNT};

/// Fuses mapped evidence into the prior.
pub struct PosteriorEngine<'a> {
    tables: &'a CptLibrary,
    overrides: Option<&'a PersonalizedCpt>,
}

impl<'a> PosteriorEngine<'a> {
    pub fn new(tables: &'a CptLibrary, overrides: Option<&'a PersonalizedCpt>) -> Self {
        PosteriorEngine { tables, overrides }
    }

    /// Apply every present evidence variable in canonical order, then the
    /// soreness x stress interaction when both factors are present.
    pub fn fuse(
        &self,
        prior: &StateDistribution,
        evidence: &EvidenceMap,
        cycle: Option<&CycleInfo>,
        history: &mut Vec<UpdateStep>,
    ) -> StateDistribution {
        let mut posterior = prior.clone();

        for variable in EVIDENCE_ORDER {
            let Some(category) = evidence.get(variable) else {
                continue;
            };
            let weight = self.tables.weight(variable);

            if variable == "menstrual_cycle" {
                let Some(cycle) = cycle else { continue };
                let row = cycle_likelihood(cycle.day, cycle.cycle_length);
                posterior.apply_likelihood(&row, weight);
                push_step(history, &format!("evidence:{variable}={category}"), &posterior);
                continue;
            }

            let row = match self.likelihood_for(variable, category) {
                Some(row) => row,
                None => {
                    // Unmappable category: treat as missing evidence.
                    tracing::warn!(variable, %category, "unknown evidence category, skipping");
                    continue;
                }
            };
            posterior.apply_likelihood(&row, weight);
            push_step(history, &format!("evidence:{variable}={category}"), &posterior);
        }

        if let (Some(soreness), Some(stress)) = (
            evidence.get("muscle_soreness"),
            evidence.get("subjective_stress"),
        ) {
            if let Ok(row) = self.tables.interaction_row(soreness, stress) {
                if !is_identity(row) {
                    posterior.apply_likelihood(row, 1.0);
                    push_step(history, "interaction:soreness_x_stress", &posterior);
                }
            }
        }

        posterior
    }

    /// Personalized row when one exists, otherwise the global default.
    fn likelihood_for(&self, variable: &str, category: &str) -> Option<LikelihoodRow> {
        if let Some(overrides) = self.overrides {
            if let Some(row) = overrides.row(variable, category) {
                return Some(*row);
            }
        }
        self.tables
            .emission(variable)
            .ok()
            .and_then(|cpt| cpt.likelihood(variable, category).ok())
            .copied()
    }
}

/// Continuous cycle likelihood: a wellness profile over normalized cycle
/// position blends between a good and a poor anchor row. Degrades gracefully
/// for any cycle length, not just 28 days.
pub fn cycle_likelihood(day: u32, cycle_length: u32) -> LikelihoodRow {
    let length = cycle_length.max(1);
    let position = ((day - 1) % length) as f64 / length as f64;
    let wellness = cycle_profile(position);
    let mut row = [0.0; STATE_COUNT];
    for i in 0..STATE_COUNT {
        row[i] = wellness * CYCLE_GOOD_ANCHOR[i] + (1.0 - wellness) * CYCLE_POOR_ANCHOR[i];
    }
    row
}

/// Piecewise-smooth wellness profile over [0, 1): cosine interpolation
/// between the knots, peak mid-follicular, trough late-luteal.
fn cycle_profile(position: f64) -> f64 {
    let t = position.clamp(0.0, 1.0);
    let knots = CYCLE_PROFILE_KNOTS;
    for pair in knots.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if t <= x1 {
            let u = if x1 > x0 { (t - x0) / (x1 - x0) } else { 0.0 };
            let eased = (1.0 - (std::f64::consts::PI * u).cos()) / 2.0;
            return y0 + (y1 - y0) * eased;
        }
    }
    knots[knots.len() - 1].1
}

fn is_identity(row: &LikelihoodRow) -> bool {
    row.iter().all(|f| (*f - 1.0).abs() < 1e-12)
}

fn push_step(history: &mut Vec<UpdateStep>, step: &str, dist: &StateDistribution) {
    history.push(UpdateStep {
        step: step.to_string(),
        probs_after: dist.to_map(),
    });
}
