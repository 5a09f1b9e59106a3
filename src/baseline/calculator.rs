//! Baseline computation
//!
//! Robust statistics over 15-30 days of sleep and HRV history: IQR outlier
//! filtering followed by a 20% trimmed mean, with a default-profile cold
//! start below the minimum record counts and fixed cohort means as the
//! last-resort fallback. The calculator never fails hard.

use crate::baseline::{Baseline, BaselineSource, BASELINE_FORMAT_VERSION, MIN_HRV_SD_MS};
use crate::types::{HrvRecord, HrvType, SleepRecord, SleepType, UserProfile};
use chrono::NaiveDate;

/// Minimum history for the personal path.
pub const MIN_SLEEP_RECORDS: usize = 15;
pub const MIN_HRV_RECORDS: usize = 10;

/// Minimum surviving values after outlier filtering for a field to be
/// computed from data rather than kept at its default.
const MIN_FILTERED_VALUES: usize = 10;

/// Physiological plausibility ranges; values outside are excluded from
/// baseline computation (they may still be mapped for the current day).
const SLEEP_HOURS_RANGE: (f64, f64) = (3.0, 12.0);
const RMSSD_RANGE: (f64, f64) = (5.0, 200.0);
const EFFICIENCY_RANGE: (f64, f64) = (0.3, 1.0);

/// Fixed cohort means for the fallback baseline.
pub const COHORT_SLEEP_HOURS: f64 = 7.5;
pub const COHORT_SLEEP_EFFICIENCY: f64 = 0.85;
pub const COHORT_RESTORATIVE_RATIO: f64 = 0.30;
pub const COHORT_HRV_RMSSD: f64 = 40.0;
pub const COHORT_HRV_SD: f64 = 8.0;

/// Quality floor below which a computed baseline is classified as fallback.
const FALLBACK_QUALITY_FLOOR: f64 = 0.3;

/// Computes per-user baselines from historical records.
pub struct BaselineCalculator;

impl BaselineCalculator {
    /// Compute a baseline. With insufficient history this returns the
    /// default-profile baseline; on internal inconsistency it degrades to
    /// cohort fallback values, never an error.
    pub fn compute(
        sleep_records: &[SleepRecord],
        hrv_records: &[HrvRecord],
        profile: Option<&UserProfile>,
    ) -> Baseline {
        let profile = profile.copied().unwrap_or_default();

        if sleep_records.len() < MIN_SLEEP_RECORDS || hrv_records.len() < MIN_HRV_RECORDS {
            tracing::debug!(
                sleep_n = sleep_records.len(),
                hrv_n = hrv_records.len(),
                "insufficient history, using default-profile baseline"
            );
            return Self::default_baseline(&profile, sleep_records.len(), hrv_records.len());
        }

        let mut baseline = Self::default_baseline(&profile, sleep_records.len(), hrv_records.len());
        let mut any_personal = false;

        // Sleep duration.
        let durations: Vec<f64> = sleep_records
            .iter()
            .map(|r| r.duration_hours)
            .filter(|h| (SLEEP_HOURS_RANGE.0..=SLEEP_HOURS_RANGE.1).contains(h))
            .collect();
        if let Some(mean) = robust_mean(&durations) {
            baseline.sleep_hours_mean = mean;
            any_personal = true;
        }

        // Sleep efficiency.
        let efficiencies: Vec<f64> = sleep_records
            .iter()
            .filter_map(|r| r.efficiency)
            .filter(|e| (EFFICIENCY_RANGE.0..=EFFICIENCY_RANGE.1).contains(e))
            .collect();
        if let Some(mean) = robust_mean(&efficiencies) {
            baseline.sleep_efficiency_mean = mean;
        }

        // Restorative ratio.
        let ratios: Vec<f64> = sleep_records
            .iter()
            .filter_map(|r| r.restorative_ratio)
            .filter(|r| (0.0..=1.0).contains(r))
            .collect();
        if let Some(mean) = robust_mean(&ratios) {
            baseline.restorative_ratio_mean = mean;
        }

        // HRV mean and sd from the same filtered, trimmed set.
        let rmssd: Vec<f64> = hrv_records
            .iter()
            .map(|r| r.rmssd_ms)
            .filter(|v| (RMSSD_RANGE.0..=RMSSD_RANGE.1).contains(v))
            .collect();
        let filtered = iqr_filter(&rmssd);
        if filtered.len() >= MIN_FILTERED_VALUES {
            let trimmed = trimmed_values(&filtered, 0.10);
            if let Some(mean) = mean_of(&trimmed) {
                baseline.hrv_rmssd_mean = mean;
                baseline.hrv_rmssd_sd = sample_sd(&trimmed, mean).max(MIN_HRV_SD_MS);
                any_personal = true;
            }
        }

        if any_personal {
            baseline.source = BaselineSource::Personal;
        }

        baseline.data_quality = data_quality(
            sleep_records.len(),
            restorative_completeness(sleep_records),
            date_uniformity(sleep_records),
            any_personal,
        );
        if baseline.data_quality < FALLBACK_QUALITY_FLOOR {
            baseline.source = BaselineSource::Fallback;
        }

        baseline.enforce_invariants();
        baseline
    }

    /// Cold-start baseline from the two-question profile.
    pub fn default_baseline(profile: &UserProfile, sleep_n: usize, hrv_n: usize) -> Baseline {
        let sleep_hours = match profile.sleep_type {
            SleepType::ShortSleeper => 6.5,
            SleepType::NormalSleeper => 7.5,
            SleepType::LongSleeper => 8.5,
        };
        let (hrv_mean, hrv_sd) = match profile.hrv_type {
            HrvType::HighHrv => (55.0, 10.0),
            HrvType::NormalHrv => (40.0, 8.0),
            HrvType::LowHrv => (28.0, 6.0),
        };
        Baseline {
            format_version: BASELINE_FORMAT_VERSION,
            sleep_hours_mean: sleep_hours,
            sleep_efficiency_mean: COHORT_SLEEP_EFFICIENCY,
            restorative_ratio_mean: COHORT_RESTORATIVE_RATIO,
            hrv_rmssd_mean: hrv_mean,
            hrv_rmssd_sd: hrv_sd,
            data_quality: 0.2,
            source: BaselineSource::Default,
            sleep_sample_count: sleep_n,
            hrv_sample_count: hrv_n,
            last_incremental_at: None,
            last_full_at: None,
        }
    }

    /// Last-resort baseline of fixed cohort means.
    pub fn fallback_baseline(sleep_n: usize, hrv_n: usize) -> Baseline {
        Baseline {
            format_version: BASELINE_FORMAT_VERSION,
            sleep_hours_mean: COHORT_SLEEP_HOURS,
            sleep_efficiency_mean: COHORT_SLEEP_EFFICIENCY,
            restorative_ratio_mean: COHORT_RESTORATIVE_RATIO,
            hrv_rmssd_mean: COHORT_HRV_RMSSD,
            hrv_rmssd_sd: COHORT_HRV_SD,
            data_quality: 0.0,
            source: BaselineSource::Fallback,
            sleep_sample_count: sleep_n,
            hrv_sample_count: hrv_n,
            last_incremental_at: None,
            last_full_at: None,
        }
    }
}

/// IQR filter then 20% trimmed mean; None when too few values survive.
fn robust_mean(values: &[f64]) -> Option<f64> {
    let filtered = iqr_filter(values);
    if filtered.len() < MIN_FILTERED_VALUES {
        return None;
    }
    mean_of(&trimmed_values(&filtered, 0.10))
}

/// Keep values within [Q1 - 1.5*IQR, Q3 + 1.5*IQR].
fn iqr_filter(values: &[f64]) -> Vec<f64> {
    if values.len() < 4 {
        return values.to_vec();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = percentile(&sorted, 0.25);
    let q3 = percentile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lo = q1 - 1.5 * iqr;
    let hi = q3 + 1.5 * iqr;
    values
        .iter()
        .copied()
        .filter(|v| (lo..=hi).contains(v))
        .collect()
}

/// Linear-interpolation percentile over a pre-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Drop `trim` of the values from each tail (by rank).
fn trimmed_values(values: &[f64], trim: f64) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let drop = (sorted.len() as f64 * trim).floor() as usize;
    if sorted.len() <= 2 * drop {
        return sorted;
    }
    sorted[drop..sorted.len() - drop].to_vec()
}

fn mean_of(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation around a known mean.
fn sample_sd(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Composite quality score in [0, 1].
fn data_quality(sleep_n: usize, restorative: f64, uniformity: f64, success: bool) -> f64 {
    let volume = (sleep_n as f64 / 30.0).min(1.0);
    let success = if success { 1.0 } else { 0.0 };
    0.4 * volume + 0.3 * restorative + 0.2 * uniformity + 0.1 * success
}

/// Fraction of sleep records carrying restorative data.
fn restorative_completeness(records: &[SleepRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let with = records.iter().filter(|r| r.restorative_ratio.is_some()).count();
    with as f64 / records.len() as f64
}

/// Distinct record days over the covered span: 1.0 means one record per day.
fn date_uniformity(records: &[SleepRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let mut dates: Vec<NaiveDate> = records.iter().map(|r| r.date).collect();
    dates.sort();
    dates.dedup();
    let span = (dates[dates.len() - 1] - dates[0]).num_days();
    (dates.len() as f64 / (span + 1) as f64).min(1.0)
}
