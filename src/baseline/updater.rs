//! Baseline refresh policy
//!
//! Chooses between a 7-day incremental blend and a 30-day full recompute,
//! detects default-to-personal upgrade eligibility, and publishes
//! `baseline_updated` events. Writes go through optimistic versioned
//! replacement: read, recompute, store with a version check, retry once on
//! conflict. Readers always see the old or the new record, never a blend.

use crate::baseline::{
    Baseline, BaselineCalculator, BaselineEventSink, BaselineRepository, BaselineSource,
    BaselineUpdated, MIN_HRV_SD_MS,
};
use crate::types::{HrvRecord, SleepRecord, UserProfile};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Days between incremental refreshes.
const INCREMENTAL_INTERVAL_DAYS: i64 = 7;
/// Days between full recomputes.
const FULL_INTERVAL_DAYS: i64 = 30;
/// Quality threshold that forces an early incremental refresh.
const QUALITY_REFRESH_THRESHOLD: f64 = 0.7;
/// Minimum distinct new days for an incremental run.
const MIN_INCREMENTAL_DAYS: usize = 5;
/// Blend weights for the incremental update.
const BLEND_OLD: f64 = 0.7;
const BLEND_NEW: f64 = 0.3;

/// Upgrade thresholds from default to personal.
const UPGRADE_MIN_SLEEP_DAYS: usize = 30;
const UPGRADE_MIN_HRV_SAMPLES: usize = 40;
const UPGRADE_MIN_QUALITY: f64 = 0.7;

/// Refresh decision for one update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    Skip,
    Incremental,
    Full,
}

impl UpdatePolicy {
    /// Smart policy: prefer full when both are due, otherwise incremental,
    /// otherwise skip.
    pub fn decide(baseline: &Baseline, now: DateTime<Utc>) -> UpdatePolicy {
        let full_due = baseline
            .last_full_at
            .map_or(true, |t| now - t >= Duration::days(FULL_INTERVAL_DAYS));
        if full_due {
            return UpdatePolicy::Full;
        }
        let incremental_due = baseline
            .last_incremental_at
            .map_or(true, |t| now - t >= Duration::days(INCREMENTAL_INTERVAL_DAYS))
            || baseline.data_quality < QUALITY_REFRESH_THRESHOLD;
        if incremental_due {
            UpdatePolicy::Incremental
        } else {
            UpdatePolicy::Skip
        }
    }
}

/// Applies the refresh policy against a repository and event sink.
pub struct BaselineUpdater {
    repository: Arc<dyn BaselineRepository>,
    sink: Arc<dyn BaselineEventSink>,
}

impl BaselineUpdater {
    pub fn new(
        repository: Arc<dyn BaselineRepository>,
        sink: Arc<dyn BaselineEventSink>,
    ) -> Self {
        BaselineUpdater { repository, sink }
    }

    /// Load the stored baseline, or compute and persist one from the given
    /// history. Emits no event on the read path.
    pub fn get_or_compute(
        &self,
        user_id: &str,
        sleep_records: &[SleepRecord],
        hrv_records: &[HrvRecord],
        profile: Option<&UserProfile>,
    ) -> Baseline {
        if let Some(stored) = self.repository.load(user_id) {
            return stored.baseline;
        }
        let baseline = BaselineCalculator::compute(sleep_records, hrv_records, profile);
        if self.repository.store(user_id, baseline.clone(), None).is_err() {
            // Another request stored first; use theirs.
            if let Some(stored) = self.repository.load(user_id) {
                return stored.baseline;
            }
        }
        baseline
    }

    /// Run the smart update policy and return the (possibly unchanged)
    /// baseline. Emits `baseline_updated` when a refresh was applied.
    pub fn update(
        &self,
        user_id: &str,
        sleep_records: &[SleepRecord],
        hrv_records: &[HrvRecord],
        profile: Option<&UserProfile>,
        now: DateTime<Utc>,
    ) -> Baseline {
        let stored = self.repository.load(user_id);
        let (current, version) = match &stored {
            Some(v) => (v.baseline.clone(), Some(v.version)),
            None => (
                BaselineCalculator::compute(sleep_records, hrv_records, profile),
                None,
            ),
        };

        let mut policy = UpdatePolicy::decide(&current, now);

        // A default-source user with enough accumulated history is promoted
        // via a full personal recompute regardless of the timers.
        if current.source == BaselineSource::Default
            && upgrade_eligible(sleep_records, hrv_records)
        {
            tracing::debug!(user_id, "default baseline eligible for personal upgrade");
            policy = UpdatePolicy::Full;
        }

        let new_baseline = match policy {
            UpdatePolicy::Skip => {
                tracing::debug!(user_id, "baseline refresh skipped, not due");
                return current;
            }
            UpdatePolicy::Full => {
                let window = cutoff(now, FULL_INTERVAL_DAYS);
                let sleep: Vec<SleepRecord> = sleep_records
                    .iter()
                    .filter(|r| r.date >= window)
                    .cloned()
                    .collect();
                let hrv: Vec<HrvRecord> = hrv_records
                    .iter()
                    .filter(|r| r.date >= window)
                    .cloned()
                    .collect();
                let mut b = BaselineCalculator::compute(&sleep, &hrv, profile);
                b.last_full_at = Some(now);
                b.last_incremental_at = Some(now);
                b
            }
            UpdatePolicy::Incremental => {
                let window = cutoff(now, INCREMENTAL_INTERVAL_DAYS);
                let recent_sleep: Vec<SleepRecord> = sleep_records
                    .iter()
                    .filter(|r| r.date >= window)
                    .cloned()
                    .collect();
                let recent_hrv: Vec<HrvRecord> = hrv_records
                    .iter()
                    .filter(|r| r.date >= window)
                    .cloned()
                    .collect();
                let mut days: Vec<_> = recent_sleep.iter().map(|r| r.date).collect();
                days.sort();
                days.dedup();
                if days.len() < MIN_INCREMENTAL_DAYS {
                    tracing::debug!(
                        user_id,
                        days = days.len(),
                        "incremental refresh skipped, too few new days"
                    );
                    return current;
                }
                blend_incremental(&current, &recent_sleep, &recent_hrv, now)
            }
        };

        self.store_with_retry(user_id, new_baseline.clone(), version);

        let event = BaselineUpdated {
            event_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            baseline: new_baseline.clone(),
            prior_source: stored.as_ref().map(|v| v.baseline.source),
            new_source: new_baseline.source,
            ts: now,
        };
        self.sink.baseline_updated(&event);

        new_baseline
    }

    /// CAS store; on conflict re-read and retry once. Persistence failures
    /// never surface to the caller.
    fn store_with_retry(&self, user_id: &str, baseline: Baseline, version: Option<u64>) {
        if self.repository.store(user_id, baseline.clone(), version).is_ok() {
            return;
        }
        let current = self.repository.load(user_id).map(|v| v.version);
        if self.repository.store(user_id, baseline, current).is_err() {
            tracing::warn!(user_id, "baseline store conflict persisted after retry");
        }
    }
}

fn cutoff(now: DateTime<Utc>, days: i64) -> chrono::NaiveDate {
    (now - Duration::days(days)).date_naive()
}

/// Default-source users earn a personal baseline once enough history exists
/// and the estimated quality clears the bar.
fn upgrade_eligible(sleep_records: &[SleepRecord], hrv_records: &[HrvRecord]) -> bool {
    if sleep_records.len() < UPGRADE_MIN_SLEEP_DAYS || hrv_records.len() < UPGRADE_MIN_HRV_SAMPLES {
        return false;
    }
    let estimated = BaselineCalculator::compute(sleep_records, hrv_records, None);
    estimated.source == BaselineSource::Personal && estimated.data_quality >= UPGRADE_MIN_QUALITY
}

/// 0.7/0.3 blend of the old baseline with values computed from the recent
/// window only.
fn blend_incremental(
    old: &Baseline,
    recent_sleep: &[SleepRecord],
    recent_hrv: &[HrvRecord],
    now: DateTime<Utc>,
) -> Baseline {
    let mut blended = old.clone();

    let hours: Vec<f64> = recent_sleep
        .iter()
        .map(|r| r.duration_hours)
        .filter(|h| (3.0..=12.0).contains(h))
        .collect();
    if let Some(mean) = simple_mean(&hours) {
        blended.sleep_hours_mean = BLEND_OLD * old.sleep_hours_mean + BLEND_NEW * mean;
    }

    let efficiencies: Vec<f64> = recent_sleep
        .iter()
        .filter_map(|r| r.efficiency)
        .filter(|e| (0.3..=1.0).contains(e))
        .collect();
    if let Some(mean) = simple_mean(&efficiencies) {
        blended.sleep_efficiency_mean = BLEND_OLD * old.sleep_efficiency_mean + BLEND_NEW * mean;
    }

    let ratios: Vec<f64> = recent_sleep
        .iter()
        .filter_map(|r| r.restorative_ratio)
        .filter(|r| (0.0..=1.0).contains(r))
        .collect();
    if let Some(mean) = simple_mean(&ratios) {
        blended.restorative_ratio_mean =
            BLEND_OLD * old.restorative_ratio_mean + BLEND_NEW * mean;
    }

    let rmssd: Vec<f64> = recent_hrv
        .iter()
        .map(|r| r.rmssd_ms)
        .filter(|v| (5.0..=200.0).contains(v))
        .collect();
    if let Some(mean) = simple_mean(&rmssd) {
        blended.hrv_rmssd_mean = BLEND_OLD * old.hrv_rmssd_mean + BLEND_NEW * mean;
        let recent_sd = sd_around(&rmssd, mean);
        blended.hrv_rmssd_sd =
            (BLEND_OLD * old.hrv_rmssd_sd + BLEND_NEW * recent_sd).max(MIN_HRV_SD_MS);
    }

    blended.sleep_sample_count = old.sleep_sample_count + recent_sleep.len();
    blended.hrv_sample_count = old.hrv_sample_count + recent_hrv.len();
    blended.last_incremental_at = Some(now);
    blended.enforce_invariants();
    blended
}

fn simple_mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn sd_around(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{BufferingEventSink, InMemoryBaselineRepository};
    use chrono::{NaiveDate, TimeZone};
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 8, 0, 0).unwrap()
    }

    fn recent_day(back: u64) -> NaiveDate {
        now().date_naive() - chrono::Days::new(back)
    }

    fn recent_sleep(days: u64, hours: f64) -> Vec<SleepRecord> {
        (0..days)
            .map(|i| SleepRecord {
                date: recent_day(i),
                duration_hours: hours,
                efficiency: Some(0.90),
                restorative_ratio: Some(0.35),
            })
            .collect()
    }

    fn recent_hrv(days: u64, rmssd: f64) -> Vec<HrvRecord> {
        (0..days)
            .map(|i| HrvRecord {
                date: recent_day(i),
                rmssd_ms: rmssd + (i % 3) as f64,
            })
            .collect()
    }

    fn updater() -> (
        BaselineUpdater,
        Arc<InMemoryBaselineRepository>,
        Arc<BufferingEventSink>,
    ) {
        let repo = Arc::new(InMemoryBaselineRepository::new());
        let sink = Arc::new(BufferingEventSink::new());
        (
            BaselineUpdater::new(repo.clone(), sink.clone()),
            repo,
            sink,
        )
    }

    fn seeded_personal(repo: &InMemoryBaselineRepository, quality: f64) -> Baseline {
        let mut baseline = crate::baseline::tests::sample_baseline();
        baseline.data_quality = quality;
        baseline.last_incremental_at = Some(now() - Duration::days(2));
        baseline.last_full_at = Some(now() - Duration::days(10));
        repo.store("u1", baseline.clone(), None).unwrap();
        baseline
    }

    #[test]
    fn test_policy_full_when_never_computed() {
        let baseline = crate::baseline::tests::sample_baseline();
        assert_eq!(UpdatePolicy::decide(&baseline, now()), UpdatePolicy::Full);
    }

    #[test]
    fn test_policy_prefers_full_when_both_due() {
        let mut baseline = crate::baseline::tests::sample_baseline();
        baseline.last_incremental_at = Some(now() - Duration::days(10));
        baseline.last_full_at = Some(now() - Duration::days(31));
        assert_eq!(UpdatePolicy::decide(&baseline, now()), UpdatePolicy::Full);
    }

    #[test]
    fn test_policy_incremental_on_low_quality() {
        let mut baseline = crate::baseline::tests::sample_baseline();
        baseline.data_quality = 0.5;
        baseline.last_incremental_at = Some(now() - Duration::days(1));
        baseline.last_full_at = Some(now() - Duration::days(5));
        assert_eq!(
            UpdatePolicy::decide(&baseline, now()),
            UpdatePolicy::Incremental
        );
    }

    #[test]
    fn test_policy_skip_when_fresh() {
        let mut baseline = crate::baseline::tests::sample_baseline();
        baseline.last_incremental_at = Some(now() - Duration::days(2));
        baseline.last_full_at = Some(now() - Duration::days(10));
        assert_eq!(UpdatePolicy::decide(&baseline, now()), UpdatePolicy::Skip);
    }

    #[test]
    fn test_incremental_blend_weights() {
        let (updater, repo, sink) = updater();
        let old = {
            let mut b = seeded_personal(&repo, 0.5); // forces incremental
            b.last_incremental_at = Some(now() - Duration::days(8));
            repo.store("u1", b.clone(), Some(1)).unwrap();
            b
        };

        let sleep = recent_sleep(7, 8.0);
        let hrv = recent_hrv(7, 64.0);
        let updated = updater.update("u1", &sleep, &hrv, None, now());

        // 0.7 * 7.5 + 0.3 * 8.0 = 7.65
        assert!((updated.sleep_hours_mean - (0.7 * old.sleep_hours_mean + 0.3 * 8.0)).abs() < 1e-9);
        assert_eq!(updated.last_incremental_at, Some(now()));
        assert_eq!(repo.load("u1").unwrap().baseline, updated);
        assert_eq!(sink.drain().len(), 1);
    }

    #[test]
    fn test_incremental_skipped_below_min_days() {
        let (updater, repo, sink) = updater();
        let mut b = seeded_personal(&repo, 0.5);
        b.last_incremental_at = Some(now() - Duration::days(8));
        repo.store("u1", b.clone(), Some(1)).unwrap();

        let sleep = recent_sleep(3, 8.0);
        let hrv = recent_hrv(3, 64.0);
        let updated = updater.update("u1", &sleep, &hrv, None, now());

        assert_eq!(updated.sleep_hours_mean, b.sleep_hours_mean);
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_full_recompute_marks_both_timestamps() {
        let (updater, _repo, sink) = updater();
        let sleep = recent_sleep(30, 7.2);
        let hrv = recent_hrv(30, 55.0);
        let updated = updater.update("u1", &sleep, &hrv, None, now());

        assert_eq!(updated.last_full_at, Some(now()));
        assert_eq!(updated.last_incremental_at, Some(now()));
        assert_eq!(updated.source, BaselineSource::Personal);
        let events = sink.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_source, BaselineSource::Personal);
    }

    #[test]
    fn test_default_user_upgrades_with_enough_history() {
        let (updater, repo, sink) = updater();
        let mut default_baseline = BaselineCalculator::default_baseline(
            &UserProfile::default(),
            5,
            5,
        );
        // Fresh timers so only the upgrade path can trigger a refresh.
        default_baseline.last_incremental_at = Some(now() - Duration::days(1));
        default_baseline.last_full_at = Some(now() - Duration::days(1));
        repo.store("u1", default_baseline, None).unwrap();

        let sleep = recent_sleep(30, 7.4);
        let hrv = recent_hrv(45, 58.0);
        let updated = updater.update("u1", &sleep, &hrv, None, now());

        assert_eq!(updated.source, BaselineSource::Personal);
        let events = sink.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].prior_source, Some(BaselineSource::Default));
    }

    #[test]
    fn test_get_or_compute_reads_through() {
        let (updater, repo, _sink) = updater();
        let sleep = recent_sleep(30, 7.5);
        let hrv = recent_hrv(30, 58.0);

        let first = updater.get_or_compute("u1", &sleep, &hrv, None);
        assert_eq!(first.source, BaselineSource::Personal);
        assert!(repo.load("u1").is_some());

        // Second call returns the stored record without recomputing.
        let second = updater.get_or_compute("u1", &[], &[], None);
        assert_eq!(second, first);
    }
}
