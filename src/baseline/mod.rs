//! Baseline management
//!
//! This module owns the per-user sleep/HRV baseline record, its JSON
//! persistence format, the repository trait the engine reads through, and
//! the `baseline_updated` event channel. Baselines enable relative
//! interpretation of daily signals; without one the mapper falls back to
//! fixed thresholds.

pub mod calculator;
pub mod updater;

pub use calculator::BaselineCalculator;
pub use updater::{BaselineUpdater, UpdatePolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Lowest HRV standard deviation the engine will work with, in ms.
/// Corrupted or degenerate values are floored here.
pub const MIN_HRV_SD_MS: f64 = 5.0;

/// Current baseline blob format version.
pub(crate) const BASELINE_FORMAT_VERSION: u32 = 2;

fn default_format_version() -> u32 {
    1 // V1 blobs predate the version field
}

/// Where a baseline's numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSource {
    /// Computed from the user's own history.
    Personal,
    /// Cold-start values derived from the two-question profile.
    Default,
    /// Fixed cohort means used when computation failed or quality is too low.
    Fallback,
}

/// Per-user baseline record.
///
/// Invariant: `hrv_rmssd_sd >= MIN_HRV_SD_MS`. Mutated only by the updater
/// via whole-record replacement, never in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Format version for backward compatibility.
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub sleep_hours_mean: f64,
    pub sleep_efficiency_mean: f64,
    pub restorative_ratio_mean: f64,
    pub hrv_rmssd_mean: f64,
    pub hrv_rmssd_sd: f64,
    /// Composite data-quality score in [0, 1].
    pub data_quality: f64,
    pub source: BaselineSource,
    pub sleep_sample_count: usize,
    pub hrv_sample_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_incremental_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_full_at: Option<DateTime<Utc>>,
}

impl Baseline {
    /// Load a baseline blob from JSON with version migration.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut baseline: Self = serde_json::from_str(json)?;
        if baseline.format_version < BASELINE_FORMAT_VERSION {
            // V1 blobs carried no updater timestamps; the Option defaults
            // already cover them.
            baseline.format_version = BASELINE_FORMAT_VERSION;
        }
        baseline.enforce_invariants();
        Ok(baseline)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Repair corrupted fields in place, warning per replacement.
    pub fn enforce_invariants(&mut self) {
        if !self.hrv_rmssd_sd.is_finite() || self.hrv_rmssd_sd < MIN_HRV_SD_MS {
            tracing::warn!(
                sd = self.hrv_rmssd_sd,
                "corrupt HRV sd in baseline, flooring at {MIN_HRV_SD_MS} ms"
            );
            self.hrv_rmssd_sd = MIN_HRV_SD_MS;
        }
        if !self.sleep_hours_mean.is_finite() || !(3.0..=12.0).contains(&self.sleep_hours_mean) {
            tracing::warn!(
                hours = self.sleep_hours_mean,
                "corrupt sleep mean in baseline, replacing with cohort default"
            );
            self.sleep_hours_mean = calculator::COHORT_SLEEP_HOURS;
        }
        if !self.sleep_efficiency_mean.is_finite()
            || !(0.3..=1.0).contains(&self.sleep_efficiency_mean)
        {
            self.sleep_efficiency_mean = calculator::COHORT_SLEEP_EFFICIENCY;
        }
        if !self.restorative_ratio_mean.is_finite()
            || !(0.0..=1.0).contains(&self.restorative_ratio_mean)
        {
            self.restorative_ratio_mean = calculator::COHORT_RESTORATIVE_RATIO;
        }
        if !self.hrv_rmssd_mean.is_finite() || self.hrv_rmssd_mean <= 0.0 {
            tracing::warn!(
                rmssd = self.hrv_rmssd_mean,
                "corrupt HRV mean in baseline, replacing with cohort default"
            );
            self.hrv_rmssd_mean = calculator::COHORT_HRV_RMSSD;
        }
        self.data_quality = self.data_quality.clamp(0.0, 1.0);
    }
}

/// A baseline plus its optimistic-concurrency version tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedBaseline {
    pub baseline: Baseline,
    pub version: u64,
}

/// Durable store for per-user baselines.
///
/// `store` performs a compare-and-swap on the version tag: passing
/// `expected_version: None` asserts the record does not exist yet. Readers
/// always observe a whole record, never a partial blend.
pub trait BaselineRepository: Send + Sync {
    fn load(&self, user_id: &str) -> Option<VersionedBaseline>;
    fn store(
        &self,
        user_id: &str,
        baseline: Baseline,
        expected_version: Option<u64>,
    ) -> Result<u64, VersionConflict>;
    fn delete(&self, user_id: &str);
}

/// CAS failure: someone else replaced the record first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConflict {
    pub current_version: Option<u64>,
}

/// In-memory repository used by tests and the CLI.
#[derive(Default)]
pub struct InMemoryBaselineRepository {
    records: RwLock<HashMap<String, Arc<VersionedBaseline>>>,
}

impl InMemoryBaselineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BaselineRepository for InMemoryBaselineRepository {
    fn load(&self, user_id: &str) -> Option<VersionedBaseline> {
        self.records
            .read()
            .expect("baseline repository lock poisoned")
            .get(user_id)
            .map(|arc| (**arc).clone())
    }

    fn store(
        &self,
        user_id: &str,
        baseline: Baseline,
        expected_version: Option<u64>,
    ) -> Result<u64, VersionConflict> {
        let mut records = self
            .records
            .write()
            .expect("baseline repository lock poisoned");
        let current = records.get(user_id).map(|v| v.version);
        if current != expected_version {
            return Err(VersionConflict {
                current_version: current,
            });
        }
        let next = expected_version.map_or(1, |v| v + 1);
        records.insert(
            user_id.to_string(),
            Arc::new(VersionedBaseline {
                baseline,
                version: next,
            }),
        );
        Ok(next)
    }

    fn delete(&self, user_id: &str) {
        self.records
            .write()
            .expect("baseline repository lock poisoned")
            .remove(user_id);
    }
}

/// Event published after every baseline refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineUpdated {
    pub event_id: Uuid,
    pub user_id: String,
    pub baseline: Baseline,
    pub prior_source: Option<BaselineSource>,
    pub new_source: BaselineSource,
    pub ts: DateTime<Utc>,
}

/// Fire-and-forget channel for baseline updates. Consumers (notably the
/// personalized-CPT refresher) re-derive dependent state.
pub trait BaselineEventSink: Send + Sync {
    fn baseline_updated(&self, event: &BaselineUpdated);
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl BaselineEventSink for NullEventSink {
    fn baseline_updated(&self, _event: &BaselineUpdated) {}
}

/// Sink that buffers events for inspection in tests.
#[derive(Default)]
pub struct BufferingEventSink {
    events: RwLock<Vec<BaselineUpdated>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<BaselineUpdated> {
        std::mem::take(&mut *self.events.write().expect("event sink lock poisoned"))
    }
}

impl BaselineEventSink for BufferingEventSink {
    fn baseline_updated(&self, event: &BaselineUpdated) {
        self.events
            .write()
            .expect("event sink lock poisoned")
            .push(event.clone());
    }
}
