//! Readiness Core - Bayesian readiness inference engine
//!
//! Readiness Core fuses wearable biometrics, training-load history and
//! subjective questionnaires into a daily 0-100 readiness score and a
//! six-state diagnosis through a deterministic pipeline: evidence mapping
//! (with personal baselines) → prior assembly → weighted evidence fusion →
//! score and next-day seed.

pub mod baseline;
pub mod consumption;
pub mod error;
pub mod mapping;
pub mod personalization;
pub mod pipeline;
pub mod posterior;
pub mod prior;
pub mod tables;
pub mod types;

pub use error::EngineError;
pub use pipeline::ReadinessEngine;
pub use types::{DailyPayload, DailyResult, State, StateDistribution};

/// Engine version embedded in result payloads and CLI output.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for result payloads.
pub const PRODUCER_NAME: &str = "readiness-core";
