//! Prometheus metrics for the convergence loop
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `convergd_cycles_total` (counter): completed convergence cycles.
//! - `convergd_observation_failures_total` (counter): cycles aborted because
//!   no node could be observed.
//! - `convergd_changes_total` (counter): applied changes labeled by change
//!   kind and outcome.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use super::executor::{ChangeOutcome, Outcome};

/// Labels for per-change counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChangeLabels {
    /// Change kind, e.g. "move_dataset"
    pub kind: String,
    /// "succeeded", "failed" or "skipped"
    pub outcome: String,
}

pub static CYCLES_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static OBSERVATION_FAILURES_TOTAL: Lazy<Counter<u64, AtomicU64>> =
    Lazy::new(Counter::default);

pub static CHANGES_TOTAL: Lazy<Family<ChangeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// The registry encoded at `/metrics`
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "convergd_cycles",
        "Completed convergence cycles",
        CYCLES_TOTAL.clone(),
    );
    registry.register(
        "convergd_observation_failures",
        "Cycles aborted because no node could be observed",
        OBSERVATION_FAILURES_TOTAL.clone(),
    );
    registry.register(
        "convergd_changes",
        "Applied changes by kind and outcome",
        CHANGES_TOTAL.clone(),
    );
    registry
});

pub fn record_change(outcome: &ChangeOutcome) {
    let labels = ChangeLabels {
        kind: outcome.change.kind().to_string(),
        outcome: match outcome.outcome {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed(_) => "failed",
            Outcome::Skipped(_) => "skipped",
        }
        .to_string(),
    };
    CHANGES_TOTAL.get_or_create(&labels).inc();
}
