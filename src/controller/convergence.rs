//! Convergence loop
//!
//! Drives observe → diff → execute on a fixed cadence and on configuration
//! change signals. Exactly one pass is ever in flight; a configuration change
//! arriving mid-pass is coalesced by the store's `Notify` into one additional
//! pass after the current one finishes. An in-flight batch is never
//! cancelled, so backend operations are not left half-applied.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ConfigurationStore;
use crate::error::Result;
use crate::observer::StateObserver;

use super::diff::compute_changes;
use super::executor::{ChangeExecutor, ChangeOutcome, Outcome};

/// Loop state, visible for logging and the health surface
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Observing,
    Diffing,
    Executing,
    Backoff,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Observing => write!(f, "observing"),
            Phase::Diffing => write!(f, "diffing"),
            Phase::Executing => write!(f, "executing"),
            Phase::Backoff => write!(f, "backoff"),
        }
    }
}

/// Tally of one executed batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CycleReport {
    pub fn tally(outcomes: &[ChangeOutcome]) -> Self {
        let mut report = CycleReport::default();
        for outcome in outcomes {
            match outcome.outcome {
                Outcome::Succeeded => report.succeeded += 1,
                Outcome::Failed(_) => report.failed += 1,
                Outcome::Skipped(_) => report.skipped += 1,
            }
        }
        report
    }
}

pub struct ConvergenceLoop {
    store: Arc<ConfigurationStore>,
    observer: Arc<StateObserver>,
    executor: ChangeExecutor,
    poll_interval: Duration,
    phase: RwLock<Phase>,
}

impl ConvergenceLoop {
    pub fn new(
        store: Arc<ConfigurationStore>,
        observer: Arc<StateObserver>,
        executor: ChangeExecutor,
        poll_interval: Duration,
    ) -> Self {
        ConvergenceLoop {
            store,
            observer,
            executor,
            poll_interval,
            phase: RwLock::new(Phase::Idle),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read().expect("phase lock poisoned")
    }

    fn enter(&self, phase: Phase) {
        debug!(%phase, "convergence loop phase");
        *self.phase.write().expect("phase lock poisoned") = phase;
    }

    /// One full convergence pass: observe, diff, execute
    ///
    /// Returns the per-change outcomes of the executed batch; an empty vec
    /// means the cluster already matched the configuration. Errors only on
    /// total observation failure.
    pub async fn run_once(&self) -> Result<Vec<ChangeOutcome>> {
        let desired = self.store.current();

        // Observation scope: the configured nodes plus every node the
        // previous snapshot covered or missed. A node dropped from the
        // configuration keeps being observed, so volumes stranded on it are
        // still found and deleted.
        let mut nodes = desired.node_set();
        let previous = self.observer.current();
        nodes.extend(previous.nodes.keys().copied());
        nodes.extend(previous.unreachable.iter().copied());

        self.enter(Phase::Observing);
        let snapshot = match self.observer.observe(&nodes).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.enter(Phase::Backoff);
                #[cfg(feature = "metrics")]
                super::metrics::OBSERVATION_FAILURES_TOTAL.inc();
                return Err(e);
            }
        };

        self.enter(Phase::Diffing);
        let changes = compute_changes(&snapshot, &desired);
        #[cfg(feature = "metrics")]
        super::metrics::CYCLES_TOTAL.inc();

        if changes.is_empty() {
            debug!(version = desired.version, "cluster converged, nothing to do");
            self.enter(Phase::Idle);
            return Ok(Vec::new());
        }

        self.enter(Phase::Executing);
        info!(
            changes = changes.len(),
            version = desired.version,
            "executing convergence batch"
        );
        let outcomes = self.executor.apply(changes).await;

        let report = CycleReport::tally(&outcomes);
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "convergence batch finished"
        );
        #[cfg(feature = "metrics")]
        for outcome in &outcomes {
            super::metrics::record_change(outcome);
        }

        self.enter(Phase::Idle);
        Ok(outcomes)
    }

    /// Run forever: pass, then sleep until the poll interval elapses or the
    /// configuration changes, whichever comes first. Observation failures
    /// back off exponentially and retry without waiting for a trigger.
    pub async fn run(&self) -> Result<()> {
        info!(interval = ?self.poll_interval, "starting convergence loop");
        let mut failed_observations: u32 = 0;

        loop {
            match self.run_once().await {
                Ok(_) => {
                    failed_observations = 0;
                }
                Err(e) => {
                    let delay = calculate_backoff(failed_observations, None, None);
                    failed_observations = failed_observations.saturating_add(1);
                    warn!(error = %e, ?delay, "observation failed, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.store.changed().notified() => {
                    debug!("configuration change signal received");
                }
            }
        }
    }
}

/// Exponential backoff: base * 2^attempt, capped at max
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
) -> Duration {
    let base = base_delay_secs.unwrap_or(1);
    let max = max_delay_secs.unwrap_or(60);

    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(6)));
    Duration::from_secs(delay_secs.min(max))
}
