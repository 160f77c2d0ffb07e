//! Convergence controller
//!
//! The diff engine, the change executor and the loop that drives them. The
//! loop owns the cadence; the diff engine is pure; the executor is the only
//! component that mutates real cluster state, and only through the drivers.

pub mod convergence;
pub mod diff;
pub mod executor;
#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(test)]
mod convergence_test;
#[cfg(test)]
mod executor_test;

pub use convergence::{calculate_backoff, ConvergenceLoop, CycleReport, Phase};
pub use diff::{compute_changes, Change};
pub use executor::{ChangeExecutor, ChangeOutcome, Outcome};
