//! Experiment reconciliation
//!
//! One pass moves an experiment one step: initialize status, register its
//! targets, evaluate pause/resume/terminate signals, sync metric definitions,
//! then either set up routing or run the next assessment iteration.

pub mod reconcile;
pub mod status;
pub mod watch;

pub use reconcile::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "experiment_test.rs"]
mod tests;
