pub mod adapter;
pub mod analytics;
pub mod cache;
pub mod client;
pub mod clock;
pub mod criteria;
pub mod experiment;
pub mod routing;
pub mod targets;

#[cfg(test)]
pub mod fake;

pub use experiment::{reconcile, Context, ReconcileError};
