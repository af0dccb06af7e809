pub mod experiment;
pub mod mesh;

pub use experiment::{Experiment, ExperimentSpec, ExperimentStatus, Phase, TargetKind};
pub use mesh::{DestinationRule, VirtualService};
