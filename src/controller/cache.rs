//! Process-wide registry of target workloads
//!
//! Maps each target (kind, namespace, name) to the experiment that owns it and
//! tracks whether the target currently exists. Shared between the workload
//! watchers and the reconciler; all state sits behind one mutex so registration
//! is atomic with respect to marks.

use super::adapter::ActionAdapter;
use crate::crd::experiment::{Experiment, TargetKind};
use kube::ResourceExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

/// Identity of an experiment (namespace/name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExperimentKey {
    pub namespace: String,
    pub name: String,
}

impl ExperimentKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_experiment(exp: &Experiment) -> Self {
        Self::new(
            exp.namespace().unwrap_or_else(|| "default".to_string()),
            exp.name_any(),
        )
    }

    /// Ownership label value: `namespace.name`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for ExperimentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A workload referenced by an experiment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub kind: TargetKind,
    pub namespace: String,
    pub name: String,
}

impl TargetKey {
    pub fn new(kind: TargetKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Baseline followed by candidates, in spec order
    pub fn for_experiment(exp: &Experiment) -> Vec<TargetKey> {
        let kind = exp.spec.service.kind;
        let namespace = exp.service_namespace();
        std::iter::once(&exp.spec.service.baseline)
            .chain(exp.spec.service.candidates.iter())
            .map(|name| TargetKey::new(kind, namespace.clone(), name.clone()))
            .collect()
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("target {target} is already owned by experiment {owner}")]
    Conflict { target: String, owner: String },
}

#[derive(Debug)]
struct TargetEntry {
    owner: ExperimentKey,
    found: bool,
}

#[derive(Debug)]
struct ExperimentEntry {
    targets: Vec<TargetKey>,
    adapter: Arc<ActionAdapter>,
}

#[derive(Debug, Default)]
struct CacheState {
    targets: HashMap<TargetKey, TargetEntry>,
    experiments: HashMap<ExperimentKey, ExperimentEntry>,
}

#[derive(Debug, Default)]
pub struct TargetCache {
    state: Mutex<CacheState>,
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claims `targets` for `experiment` and returns its action adapter
    ///
    /// Idempotent for the same target set. Targets no longer referenced are
    /// released; known targets keep their found state. If any target belongs
    /// to another experiment nothing is changed.
    pub fn register_experiment(
        &self,
        experiment: &ExperimentKey,
        targets: &[TargetKey],
    ) -> Result<Arc<ActionAdapter>, CacheError> {
        let mut state = self.state();

        if let Some((target, entry)) = targets.iter().find_map(|t| {
            state
                .targets
                .get(t)
                .filter(|e| &e.owner != experiment)
                .map(|e| (t, e))
        }) {
            return Err(CacheError::Conflict {
                target: target.to_string(),
                owner: entry.owner.to_string(),
            });
        }

        let adapter = match state.experiments.get(experiment) {
            Some(entry) => entry.adapter.clone(),
            None => Arc::new(ActionAdapter::new()),
        };

        let previous = state
            .experiments
            .insert(
                experiment.clone(),
                ExperimentEntry {
                    targets: targets.to_vec(),
                    adapter: adapter.clone(),
                },
            )
            .map(|e| e.targets)
            .unwrap_or_default();

        for stale in previous.iter().filter(|t| !targets.contains(t)) {
            state.targets.remove(stale);
        }
        for target in targets {
            state
                .targets
                .entry(target.clone())
                .or_insert_with(|| TargetEntry {
                    owner: experiment.clone(),
                    found: false,
                });
        }

        debug!(experiment = %experiment, targets = targets.len(), "Registered experiment targets");
        Ok(adapter)
    }

    /// Marks a registered target present; `true` only if it was missing
    pub fn mark_found(&self, target: &TargetKey) -> bool {
        self.set_found(target, true)
    }

    /// Marks a registered target absent; `true` only if it was present
    pub fn mark_missing(&self, target: &TargetKey) -> bool {
        self.set_found(target, false)
    }

    fn set_found(&self, target: &TargetKey, found: bool) -> bool {
        let mut state = self.state();
        match state.targets.get_mut(target) {
            Some(entry) if entry.found != found => {
                entry.found = found;
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_found(&self, target: &TargetKey) -> bool {
        self.state()
            .targets
            .get(target)
            .map(|e| e.found)
            .unwrap_or(false)
    }

    pub fn resolve_owner(&self, target: &TargetKey) -> Option<ExperimentKey> {
        self.state().targets.get(target).map(|e| e.owner.clone())
    }

    pub fn action_adapter(&self, experiment: &ExperimentKey) -> Option<Arc<ActionAdapter>> {
        self.state()
            .experiments
            .get(experiment)
            .map(|e| e.adapter.clone())
    }

    /// Releases every target owned by `experiment`
    pub fn remove_experiment(&self, experiment: &ExperimentKey) {
        let mut state = self.state();
        if let Some(entry) = state.experiments.remove(experiment) {
            for target in &entry.targets {
                state.targets.remove(target);
            }
            debug!(experiment = %experiment, "Released experiment targets");
        }
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;
