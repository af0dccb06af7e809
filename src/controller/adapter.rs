//! Per-experiment accumulator for workload events
//!
//! Watch handlers mark a target as detected or deleted; the reconciler takes a
//! snapshot at the start of its step. Taking the snapshot clears the pending
//! action, so each event is observed by at most one reconciliation. A snapshot
//! that is taken and then dropped loses the signal for good.

use crate::crd::experiment::TargetKind;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingAction {
    TargetDetected { kind: TargetKind, name: String },
    TargetDeleted { kind: TargetKind, name: String },
}

/// What the reconciler should do because of workload events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentAction {
    /// A ready target was deleted; routing must be re-evaluated
    pub refresh: bool,
    /// A missing target came back; progression may continue
    pub resume: bool,
    /// Name of the target that triggered the action, for status messages
    pub target: Option<String>,
}

impl ExperimentAction {
    pub fn is_empty(&self) -> bool {
        !self.refresh && !self.resume
    }
}

#[derive(Debug, Default)]
pub struct ActionAdapter {
    pending: Mutex<Option<PendingAction>>,
}

impl ActionAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, Option<PendingAction>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Records that `name` appeared; replaces any pending deletion
    pub fn mark_target_detected(&self, name: &str, kind: TargetKind) {
        debug!(target_name = name, kind = %kind, "Target detected");
        *self.pending() = Some(PendingAction::TargetDetected {
            kind,
            name: name.to_string(),
        });
    }

    /// Records that `name` went away; replaces any pending detection
    pub fn mark_target_deleted(&self, name: &str, kind: TargetKind) {
        debug!(target_name = name, kind = %kind, "Target deleted");
        *self.pending() = Some(PendingAction::TargetDeleted {
            kind,
            name: name.to_string(),
        });
    }

    /// Returns the pending action and clears it in one step
    pub fn snapshot(&self) -> ExperimentAction {
        match self.pending().take() {
            None => ExperimentAction::default(),
            Some(PendingAction::TargetDetected { kind, name }) => ExperimentAction {
                refresh: false,
                resume: true,
                target: Some(format!("{} {}", kind, name)),
            },
            Some(PendingAction::TargetDeleted { kind, name }) => ExperimentAction {
                refresh: true,
                resume: false,
                target: Some(format!("{} {}", kind, name)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_of_fresh_adapter_is_empty() {
        let adapter = ActionAdapter::new();
        assert!(adapter.snapshot().is_empty());
    }

    #[test]
    fn test_detected_sets_resume() {
        let adapter = ActionAdapter::new();
        adapter.mark_target_detected("reviews-v2", TargetKind::Deployment);

        let action = adapter.snapshot();
        assert!(action.resume);
        assert!(!action.refresh);
        assert_eq!(action.target.as_deref(), Some("Deployment reviews-v2"));
    }

    #[test]
    fn test_deleted_sets_refresh() {
        let adapter = ActionAdapter::new();
        adapter.mark_target_deleted("reviews", TargetKind::Service);

        let action = adapter.snapshot();
        assert!(action.refresh);
        assert!(!action.resume);
    }

    #[test]
    fn test_snapshot_clears_pending_action() {
        let adapter = ActionAdapter::new();
        adapter.mark_target_deleted("reviews-v2", TargetKind::Deployment);

        assert!(adapter.snapshot().refresh);
        assert!(adapter.snapshot().is_empty());
    }

    #[test]
    fn test_last_mark_wins() {
        let adapter = ActionAdapter::new();
        adapter.mark_target_deleted("reviews-v2", TargetKind::Deployment);
        adapter.mark_target_detected("reviews-v2", TargetKind::Deployment);

        let action = adapter.snapshot();
        assert!(action.resume);
        assert!(!action.refresh);

        adapter.mark_target_detected("reviews-v2", TargetKind::Deployment);
        adapter.mark_target_deleted("reviews-v2", TargetKind::Deployment);

        let action = adapter.snapshot();
        assert!(action.refresh);
        assert!(!action.resume);
    }

    #[test]
    fn test_concurrent_marks_delivered_at_most_once() {
        let adapter = Arc::new(ActionAdapter::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let adapter = adapter.clone();
                std::thread::spawn(move || {
                    adapter.mark_target_detected(&format!("v{}", i), TargetKind::Deployment);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(adapter.snapshot().resume);
        assert!(adapter.snapshot().is_empty());
    }
}
