//! Workload watchers
//!
//! Services and Deployments are watched cluster-wide. Each create or delete is
//! applied to the `TargetCache`; only a real found/missing flip reaches the
//! owning experiment's `ActionAdapter` and enqueues a reconciliation. Updates
//! on targets already marked found flip nothing and are dropped here.

use crate::controller::cache::{ExperimentKey, TargetCache, TargetKey};
use crate::crd::experiment::{Experiment, TargetKind};
use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Event};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

/// Applies one workload event to the cache
///
/// Returns the experiment to reconcile, or `None` when the target is not
/// registered or its state did not change.
pub fn handle_target_event(
    cache: &TargetCache,
    target: &TargetKey,
    present: bool,
) -> Option<ExperimentKey> {
    let changed = if present {
        cache.mark_found(target)
    } else {
        cache.mark_missing(target)
    };
    if !changed {
        return None;
    }

    let owner = cache.resolve_owner(target)?;
    let adapter = cache.action_adapter(&owner)?;
    if present {
        adapter.mark_target_detected(&target.name, target.kind);
    } else {
        adapter.mark_target_deleted(&target.name, target.kind);
    }
    debug!(target_name = %target, experiment = %owner, present, "Target change enqueued");
    Some(owner)
}

/// Reconcile triggers derived from a watch on workloads of `kind`
pub fn target_triggers<K>(
    api: Api<K>,
    kind: TargetKind,
    cache: Arc<TargetCache>,
) -> impl Stream<Item = ObjectRef<Experiment>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher::watcher(api, watcher::Config::default()).filter_map(move |event| {
        let owner = match event {
            Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                handle_target_event(&cache, &target_key(kind, &obj), true)
            }
            Ok(Event::Delete(obj)) => handle_target_event(&cache, &target_key(kind, &obj), false),
            Ok(Event::Init) | Ok(Event::InitDone) => None,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Workload watch error");
                None
            }
        };
        futures::future::ready(
            owner.map(|key| ObjectRef::new(&key.name).within(&key.namespace)),
        )
    })
}

fn target_key<K: Resource>(kind: TargetKind, obj: &K) -> TargetKey {
    TargetKey::new(kind, obj.namespace().unwrap_or_default(), obj.name_any())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> TargetKey {
        TargetKey::new(TargetKind::Deployment, "bookinfo", name)
    }

    #[test]
    fn test_unregistered_target_is_ignored() {
        let cache = TargetCache::new();
        assert_eq!(handle_target_event(&cache, &target("reviews-v2"), true), None);
        assert_eq!(handle_target_event(&cache, &target("reviews-v2"), false), None);
    }

    #[test]
    fn test_detection_marks_adapter_once() {
        let cache = TargetCache::new();
        let owner = ExperimentKey::new("bookinfo", "reviews-exp");
        let adapter = cache
            .register_experiment(&owner, &[target("reviews-v1"), target("reviews-v2")])
            .unwrap();

        assert_eq!(
            handle_target_event(&cache, &target("reviews-v2"), true),
            Some(owner.clone())
        );
        // update event on an already found target
        assert_eq!(handle_target_event(&cache, &target("reviews-v2"), true), None);

        let action = adapter.snapshot();
        assert!(action.resume);
        assert!(!action.refresh);
        assert!(adapter.snapshot().is_empty());
    }

    #[test]
    fn test_deletion_requests_refresh() {
        let cache = TargetCache::new();
        let owner = ExperimentKey::new("bookinfo", "reviews-exp");
        let adapter = cache
            .register_experiment(&owner, &[target("reviews-v1")])
            .unwrap();
        cache.mark_found(&target("reviews-v1"));

        assert_eq!(
            handle_target_event(&cache, &target("reviews-v1"), false),
            Some(owner)
        );
        let action = adapter.snapshot();
        assert!(action.refresh);
        assert_eq!(action.target.as_deref(), Some("Deployment reviews-v1"));
    }
}
