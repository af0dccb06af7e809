//! Target workload lookup and readiness polling
//!
//! A Deployment is ready when its `Available` condition is True, at least one
//! replica is available and every replica is ready. A Service is ready when
//! every pod it selects is Running with a True `Ready` condition.

use super::cache::TargetKey;
use super::client::{format_selector, ClientError, ClusterClient};
use crate::crd::experiment::TargetKind;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("target {0} not found")]
    Missing(String),

    #[error("target {target} not ready after {waited:?}")]
    NotReady { target: String, waited: Duration },

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Poll interval and ceiling for readiness waits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(15),
        }
    }
}

/// A fetched target workload
#[derive(Debug, Clone)]
pub enum TargetObject {
    Deployment(Deployment),
    Service(Service),
}

impl TargetObject {
    /// Labels of the pods this workload runs (Deployment template labels)
    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        match self {
            TargetObject::Deployment(d) => d
                .spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.labels.clone())
                .unwrap_or_default(),
            TargetObject::Service(s) => s
                .spec
                .as_ref()
                .and_then(|spec| spec.selector.clone())
                .unwrap_or_default(),
        }
    }
}

/// Fetches the target, `None` if it does not exist
pub async fn fetch_target(
    client: &dyn ClusterClient,
    target: &TargetKey,
) -> Result<Option<TargetObject>, ClientError> {
    Ok(match target.kind {
        TargetKind::Deployment => client
            .get_deployment(&target.namespace, &target.name)
            .await?
            .map(TargetObject::Deployment),
        TargetKind::Service => client
            .get_service(&target.namespace, &target.name)
            .await?
            .map(TargetObject::Service),
    })
}

pub fn deployment_ready(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    let available = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Available" && c.status == "True");

    available
        && status.available_replicas.unwrap_or(0) > 0
        && status.replicas.unwrap_or(0) == status.ready_replicas.unwrap_or(0)
}

pub fn pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
}

async fn is_ready(
    client: &dyn ClusterClient,
    target: &TargetKey,
    obj: &TargetObject,
) -> Result<bool, ClientError> {
    match obj {
        TargetObject::Deployment(d) => Ok(deployment_ready(d)),
        TargetObject::Service(_) => {
            let selector = obj.pod_labels();
            if selector.is_empty() {
                return Ok(true);
            }
            let pods = client
                .list_pods(&target.namespace, &format_selector(&selector))
                .await?;
            Ok(pods.iter().all(pod_ready))
        }
    }
}

/// Waits until `target` exists and is ready
///
/// # Returns
/// * `Ok(TargetObject)` - the ready workload
/// * `Err(TargetError::Missing)` - the workload does not exist
/// * `Err(TargetError::NotReady)` - still not ready when the timeout elapsed
pub async fn wait_for_ready(
    client: &dyn ClusterClient,
    target: &TargetKey,
    poll: &PollConfig,
) -> Result<TargetObject, TargetError> {
    let started = Instant::now();
    loop {
        let obj = fetch_target(client, target)
            .await?
            .ok_or_else(|| TargetError::Missing(target.to_string()))?;

        if is_ready(client, target, &obj).await? {
            return Ok(obj);
        }

        let waited = started.elapsed();
        if waited + poll.interval > poll.timeout {
            return Err(TargetError::NotReady {
                target: target.to_string(),
                waited,
            });
        }
        debug!(target_name = %target, "Target not ready, polling");
        tokio::time::sleep(poll.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::fixtures;
    use crate::controller::fake::FakeCluster;

    fn fast_poll() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(30),
        }
    }

    #[test]
    fn test_deployment_ready_requires_all_conditions() {
        let ready = fixtures::ready_deployment("ns", "web-v1", "web");
        assert!(deployment_ready(&ready));

        let unready = fixtures::unready_deployment("ns", "web-v1", "web");
        assert!(!deployment_ready(&unready));

        let mut no_condition = ready.clone();
        if let Some(status) = no_condition.status.as_mut() {
            status.conditions = None;
        }
        assert!(!deployment_ready(&no_condition));

        let mut rolling = ready;
        if let Some(status) = rolling.status.as_mut() {
            status.replicas = Some(2);
        }
        assert!(!deployment_ready(&rolling));
    }

    #[test]
    fn test_pod_ready() {
        assert!(pod_ready(&fixtures::pod("ns", "p", &[], true)));
        assert!(!pod_ready(&fixtures::pod("ns", "p", &[], false)));
    }

    #[tokio::test]
    async fn test_wait_for_ready_deployment() {
        let cluster = FakeCluster::new();
        cluster.insert_deployment(fixtures::ready_deployment("ns", "web-v1", "web"));

        let target = TargetKey::new(TargetKind::Deployment, "ns", "web-v1");
        let obj = wait_for_ready(&cluster, &target, &fast_poll()).await.unwrap();

        assert_eq!(obj.pod_labels()["version"], "web-v1");
    }

    #[tokio::test]
    async fn test_wait_for_ready_missing_target() {
        let cluster = FakeCluster::new();
        let target = TargetKey::new(TargetKind::Deployment, "ns", "web-v1");

        let err = wait_for_ready(&cluster, &target, &fast_poll())
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::Missing(_)));
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out() {
        let cluster = FakeCluster::new();
        cluster.insert_deployment(fixtures::unready_deployment("ns", "web-v1", "web"));
        let target = TargetKey::new(TargetKind::Deployment, "ns", "web-v1");

        let err = wait_for_ready(&cluster, &target, &fast_poll())
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_service_ready_when_selected_pods_ready() {
        let cluster = FakeCluster::new();
        cluster.insert_service(fixtures::service("ns", "web-v2", &[("app", "web-v2")]));
        cluster.insert_pod(fixtures::pod("ns", "web-v2-a", &[("app", "web-v2")], true));
        cluster.insert_pod(fixtures::pod("ns", "other", &[("app", "other")], false));

        let target = TargetKey::new(TargetKind::Service, "ns", "web-v2");
        let obj = wait_for_ready(&cluster, &target, &fast_poll()).await.unwrap();
        assert!(matches!(obj, TargetObject::Service(_)));
    }

    #[tokio::test]
    async fn test_service_not_ready_when_any_pod_unready() {
        let cluster = FakeCluster::new();
        cluster.insert_service(fixtures::service("ns", "web-v2", &[("app", "web-v2")]));
        cluster.insert_pod(fixtures::pod("ns", "web-v2-a", &[("app", "web-v2")], true));
        cluster.insert_pod(fixtures::pod("ns", "web-v2-b", &[("app", "web-v2")], false));

        let target = TargetKey::new(TargetKind::Service, "ns", "web-v2");
        let err = wait_for_ready(&cluster, &target, &fast_poll())
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::NotReady { .. }));
    }
}
