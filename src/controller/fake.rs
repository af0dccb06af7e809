//! In-memory `ClusterClient` for tests
//!
//! Objects live in maps keyed by namespace/name. Every write is recorded as a
//! `"<verb> <Kind> <namespace>/<name>"` line so tests can assert on the exact
//! calls the routing engine and reconciler issued.
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::client::{parse_selector, ClientError, ClusterClient};
use crate::crd::experiment::{Experiment, ExperimentStatus};
use crate::crd::mesh::{DestinationRule, VirtualService};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

type Key = (String, String);

#[derive(Default)]
pub struct FakeCluster {
    experiments: Mutex<HashMap<Key, Experiment>>,
    virtual_services: Mutex<BTreeMap<Key, VirtualService>>,
    destination_rules: Mutex<BTreeMap<Key, DestinationRule>>,
    deployments: Mutex<HashMap<Key, Deployment>>,
    services: Mutex<HashMap<Key, Service>>,
    pods: Mutex<Vec<Pod>>,
    calls: Mutex<Vec<String>>,
    resource_version: AtomicU64,
    /// Number of upcoming experiment writes that fail with a conflict
    experiment_conflicts: AtomicUsize,
    /// Experiment reads never complete while set
    stalled: AtomicBool,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    parse_selector(selector)
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}

fn not_found(kind: &'static str, namespace: &str, name: &str) -> ClientError {
    ClientError::NotFound {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn conflict(kind: &'static str, namespace: &str, name: &str) -> ClientError {
    ClientError::Conflict {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    /// Recorded write calls, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Makes the next `n` experiment writes fail with a conflict
    pub fn fail_experiment_writes(&self, n: usize) {
        self.experiment_conflicts.store(n, Ordering::SeqCst);
    }

    /// Makes every experiment read hang, like an API server that stops answering
    pub fn stall_experiment_reads(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.experiment_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn insert_experiment(&self, exp: Experiment) {
        let ns = exp.namespace().unwrap_or_default();
        self.experiments
            .lock()
            .unwrap()
            .insert(key(&ns, &exp.name_any()), exp);
    }

    pub fn experiment(&self, namespace: &str, name: &str) -> Option<Experiment> {
        self.experiments
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn insert_virtual_service(&self, mut vs: VirtualService) {
        vs.metadata.resource_version = Some(self.next_version());
        let ns = vs.namespace().unwrap_or_default();
        self.virtual_services
            .lock()
            .unwrap()
            .insert(key(&ns, &vs.name_any()), vs);
    }

    pub fn insert_destination_rule(&self, mut dr: DestinationRule) {
        dr.metadata.resource_version = Some(self.next_version());
        let ns = dr.namespace().unwrap_or_default();
        self.destination_rules
            .lock()
            .unwrap()
            .insert(key(&ns, &dr.name_any()), dr);
    }

    pub fn virtual_services(&self) -> Vec<VirtualService> {
        self.virtual_services
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    pub fn destination_rules(&self) -> Vec<DestinationRule> {
        self.destination_rules
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    pub fn insert_deployment(&self, deployment: Deployment) {
        let ns = deployment.namespace().unwrap_or_default();
        self.deployments
            .lock()
            .unwrap()
            .insert(key(&ns, &deployment.name_any()), deployment);
    }

    pub fn remove_deployment(&self, namespace: &str, name: &str) {
        self.deployments.lock().unwrap().remove(&key(namespace, name));
    }

    pub fn has_deployment(&self, namespace: &str, name: &str) -> bool {
        self.deployments
            .lock()
            .unwrap()
            .contains_key(&key(namespace, name))
    }

    pub fn insert_service(&self, service: Service) {
        let ns = service.namespace().unwrap_or_default();
        self.services
            .lock()
            .unwrap()
            .insert(key(&ns, &service.name_any()), service);
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Experiment>, ClientError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.experiment(namespace, name))
    }

    async fn patch_experiment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExperimentStatus,
    ) -> Result<(), ClientError> {
        if self.take_conflict() {
            return Err(conflict("Experiment", namespace, name));
        }
        let mut experiments = self.experiments.lock().unwrap();
        let exp = experiments
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("Experiment", namespace, name))?;
        exp.status = Some(status.clone());
        drop(experiments);
        self.record(format!("status Experiment {}/{}", namespace, name));
        Ok(())
    }

    async fn set_experiment_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError> {
        if self.take_conflict() {
            return Err(conflict("Experiment", namespace, name));
        }
        let mut experiments = self.experiments.lock().unwrap();
        let exp = experiments
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("Experiment", namespace, name))?;
        exp.metadata.finalizers = if finalizers.is_empty() {
            None
        } else {
            Some(finalizers)
        };
        drop(experiments);
        self.record(format!("finalizers Experiment {}/{}", namespace, name));
        Ok(())
    }

    async fn clear_manual_override(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let mut experiments = self.experiments.lock().unwrap();
        let exp = experiments
            .get_mut(&key(namespace, name))
            .ok_or_else(|| not_found("Experiment", namespace, name))?;
        exp.spec.manual_override = None;
        drop(experiments);
        self.record(format!("override Experiment {}/{}", namespace, name));
        Ok(())
    }

    async fn list_virtual_services(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VirtualService>, ClientError> {
        Ok(self
            .virtual_services
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), vs)| ns == namespace && matches_selector(vs.labels(), selector))
            .map(|(_, vs)| vs.clone())
            .collect())
    }

    async fn create_virtual_service(
        &self,
        namespace: &str,
        vs: &VirtualService,
    ) -> Result<VirtualService, ClientError> {
        let name = vs.name_any();
        let mut store = self.virtual_services.lock().unwrap();
        if store.contains_key(&key(namespace, &name)) {
            return Err(conflict("VirtualService", namespace, &name));
        }
        let mut created = vs.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(self.next_version());
        store.insert(key(namespace, &name), created.clone());
        drop(store);
        self.record(format!("create VirtualService {}/{}", namespace, name));
        Ok(created)
    }

    async fn replace_virtual_service(
        &self,
        namespace: &str,
        vs: &VirtualService,
    ) -> Result<VirtualService, ClientError> {
        let name = vs.name_any();
        let mut store = self.virtual_services.lock().unwrap();
        let existing = store
            .get(&key(namespace, &name))
            .ok_or_else(|| not_found("VirtualService", namespace, &name))?;
        if existing.metadata.resource_version != vs.metadata.resource_version {
            return Err(conflict("VirtualService", namespace, &name));
        }
        let mut updated = vs.clone();
        updated.metadata.resource_version = Some(self.next_version());
        store.insert(key(namespace, &name), updated.clone());
        drop(store);
        self.record(format!("update VirtualService {}/{}", namespace, name));
        Ok(updated)
    }

    async fn delete_virtual_service(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.virtual_services
            .lock()
            .unwrap()
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("VirtualService", namespace, name))?;
        self.record(format!("delete VirtualService {}/{}", namespace, name));
        Ok(())
    }

    async fn list_destination_rules(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DestinationRule>, ClientError> {
        Ok(self
            .destination_rules
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), dr)| ns == namespace && matches_selector(dr.labels(), selector))
            .map(|(_, dr)| dr.clone())
            .collect())
    }

    async fn create_destination_rule(
        &self,
        namespace: &str,
        dr: &DestinationRule,
    ) -> Result<DestinationRule, ClientError> {
        let name = dr.name_any();
        let mut store = self.destination_rules.lock().unwrap();
        if store.contains_key(&key(namespace, &name)) {
            return Err(conflict("DestinationRule", namespace, &name));
        }
        let mut created = dr.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(self.next_version());
        store.insert(key(namespace, &name), created.clone());
        drop(store);
        self.record(format!("create DestinationRule {}/{}", namespace, name));
        Ok(created)
    }

    async fn replace_destination_rule(
        &self,
        namespace: &str,
        dr: &DestinationRule,
    ) -> Result<DestinationRule, ClientError> {
        let name = dr.name_any();
        let mut store = self.destination_rules.lock().unwrap();
        let existing = store
            .get(&key(namespace, &name))
            .ok_or_else(|| not_found("DestinationRule", namespace, &name))?;
        if existing.metadata.resource_version != dr.metadata.resource_version {
            return Err(conflict("DestinationRule", namespace, &name));
        }
        let mut updated = dr.clone();
        updated.metadata.resource_version = Some(self.next_version());
        store.insert(key(namespace, &name), updated.clone());
        drop(store);
        self.record(format!("update DestinationRule {}/{}", namespace, name));
        Ok(updated)
    }

    async fn delete_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.destination_rules
            .lock()
            .unwrap()
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("DestinationRule", namespace, name))?;
        self.record(format!("delete DestinationRule {}/{}", namespace, name));
        Ok(())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ClientError> {
        Ok(self
            .deployments
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.deployments
            .lock()
            .unwrap()
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("Deployment", namespace, name))?;
        self.record(format!("delete Deployment {}/{}", namespace, name));
        Ok(())
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClientError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClientError> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| {
                p.namespace().as_deref() == Some(namespace)
                    && matches_selector(p.labels(), selector)
            })
            .cloned()
            .collect())
    }
}

/// Fixture builders shared by controller tests
pub mod fixtures {
    use crate::crd::experiment::Experiment;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        Pod, PodCondition, PodStatus, PodTemplateSpec, Service, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use std::collections::BTreeMap;

    pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Experiment parsed from YAML spec lines (indented under `spec:`)
    pub fn experiment(name: &str, namespace: &str, spec_yaml: &str) -> Experiment {
        let yaml = format!(
            "apiVersion: kanary.io/v1alpha1\nkind: Experiment\nmetadata:\n  name: {}\n  namespace: {}\nspec:\n{}",
            name, namespace, spec_yaml
        );
        serde_yaml::from_str(&yaml).expect("invalid experiment fixture")
    }

    /// Deployment experiment `reviews` with baseline v1 and the given candidates
    pub fn reviews_experiment(candidates: &[&str]) -> Experiment {
        let list = candidates
            .iter()
            .map(|c| format!("    - {}\n", c))
            .collect::<String>();
        experiment(
            "reviews-exp",
            "bookinfo",
            &format!(
                "  service:\n    name: reviews\n    baseline: reviews-v1\n    candidates:\n{}",
                list
            ),
        )
    }

    /// Ready Deployment whose pods carry `app=<app>,version=<name>`
    pub fn ready_deployment(namespace: &str, name: &str, app: &str) -> Deployment {
        let pod_labels = labels(&[("app", app), ("version", name)]);
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(pod_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: None,
                },
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                replicas: Some(1),
                ready_replicas: Some(1),
                available_replicas: Some(1),
                conditions: Some(vec![
                    k8s_openapi::api::apps::v1::DeploymentCondition {
                        type_: "Available".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
        }
    }

    /// Deployment that exists but has no ready replicas
    pub fn unready_deployment(namespace: &str, name: &str, app: &str) -> Deployment {
        let mut d = ready_deployment(namespace, name, app);
        d.status = Some(DeploymentStatus {
            replicas: Some(1),
            ready_replicas: Some(0),
            available_replicas: Some(0),
            ..Default::default()
        });
        d
    }

    pub fn service(namespace: &str, name: &str, selector: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(labels(selector)),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn pod(namespace: &str, name: &str, pod_labels: &[(&str, &str)], ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels(pod_labels)),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }
}
