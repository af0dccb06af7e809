//! Capability client for the cluster objects the controller touches
//!
//! The reconciler and the routing engine only see `ClusterClient`, so the whole
//! flow runs against an in-memory fake in tests.

use crate::crd::experiment::{Experiment, ExperimentStatus};
use crate::crd::mesh::{DestinationRule, VirtualService};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("conflict writing {kind} {namespace}/{name}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Kubernetes API error: {0}")]
    Api(#[source] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict { .. })
    }

    fn from_kube(err: kube::Error, kind: &'static str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => ClientError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ref resp) if resp.code == 409 => ClientError::Conflict {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            other => ClientError::Api(other),
        }
    }
}

/// Operations on experiments, routing objects and workloads
///
/// Label selectors use the `key=value,key2=value2` form.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Experiment>, ClientError>;

    async fn patch_experiment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExperimentStatus,
    ) -> Result<(), ClientError>;

    async fn set_experiment_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError>;

    /// Removes `spec.manualOverride` once it has been acted on
    async fn clear_manual_override(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn list_virtual_services(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VirtualService>, ClientError>;

    async fn create_virtual_service(
        &self,
        namespace: &str,
        vs: &VirtualService,
    ) -> Result<VirtualService, ClientError>;

    async fn replace_virtual_service(
        &self,
        namespace: &str,
        vs: &VirtualService,
    ) -> Result<VirtualService, ClientError>;

    async fn delete_virtual_service(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn list_destination_rules(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DestinationRule>, ClientError>;

    async fn create_destination_rule(
        &self,
        namespace: &str,
        dr: &DestinationRule,
    ) -> Result<DestinationRule, ClientError>;

    async fn replace_destination_rule(
        &self,
        namespace: &str,
        dr: &DestinationRule,
    ) -> Result<DestinationRule, ClientError>;

    async fn delete_destination_rule(&self, namespace: &str, name: &str)
        -> Result<(), ClientError>;

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ClientError>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, ClientError>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClientError>;
}

/// `ClusterClient` backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_opt<K>(
    api: &Api<K>,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> Result<Option<K>, ClientError>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    api.get_opt(name)
        .await
        .map_err(|e| ClientError::from_kube(e, kind, namespace, name))
}

async fn create<K>(
    api: &Api<K>,
    kind: &'static str,
    namespace: &str,
    obj: &K,
) -> Result<K, ClientError>
where
    K: kube::Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    api.create(&PostParams::default(), obj)
        .await
        .map_err(|e| ClientError::from_kube(e, kind, namespace, &obj.name_any()))
}

async fn replace<K>(
    api: &Api<K>,
    kind: &'static str,
    namespace: &str,
    obj: &K,
) -> Result<K, ClientError>
where
    K: kube::Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = obj.name_any();
    api.replace(&name, &PostParams::default(), obj)
        .await
        .map_err(|e| ClientError::from_kube(e, kind, namespace, &name))
}

async fn delete<K>(
    api: &Api<K>,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> Result<(), ClientError>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::default())
        .await
        .map(|_| ())
        .map_err(|e| ClientError::from_kube(e, kind, namespace, name))
}

async fn list<K>(
    api: &Api<K>,
    kind: &'static str,
    namespace: &str,
    selector: &str,
) -> Result<Vec<K>, ClientError>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    api.list(&ListParams::default().labels(selector))
        .await
        .map(|l| l.items)
        .map_err(|e| ClientError::from_kube(e, kind, namespace, ""))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Experiment>, ClientError> {
        get_opt(&self.api::<Experiment>(namespace), "Experiment", namespace, name).await
    }

    async fn patch_experiment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExperimentStatus,
    ) -> Result<(), ClientError> {
        let patch = serde_json::json!({ "status": status });
        self.api::<Experiment>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| ClientError::from_kube(e, "Experiment", namespace, name))
    }

    async fn set_experiment_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.api::<Experiment>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| ClientError::from_kube(e, "Experiment", namespace, name))
    }

    async fn clear_manual_override(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let patch = serde_json::json!({ "spec": { "manualOverride": null } });
        self.api::<Experiment>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| ClientError::from_kube(e, "Experiment", namespace, name))
    }

    async fn list_virtual_services(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VirtualService>, ClientError> {
        list(&self.api(namespace), "VirtualService", namespace, selector).await
    }

    async fn create_virtual_service(
        &self,
        namespace: &str,
        vs: &VirtualService,
    ) -> Result<VirtualService, ClientError> {
        create(&self.api(namespace), "VirtualService", namespace, vs).await
    }

    async fn replace_virtual_service(
        &self,
        namespace: &str,
        vs: &VirtualService,
    ) -> Result<VirtualService, ClientError> {
        replace(&self.api(namespace), "VirtualService", namespace, vs).await
    }

    async fn delete_virtual_service(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        delete(
            &self.api::<VirtualService>(namespace),
            "VirtualService",
            namespace,
            name,
        )
        .await
    }

    async fn list_destination_rules(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DestinationRule>, ClientError> {
        list(&self.api(namespace), "DestinationRule", namespace, selector).await
    }

    async fn create_destination_rule(
        &self,
        namespace: &str,
        dr: &DestinationRule,
    ) -> Result<DestinationRule, ClientError> {
        create(&self.api(namespace), "DestinationRule", namespace, dr).await
    }

    async fn replace_destination_rule(
        &self,
        namespace: &str,
        dr: &DestinationRule,
    ) -> Result<DestinationRule, ClientError> {
        replace(&self.api(namespace), "DestinationRule", namespace, dr).await
    }

    async fn delete_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        delete(
            &self.api::<DestinationRule>(namespace),
            "DestinationRule",
            namespace,
            name,
        )
        .await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ClientError> {
        get_opt(&self.api::<Deployment>(namespace), "Deployment", namespace, name).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        delete(&self.api::<Deployment>(namespace), "Deployment", namespace, name).await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClientError> {
        get_opt(&self.api::<Service>(namespace), "Service", namespace, name).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClientError> {
        list(&self.api(namespace), "Pod", namespace, selector).await
    }
}

/// Parses a `key=value,key2=value2` selector into pairs
///
/// Only equality terms are understood; that is all the controller emits.
pub fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|term| {
            let (k, v) = term.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Formats labels as an equality selector
pub fn format_selector<'a, I>(labels: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    labels
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
