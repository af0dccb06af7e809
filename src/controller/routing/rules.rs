use super::{RoutingRole, EXPERIMENT_LABEL, EXPERIMENT_ROUTE, INIT_LABEL, ROLE_LABEL};
use crate::crd::mesh::{DestinationRule, HttpRoute, VirtualService};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Route table and optional traffic policy for one host
///
/// Scoped to a single reconciliation. The traffic policy is `None` when the
/// target kind routes by service host and needs no subsets.
#[derive(Debug, Clone)]
pub struct RoutingRuleSet {
    pub virtual_service: VirtualService,
    pub destination_rule: Option<DestinationRule>,
}

fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

impl RoutingRuleSet {
    fn metas(&self) -> impl Iterator<Item = &ObjectMeta> {
        std::iter::once(&self.virtual_service.metadata)
            .chain(self.destination_rule.iter().map(|dr| &dr.metadata))
    }

    fn metas_mut(&mut self) -> impl Iterator<Item = &mut ObjectMeta> {
        std::iter::once(&mut self.virtual_service.metadata)
            .chain(self.destination_rule.iter_mut().map(|dr| &mut dr.metadata))
    }

    /// True when every object carries `key=value`
    fn all_have(&self, key: &str, value: &str) -> bool {
        self.metas().all(|m| label(m, key) == Some(value))
    }

    /// Role shared by both objects; `None` if absent or they disagree
    pub fn role(&self) -> Option<RoutingRole> {
        let role = label(&self.virtual_service.metadata, ROLE_LABEL)
            .and_then(RoutingRole::from_label)?;
        self.all_have(ROLE_LABEL, role.as_label()).then_some(role)
    }

    pub fn is_progressing(&self) -> bool {
        self.role() == Some(RoutingRole::Progressing)
    }

    pub fn is_initializing(&self) -> bool {
        self.role() == Some(RoutingRole::Initializing)
    }

    pub fn is_stable(&self) -> bool {
        self.role() == Some(RoutingRole::Stable)
    }

    /// Created by the controller (as opposed to adopted from the user)
    pub fn is_init(&self) -> bool {
        self.all_have(INIT_LABEL, "true")
    }

    /// At least one object has been written to the cluster
    pub fn is_persisted(&self) -> bool {
        self.metas().any(|m| m.resource_version.is_some())
    }

    pub fn owner(&self) -> Option<&str> {
        label(&self.virtual_service.metadata, EXPERIMENT_LABEL)
    }

    pub fn is_owned_by(&self, full_name: &str) -> bool {
        self.all_have(EXPERIMENT_LABEL, full_name)
    }

    pub fn set_role(&mut self, role: RoutingRole) {
        self.set_label(ROLE_LABEL, role.as_label());
    }

    pub fn set_owner(&mut self, full_name: &str) {
        self.set_label(EXPERIMENT_LABEL, full_name);
    }

    pub fn clear_owner(&mut self) {
        for meta in self.metas_mut() {
            if let Some(labels) = meta.labels.as_mut() {
                labels.remove(EXPERIMENT_LABEL);
            }
        }
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        for meta in self.metas_mut() {
            meta.labels
                .get_or_insert_with(Default::default)
                .insert(key.to_string(), value.to_string());
        }
    }

    pub fn experiment_route(&self) -> Option<&HttpRoute> {
        self.virtual_service
            .spec
            .http
            .iter()
            .find(|r| r.name.as_deref() == Some(EXPERIMENT_ROUTE))
    }

    pub fn experiment_route_mut(&mut self) -> Option<&mut HttpRoute> {
        self.virtual_service
            .spec
            .http
            .iter_mut()
            .find(|r| r.name.as_deref() == Some(EXPERIMENT_ROUTE))
    }
}
