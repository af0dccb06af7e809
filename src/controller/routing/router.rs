//! Routing operations for one experiment's host
//!
//! Each operation mutates the `RoutingRuleSet` in place and persists it. Calls
//! are safe to re-drive: objects carrying the init label are created only
//! while they have never been written, and updated otherwise.

use super::builder::{
    assessed_destinations, baseline_routes, candidate_destinations, fresh_rule_set,
    hosts_and_gateways,
};
use super::destination::{select_handler, DestinationHandler};
use super::rules::RoutingRuleSet;
use super::{
    candidate_subset_name, default_host, router_id, RoutingError, RoutingRole, BASELINE_SUBSET,
    ROUTER_LABEL, STABLE_ROUTE,
};
use crate::controller::client::ClusterClient;
use crate::controller::targets::TargetObject;
use crate::crd::experiment::{Assessment, Experiment, ExperimentStatus};
use crate::crd::mesh::{DestinationRule, HttpRoute, VirtualService, VirtualServiceSpec};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of `Router::converge_to_stable`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Rules were never set up or are already stable
    Skipped,
    /// Cleanup requested on controller-created rules; both objects deleted
    Deleted,
    /// Rules relabelled stable and released by the experiment
    Stabilized,
}

pub struct Router {
    client: Arc<dyn ClusterClient>,
    handler: Box<dyn DestinationHandler>,
    router_id: String,
    namespace: String,
}

impl Router {
    /// Router for the experiment's host, with the handler for its target kind
    pub fn for_experiment(
        client: Arc<dyn ClusterClient>,
        exp: &Experiment,
    ) -> Result<Self, RoutingError> {
        Ok(Self {
            client,
            handler: select_handler(exp.spec.service.kind),
            router_id: router_id(exp)?,
            namespace: exp.service_namespace(),
        })
    }

    pub fn router_id(&self) -> &str {
        &self.router_id
    }

    /// Lists the routing objects for this host and decides whether the
    /// experiment may use them
    ///
    /// # Returns
    /// * `Ok(RoutingRuleSet)` - fresh (unpersisted) rules, adopted stable rules,
    ///   or rules already owned by this experiment
    /// * `Err(RoutingError::Validation)` - rules owned by another experiment or
    ///   in a shape this experiment cannot take over
    pub async fn fetch(&self, exp: &Experiment) -> Result<RoutingRuleSet, RoutingError> {
        let selector = format!("{}={}", ROUTER_LABEL, self.router_id);
        let virtual_services = self
            .client
            .list_virtual_services(&self.namespace, &selector)
            .await?;
        let destination_rules = if self.handler.requires_traffic_policy() {
            self.client
                .list_destination_rules(&self.namespace, &selector)
                .await?
        } else {
            Vec::new()
        };

        let rules = self.classify(exp, virtual_services, destination_rules)?;
        debug!(
            router = %self.router_id,
            kind = ?self.handler.kind(),
            role = ?rules.role(),
            persisted = rules.is_persisted(),
            "Fetched routing rules"
        );
        Ok(rules)
    }

    fn classify(
        &self,
        exp: &Experiment,
        mut virtual_services: Vec<VirtualService>,
        mut destination_rules: Vec<DestinationRule>,
    ) -> Result<RoutingRuleSet, RoutingError> {
        let owner = exp.full_name();
        let with_policy = self.handler.requires_traffic_policy();
        let fresh = || {
            fresh_rule_set(
                &self.router_id,
                &self.namespace,
                &default_host(exp).unwrap_or_default(),
                &owner,
                with_policy,
            )
        };

        let rules = match (virtual_services.len(), destination_rules.len()) {
            (0, 0) => return Ok(fresh()),
            (1, 1) if with_policy => RoutingRuleSet {
                virtual_service: virtual_services.remove(0),
                destination_rule: destination_rules.pop(),
            },
            (1, 0) if !with_policy => RoutingRuleSet {
                virtual_service: virtual_services.remove(0),
                destination_rule: None,
            },
            // half-created pair from an interrupted create; only this
            // experiment may finish it
            (1, 0) | (0, 1) if with_policy => {
                let mut rules = fresh();
                if let Some(vs) = virtual_services.pop() {
                    rules.virtual_service = vs;
                }
                if let Some(dr) = destination_rules.pop() {
                    rules.destination_rule = Some(dr);
                }
                if rules.is_initializing() && rules.is_init() && rules.is_owned_by(&owner) {
                    return Ok(rules);
                }
                return Err(RoutingError::Validation(format!(
                    "router {} has an incomplete rule pair not created by {}",
                    self.router_id, owner
                )));
            }
            (vs, dr) => {
                return Err(RoutingError::Validation(format!(
                    "router {} has {} route tables and {} traffic policies",
                    self.router_id, vs, dr
                )))
            }
        };

        match rules.role() {
            Some(RoutingRole::Stable) => Ok(rules),
            Some(_) if rules.is_owned_by(&owner) => Ok(rules),
            Some(_) => Err(RoutingError::Validation(format!(
                "router {} is in use by experiment {}",
                self.router_id,
                rules.owner().unwrap_or("<unlabelled>")
            ))),
            None => Err(RoutingError::Validation(format!(
                "router {} rules have a missing or inconsistent role label",
                self.router_id
            ))),
        }
    }

    /// Routes all traffic to the baseline and claims the rules for `exp`
    ///
    /// No-op once candidates were added or the baseline route already exists.
    /// Sets the baseline weight in `status.assessment` to 100.
    pub async fn initialize_with_baseline(
        &self,
        rules: &mut RoutingRuleSet,
        exp: &Experiment,
        baseline: &TargetObject,
        status: &mut ExperimentStatus,
    ) -> Result<(), RoutingError> {
        if rules.is_progressing() || (rules.is_initializing() && rules.experiment_route().is_some())
        {
            return Ok(());
        }

        rules.set_label(ROUTER_LABEL, &self.router_id);
        rules.set_role(RoutingRole::Initializing);
        rules.set_owner(&exp.full_name());

        let (hosts, gateways) = hosts_and_gateways(exp);
        rules.virtual_service.spec = VirtualServiceSpec {
            hosts,
            gateways,
            http: baseline_routes(self.handler.as_ref(), exp),
        };

        if let Some(dr) = rules.destination_rule.as_mut() {
            dr.spec.subsets = self
                .handler
                .build_subset(baseline, BASELINE_SUBSET)
                .into_iter()
                .collect();
        }

        self.persist(rules).await?;

        status
            .assessment
            .get_or_insert_with(Assessment::default)
            .baseline
            .weight = 100;

        info!(router = %self.router_id, baseline = %exp.spec.service.baseline, "Routing initialized with baseline");
        Ok(())
    }

    /// Adds zero-weight candidate destinations and moves the rules to progressing
    ///
    /// `candidates` must follow the experiment's candidate order.
    pub async fn add_candidates(
        &self,
        rules: &mut RoutingRuleSet,
        exp: &Experiment,
        candidates: &[TargetObject],
    ) -> Result<(), RoutingError> {
        if rules.is_progressing() {
            return Ok(());
        }

        let destinations = candidate_destinations(self.handler.as_ref(), exp);
        let route = rules.experiment_route_mut().ok_or_else(|| {
            RoutingError::Validation(format!(
                "router {} has no experiment route",
                self.router_id
            ))
        })?;
        route.route.truncate(1);
        route.route.extend(destinations);

        if let Some(dr) = rules.destination_rule.as_mut() {
            dr.spec.subsets.retain(|s| s.name == BASELINE_SUBSET);
            for (i, candidate) in candidates.iter().enumerate() {
                if let Some(subset) = self
                    .handler
                    .build_subset(candidate, &candidate_subset_name(i))
                {
                    dr.spec.subsets.push(subset);
                }
            }
        }

        rules.set_role(RoutingRole::Progressing);
        self.persist(rules).await?;

        info!(
            router = %self.router_id,
            candidates = exp.spec.service.candidates.len(),
            "Candidates added to routing"
        );
        Ok(())
    }

    /// Copies the assessment's weights into the experiment route
    pub async fn apply_traffic_update(
        &self,
        rules: &mut RoutingRuleSet,
        exp: &Experiment,
        assessment: &Assessment,
    ) -> Result<(), RoutingError> {
        let destinations = assessed_destinations(self.handler.as_ref(), exp, assessment);
        let route = rules.experiment_route_mut().ok_or_else(|| {
            RoutingError::Validation(format!(
                "router {} has no experiment route",
                self.router_id
            ))
        })?;
        route.route = destinations;

        rules.virtual_service = self
            .client
            .replace_virtual_service(&self.namespace, &rules.virtual_service)
            .await?;

        debug!(
            router = %self.router_id,
            baseline = assessment.baseline.weight,
            candidates = ?assessment.candidates.iter().map(|c| c.weight).collect::<Vec<_>>(),
            "Traffic split applied"
        );
        Ok(())
    }

    /// Hands the rules back as a stable configuration
    ///
    /// With cleanup requested, rules the controller created are deleted.
    /// Otherwise progressing rules keep the experiment route's last weights as
    /// one unconditional route, and both objects are relabelled stable without
    /// an owner.
    pub async fn converge_to_stable(
        &self,
        rules: &mut RoutingRuleSet,
        exp: &Experiment,
    ) -> Result<Convergence, RoutingError> {
        if !rules.is_persisted() || !(rules.is_progressing() || rules.is_initializing()) {
            debug!(router = %self.router_id, "Routing rules not set up, nothing to converge");
            return Ok(Convergence::Skipped);
        }

        if exp.wants_cleanup() && rules.is_init() {
            if rules.virtual_service.metadata.resource_version.is_some() {
                self.client
                    .delete_virtual_service(&self.namespace, &rules.virtual_service.name_any())
                    .await?;
            }
            if let Some(dr) = rules
                .destination_rule
                .as_ref()
                .filter(|dr| dr.metadata.resource_version.is_some())
            {
                self.client
                    .delete_destination_rule(&self.namespace, &dr.name_any())
                    .await?;
            }
            info!(router = %self.router_id, "Routing rules deleted");
            return Ok(Convergence::Deleted);
        }

        if rules.is_progressing() {
            if let Some(route) = rules.experiment_route().cloned() {
                rules.virtual_service.spec.http = vec![HttpRoute {
                    name: Some(STABLE_ROUTE.to_string()),
                    matches: Vec::new(),
                    route: route.route,
                }];
            }
        }

        rules.set_role(RoutingRole::Stable);
        rules.clear_owner();
        self.persist(rules).await?;

        info!(router = %self.router_id, "Routing rules converged to stable");
        Ok(Convergence::Stabilized)
    }

    /// Creates objects that carry the init label and were never written;
    /// updates everything else
    async fn persist(&self, rules: &mut RoutingRuleSet) -> Result<(), RoutingError> {
        let init = rules.is_init();

        rules.virtual_service =
            if init && rules.virtual_service.metadata.resource_version.is_none() {
                self.client
                    .create_virtual_service(&self.namespace, &rules.virtual_service)
                    .await?
            } else {
                self.client
                    .replace_virtual_service(&self.namespace, &rules.virtual_service)
                    .await?
            };

        if let Some(dr) = rules.destination_rule.as_ref() {
            let saved = if init && dr.metadata.resource_version.is_none() {
                self.client
                    .create_destination_rule(&self.namespace, dr)
                    .await?
            } else {
                self.client
                    .replace_destination_rule(&self.namespace, dr)
                    .await?
            };
            rules.destination_rule = Some(saved);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
