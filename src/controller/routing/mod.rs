//! Routing engine
//!
//! Translates experiment intent into a route table (`VirtualService`) and a
//! traffic policy (`DestinationRule`) for one host. The pair is correlated by
//! the router label and moves through the roles
//! initializing -> progressing -> stable.

pub mod builder;
pub mod destination;
pub mod router;
pub mod rules;

pub use destination::{select_handler, DestinationHandler};
pub use router::{Convergence, Router};
pub use rules::RoutingRuleSet;

use super::client::ClientError;
use crate::crd::experiment::Experiment;
use thiserror::Error;

pub const ROUTER_LABEL: &str = "kanary.io/router";
pub const ROLE_LABEL: &str = "kanary.io/role";
pub const EXPERIMENT_LABEL: &str = "kanary.io/experiment";
pub const INIT_LABEL: &str = "kanary.io/init";

pub const RULE_NAME_SUFFIX: &str = "kanary-router";
pub const EXPERIMENT_ROUTE: &str = "kanary-experiment";
pub const BASE_ROUTE: &str = "kanary-base";
pub const STABLE_ROUTE: &str = "kanary-stable";
pub const BASELINE_SUBSET: &str = "kanary-baseline";
pub const CANDIDATE_SUBSET_PREFIX: &str = "kanary-candidate";

/// Label value standing in for the `*` host
pub const WILDCARD_SENTINEL: &str = "kanary-wildcard-host";
pub const MESH_GATEWAY: &str = "mesh";

#[derive(Debug, Error)]
pub enum RoutingError {
    /// Existing routing objects cannot be used by this experiment
    #[error("routing rules invalid: {0}")]
    Validation(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Role of a routing rule pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingRole {
    Initializing,
    Progressing,
    Stable,
}

impl RoutingRole {
    pub fn as_label(&self) -> &'static str {
        match self {
            RoutingRole::Initializing => "initializing",
            RoutingRole::Progressing => "progressing",
            RoutingRole::Stable => "stable",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "initializing" => Some(RoutingRole::Initializing),
            "progressing" => Some(RoutingRole::Progressing),
            "stable" => Some(RoutingRole::Stable),
            _ => None,
        }
    }
}

/// `name.namespace.svc.cluster.local`
pub fn service_fqdn(name: &str, namespace: &str) -> String {
    format!("{}.{}.svc.cluster.local", name, namespace)
}

pub fn candidate_subset_name(index: usize) -> String {
    format!("{}-{}", CANDIDATE_SUBSET_PREFIX, index)
}

pub fn rule_name(router_id: &str) -> String {
    format!("{}.{}", router_id, RULE_NAME_SUFFIX)
}

/// Host the experiment routes: the service FQDN, else the first external host
pub fn default_host(exp: &Experiment) -> Option<String> {
    match exp.spec.service.name.as_deref() {
        Some(name) if !name.is_empty() => Some(service_fqdn(name, &exp.service_namespace())),
        _ => exp
            .spec
            .networking
            .as_ref()
            .and_then(|n| n.hosts.first())
            .map(|h| h.name.clone()),
    }
}

/// Explicit `networking.id`, else the default host (`*` mapped to a sentinel)
pub fn router_id(exp: &Experiment) -> Result<String, RoutingError> {
    if let Some(id) = exp
        .spec
        .networking
        .as_ref()
        .and_then(|n| n.id.as_ref())
        .filter(|id| !id.is_empty())
    {
        return Ok(id.clone());
    }

    match default_host(exp) {
        Some(host) if host == "*" => Ok(WILDCARD_SENTINEL.to_string()),
        Some(host) => Ok(host),
        None => Err(RoutingError::Validation(
            "no host: set service.name or networking.hosts".to_string(),
        )),
    }
}
