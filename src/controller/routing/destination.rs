//! Destination building per target kind
//!
//! Deployment targets share the host service and are told apart by subsets in
//! the traffic policy. Service targets are addressed by their own host and
//! need no traffic policy at all.

use super::{default_host, service_fqdn};
use crate::controller::targets::TargetObject;
use crate::crd::experiment::{Experiment, TargetKind};
use crate::crd::mesh::{Destination, HttpRouteDestination, PortSelector, Subset};

/// One weighted destination to build
#[derive(Debug, Clone, Copy)]
pub struct DestinationOptions<'a> {
    /// Workload name (baseline or candidate)
    pub name: &'a str,
    pub weight: i32,
    pub subset: &'a str,
    pub port: Option<u32>,
}

pub trait DestinationHandler: Send + Sync {
    fn kind(&self) -> TargetKind;

    /// Whether a traffic-policy object is part of the rule set
    fn requires_traffic_policy(&self) -> bool;

    fn build_destination(&self, exp: &Experiment, opts: DestinationOptions<'_>)
        -> HttpRouteDestination;

    /// Subset selecting the workload's pods; `None` if subsets are not used
    fn build_subset(&self, target: &TargetObject, subset: &str) -> Option<Subset>;
}

pub struct DeploymentHandler;

impl DestinationHandler for DeploymentHandler {
    fn kind(&self) -> TargetKind {
        TargetKind::Deployment
    }

    fn requires_traffic_policy(&self) -> bool {
        true
    }

    fn build_destination(
        &self,
        exp: &Experiment,
        opts: DestinationOptions<'_>,
    ) -> HttpRouteDestination {
        HttpRouteDestination {
            destination: Destination {
                host: default_host(exp).unwrap_or_default(),
                subset: Some(opts.subset.to_string()),
                port: opts.port.map(|number| PortSelector { number }),
            },
            weight: opts.weight,
        }
    }

    fn build_subset(&self, target: &TargetObject, subset: &str) -> Option<Subset> {
        Some(Subset {
            name: subset.to_string(),
            labels: target.pod_labels(),
        })
    }
}

pub struct ServiceHandler;

impl DestinationHandler for ServiceHandler {
    fn kind(&self) -> TargetKind {
        TargetKind::Service
    }

    fn requires_traffic_policy(&self) -> bool {
        false
    }

    fn build_destination(
        &self,
        exp: &Experiment,
        opts: DestinationOptions<'_>,
    ) -> HttpRouteDestination {
        HttpRouteDestination {
            destination: Destination {
                host: service_fqdn(opts.name, &exp.service_namespace()),
                subset: None,
                port: opts.port.map(|number| PortSelector { number }),
            },
            weight: opts.weight,
        }
    }

    fn build_subset(&self, _target: &TargetObject, _subset: &str) -> Option<Subset> {
        None
    }
}

/// Picks the handler for the experiment's target kind
pub fn select_handler(kind: TargetKind) -> Box<dyn DestinationHandler> {
    match kind {
        TargetKind::Deployment => Box::new(DeploymentHandler),
        TargetKind::Service => Box::new(ServiceHandler),
    }
}
