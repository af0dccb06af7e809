//! Construction of routing objects and their parts

use super::destination::{DestinationHandler, DestinationOptions};
use super::rules::RoutingRuleSet;
use super::{
    candidate_subset_name, rule_name, service_fqdn, RoutingRole, BASELINE_SUBSET, BASE_ROUTE,
    EXPERIMENT_LABEL, EXPERIMENT_ROUTE, INIT_LABEL, MESH_GATEWAY, ROLE_LABEL, ROUTER_LABEL,
};
use crate::crd::experiment::{Assessment, Experiment};
use crate::crd::mesh::{
    DestinationRule, DestinationRuleSpec, HttpMatchRequest, HttpRoute, HttpRouteDestination,
    VirtualService, VirtualServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

fn fresh_meta(router_id: &str, namespace: &str, owner: &str) -> ObjectMeta {
    let labels = BTreeMap::from([
        (ROUTER_LABEL.to_string(), router_id.to_string()),
        (
            ROLE_LABEL.to_string(),
            RoutingRole::Initializing.as_label().to_string(),
        ),
        (EXPERIMENT_LABEL.to_string(), owner.to_string()),
        (INIT_LABEL.to_string(), "true".to_string()),
    ]);
    ObjectMeta {
        name: Some(rule_name(router_id)),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Unpersisted rule pair for a host that has none yet
///
/// # Arguments
/// * `router_id` - value of the router label, also used for object names
/// * `host` - traffic-policy host
/// * `owner` - experiment full name (`namespace.name`)
/// * `with_policy` - whether to include a traffic-policy object
pub fn fresh_rule_set(
    router_id: &str,
    namespace: &str,
    host: &str,
    owner: &str,
    with_policy: bool,
) -> RoutingRuleSet {
    let virtual_service = VirtualService {
        metadata: fresh_meta(router_id, namespace, owner),
        spec: VirtualServiceSpec::default(),
    };

    let destination_rule = with_policy.then(|| DestinationRule {
        metadata: fresh_meta(router_id, namespace, owner),
        spec: DestinationRuleSpec {
            host: host.to_string(),
            subsets: vec![],
        },
    });

    RoutingRuleSet {
        virtual_service,
        destination_rule,
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// Hosts and gateways the route table serves
///
/// The internal service host comes first and is served through the mesh
/// gateway; external hosts and their gateways follow, without duplicates.
pub fn hosts_and_gateways(exp: &Experiment) -> (Vec<String>, Vec<String>) {
    let mut hosts = Vec::new();
    let mut gateways = Vec::new();

    if let Some(name) = exp.spec.service.name.as_deref().filter(|n| !n.is_empty()) {
        push_unique(&mut hosts, &service_fqdn(name, &exp.service_namespace()));
        push_unique(&mut gateways, MESH_GATEWAY);
    }

    if let Some(networking) = exp.spec.networking.as_ref() {
        for host in &networking.hosts {
            push_unique(&mut hosts, &host.name);
            push_unique(&mut gateways, &host.gateway);
        }
    }

    (hosts, gateways)
}

pub fn named_route(
    name: &str,
    matches: &[HttpMatchRequest],
    route: Vec<HttpRouteDestination>,
) -> HttpRoute {
    HttpRoute {
        name: Some(name.to_string()),
        matches: matches.to_vec(),
        route,
    }
}

/// Baseline destination at full weight
pub fn baseline_destination(
    handler: &dyn DestinationHandler,
    exp: &Experiment,
) -> HttpRouteDestination {
    handler.build_destination(
        exp,
        DestinationOptions {
            name: &exp.spec.service.baseline,
            weight: 100,
            subset: BASELINE_SUBSET,
            port: exp.spec.service.port,
        },
    )
}

/// Zero-weight destinations for every candidate, in spec order
pub fn candidate_destinations(
    handler: &dyn DestinationHandler,
    exp: &Experiment,
) -> Vec<HttpRouteDestination> {
    exp.spec
        .service
        .candidates
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let subset = candidate_subset_name(i);
            handler.build_destination(
                exp,
                DestinationOptions {
                    name,
                    weight: 0,
                    subset: &subset,
                    port: exp.spec.service.port,
                },
            )
        })
        .collect()
}

/// Destinations carrying the assessment's weights, baseline first
pub fn assessed_destinations(
    handler: &dyn DestinationHandler,
    exp: &Experiment,
    assessment: &Assessment,
) -> Vec<HttpRouteDestination> {
    let baseline = handler.build_destination(
        exp,
        DestinationOptions {
            name: &assessment.baseline.name,
            weight: assessment.baseline.weight,
            subset: BASELINE_SUBSET,
            port: exp.spec.service.port,
        },
    );

    std::iter::once(baseline)
        .chain(assessment.candidates.iter().enumerate().map(|(i, c)| {
            let subset = candidate_subset_name(i);
            handler.build_destination(
                exp,
                DestinationOptions {
                    name: &c.name,
                    weight: c.weight,
                    subset: &subset,
                    port: exp.spec.service.port,
                },
            )
        }))
        .collect()
}

/// Experiment route with the baseline at 100
///
/// With match clauses, unmatched requests fall through to a base route that
/// also sends everything to the baseline.
pub fn baseline_routes(handler: &dyn DestinationHandler, exp: &Experiment) -> Vec<HttpRoute> {
    let baseline = baseline_destination(handler, exp);
    let matches = exp.http_matches();

    let mut routes = vec![named_route(EXPERIMENT_ROUTE, matches, vec![baseline.clone()])];
    if !matches.is_empty() {
        routes.push(named_route(BASE_ROUTE, &[], vec![baseline]));
    }
    routes
}
