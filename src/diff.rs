//! Diff Engine
//!
//! Pure comparison of desired against observed state. Emits an ordered
//! `ActionPlan`: deletions first (routes, security rules, subnets, gateways,
//! domains), then creations and updates in the reverse dependency order.
//! Ties are broken by resource ID.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::discovery::{route_key, subnet_key, ObservedDomain, ObservedGateway, ObservedState};
use crate::kernel::KernelRoute;
use crate::model::{DesiredState, IsolationMode, NetworkDomain, ResourceKind, ResourceRef};
use crate::naming;
use crate::realize::{
    DomainPlan, GatewayPlan, Realizer, RoutePlan, RuleSetPlan, SubnetPlan, ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Devices and bindings of a domain being torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRemoval {
    pub id: String,
    pub segment: String,
    pub vrf: String,
    /// Known when the segment (and so its VNI) was observed
    pub table: Option<u32>,
}

/// Kernel objects to tear down for a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    Domain(DomainRemoval),
    Gateway {
        id: String,
        link: String,
    },
    Subnet {
        device: String,
        address: ipnetwork::IpNetwork,
    },
    Route(KernelRoute),
    RuleSet {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Domain(DomainPlan),
    Gateway(GatewayPlan),
    Subnet(SubnetPlan),
    Route(RoutePlan),
    RuleSet(RuleSetPlan),
    Remove(Removal),
    /// Desired resource that cannot be realized
    Invalid(ValidationError),
}

/// One step of an action plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub resource: ResourceRef,
    /// Actions sharing a chain run sequentially
    pub chain: String,
    /// Skipped when any of these failed earlier in the cycle
    pub depends_on: Vec<ResourceRef>,
    pub payload: Payload,
}

impl Action {
    /// `<action>_<resource>` label
    pub fn label(&self) -> String {
        format!("{}_{}", self.kind, self.resource.kind)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.resource)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPlan {
    pub actions: Vec<Action>,
}

impl ActionPlan {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }
}

fn delete_rank(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Route => 0,
        ResourceKind::SecurityRuleSet => 1,
        ResourceKind::Subnet => 2,
        ResourceKind::Gateway => 3,
        ResourceKind::Domain => 4,
    }
}

fn apply_rank(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Domain => 0,
        ResourceKind::Gateway => 1,
        ResourceKind::Subnet => 2,
        ResourceKind::Route => 3,
        ResourceKind::SecurityRuleSet => 4,
    }
}

/// Collects actions and orders them on completion
#[derive(Default)]
struct PlanBuilder {
    actions: Vec<Action>,
}

impl PlanBuilder {
    fn push(
        &mut self,
        kind: ActionKind,
        resource: ResourceRef,
        chain: &str,
        depends_on: Vec<ResourceRef>,
        payload: Payload,
    ) {
        self.actions.push(Action {
            kind,
            resource,
            chain: chain.to_string(),
            depends_on,
            payload,
        });
    }

    fn delete(&mut self, resource: ResourceRef, chain: &str, removal: Removal) {
        self.push(ActionKind::Delete, resource, chain, Vec::new(), Payload::Remove(removal));
    }

    /// Delete followed by create of the same resource
    fn recreate(&mut self, resource: ResourceRef, chain: &str, removal: Removal, mut depends_on: Vec<ResourceRef>, payload: Payload) {
        self.delete(resource.clone(), chain, removal);
        depends_on.push(resource.clone());
        self.push(ActionKind::Create, resource, chain, depends_on, payload);
    }

    fn invalid(&mut self, resource: ResourceRef, chain: &str, exists: bool, error: ValidationError) {
        let kind = if exists { ActionKind::Update } else { ActionKind::Create };
        self.push(kind, resource, chain, Vec::new(), Payload::Invalid(error));
    }

    fn finish(mut self) -> ActionPlan {
        // Teardown in a chain waits for the dependents removed before it
        let deletes: Vec<(String, ResourceRef)> = self
            .actions
            .iter()
            .filter(|a| a.kind == ActionKind::Delete)
            .map(|a| (a.chain.clone(), a.resource.clone()))
            .collect();
        for action in self.actions.iter_mut().filter(|a| a.kind == ActionKind::Delete) {
            let rank = delete_rank(action.resource.kind);
            for (chain, resource) in &deletes {
                if *chain == action.chain
                    && delete_rank(resource.kind) < rank
                    && !action.depends_on.contains(resource)
                {
                    action.depends_on.push(resource.clone());
                }
            }
        }

        self.actions.sort_by(|a, b| {
            let key = |action: &Action| match action.kind {
                ActionKind::Delete => (0, delete_rank(action.resource.kind)),
                _ => (1, apply_rank(action.resource.kind)),
            };
            key(a)
                .cmp(&key(b))
                .then_with(|| a.resource.id.cmp(&b.resource.id))
        });

        ActionPlan {
            actions: self.actions,
        }
    }
}

/// Compute the actions that converge `observed` onto `desired`
pub fn diff(desired: &DesiredState, observed: &ObservedState, realizer: &Realizer<'_>) -> ActionPlan {
    let mut plan = PlanBuilder::default();
    let unknown = &observed.unknown;
    let table_base = realizer.table_base();

    // Domains: validity first, since counterparts and dependents need it
    let mut domains: Vec<&NetworkDomain> = desired.domains.iter().collect();
    domains.sort_by(|a, b| a.id.cmp(&b.id));
    domains.dedup_by(|a, b| a.id == b.id);

    let mut valid: BTreeMap<&str, &NetworkDomain> = BTreeMap::new();
    let mut errors: BTreeMap<&str, ValidationError> = BTreeMap::new();
    let mut segments: BTreeMap<u32, &str> = BTreeMap::new();
    for &domain in &domains {
        if let Err(e) = realizer.validate_domain(domain) {
            errors.insert(domain.id.as_str(), e);
            continue;
        }
        if let Some(owner) = segments.get(&domain.segment_id) {
            errors.insert(
                domain.id.as_str(),
                ValidationError::DuplicateSegment {
                    segment_id: domain.segment_id,
                    owner: owner.to_string(),
                },
            );
            continue;
        }
        segments.insert(domain.segment_id, domain.id.as_str());
        valid.insert(domain.id.as_str(), domain);
    }

    let creating: BTreeSet<&str> = valid
        .keys()
        .copied()
        .filter(|id| !observed.domains.contains_key(*id))
        .collect();
    let deleting: BTreeSet<&str> = observed
        .domains
        .keys()
        .map(String::as_str)
        .filter(|id| desired.domain(id).is_none())
        .collect();

    for &domain in &domains {
        let id = domain.id.as_str();
        let exists = observed.domains.contains_key(id);
        if let Some(error) = errors.remove(id) {
            plan.invalid(ResourceRef::domain(id), id, exists, error);
            continue;
        }
        if unknown.covers_domain(id) || !valid.contains_key(id) {
            continue;
        }

        let counterparts: Vec<&NetworkDomain> = valid
            .values()
            .copied()
            .filter(|other| other.id != domain.id && !desired.peered(&domain.id, &other.id))
            .collect();
        let domain_plan = match realizer.domain(domain, &counterparts) {
            Ok(p) => p,
            Err(e) => {
                plan.invalid(ResourceRef::domain(id), id, exists, e);
                continue;
            }
        };

        match observed.domains.get(id) {
            None => plan.push(
                ActionKind::Create,
                ResourceRef::domain(id),
                id,
                Vec::new(),
                Payload::Domain(domain_plan),
            ),
            Some(current) => {
                if !domain_matches(current, &domain_plan, &creating, &deleting) {
                    plan.push(
                        ActionKind::Update,
                        ResourceRef::domain(id),
                        id,
                        Vec::new(),
                        Payload::Domain(domain_plan),
                    );
                }
            }
        }
    }

    for (id, current) in &observed.domains {
        if desired.domain(id).is_some() || unknown.covers_domain(id) {
            continue;
        }
        plan.delete(
            ResourceRef::domain(id.clone()),
            id,
            Removal::Domain(DomainRemoval {
                id: id.clone(),
                segment: naming::segment_device(id),
                vrf: naming::vrf_device(id),
                table: current
                    .segment
                    .as_ref()
                    .map(|s| naming::domain_table(table_base, s.vni)),
            }),
        );
    }

    // Gateways
    let mut recreated_gateways: BTreeSet<String> = BTreeSet::new();
    let mut gateways: Vec<_> = desired.gateways.iter().collect();
    gateways.sort_by(|a, b| a.id.cmp(&b.id));
    let mut seen = BTreeSet::new();
    for gateway in gateways {
        let resource = ResourceRef::new(ResourceKind::Gateway, gateway.id.clone());
        let chain = gateway.domain_id.as_str();
        let current = observed.gateways.get(&gateway.id);
        if !seen.insert(gateway.id.as_str()) {
            plan.invalid(
                resource,
                chain,
                current.is_some(),
                ValidationError::Duplicate {
                    what: format!("gateway {}", gateway.id),
                    owner: gateway.id.clone(),
                },
            );
            continue;
        }
        let gateway_plan = match realizer.gateway(gateway, desired) {
            Ok(p) => p,
            Err(e) => {
                plan.invalid(resource, chain, current.is_some(), e);
                continue;
            }
        };
        if unknown.covers(ResourceKind::Gateway)
            || unknown.covers_link(&gateway_plan.link.name)
            || unknown.covers_domain(chain)
        {
            continue;
        }

        let depends_on = vec![ResourceRef::domain(chain)];
        match current {
            None => plan.push(
                ActionKind::Create,
                resource,
                chain,
                depends_on,
                Payload::Gateway(gateway_plan),
            ),
            Some(current) if !gateway_matches(current, &gateway_plan) => {
                recreated_gateways.insert(gateway.id.clone());
                let removal = Removal::Gateway {
                    id: gateway.id.clone(),
                    link: gateway_plan.link.name.clone(),
                };
                plan.recreate(resource, chain, removal, depends_on, Payload::Gateway(gateway_plan));
            }
            Some(_) => {}
        }
    }

    if !unknown.covers(ResourceKind::Gateway) {
        for (id, current) in &observed.gateways {
            if desired.gateway(id).is_some() {
                continue;
            }
            let link = naming::gateway_device(id);
            if unknown.covers_link(&link) {
                continue;
            }
            let chain = observed_gateway_chain(observed, current, &link, table_base);
            plan.delete(
                ResourceRef::new(ResourceKind::Gateway, id.clone()),
                &chain,
                Removal::Gateway { id: id.clone(), link },
            );
        }
    }

    // Subnets
    let mut subnets: Vec<_> = desired.subnets.iter().collect();
    subnets.sort_by(|a, b| a.id.cmp(&b.id));
    let mut claimed: BTreeMap<String, &str> = BTreeMap::new();
    for subnet in subnets {
        let resource = ResourceRef::new(ResourceKind::Subnet, subnet.id.clone());
        let chain = subnet.domain_id.as_str();
        let subnet_plan = match realizer.subnet(subnet, desired) {
            Ok(p) => p,
            Err(e) => {
                plan.invalid(resource, chain, false, e);
                continue;
            }
        };
        let key = subnet_key(&subnet_plan.device, &subnet_plan.network());
        if let Some(owner) = claimed.get(&key) {
            plan.invalid(
                resource,
                chain,
                false,
                ValidationError::Duplicate {
                    what: format!("subnet {}", subnet.cidr),
                    owner: owner.to_string(),
                },
            );
            continue;
        }
        claimed.insert(key.clone(), subnet.id.as_str());

        if unknown.covers(ResourceKind::Subnet)
            || unknown.covers_link(&subnet_plan.device)
            || unknown.covers_domain(chain)
        {
            continue;
        }

        let depends_on = vec![ResourceRef::domain(chain)];
        match observed.subnets.get(&key) {
            None => plan.push(
                ActionKind::Create,
                resource,
                chain,
                depends_on,
                Payload::Subnet(subnet_plan),
            ),
            Some(current) if current.address != subnet_plan.address => {
                let removal = Removal::Subnet {
                    device: current.device.clone(),
                    address: current.address,
                };
                plan.recreate(resource, chain, removal, depends_on, Payload::Subnet(subnet_plan));
            }
            Some(_) => {}
        }
    }

    if !unknown.covers(ResourceKind::Subnet) {
        for (key, current) in &observed.subnets {
            if claimed.contains_key(key) || unknown.covers_link(&current.device) {
                continue;
            }
            let chain = current
                .domain_id
                .clone()
                .unwrap_or_else(|| current.device.clone());
            plan.delete(
                ResourceRef::new(ResourceKind::Subnet, key.clone()),
                &chain,
                Removal::Subnet {
                    device: current.device.clone(),
                    address: current.address,
                },
            );
        }
    }

    // Routes
    let mut routes: Vec<_> = desired.routes.iter().collect();
    routes.sort_by(|a, b| a.id.cmp(&b.id));
    let mut claimed: BTreeMap<String, &str> = BTreeMap::new();
    for route in routes {
        let resource = ResourceRef::new(ResourceKind::Route, route.id.clone());
        let chain = route.domain_id.as_str();
        let route_plan = match realizer.route(route, desired) {
            Ok(p) => p,
            Err(e) => {
                plan.invalid(resource, chain, false, e);
                continue;
            }
        };
        let key = route_key(route_plan.route.table, &route_plan.route.destination);
        if let Some(owner) = claimed.get(&key) {
            plan.invalid(
                resource,
                chain,
                false,
                ValidationError::Duplicate {
                    what: format!("route to {}", route.destination),
                    owner: owner.to_string(),
                },
            );
            continue;
        }
        claimed.insert(key.clone(), route.id.as_str());

        if unknown.covers(ResourceKind::Route) {
            continue;
        }

        let mut depends_on = vec![ResourceRef::domain(chain)];
        if let Some(gateway) = &route_plan.via_gateway {
            depends_on.push(ResourceRef::new(ResourceKind::Gateway, gateway.clone()));
        }
        if let Some(peer) = &route_plan.via_domain {
            depends_on.push(ResourceRef::domain(peer.clone()));
        }

        match observed.routes.get(&key) {
            None => plan.push(
                ActionKind::Create,
                resource,
                chain,
                depends_on,
                Payload::Route(route_plan),
            ),
            Some(current) => {
                let through_recreated = route_plan
                    .via_gateway
                    .as_ref()
                    .map(|g| recreated_gateways.contains(g))
                    .unwrap_or(false);
                if !current.route.same_path(&route_plan.route) || through_recreated {
                    plan.push(
                        ActionKind::Update,
                        resource,
                        chain,
                        depends_on,
                        Payload::Route(route_plan),
                    );
                }
            }
        }
    }

    if !unknown.covers(ResourceKind::Route) {
        for (key, current) in &observed.routes {
            if claimed.contains_key(key) {
                continue;
            }
            let chain = current
                .domain_id
                .clone()
                .unwrap_or_else(|| format!("table{}", current.route.table));
            plan.delete(
                ResourceRef::new(
                    ResourceKind::Route,
                    format!("table{}:{}", current.route.table, current.route.destination),
                ),
                &chain,
                Removal::Route(current.route.clone()),
            );
        }
    }

    // Security rule sets
    let mut sets: Vec<_> = desired.security_rule_sets.iter().collect();
    sets.sort_by(|a, b| a.id.cmp(&b.id));
    let mut seen = BTreeSet::new();
    for set in sets {
        let resource = ResourceRef::new(ResourceKind::SecurityRuleSet, set.id.clone());
        let chain = format!("sg:{}", set.id);
        let current = observed.rule_sets.get(&set.id);
        if !seen.insert(set.id.as_str()) {
            plan.invalid(
                resource,
                &chain,
                current.is_some(),
                ValidationError::Duplicate {
                    what: format!("security rule set {}", set.id),
                    owner: set.id.clone(),
                },
            );
            continue;
        }
        let set_plan = match realizer.rule_set(set) {
            Ok(p) => p,
            Err(e) => {
                plan.invalid(resource, &chain, current.is_some(), e);
                continue;
            }
        };
        if unknown.covers(ResourceKind::SecurityRuleSet) {
            continue;
        }

        match current {
            // Nothing to install and nothing installed
            None if set_plan.rules.is_empty() => {}
            None => plan.push(
                ActionKind::Create,
                resource,
                &chain,
                Vec::new(),
                Payload::RuleSet(set_plan),
            ),
            Some(current) if current.fingerprint.as_deref() != Some(set_plan.fingerprint.as_str()) => {
                let removal = Removal::RuleSet { id: set.id.clone() };
                plan.recreate(resource, &chain, removal, Vec::new(), Payload::RuleSet(set_plan));
            }
            Some(_) => {}
        }
    }

    if !unknown.covers(ResourceKind::SecurityRuleSet) {
        for id in observed.rule_sets.keys() {
            if desired.security_rule_sets.iter().any(|s| &s.id == id) {
                continue;
            }
            plan.delete(
                ResourceRef::new(ResourceKind::SecurityRuleSet, id.clone()),
                &format!("sg:{}", id),
                Removal::RuleSet { id: id.clone() },
            );
        }
    }

    plan.finish()
}

fn domain_matches(
    current: &ObservedDomain,
    plan: &DomainPlan,
    creating: &BTreeSet<&str>,
    deleting: &BTreeSet<&str>,
) -> bool {
    let Some(segment) = &current.segment else {
        return false;
    };
    if segment.vni != plan.segment.vni
        || current.fingerprint.as_deref() != Some(plan.fingerprint.as_str())
        || segment.master != plan.segment.master
    {
        return false;
    }

    match plan.mode {
        IsolationMode::Native => {
            current.isolation.native_bound
                && current.vrf.as_ref().map(|v| v.table) == Some(plan.table)
                && current.isolation.policy_sources.is_empty()
                && current.isolation.counterparts.is_empty()
                && current.isolation.incomplete.is_empty()
        }
        _ => {
            let sources: BTreeSet<String> = plan
                .policy_rules
                .iter()
                .map(|r| r.source.to_string())
                .collect();
            let expected: BTreeMap<&str, &str> = plan
                .counterparts
                .iter()
                .filter(|c| !creating.contains(c.id.as_str()))
                .map(|c| (c.id.as_str(), c.fingerprint.as_str()))
                .collect();
            let present: BTreeMap<&str, &str> = current
                .isolation
                .counterparts
                .iter()
                .filter(|(id, _)| !deleting.contains(id.as_str()) && !creating.contains(id.as_str()))
                .map(|(id, fp)| (id.as_str(), fp.as_str()))
                .collect();
            let incomplete = current
                .isolation
                .incomplete
                .iter()
                .any(|id| !deleting.contains(id.as_str()));

            current.vrf.is_none()
                && current.isolation.policy_sources == sources
                && expected == present
                && !incomplete
        }
    }
}

fn gateway_matches(current: &ObservedGateway, plan: &GatewayPlan) -> bool {
    let link_matches = current
        .link
        .as_ref()
        .map(|l| l.fingerprint == plan.fingerprint && l.master == plan.link.master)
        .unwrap_or(false);
    let translation_matches = if plan.translation.is_empty() {
        current.translation.is_none()
    } else {
        current.translation.as_ref().and_then(|t| t.as_deref()) == Some(plan.fingerprint.as_str())
    };
    link_matches && translation_matches
}

/// Owning domain of a gateway that is no longer desired
fn observed_gateway_chain(observed: &ObservedState, gateway: &ObservedGateway, link: &str, table_base: u32) -> String {
    let by_vrf = gateway
        .link
        .as_ref()
        .and_then(|l| l.master.as_deref())
        .and_then(|master| observed.domain_for_vrf(master));
    let by_route = || {
        observed
            .routes
            .values()
            .find(|r| r.route.dev.as_deref() == Some(link))
            .and_then(|r| observed.domain_for_table(r.route.table, table_base))
    };
    by_vrf
        .or_else(by_route)
        .map(str::to_string)
        .unwrap_or_else(|| format!("gateway:{}", gateway.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use crate::discovery::{IsolationView, ObservedRoute, ObservedSegment, ObservedVrf, UnknownSet};
    use crate::model::{Gateway, GatewayKind, NextHopKind, Route};

    fn domain(id: &str, cidr: &str, vni: u32) -> NetworkDomain {
        NetworkDomain {
            id: id.into(),
            name: id.into(),
            cidr: cidr.into(),
            secondary_cidrs: Vec::new(),
            segment_id: vni,
            isolation: IsolationMode::Unset,
            region: String::new(),
            peers: Vec::new(),
            version: String::new(),
        }
    }

    fn scenario() -> DesiredState {
        let mut desired = DesiredState::new("default");
        desired.domains.push(domain("d1", "10.1.0.0/16", 100));
        desired.gateways.push(Gateway {
            id: "g1".into(),
            domain_id: "d1".into(),
            kind: GatewayKind::Nat {
                public_ip: "203.0.113.10".parse().unwrap(),
                private_ip: None,
            },
            version: String::new(),
        });
        desired.routes.push(Route {
            id: "r1".into(),
            domain_id: "d1".into(),
            destination: "0.0.0.0/0".into(),
            next_hop: "g1".into(),
            next_hop_kind: NextHopKind::Gateway,
            priority: 100,
            version: String::new(),
        });
        desired
    }

    /// Observed state with `d1` fully realized in native mode
    fn observed_with_domain(realizer: &Realizer<'_>, desired: &DesiredState) -> ObservedState {
        let plan = realizer
            .domain(desired.domain("d1").unwrap(), &[])
            .unwrap();
        let mut observed = ObservedState::default();
        observed.domains.insert(
            "d1".into(),
            ObservedDomain {
                id: "d1".into(),
                fingerprint: Some(plan.fingerprint.clone()),
                segment: Some(ObservedSegment {
                    name: plan.segment.name.clone(),
                    vni: plan.segment.vni,
                    master: plan.vrf.clone(),
                }),
                vrf: plan.vrf.clone().map(|name| ObservedVrf {
                    name,
                    table: plan.table,
                }),
                isolation: IsolationView {
                    native_bound: true,
                    ..Default::default()
                },
            },
        );
        observed
    }

    fn summary(plan: &ActionPlan) -> Vec<String> {
        plan.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_gateway_then_route() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Native);
        let desired = scenario();
        let observed = observed_with_domain(&realizer, &desired);

        let plan = diff(&desired, &observed, &realizer);
        assert_eq!(summary(&plan), vec!["create gateway/g1", "create route/r1"]);
        assert_eq!(plan.actions[1].depends_on, vec![
            ResourceRef::domain("d1"),
            ResourceRef::new(ResourceKind::Gateway, "g1"),
        ]);
        assert_eq!(plan.actions[0].label(), "create_gateway");
    }

    #[test]
    fn test_empty_node_creates_everything_in_order() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Fallback);
        let plan = diff(&scenario(), &ObservedState::default(), &realizer);
        assert_eq!(
            summary(&plan),
            vec!["create domain/d1", "create gateway/g1", "create route/r1"]
        );
        assert!(plan.iter().all(|a| a.chain == "d1"));
    }

    #[test]
    fn test_teardown_runs_routes_before_gateways() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Native);
        let desired = scenario();
        let mut observed = observed_with_domain(&realizer, &desired);
        let gateway = realizer.gateway(&desired.gateways[0], &desired).unwrap();
        let route = realizer.route(&desired.routes[0], &desired).unwrap();
        observed.gateways.insert(
            "g1".into(),
            ObservedGateway {
                id: "g1".into(),
                link: Some(crate::discovery::ObservedGatewayLink {
                    name: gateway.link.name.clone(),
                    fingerprint: gateway.fingerprint.clone(),
                    master: gateway.link.master.clone(),
                }),
                translation: Some(Some(gateway.fingerprint.clone())),
            },
        );
        observed.routes.insert(
            route_key(route.route.table, &route.route.destination),
            ObservedRoute {
                route: route.route.clone(),
                domain_id: Some("d1".into()),
            },
        );

        assert!(diff(&desired, &observed, &realizer).is_empty());

        let plan = diff(&DesiredState::new("default"), &observed, &realizer);
        assert_eq!(
            summary(&plan),
            vec!["delete route/table10100:0.0.0.0/0", "delete gateway/g1", "delete domain/d1"]
        );
        let domain_delete = &plan.actions[2];
        assert_eq!(domain_delete.depends_on.len(), 2);
    }

    #[test]
    fn test_changed_gateway_recreates_and_reapplies_routes() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Native);
        let desired = scenario();
        let mut observed = observed_with_domain(&realizer, &desired);
        let route = realizer.route(&desired.routes[0], &desired).unwrap();
        observed.gateways.insert(
            "g1".into(),
            ObservedGateway {
                id: "g1".into(),
                link: Some(crate::discovery::ObservedGatewayLink {
                    name: naming::gateway_device("g1"),
                    fingerprint: "000000000000".into(),
                    master: None,
                }),
                translation: None,
            },
        );
        observed.routes.insert(
            route_key(route.route.table, &route.route.destination),
            ObservedRoute {
                route: route.route.clone(),
                domain_id: Some("d1".into()),
            },
        );

        let plan = diff(&desired, &observed, &realizer);
        assert_eq!(
            summary(&plan),
            vec!["delete gateway/g1", "create gateway/g1", "update route/r1"]
        );
        assert!(plan.actions[1]
            .depends_on
            .contains(&ResourceRef::new(ResourceKind::Gateway, "g1")));
    }

    #[test]
    fn test_invalid_resources_become_invalid_actions() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Native);
        let mut desired = scenario();
        desired.domains.push(domain("d0", "10.0.0.0/16", 100));
        desired.routes[0].next_hop = "missing".into();

        let plan = diff(&desired, &ObservedState::default(), &realizer);
        let invalid: Vec<String> = plan
            .iter()
            .filter(|a| matches!(a.payload, Payload::Invalid(_)))
            .map(|a| a.resource.to_string())
            .collect();
        // d0 sorts first and keeps segment 100
        assert_eq!(invalid, vec!["domain/d1", "route/r1"]);
    }

    #[test]
    fn test_rule_set_without_rules_is_not_created() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Native);
        let mut desired = scenario();
        desired.security_rule_sets.push(crate::model::SecurityRuleSet {
            id: "web".into(),
            name: "web".into(),
            rules: Vec::new(),
            attachments: Vec::new(),
            version: String::new(),
        });
        let observed = observed_with_domain(&realizer, &desired);

        let plan = diff(&desired, &observed, &realizer);
        assert_eq!(summary(&plan), vec!["create gateway/g1", "create route/r1"]);
    }

    #[test]
    fn test_unknown_resources_produce_no_actions() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Native);
        let desired = scenario();
        let mut observed = ObservedState::default();
        observed.domains.insert(
            "stale".into(),
            ObservedDomain {
                id: "stale".into(),
                ..Default::default()
            },
        );
        observed.unknown = UnknownSet::default();
        observed.unknown.links.insert(naming::segment_device("stale"));
        observed.unknown.kinds.insert(ResourceKind::Route);

        // No route actions and no teardown of the unreadable domain
        let plan = diff(&desired, &observed, &realizer);
        assert_eq!(summary(&plan), vec!["create domain/d1", "create gateway/g1"]);

        // An unknown domain holds back everything realized through it
        observed.unknown.kinds.insert(ResourceKind::Domain);
        assert!(diff(&desired, &observed, &realizer).is_empty());
    }

    #[test]
    fn test_fallback_counterpart_being_created_is_not_drift() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Fallback);
        let mut desired = DesiredState::new("default");
        desired.domains.push(domain("d1", "10.1.0.0/16", 100));

        let plan = realizer.domain(&desired.domains[0], &[]).unwrap();
        let mut observed = ObservedState::default();
        observed.domains.insert(
            "d1".into(),
            ObservedDomain {
                id: "d1".into(),
                fingerprint: Some(plan.fingerprint.clone()),
                segment: Some(ObservedSegment {
                    name: plan.segment.name.clone(),
                    vni: 100,
                    master: None,
                }),
                vrf: None,
                isolation: IsolationView {
                    policy_sources: ["10.1.0.0/16".to_string()].into_iter().collect(),
                    ..Default::default()
                },
            },
        );
        assert!(diff(&desired, &observed, &realizer).is_empty());

        desired.domains.push(domain("d2", "10.2.0.0/16", 200));
        let plan = diff(&desired, &observed, &realizer);
        assert_eq!(summary(&plan), vec!["create domain/d2"]);
    }
}
