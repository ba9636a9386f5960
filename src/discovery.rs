//! State Discovery
//!
//! Reads a fabric node and maps what it finds back to resource IDs through
//! deterministic names and ownership tags. Native (VRF) and fallback (pair
//! REJECT rules + policy rule) realizations are folded into one isolation
//! view per domain. Anything that cannot be read is recorded in
//! `ObservedState::unknown` instead of being treated as absent.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::LayoutConfig;
use crate::kernel::{FirewallRule, FirewallTable, KernelDriver, KernelError, KernelRoute, LinkEntry, LinkKind};
use crate::model::ResourceKind;
use crate::naming::{self, Tag};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("link listing failed: {0}")]
    Links(#[source] KernelError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedSegment {
    pub name: String,
    pub vni: u32,
    pub master: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedVrf {
    pub name: String,
    pub table: u32,
}

/// Mode-agnostic isolation state of a domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IsolationView {
    /// VRF present, table matches, segment enslaved
    pub native_bound: bool,
    /// Sources of policy rules that look up the domain table
    pub policy_sources: BTreeSet<String>,
    /// Counterparts with a complete pair-rule set, by pair fingerprint
    pub counterparts: BTreeMap<String, String>,
    /// Counterparts with a partial or inconsistent pair-rule set
    pub incomplete: BTreeSet<String>,
}

impl IsolationView {
    pub fn policy_bound(&self) -> bool {
        !self.policy_sources.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedDomain {
    pub id: String,
    /// Fingerprint from the segment alias
    pub fingerprint: Option<String>,
    pub segment: Option<ObservedSegment>,
    pub vrf: Option<ObservedVrf>,
    pub isolation: IsolationView,
}

impl ObservedDomain {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn isolation_active(&self) -> bool {
        self.isolation.native_bound
            || (self.isolation.policy_bound() && self.isolation.incomplete.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedGatewayLink {
    pub name: String,
    pub fingerprint: String,
    pub master: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedGateway {
    pub id: String,
    pub link: Option<ObservedGatewayLink>,
    /// Fingerprint of a complete NAT rule set; `Some(None)` when rules are partial
    pub translation: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedSubnet {
    pub device: String,
    pub address: ipnetwork::IpNetwork,
    pub domain_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedRoute {
    pub route: KernelRoute,
    pub domain_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedRuleSet {
    pub id: String,
    /// Fingerprint of a complete rule set
    pub fingerprint: Option<String>,
    pub rule_count: usize,
}

/// What could not be read this cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnknownSet {
    /// Links whose attributes could not be decoded
    pub links: BTreeSet<String>,
    /// Resource kinds whose backing dumps failed
    pub kinds: BTreeSet<ResourceKind>,
}

impl UnknownSet {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.kinds.is_empty()
    }

    pub fn covers(&self, kind: ResourceKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn covers_link(&self, name: &str) -> bool {
        self.links.contains(name)
    }

    /// Domain realization cannot be judged
    pub fn covers_domain(&self, domain_id: &str) -> bool {
        self.covers(ResourceKind::Domain)
            || self.covers_link(&naming::segment_device(domain_id))
            || self.covers_link(&naming::vrf_device(domain_id))
    }
}

/// Subnet key: `<device>|<network>`
pub fn subnet_key(device: &str, network: &ipnetwork::IpNetwork) -> String {
    format!("{}|{}", device, network)
}

/// Route key: `<table>|<destination>`
pub fn route_key(table: u32, destination: &ipnetwork::IpNetwork) -> String {
    format!("{}|{}", table, destination)
}

/// Per-cycle view of the node, never persisted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedState {
    pub scope: String,
    pub domains: BTreeMap<String, ObservedDomain>,
    pub gateways: BTreeMap<String, ObservedGateway>,
    pub subnets: BTreeMap<String, ObservedSubnet>,
    pub routes: BTreeMap<String, ObservedRoute>,
    pub rule_sets: BTreeMap<String, ObservedRuleSet>,
    pub unknown: UnknownSet,
}

impl ObservedState {
    /// Domain whose segment VNI maps to `table`
    pub fn domain_for_table(&self, table: u32, table_base: u32) -> Option<&str> {
        self.domains.values().find_map(|d| {
            d.segment
                .as_ref()
                .filter(|s| naming::domain_table(table_base, s.vni) == table)
                .map(|_| d.id.as_str())
        })
    }

    /// Domain whose VRF is `name`
    pub fn domain_for_vrf(&self, name: &str) -> Option<&str> {
        self.domains
            .values()
            .find(|d| d.vrf.as_ref().map(|v| v.name.as_str()) == Some(name))
            .map(|d| d.id.as_str())
    }

    pub fn active_isolation_count(&self) -> usize {
        self.domains.values().filter(|d| d.isolation_active()).count()
    }
}

/// Tag positions of one rule group
#[derive(Default)]
struct RuleGroup {
    fingerprints: BTreeSet<String>,
    totals: BTreeSet<usize>,
    indices: Vec<usize>,
}

impl RuleGroup {
    fn add(&mut self, fingerprint: &str, index: usize, total: usize) {
        self.fingerprints.insert(fingerprint.to_string());
        self.totals.insert(total);
        self.indices.push(index);
    }

    /// Fingerprint when every position is present exactly once
    fn complete(&self) -> Option<String> {
        if self.fingerprints.len() != 1 || self.totals.len() != 1 {
            return None;
        }
        let total = *self.totals.iter().next()?;
        let mut indices = self.indices.clone();
        indices.sort_unstable();
        if indices != (0..total).collect::<Vec<_>>() {
            return None;
        }
        self.fingerprints.iter().next().cloned()
    }
}

/// Reads a node into an `ObservedState`
pub struct Discoverer {
    kernel: Arc<dyn KernelDriver>,
    layout: LayoutConfig,
}

impl Discoverer {
    pub fn new(kernel: Arc<dyn KernelDriver>, layout: LayoutConfig) -> Self {
        Self { kernel, layout }
    }

    pub async fn discover(&self, scope: &str) -> Result<ObservedState, DiscoveryError> {
        let mut observed = ObservedState {
            scope: scope.to_string(),
            ..Default::default()
        };

        let links = self.kernel.list_links().await.map_err(DiscoveryError::Links)?;
        let mut segment_owner: HashMap<String, String> = HashMap::new();
        let mut vrf_tables: HashMap<String, u32> = HashMap::new();

        for entry in links {
            let link = match entry {
                LinkEntry::Readable(link) => link,
                LinkEntry::Unreadable { name, reason } => {
                    warn!(scope = scope, link = %name, reason = %reason, "Unreadable link");
                    observed.unknown.links.insert(name);
                    continue;
                }
            };

            if link.kind == LinkKind::Vrf {
                if let Some(table) = link.vrf_table {
                    vrf_tables.insert(link.name.clone(), table);
                }
            }

            match (link.tag(), &link.kind) {
                (Some(Tag::Domain { id, fingerprint }), LinkKind::Vxlan) => {
                    segment_owner.insert(link.name.clone(), id.clone());
                    let domain = observed
                        .domains
                        .entry(id.clone())
                        .or_insert_with(|| ObservedDomain::new(&id));
                    domain.fingerprint = Some(fingerprint);
                    domain.segment = Some(ObservedSegment {
                        name: link.name.clone(),
                        vni: link.vni.unwrap_or_default(),
                        master: link.master.clone(),
                    });
                }
                (Some(Tag::Domain { id, .. }), LinkKind::Vrf) => {
                    let domain = observed
                        .domains
                        .entry(id.clone())
                        .or_insert_with(|| ObservedDomain::new(&id));
                    domain.vrf = link.vrf_table.map(|table| ObservedVrf {
                        name: link.name.clone(),
                        table,
                    });
                }
                (Some(Tag::GatewayLink { id, fingerprint }), _) => {
                    let gateway = observed
                        .gateways
                        .entry(id.clone())
                        .or_insert_with(|| ObservedGateway {
                            id: id.clone(),
                            ..Default::default()
                        });
                    gateway.link = Some(ObservedGatewayLink {
                        name: link.name.clone(),
                        fingerprint,
                        master: link.master.clone(),
                    });
                }
                _ => {}
            }
        }

        // Untagged VRF named after a tagged segment's domain
        for domain in observed.domains.values_mut() {
            if domain.vrf.is_none() {
                let name = naming::vrf_device(&domain.id);
                if let Some(table) = vrf_tables.get(&name) {
                    domain.vrf = Some(ObservedVrf { name, table: *table });
                }
            }
        }

        for domain in observed.domains.values_mut() {
            let expected_table = domain
                .segment
                .as_ref()
                .map(|s| naming::domain_table(self.layout.table_base, s.vni));
            domain.isolation.native_bound = match (&domain.vrf, &domain.segment) {
                (Some(vrf), Some(segment)) => {
                    Some(vrf.table) == expected_table && segment.master.as_deref() == Some(vrf.name.as_str())
                }
                _ => false,
            };
        }

        match self.kernel.list_addresses().await {
            Ok(addresses) => {
                for entry in addresses {
                    if !entry.device.starts_with(naming::SEGMENT_PREFIX) {
                        continue;
                    }
                    let network = ipnetwork::IpNetwork::new(entry.address.network(), entry.address.prefix())
                        .unwrap_or(entry.address);
                    observed.subnets.insert(
                        subnet_key(&entry.device, &network),
                        ObservedSubnet {
                            domain_id: segment_owner.get(&entry.device).cloned(),
                            device: entry.device,
                            address: entry.address,
                        },
                    );
                }
            }
            Err(e) => self.partial(&mut observed, &[ResourceKind::Subnet], "addresses", &e),
        }

        match self.kernel.list_routes(self.layout.route_protocol).await {
            Ok(routes) => {
                for route in routes {
                    let domain_id = observed
                        .domain_for_table(route.table, self.layout.table_base)
                        .map(str::to_string);
                    observed.routes.insert(
                        route_key(route.table, &route.destination),
                        ObservedRoute { route, domain_id },
                    );
                }
            }
            Err(e) => self.partial(&mut observed, &[ResourceKind::Route], "routes", &e),
        }

        match self.kernel.list_policy_rules().await {
            Ok(rules) => {
                for domain in observed.domains.values_mut() {
                    let Some(segment) = &domain.segment else {
                        continue;
                    };
                    let table = naming::domain_table(self.layout.table_base, segment.vni);
                    domain.isolation.policy_sources = rules
                        .iter()
                        .filter(|r| r.table == table)
                        .map(|r| r.source.to_string())
                        .collect();
                }
            }
            Err(e) => self.partial(&mut observed, &[ResourceKind::Domain], "policy rules", &e),
        }

        match self.kernel.dump_rules(FirewallTable::Filter).await {
            Ok(rules) => self.fold_filter_rules(&mut observed, &rules),
            Err(e) => self.partial(
                &mut observed,
                &[ResourceKind::Domain, ResourceKind::SecurityRuleSet],
                "filter rules",
                &e,
            ),
        }

        match self.kernel.dump_rules(FirewallTable::Nat).await {
            Ok(rules) => self.fold_nat_rules(&mut observed, &rules),
            Err(e) => self.partial(&mut observed, &[ResourceKind::Gateway], "nat rules", &e),
        }

        debug!(
            scope = scope,
            domains = observed.domains.len(),
            gateways = observed.gateways.len(),
            subnets = observed.subnets.len(),
            routes = observed.routes.len(),
            rule_sets = observed.rule_sets.len(),
            "Discovered node state"
        );
        Ok(observed)
    }

    fn partial(&self, observed: &mut ObservedState, kinds: &[ResourceKind], what: &str, error: &KernelError) {
        warn!(scope = %observed.scope, dump = what, error = %error, "Partial discovery");
        observed.unknown.kinds.extend(kinds.iter().copied());
    }

    fn fold_filter_rules(&self, observed: &mut ObservedState, rules: &[FirewallRule]) {
        let mut pairs: BTreeMap<(String, String), RuleGroup> = BTreeMap::new();
        let mut sets: BTreeMap<String, RuleGroup> = BTreeMap::new();

        for rule in rules {
            match rule.parsed_tag() {
                Some(Tag::Isolation { low, high, fingerprint, index, total }) => {
                    pairs.entry((low, high)).or_default().add(&fingerprint, index, total);
                }
                Some(Tag::RuleSet { id, fingerprint, index, total }) => {
                    sets.entry(id).or_default().add(&fingerprint, index, total);
                }
                _ => {}
            }
        }

        for ((low, high), group) in pairs {
            let complete = group.complete();
            for (this, other) in [(&low, &high), (&high, &low)] {
                let domain = observed
                    .domains
                    .entry(this.clone())
                    .or_insert_with(|| ObservedDomain::new(this));
                match &complete {
                    Some(fp) => {
                        domain.isolation.counterparts.insert(other.clone(), fp.clone());
                    }
                    None => {
                        domain.isolation.incomplete.insert(other.clone());
                    }
                }
            }
        }

        for (id, group) in sets {
            observed.rule_sets.insert(
                id.clone(),
                ObservedRuleSet {
                    id,
                    fingerprint: group.complete(),
                    rule_count: group.indices.len(),
                },
            );
        }
    }

    fn fold_nat_rules(&self, observed: &mut ObservedState, rules: &[FirewallRule]) {
        let mut groups: BTreeMap<String, RuleGroup> = BTreeMap::new();
        for rule in rules {
            if let Some(Tag::Gateway { id, fingerprint, index, total }) = rule.parsed_tag() {
                groups.entry(id).or_default().add(&fingerprint, index, total);
            }
        }

        for (id, group) in groups {
            let gateway = observed
                .gateways
                .entry(id.clone())
                .or_insert_with(|| ObservedGateway {
                    id,
                    ..Default::default()
                });
            gateway.translation = Some(group.complete());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{PolicyRule, SegmentSpec};
    use crate::realize::pair_isolation;
    use crate::sim::SimulatedKernel;

    fn segment(domain: &str, vni: u32, master: Option<String>) -> SegmentSpec {
        SegmentSpec {
            name: naming::segment_device(domain),
            vni,
            port: 4789,
            local: None,
            master,
            alias: Tag::Domain {
                id: domain.into(),
                fingerprint: "aaaaaaaaaaaa".into(),
            }
            .to_string(),
        }
    }

    #[tokio::test]
    async fn test_native_domain_is_bound() {
        let node = Arc::new(SimulatedKernel::new());
        let vrf = naming::vrf_device("d1");
        node.create_vrf(&vrf, 10100).await.unwrap();
        node.create_segment(&segment("d1", 100, Some(vrf.clone())))
            .await
            .unwrap();

        let discoverer = Discoverer::new(node.clone(), LayoutConfig::default());
        let observed = discoverer.discover("default").await.unwrap();
        let d1 = &observed.domains["d1"];
        assert_eq!(d1.vrf.as_ref().map(|v| v.table), Some(10100));
        assert!(d1.isolation.native_bound);
        assert!(d1.isolation_active());
        assert!(observed.unknown.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_pairs_fold_into_both_domains() {
        let node = Arc::new(SimulatedKernel::new());
        node.create_segment(&segment("d1", 100, None)).await.unwrap();
        node.create_segment(&segment("d2", 200, None)).await.unwrap();
        for (source, table) in [("10.1.0.0/16", 10100), ("10.2.0.0/16", 10200)] {
            node.add_policy_rule(&PolicyRule {
                source: source.parse().unwrap(),
                table,
                priority: 1000,
            })
            .await
            .unwrap();
        }

        let pair = pair_isolation(
            "d1",
            &["10.1.0.0/16".parse().unwrap()],
            "d2",
            &["10.2.0.0/16".parse().unwrap()],
        );
        for rule in &pair.rules {
            node.add_rule(rule).await.unwrap();
        }

        let discoverer = Discoverer::new(node.clone(), LayoutConfig::default());
        let observed = discoverer.discover("default").await.unwrap();
        assert_eq!(observed.domains["d1"].isolation.counterparts["d2"], pair.fingerprint);
        assert_eq!(observed.domains["d2"].isolation.counterparts["d1"], pair.fingerprint);
        assert!(observed.domains["d1"].isolation_active());

        // Losing one rule leaves the pair incomplete on both sides
        node.delete_rule(&pair.rules[2]).await.unwrap();
        let observed = discoverer.discover("default").await.unwrap();
        assert!(observed.domains["d1"].isolation.incomplete.contains("d2"));
        assert!(!observed.domains["d2"].isolation_active());
    }

    #[tokio::test]
    async fn test_unreadable_state_is_unknown() {
        let node = Arc::new(SimulatedKernel::new());
        node.create_segment(&segment("d1", 100, None)).await.unwrap();
        node.set_link_unreadable(&naming::segment_device("d1"), true);
        node.set_table_unreadable(FirewallTable::Nat, true);

        let discoverer = Discoverer::new(node.clone(), LayoutConfig::default());
        let observed = discoverer.discover("default").await.unwrap();
        assert!(observed.domains.is_empty());
        assert!(observed.unknown.covers_domain("d1"));
        assert!(!observed.unknown.covers_domain("d2"));
        assert!(observed.unknown.covers(ResourceKind::Gateway));

        node.set_link_listing_down(true);
        assert!(discoverer.discover("default").await.is_err());
    }

    #[tokio::test]
    async fn test_routes_map_to_domain_table() {
        let node = Arc::new(SimulatedKernel::new());
        node.create_segment(&segment("d1", 100, None)).await.unwrap();
        node.replace_route(&KernelRoute {
            table: 10100,
            destination: "0.0.0.0/0".parse().unwrap(),
            via: Some("192.0.2.1".parse().unwrap()),
            dev: None,
            metric: Some(100),
            protocol: 250,
        })
        .await
        .unwrap();
        // Foreign protocol
        node.replace_route(&KernelRoute {
            table: 10100,
            destination: "10.9.0.0/16".parse().unwrap(),
            via: None,
            dev: None,
            metric: None,
            protocol: 4,
        })
        .await
        .unwrap();

        let discoverer = Discoverer::new(node.clone(), LayoutConfig::default());
        let observed = discoverer.discover("default").await.unwrap();
        assert_eq!(observed.routes.len(), 1);
        let route = observed.routes.values().next().unwrap();
        assert_eq!(route.domain_id.as_deref(), Some("d1"));
    }
}
