//! Kernel Realization
//!
//! Maps desired resources onto the kernel objects that realize them: device
//! names, tables, addresses, routes and tagged packet-filter rules. Diff
//! compares these against discovery; enforcement applies them.

use ipnetwork::IpNetwork;
use serde::Serialize;
use std::net::IpAddr;

use crate::config::LayoutConfig;
use crate::kernel::{
    Family, FirewallRule, FirewallTable, GatewayLinkSpec, KernelRoute, PolicyRule, SegmentSpec,
};
use crate::model::{
    network_within, parse_network, DesiredState, Direction, Gateway, GatewayKind, IsolationMode,
    ModelError, NetworkDomain, NextHopKind, Protocol, Route, RuleAction, SecurityRuleSet, Subnet,
    MAX_SEGMENT_ID,
};
use crate::naming::{self, fingerprint, Tag};

/// Why a desired resource cannot be realized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("invalid resource id {0:?}")]
    InvalidId(String),

    #[error("segment id {0} out of range")]
    SegmentOutOfRange(u32),

    #[error("segment id {segment_id} already used by domain {owner}")]
    DuplicateSegment { segment_id: u32, owner: String },

    #[error("unknown domain {0}")]
    UnknownDomain(String),

    #[error("subnet {cidr} is outside domain {domain}")]
    SubnetOutsideDomain { cidr: String, domain: String },

    #[error("{what} already declared by {owner}")]
    Duplicate { what: String, owner: String },

    #[error("next hop {0} does not exist")]
    DanglingNextHop(String),

    #[error("next hop {0} is not in the route's domain or a peered domain")]
    NonPeeredNextHop(String),

    #[error("destination {destination} lies inside non-peered domain {domain}")]
    IsolationViolation { destination: String, domain: String },

    #[error("invalid security rule {index}: {reason}")]
    InvalidRule { index: usize, reason: String },
}

/// Realized domain: segment, optional VRF, fallback bindings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainPlan {
    pub id: String,
    pub fingerprint: String,
    pub mode: IsolationMode,
    pub table: u32,
    /// VRF device (native mode)
    pub vrf: Option<String>,
    pub segment: SegmentSpec,
    /// Table bindings (fallback mode)
    pub policy_rules: Vec<PolicyRule>,
    /// Isolation rule sets per non-peered domain (fallback mode)
    pub counterparts: Vec<Counterpart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counterpart {
    pub id: String,
    pub fingerprint: String,
    pub rules: Vec<FirewallRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayPlan {
    pub id: String,
    pub domain_id: String,
    pub fingerprint: String,
    pub link: GatewayLinkSpec,
    /// NAT rules
    pub translation: Vec<FirewallRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubnetPlan {
    pub id: String,
    pub domain_id: String,
    pub device: String,
    pub address: IpNetwork,
}

impl SubnetPlan {
    /// Network the address lives in
    pub fn network(&self) -> IpNetwork {
        IpNetwork::new(self.address.network(), self.address.prefix()).unwrap_or(self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutePlan {
    pub id: String,
    pub domain_id: String,
    pub route: KernelRoute,
    /// Gateway the route egresses through
    pub via_gateway: Option<String>,
    /// Peer domain the route egresses through
    pub via_domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSetPlan {
    pub id: String,
    pub fingerprint: String,
    pub rules: Vec<FirewallRule>,
}

/// Rule shape without its tag, for fingerprinting
#[derive(Serialize)]
struct RuleShape<'a> {
    family: Family,
    table: FirewallTable,
    chain: &'a str,
    matches: &'a [String],
    target: &'a [String],
}

fn shapes(rules: &[FirewallRule]) -> Vec<RuleShape<'_>> {
    rules
        .iter()
        .map(|r| RuleShape {
            family: r.family,
            table: r.table,
            chain: &r.chain,
            matches: &r.matches,
            target: &r.target,
        })
        .collect()
}

fn untagged(family: Family, table: FirewallTable, chain: &str, matches: Vec<String>, target: Vec<String>) -> FirewallRule {
    FirewallRule {
        family,
        table,
        chain: chain.to_string(),
        matches,
        target,
        tag: String::new(),
    }
}

fn host_network(addr: IpAddr) -> IpNetwork {
    IpNetwork::from(addr)
}

fn family_of_addr(addr: &IpAddr) -> Family {
    if addr.is_ipv4() {
        Family::V4
    } else {
        Family::V6
    }
}

pub fn check_id(id: &str) -> Result<(), ValidationError> {
    if naming::is_tag_safe(id) {
        Ok(())
    } else {
        Err(ValidationError::InvalidId(id.to_string()))
    }
}

/// Realizes desired resources for one host isolation mode
pub struct Realizer<'a> {
    layout: &'a LayoutConfig,
    mode: IsolationMode,
}

impl<'a> Realizer<'a> {
    pub fn new(layout: &'a LayoutConfig, mode: IsolationMode) -> Self {
        let mode = match mode {
            IsolationMode::Unset => IsolationMode::Fallback,
            mode => mode,
        };
        Self { layout, mode }
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    pub fn table_base(&self) -> u32 {
        self.layout.table_base
    }

    pub fn table(&self, domain: &NetworkDomain) -> u32 {
        naming::domain_table(self.layout.table_base, domain.segment_id)
    }

    /// Static checks of a domain on its own
    pub fn validate_domain(&self, domain: &NetworkDomain) -> Result<Vec<IpNetwork>, ValidationError> {
        check_id(&domain.id)?;
        if domain.segment_id == 0 || domain.segment_id > MAX_SEGMENT_ID {
            return Err(ValidationError::SegmentOutOfRange(domain.segment_id));
        }
        Ok(domain.networks()?)
    }

    /// `counterparts` are the valid, non-peered domains of the same scope
    pub fn domain(
        &self,
        domain: &NetworkDomain,
        counterparts: &[&NetworkDomain],
    ) -> Result<DomainPlan, ValidationError> {
        let networks = self.validate_domain(domain)?;
        let table = self.table(domain);
        let native = self.mode == IsolationMode::Native;

        let fingerprint = fingerprint(&(
            &networks,
            domain.segment_id,
            self.layout.vxlan_port,
            self.layout.vxlan_local,
            self.mode,
            table,
        ));
        let vrf = native.then(|| naming::vrf_device(&domain.id));

        let segment = SegmentSpec {
            name: naming::segment_device(&domain.id),
            vni: domain.segment_id,
            port: self.layout.vxlan_port,
            local: self.layout.vxlan_local,
            master: vrf.clone(),
            alias: Tag::Domain {
                id: domain.id.clone(),
                fingerprint: fingerprint.clone(),
            }
            .to_string(),
        };

        let (policy_rules, counterparts) = if native {
            (Vec::new(), Vec::new())
        } else {
            let policy_rules = networks
                .iter()
                .map(|net| PolicyRule {
                    source: *net,
                    table,
                    priority: self.layout.policy_priority,
                })
                .collect();

            let mut pairs = Vec::new();
            for other in counterparts {
                let other_networks = other.networks()?;
                pairs.push(pair_isolation(&domain.id, &networks, &other.id, &other_networks));
            }
            pairs.sort_by(|a, b| a.id.cmp(&b.id));
            (policy_rules, pairs)
        };

        Ok(DomainPlan {
            id: domain.id.clone(),
            fingerprint,
            mode: self.mode,
            table,
            vrf,
            segment,
            policy_rules,
            counterparts,
        })
    }

    pub fn gateway(&self, gateway: &Gateway, desired: &DesiredState) -> Result<GatewayPlan, ValidationError> {
        check_id(&gateway.id)?;
        let domain = desired
            .domain(&gateway.domain_id)
            .ok_or_else(|| ValidationError::UnknownDomain(gateway.domain_id.clone()))?;
        let networks = domain.networks()?;

        let master = (self.mode == IsolationMode::Native).then(|| naming::vrf_device(&domain.id));
        let mut rules = Vec::new();
        match &gateway.kind {
            GatewayKind::Nat { public_ip, private_ip } => {
                let family = family_of_addr(public_ip);
                match private_ip {
                    Some(private_ip) => {
                        if family_of_addr(private_ip) != family {
                            return Err(ModelError::InvalidAddress(private_ip.to_string()).into());
                        }
                        rules.push(untagged(
                            family,
                            FirewallTable::Nat,
                            "POSTROUTING",
                            vec!["-s".into(), host_network(*private_ip).to_string()],
                            vec!["SNAT".into(), "--to-source".into(), public_ip.to_string()],
                        ));
                        rules.push(untagged(
                            family,
                            FirewallTable::Nat,
                            "PREROUTING",
                            vec!["-d".into(), host_network(*public_ip).to_string()],
                            vec!["DNAT".into(), "--to-destination".into(), private_ip.to_string()],
                        ));
                    }
                    None => {
                        for net in networks.iter().filter(|n| Family::of(n) == family) {
                            rules.push(untagged(
                                family,
                                FirewallTable::Nat,
                                "POSTROUTING",
                                vec!["-s".into(), net.to_string()],
                                vec!["SNAT".into(), "--to-source".into(), public_ip.to_string()],
                            ));
                        }
                    }
                }
            }
            GatewayKind::Internet { uplink } => {
                let uplink = uplink.as_deref().unwrap_or(&self.layout.uplink);
                for net in &networks {
                    rules.push(untagged(
                        Family::of(net),
                        FirewallTable::Nat,
                        "POSTROUTING",
                        vec!["-s".into(), net.to_string(), "-o".into(), uplink.to_string()],
                        vec!["MASQUERADE".into()],
                    ));
                }
            }
            GatewayKind::Vpn { .. } | GatewayKind::Mesh { .. } => {}
        }

        let name = naming::gateway_device(&gateway.id);
        let fingerprint = fingerprint(&(&gateway.kind, &name, &master, shapes(&rules)));
        let total = rules.len();
        for (index, rule) in rules.iter_mut().enumerate() {
            rule.tag = Tag::Gateway {
                id: gateway.id.clone(),
                fingerprint: fingerprint.clone(),
                index,
                total,
            }
            .to_string();
        }

        Ok(GatewayPlan {
            id: gateway.id.clone(),
            domain_id: domain.id.clone(),
            link: GatewayLinkSpec {
                name,
                master,
                alias: Tag::GatewayLink {
                    id: gateway.id.clone(),
                    fingerprint: fingerprint.clone(),
                }
                .to_string(),
            },
            fingerprint,
            translation: rules,
        })
    }

    pub fn subnet(&self, subnet: &Subnet, desired: &DesiredState) -> Result<SubnetPlan, ValidationError> {
        check_id(&subnet.id)?;
        let domain = desired
            .domain(&subnet.domain_id)
            .ok_or_else(|| ValidationError::UnknownDomain(subnet.domain_id.clone()))?;
        let network = parse_network(&subnet.cidr)?;
        let inside = domain
            .networks()?
            .iter()
            .any(|parent| network_within(&network, parent));
        if !inside {
            return Err(ValidationError::SubnetOutsideDomain {
                cidr: subnet.cidr.clone(),
                domain: domain.id.clone(),
            });
        }

        Ok(SubnetPlan {
            id: subnet.id.clone(),
            domain_id: domain.id.clone(),
            device: naming::segment_device(&domain.id),
            address: subnet.gateway_address()?,
        })
    }

    pub fn route(&self, route: &Route, desired: &DesiredState) -> Result<RoutePlan, ValidationError> {
        let domain = desired
            .domain(&route.domain_id)
            .ok_or_else(|| ValidationError::UnknownDomain(route.domain_id.clone()))?;
        let destination = parse_network(&route.destination)?;

        for other in &desired.domains {
            if desired.peered(&domain.id, &other.id) {
                continue;
            }
            let Ok(networks) = other.networks() else {
                continue;
            };
            if networks.iter().any(|net| network_within(&destination, net)) {
                return Err(ValidationError::IsolationViolation {
                    destination: route.destination.clone(),
                    domain: other.id.clone(),
                });
            }
        }

        let mut via_gateway = None;
        let mut via_domain = None;
        let (via, dev) = match route.next_hop_kind {
            NextHopKind::Gateway => {
                let gateway = desired
                    .gateway(&route.next_hop)
                    .ok_or_else(|| ValidationError::DanglingNextHop(route.next_hop.clone()))?;
                if !desired.peered(&domain.id, &gateway.domain_id) {
                    return Err(ValidationError::NonPeeredNextHop(route.next_hop.clone()));
                }
                via_gateway = Some(gateway.id.clone());
                (None, Some(naming::gateway_device(&gateway.id)))
            }
            NextHopKind::Domain => {
                let peer = desired
                    .domain(&route.next_hop)
                    .ok_or_else(|| ValidationError::DanglingNextHop(route.next_hop.clone()))?;
                if peer.id == domain.id || !desired.peered(&domain.id, &peer.id) {
                    return Err(ValidationError::NonPeeredNextHop(route.next_hop.clone()));
                }
                via_domain = Some(peer.id.clone());
                (None, Some(naming::segment_device(&peer.id)))
            }
            NextHopKind::Hub => {
                let hub = desired
                    .hub(&route.next_hop)
                    .ok_or_else(|| ValidationError::DanglingNextHop(route.next_hop.clone()))?;
                (Some(hub.address), None)
            }
            NextHopKind::Address => {
                let addr: IpAddr = route
                    .next_hop
                    .parse()
                    .map_err(|_| ModelError::InvalidAddress(route.next_hop.clone()))?;
                (Some(addr), None)
            }
        };

        if let Some(via) = via {
            if family_of_addr(&via) != Family::of(&destination) {
                return Err(ModelError::InvalidAddress(via.to_string()).into());
            }
        }

        Ok(RoutePlan {
            id: route.id.clone(),
            domain_id: domain.id.clone(),
            route: KernelRoute {
                table: self.table(domain),
                destination,
                via,
                dev,
                metric: Some(route.priority),
                protocol: self.layout.route_protocol,
            },
            via_gateway,
            via_domain,
        })
    }

    pub fn rule_set(&self, set: &SecurityRuleSet) -> Result<RuleSetPlan, ValidationError> {
        check_id(&set.id)?;
        let mut rules = Vec::new();

        for attachment in &set.attachments {
            let host = host_network(*attachment).to_string();
            for (index, rule) in set.rules.iter().enumerate() {
                let peer = parse_network(&rule.cidr)?;
                if Family::of(&peer) != family_of_addr(attachment) {
                    continue;
                }

                let (own, other) = match rule.direction {
                    Direction::Ingress => ("-d", "-s"),
                    Direction::Egress => ("-s", "-d"),
                };
                let mut matches = vec![own.to_string(), host.clone(), other.to_string(), peer.to_string()];
                if rule.protocol != Protocol::All {
                    matches.extend(["-p".to_string(), rule.protocol.as_str().to_string()]);
                }
                if let Some(ports) = rule.ports {
                    if !matches!(rule.protocol, Protocol::Tcp | Protocol::Udp) {
                        return Err(ValidationError::InvalidRule {
                            index,
                            reason: "port range requires tcp or udp".into(),
                        });
                    }
                    if ports.from > ports.to {
                        return Err(ValidationError::InvalidRule {
                            index,
                            reason: format!("empty port range {}-{}", ports.from, ports.to),
                        });
                    }
                    let dport = if ports.from == ports.to {
                        ports.from.to_string()
                    } else {
                        format!("{}:{}", ports.from, ports.to)
                    };
                    matches.extend(["--dport".to_string(), dport]);
                }
                let target = match rule.action {
                    RuleAction::Allow => "ACCEPT",
                    RuleAction::Deny => "DROP",
                };
                rules.push(untagged(
                    family_of_addr(attachment),
                    FirewallTable::Filter,
                    "FORWARD",
                    matches,
                    vec![target.to_string()],
                ));
            }
        }

        let fingerprint = fingerprint(&shapes(&rules));
        let total = rules.len();
        for (index, rule) in rules.iter_mut().enumerate() {
            rule.tag = Tag::RuleSet {
                id: set.id.clone(),
                fingerprint: fingerprint.clone(),
                index,
                total,
            }
            .to_string();
        }

        Ok(RuleSetPlan {
            id: set.id.clone(),
            fingerprint,
            rules,
        })
    }
}

/// Symmetric REJECT rules between two domains, identical from either side
pub fn pair_isolation(a: &str, a_nets: &[IpNetwork], b: &str, b_nets: &[IpNetwork]) -> Counterpart {
    let ((low, low_nets), (high, high_nets)) = if a <= b {
        ((a, a_nets), (b, b_nets))
    } else {
        ((b, b_nets), (a, a_nets))
    };

    let mut rules = Vec::new();
    for x in low_nets {
        for y in high_nets.iter().filter(|y| Family::of(y) == Family::of(x)) {
            for chain in ["FORWARD", "INPUT"] {
                for (src, dst) in [(x, y), (y, x)] {
                    rules.push(untagged(
                        Family::of(x),
                        FirewallTable::Filter,
                        chain,
                        vec!["-s".into(), src.to_string(), "-d".into(), dst.to_string()],
                        vec!["REJECT".into()],
                    ));
                }
            }
        }
    }

    let fingerprint = fingerprint(&(low, low_nets, high, high_nets));
    let total = rules.len();
    for (index, rule) in rules.iter_mut().enumerate() {
        rule.tag = Tag::isolation(low, high, &fingerprint, index, total).to_string();
    }

    let counterpart = if a == low { high } else { low };
    Counterpart {
        id: counterpart.to_string(),
        fingerprint,
        rules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortRange, SecurityRule};

    fn domain(id: &str, cidr: &str, vni: u32) -> NetworkDomain {
        NetworkDomain {
            id: id.into(),
            name: id.into(),
            cidr: cidr.into(),
            secondary_cidrs: vec![],
            segment_id: vni,
            isolation: IsolationMode::Unset,
            region: String::new(),
            peers: vec![],
            version: String::new(),
        }
    }

    #[test]
    fn test_pair_isolation_is_symmetric() {
        let a: Vec<IpNetwork> = vec!["10.1.0.0/16".parse().unwrap(), "10.11.0.0/16".parse().unwrap()];
        let b: Vec<IpNetwork> = vec!["10.2.0.0/16".parse().unwrap()];

        let from_a = pair_isolation("d1", &a, "d2", &b);
        let from_b = pair_isolation("d2", &b, "d1", &a);
        assert_eq!(from_a.id, "d2");
        assert_eq!(from_b.id, "d1");
        assert_eq!(from_a.fingerprint, from_b.fingerprint);
        assert_eq!(from_a.rules, from_b.rules);
        // 2 x 1 CIDR combinations, both chains, both directions
        assert_eq!(from_a.rules.len(), 8);
    }

    #[test]
    fn test_domain_plan_by_mode() {
        let layout = LayoutConfig::default();
        let d1 = domain("d1", "10.1.0.0/16", 100);
        let d2 = domain("d2", "10.2.0.0/16", 200);

        let native = Realizer::new(&layout, IsolationMode::Native)
            .domain(&d1, &[&d2])
            .unwrap();
        assert_eq!(native.table, 10100);
        assert!(native.vrf.is_some());
        assert_eq!(native.segment.master, native.vrf);
        assert!(native.counterparts.is_empty());

        let fallback = Realizer::new(&layout, IsolationMode::Fallback)
            .domain(&d1, &[&d2])
            .unwrap();
        assert!(fallback.vrf.is_none());
        assert_eq!(fallback.policy_rules.len(), 1);
        assert_eq!(fallback.counterparts.len(), 1);
        assert_ne!(native.fingerprint, fallback.fingerprint);

        let bad = domain("d3", "10.3.0.0/16", 0);
        assert_eq!(
            Realizer::new(&layout, IsolationMode::Native).domain(&bad, &[]),
            Err(ValidationError::SegmentOutOfRange(0))
        );
    }

    #[test]
    fn test_route_validation() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Native);
        let mut desired = DesiredState::new("default");
        desired.domains.push(domain("d1", "10.1.0.0/16", 100));
        desired.domains.push(domain("d2", "10.2.0.0/16", 200));
        desired.gateways.push(Gateway {
            id: "g2".into(),
            domain_id: "d2".into(),
            kind: GatewayKind::Internet { uplink: None },
            version: String::new(),
        });

        let route = |dest: &str, hop: &str, kind| Route {
            id: "r1".into(),
            domain_id: "d1".into(),
            destination: dest.into(),
            next_hop: hop.into(),
            next_hop_kind: kind,
            priority: 100,
            version: String::new(),
        };

        assert!(matches!(
            realizer.route(&route("0.0.0.0/0", "g9", NextHopKind::Gateway), &desired),
            Err(ValidationError::DanglingNextHop(_))
        ));
        assert!(matches!(
            realizer.route(&route("0.0.0.0/0", "g2", NextHopKind::Gateway), &desired),
            Err(ValidationError::NonPeeredNextHop(_))
        ));
        assert!(matches!(
            realizer.route(&route("10.2.5.0/24", "192.0.2.1", NextHopKind::Address), &desired),
            Err(ValidationError::IsolationViolation { .. })
        ));

        let plan = realizer
            .route(&route("0.0.0.0/0", "192.0.2.1", NextHopKind::Address), &desired)
            .unwrap();
        assert_eq!(plan.route.table, 10100);
        assert_eq!(plan.route.metric, Some(100));

        desired.domains[0].peers.push("d2".into());
        let plan = realizer
            .route(&route("0.0.0.0/0", "g2", NextHopKind::Gateway), &desired)
            .unwrap();
        assert_eq!(plan.via_gateway.as_deref(), Some("g2"));
        assert_eq!(plan.route.dev, Some(naming::gateway_device("g2")));
    }

    #[test]
    fn test_rule_set_rendering() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Fallback);
        let set = SecurityRuleSet {
            id: "web".into(),
            name: "web".into(),
            rules: vec![
                SecurityRule {
                    direction: Direction::Ingress,
                    protocol: Protocol::Tcp,
                    ports: Some(PortRange { from: 443, to: 443 }),
                    cidr: "0.0.0.0/0".into(),
                    action: RuleAction::Allow,
                },
                SecurityRule {
                    direction: Direction::Egress,
                    protocol: Protocol::All,
                    ports: None,
                    cidr: "10.9.0.0/16".into(),
                    action: RuleAction::Deny,
                },
            ],
            attachments: vec!["10.1.1.10".parse().unwrap()],
            version: String::new(),
        };

        let plan = realizer.rule_set(&set).unwrap();
        assert_eq!(plan.rules.len(), 2);
        assert_eq!(
            plan.rules[0].matches,
            vec!["-d", "10.1.1.10/32", "-s", "0.0.0.0/0", "-p", "tcp", "--dport", "443"]
        );
        assert_eq!(plan.rules[1].target, vec!["DROP"]);
        assert!(plan.rules[1].tag.ends_with(":1/2"));

        let mut bad = set.clone();
        bad.rules[1].ports = Some(PortRange { from: 1, to: 2 });
        assert!(matches!(realizer.rule_set(&bad), Err(ValidationError::InvalidRule { index: 1, .. })));
    }

    #[test]
    fn test_subnet_outside_domain() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Native);
        let mut desired = DesiredState::new("default");
        desired.domains.push(domain("d1", "10.1.0.0/16", 100));
        let subnet = Subnet {
            id: "s1".into(),
            domain_id: "d1".into(),
            cidr: "10.9.1.0/24".into(),
            placement: String::new(),
            gateway: None,
            version: String::new(),
        };
        assert!(matches!(
            realizer.subnet(&subnet, &desired),
            Err(ValidationError::SubnetOutsideDomain { .. })
        ));
    }
}
