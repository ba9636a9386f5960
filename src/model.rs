//! Fabric Intent Model
//!
//! Desired state as materialized by the intent store: network domains,
//! subnets, routes, gateways, routing hubs and security rule sets.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Largest 24-bit overlay segment ID
pub const MAX_SEGMENT_ID: u32 = 16_777_215;

/// Default route priority (installed as metric)
pub const DEFAULT_ROUTE_PRIORITY: u32 = 100;

/// Isolation mode of a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Not yet resolved against the host capability
    #[default]
    Unset,
    /// One VRF device per domain
    Native,
    /// Packet-filter rules per domain pair
    Fallback,
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IsolationMode::Unset => "unset",
            IsolationMode::Native => "native",
            IsolationMode::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

/// Isolated network domain (VPC)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDomain {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub secondary_cidrs: Vec<String>,
    /// Overlay VNI
    pub segment_id: u32,
    #[serde(default)]
    pub isolation: IsolationMode,
    #[serde(default)]
    pub region: String,
    /// Explicitly peered domain IDs
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub version: String,
}

impl NetworkDomain {
    pub fn cidrs(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.cidr.as_str()).chain(self.secondary_cidrs.iter().map(String::as_str))
    }

    /// Primary and secondary CIDRs, normalized to their network address
    pub fn networks(&self) -> Result<Vec<IpNetwork>, ModelError> {
        self.cidrs().map(parse_network).collect()
    }
}

/// Subnet within a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub domain_id: String,
    pub cidr: String,
    /// Availability zone
    #[serde(default)]
    pub placement: String,
    /// Gateway address, first host of the CIDR when absent
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub version: String,
}

impl Subnet {
    /// Gateway address with the subnet prefix, as assigned to the segment device
    pub fn gateway_address(&self) -> Result<IpNetwork, ModelError> {
        let network = parse_network(&self.cidr)?;
        let address = match self.gateway {
            Some(addr) => {
                if !network.contains(addr) {
                    return Err(ModelError::GatewayOutsideSubnet {
                        gateway: addr.to_string(),
                        cidr: self.cidr.clone(),
                    });
                }
                addr
            }
            None => first_host(&network),
        };
        IpNetwork::new(address, network.prefix())
            .map_err(|e| ModelError::InvalidCidr(self.cidr.clone(), e.to_string()))
    }
}

/// Next hop reference kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextHopKind {
    Gateway,
    Domain,
    Hub,
    Address,
}

/// Route in a domain's routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub domain_id: String,
    pub destination: String,
    pub next_hop: String,
    pub next_hop_kind: NextHopKind,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub version: String,
}

fn default_priority() -> u32 {
    DEFAULT_ROUTE_PRIORITY
}

/// Gateway kind with its kind-specific parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayKind {
    Internet {
        /// Uplink interface, host default when absent
        #[serde(default)]
        uplink: Option<String>,
    },
    Nat {
        public_ip: IpAddr,
        #[serde(default)]
        private_ip: Option<IpAddr>,
    },
    Vpn {
        endpoint: String,
        #[serde(default)]
        allowed_ips: Vec<String>,
    },
    Mesh {
        node_key: String,
        #[serde(default)]
        tailnet: String,
    },
}

impl GatewayKind {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayKind::Internet { .. } => "internet",
            GatewayKind::Nat { .. } => "nat",
            GatewayKind::Vpn { .. } => "vpn",
            GatewayKind::Mesh { .. } => "mesh",
        }
    }
}

/// Egress/ingress gateway attached to a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: String,
    pub domain_id: String,
    #[serde(flatten)]
    pub kind: GatewayKind,
    #[serde(default)]
    pub version: String,
}

/// Cloud routing hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hub {
    pub id: String,
    /// Attachment address used as next hop
    pub address: IpAddr,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    All,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::All => "all",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub direction: Direction,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub ports: Option<PortRange>,
    pub cidr: String,
    pub action: RuleAction,
}

/// Ordered security rules applied to a set of instance addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRuleSet {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub rules: Vec<SecurityRule>,
    #[serde(default)]
    pub attachments: Vec<IpAddr>,
    #[serde(default)]
    pub version: String,
}

/// Fully materialized desired state for one scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub domains: Vec<NetworkDomain>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
    #[serde(default)]
    pub hubs: Vec<Hub>,
    #[serde(default)]
    pub security_rule_sets: Vec<SecurityRuleSet>,
}

impl DesiredState {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Default::default()
        }
    }

    pub fn domain(&self, id: &str) -> Option<&NetworkDomain> {
        self.domains.iter().find(|d| d.id == id)
    }

    pub fn gateway(&self, id: &str) -> Option<&Gateway> {
        self.gateways.iter().find(|g| g.id == id)
    }

    pub fn hub(&self, id: &str) -> Option<&Hub> {
        self.hubs.iter().find(|h| h.id == id)
    }

    /// Peering is explicit on either side
    pub fn peered(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        let declares = |from: &str, to: &str| {
            self.domain(from)
                .map(|d| d.peers.iter().any(|p| p == to))
                .unwrap_or(false)
        };
        declares(a, b) || declares(b, a)
    }

    /// Stamp every domain with the host's effective isolation mode
    pub fn with_isolation(mut self, mode: IsolationMode) -> Self {
        for domain in &mut self.domains {
            domain.isolation = mode;
        }
        self
    }
}

/// Resource kinds in reconciliation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Domain,
    Gateway,
    Subnet,
    Route,
    SecurityRuleSet,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Domain => "domain",
            ResourceKind::Gateway => "gateway",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Route => "route",
            ResourceKind::SecurityRuleSet => "security_rule_set",
        };
        f.write_str(s)
    }
}

/// Typed reference to a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn domain(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Domain, id)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Model validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("invalid CIDR {0}: {1}")]
    InvalidCidr(String, String),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("gateway {gateway} outside subnet {cidr}")]
    GatewayOutsideSubnet { gateway: String, cidr: String },
}

/// Parse a CIDR and normalize it to its network address
pub fn parse_network(cidr: &str) -> Result<IpNetwork, ModelError> {
    let parsed: IpNetwork = cidr
        .trim()
        .parse()
        .map_err(|e: ipnetwork::IpNetworkError| ModelError::InvalidCidr(cidr.to_string(), e.to_string()))?;
    IpNetwork::new(parsed.network(), parsed.prefix())
        .map_err(|e| ModelError::InvalidCidr(cidr.to_string(), e.to_string()))
}

/// `inner` lies entirely within `outer`
pub fn network_within(inner: &IpNetwork, outer: &IpNetwork) -> bool {
    inner.is_ipv4() == outer.is_ipv4()
        && inner.prefix() >= outer.prefix()
        && outer.contains(inner.network())
}

/// Address families match and ranges intersect
pub fn networks_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    network_within(a, b) || network_within(b, a)
}

fn first_host(network: &IpNetwork) -> IpAddr {
    match network {
        IpNetwork::V4(net) => {
            let base = u32::from(net.network());
            let host = if net.prefix() >= 31 { base } else { base.saturating_add(1) };
            IpAddr::V4(host.into())
        }
        IpNetwork::V6(net) => {
            let base = u128::from(net.network());
            let host = if net.prefix() >= 127 { base } else { base.saturating_add(1) };
            IpAddr::V6(host.into())
        }
    }
}
