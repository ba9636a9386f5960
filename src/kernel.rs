//! Kernel Primitive Interface
//!
//! Link, address, route, policy-rule and packet-filter primitives the
//! reconciler needs from a fabric node. `IpRouteDriver` drives a real host,
//! `SimulatedKernel` keeps the same state in memory.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

use crate::naming::{Tag, TAG_NAMESPACE};

pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Failure classes reported by kernel primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelErrorKind {
    NotSupported,
    AlreadyExists,
    NotFound,
    Busy,
    Unreachable,
    Invalid,
    Conflict,
    Io,
    Parse,
}

impl fmt::Display for KernelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelErrorKind::NotSupported => "not supported",
            KernelErrorKind::AlreadyExists => "already exists",
            KernelErrorKind::NotFound => "not found",
            KernelErrorKind::Busy => "busy",
            KernelErrorKind::Unreachable => "unreachable",
            KernelErrorKind::Invalid => "invalid argument",
            KernelErrorKind::Conflict => "conflict",
            KernelErrorKind::Io => "io",
            KernelErrorKind::Parse => "parse",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct KernelError {
    kind: KernelErrorKind,
    message: String,
}

impl KernelError {
    pub fn new(kind: KernelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> KernelErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classify a failed command by its stderr
    pub fn from_stderr(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let kind = if lower.contains("not supported")
            || lower.contains("unknown device type")
            || lower.contains("operation not supported")
        {
            KernelErrorKind::NotSupported
        } else if lower.contains("file exists") {
            KernelErrorKind::AlreadyExists
        } else if lower.contains("vni") && lower.contains("exists") {
            KernelErrorKind::Conflict
        } else if lower.contains("cannot find device")
            || lower.contains("no such")
            || lower.contains("does a matching rule exist")
        {
            KernelErrorKind::NotFound
        } else if lower.contains("resource busy")
            || lower.contains("xtables lock")
            || lower.contains("temporarily unavailable")
        {
            KernelErrorKind::Busy
        } else if lower.contains("network is unreachable") || lower.contains("timed out") {
            KernelErrorKind::Unreachable
        } else if lower.contains("invalid argument")
            || lower.contains("bad argument")
            || lower.contains("error: ")
        {
            KernelErrorKind::Invalid
        } else {
            KernelErrorKind::Io
        };
        Self::new(kind, stderr.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Vrf,
    Vxlan,
    Dummy,
    Other(String),
}

impl LinkKind {
    pub fn from_info_kind(kind: Option<&str>) -> Self {
        match kind {
            Some("vrf") => LinkKind::Vrf,
            Some("vxlan") => LinkKind::Vxlan,
            Some("dummy") => LinkKind::Dummy,
            Some(other) => LinkKind::Other(other.to_string()),
            None => LinkKind::Other(String::new()),
        }
    }
}

/// Link as read from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub kind: LinkKind,
    pub alias: Option<String>,
    pub master: Option<String>,
    /// Table of a VRF device
    pub vrf_table: Option<u32>,
    /// VNI of a VXLAN device
    pub vni: Option<u32>,
}

impl LinkInfo {
    pub fn tag(&self) -> Option<Tag> {
        self.alias.as_deref().and_then(Tag::parse)
    }
}

/// Link listing entry; attributes of some links may not be decodable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEntry {
    Readable(LinkInfo),
    Unreadable { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub device: String,
    /// Address with prefix length
    pub address: IpNetwork,
}

/// Route table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelRoute {
    pub table: u32,
    pub destination: IpNetwork,
    pub via: Option<IpAddr>,
    pub dev: Option<String>,
    pub metric: Option<u32>,
    pub protocol: u8,
}

impl KernelRoute {
    /// Same forwarding behavior, ignoring protocol
    pub fn same_path(&self, other: &KernelRoute) -> bool {
        self.table == other.table
            && self.destination == other.destination
            && self.via == other.via
            && self.dev == other.dev
            && self.metric.unwrap_or(0) == other.metric.unwrap_or(0)
    }
}

/// `from <source> lookup <table>` policy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyRule {
    pub source: IpNetwork,
    pub table: u32,
    pub priority: u32,
}

/// Overlay segment (VXLAN) parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentSpec {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub local: Option<IpAddr>,
    pub master: Option<String>,
    pub alias: String,
}

/// Gateway link parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayLinkSpec {
    pub name: String,
    pub master: Option<String>,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(net: &IpNetwork) -> Self {
        if net.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallTable {
    Filter,
    Nat,
}

impl FirewallTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallTable::Filter => "filter",
            FirewallTable::Nat => "nat",
        }
    }
}

/// Tagged packet-filter or NAT rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallRule {
    pub family: Family,
    pub table: FirewallTable,
    pub chain: String,
    /// Match arguments, e.g. `["-s", "10.1.0.0/16", "-p", "tcp"]`
    pub matches: Vec<String>,
    /// Target and its arguments, e.g. `["SNAT", "--to-source", "203.0.113.10"]`
    pub target: Vec<String>,
    pub tag: String,
}

impl FirewallRule {
    pub fn parsed_tag(&self) -> Option<Tag> {
        Tag::parse(&self.tag)
    }

    /// Arguments for `iptables`; `op` is `-A`, `-I` or `-D`
    pub fn to_args(&self, op: &str) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            self.table.as_str().to_string(),
            op.to_string(),
            self.chain.clone(),
        ];
        args.extend(self.matches.iter().cloned());
        args.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            self.tag.clone(),
        ]);
        args.push("-j".to_string());
        args.extend(self.target.iter().cloned());
        args
    }

    /// Parse one `iptables -S` line; untagged or foreign rules yield `None`
    pub fn parse_save_line(family: Family, table: FirewallTable, line: &str) -> Option<Self> {
        let tokens = tokenize(line);
        let mut iter = tokens.into_iter().peekable();
        if iter.next().as_deref() != Some("-A") {
            return None;
        }
        let chain = iter.next()?;

        let mut matches = Vec::new();
        let mut target = Vec::new();
        let mut tag = None;
        while let Some(token) = iter.next() {
            match token.as_str() {
                "-m" if iter.peek().map(String::as_str) == Some("comment") => {
                    iter.next();
                }
                "--comment" => tag = iter.next(),
                "-j" => {
                    target.extend(iter.by_ref());
                }
                _ => matches.push(token),
            }
        }

        let tag = tag?;
        if !tag.starts_with(TAG_NAMESPACE) || target.is_empty() {
            return None;
        }

        Some(Self {
            family,
            table,
            chain,
            matches,
            target,
            tag,
        })
    }
}

/// Split an `iptables -S` line, honoring double quotes
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.trim().chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => quoted = !quoted,
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Kernel and firewall primitives of a fabric node
#[async_trait]
pub trait KernelDriver: Send + Sync {
    async fn list_links(&self) -> KernelResult<Vec<LinkEntry>>;
    async fn list_addresses(&self) -> KernelResult<Vec<AddressEntry>>;
    /// Routes installed with `protocol`, across all tables
    async fn list_routes(&self, protocol: u8) -> KernelResult<Vec<KernelRoute>>;
    async fn list_policy_rules(&self) -> KernelResult<Vec<PolicyRule>>;
    /// Tagged rules of one table, both address families
    async fn dump_rules(&self, table: FirewallTable) -> KernelResult<Vec<FirewallRule>>;

    async fn create_vrf(&self, name: &str, table: u32) -> KernelResult<()>;
    async fn create_segment(&self, spec: &SegmentSpec) -> KernelResult<()>;
    async fn create_gateway_link(&self, spec: &GatewayLinkSpec) -> KernelResult<()>;
    async fn set_link_alias(&self, name: &str, alias: &str) -> KernelResult<()>;
    async fn set_link_master(&self, name: &str, master: Option<&str>) -> KernelResult<()>;
    async fn delete_link(&self, name: &str) -> KernelResult<()>;

    async fn add_address(&self, device: &str, address: IpNetwork) -> KernelResult<()>;
    async fn delete_address(&self, device: &str, address: IpNetwork) -> KernelResult<()>;

    async fn replace_route(&self, route: &KernelRoute) -> KernelResult<()>;
    async fn delete_route(&self, route: &KernelRoute) -> KernelResult<()>;

    async fn add_policy_rule(&self, rule: &PolicyRule) -> KernelResult<()>;
    async fn delete_policy_rule(&self, rule: &PolicyRule) -> KernelResult<()>;

    async fn add_rule(&self, rule: &FirewallRule) -> KernelResult<()>;
    async fn delete_rule(&self, rule: &FirewallRule) -> KernelResult<()>;
}
