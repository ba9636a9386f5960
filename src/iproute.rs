//! Host Driver (iproute2 + iptables)
//!
//! Drives the local kernel through `ip -j` and `iptables -S`. Failed commands
//! are classified from their stderr into `KernelErrorKind`s.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use tokio::process::Command;
use tracing::debug;

use crate::config::CommandPaths;
use crate::kernel::{
    AddressEntry, Family, FirewallRule, FirewallTable, GatewayLinkSpec, KernelDriver, KernelError,
    KernelErrorKind, KernelResult, KernelRoute, LinkEntry, LinkInfo, LinkKind, PolicyRule,
    SegmentSpec,
};

/// Kernel driver backed by iproute2 and iptables
pub struct IpRouteDriver {
    commands: CommandPaths,
}

impl IpRouteDriver {
    pub fn new(commands: CommandPaths) -> Self {
        Self { commands }
    }

    async fn exec(&self, program: &str, args: &[String]) -> KernelResult<String> {
        debug!(program = program, args = ?args, "exec");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| KernelError::new(KernelErrorKind::Io, format!("{}: {}", program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(KernelError::from_stderr(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    async fn ip(&self, args: &[&str]) -> KernelResult<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.exec(&self.commands.ip, &args).await
    }

    async fn ip_owned(&self, args: Vec<String>) -> KernelResult<String> {
        self.exec(&self.commands.ip, &args).await
    }

    fn iptables(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.commands.iptables,
            Family::V6 => &self.commands.ip6tables,
        }
    }

    async fn finish_link(&self, name: &str, alias: &str, master: Option<&str>) -> KernelResult<()> {
        self.set_link_alias(name, alias).await?;
        if let Some(master) = master {
            self.set_link_master(name, Some(master)).await?;
        }
        self.ip(&["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }
}

fn family_flag(net: &IpNetwork) -> &'static str {
    if net.is_ipv4() {
        "-4"
    } else {
        "-6"
    }
}

// =============================================================================
// JSON decoding
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawLink {
    ifname: String,
    #[serde(default)]
    ifalias: Option<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    linkinfo: Option<RawLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct RawLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<Value>,
}

fn json_u32(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Decode `ip -d -j link show`
pub fn parse_links(json: &str) -> KernelResult<Vec<LinkEntry>> {
    let entries: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| KernelError::new(KernelErrorKind::Parse, e.to_string()))?;

    Ok(entries.into_iter().map(decode_link).collect())
}

fn decode_link(value: Value) -> LinkEntry {
    let name = value
        .get("ifname")
        .and_then(Value::as_str)
        .unwrap_or("?")
        .to_string();

    let raw: RawLink = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            return LinkEntry::Unreadable {
                name,
                reason: e.to_string(),
            }
        }
    };

    let (kind, data) = match raw.linkinfo {
        Some(info) => (LinkKind::from_info_kind(info.info_kind.as_deref()), info.info_data),
        None => (LinkKind::from_info_kind(None), None),
    };

    let vni = json_u32(data.as_ref().and_then(|d| d.get("id")));
    let vrf_table = json_u32(data.as_ref().and_then(|d| d.get("table")));

    let missing = match kind {
        LinkKind::Vxlan if vni.is_none() => Some("vxlan without id"),
        LinkKind::Vrf if vrf_table.is_none() => Some("vrf without table"),
        _ => None,
    };
    if let Some(reason) = missing {
        return LinkEntry::Unreadable {
            name: raw.ifname,
            reason: reason.to_string(),
        };
    }

    LinkEntry::Readable(LinkInfo {
        name: raw.ifname,
        kind,
        alias: raw.ifalias,
        master: raw.master,
        vrf_table,
        vni,
    })
}

#[derive(Debug, Deserialize)]
struct RawAddrLink {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<RawAddr>,
}

#[derive(Debug, Deserialize)]
struct RawAddr {
    local: IpAddr,
    prefixlen: u8,
}

/// Decode `ip -j addr show`
pub fn parse_addresses(json: &str) -> KernelResult<Vec<AddressEntry>> {
    let links: Vec<RawAddrLink> = serde_json::from_str(json)
        .map_err(|e| KernelError::new(KernelErrorKind::Parse, e.to_string()))?;

    let mut entries = Vec::new();
    for link in links {
        for addr in link.addr_info {
            let address = IpNetwork::new(addr.local, addr.prefixlen)
                .map_err(|e| KernelError::new(KernelErrorKind::Parse, e.to_string()))?;
            entries.push(AddressEntry {
                device: link.ifname.clone(),
                address,
            });
        }
    }
    Ok(entries)
}

/// Decode `ip -j route show table all proto <n>`; routes in named tables are skipped
pub fn parse_routes(json: &str, family: Family, protocol: u8) -> KernelResult<Vec<KernelRoute>> {
    let entries: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| KernelError::new(KernelErrorKind::Parse, e.to_string()))?;

    let mut routes = Vec::new();
    for entry in entries {
        let Some(table) = json_u32(entry.get("table")) else {
            continue;
        };
        let dst = entry.get("dst").and_then(Value::as_str).unwrap_or("default");
        let destination = parse_destination(dst, family)?;
        let via = entry
            .get("gateway")
            .and_then(Value::as_str)
            .map(|g| {
                g.parse::<IpAddr>()
                    .map_err(|e| KernelError::new(KernelErrorKind::Parse, format!("{}: {}", g, e)))
            })
            .transpose()?;
        routes.push(KernelRoute {
            table,
            destination,
            via,
            dev: entry.get("dev").and_then(Value::as_str).map(str::to_string),
            metric: json_u32(entry.get("metric")),
            protocol,
        });
    }
    Ok(routes)
}

fn parse_destination(dst: &str, family: Family) -> KernelResult<IpNetwork> {
    let parsed: Result<IpNetwork, ipnetwork::IpNetworkError> = match (dst, family) {
        ("default", Family::V4) => "0.0.0.0/0".parse(),
        ("default", Family::V6) => "::/0".parse(),
        (dst, _) => dst.parse(),
    };
    parsed.map_err(|e| {
        KernelError::new(KernelErrorKind::Parse, format!("{}: {}", dst, e))
    })
}

/// Decode `ip -j rule show`; only `from <prefix> lookup <number>` rules are kept
pub fn parse_policy_rules(json: &str) -> KernelResult<Vec<PolicyRule>> {
    let entries: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| KernelError::new(KernelErrorKind::Parse, e.to_string()))?;

    let mut rules = Vec::new();
    for entry in entries {
        let (Some(src), Some(table)) = (
            entry.get("src").and_then(Value::as_str),
            json_u32(entry.get("table")),
        ) else {
            continue;
        };
        let Ok(addr) = src.parse::<IpAddr>() else {
            continue;
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = json_u32(entry.get("srclen")).unwrap_or(max) as u8;
        let source = IpNetwork::new(addr, prefix)
            .map_err(|e| KernelError::new(KernelErrorKind::Parse, e.to_string()))?;
        rules.push(PolicyRule {
            source,
            table,
            priority: json_u32(entry.get("priority")).unwrap_or(0),
        });
    }
    Ok(rules)
}

/// Decode `iptables -S` output, keeping tagged rules
pub fn parse_rule_dump(output: &str, family: Family, table: FirewallTable) -> Vec<FirewallRule> {
    output
        .lines()
        .filter_map(|line| FirewallRule::parse_save_line(family, table, line))
        .collect()
}

// =============================================================================
// Driver
// =============================================================================

#[async_trait]
impl KernelDriver for IpRouteDriver {
    async fn list_links(&self) -> KernelResult<Vec<LinkEntry>> {
        let out = self.ip(&["-d", "-j", "link", "show"]).await?;
        parse_links(&out)
    }

    async fn list_addresses(&self) -> KernelResult<Vec<AddressEntry>> {
        let out = self.ip(&["-j", "addr", "show"]).await?;
        parse_addresses(&out)
    }

    async fn list_routes(&self, protocol: u8) -> KernelResult<Vec<KernelRoute>> {
        let proto = protocol.to_string();
        let mut routes = Vec::new();
        for (flag, family) in [("-4", Family::V4), ("-6", Family::V6)] {
            let out = self
                .ip(&[flag, "-j", "route", "show", "table", "all", "proto", proto.as_str()])
                .await?;
            routes.extend(parse_routes(&out, family, protocol)?);
        }
        Ok(routes)
    }

    async fn list_policy_rules(&self) -> KernelResult<Vec<PolicyRule>> {
        let mut rules = Vec::new();
        for flag in ["-4", "-6"] {
            let out = self.ip(&[flag, "-j", "rule", "show"]).await?;
            rules.extend(parse_policy_rules(&out)?);
        }
        Ok(rules)
    }

    async fn dump_rules(&self, table: FirewallTable) -> KernelResult<Vec<FirewallRule>> {
        let mut rules = Vec::new();
        for family in [Family::V4, Family::V6] {
            let args = vec![
                "-w".to_string(),
                "-t".to_string(),
                table.as_str().to_string(),
                "-S".to_string(),
            ];
            let out = self.exec(self.iptables(family), &args).await?;
            rules.extend(parse_rule_dump(&out, family, table));
        }
        Ok(rules)
    }

    async fn create_vrf(&self, name: &str, table: u32) -> KernelResult<()> {
        let table = table.to_string();
        self.ip(&["link", "add", name, "type", "vrf", "table", table.as_str()])
            .await?;
        self.ip(&["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn create_segment(&self, spec: &SegmentSpec) -> KernelResult<()> {
        let mut args = vec![
            "link".to_string(),
            "add".to_string(),
            spec.name.clone(),
            "type".to_string(),
            "vxlan".to_string(),
            "id".to_string(),
            spec.vni.to_string(),
            "dstport".to_string(),
            spec.port.to_string(),
        ];
        if let Some(local) = spec.local {
            args.extend(["local".to_string(), local.to_string()]);
        }
        args.push("nolearning".to_string());
        self.ip_owned(args).await?;
        self.finish_link(&spec.name, &spec.alias, spec.master.as_deref())
            .await
    }

    async fn create_gateway_link(&self, spec: &GatewayLinkSpec) -> KernelResult<()> {
        self.ip(&["link", "add", spec.name.as_str(), "type", "dummy"]).await?;
        self.finish_link(&spec.name, &spec.alias, spec.master.as_deref())
            .await
    }

    async fn set_link_alias(&self, name: &str, alias: &str) -> KernelResult<()> {
        self.ip(&["link", "set", "dev", name, "alias", alias]).await?;
        Ok(())
    }

    async fn set_link_master(&self, name: &str, master: Option<&str>) -> KernelResult<()> {
        match master {
            Some(master) => self.ip(&["link", "set", "dev", name, "master", master]).await?,
            None => self.ip(&["link", "set", "dev", name, "nomaster"]).await?,
        };
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> KernelResult<()> {
        self.ip(&["link", "del", "dev", name]).await?;
        Ok(())
    }

    async fn add_address(&self, device: &str, address: IpNetwork) -> KernelResult<()> {
        let addr = address.to_string();
        self.ip(&["addr", "add", addr.as_str(), "dev", device]).await?;
        Ok(())
    }

    async fn delete_address(&self, device: &str, address: IpNetwork) -> KernelResult<()> {
        let addr = address.to_string();
        self.ip(&["addr", "del", addr.as_str(), "dev", device]).await?;
        Ok(())
    }

    async fn replace_route(&self, route: &KernelRoute) -> KernelResult<()> {
        let mut args = vec![
            family_flag(&route.destination).to_string(),
            "route".to_string(),
            "replace".to_string(),
            route.destination.to_string(),
        ];
        if let Some(via) = route.via {
            args.extend(["via".to_string(), via.to_string()]);
        }
        if let Some(dev) = &route.dev {
            args.extend(["dev".to_string(), dev.clone()]);
        }
        args.extend([
            "table".to_string(),
            route.table.to_string(),
            "proto".to_string(),
            route.protocol.to_string(),
        ]);
        if let Some(metric) = route.metric {
            args.extend(["metric".to_string(), metric.to_string()]);
        }
        self.ip_owned(args).await?;
        Ok(())
    }

    async fn delete_route(&self, route: &KernelRoute) -> KernelResult<()> {
        let mut args = vec![
            family_flag(&route.destination).to_string(),
            "route".to_string(),
            "del".to_string(),
            route.destination.to_string(),
            "table".to_string(),
            route.table.to_string(),
        ];
        if let Some(metric) = route.metric {
            args.extend(["metric".to_string(), metric.to_string()]);
        }
        self.ip_owned(args).await?;
        Ok(())
    }

    async fn add_policy_rule(&self, rule: &PolicyRule) -> KernelResult<()> {
        self.ip_owned(policy_rule_args("add", rule)).await?;
        Ok(())
    }

    async fn delete_policy_rule(&self, rule: &PolicyRule) -> KernelResult<()> {
        self.ip_owned(policy_rule_args("del", rule)).await?;
        Ok(())
    }

    async fn add_rule(&self, rule: &FirewallRule) -> KernelResult<()> {
        self.exec(self.iptables(rule.family), &rule.to_args("-A"))
            .await?;
        Ok(())
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> KernelResult<()> {
        self.exec(self.iptables(rule.family), &rule.to_args("-D"))
            .await?;
        Ok(())
    }
}

fn policy_rule_args(op: &str, rule: &PolicyRule) -> Vec<String> {
    vec![
        family_flag(&rule.source).to_string(),
        "rule".to_string(),
        op.to_string(),
        "from".to_string(),
        rule.source.to_string(),
        "lookup".to_string(),
        rule.table.to_string(),
        "priority".to_string(),
        rule.priority.to_string(),
    ]
}
