//! Simulated Fabric Node
//!
//! In-memory `KernelDriver` with the same semantics the reconciler relies on
//! from a real host (existence errors, VNI uniqueness, device teardown), plus
//! fault injection for unsupported VRFs, unreadable state and busy locks.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::kernel::{
    AddressEntry, FirewallRule, FirewallTable, GatewayLinkSpec, KernelDriver, KernelError,
    KernelErrorKind, KernelResult, KernelRoute, LinkEntry, LinkInfo, LinkKind, PolicyRule,
    SegmentSpec,
};

#[derive(Debug, Default)]
struct NodeState {
    links: BTreeMap<String, LinkInfo>,
    addresses: BTreeSet<(String, IpNetwork)>,
    routes: Vec<KernelRoute>,
    policy_rules: Vec<PolicyRule>,
    filter: Vec<FirewallRule>,
    nat: Vec<FirewallRule>,
}

#[derive(Debug, Default)]
struct Faults {
    vrf_unsupported: bool,
    unreadable_links: BTreeSet<String>,
    unreadable_tables: BTreeSet<FirewallTable>,
    link_listing_down: bool,
    busy_mutations: u32,
    link_faults: BTreeMap<String, LinkFault>,
}

/// Fault raised when a named link is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Fail as busy every time
    Busy,
    /// Sleep before creating
    Stall(Duration),
    /// Crash the calling task
    Panic,
}

/// In-memory fabric node
#[derive(Debug, Default)]
pub struct SimulatedKernel {
    state: Mutex<NodeState>,
    faults: Mutex<Faults>,
    vrf_create_attempts: AtomicU64,
    mutations: AtomicU64,
}

impl SimulatedKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node whose kernel lacks VRF support
    pub fn without_vrf() -> Self {
        let node = Self::new();
        node.faults.lock().vrf_unsupported = true;
        node
    }

    pub fn set_vrf_unsupported(&self, unsupported: bool) {
        self.faults.lock().vrf_unsupported = unsupported;
    }

    /// Report a link's attributes as undecodable
    pub fn set_link_unreadable(&self, name: &str, unreadable: bool) {
        let mut faults = self.faults.lock();
        if unreadable {
            faults.unreadable_links.insert(name.to_string());
        } else {
            faults.unreadable_links.remove(name);
        }
    }

    /// Fail dumps of a firewall table
    pub fn set_table_unreadable(&self, table: FirewallTable, unreadable: bool) {
        let mut faults = self.faults.lock();
        if unreadable {
            faults.unreadable_tables.insert(table);
        } else {
            faults.unreadable_tables.remove(&table);
        }
    }

    pub fn set_link_listing_down(&self, down: bool) {
        self.faults.lock().link_listing_down = down;
    }

    /// Fail the next `count` mutations as busy
    pub fn fail_next_mutations(&self, count: u32) {
        self.faults.lock().busy_mutations = count;
    }

    /// Inject a fault for creations of link `name`; `None` clears it
    pub fn set_link_fault(&self, name: &str, fault: Option<LinkFault>) {
        let mut faults = self.faults.lock();
        match fault {
            Some(fault) => faults.link_faults.insert(name.to_string(), fault),
            None => faults.link_faults.remove(name),
        };
    }

    pub fn vrf_create_attempts(&self) -> u64 {
        self.vrf_create_attempts.load(Ordering::SeqCst)
    }

    /// Successful mutations so far
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn link(&self, name: &str) -> Option<LinkInfo> {
        self.state.lock().links.get(name).cloned()
    }

    pub fn link_names(&self) -> Vec<String> {
        self.state.lock().links.keys().cloned().collect()
    }

    pub fn routes(&self) -> Vec<KernelRoute> {
        self.state.lock().routes.clone()
    }

    pub fn addresses(&self) -> Vec<AddressEntry> {
        self.state
            .lock()
            .addresses
            .iter()
            .map(|(device, address)| AddressEntry {
                device: device.clone(),
                address: *address,
            })
            .collect()
    }

    pub fn policy_rules(&self) -> Vec<PolicyRule> {
        self.state.lock().policy_rules.clone()
    }

    pub fn rules(&self, table: FirewallTable) -> Vec<FirewallRule> {
        let state = self.state.lock();
        match table {
            FirewallTable::Filter => state.filter.clone(),
            FirewallTable::Nat => state.nat.clone(),
        }
    }

    /// Whether the filter table rejects traffic from `src` to `dst` in FORWARD
    pub fn forward_rejected(&self, src: IpNetwork, dst: IpNetwork) -> bool {
        self.state.lock().filter.iter().any(|rule| {
            rule.chain == "FORWARD"
                && rule.target.first().map(String::as_str) == Some("REJECT")
                && rule_matches(rule, "-s", &src)
                && rule_matches(rule, "-d", &dst)
        })
    }

    fn mutate(&self) -> KernelResult<()> {
        let mut faults = self.faults.lock();
        if faults.busy_mutations > 0 {
            faults.busy_mutations -= 1;
            return Err(KernelError::new(
                KernelErrorKind::Busy,
                "Another app is currently holding the xtables lock",
            ));
        }
        Ok(())
    }

    async fn creating(&self, name: &str) -> KernelResult<()> {
        let fault = self.faults.lock().link_faults.get(name).copied();
        match fault {
            None => Ok(()),
            Some(LinkFault::Busy) => Err(KernelError::new(
                KernelErrorKind::Busy,
                format!("RTNETLINK answers: Device or resource busy ({})", name),
            )),
            Some(LinkFault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(LinkFault::Panic) => panic!("simulated driver crash creating {}", name),
        }
    }

    fn done(&self) -> KernelResult<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn rule_matches(rule: &FirewallRule, flag: &str, net: &IpNetwork) -> bool {
    rule.matches
        .windows(2)
        .any(|pair| pair[0] == flag && pair[1] == net.to_string())
}

fn not_found(what: impl std::fmt::Display) -> KernelError {
    KernelError::new(KernelErrorKind::NotFound, format!("Cannot find {}", what))
}

fn exists(what: impl std::fmt::Display) -> KernelError {
    KernelError::new(KernelErrorKind::AlreadyExists, format!("{}: File exists", what))
}

#[async_trait]
impl KernelDriver for SimulatedKernel {
    async fn list_links(&self) -> KernelResult<Vec<LinkEntry>> {
        let faults = self.faults.lock();
        if faults.link_listing_down {
            return Err(KernelError::new(KernelErrorKind::Io, "netlink dump interrupted"));
        }
        let state = self.state.lock();
        Ok(state
            .links
            .values()
            .map(|link| {
                if faults.unreadable_links.contains(&link.name) {
                    LinkEntry::Unreadable {
                        name: link.name.clone(),
                        reason: "attribute decode failed".to_string(),
                    }
                } else {
                    LinkEntry::Readable(link.clone())
                }
            })
            .collect())
    }

    async fn list_addresses(&self) -> KernelResult<Vec<AddressEntry>> {
        Ok(self.addresses())
    }

    async fn list_routes(&self, protocol: u8) -> KernelResult<Vec<KernelRoute>> {
        Ok(self
            .state
            .lock()
            .routes
            .iter()
            .filter(|r| r.protocol == protocol)
            .cloned()
            .collect())
    }

    async fn list_policy_rules(&self) -> KernelResult<Vec<PolicyRule>> {
        Ok(self.policy_rules())
    }

    async fn dump_rules(&self, table: FirewallTable) -> KernelResult<Vec<FirewallRule>> {
        if self.faults.lock().unreadable_tables.contains(&table) {
            return Err(KernelError::new(
                KernelErrorKind::Io,
                format!("can't initialize iptables table `{}'", table.as_str()),
            ));
        }
        Ok(self.rules(table))
    }

    async fn create_vrf(&self, name: &str, table: u32) -> KernelResult<()> {
        self.vrf_create_attempts.fetch_add(1, Ordering::SeqCst);
        if self.faults.lock().vrf_unsupported {
            return Err(KernelError::new(
                KernelErrorKind::NotSupported,
                "Error: Unknown device type.",
            ));
        }
        self.creating(name).await?;
        self.mutate()?;
        let mut state = self.state.lock();
        if state.links.contains_key(name) {
            return Err(exists(name));
        }
        state.links.insert(
            name.to_string(),
            LinkInfo {
                name: name.to_string(),
                kind: LinkKind::Vrf,
                alias: None,
                master: None,
                vrf_table: Some(table),
                vni: None,
            },
        );
        drop(state);
        self.done()
    }

    async fn create_segment(&self, spec: &SegmentSpec) -> KernelResult<()> {
        self.creating(&spec.name).await?;
        self.mutate()?;
        let mut state = self.state.lock();
        if state.links.contains_key(&spec.name) {
            return Err(exists(&spec.name));
        }
        if state
            .links
            .values()
            .any(|l| l.kind == LinkKind::Vxlan && l.vni == Some(spec.vni))
        {
            return Err(KernelError::new(
                KernelErrorKind::Conflict,
                "A VXLAN device with the specified VNI already exists",
            ));
        }
        if let Some(master) = &spec.master {
            if !state.links.contains_key(master) {
                return Err(not_found(format!("device \"{}\"", master)));
            }
        }
        state.links.insert(
            spec.name.clone(),
            LinkInfo {
                name: spec.name.clone(),
                kind: LinkKind::Vxlan,
                alias: Some(spec.alias.clone()),
                master: spec.master.clone(),
                vrf_table: None,
                vni: Some(spec.vni),
            },
        );
        drop(state);
        self.done()
    }

    async fn create_gateway_link(&self, spec: &GatewayLinkSpec) -> KernelResult<()> {
        self.creating(&spec.name).await?;
        self.mutate()?;
        let mut state = self.state.lock();
        if state.links.contains_key(&spec.name) {
            return Err(exists(&spec.name));
        }
        if let Some(master) = &spec.master {
            if !state.links.contains_key(master) {
                return Err(not_found(format!("device \"{}\"", master)));
            }
        }
        state.links.insert(
            spec.name.clone(),
            LinkInfo {
                name: spec.name.clone(),
                kind: LinkKind::Dummy,
                alias: Some(spec.alias.clone()),
                master: spec.master.clone(),
                vrf_table: None,
                vni: None,
            },
        );
        drop(state);
        self.done()
    }

    async fn set_link_alias(&self, name: &str, alias: &str) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| not_found(format!("device \"{}\"", name)))?;
        link.alias = Some(alias.to_string());
        drop(state);
        self.done()
    }

    async fn set_link_master(&self, name: &str, master: Option<&str>) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        if let Some(master) = master {
            if !state.links.contains_key(master) {
                return Err(not_found(format!("device \"{}\"", master)));
            }
        }
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| not_found(format!("device \"{}\"", name)))?;
        link.master = master.map(str::to_string);
        drop(state);
        self.done()
    }

    async fn delete_link(&self, name: &str) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        if state.links.remove(name).is_none() {
            return Err(not_found(format!("device \"{}\"", name)));
        }
        for link in state.links.values_mut() {
            if link.master.as_deref() == Some(name) {
                link.master = None;
            }
        }
        state.addresses.retain(|(device, _)| device != name);
        state.routes.retain(|r| r.dev.as_deref() != Some(name));
        drop(state);
        self.done()
    }

    async fn add_address(&self, device: &str, address: IpNetwork) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        if !state.links.contains_key(device) {
            return Err(not_found(format!("device \"{}\"", device)));
        }
        if !state.addresses.insert((device.to_string(), address)) {
            return Err(exists(address));
        }
        drop(state);
        self.done()
    }

    async fn delete_address(&self, device: &str, address: IpNetwork) -> KernelResult<()> {
        self.mutate()?;
        if !self
            .state
            .lock()
            .addresses
            .remove(&(device.to_string(), address))
        {
            return Err(not_found(format!("address {} on {}", address, device)));
        }
        self.done()
    }

    async fn replace_route(&self, route: &KernelRoute) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        if let Some(dev) = &route.dev {
            if !state.links.contains_key(dev) {
                return Err(not_found(format!("device \"{}\"", dev)));
            }
        }
        state
            .routes
            .retain(|r| !(r.table == route.table && r.destination == route.destination));
        state.routes.push(route.clone());
        drop(state);
        self.done()
    }

    async fn delete_route(&self, route: &KernelRoute) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        let before = state.routes.len();
        state
            .routes
            .retain(|r| !(r.table == route.table && r.destination == route.destination));
        if state.routes.len() == before {
            return Err(KernelError::new(
                KernelErrorKind::NotFound,
                "RTNETLINK answers: No such process",
            ));
        }
        drop(state);
        self.done()
    }

    async fn add_policy_rule(&self, rule: &PolicyRule) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        if state.policy_rules.contains(rule) {
            return Err(exists("rule"));
        }
        state.policy_rules.push(rule.clone());
        drop(state);
        self.done()
    }

    async fn delete_policy_rule(&self, rule: &PolicyRule) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        let position = state
            .policy_rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| not_found("rule"))?;
        state.policy_rules.remove(position);
        drop(state);
        self.done()
    }

    async fn add_rule(&self, rule: &FirewallRule) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        match rule.table {
            FirewallTable::Filter => state.filter.push(rule.clone()),
            FirewallTable::Nat => state.nat.push(rule.clone()),
        }
        drop(state);
        self.done()
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> KernelResult<()> {
        self.mutate()?;
        let mut state = self.state.lock();
        let rules = match rule.table {
            FirewallTable::Filter => &mut state.filter,
            FirewallTable::Nat => &mut state.nat,
        };
        let position = rules.iter().position(|r| r == rule).ok_or_else(|| {
            KernelError::new(
                KernelErrorKind::NotFound,
                "Bad rule (does a matching rule exist in that chain?)",
            )
        })?;
        rules.remove(position);
        drop(state);
        self.done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(name: &str, vni: u32) -> SegmentSpec {
        SegmentSpec {
            name: name.into(),
            vni,
            port: 4789,
            local: None,
            master: None,
            alias: "fabric:domain:d1:abc".into(),
        }
    }

    #[tokio::test]
    async fn test_vni_conflict() {
        let node = SimulatedKernel::new();
        node.create_segment(&segment("vx-a", 100)).await.unwrap();
        let err = node.create_segment(&segment("vx-b", 100)).await.unwrap_err();
        assert_eq!(err.kind(), KernelErrorKind::Conflict);
        let err = node.create_segment(&segment("vx-a", 101)).await.unwrap_err();
        assert_eq!(err.kind(), KernelErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_delete_link_tears_down_dependents() {
        let node = SimulatedKernel::new();
        node.create_vrf("vrf-a", 10100).await.unwrap();
        let mut spec = segment("vx-a", 100);
        spec.master = Some("vrf-a".into());
        node.create_segment(&spec).await.unwrap();
        node.add_address("vx-a", "10.1.1.1/24".parse().unwrap())
            .await
            .unwrap();

        node.delete_link("vrf-a").await.unwrap();
        assert_eq!(node.link("vx-a").unwrap().master, None);

        node.delete_link("vx-a").await.unwrap();
        assert!(node.addresses().is_empty());
        let err = node.delete_link("vx-a").await.unwrap_err();
        assert_eq!(err.kind(), KernelErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let node = SimulatedKernel::without_vrf();
        let err = node.create_vrf("vrf-probe", 1).await.unwrap_err();
        assert_eq!(err.kind(), KernelErrorKind::NotSupported);
        assert_eq!(node.vrf_create_attempts(), 1);

        node.fail_next_mutations(1);
        let err = node.create_segment(&segment("vx-a", 1)).await.unwrap_err();
        assert_eq!(err.kind(), KernelErrorKind::Busy);
        node.create_segment(&segment("vx-a", 1)).await.unwrap();

        node.set_link_unreadable("vx-a", true);
        let links = node.list_links().await.unwrap();
        assert!(matches!(links[0], LinkEntry::Unreadable { .. }));

        node.set_table_unreadable(FirewallTable::Filter, true);
        assert!(node.dump_rules(FirewallTable::Filter).await.is_err());
        assert!(node.dump_rules(FirewallTable::Nat).await.is_ok());
    }

    #[tokio::test]
    async fn test_link_fault_is_sticky_until_cleared() {
        let node = SimulatedKernel::new();
        node.set_link_fault("vx-a", Some(LinkFault::Busy));
        for _ in 0..2 {
            let err = node.create_segment(&segment("vx-a", 1)).await.unwrap_err();
            assert_eq!(err.kind(), KernelErrorKind::Busy);
        }
        node.create_segment(&segment("vx-b", 2)).await.unwrap();

        node.set_link_fault("vx-a", None);
        node.create_segment(&segment("vx-a", 1)).await.unwrap();
        assert_eq!(node.link_names(), vec!["vx-a", "vx-b"]);
    }
}
