//! State Enforcer
//!
//! Executes an `ActionPlan` against the kernel. Every primitive checks the
//! current state before mutating, so replaying an action is harmless.
//! Chains (one per domain) run concurrently; actions within a chain run in
//! plan order, and all deletions finish before any creation starts.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::capability::Capability;
use crate::diff::{Action, ActionKind, ActionPlan, Payload, Removal};
use crate::isolation::{FallbackIsolation, IsolationStrategy, NativeIsolation};
use crate::kernel::{
    FirewallRule, FirewallTable, GatewayLinkSpec, KernelDriver, KernelError, KernelErrorKind,
    KernelResult, KernelRoute, LinkEntry, LinkInfo, LinkKind, PolicyRule, SegmentSpec,
};
use crate::model::{IsolationMode, ResourceRef};
use crate::naming::Tag;

// ====== Outcomes ======

/// Failure of a single action
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "class", content = "reason", rename_all = "snake_case")]
pub enum ActionError {
    /// Transient; the next cycle tries again
    #[error("retryable: {0}")]
    Retryable(String),

    /// Will not succeed without a change of intent or host
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<KernelError> for ActionError {
    fn from(e: KernelError) -> Self {
        match e.kind() {
            KernelErrorKind::NotSupported
            | KernelErrorKind::Invalid
            | KernelErrorKind::Conflict
            | KernelErrorKind::Parse => ActionError::Fatal(e.to_string()),
            KernelErrorKind::AlreadyExists
            | KernelErrorKind::NotFound
            | KernelErrorKind::Busy
            | KernelErrorKind::Unreachable
            | KernelErrorKind::Io => ActionError::Retryable(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    /// Kernel already matched
    Unchanged,
    /// A dependency failed earlier in the cycle
    Skipped { blocked_by: String },
    Failed { error: ActionError },
}

impl ActionOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            ActionOutcome::Applied => "applied",
            ActionOutcome::Unchanged => "unchanged",
            ActionOutcome::Skipped { .. } => "skipped",
            ActionOutcome::Failed { error: ActionError::Retryable(_) } => "retryable",
            ActionOutcome::Failed { error: ActionError::Fatal(_) } => "fatal",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Applied | ActionOutcome::Unchanged)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub kind: ActionKind,
    pub resource: ResourceRef,
    pub chain: String,
    /// e.g. `create_gateway`
    pub label: String,
    pub outcome: ActionOutcome,
    pub duration_ms: u64,
}

/// Results shared with the caller so a cut-short plan still reports
pub type Journal = Arc<Mutex<Vec<ActionResult>>>;

/// Effect of an idempotent primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Applied,
    Unchanged,
}

impl Change {
    pub fn and(self, other: Change) -> Change {
        if self == Change::Applied || other == Change::Applied {
            Change::Applied
        } else {
            Change::Unchanged
        }
    }
}

/// Isolation enforcement state of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementState {
    /// Capability not resolved yet
    Probing,
    Native,
    Fallback,
}

impl EnforcementState {
    pub fn from_capability(capability: Option<Capability>) -> Self {
        match capability {
            None => EnforcementState::Probing,
            Some(Capability::NativeAvailable) => EnforcementState::Native,
            Some(Capability::NativeUnavailable) => EnforcementState::Fallback,
        }
    }
}

// ====== Enforcer ======

#[derive(Clone)]
pub struct Enforcer {
    kernel: Arc<dyn KernelDriver>,
    isolation: Arc<dyn IsolationStrategy>,
    parallel_chains: bool,
}

impl Enforcer {
    pub fn new(
        kernel: Arc<dyn KernelDriver>,
        isolation: Arc<dyn IsolationStrategy>,
        parallel_chains: bool,
    ) -> Self {
        Self {
            kernel,
            isolation,
            parallel_chains,
        }
    }

    /// Enforcer with the strategy the capability selects
    pub fn for_capability(
        kernel: Arc<dyn KernelDriver>,
        capability: Capability,
        parallel_chains: bool,
    ) -> Self {
        let isolation: Arc<dyn IsolationStrategy> = match capability {
            Capability::NativeAvailable => Arc::new(NativeIsolation::new()),
            Capability::NativeUnavailable => Arc::new(FallbackIsolation::new()),
        };
        Self::new(kernel, isolation, parallel_chains)
    }

    pub fn mode(&self) -> IsolationMode {
        self.isolation.mode()
    }

    /// Apply one action
    pub async fn apply(&self, action: &Action) -> ActionResult {
        let started = Instant::now();
        let outcome = match self.execute(&action.payload).await {
            Ok(Change::Applied) => ActionOutcome::Applied,
            Ok(Change::Unchanged) => ActionOutcome::Unchanged,
            Err(error) => ActionOutcome::Failed { error },
        };

        match &outcome {
            ActionOutcome::Applied => {
                info!(action = %action.label(), resource = %action.resource, "Applied")
            }
            ActionOutcome::Unchanged => {
                debug!(action = %action.label(), resource = %action.resource, "Already in place")
            }
            ActionOutcome::Failed { error: e @ ActionError::Retryable(_) } => {
                warn!(action = %action.label(), resource = %action.resource, error = %e, "Action failed")
            }
            ActionOutcome::Failed { error: e } => {
                error!(action = %action.label(), resource = %action.resource, error = %e, "Action failed")
            }
            ActionOutcome::Skipped { .. } => {}
        }

        ActionResult {
            kind: action.kind,
            resource: action.resource.clone(),
            chain: action.chain.clone(),
            label: action.label(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn execute(&self, payload: &Payload) -> Result<Change, ActionError> {
        let kernel = self.kernel.as_ref();
        let change = match payload {
            Payload::Invalid(e) => return Err(ActionError::Fatal(e.to_string())),
            Payload::Domain(plan) => self.isolation.ensure_domain(kernel, plan).await?,
            Payload::Gateway(plan) => {
                let link = ensure_gateway_link(kernel, &plan.link).await?;
                let id = plan.id.as_str();
                let rules = ensure_tagged_rules(kernel, FirewallTable::Nat, &plan.translation, |t| {
                    matches!(t, Tag::Gateway { id: owner, .. } if owner == id)
                })
                .await?;
                link.and(rules)
            }
            Payload::Subnet(plan) => ensure_address(kernel, &plan.device, plan.address).await?,
            Payload::Route(plan) => ensure_route(kernel, &plan.route).await?,
            Payload::RuleSet(plan) => {
                let id = plan.id.as_str();
                ensure_tagged_rules(kernel, FirewallTable::Filter, &plan.rules, |t| {
                    matches!(t, Tag::RuleSet { id: owner, .. } if owner == id)
                })
                .await?
            }
            Payload::Remove(removal) => match removal {
                Removal::Domain(domain) => self.isolation.remove_domain(kernel, domain).await?,
                Removal::Gateway { id, link } => {
                    let id = id.as_str();
                    let rules = ensure_tagged_rules(kernel, FirewallTable::Nat, &[], |t| {
                        matches!(t, Tag::Gateway { id: owner, .. } if owner == id)
                    })
                    .await?;
                    rules.and(ensure_link_absent(kernel, link).await?)
                }
                Removal::Subnet { device, address } => {
                    ensure_address_absent(kernel, device, *address).await?
                }
                Removal::Route(route) => ensure_route_absent(kernel, route).await?,
                Removal::RuleSet { id } => {
                    let id = id.as_str();
                    ensure_tagged_rules(kernel, FirewallTable::Filter, &[], |t| {
                        matches!(t, Tag::RuleSet { id: owner, .. } if owner == id)
                    })
                    .await?
                }
            },
        };
        Ok(change)
    }

    /// Apply a whole plan, collecting results in plan order
    pub async fn apply_plan(&self, plan: ActionPlan) -> Vec<ActionResult> {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        self.apply_plan_into(plan, journal.clone()).await;
        let results = journal.lock().clone();
        results
    }

    /// Apply a plan, appending each result to `journal` as it completes
    pub async fn apply_plan_into(&self, plan: ActionPlan, journal: Journal) {
        let failed: Arc<Mutex<HashSet<ResourceRef>>> = Arc::new(Mutex::new(HashSet::new()));
        let (deletions, rest): (Vec<Action>, Vec<Action>) = plan
            .actions
            .into_iter()
            .partition(|a| a.kind == ActionKind::Delete);

        for phase in [deletions, rest] {
            let chains = group_chains(phase);
            if self.parallel_chains && chains.len() > 1 {
                let mut tasks = JoinSet::new();
                let spawned = chains.clone();
                for actions in chains {
                    let this = self.clone();
                    let failed = failed.clone();
                    let journal = journal.clone();
                    tasks.spawn(async move { this.run_chain(actions, &failed, &journal).await });
                }
                let mut aborted = None;
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        error!(error = %e, "Chain task aborted");
                        aborted = Some(e.to_string());
                    }
                }
                // Finished chains have a result for every action
                if let Some(reason) = aborted {
                    for chain in spawned {
                        record_aborted(chain, &reason, &failed, &journal);
                    }
                }
            } else {
                for actions in chains {
                    self.run_chain(actions, &failed, &journal).await;
                }
            }
        }
    }

    async fn run_chain(
        &self,
        actions: Vec<Action>,
        failed: &Mutex<HashSet<ResourceRef>>,
        journal: &Mutex<Vec<ActionResult>>,
    ) {
        for action in actions {
            let blocked = {
                let failed = failed.lock();
                action.depends_on.iter().find(|d| failed.contains(*d)).cloned()
            };

            let result = match blocked {
                Some(dependency) => {
                    debug!(action = %action.label(), resource = %action.resource, blocked_by = %dependency, "Skipped");
                    ActionResult {
                        kind: action.kind,
                        resource: action.resource.clone(),
                        chain: action.chain.clone(),
                        label: action.label(),
                        outcome: ActionOutcome::Skipped {
                            blocked_by: dependency.to_string(),
                        },
                        duration_ms: 0,
                    }
                }
                None => self.apply(&action).await,
            };

            if !result.outcome.is_success() {
                failed.lock().insert(action.resource.clone());
            }
            journal.lock().push(result);
        }
    }
}

/// Fail every action of an aborted chain that left no result
fn record_aborted(
    chain: Vec<Action>,
    reason: &str,
    failed: &Mutex<HashSet<ResourceRef>>,
    journal: &Mutex<Vec<ActionResult>>,
) {
    let mut journal = journal.lock();
    let mut failed = failed.lock();
    for action in chain {
        let label = action.label();
        if journal
            .iter()
            .any(|r| r.resource == action.resource && r.label == label && r.chain == action.chain)
        {
            continue;
        }
        failed.insert(action.resource.clone());
        journal.push(ActionResult {
            kind: action.kind,
            resource: action.resource,
            chain: action.chain,
            label,
            outcome: ActionOutcome::Failed {
                error: ActionError::Retryable(format!("chain aborted: {}", reason)),
            },
            duration_ms: 0,
        });
    }
}

/// Split actions into per-chain runs, keeping plan order within each
fn group_chains(actions: Vec<Action>) -> Vec<Vec<Action>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut chains: Vec<Vec<Action>> = Vec::new();
    for action in actions {
        let slot = *index.entry(action.chain.clone()).or_insert_with(|| {
            chains.push(Vec::new());
            chains.len() - 1
        });
        chains[slot].push(action);
    }
    chains
}

// ====== Idempotent primitives ======

fn tolerate(result: KernelResult<()>, benign: KernelErrorKind) -> KernelResult<Change> {
    match result {
        Ok(()) => Ok(Change::Applied),
        Err(e) if e.kind() == benign => Ok(Change::Unchanged),
        Err(e) => Err(e),
    }
}

/// Current state of `name`; an unreadable entry is an error
pub(crate) async fn find_link(kernel: &dyn KernelDriver, name: &str) -> KernelResult<Option<LinkInfo>> {
    for entry in kernel.list_links().await? {
        match entry {
            LinkEntry::Readable(link) if link.name == name => return Ok(Some(link)),
            LinkEntry::Unreadable { name: n, reason } if n == name => {
                return Err(KernelError::new(
                    KernelErrorKind::Io,
                    format!("link {} unreadable: {}", name, reason),
                ))
            }
            _ => {}
        }
    }
    Ok(None)
}

pub(crate) async fn ensure_link_absent(kernel: &dyn KernelDriver, name: &str) -> KernelResult<Change> {
    if find_link(kernel, name).await?.is_none() {
        return Ok(Change::Unchanged);
    }
    tolerate(kernel.delete_link(name).await, KernelErrorKind::NotFound)
}

async fn ensure_alias(kernel: &dyn KernelDriver, link: &LinkInfo, alias: &str) -> KernelResult<Change> {
    if link.alias.as_deref() == Some(alias) {
        return Ok(Change::Unchanged);
    }
    kernel.set_link_alias(&link.name, alias).await?;
    Ok(Change::Applied)
}

async fn ensure_master(
    kernel: &dyn KernelDriver,
    link: &LinkInfo,
    master: Option<&str>,
) -> KernelResult<Change> {
    if link.master.as_deref() == master {
        return Ok(Change::Unchanged);
    }
    kernel.set_link_master(&link.name, master).await?;
    Ok(Change::Applied)
}

/// VRF device bound to `table`, tagged with `alias`
pub(crate) async fn ensure_vrf(
    kernel: &dyn KernelDriver,
    name: &str,
    table: u32,
    alias: &str,
) -> KernelResult<Change> {
    match find_link(kernel, name).await? {
        Some(link) if link.kind == LinkKind::Vrf && link.vrf_table == Some(table) => {
            return ensure_alias(kernel, &link, alias).await;
        }
        Some(_) => kernel.delete_link(name).await?,
        None => {}
    }

    tolerate(kernel.create_vrf(name, table).await, KernelErrorKind::AlreadyExists)?;
    kernel.set_link_alias(name, alias).await?;
    Ok(Change::Applied)
}

/// Overlay segment with the requested VNI, master and alias
pub(crate) async fn ensure_segment(kernel: &dyn KernelDriver, spec: &SegmentSpec) -> KernelResult<Change> {
    match find_link(kernel, &spec.name).await? {
        Some(link)
            if link.kind == LinkKind::Vxlan
                && link.vni == Some(spec.vni) =>
        {
            let master = ensure_master(kernel, &link, spec.master.as_deref()).await?;
            let alias = ensure_alias(kernel, &link, &spec.alias).await?;
            Ok(master.and(alias))
        }
        Some(_) => {
            kernel.delete_link(&spec.name).await?;
            kernel.create_segment(spec).await?;
            Ok(Change::Applied)
        }
        None => tolerate(kernel.create_segment(spec).await, KernelErrorKind::AlreadyExists),
    }
}

async fn ensure_gateway_link(kernel: &dyn KernelDriver, spec: &GatewayLinkSpec) -> KernelResult<Change> {
    match find_link(kernel, &spec.name).await? {
        Some(link) if link.kind == LinkKind::Dummy && link.master == spec.master => {
            ensure_alias(kernel, &link, &spec.alias).await
        }
        Some(_) => {
            kernel.delete_link(&spec.name).await?;
            kernel.create_gateway_link(spec).await?;
            Ok(Change::Applied)
        }
        None => tolerate(kernel.create_gateway_link(spec).await, KernelErrorKind::AlreadyExists),
    }
}

async fn ensure_address(
    kernel: &dyn KernelDriver,
    device: &str,
    address: ipnetwork::IpNetwork,
) -> KernelResult<Change> {
    let present = kernel
        .list_addresses()
        .await?
        .iter()
        .any(|a| a.device == device && a.address == address);
    if present {
        return Ok(Change::Unchanged);
    }
    tolerate(kernel.add_address(device, address).await, KernelErrorKind::AlreadyExists)
}

async fn ensure_address_absent(
    kernel: &dyn KernelDriver,
    device: &str,
    address: ipnetwork::IpNetwork,
) -> KernelResult<Change> {
    let present = kernel
        .list_addresses()
        .await?
        .iter()
        .any(|a| a.device == device && a.address == address);
    if !present {
        return Ok(Change::Unchanged);
    }
    tolerate(kernel.delete_address(device, address).await, KernelErrorKind::NotFound)
}

async fn ensure_route(kernel: &dyn KernelDriver, route: &KernelRoute) -> KernelResult<Change> {
    let current = kernel.list_routes(route.protocol).await?;
    let existing = current
        .iter()
        .find(|r| r.table == route.table && r.destination == route.destination);
    if existing.map_or(false, |r| r.same_path(route)) {
        return Ok(Change::Unchanged);
    }
    kernel.replace_route(route).await?;
    Ok(Change::Applied)
}

async fn ensure_route_absent(kernel: &dyn KernelDriver, route: &KernelRoute) -> KernelResult<Change> {
    let present = kernel
        .list_routes(route.protocol)
        .await?
        .iter()
        .any(|r| r.table == route.table && r.destination == route.destination);
    if !present {
        return Ok(Change::Unchanged);
    }
    tolerate(kernel.delete_route(route).await, KernelErrorKind::NotFound)
}

/// Exactly `wanted` among the policy rules pointing at `table`
pub(crate) async fn ensure_policy_rules(
    kernel: &dyn KernelDriver,
    table: u32,
    wanted: &[PolicyRule],
) -> KernelResult<Change> {
    let existing: Vec<PolicyRule> = kernel
        .list_policy_rules()
        .await?
        .into_iter()
        .filter(|r| r.table == table)
        .collect();

    let mut change = Change::Unchanged;
    for rule in existing.iter().filter(|r| !wanted.contains(r)) {
        change = change.and(tolerate(
            kernel.delete_policy_rule(rule).await,
            KernelErrorKind::NotFound,
        )?);
    }
    for rule in wanted.iter().filter(|r| !existing.contains(r)) {
        change = change.and(tolerate(
            kernel.add_policy_rule(rule).await,
            KernelErrorKind::AlreadyExists,
        )?);
    }
    Ok(change)
}

/// Exactly one copy of each `wanted` rule among the rules whose tag `owns`
/// selects; everything else so tagged is removed
pub(crate) async fn ensure_tagged_rules<F>(
    kernel: &dyn KernelDriver,
    table: FirewallTable,
    wanted: &[FirewallRule],
    owns: F,
) -> KernelResult<Change>
where
    F: Fn(&Tag) -> bool + Send + Sync,
{
    let existing: Vec<FirewallRule> = kernel
        .dump_rules(table)
        .await?
        .into_iter()
        .filter(|r| r.parsed_tag().map_or(false, |t| owns(&t)))
        .collect();

    let wanted_tags: HashSet<&str> = wanted.iter().map(|r| r.tag.as_str()).collect();
    let mut kept: HashSet<String> = HashSet::new();
    let mut change = Change::Unchanged;

    for rule in &existing {
        if wanted_tags.contains(rule.tag.as_str()) && kept.insert(rule.tag.clone()) {
            continue;
        }
        change = change.and(tolerate(kernel.delete_rule(rule).await, KernelErrorKind::NotFound)?);
    }
    for rule in wanted.iter().filter(|r| !kept.contains(&r.tag)) {
        kernel.add_rule(rule).await?;
        change = Change::Applied;
    }
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use crate::diff::diff;
    use crate::discovery::Discoverer;
    use crate::model::{
        DesiredState, Gateway, GatewayKind, NetworkDomain, NextHopKind, ResourceKind, Route,
    };
    use crate::realize::Realizer;
    use crate::naming;
    use crate::sim::{LinkFault, SimulatedKernel};

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

    fn desired() -> DesiredState {
        let mut state = DesiredState::new("default");
        state.domains.push(domain("d1", "10.1.0.0/16", 100));
        state.gateways.push(Gateway {
            id: "g1".into(),
            domain_id: "d1".into(),
            kind: GatewayKind::Nat {
                public_ip: "203.0.113.7".parse().unwrap(),
                private_ip: None,
            },
            version: String::new(),
        });
        state.routes.push(Route {
            id: "r1".into(),
            domain_id: "d1".into(),
            destination: "0.0.0.0/0".into(),
            next_hop: "g1".into(),
            next_hop_kind: NextHopKind::Gateway,
            priority: 100,
            version: String::new(),
        });
        state
    }

    async fn plan_for(
        node: &Arc<SimulatedKernel>,
        desired: &DesiredState,
        mode: IsolationMode,
    ) -> ActionPlan {
        let layout = LayoutConfig::default();
        let observed = Discoverer::new(node.clone(), layout.clone())
            .discover("default")
            .await
            .unwrap();
        diff(desired, &observed, &Realizer::new(&layout, mode))
    }

    #[test]
    fn test_error_classification() {
        let busy = KernelError::new(KernelErrorKind::Busy, "xtables lock");
        assert!(matches!(ActionError::from(busy), ActionError::Retryable(_)));
        let conflict = KernelError::new(KernelErrorKind::Conflict, "vni in use");
        assert!(matches!(ActionError::from(conflict), ActionError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_group_chains_keeps_order() {
        let node = Arc::new(SimulatedKernel::new());
        let mut state = desired();
        state.domains.push(domain("d2", "10.2.0.0/16", 200));
        let plan = plan_for(&node, &state, IsolationMode::Native).await;

        let chains = group_chains(plan.actions);
        assert_eq!(chains.len(), 2);
        let d1: Vec<String> = chains[0].iter().map(|a| a.to_string()).collect();
        assert_eq!(d1, vec!["create domain/d1", "create gateway/g1", "create route/r1"]);
        assert_eq!(chains[1].len(), 1);
    }

    #[tokio::test]
    async fn test_apply_plan_native() {
        let node = Arc::new(SimulatedKernel::new());
        let state = desired();
        let plan = plan_for(&node, &state, IsolationMode::Native).await;
        let enforcer = Enforcer::for_capability(node.clone(), Capability::NativeAvailable, true);

        let results = enforcer.apply_plan(plan).await;
        assert!(results.iter().all(|r| r.outcome == ActionOutcome::Applied));

        let vrf = node.link(&crate::naming::vrf_device("d1")).unwrap();
        assert_eq!(vrf.vrf_table, Some(10100));
        assert!(vrf.alias.unwrap().starts_with("fabric:domain:d1:"));
        let segment = node.link(&crate::naming::segment_device("d1")).unwrap();
        assert_eq!(segment.master.as_deref(), Some(vrf.name.as_str()));
        assert_eq!(node.rules(FirewallTable::Nat).len(), 1);
        assert_eq!(node.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_is_unchanged() {
        let node = Arc::new(SimulatedKernel::new());
        let state = desired();
        let plan = plan_for(&node, &state, IsolationMode::Native).await;
        let enforcer = Enforcer::for_capability(node.clone(), Capability::NativeAvailable, false);

        for action in plan.iter() {
            enforcer.apply(action).await;
        }
        let mutations = node.mutation_count();
        for action in plan.iter() {
            assert_eq!(enforcer.apply(action).await.outcome, ActionOutcome::Unchanged);
        }
        assert_eq!(node.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let node = Arc::new(SimulatedKernel::new());
        let state = desired();
        // domain VRF creation hits a busy lock; everything in the chain depends on it
        let plan = plan_for(&node, &state, IsolationMode::Native).await;
        node.fail_next_mutations(1);
        let enforcer = Enforcer::for_capability(node.clone(), Capability::NativeAvailable, true);

        let results = enforcer.apply_plan(plan).await;
        let domain = results
            .iter()
            .find(|r| r.resource == ResourceRef::domain("d1"))
            .unwrap();
        assert_eq!(domain.outcome.name(), "retryable");
        assert!(results
            .iter()
            .filter(|r| r.resource != ResourceRef::domain("d1"))
            .all(|r| matches!(r.outcome, ActionOutcome::Skipped { .. })));
    }

    fn outcome<'a>(results: &'a [ActionResult], resource: &ResourceRef) -> &'a ActionOutcome {
        &results
            .iter()
            .find(|r| &r.resource == resource)
            .unwrap()
            .outcome
    }

    #[tokio::test]
    async fn test_stalled_domain_does_not_block_other_chains() {
        let node = Arc::new(SimulatedKernel::new());
        let mut state = desired();
        state.domains.push(domain("d2", "10.2.0.0/16", 200));
        let plan = plan_for(&node, &state, IsolationMode::Native).await;
        node.set_link_fault(&naming::vrf_device("d1"), Some(LinkFault::Busy));
        let enforcer = Enforcer::for_capability(node.clone(), Capability::NativeAvailable, true);

        let results = enforcer.apply_plan(plan).await;
        assert_eq!(outcome(&results, &ResourceRef::domain("d1")).name(), "retryable");
        for dependent in [
            ResourceRef::new(ResourceKind::Gateway, "g1"),
            ResourceRef::new(ResourceKind::Route, "r1"),
        ] {
            assert!(matches!(outcome(&results, &dependent), ActionOutcome::Skipped { .. }));
        }
        assert_eq!(outcome(&results, &ResourceRef::domain("d2")), &ActionOutcome::Applied);
        assert!(node.link(&naming::vrf_device("d2")).is_some());
        assert!(node.link(&naming::vrf_device("d1")).is_none());
    }

    #[tokio::test]
    async fn test_crashed_chain_fails_its_remaining_actions() {
        let node = Arc::new(SimulatedKernel::new());
        let mut state = desired();
        state.domains.push(domain("d2", "10.2.0.0/16", 200));
        let plan = plan_for(&node, &state, IsolationMode::Native).await;
        let planned = plan.len();
        node.set_link_fault(&naming::gateway_device("g1"), Some(LinkFault::Panic));
        let enforcer = Enforcer::for_capability(node.clone(), Capability::NativeAvailable, true);

        let results = enforcer.apply_plan(plan).await;
        assert_eq!(results.len(), planned);
        assert_eq!(outcome(&results, &ResourceRef::domain("d1")), &ActionOutcome::Applied);
        assert_eq!(outcome(&results, &ResourceRef::domain("d2")), &ActionOutcome::Applied);
        for crashed in [
            ResourceRef::new(ResourceKind::Gateway, "g1"),
            ResourceRef::new(ResourceKind::Route, "r1"),
        ] {
            match outcome(&results, &crashed) {
                ActionOutcome::Failed { error: ActionError::Retryable(reason) } => {
                    assert!(reason.starts_with("chain aborted"))
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_tagged_rules_collapse_duplicates() {
        let node = Arc::new(SimulatedKernel::new());
        let state = desired();
        let plan = plan_for(&node, &state, IsolationMode::Native).await;
        let enforcer = Enforcer::for_capability(node.clone(), Capability::NativeAvailable, true);
        enforcer.apply_plan(plan).await;

        let rule = node.rules(FirewallTable::Nat)[0].clone();
        node.add_rule(&rule).await.unwrap();
        assert_eq!(node.rules(FirewallTable::Nat).len(), 2);

        let change = ensure_tagged_rules(node.as_ref(), FirewallTable::Nat, &[rule], |t| {
            matches!(t, Tag::Gateway { .. })
        })
        .await
        .unwrap();
        assert_eq!(change, Change::Applied);
        assert_eq!(node.rules(FirewallTable::Nat).len(), 1);
    }

    #[test]
    fn test_enforcement_state() {
        assert_eq!(EnforcementState::from_capability(None), EnforcementState::Probing);
        assert_eq!(
            EnforcementState::from_capability(Some(Capability::NativeUnavailable)),
            EnforcementState::Fallback
        );
    }
}
