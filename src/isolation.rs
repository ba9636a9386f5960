//! Isolation Strategies
//!
//! Two ways to keep domains apart on one host:
//!
//! - `NativeIsolation`: each domain gets a VRF device bound to its routing
//!   table, and the overlay segment is enslaved to it.
//! - `FallbackIsolation`: no VRF. Source-based policy rules steer the domain's
//!   CIDRs into its table, and tagged REJECT rules block every non-peered pair.
//!
//! Each strategy also sweeps the other's artifacts, so a host that changes
//! mode converges without manual cleanup.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::diff::DomainRemoval;
use crate::enforcer::{
    ensure_link_absent, ensure_policy_rules, ensure_segment, ensure_tagged_rules, ensure_vrf,
    Change,
};
use crate::kernel::{FirewallRule, FirewallTable, KernelDriver, KernelError, KernelErrorKind, KernelResult};
use crate::model::IsolationMode;
use crate::naming;
use crate::realize::DomainPlan;

#[async_trait]
pub trait IsolationStrategy: Send + Sync {
    fn mode(&self) -> IsolationMode;

    /// Bring the domain's devices and isolation artifacts in line with `plan`
    async fn ensure_domain(&self, kernel: &dyn KernelDriver, plan: &DomainPlan) -> KernelResult<Change>;

    /// Tear down everything the domain owns
    async fn remove_domain(
        &self,
        kernel: &dyn KernelDriver,
        removal: &DomainRemoval,
    ) -> KernelResult<Change>;
}

/// Removal shared by both strategies
async fn remove_domain_objects(
    kernel: &dyn KernelDriver,
    removal: &DomainRemoval,
) -> KernelResult<Change> {
    let id = removal.id.as_str();
    let mut change = ensure_tagged_rules(kernel, FirewallTable::Filter, &[], |t| t.involves(id)).await?;
    if let Some(table) = removal.table {
        change = change.and(ensure_policy_rules(kernel, table, &[]).await?);
    }
    change = change.and(ensure_link_absent(kernel, &removal.segment).await?);
    change = change.and(ensure_link_absent(kernel, &removal.vrf).await?);
    Ok(change)
}

// ====== Native ======

#[derive(Debug, Default)]
pub struct NativeIsolation {
    rules_lock: Mutex<()>,
}

impl NativeIsolation {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IsolationStrategy for NativeIsolation {
    fn mode(&self) -> IsolationMode {
        IsolationMode::Native
    }

    async fn ensure_domain(&self, kernel: &dyn KernelDriver, plan: &DomainPlan) -> KernelResult<Change> {
        let vrf = plan.vrf.as_deref().ok_or_else(|| {
            KernelError::new(
                KernelErrorKind::Invalid,
                format!("domain {} planned without a VRF", plan.id),
            )
        })?;

        let id = plan.id.as_str();
        let mut change = {
            let _guard = self.rules_lock.lock().await;
            ensure_tagged_rules(kernel, FirewallTable::Filter, &[], |t| t.involves(id)).await?
        };
        change = change.and(ensure_policy_rules(kernel, plan.table, &[]).await?);
        change = change.and(ensure_vrf(kernel, vrf, plan.table, &plan.segment.alias).await?);
        change = change.and(ensure_segment(kernel, &plan.segment).await?);
        Ok(change)
    }

    async fn remove_domain(
        &self,
        kernel: &dyn KernelDriver,
        removal: &DomainRemoval,
    ) -> KernelResult<Change> {
        let _guard = self.rules_lock.lock().await;
        remove_domain_objects(kernel, removal).await
    }
}

// ====== Fallback ======

/// Policy-rule and filter-rule isolation
///
/// Pair rules are shared between both domains of the pair, so their
/// check-then-mutate runs under one lock across chains.
#[derive(Debug, Default)]
pub struct FallbackIsolation {
    rules_lock: Mutex<()>,
}

impl FallbackIsolation {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IsolationStrategy for FallbackIsolation {
    fn mode(&self) -> IsolationMode {
        IsolationMode::Fallback
    }

    async fn ensure_domain(&self, kernel: &dyn KernelDriver, plan: &DomainPlan) -> KernelResult<Change> {
        let mut change = ensure_link_absent(kernel, &naming::vrf_device(&plan.id)).await?;
        change = change.and(ensure_segment(kernel, &plan.segment).await?);
        change = change.and(ensure_policy_rules(kernel, plan.table, &plan.policy_rules).await?);

        let wanted: Vec<FirewallRule> = plan
            .counterparts
            .iter()
            .flat_map(|c| c.rules.iter().cloned())
            .collect();
        let id = plan.id.as_str();
        let _guard = self.rules_lock.lock().await;
        change = change.and(
            ensure_tagged_rules(kernel, FirewallTable::Filter, &wanted, |t| t.involves(id)).await?,
        );
        Ok(change)
    }

    async fn remove_domain(
        &self,
        kernel: &dyn KernelDriver,
        removal: &DomainRemoval,
    ) -> KernelResult<Change> {
        let _guard = self.rules_lock.lock().await;
        remove_domain_objects(kernel, removal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use crate::model::NetworkDomain;
    use crate::realize::Realizer;
    use crate::sim::SimulatedKernel;

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

    #[tokio::test]
    async fn test_fallback_pair_rules_are_shared() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Fallback);
        let d1 = domain("d1", "10.1.0.0/16", 100);
        let d2 = domain("d2", "10.2.0.0/16", 200);
        let p1 = realizer.domain(&d1, &[&d2]).unwrap();
        let p2 = realizer.domain(&d2, &[&d1]).unwrap();

        let node = SimulatedKernel::new();
        let strategy = FallbackIsolation::new();
        assert_eq!(strategy.ensure_domain(&node, &p1).await.unwrap(), Change::Applied);
        let rules = node.rules(FirewallTable::Filter).len();
        assert_eq!(rules, 4);

        // Same pair from the other side adds its policy rule but no filter rules
        strategy.ensure_domain(&node, &p2).await.unwrap();
        assert_eq!(node.rules(FirewallTable::Filter).len(), rules);
        assert_eq!(node.policy_rules().len(), 2);
        assert!(node.forward_rejected("10.1.0.0/16".parse().unwrap(), "10.2.0.0/16".parse().unwrap()));
        assert!(node.forward_rejected("10.2.0.0/16".parse().unwrap(), "10.1.0.0/16".parse().unwrap()));

        assert_eq!(strategy.ensure_domain(&node, &p1).await.unwrap(), Change::Unchanged);
    }

    #[tokio::test]
    async fn test_native_sweeps_fallback_artifacts() {
        let layout = LayoutConfig::default();
        let d1 = domain("d1", "10.1.0.0/16", 100);
        let d2 = domain("d2", "10.2.0.0/16", 200);

        let node = SimulatedKernel::new();
        let fallback = Realizer::new(&layout, IsolationMode::Fallback);
        FallbackIsolation::new()
            .ensure_domain(&node, &fallback.domain(&d1, &[&d2]).unwrap())
            .await
            .unwrap();
        assert!(!node.rules(FirewallTable::Filter).is_empty());

        let native = Realizer::new(&layout, IsolationMode::Native);
        let plan = native.domain(&d1, &[]).unwrap();
        NativeIsolation::new().ensure_domain(&node, &plan).await.unwrap();

        assert!(node.rules(FirewallTable::Filter).is_empty());
        assert!(node.policy_rules().is_empty());
        let segment = node.link(&plan.segment.name).unwrap();
        assert_eq!(segment.master, plan.vrf);
        let vrf = node.link(&naming::vrf_device("d1")).unwrap();
        assert_eq!(vrf.alias.as_deref(), Some(plan.segment.alias.as_str()));
    }

    #[tokio::test]
    async fn test_fallback_removes_vrf_and_unenslaves() {
        let layout = LayoutConfig::default();
        let d1 = domain("d1", "10.1.0.0/16", 100);
        let node = SimulatedKernel::new();

        let native = Realizer::new(&layout, IsolationMode::Native);
        NativeIsolation::new()
            .ensure_domain(&node, &native.domain(&d1, &[]).unwrap())
            .await
            .unwrap();

        let fallback = Realizer::new(&layout, IsolationMode::Fallback);
        let plan = fallback.domain(&d1, &[]).unwrap();
        FallbackIsolation::new().ensure_domain(&node, &plan).await.unwrap();

        assert!(node.link(&naming::vrf_device("d1")).is_none());
        let segment = node.link(&plan.segment.name).unwrap();
        assert_eq!(segment.master, None);
        assert_eq!(segment.alias.as_deref(), Some(plan.segment.alias.as_str()));
    }

    #[tokio::test]
    async fn test_remove_domain() {
        let layout = LayoutConfig::default();
        let realizer = Realizer::new(&layout, IsolationMode::Fallback);
        let d1 = domain("d1", "10.1.0.0/16", 100);
        let d2 = domain("d2", "10.2.0.0/16", 200);
        let plan = realizer.domain(&d1, &[&d2]).unwrap();

        let node = SimulatedKernel::new();
        let strategy = FallbackIsolation::new();
        strategy.ensure_domain(&node, &plan).await.unwrap();

        let removal = DomainRemoval {
            id: "d1".into(),
            segment: naming::segment_device("d1"),
            vrf: naming::vrf_device("d1"),
            table: Some(plan.table),
        };
        assert_eq!(strategy.remove_domain(&node, &removal).await.unwrap(), Change::Applied);
        assert!(node.link_names().is_empty());
        assert!(node.policy_rules().is_empty());
        assert!(node.rules(FirewallTable::Filter).is_empty());
        assert_eq!(strategy.remove_domain(&node, &removal).await.unwrap(), Change::Unchanged);
    }
}
