//! Fabric Reconciler - intent-driven VPC fabric control loop
//!
//! Keeps each fabric node's kernel networking state (overlay segments, VRFs,
//! gateway links, addresses, routes, policy and firewall rules) converged
//! with the desired state recorded in the intent store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        FABRIC RECONCILER                             │
//! │                                                                      │
//! │   ┌──────────────┐    ┌──────────────────────────────────────────┐   │
//! │   │ Intent Store │───▶│        RECONCILE LOOP (per scope)        │   │
//! │   └──────────────┘    │ Fetch ─▶ Discover ─▶ Diff ─▶ Enforce     │   │
//! │                       └───────────┬───────────────────┬──────────┘   │
//! │   ┌──────────────┐                │                   │              │
//! │   │  Capability  │──────▶ Native (VRF) | Fallback (policy + REJECT)  │
//! │   │    Probe     │                │                   │              │
//! │   └──────────────┘    ┌───────────▼───────────────────▼──────────┐   │
//! │                       │             KERNEL DRIVER                │   │
//! │                       │   ip -j (links/addrs/routes/rules)       │   │
//! │                       │   iptables -S (filter/nat)               │   │
//! │                       └──────────────────────────────────────────┘   │
//! │                                                                      │
//! │   Local API: /health  /status  /metrics  POST /scopes/:s/reconcile   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod capability;
pub mod config;
pub mod diff;
pub mod discovery;
pub mod enforcer;
pub mod health;
pub mod iproute;
pub mod isolation;
pub mod kernel;
pub mod metrics;
pub mod model;
pub mod naming;
pub mod realize;
pub mod reconciler;
pub mod sim;
pub mod store;

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub use capability::{Capability, CapabilityState};
pub use config::{DriverKind, ReconcilerConfig};
pub use diff::{diff, Action, ActionKind, ActionPlan};
pub use discovery::{Discoverer, ObservedState};
pub use enforcer::{ActionError, ActionOutcome, ActionResult, EnforcementState, Enforcer};
pub use health::{HealthState, HealthStatus};
pub use kernel::{KernelDriver, KernelError};
pub use metrics::{MetricsSink, ReconcilerMetrics};
pub use model::DesiredState;
pub use reconciler::{CycleOutcome, CycleReport, LoopHandle, LoopPhase, ReconcileLoop};
pub use store::{IntentStore, StoreError};

use capability::KernelProber;
use iproute::IpRouteDriver;
use reconciler::LoopSettings;
use sim::SimulatedKernel;
use store::JsonFileStore;

/// Reconciler error types
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("intent store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("partial discovery: {0}")]
    DiscoveryPartial(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, FabricError>;

/// One reconcile loop per scope, sharing a capability and a metrics registry
pub struct FabricController {
    config: ReconcilerConfig,
    capability: Arc<CapabilityState>,
    metrics: Arc<ReconcilerMetrics>,
    loops: DashMap<String, Arc<ReconcileLoop>>,
}

impl FabricController {
    /// Build drivers, store and loops from configuration
    pub fn from_config(config: ReconcilerConfig) -> Result<Self> {
        if config.scopes.is_empty() {
            return Err(FabricError::Config("no scopes configured".into()));
        }

        let kernels: Vec<(String, Arc<dyn KernelDriver>)> = match config.driver {
            DriverKind::Iproute => {
                // Kernel objects carry no scope, so one host serves one scope
                if config.scopes.len() > 1 {
                    return Err(FabricError::Config(format!(
                        "iproute driver serves a single scope, {} configured",
                        config.scopes.len()
                    )));
                }
                let driver: Arc<dyn KernelDriver> =
                    Arc::new(IpRouteDriver::new(config.commands.clone()));
                vec![(config.scopes[0].clone(), driver)]
            }
            DriverKind::Simulated => config
                .scopes
                .iter()
                .map(|scope| {
                    let node: Arc<dyn KernelDriver> = Arc::new(SimulatedKernel::new());
                    (scope.clone(), node)
                })
                .collect(),
        };

        let probe_kernel = kernels[0].1.clone();
        let prober = KernelProber::new(probe_kernel, config.probe.device.clone(), config.probe.table);
        let capability = Arc::new(CapabilityState::new(Arc::new(prober)));
        let store: Arc<dyn IntentStore> = Arc::new(JsonFileStore::new(&config.store_dir));

        Ok(Self::with_parts(config, store, kernels, capability))
    }

    /// Assemble from explicit parts
    pub fn with_parts(
        config: ReconcilerConfig,
        store: Arc<dyn IntentStore>,
        kernels: Vec<(String, Arc<dyn KernelDriver>)>,
        capability: Arc<CapabilityState>,
    ) -> Self {
        let metrics = Arc::new(ReconcilerMetrics::new());
        let settings = LoopSettings::from_config(&config);
        let loops = DashMap::new();
        for (scope, kernel) in kernels {
            let reconcile_loop = ReconcileLoop::new(
                scope.clone(),
                store.clone(),
                kernel,
                capability.clone(),
                metrics.clone(),
                settings.clone(),
            );
            loops.insert(scope, Arc::new(reconcile_loop));
        }

        Self {
            config,
            capability,
            metrics,
            loops,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ReconcilerMetrics {
        &self.metrics
    }

    pub fn enforcement(&self) -> EnforcementState {
        EnforcementState::from_capability(self.capability.get())
    }

    /// Configured scopes, sorted
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.loops.iter().map(|e| e.key().clone()).collect();
        scopes.sort();
        scopes
    }

    pub fn handle(&self, scope: &str) -> Option<LoopHandle> {
        self.loops.get(scope).map(|l| l.handle())
    }

    /// Request a cycle for `scope`; false when the scope is not served here
    pub fn trigger(&self, scope: &str) -> bool {
        match self.handle(scope) {
            Some(handle) => {
                handle.trigger();
                true
            }
            None => false,
        }
    }

    /// Run one cycle of `scope` right away
    pub async fn reconcile_now(&self, scope: &str) -> Result<CycleReport> {
        let reconcile_loop = self
            .loops
            .get(scope)
            .map(|l| l.value().clone())
            .ok_or_else(|| FabricError::Config(format!("unknown scope {}", scope)))?;
        let report = reconcile_loop.run_cycle().await;

        if let CycleOutcome::Abandoned {
            phase: LoopPhase::FetchingDesired,
            reason,
        } = &report.outcome
        {
            return Err(FabricError::StoreUnavailable(reason.clone()));
        }
        if !report.unknown.is_empty() {
            let partial = FabricError::DiscoveryPartial(report.unknown.join(", "));
            warn!(scope = scope, error = %partial, "Cycle ran on partial state");
        }
        Ok(report)
    }

    /// Last report of every scope that has finished a cycle
    pub fn reports(&self) -> Vec<CycleReport> {
        let mut reports: Vec<CycleReport> = self
            .loops
            .iter()
            .filter_map(|e| e.value().last_report())
            .collect();
        reports.sort_by(|a, b| a.scope.cmp(&b.scope));
        reports
    }

    pub fn health(&self) -> HealthStatus {
        let scopes = self
            .loops
            .iter()
            .map(|e| health::ComponentHealth::from_report(e.key(), e.value().last_report().as_ref()))
            .collect();
        HealthStatus::new(self.enforcement(), scopes)
    }

    /// Run every loop and the local API until interrupted
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(scopes = ?self.scopes(), driver = ?self.config.driver, "Starting fabric reconciler");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut loops = JoinSet::new();
        for entry in self.loops.iter() {
            loops.spawn(entry.value().clone().run(shutdown_rx.clone()));
        }

        let api = if self.config.api.enabled {
            let controller = self.clone();
            let listen = self.config.api.listen.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = api::serve(controller, &listen).await {
                    error!(error = %e, "Local API stopped");
                }
            }))
        } else {
            None
        };

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
        if let Some(api) = api {
            api.abort();
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Reconcile loop task failed");
            }
        }
        Ok(())
    }
}
