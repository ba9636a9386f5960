//! Reconciliation Loop
//!
//! One loop per scope: fetch desired state, discover the node, diff, enforce.
//! Cycles are woken by an interval timer with jitter or by an explicit
//! trigger; triggers that land mid-cycle coalesce into a single rerun.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capability::CapabilityState;
use crate::config::{LayoutConfig, ReconcilerConfig};
use crate::diff::{diff, Payload};
use crate::discovery::Discoverer;
use crate::enforcer::{ActionResult, EnforcementState, Enforcer, Journal};
use crate::kernel::KernelDriver;
use crate::metrics::MetricsSink;
use crate::model::IsolationMode;
use crate::realize::Realizer;
use crate::store::IntentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    FetchingDesired,
    Discovering,
    Diffing,
    Enforcing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Ran to the end; individual actions may still have failed
    Completed,
    /// Stopped before enforcing anything
    Abandoned { phase: LoopPhase, reason: String },
    /// Cycle budget expired; remaining enforcement aborted
    TimedOut,
    Panicked { message: String },
}

/// Result of one reconciliation cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: CycleOutcome,
    pub enforcement: EnforcementState,
    /// Actions the diff produced
    pub drift: usize,
    pub active_domains: usize,
    /// Links and resource kinds discovery could not read
    pub unknown: Vec<String>,
    pub results: Vec<ActionResult>,
}

impl CycleReport {
    fn new(scope: &str) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            scope: scope.to_string(),
            started_at: Utc::now(),
            duration_ms: 0,
            outcome: CycleOutcome::Completed,
            enforcement: EnforcementState::Probing,
            drift: 0,
            active_domains: 0,
            unknown: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CycleOutcome::Completed && self.failed_actions() == 0
    }

    pub fn failed_actions(&self) -> usize {
        self.results.iter().filter(|r| !r.outcome.is_success()).count()
    }

    pub fn count(&self, outcome: &str) -> usize {
        self.results.iter().filter(|r| r.outcome.name() == outcome).count()
    }
}

/// Timing and layout shared by every loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    pub jitter: Duration,
    pub cycle_budget: Duration,
    pub parallel_chains: bool,
    pub layout: LayoutConfig,
}

impl LoopSettings {
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self {
            interval: config.interval(),
            jitter: config.jitter(),
            cycle_budget: config.cycle_budget(),
            parallel_chains: config.parallel_chains,
            layout: config.layout.clone(),
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&ReconcilerConfig::default())
    }
}

pub struct ReconcileLoop {
    scope: String,
    store: Arc<dyn IntentStore>,
    kernel: Arc<dyn KernelDriver>,
    capability: Arc<CapabilityState>,
    metrics: Arc<dyn MetricsSink>,
    settings: LoopSettings,
    enforcer: OnceCell<Enforcer>,
    /// Held for a whole cycle, by the task running it
    cycle_lock: Arc<tokio::sync::Mutex<()>>,
    trigger: Notify,
    phase: RwLock<LoopPhase>,
    last_report: RwLock<Option<CycleReport>>,
}

impl ReconcileLoop {
    pub fn new(
        scope: impl Into<String>,
        store: Arc<dyn IntentStore>,
        kernel: Arc<dyn KernelDriver>,
        capability: Arc<CapabilityState>,
        metrics: Arc<dyn MetricsSink>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            scope: scope.into(),
            store,
            kernel,
            capability,
            metrics,
            settings,
            enforcer: OnceCell::new(),
            cycle_lock: Arc::new(tokio::sync::Mutex::new(())),
            trigger: Notify::new(),
            phase: RwLock::new(LoopPhase::Idle),
            last_report: RwLock::new(None),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn phase(&self) -> LoopPhase {
        *self.phase.read()
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().clone()
    }

    pub fn handle(self: &Arc<Self>) -> LoopHandle {
        LoopHandle { inner: self.clone() }
    }

    fn set_phase(&self, phase: LoopPhase) {
        debug!(scope = %self.scope, phase = ?phase, "Phase");
        *self.phase.write() = phase;
    }

    /// Run the loop until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(scope = %self.scope, interval_secs = self.settings.interval.as_secs(), "Reconcile loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;

            let jitter_ms = self.settings.jitter.as_millis() as u64;
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval + jitter) => {}
                _ = self.trigger.notified() => {
                    debug!(scope = %self.scope, "Triggered");
                }
                _ = shutdown.changed() => {}
            }
        }
        info!(scope = %self.scope, "Reconcile loop stopped");
    }

    /// Run one cycle now, waiting for any cycle in progress.
    ///
    /// The cycle runs detached and owns the scope lock, so dropping the
    /// returned future does not let another cycle start alongside it.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let guard = self.cycle_lock.clone().lock_owned().await;
        let this = self.clone();
        let supervisor = tokio::spawn(async move {
            let report = this.supervise().await;
            drop(guard);
            report
        });
        match supervisor.await {
            Ok(report) => report,
            Err(e) => {
                error!(scope = %self.scope, error = %e, "Cycle supervisor failed");
                let mut report = CycleReport::new(&self.scope);
                report.outcome = CycleOutcome::Panicked {
                    message: e.to_string(),
                };
                report
            }
        }
    }

    async fn supervise(self: &Arc<Self>) -> CycleReport {
        let started = Instant::now();
        let report = Arc::new(Mutex::new(CycleReport::new(&self.scope)));
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let this = self.clone();
            let report = report.clone();
            let journal = journal.clone();
            tokio::spawn(async move {
                let deadline = tokio::time::Instant::now() + this.settings.cycle_budget;
                match tokio::time::timeout_at(deadline, this.cycle(&report, &journal)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            scope = %this.scope,
                            budget_ms = this.settings.cycle_budget.as_millis() as u64,
                            drift = "timeout",
                            "Cycle budget expired, remaining enforcement aborted"
                        );
                        CycleOutcome::TimedOut
                    }
                }
            })
        };

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(scope = %self.scope, panic = %message, "Cycle panicked");
                CycleOutcome::Panicked { message }
            }
            Err(e) => CycleOutcome::Panicked {
                message: e.to_string(),
            },
        };
        self.set_phase(LoopPhase::Idle);

        let mut report = report.lock().clone();
        report.outcome = outcome;
        report.results = journal.lock().clone();
        report.duration_ms = started.elapsed().as_millis() as u64;
        self.finish(&report);
        *self.last_report.write() = Some(report.clone());
        report
    }

    async fn cycle(&self, report: &Mutex<CycleReport>, journal: &Journal) -> CycleOutcome {
        let capability = self.capability.resolve().await;
        let mode = capability.isolation_mode();
        report.lock().enforcement = EnforcementState::from_capability(Some(capability));

        self.set_phase(LoopPhase::FetchingDesired);
        let desired = match self.store.fetch(&self.scope).await {
            Ok(desired) => desired,
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "Desired state unavailable, skipping cycle");
                return CycleOutcome::Abandoned {
                    phase: LoopPhase::FetchingDesired,
                    reason: e.to_string(),
                };
            }
        };
        for domain in &desired.domains {
            if domain.isolation != IsolationMode::Unset && domain.isolation != mode {
                warn!(
                    scope = %self.scope,
                    domain = %domain.id,
                    declared = %domain.isolation,
                    host = %mode,
                    "Declared isolation mode differs from host capability"
                );
            }
        }
        let desired = desired.with_isolation(mode);

        self.set_phase(LoopPhase::Discovering);
        let discoverer = Discoverer::new(self.kernel.clone(), self.settings.layout.clone());
        let observed = match discoverer.discover(&self.scope).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "Discovery failed, skipping cycle");
                return CycleOutcome::Abandoned {
                    phase: LoopPhase::Discovering,
                    reason: e.to_string(),
                };
            }
        };
        {
            let mut report = report.lock();
            report.unknown = observed
                .unknown
                .links
                .iter()
                .map(|l| format!("link/{}", l))
                .chain(observed.unknown.kinds.iter().map(|k| format!("kind/{}", k)))
                .collect();
            report.active_domains = observed.active_isolation_count();
        }

        self.set_phase(LoopPhase::Diffing);
        let realizer = Realizer::new(&self.settings.layout, mode);
        let plan = diff(&desired, &observed, &realizer);
        let invalid = plan
            .iter()
            .filter(|a| matches!(a.payload, Payload::Invalid(_)))
            .count();
        report.lock().drift = plan.len();
        if !plan.is_empty() {
            info!(
                scope = %self.scope,
                actions = plan.len(),
                invalid = invalid,
                isolation = %realizer.mode(),
                "Drift detected"
            );
        }

        self.set_phase(LoopPhase::Enforcing);
        let enforcer = self
            .enforcer
            .get_or_init(|| async {
                Enforcer::for_capability(self.kernel.clone(), capability, self.settings.parallel_chains)
            })
            .await;
        if enforcer.mode() != realizer.mode() {
            warn!(
                scope = %self.scope,
                enforcer = %enforcer.mode(),
                plan = %realizer.mode(),
                "Enforcer isolation differs from planned isolation"
            );
        }
        let drifted = !plan.is_empty();
        enforcer.apply_plan_into(plan, journal.clone()).await;

        if drifted {
            match discoverer.discover(&self.scope).await {
                Ok(after) => report.lock().active_domains = after.active_isolation_count(),
                Err(e) => debug!(scope = %self.scope, error = %e, "Post-enforcement discovery failed"),
            }
        }
        CycleOutcome::Completed
    }

    fn finish(&self, report: &CycleReport) {
        let success = report.outcome == CycleOutcome::Completed;
        self.metrics
            .record_cycle(&self.scope, Duration::from_millis(report.duration_ms), success);
        if report.drift > 0 {
            self.metrics.record_drift(&self.scope, report.drift as u64);
        }
        if report.outcome == CycleOutcome::TimedOut {
            self.metrics.record_drift(&self.scope, 1);
        }
        self.metrics
            .set_active_domains(&self.scope, report.active_domains as u64);
        for result in &report.results {
            self.metrics.record_action(&result.label, result.outcome.name());
        }

        info!(
            scope = %self.scope,
            cycle_id = %report.cycle_id,
            duration_ms = report.duration_ms,
            drift = report.drift,
            applied = report.count("applied"),
            failed = report.failed_actions(),
            active_domains = report.active_domains,
            outcome = ?report.outcome,
            "Cycle finished"
        );
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Cheap handle for triggering and inspecting a loop
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<ReconcileLoop>,
}

impl LoopHandle {
    /// Request a cycle; requests made while one runs coalesce into one rerun
    pub fn trigger(&self) {
        self.inner.trigger.notify_one();
    }

    pub fn scope(&self) -> &str {
        self.inner.scope()
    }

    pub fn phase(&self) -> LoopPhase {
        self.inner.phase()
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.inner.last_report()
    }
}
