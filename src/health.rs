//! Health Summary
//!
//! Per-scope health derived from each loop's last cycle report.

use serde::Serialize;

use crate::enforcer::EnforcementState;
use crate::reconciler::{CycleOutcome, CycleReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// No cycle has finished yet
    Unknown,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub state: HealthState,
    pub message: Option<String>,
}

impl ComponentHealth {
    /// Health of one scope
    pub fn from_report(scope: &str, report: Option<&CycleReport>) -> Self {
        let (state, message) = match report {
            None => (HealthState::Unknown, Some("no cycle completed yet".to_string())),
            Some(report) => assess(report),
        };
        Self {
            name: scope.to_string(),
            state,
            message,
        }
    }
}

fn assess(report: &CycleReport) -> (HealthState, Option<String>) {
    match &report.outcome {
        CycleOutcome::Abandoned { phase, reason } => (
            HealthState::Unhealthy,
            Some(format!("abandoned while {:?}: {}", phase, reason)),
        ),
        CycleOutcome::TimedOut => (
            HealthState::Unhealthy,
            Some(format!("cycle exceeded budget after {} ms", report.duration_ms)),
        ),
        CycleOutcome::Panicked { message } => {
            (HealthState::Unhealthy, Some(format!("cycle panicked: {}", message)))
        }
        CycleOutcome::Completed => {
            let failed = report.failed_actions();
            if failed > 0 {
                (
                    HealthState::Degraded,
                    Some(format!("{} of {} actions did not apply", failed, report.results.len())),
                )
            } else if !report.unknown.is_empty() {
                (
                    HealthState::Degraded,
                    Some(format!("unreadable: {}", report.unknown.join(", "))),
                )
            } else {
                (HealthState::Healthy, None)
            }
        }
    }
}

/// Health of the whole reconciler
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthState,
    pub enforcement: EnforcementState,
    pub scopes: Vec<ComponentHealth>,
}

impl HealthStatus {
    pub fn new(enforcement: EnforcementState, mut scopes: Vec<ComponentHealth>) -> Self {
        scopes.sort_by(|a, b| a.name.cmp(&b.name));
        let overall = scopes
            .iter()
            .map(|s| s.state)
            .max()
            .unwrap_or(HealthState::Unknown);
        Self {
            overall,
            enforcement,
            scopes,
        }
    }
}
